//! Kolibri peer link: protocol core.
//! Host-driven: no network I/O; the platform crate owns sockets and threads and calls in here.

pub mod events;
pub mod protocol;
pub mod session;
pub mod store;
pub mod tracker;
pub mod wire;

pub use events::{EventSink, NoopSink};
pub use protocol::{Command, CONTROL_PORT, FILE_BLOCK_SIZE, FILE_PORT, MAX_CHAT_LEN};
pub use session::{Epoch, Session, SessionState};
pub use store::{
    ChatRecord, ChatStore, Direction, FileRecord, FileStore, MemoryChatStore, MemoryFileStore,
    TaskStatus,
};
pub use tracker::TransferTracker;
pub use wire::{
    decode_command, decode_handshake, encode_command, encode_handshake, CommandDecodeError,
    HandshakeError, InboundFrame,
};
