//! Kolibri wire protocol: ports, magic bytes, size limits and control commands.

use std::time::Duration;

/// TCP port of the control channel (handshake + commands).
pub const CONTROL_PORT: u16 = 19810;
/// TCP port of the data channel; only bound while a session is connected.
pub const FILE_PORT: u16 = 19811;

/// Magic prefix of the handshake frame, sent by both sides.
pub const HANDSHAKE_MAGIC: [u8; 3] = [0x11, 0x45, 0x14];
/// Device names travel behind a single length byte.
pub const MAX_DEVICE_NAME_LEN: usize = u8::MAX as usize;

/// Longest chat message in UTF-8 bytes. Longer outbound messages are dropped locally.
pub const MAX_CHAT_LEN: usize = 1024;
/// Size of the per-handler buffer; file bodies are streamed in blocks of this size.
pub const FILE_BLOCK_SIZE: usize = 4 * 1024;
/// File header: `[u32 BE name length][name][u64 BE size]`. The whole header must fit one block.
pub const FILE_NAME_LEN_SIZE: usize = 4;
pub const FILE_SIZE_SIZE: usize = 8;
pub const MAX_FILE_NAME_LEN: usize = FILE_BLOCK_SIZE - FILE_NAME_LEN_SIZE - FILE_SIZE_SIZE;

pub const CMD_CHAT: u8 = 0x03;
pub const CMD_VIBRATE: u8 = 0x04;

/// Pause between tearing a session down and listening again, so the OS releases the ports.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Reachability probe before an active connect: attempts, spacing and per-attempt timeout.
pub const PROBE_ATTEMPTS: u32 = 5;
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Commands carried by the control channel once a session is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Vibrate,
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Chat(_) => CMD_CHAT,
            Command::Vibrate => CMD_VIBRATE,
        }
    }

    /// Whether this command fits the wire limits. Oversized chats are a local policy drop.
    pub fn is_sendable(&self) -> bool {
        match self {
            Command::Chat(text) => text.len() <= MAX_CHAT_LEN,
            Command::Vibrate => true,
        }
    }
}

/// Truncate `name` to at most [`MAX_DEVICE_NAME_LEN`] bytes on a char boundary.
pub fn clamp_device_name(name: &str) -> &str {
    if name.len() <= MAX_DEVICE_NAME_LEN {
        return name;
    }
    let mut end = MAX_DEVICE_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_limit_is_inclusive() {
        assert!(Command::Chat("a".repeat(MAX_CHAT_LEN)).is_sendable());
        assert!(!Command::Chat("a".repeat(MAX_CHAT_LEN + 1)).is_sendable());
        assert!(Command::Vibrate.is_sendable());
    }

    #[test]
    fn chat_limit_counts_bytes() {
        // 342 * 3 bytes = 1026
        let text = "你".repeat(342);
        assert!(!Command::Chat(text).is_sendable());
    }

    #[test]
    fn clamp_keeps_short_names() {
        assert_eq!(clamp_device_name("pixel"), "pixel");
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        let name = "é".repeat(200); // 400 bytes
        let clamped = clamp_device_name(&name);
        assert!(clamped.len() <= MAX_DEVICE_NAME_LEN);
        assert_eq!(clamped.len(), 254);
        assert!(clamped.chars().all(|c| c == 'é'));
    }
}
