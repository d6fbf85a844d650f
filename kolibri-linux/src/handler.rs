//! File channel handlers. Each handler is a phase machine over one TCP stream and one
//! local file, driven by socket readiness on the transfer reactor.
//!
//! Wire format: `[u32 BE name length][name][u64 BE size][raw body]`, one file per connection.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use kolibri_core::protocol::{FILE_BLOCK_SIZE, FILE_NAME_LEN_SIZE, FILE_SIZE_SIZE};
use kolibri_core::wire::{decode_file_name_len, decode_file_size, encode_file_header, FileHeaderError};
use kolibri_core::{Direction, TransferTracker};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::file::LocalFile;

/// How a handler ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("bad file header: {0}")]
    Protocol(#[from] FileHeaderError),
    #[error("stream ended with {remaining} bytes outstanding")]
    PrematureEof { remaining: u64 },
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    Connecting,
    Header,
    Body,
    Done,
}

/// Streams one local file to the peer's file port.
pub struct SendHandler {
    phase: SendPhase,
    peer: SocketAddr,
    file: Box<dyn LocalFile>,
    tracker: TransferTracker,
    buf: Box<[u8]>,
    /// Bytes staged in `buf` for the current frame.
    len: usize,
    /// Bytes of the staged frame already written.
    sent: usize,
}

impl SendHandler {
    pub fn new(file: Box<dyn LocalFile>, tracker: TransferTracker, peer: SocketAddr) -> Self {
        Self {
            phase: SendPhase::Connecting,
            peer,
            file,
            tracker,
            buf: vec![0u8; FILE_BLOCK_SIZE].into_boxed_slice(),
            len: 0,
            sent: 0,
        }
    }

    /// Called once the reactor takes the handler: the outbound task record appears here.
    pub fn register(&mut self) {
        self.tracker
            .start(self.file.name(), None, self.file.size(), Direction::Outbound);
    }

    pub fn tracker(&self) -> &TransferTracker {
        &self.tracker
    }

    pub async fn run(mut self) -> Outcome {
        let result = self.drive().await;
        self.settle(result)
    }

    async fn drive(&mut self) -> Result<(), TransferError> {
        let stream = TcpStream::connect(self.peer).await?;
        debug!(peer = %self.peer, name = self.file.name(), "file channel connected");
        self.stage_header()?;
        self.phase = SendPhase::Header;
        while self.phase != SendPhase::Done {
            stream.writable().await?;
            self.on_writable(&stream)?;
            // at most one frame per turn on the reactor
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Write as much of the staged frame as the socket takes. Once it is flushed, the
    /// next frame is staged and control returns to the reactor.
    fn on_writable(&mut self, stream: &TcpStream) -> Result<(), TransferError> {
        while self.sent < self.len {
            match stream.try_write(&self.buf[self.sent..self.len]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        match self.phase {
            SendPhase::Header => self.phase = SendPhase::Body,
            SendPhase::Body => {
                if self.tracker.proceed(self.len as u64) {
                    self.phase = SendPhase::Done;
                    return Ok(());
                }
            }
            SendPhase::Connecting | SendPhase::Done => return Ok(()),
        }
        self.stage_block()
    }

    fn stage_header(&mut self) -> Result<(), TransferError> {
        let header = encode_file_header(self.file.name(), self.file.size())?;
        self.buf[..header.len()].copy_from_slice(&header);
        self.len = header.len();
        self.sent = 0;
        Ok(())
    }

    /// Fill the next body block from the local file. Zero-length once nothing remains.
    fn stage_block(&mut self) -> Result<(), TransferError> {
        let want = self.tracker.remaining().min(FILE_BLOCK_SIZE as u64) as usize;
        let mut filled = 0;
        while filled < want {
            match self.file.read(&mut self.buf[filled..want]) {
                Ok(0) => {
                    return Err(TransferError::PrematureEof {
                        remaining: self.tracker.remaining() - filled as u64,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.len = want;
        self.sent = 0;
        Ok(())
    }

    fn settle(&mut self, result: Result<(), TransferError>) -> Outcome {
        match result {
            Ok(()) => {
                self.tracker.finish(true);
                info!(name = self.file.name(), size = self.file.size(), "file sent");
                Outcome::Completed
            }
            Err(e) => {
                warn!(name = self.file.name(), error = %e, "file send failed");
                self.tracker.finish(false);
                Outcome::Failed
            }
        }
    }
}

impl Drop for SendHandler {
    fn drop(&mut self) {
        // aborted mid-flight or never registered
        self.tracker.finish(false);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceivePhase {
    FileNameLen,
    FileName,
    FileSize,
    Body,
}

/// Receives one file from an accepted file-port connection into `base_dir`.
pub struct ReceiveHandler {
    phase: ReceivePhase,
    stream: TcpStream,
    tracker: TransferTracker,
    base_dir: PathBuf,
    buf: Box<[u8]>,
    /// Bytes collected for the current phase.
    filled: usize,
    /// Bytes the current phase needs before it can advance.
    target: usize,
    name: Option<String>,
    dest: Option<File>,
}

impl ReceiveHandler {
    pub fn new(stream: TcpStream, tracker: TransferTracker, base_dir: PathBuf) -> Self {
        Self {
            phase: ReceivePhase::FileNameLen,
            stream,
            tracker,
            base_dir,
            buf: vec![0u8; FILE_BLOCK_SIZE].into_boxed_slice(),
            filled: 0,
            target: FILE_NAME_LEN_SIZE,
            name: None,
            dest: None,
        }
    }

    pub async fn run(mut self) -> Outcome {
        let result = self.drive().await;
        let name = self.name.take().unwrap_or_default();
        match result {
            Ok(()) => {
                drop(self.dest.take());
                self.tracker.finish(true);
                info!(name = %name, size = self.tracker.size(), "file received");
                Outcome::Completed
            }
            Err(e) => {
                warn!(name = %name, error = %e, "file receive failed");
                self.tracker.finish(false);
                Outcome::Failed
            }
        }
    }

    async fn drive(&mut self) -> Result<(), TransferError> {
        loop {
            if self.filled == self.target {
                if self.advance()? {
                    return Ok(());
                }
                if self.phase == ReceivePhase::Body {
                    tokio::task::yield_now().await;
                }
                continue;
            }
            self.stream.readable().await?;
            self.on_readable()?;
        }
    }

    fn on_readable(&mut self) -> Result<(), TransferError> {
        match self.stream.try_read(&mut self.buf[self.filled..self.target]) {
            Ok(0) => Err(TransferError::PrematureEof {
                remaining: self.outstanding(),
            }),
            Ok(n) => {
                self.filled += n;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Consume the filled phase buffer. Returns true once the body is complete.
    fn advance(&mut self) -> Result<bool, TransferError> {
        match self.phase {
            ReceivePhase::FileNameLen => {
                let len = decode_file_name_len(array(&self.buf))?;
                self.enter(ReceivePhase::FileName, len);
            }
            ReceivePhase::FileName => {
                let raw = String::from_utf8_lossy(&self.buf[..self.target]).into_owned();
                let name = sanitize_file_name(&raw)?;
                self.name = Some(name.to_owned());
                self.enter(ReceivePhase::FileSize, FILE_SIZE_SIZE);
            }
            ReceivePhase::FileSize => {
                let size = decode_file_size(array(&self.buf));
                self.open_destination(size)?;
                self.enter(ReceivePhase::Body, block_len(size));
            }
            ReceivePhase::Body => {
                if let Some(dest) = self.dest.as_mut() {
                    dest.write_all(&self.buf[..self.target])?;
                }
                if self.tracker.proceed(self.target as u64) {
                    if let Some(dest) = self.dest.as_mut() {
                        dest.flush()?;
                    }
                    return Ok(true);
                }
                self.enter(ReceivePhase::Body, block_len(self.tracker.remaining()));
            }
        }
        Ok(false)
    }

    fn open_destination(&mut self, size: u64) -> Result<(), TransferError> {
        let name = self.name.as_deref().unwrap_or_default();
        std::fs::create_dir_all(&self.base_dir)?;
        let path = unique_destination(&self.base_dir, name);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let stored = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(name)
            .to_owned();
        debug!(path = %path.display(), size, "receiving file");
        self.tracker
            .start(&stored, Some(self.base_dir.clone()), size, Direction::Inbound);
        self.name = Some(stored);
        self.dest = Some(file);
        Ok(())
    }

    fn enter(&mut self, phase: ReceivePhase, target: usize) {
        self.phase = phase;
        self.filled = 0;
        self.target = target;
    }

    fn outstanding(&self) -> u64 {
        match self.phase {
            ReceivePhase::Body => self.tracker.remaining() - self.filled as u64,
            _ => (self.target - self.filled) as u64,
        }
    }
}

impl Drop for ReceiveHandler {
    fn drop(&mut self) {
        self.tracker.finish(false);
    }
}

fn block_len(remaining: u64) -> usize {
    remaining.min(FILE_BLOCK_SIZE as u64) as usize
}

fn array<const N: usize>(buf: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[..N]);
    out
}

/// Keep only the final path component of a peer-supplied name.
pub fn sanitize_file_name(raw: &str) -> Result<&str, TransferError> {
    let last = raw.rsplit(&['/', '\\'][..]).next().unwrap_or_default();
    if last.is_empty() || last == "." || last == ".." || last.contains('\0') {
        return Err(TransferError::InvalidFileName(raw.to_owned()));
    }
    Ok(last)
}

/// First free path for `name` in `dir`, prefixing `_` until nothing exists there.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let mut candidate = name.to_owned();
    let mut path = dir.join(&candidate);
    while path.exists() {
        candidate.insert(0, '_');
        path = dir.join(&candidate);
    }
    path
}
