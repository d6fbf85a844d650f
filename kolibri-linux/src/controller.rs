//! Control session: owns the session state machine, the control socket and its workers,
//! and the transfer mux. One peer at a time.
//!
//! Every worker task is spawned with the [`Epoch`] current at the time and re-checks it under
//! the session lock before touching state or firing callbacks. Teardown bumps the epoch,
//! aborts the workers, stops the mux and schedules a return to `Standby`.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use kolibri_core::protocol::{PROBE_ATTEMPTS, PROBE_INTERVAL, PROBE_TIMEOUT};
use kolibri_core::wire::CommandEncodeError;
use kolibri_core::{
    decode_command, decode_handshake, encode_command, encode_handshake, ChatRecord, ChatStore,
    Command, CommandDecodeError, Epoch, EventSink, FileStore, HandshakeError, InboundFrame,
    Session, SessionState,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::file::LocalFile;
use crate::mux::{Stopping, TransferMux};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("command: {0}")]
    Command(#[from] CommandDecodeError),
    #[error("peer {target} unreachable after {attempts} attempts")]
    Unreachable { target: SocketAddr, attempts: u32 },
    #[error("peer closed the control channel")]
    Closed,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    bind_addr: IpAddr,
    control_port: u16,
    peer_control_port: u16,
    settle_delay: Duration,
    device_name: StdMutex<String>,
    shared: Mutex<Shared>,
    commands: CommandQueue,
    mux: TransferMux,
    chats: Arc<dyn ChatStore>,
    events: Arc<dyn EventSink>,
}

struct Shared {
    session: Session,
    /// Listening worker of the current `Standby`; aborted when an active connect starts.
    passive: Option<AbortHandle>,
    /// Every other task of the current epoch.
    workers: Vec<AbortHandle>,
    /// Cleared by [`Controller::shutdown`]; nothing re-arms afterwards.
    running: bool,
}

/// FIFO of outbound commands, drained by the sender worker of the connected session.
#[derive(Default)]
struct CommandQueue {
    queue: StdMutex<VecDeque<Command>>,
    ready: Notify,
}

impl CommandQueue {
    fn push(&self, cmd: Command) {
        self.lock().push_back(cmd);
        self.ready.notify_one();
    }

    async fn pop(&self) -> Command {
        loop {
            let next = self.lock().pop_front();
            if let Some(cmd) = next {
                return cmd;
            }
            self.ready.notified().await;
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> StdMutexGuard<'_, VecDeque<Command>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Controller {
    pub fn new(
        config: &Config,
        chats: Arc<dyn ChatStore>,
        files: Arc<dyn FileStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let mux = TransferMux::new(config.mux_config(), files, events.clone());
        Self {
            inner: Arc::new(Inner {
                bind_addr: config.bind_addr,
                control_port: config.control_port,
                peer_control_port: config.peer_control_port(),
                settle_delay: config.settle_delay(),
                device_name: StdMutex::new(config.device_name.clone()),
                shared: Mutex::new(Shared {
                    session: Session::new(),
                    passive: None,
                    workers: Vec::new(),
                    running: true,
                }),
                commands: CommandQueue::default(),
                mux,
                chats,
                events,
            }),
        }
    }

    /// `Stopped → Standby`: listen for one inbound control connection.
    pub async fn start_listening(&self) {
        self.inner.start_listening().await;
    }

    /// `Standby → Connecting`: dial `addr` on the peer control port.
    pub async fn connect(&self, addr: IpAddr) {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().await;
        let Some(epoch) = shared.session.begin_connect() else {
            debug!(state = %shared.session.state(), "connect ignored");
            return;
        };
        inner.notify_state(SessionState::Connecting, epoch);
        if let Some(passive) = shared.passive.take() {
            passive.abort();
        }
        let target = SocketAddr::new(addr, inner.peer_control_port);
        let task = tokio::spawn(inner.clone().run_active(epoch, target));
        shared.workers.push(task.abort_handle());
    }

    /// Tear the session down; it re-arms to `Standby` after the settle delay.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().await;
        if let Some(stopping) = inner.teardown(&mut shared) {
            inner.rearm_later(stopping, shared.session.epoch());
        }
    }

    /// Final teardown: stop without re-arming and wait for the file port to be released.
    pub async fn shutdown(&self) {
        let stopping = {
            let mut shared = self.inner.shared.lock().await;
            shared.running = false;
            self.inner.teardown(&mut shared)
        };
        if let Some(stopping) = stopping {
            stopping.wait().await;
        }
        info!("controller shut down");
    }

    /// Queue a chat message. Messages over the wire limit are dropped when their turn comes.
    pub fn send_chat(&self, text: impl Into<String>) {
        self.inner.commands.push(Command::Chat(text.into()));
    }

    pub fn send_vibrate(&self) {
        self.inner.commands.push(Command::Vibrate);
    }

    /// Hand a file to the transfer mux. False (file dropped) unless a session is connected.
    pub fn send_file(&self, file: Box<dyn LocalFile>) -> bool {
        self.inner.mux.send_file(file)
    }

    /// Name sent in future handshakes.
    pub fn set_device_name(&self, name: impl Into<String>) {
        *self.inner.device_name() = name.into();
    }

    pub fn device_name(&self) -> String {
        self.inner.device_name().clone()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.shared.lock().await.session.state()
    }

    pub async fn epoch(&self) -> Epoch {
        self.inner.shared.lock().await.session.epoch()
    }

    pub async fn peer_name(&self) -> Option<String> {
        self.inner
            .shared
            .lock()
            .await
            .session
            .peer_name()
            .map(str::to_owned)
    }

    pub async fn peer_addr(&self) -> Option<IpAddr> {
        self.inner.shared.lock().await.session.peer_addr()
    }
}

impl Inner {
    async fn start_listening(self: &Arc<Self>) {
        let mut shared = self.shared.lock().await;
        self.listen(&mut shared);
    }

    /// Re-arm scheduled by the teardown that stopped `epoch`. Skipped once a later teardown
    /// has moved the epoch on, so its own settle delay is honoured.
    async fn rearm(self: &Arc<Self>, epoch: Epoch) {
        let mut shared = self.shared.lock().await;
        if !shared.session.is_current(epoch) {
            debug!(%epoch, "stale re-arm skipped");
            return;
        }
        self.listen(&mut shared);
    }

    fn listen(self: &Arc<Self>, shared: &mut Shared) {
        if !shared.running {
            return;
        }
        let Some(epoch) = shared.session.start_listening() else {
            return;
        };
        self.notify_state(SessionState::Standby, epoch);
        let task = tokio::spawn(self.clone().run_passive(epoch));
        shared.passive = Some(task.abort_handle());
    }

    async fn run_passive(self: Arc<Self>, epoch: Epoch) {
        let listener = {
            let mut shared = self.shared.lock().await;
            if !shared.session.is_listening(epoch) {
                return;
            }
            match TcpListener::bind((self.bind_addr, self.control_port)).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(port = self.control_port, error = %e, "control listener bind failed");
                    self.fail(&mut shared);
                    return;
                }
            }
        };
        debug!(addr = ?listener.local_addr().ok(), %epoch, "listening for control connection");

        let accepted = listener.accept().await;
        let stream = {
            let mut shared = self.shared.lock().await;
            match accepted {
                Ok((stream, remote)) => {
                    if !shared.session.accepted(epoch) {
                        debug!(%remote, "stale accept dropped");
                        return;
                    }
                    info!(%remote, "control connection accepted");
                    self.notify_state(SessionState::Handshaking, epoch);
                    stream
                }
                Err(e) => {
                    if shared.session.is_listening(epoch) {
                        warn!(error = %e, "control accept failed");
                        self.fail(&mut shared);
                    }
                    return;
                }
            }
        };
        drop(listener);
        self.run_control(stream, epoch).await;
    }

    async fn run_active(self: Arc<Self>, epoch: Epoch, target: SocketAddr) {
        let stream = match self.probe_connect(epoch, target).await {
            Ok(Some(stream)) => stream,
            Ok(None) => return,
            Err(e) => {
                let mut shared = self.shared.lock().await;
                if shared.session.is_current(epoch) {
                    warn!(error = %e, "connect failed");
                    self.fail(&mut shared);
                }
                return;
            }
        };
        {
            let mut shared = self.shared.lock().await;
            if !shared.session.connected(epoch) {
                return;
            }
            info!(%target, "control connection established");
            self.notify_state(SessionState::Handshaking, epoch);
        }
        self.run_control(stream, epoch).await;
    }

    /// Dial `target`, retrying while the peer is not yet reachable. `None` when the epoch
    /// ended while waiting.
    async fn probe_connect(
        &self,
        epoch: Epoch,
        target: SocketAddr,
    ) -> Result<Option<TcpStream>, ControlError> {
        for attempt in 1..=PROBE_ATTEMPTS {
            match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => return Ok(Some(stream)),
                Ok(Err(e)) => debug!(%target, attempt, error = %e, "peer not reachable"),
                Err(_) => debug!(%target, attempt, "connect timed out"),
            }
            if attempt == PROBE_ATTEMPTS {
                break;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
            if !self.shared.lock().await.session.is_current(epoch) {
                return Ok(None);
            }
        }
        Err(ControlError::Unreachable {
            target,
            attempts: PROBE_ATTEMPTS,
        })
    }

    async fn run_control(self: Arc<Self>, stream: TcpStream, epoch: Epoch) {
        if let Err(e) = self.drive_control(stream, epoch).await {
            let mut shared = self.shared.lock().await;
            if shared.session.is_current(epoch) {
                warn!(error = %e, "control channel closed");
                self.fail(&mut shared);
            }
        }
    }

    async fn drive_control(self: &Arc<Self>, stream: TcpStream, epoch: Epoch) -> Result<(), ControlError> {
        let peer = stream.peer_addr()?;
        let (mut reader, mut writer) = stream.into_split();
        let hello = encode_handshake(&self.device_name());
        writer.write_all(&hello).await?;

        let mut buf = Vec::with_capacity(256);
        let peer_name = loop {
            match decode_handshake(&buf) {
                Ok((name, used)) => {
                    buf.drain(..used);
                    break name;
                }
                Err(HandshakeError::NeedMore) => read_more(&mut reader, &mut buf).await?,
                Err(e) => return Err(e.into()),
            }
        };

        {
            let mut shared = self.shared.lock().await;
            if !shared.session.handshake_complete(epoch, peer_name.clone(), peer.ip()) {
                return Ok(());
            }
            self.mux.start(peer.ip(), &peer_name)?;
            info!(peer = %peer_name, addr = %peer.ip(), %epoch, "session connected");
            self.notify_state(SessionState::Connected, epoch);
            let sender = tokio::spawn(self.clone().run_sender(writer, epoch, peer_name.clone()));
            shared.workers.push(sender.abort_handle());
        }

        loop {
            match decode_command(&buf) {
                Ok((frame, used)) => {
                    buf.drain(..used);
                    if !self.on_frame(frame, epoch, &peer_name).await {
                        return Ok(());
                    }
                }
                Err(CommandDecodeError::NeedMore) => read_more(&mut reader, &mut buf).await?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Dispatch one inbound frame. False when the epoch is gone.
    async fn on_frame(&self, frame: InboundFrame, epoch: Epoch, peer_name: &str) -> bool {
        let shared = self.shared.lock().await;
        if !shared.session.is_current(epoch) {
            return false;
        }
        match frame {
            InboundFrame::Command(Command::Chat(text)) => {
                let mut record = ChatRecord::new(&text, peer_name, false);
                record.id = self.chats.insert(record.clone());
                debug!(id = record.id, len = text.len(), "chat received");
                self.events.on_chat(&record);
            }
            InboundFrame::Command(Command::Vibrate) => {
                debug!("vibrate received");
                self.events.on_vibrate();
            }
            InboundFrame::Unknown(opcode) => {
                warn!(opcode, "unknown command skipped");
            }
        }
        true
    }

    async fn run_sender(self: Arc<Self>, mut writer: OwnedWriteHalf, epoch: Epoch, peer_name: String) {
        loop {
            let cmd = self.commands.pop().await;
            match self.send_command(&mut writer, cmd, epoch, &peer_name).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    let mut shared = self.shared.lock().await;
                    if shared.session.is_current(epoch) {
                        warn!(error = %e, "control write failed");
                        self.fail(&mut shared);
                    }
                    return;
                }
            }
        }
    }

    /// Write one command. Outbound chats are recorded before they hit the wire.
    async fn send_command(
        &self,
        writer: &mut OwnedWriteHalf,
        cmd: Command,
        epoch: Epoch,
        peer_name: &str,
    ) -> Result<bool, ControlError> {
        let frame = match encode_command(&cmd) {
            Ok(frame) => frame,
            Err(CommandEncodeError::TooLarge(len)) => {
                warn!(len, "chat message over the size limit dropped");
                return Ok(true);
            }
        };
        {
            let shared = self.shared.lock().await;
            if !shared.session.is_current(epoch) {
                return Ok(false);
            }
            if let Command::Chat(text) = &cmd {
                let mut record = ChatRecord::new(text, peer_name, true);
                record.id = self.chats.insert(record.clone());
                self.events.on_chat(&record);
            }
        }
        writer.write_all(&frame).await?;
        Ok(true)
    }

    /// Move to `Stopped` and release everything of the current epoch. `None` when the
    /// session was already stopped.
    fn teardown(&self, shared: &mut Shared) -> Option<Stopping> {
        let previous = shared.session.state();
        if !shared.session.stop() {
            return None;
        }
        info!(from = %previous, epoch = %shared.session.epoch(), "session stopped");
        self.events.on_state_changed(SessionState::Stopped);
        self.commands.clear();
        let stopping = self.mux.stop();
        if let Some(passive) = shared.passive.take() {
            passive.abort();
        }
        for worker in shared.workers.drain(..) {
            worker.abort();
        }
        Some(stopping)
    }

    /// Teardown on behalf of a failing worker, followed by the usual re-arm.
    fn fail(self: &Arc<Self>, shared: &mut Shared) {
        if let Some(stopping) = self.teardown(shared) {
            self.rearm_later(stopping, shared.session.epoch());
        }
    }

    /// Return to `Standby` once the file port is free and the settle delay has passed.
    fn rearm_later(self: &Arc<Self>, stopping: Stopping, epoch: Epoch) {
        let inner = self.clone();
        tokio::spawn(async move {
            stopping.wait().await;
            tokio::time::sleep(inner.settle_delay).await;
            inner.rearm(epoch).await;
        });
    }

    fn notify_state(&self, state: SessionState, epoch: Epoch) {
        debug!(%state, %epoch, "session state");
        self.events.on_state_changed(state);
    }

    fn device_name(&self) -> StdMutexGuard<'_, String> {
        self.device_name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn read_more(reader: &mut OwnedReadHalf, buf: &mut Vec<u8>) -> Result<(), ControlError> {
    let mut chunk = [0u8; 1024];
    let n = reader.read(&mut chunk).await?;
    if n == 0 {
        return Err(ControlError::Closed);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}
