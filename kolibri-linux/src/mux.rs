//! Transfer multiplexer: one reactor thread per connected session serving every file
//! handler. Outbound handlers are queued from any thread and registered by the reactor;
//! inbound handlers are created on accept, for the connected peer's address only.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use kolibri_core::{EventSink, FileStore, TransferTracker};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::file::LocalFile;
use crate::handler::{Outcome, ReceiveHandler, SendHandler};

/// Where the file channel listens, where the peer's file channel is, and where inbound
/// files land.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub bind_addr: IpAddr,
    pub file_port: u16,
    pub peer_file_port: u16,
    pub receive_dir: PathBuf,
}

#[derive(Clone)]
pub struct TransferMux {
    inner: Arc<Inner>,
}

struct Inner {
    config: MuxConfig,
    files: Arc<dyn FileStore>,
    events: Arc<dyn EventSink>,
    running: Mutex<Option<Running>>,
}

struct Running {
    peer_addr: IpAddr,
    peer_name: String,
    local_addr: SocketAddr,
    jobs: mpsc::UnboundedSender<SendHandler>,
    shutdown: oneshot::Sender<()>,
    stopped: oneshot::Receiver<()>,
}

/// Resolves once the reactor thread has released its listener and dropped every handler.
#[must_use = "await `wait` before rebinding the file port"]
pub struct Stopping(Option<oneshot::Receiver<()>>);

impl Stopping {
    pub async fn wait(self) {
        if let Some(stopped) = self.0 {
            // sender dropped also means the thread is gone
            let _ = stopped.await;
        }
    }
}

impl TransferMux {
    pub fn new(config: MuxConfig, files: Arc<dyn FileStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                files,
                events,
                running: Mutex::new(None),
            }),
        }
    }

    /// Bind the file port and start the reactor for `peer_addr`. Tasks left `Running` by a
    /// previous session are failed first. No-op while already running.
    pub fn start(&self, peer_addr: IpAddr, peer_name: &str) -> io::Result<()> {
        let mut running = self.inner.lock();
        if running.is_some() {
            return Ok(());
        }
        self.inner.files.abort_all_running_tasks();

        let cfg = &self.inner.config;
        let listener = std::net::TcpListener::bind((cfg.bind_addr, cfg.file_port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let reactor = Reactor {
            listener: Some(listener),
            jobs: jobs_rx,
            peer_addr: peer_addr.to_canonical(),
            peer_name: peer_name.to_owned(),
            receive_dir: cfg.receive_dir.clone(),
            files: self.inner.files.clone(),
            events: self.inner.events.clone(),
        };
        std::thread::Builder::new()
            .name("kolibri-mux".into())
            .spawn(move || {
                reactor.run_blocking(shutdown_rx);
                let _ = stopped_tx.send(());
            })?;

        info!(%local_addr, peer = %peer_addr, "transfer mux started");
        *running = Some(Running {
            peer_addr,
            peer_name: peer_name.to_owned(),
            local_addr,
            jobs: jobs_tx,
            shutdown: shutdown_tx,
            stopped: stopped_rx,
        });
        Ok(())
    }

    /// Signal the reactor to stop. Active handlers are dropped (their tasks fail) and the
    /// listener is closed on the reactor thread; await the returned [`Stopping`] for that.
    pub fn stop(&self) -> Stopping {
        let Some(running) = self.inner.lock().take() else {
            return Stopping(None);
        };
        let _ = running.shutdown.send(());
        debug!(local_addr = %running.local_addr, "transfer mux stopping");
        Stopping(Some(running.stopped))
    }

    /// Queue `file` for sending to the connected peer. Returns false, and drops the file,
    /// when no session is running.
    pub fn send_file(&self, file: Box<dyn LocalFile>) -> bool {
        let running = self.inner.lock();
        let Some(running) = running.as_ref() else {
            debug!(name = file.name(), "transfer mux not running, file dropped");
            return false;
        };
        let tracker = TransferTracker::new(
            self.inner.files.clone(),
            self.inner.events.clone(),
            &running.peer_name,
        );
        let peer = SocketAddr::new(running.peer_addr, self.inner.config.peer_file_port);
        let handler = SendHandler::new(file, tracker, peer);
        // a closed queue drops the handler, which fails its (unstarted) tracker
        running.jobs.send(handler).is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Address the file channel is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().as_ref().map(|r| r.local_addr)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// State owned by the reactor thread.
struct Reactor {
    /// Converted on the reactor thread, which owns the runtime it registers with.
    listener: Option<std::net::TcpListener>,
    jobs: mpsc::UnboundedReceiver<SendHandler>,
    peer_addr: IpAddr,
    peer_name: String,
    receive_dir: PathBuf,
    files: Arc<dyn FileStore>,
    events: Arc<dyn EventSink>,
}

impl Reactor {
    fn run_blocking(self, shutdown: oneshot::Receiver<()>) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!(error = %e, "transfer reactor runtime failed to start");
                return;
            }
        };
        rt.block_on(self.run(shutdown));
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let Some(std_listener) = self.listener.take() else {
            return;
        };
        let listener = match TcpListener::from_std(std_listener) {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "file listener unusable");
                return;
            }
        };
        let mut active: FuturesUnordered<LocalBoxFuture<'static, Outcome>> =
            FuturesUnordered::new();

        loop {
            // shutdown wins over queued jobs: nothing registers after stop()
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                job = self.jobs.recv() => match job {
                    Some(mut handler) => {
                        handler.register();
                        active.push(handler.run().boxed_local());
                    }
                    None => break,
                },
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        if let Some(handler) = self.on_accept(stream, remote) {
                            active.push(handler.run().boxed_local());
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "file channel accept failed");
                        break;
                    }
                },
                Some(outcome) = active.next(), if !active.is_empty() => {
                    debug!(?outcome, active = active.len(), "file handler retired");
                }
            }
        }

        if !active.is_empty() {
            info!(aborted = active.len(), "aborting active transfers");
        }
        drop(active);
        self.jobs.close();
        while let Ok(pending) = self.jobs.try_recv() {
            drop(pending);
        }
        drop(listener);
        debug!("transfer reactor stopped");
    }

    /// Only the connected peer may open file connections; anything else is closed unread.
    fn on_accept(&self, stream: TcpStream, remote: SocketAddr) -> Option<ReceiveHandler> {
        if remote.ip().to_canonical() != self.peer_addr {
            warn!(%remote, expected = %self.peer_addr, "file connection from unexpected address");
            return None;
        }
        debug!(%remote, "file connection accepted");
        let tracker = TransferTracker::new(self.files.clone(), self.events.clone(), &self.peer_name);
        Some(ReceiveHandler::new(stream, tracker, self.receive_dir.clone()))
    }
}
