//! Control-session state machine. Host-driven: the controller owns the sockets and calls
//! these transitions under its lock; every asynchronous worker carries the [`Epoch`] it was
//! started in and passes it back, so work from a torn-down session is rejected.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Stopped,
    Standby,
    Connecting,
    Handshaking,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Standby => "standby",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Session generation. Bumped exactly once per transition into `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Epoch(u64);

impl Epoch {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct Session {
    state: SessionState,
    epoch: Epoch,
    peer_name: Option<String>,
    peer_addr: Option<IpAddr>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.peer_addr
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch == epoch
    }

    /// True while the passive worker of `epoch` may keep listening.
    pub fn is_listening(&self, epoch: Epoch) -> bool {
        self.is_current(epoch) && self.state == SessionState::Standby
    }

    /// `Stopped → Standby`. Returns the epoch the passive worker runs in.
    pub fn start_listening(&mut self) -> Option<Epoch> {
        if self.state != SessionState::Stopped {
            return None;
        }
        self.state = SessionState::Standby;
        Some(self.epoch)
    }

    /// `Standby → Connecting`. Returns the epoch the active worker runs in.
    pub fn begin_connect(&mut self) -> Option<Epoch> {
        if self.state != SessionState::Standby {
            return None;
        }
        self.state = SessionState::Connecting;
        Some(self.epoch)
    }

    /// Passive side accepted a control connection: `Standby → Handshaking`.
    pub fn accepted(&mut self, epoch: Epoch) -> bool {
        if !self.is_listening(epoch) {
            return false;
        }
        self.state = SessionState::Handshaking;
        true
    }

    /// Active side finished its TCP connect: `Connecting → Handshaking`.
    pub fn connected(&mut self, epoch: Epoch) -> bool {
        if !self.is_current(epoch) || self.state != SessionState::Connecting {
            return false;
        }
        self.state = SessionState::Handshaking;
        true
    }

    /// `Handshaking → Connected`, recording the peer identity.
    pub fn handshake_complete(&mut self, epoch: Epoch, peer_name: String, peer_addr: IpAddr) -> bool {
        if !self.is_current(epoch) || self.state != SessionState::Handshaking {
            return false;
        }
        self.state = SessionState::Connected;
        self.peer_name = Some(peer_name);
        self.peer_addr = Some(peer_addr);
        true
    }

    /// Any state `→ Stopped`: bumps the epoch and forgets the peer. No-op when already stopped.
    pub fn stop(&mut self) -> bool {
        if self.state == SessionState::Stopped {
            return false;
        }
        self.state = SessionState::Stopped;
        self.epoch = Epoch(self.epoch.0 + 1);
        self.peer_name = None;
        self.peer_addr = None;
        true
    }

    /// [`Session::stop`] on behalf of a worker; ignored if the worker's epoch is stale.
    pub fn stop_if_current(&mut self, epoch: Epoch) -> bool {
        self.is_current(epoch) && self.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1));

    fn connected_session() -> (Session, Epoch) {
        let mut s = Session::new();
        let e = s.start_listening().unwrap();
        assert!(s.accepted(e));
        assert!(s.handshake_complete(e, "phone".into(), PEER));
        (s, e)
    }

    #[test]
    fn passive_path() {
        let (s, e) = connected_session();
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.peer_name(), Some("phone"));
        assert_eq!(s.peer_addr(), Some(PEER));
        assert_eq!(s.epoch(), e);
    }

    #[test]
    fn active_path() {
        let mut s = Session::new();
        let listen = s.start_listening().unwrap();
        let e = s.begin_connect().unwrap();
        assert_eq!(listen, e);
        // the passive worker of the same epoch must not win once connecting
        assert!(!s.accepted(listen));
        assert!(s.connected(e));
        assert!(s.handshake_complete(e, "tablet".into(), PEER));
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[test]
    fn connect_requires_standby() {
        let mut s = Session::new();
        assert!(s.begin_connect().is_none());
        let _ = s.start_listening();
        assert!(s.start_listening().is_none());
        assert!(s.begin_connect().is_some());
        assert!(s.begin_connect().is_none());
    }

    #[test]
    fn stop_bumps_epoch_once_and_clears_peer() {
        let (mut s, e) = connected_session();
        assert!(s.stop());
        assert_eq!(s.state(), SessionState::Stopped);
        assert_eq!(s.epoch().value(), e.value() + 1);
        assert!(s.peer_name().is_none());
        assert!(s.peer_addr().is_none());

        assert!(!s.stop());
        assert_eq!(s.epoch().value(), e.value() + 1);
    }

    #[test]
    fn stale_workers_never_mutate() {
        // Drive the session into every state, retire the epoch, re-enter each state in the
        // new epoch and replay every worker transition with the stale epoch.
        let targets = [
            SessionState::Standby,
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Connected,
        ];
        for first in targets {
            for second in targets {
                let mut s = Session::new();
                let stale = drive_to(&mut s, first);
                assert!(s.stop());
                let _ = s.start_listening();
                drive_to_from_standby(&mut s, second);

                let before = (s.state(), s.epoch(), s.peer_name().map(str::to_owned));
                assert!(!s.accepted(stale));
                assert!(!s.connected(stale));
                assert!(!s.handshake_complete(stale, "ghost".into(), PEER));
                assert!(!s.stop_if_current(stale));
                assert!(!s.is_listening(stale));
                let after = (s.state(), s.epoch(), s.peer_name().map(str::to_owned));
                assert_eq!(before, after, "{first:?} -> {second:?}");
            }
        }
    }

    #[test]
    fn current_worker_can_stop() {
        let (mut s, e) = connected_session();
        assert!(s.stop_if_current(e));
        assert!(!s.stop_if_current(e));
    }

    fn drive_to(s: &mut Session, target: SessionState) -> Epoch {
        let e = s.start_listening().unwrap();
        drive_to_from_standby(s, target);
        e
    }

    fn drive_to_from_standby(s: &mut Session, target: SessionState) {
        let e = s.epoch();
        match target {
            SessionState::Stopped | SessionState::Standby => {}
            SessionState::Connecting => {
                s.begin_connect();
            }
            SessionState::Handshaking => {
                s.accepted(e);
            }
            SessionState::Connected => {
                s.accepted(e);
                s.handshake_complete(e, "phone".into(), PEER);
            }
        }
        assert_eq!(s.state(), target);
    }
}
