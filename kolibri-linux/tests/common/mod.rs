#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::time::Duration;

use kolibri_core::SessionState;
use kolibri_linux::Event;
use rand::RngCore;
use tokio::sync::mpsc::UnboundedReceiver;

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEADLINE: Duration = Duration::from_secs(10);

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    TcpListener::bind((LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Poll `cond` until it holds; panics after [`DEADLINE`].
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let polled = tokio::time::timeout(DEADLINE, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Next event from the sink; panics after [`DEADLINE`].
pub async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(DEADLINE, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Consume events until the session reports `state`; returns everything seen before it.
pub async fn wait_for_state(rx: &mut UnboundedReceiver<Event>, state: SessionState) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        match next_event(rx).await {
            Event::StateChanged(s) if s == state => return seen,
            other => seen.push(other),
        }
    }
}
