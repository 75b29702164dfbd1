//! Per-channel connection state machine and status snapshots.
//!
//! State is an explicit value transitioned only through the operations
//! here, never a bag of ad hoc mutable fields. Reads take snapshots; a
//! `watch` channel lets the facade and tests await READY without polling.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Which logical channel a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    MarketData,
    Trading,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::MarketData => "market-data",
            ChannelKind::Trading => "trading",
        }
    }
}

/// Lifecycle of one logical channel.
///
/// Requests may only be issued while `Ready`; every transition out of
/// `Ready` fails all pending requests on the channel before any caller
/// can observe the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Ready,
}

/// Read-only status view, recomputed on demand from the state cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: ChannelKind,
    pub state: ChannelState,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

struct Inner {
    state: ChannelState,
    last_heartbeat_at: Option<DateTime<Utc>>,
    retry_count: u32,
    last_error: Option<String>,
}

/// Owner of one channel's state, shared between the engine, the read
/// loop, the reconnect supervisor and the facade.
pub struct StateCell {
    channel: ChannelKind,
    inner: RwLock<Inner>,
    state_tx: watch::Sender<ChannelState>,
}

impl StateCell {
    pub fn new(channel: ChannelKind) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            channel,
            inner: RwLock::new(Inner {
                state: ChannelState::Disconnected,
                last_heartbeat_at: None,
                retry_count: 0,
                last_error: None,
            }),
            state_tx,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.read().state
    }

    /// Subscribe to state transitions.
    pub fn watch(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Transition to a new state, returning the previous one.
    pub fn transition(&self, to: ChannelState) -> ChannelState {
        let from = {
            let mut inner = self.inner.write();
            let from = inner.state;
            inner.state = to;
            from
        };
        if from != to {
            info!(channel = self.channel.as_str(), ?from, ?to, "channel state transition");
            let _ = self.state_tx.send(to);
        }
        from
    }

    /// Transition only if currently in `from`; returns whether it took.
    /// Closes the read-then-act race between `connect()` callers, the
    /// read loop and the supervisor.
    pub fn transition_if(&self, from: ChannelState, to: ChannelState) -> bool {
        let took = {
            let mut inner = self.inner.write();
            if inner.state != from {
                false
            } else {
                inner.state = to;
                true
            }
        };
        if took {
            info!(channel = self.channel.as_str(), ?from, ?to, "channel state transition");
            let _ = self.state_tx.send(to);
        }
        took
    }

    pub fn record_heartbeat(&self) {
        self.inner.write().last_heartbeat_at = Some(Utc::now());
    }

    pub fn record_error(&self, error: impl Into<String>) {
        self.inner.write().last_error = Some(error.into());
    }

    pub fn set_retry_count(&self, count: u32) {
        self.inner.write().retry_count = count;
    }

    /// Assemble a point-in-time status snapshot.
    pub fn status(&self) -> ChannelStatus {
        let inner = self.inner.read();
        ChannelStatus {
            channel: self.channel,
            state: inner.state,
            last_heartbeat_at: inner.last_heartbeat_at,
            retry_count: inner.retry_count,
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_disconnected() {
        let cell = StateCell::new(ChannelKind::MarketData);
        assert_eq!(cell.state(), ChannelState::Disconnected);
        let status = cell.status();
        assert_eq!(status.state, ChannelState::Disconnected);
        assert_eq!(status.retry_count, 0);
        assert!(status.last_heartbeat_at.is_none());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn transition_if_rejects_wrong_source_state() {
        let cell = StateCell::new(ChannelKind::Trading);
        assert!(cell.transition_if(ChannelState::Disconnected, ChannelState::Connecting));
        assert!(!cell.transition_if(ChannelState::Disconnected, ChannelState::Connecting));
        assert!(cell.transition_if(ChannelState::Connecting, ChannelState::Ready));
        assert_eq!(cell.state(), ChannelState::Ready);
    }

    #[test]
    fn watch_observes_transitions() {
        let cell = StateCell::new(ChannelKind::MarketData);
        let rx = cell.watch();
        cell.transition(ChannelState::Connecting);
        cell.transition(ChannelState::Ready);
        assert_eq!(*rx.borrow(), ChannelState::Ready);
    }

    #[test]
    fn status_reflects_recorded_fields() {
        let cell = StateCell::new(ChannelKind::Trading);
        cell.record_heartbeat();
        cell.record_error("handshake refused");
        cell.set_retry_count(3);
        let status = cell.status();
        assert!(status.last_heartbeat_at.is_some());
        assert_eq!(status.last_error.as_deref(), Some("handshake refused"));
        assert_eq!(status.retry_count, 3);
    }
}
