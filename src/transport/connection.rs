//! Connection lifecycle for one agent endpoint.
//!
//! A [`Connection`] is a handle to a supervisor task that dials the agent,
//! pumps frames while the socket is open, and redials after a delay when it
//! closes. It never gives up until the handle is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::link::{self, LinkSettings};
use super::{DEFAULT_RETRY_DELAY, TransportConfig, TransportError};
use crate::models::{Address, Tier};
use crate::notifications::NotificationFeed;

/// Resolution slot for the single outstanding call.
pub(crate) type ReplySender = oneshot::Sender<Result<Value, TransportError>>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started yet
    Disconnected,
    /// Waiting for the owner to supply a valid address
    AwaitingAddress,
    /// Handshake in progress
    Connecting,
    /// Frames can be sent
    Open,
    /// Socket failed or was closed; a redial is scheduled
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::AwaitingAddress => "awaiting_address",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delay schedule between a close and the next dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay after every failure
    Fixed(Duration),
    /// Doubling delay starting at `base`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    /// Delay before the next dial after `failures` consecutive failures.
    ///
    /// Failure 1: base
    /// Failure 2: 2 × base
    /// Failure 3: 4 × base
    /// ... capped at max
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { base, max } => {
                let exponent = failures.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent)
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

/// State the supervisor task and the handle both see.
pub(crate) struct Shared {
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<Option<ReplySender>>,
    attempts: AtomicU32,
    feed: NotificationFeed,
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new(feed: NotificationFeed) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            outbound: Mutex::new(None),
            pending: Mutex::new(None),
            attempts: AtomicU32::new(0),
            feed,
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn begin_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn feed(&self) -> &NotificationFeed {
        &self.feed
    }

    /// Install the socket writer and mark the connection open.
    pub(crate) fn open(&self, outbound: mpsc::UnboundedSender<Message>) {
        *lock(&self.outbound) = Some(outbound);
        self.set_state(ConnectionState::Open);
    }

    /// Mark the connection closed and fail the outstanding call.
    ///
    /// Order matters: a call that observed `Open` either fails its send or
    /// has its pending slot taken here.
    pub(crate) fn close(&self) {
        self.set_state(ConnectionState::Closed);
        lock(&self.outbound).take();
        if let Some(pending) = lock(&self.pending).take() {
            let _ = pending.send(Err(TransportError::Closed));
        }
    }

    /// Hand a reply to the outstanding call, if there is one.
    pub(crate) fn resolve(&self, reply: Result<Value, TransportError>) {
        match lock(&self.pending).take() {
            Some(pending) => {
                let _ = pending.send(reply);
            }
            None => debug!("dropping reply with no outstanding call"),
        }
    }
}

/// Handle to one supervised agent connection.
///
/// Dropping the handle stops the supervisor and fails any outstanding call
/// with [`TransportError::Closed`].
pub struct Connection {
    shared: Arc<Shared>,
    address: watch::Sender<Address>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Start supervising a connection to `address`.
    ///
    /// Must be called inside a tokio runtime. An invalid address parks the
    /// connection in [`ConnectionState::AwaitingAddress`] until
    /// [`Connection::retarget`] supplies a valid one.
    pub fn open(
        address: Address,
        tier: Tier,
        config: &TransportConfig,
        feed: NotificationFeed,
    ) -> Self {
        let shared = Arc::new(Shared::new(feed));
        let (address_tx, address_rx) = watch::channel(address);
        let settings = LinkSettings {
            scheme: config.scheme.clone(),
            role: config.role_paths.for_tier(tier).to_string(),
            retry: config.retry,
            address_poll: config.address_poll,
        };
        let task = tokio::spawn(link::supervise(Arc::clone(&shared), address_rx, settings));
        Self {
            shared,
            address: address_tx,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Number of dials started so far.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> Address {
        self.address.borrow().clone()
    }

    /// Point the connection at a new address.
    ///
    /// A live socket to the old address is closed and new calls wait for
    /// the new one. No-op if unchanged.
    pub fn retarget(&self, address: Address) {
        let changed = self.address.send_if_modified(|current| {
            if *current == address {
                false
            } else {
                *current = address;
                true
            }
        });
        if changed {
            self.shared.set_state(ConnectionState::Connecting);
        }
    }

    /// Queue a text frame on the open socket.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.state().is_open() {
            return Err(TransportError::NotOpen);
        }
        let outbound = lock(&self.shared.outbound);
        match outbound.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|_| TransportError::NotOpen),
            None => Err(TransportError::NotOpen),
        }
    }

    /// Register the slot the next reply resolves.
    pub(crate) fn set_pending(&self, reply: ReplySender) {
        *lock(&self.shared.pending) = Some(reply);
    }

    pub(crate) fn clear_pending(&self) {
        lock(&self.shared.pending).take();
    }

    /// Abandon the outstanding call and drop the live socket.
    ///
    /// Replies carry no request id, so a reply still in flight on this
    /// socket must never reach a later call. The supervisor sees the closed
    /// writer, treats the socket as lost and redials.
    pub(crate) fn reset(&self) {
        lock(&self.shared.pending).take();
        let mut outbound = lock(&self.shared.outbound);
        if outbound.is_some() {
            self.shared.set_state(ConnectionState::Closed);
            outbound.take();
            debug!(address = %self.address(), "socket dropped after abandoned call");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
        self.shared.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address())
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}
