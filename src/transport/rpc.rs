//! Request/response correlation over one [`Connection`].

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionState};
use super::protocol::{Operation, RequestFrame};
use super::{TransportConfig, TransportError};
use crate::models::{Address, Tier};
use crate::notifications::NotificationFeed;

/// RPC client for one agent.
///
/// At most one call is in flight per client; concurrent callers queue on
/// an async lock and the next inbound non-notification frame answers the
/// call that holds it.
#[derive(Debug)]
pub struct RpcClient {
    connection: Connection,
    call_lock: Mutex<()>,
    call_timeout: Option<Duration>,
}

impl RpcClient {
    /// Start a client for the agent at `address`.
    pub fn connect(
        address: Address,
        tier: Tier,
        config: &TransportConfig,
        feed: NotificationFeed,
    ) -> Self {
        Self {
            connection: Connection::open(address, tier, config, feed),
            call_lock: Mutex::new(()),
            call_timeout: config.call_timeout,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn address(&self) -> Address {
        self.connection.address()
    }

    /// Point the client at a new address. The live socket is replaced.
    pub fn retarget(&self, address: Address) {
        self.connection.retarget(address);
    }

    /// Wait until the connection is open.
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        let mut state = self.connection.subscribe_state();
        state
            .wait_for(ConnectionState::is_open)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }

    /// Send `operation` with `payload` and wait for the reply.
    ///
    /// Waits for the connection to open first. Fails with
    /// [`TransportError::Closed`] if the socket closes before the reply and
    /// [`TransportError::TimedOut`] if a call timeout is configured and hit.
    /// A timed-out call drops the socket, so its late reply cannot answer
    /// the next call.
    pub async fn call(&self, operation: Operation, payload: Value) -> Result<Value, TransportError> {
        let text = serde_json::to_string(&RequestFrame::new(operation, payload))
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        let _guard = self.call_lock.lock().await;
        debug!(address = %self.address(), %operation, "call");

        let result = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.exchange(text)).await {
                Ok(result) => result,
                Err(_) => {
                    self.connection.reset();
                    Err(TransportError::TimedOut(limit))
                }
            },
            None => self.exchange(text).await,
        };

        if let Err(e) = &result {
            warn!(address = %self.address(), %operation, error = %e, "call failed");
        }
        result
    }

    async fn exchange(&self, text: String) -> Result<Value, TransportError> {
        loop {
            self.wait_open().await?;
            let (tx, rx) = oneshot::channel();
            self.connection.set_pending(tx);
            match self.connection.send(text.clone()) {
                Ok(()) => {
                    return match rx.await {
                        Ok(reply) => reply,
                        Err(_) => Err(TransportError::Closed),
                    };
                }
                // Closed between the state check and the send; wait again.
                Err(TransportError::NotOpen) => self.connection.clear_pending(),
                Err(e) => {
                    self.connection.clear_pending();
                    return Err(e);
                }
            }
        }
    }
}
