//! Supervisor loop behind a [`Connection`](super::Connection).
//!
//! 1. Wait for a valid address (polling)
//! 2. Dial `scheme://host:port/<role>/ws`
//! 3. Pump frames until the socket closes or the address changes
//! 4. Sleep per the retry policy and dial again

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::TransportError;
use super::connection::{ConnectionState, RetryPolicy, Shared};
use super::protocol::{endpoint_url, is_status_update, parse_status_update};
use crate::models::Address;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) struct LinkSettings {
    pub scheme: String,
    pub role: String,
    pub retry: RetryPolicy,
    pub address_poll: Duration,
}

/// Why a pumped socket stopped.
enum LinkEnd {
    /// Remote closed or the socket errored
    Lost,
    /// The owner supplied a new address
    Retarget,
    /// The owner is gone
    Shutdown,
}

/// Run until the owning handle drops its address sender or aborts the task.
pub(crate) async fn supervise(
    shared: Arc<Shared>,
    mut address_rx: watch::Receiver<Address>,
    settings: LinkSettings,
) {
    let mut failures: u32 = 0;

    loop {
        let address = address_rx.borrow_and_update().clone();
        if !address.is_valid() {
            shared.set_state(ConnectionState::AwaitingAddress);
            tokio::select! {
                _ = tokio::time::sleep(settings.address_poll) => {}
                changed = address_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        let url = match endpoint_url(&settings.scheme, &address, &settings.role) {
            Ok(url) => url,
            Err(e) => {
                warn!(address = %address, error = %e, "cannot build endpoint URL");
                shared.set_state(ConnectionState::AwaitingAddress);
                if address_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }
        };

        let attempt = shared.begin_attempt();
        shared.set_state(ConnectionState::Connecting);
        debug!(address = %address, %url, attempt, "connecting");

        let dialed = tokio::select! {
            result = connect_async(url.as_str()) => Some(result),
            changed = address_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                None
            }
        };

        match dialed {
            None => continue,
            Some(Ok((ws, _response))) => {
                info!(address = %address, attempt, "connected");
                failures = 0;
                let end = pump(ws, &shared, &address, &mut address_rx).await;
                shared.close();
                match end {
                    LinkEnd::Shutdown => return,
                    LinkEnd::Retarget => {
                        info!(address = %address, "address changed, reconnecting");
                        continue;
                    }
                    LinkEnd::Lost => {
                        warn!(address = %address, "connection lost");
                        failures += 1;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(address = %address, attempt, error = %e, "connection failed");
                shared.close();
                failures += 1;
            }
        }

        let delay = settings.retry.delay(failures);
        debug!(address = %address, ?delay, "scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = address_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Move frames between the socket and the shared state until it stops.
async fn pump(
    ws: WsStream,
    shared: &Shared,
    address: &Address,
    address_rx: &mut watch::Receiver<Address>,
) -> LinkEnd {
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    shared.open(tx);

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(msg) = outgoing else {
                    return LinkEnd::Lost;
                };
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "failed to send frame");
                    return LinkEnd::Lost;
                }
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => route_inbound(shared, address, &text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => route_inbound(shared, address, &text),
                        Err(_) => shared.resolve(Err(TransportError::MalformedReply(
                            "binary frame is not UTF-8".to_string(),
                        ))),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return LinkEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return LinkEnd::Lost,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error");
                        return LinkEnd::Lost;
                    }
                    _ => {}
                }
            }

            changed = address_rx.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return if changed.is_err() {
                    LinkEnd::Shutdown
                } else {
                    LinkEnd::Retarget
                };
            }
        }
    }
}

/// Publish status updates; hand everything else to the outstanding call.
///
/// A frame tagged as a status update never answers a call, even when its
/// body is unreadable.
fn route_inbound(shared: &Shared, address: &Address, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "malformed frame");
            shared.resolve(Err(TransportError::MalformedReply(e.to_string())));
            return;
        }
    };

    if is_status_update(&value) {
        match parse_status_update(&value) {
            Some(status) => {
                debug!(address = %address, status = %status.status, "status update");
                shared.feed().publish(address.clone(), status);
            }
            None => debug!(address = %address, frame = %value, "dropping unreadable status update"),
        }
        return;
    }
    shared.resolve(Ok(value));
}
