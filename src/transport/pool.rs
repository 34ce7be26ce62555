//! One RPC client per agent address.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use super::{RpcClient, TransportConfig};
use crate::models::{Address, Tier};
use crate::notifications::NotificationFeed;

/// Lazily created clients keyed by address.
///
/// Clients live until their address is pruned with [`ConnectionPool::retain`]
/// or the pool is cleared; dropping the last handle stops the connection.
#[derive(Debug)]
pub struct ConnectionPool {
    config: TransportConfig,
    feed: NotificationFeed,
    clients: HashMap<Address, Arc<RpcClient>>,
}

impl ConnectionPool {
    pub fn new(config: TransportConfig, feed: NotificationFeed) -> Self {
        Self {
            config,
            feed,
            clients: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn feed(&self) -> &NotificationFeed {
        &self.feed
    }

    /// The client for `address`, connecting on first use.
    ///
    /// `tier` picks the endpoint path when a new client is created.
    pub fn get_or_connect(&mut self, address: &Address, tier: Tier) -> Arc<RpcClient> {
        if let Some(client) = self.clients.get(address) {
            return Arc::clone(client);
        }
        debug!(address = %address, tier = %tier, "opening agent connection");
        let client = Arc::new(RpcClient::connect(
            address.clone(),
            tier,
            &self.config,
            self.feed.clone(),
        ));
        self.clients.insert(address.clone(), Arc::clone(&client));
        client
    }

    pub fn get(&self, address: &Address) -> Option<Arc<RpcClient>> {
        self.clients.get(address).cloned()
    }

    /// Drop clients whose address is not in `live`.
    pub fn retain(&mut self, live: &BTreeSet<Address>) {
        self.clients.retain(|address, _| {
            let keep = live.contains(address);
            if !keep {
                debug!(address = %address, "closing agent connection");
            }
            keep
        });
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }

    /// Addresses with a client, sorted.
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.clients.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
