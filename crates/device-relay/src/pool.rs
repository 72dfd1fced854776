use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::ChannelSession;
use crate::config::ChannelConfig;
use crate::error::ChannelError;

/// Shares one relay connection per device key between components.
///
/// Entries are weak: the connection lives as long as some [`PooledChannel`]
/// for it does and is closed when the last one is dropped. Connects are
/// serialized per device key only.
pub struct ChannelPool {
    config: ChannelConfig,
    channels: Mutex<HashMap<String, Entry>>,
}

#[derive(Default)]
struct Entry {
    channel: Weak<SharedChannel>,
    connecting: Arc<tokio::sync::Mutex<()>>,
}

impl Entry {
    fn live(&self) -> Option<Arc<SharedChannel>> {
        self.channel
            .upgrade()
            .filter(|shared| !shared.session.is_closed())
    }

    fn idle(&self) -> bool {
        self.channel.strong_count() == 0 && Arc::strong_count(&self.connecting) == 1
    }
}

struct SharedChannel {
    session: Arc<ChannelSession>,
}

impl Drop for SharedChannel {
    fn drop(&mut self) {
        debug!(target = "relay", device = %self.session.device_key(), "last holder released channel");
        self.session.close();
    }
}

/// A counted handle on a pooled [`ChannelSession`].
#[derive(Clone)]
pub struct PooledChannel {
    shared: Arc<SharedChannel>,
}

impl PooledChannel {
    pub fn session(&self) -> &Arc<ChannelSession> {
        &self.shared.session
    }
}

impl Deref for PooledChannel {
    type Target = Arc<ChannelSession>;

    fn deref(&self) -> &Self::Target {
        &self.shared.session
    }
}

impl ChannelPool {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            channels: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Returns the live channel for `device_key`, opening one if needed.
    /// A channel that has already torn down is replaced.
    pub async fn acquire(&self, device_key: &str) -> Result<PooledChannel, ChannelError> {
        let gate = {
            let mut channels = self.channels.lock();
            if let Some(shared) = channels.get(device_key).and_then(Entry::live) {
                return Ok(PooledChannel { shared });
            }
            channels.retain(|key, entry| key == device_key || !entry.idle());
            channels
                .entry(device_key.to_string())
                .or_default()
                .connecting
                .clone()
        };

        let _connecting = gate.lock().await;
        // Another acquirer may have connected while we waited.
        let connected = self.channels.lock().get(device_key).and_then(Entry::live);
        if let Some(shared) = connected {
            return Ok(PooledChannel { shared });
        }

        let session = ChannelSession::open(&self.config, device_key).await?;
        let shared = Arc::new(SharedChannel { session });
        self.channels
            .lock()
            .entry(device_key.to_string())
            .or_default()
            .channel = Arc::downgrade(&shared);
        Ok(PooledChannel { shared })
    }

    pub fn active_devices(&self) -> Vec<String> {
        let channels = self.channels.lock();
        let mut keys: Vec<String> = channels
            .iter()
            .filter(|(_, entry)| entry.channel.strong_count() > 0)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of handles currently holding the channel for `device_key`.
    pub fn subscriber_count(&self, device_key: &str) -> usize {
        self.channels
            .lock()
            .get(device_key)
            .map(|entry| entry.channel.strong_count())
            .unwrap_or_default()
    }
}
