//! In-flight message cache keyed by MQTT packet identifier
//!
//! Outgoing publishes and subscriptions stay here until the broker completes
//! the acknowledgement exchange; incoming QoS 2 publishes leave a placeholder
//! until PUBREL arrives. Entries that see no activity for one keep-alive
//! interval are reported by [`MessageCache::sweep_expired`] for retransmission.

use bytes::Bytes;
use rumqttc::mqttbytes::QoS;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Cache invariant violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("message id {0} is already cached")]
    AlreadyCached(u16),
    #[error("all message identifiers are in use")]
    IdentifiersExhausted,
}

/// A message awaiting acknowledgement or completion
#[derive(Debug, Clone, PartialEq)]
pub enum CachedMessage {
    /// SUBSCRIBE awaiting SUBACK
    Subscription { topic: String, max_qos: QoS },
    /// PUBLISH awaiting PUBACK (QoS 1) or PUBREC/PUBCOMP (QoS 2)
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
    },
    /// Incoming QoS 2 PUBLISH for which PUBREC was sent and PUBREL is pending
    IncomingQos2Placeholder,
}

#[derive(Debug)]
struct CacheEntry {
    message: CachedMessage,
    expiry: Instant,
}

/// Map from packet identifier to in-flight message with expiry tracking
#[derive(Debug)]
pub struct MessageCache {
    entries: HashMap<u16, CacheEntry>,
    ttl: Duration,
    last_id: u16,
}

impl MessageCache {
    /// Create an empty cache whose entries expire after `ttl` of inactivity
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            last_id: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return an identifier that is neither zero nor currently cached
    ///
    /// Identifiers come from a rolling counter that wraps back to 1, so a
    /// recently released identifier is not handed out again right away.
    pub fn next_free_id(&mut self) -> Result<u16, CacheError> {
        if self.entries.len() >= usize::from(u16::MAX) {
            return Err(CacheError::IdentifiersExhausted);
        }

        loop {
            self.last_id = if self.last_id == u16::MAX {
                1
            } else {
                self.last_id + 1
            };
            if !self.entries.contains_key(&self.last_id) {
                return Ok(self.last_id);
            }
        }
    }

    /// Store a message, it expires one ttl after `now`
    pub fn insert(
        &mut self,
        id: u16,
        message: CachedMessage,
        now: Instant,
    ) -> Result<(), CacheError> {
        if self.entries.contains_key(&id) {
            error!(message_id = id, "Message id is already cached");
            return Err(CacheError::AlreadyCached(id));
        }

        debug!(message_id = id, "Caching message");
        self.entries.insert(
            id,
            CacheEntry {
                message,
                expiry: now + self.ttl,
            },
        );
        Ok(())
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: u16) -> Option<&CachedMessage> {
        self.entries.get(&id).map(|entry| &entry.message)
    }

    /// Report every expired entry to `retransmit`
    ///
    /// The expiry of each reported entry is pushed one ttl into the future
    /// before the callback runs, so an entry is reported at most once per sweep.
    pub fn sweep_expired<F>(&mut self, now: Instant, mut retransmit: F)
    where
        F: FnMut(u16, &CachedMessage),
    {
        for (&id, entry) in self.entries.iter_mut() {
            if entry.expiry > now {
                continue;
            }
            warn!(message_id = id, "Message has timed out, retransmitting");
            entry.expiry = now + self.ttl;
            retransmit(id, &entry.message);
        }
    }

    /// Restart the expiry of an entry after partial progress on its exchange
    pub fn refresh_expiry(&mut self, id: u16, now: Instant) {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                debug!(message_id = id, "Refreshing message expiry");
                entry.expiry = now + self.ttl;
            }
            None => error!(message_id = id, "Cannot refresh expiry, message id not cached"),
        }
    }

    /// Remove an entry and hand its message back to the caller
    pub fn remove(&mut self, id: u16) -> Option<CachedMessage> {
        match self.entries.remove(&id) {
            Some(entry) => {
                debug!(message_id = id, "Removed message from cache");
                Some(entry.message)
            }
            None => {
                error!(message_id = id, "Cannot remove message, id not cached");
                None
            }
        }
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!(count = self.entries.len(), "Clearing message cache");
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached identifiers in ascending order
    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
