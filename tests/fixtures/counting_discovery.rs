//! Discovery wrapper that counts publishes per key

use async_trait::async_trait;
use dashmap::DashMap;
use dmsg::{Discovery, Entry, PubKey, Result};
use std::sync::Arc;

/// Delegates to another discovery and records who published how often
pub struct CountingDiscovery {
    inner: Arc<dyn Discovery>,
    publishes: DashMap<PubKey, usize>,
}

impl CountingDiscovery {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn Discovery>) -> Self {
        Self {
            inner,
            publishes: DashMap::new(),
        }
    }

    /// Accepted publishes of `pk`'s entry so far
    pub fn publishes(&self, pk: &PubKey) -> usize {
        self.publishes.get(pk).map_or(0, |n| *n)
    }
}

#[async_trait]
impl Discovery for CountingDiscovery {
    async fn resolve(&self, pk: &PubKey) -> Result<Entry> {
        self.inner.resolve(pk).await
    }

    async fn publish(&self, entry: Entry) -> Result<()> {
        let pk = entry.static_pk;
        self.inner.publish(entry).await?;
        *self.publishes.entry(pk).or_default() += 1;
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<Entry>> {
        self.inner.available_servers().await
    }
}
