use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// The shared append-only message log every participant publishes to and
/// queries from.
///
/// This is the transport boundary of the protocol: entries are opaque sealed
/// blobs, visible to any participant able to query the log. The log never
/// mutates in place, so concurrent writers can only race on duplicate
/// publishes, never on conflicting updates. `query` returns a snapshot — a
/// fresh pass over what is visible at call time, never a resumed cursor.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Appends one sealed entry. Resolves once the log acknowledges it.
    async fn publish(&self, entry: Vec<u8>) -> Result<()>;

    /// Returns every entry visible at call time, oldest first.
    async fn query(&self) -> Result<Vec<Vec<u8>>>;
}

/// An in-process append-only log.
///
/// Stands in for the real shared log in tests and single-process use; clones
/// share the same entries, so several members constructed over clones of one
/// `MemoryMessageLog` see each other's messages.
#[derive(Debug, Default, Clone)]
pub struct MemoryMessageLog {
    entries: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently visible.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn publish(&self, entry: Vec<u8>) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Log("log mutex poisoned".to_string()))?;
        entries.push(entry);
        Ok(())
    }

    async fn query(&self) -> Result<Vec<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::Log("log mutex poisoned".to_string()))?;
        Ok(entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_query_preserve_order() {
        let log = MemoryMessageLog::new();
        log.publish(b"first".to_vec()).await.unwrap();
        log.publish(b"second".to_vec()).await.unwrap();

        let entries = log.query().await.unwrap();
        assert_eq!(entries, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn test_query_is_a_snapshot() {
        let log = MemoryMessageLog::new();
        log.publish(b"first".to_vec()).await.unwrap();

        let before = log.query().await.unwrap();
        log.publish(b"second".to_vec()).await.unwrap();
        let after = log.query().await.unwrap();

        // The earlier snapshot does not grow; a fresh query sees everything.
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let log = MemoryMessageLog::new();
        let other = log.clone();
        log.publish(b"shared".to_vec()).await.unwrap();

        assert_eq!(other.query().await.unwrap().len(), 1);
    }
}
