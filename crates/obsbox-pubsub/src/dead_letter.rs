use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead letter write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable fallback for messages that exhausted the publish retry budget.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn store(&self, topic: &str, payload: &[u8]) -> Result<(), DeadLetterError>;
}

/// Writes each parked message to its own file under a spool directory.
pub struct FsDeadLetterQueue {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl FsDeadLetterQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_filename(&self, topic: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let slug: String = topic
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        format!("{nanos}-{seq}-{slug}.json")
    }
}

#[async_trait]
impl DeadLetterQueue for FsDeadLetterQueue {
    async fn store(&self, topic: &str, payload: &[u8]) -> Result<(), DeadLetterError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(self.next_filename(topic));
        tokio::fs::write(&path, payload).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDeadLetterQueue {
    entries: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.entries.lock().expect("dlq lock poisoned").clone()
    }
}

#[async_trait]
impl DeadLetterQueue for MemoryDeadLetterQueue {
    async fn store(&self, topic: &str, payload: &[u8]) -> Result<(), DeadLetterError> {
        self.entries
            .lock()
            .expect("dlq lock poisoned")
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_queue_writes_one_file_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsDeadLetterQueue::new(dir.path());
        queue.store("a/b/notification", b"{}").await.unwrap();
        queue.store("a/b/notification", b"{}").await.unwrap();

        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn memory_queue_keeps_topic_and_payload() {
        let queue = MemoryDeadLetterQueue::new();
        queue.store("x/notification", b"payload").await.unwrap();
        let entries = queue.entries();
        assert_eq!(entries[0].0, "x/notification");
        assert_eq!(entries[0].1, b"payload");
    }
}
