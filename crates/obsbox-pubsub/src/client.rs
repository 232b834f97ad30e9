use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::warn;

use crate::{BrokerConfig, PubSubError};

#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Publish a payload at QoS 1 (at-least-once).
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError>;
}

/// Publishing half of the broker connection. The event loop driving the
/// network session runs on a background task for the lifetime of the client;
/// rumqttc reconnects the session between polls.
pub struct MqttPubSubClient {
    client: AsyncClient,
}

impl MqttPubSubClient {
    pub fn connect(config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    warn!(error = %err, "publisher connection error, reconnecting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });

        Self { client }
    }
}

#[async_trait]
impl PubSubClient for MqttPubSubClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| PubSubError::Connection(err.to_string()))
    }
}

/// Records published messages in memory. `fail_next` makes the next N
/// publish calls report a transient connection failure.
#[derive(Default)]
pub struct MemoryPubSub {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    fail_next: AtomicUsize,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().expect("pubsub lock poisoned").clone()
    }
}

#[async_trait]
impl PubSubClient for MemoryPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(PubSubError::Connection("injected disconnect".into()));
        }
        self.messages
            .lock()
            .expect("pubsub lock poisoned")
            .push((topic.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pubsub_records_messages_in_order() {
        let bus = MemoryPubSub::new();
        bus.publish("a/b", b"one".to_vec()).await.unwrap();
        bus.publish("a/c", b"two".to_vec()).await.unwrap();
        let published = bus.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "a/b");
        assert_eq!(published[1].1, b"two");
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let bus = MemoryPubSub::new();
        bus.fail_next(2);
        assert!(bus.publish("t", vec![]).await.unwrap_err().is_transient());
        assert!(bus.publish("t", vec![]).await.is_err());
        assert!(bus.publish("t", vec![]).await.is_ok());
    }
}
