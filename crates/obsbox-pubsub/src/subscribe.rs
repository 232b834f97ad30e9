use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{BrokerConfig, PubSubError};

/// A message received from the broker, before storage-event decoding.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// What the session loop should do with an incoming packet.
#[derive(Debug)]
enum Step {
    /// ConnAck received; (re-)issue the subscribe request.
    Subscribe,
    /// SubAck received; the subscription is live and backoff resets.
    Confirmed,
    Forward(InboundMessage),
    Ignore,
}

fn on_packet(state: &mut SubscriptionState, packet: Packet) -> Step {
    match packet {
        Packet::ConnAck(_) => Step::Subscribe,
        Packet::SubAck(_) => {
            *state = SubscriptionState::Subscribed;
            Step::Confirmed
        }
        Packet::Publish(publish) => Step::Forward(InboundMessage {
            topic: publish.topic.clone(),
            payload: Bytes::from(publish.payload.to_vec()),
        }),
        _ => Step::Ignore,
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub broker: BrokerConfig,
    /// Wildcard pattern re-subscribed on every reconnect.
    pub topic_pattern: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

/// Long-lived subscription to a wildcard topic pattern. Broker loss moves
/// the state machine back to `Disconnected` and reconnects with exponential
/// backoff, re-subscribing on the new session.
pub struct Subscriber {
    config: SubscriberConfig,
}

impl Subscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        Self { config }
    }

    /// Runs until the shutdown signal flips to `true`. Inbound publishes are
    /// forwarded to `tx`; a closed receiver also terminates the loop.
    pub async fn run(
        &self,
        tx: mpsc::Sender<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PubSubError> {
        let mut state = SubscriptionState::Disconnected;
        let mut backoff = self.config.reconnect_initial;

        loop {
            if *shutdown.borrow() {
                info!("subscriber shutting down");
                return Ok(());
            }

            state = SubscriptionState::Connecting;
            debug!(pattern = %self.config.topic_pattern, "connecting to broker");

            let mut options = MqttOptions::new(
                &self.config.broker.client_id,
                &self.config.broker.host,
                self.config.broker.port,
            );
            options.set_keep_alive(Duration::from_secs(30));
            if let (Some(username), Some(password)) =
                (&self.config.broker.username, &self.config.broker.password)
            {
                options.set_credentials(username, password);
            }

            let (client, mut eventloop) = AsyncClient::new(options, 32);

            loop {
                tokio::select! {
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(packet)) => match on_packet(&mut state, packet) {
                            Step::Subscribe => {
                                if let Err(err) = client
                                    .subscribe(&self.config.topic_pattern, QoS::AtLeastOnce)
                                    .await
                                {
                                    warn!(error = %err, "subscribe request failed");
                                    break;
                                }
                            }
                            Step::Confirmed => {
                                backoff = self.config.reconnect_initial;
                                info!(pattern = %self.config.topic_pattern, "subscribed");
                            }
                            Step::Forward(message) => {
                                if tx.send(message).await.is_err() {
                                    info!("dispatcher closed, stopping subscriber");
                                    return Ok(());
                                }
                            }
                            Step::Ignore => {}
                        },
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, state = ?state, "broker connection lost");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("subscriber shutting down");
                            return Ok(());
                        }
                    }
                }
            }

            state = SubscriptionState::Disconnected;
            debug!(delay_ms = backoff.as_millis() as u64, "reconnect backoff");
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, self.config.reconnect_max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::mqttbytes::v4::{ConnAck, ConnectReturnCode, Publish, SubAck};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn packets_drive_the_subscription_state_machine() {
        let mut state = SubscriptionState::Connecting;

        let connack = ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        };
        assert!(matches!(
            on_packet(&mut state, Packet::ConnAck(connack)),
            Step::Subscribe
        ));
        assert_eq!(state, SubscriptionState::Connecting);

        let suback = SubAck {
            pkid: 1,
            return_codes: Vec::new(),
        };
        assert!(matches!(
            on_packet(&mut state, Packet::SubAck(suback)),
            Step::Confirmed
        ));
        assert_eq!(state, SubscriptionState::Subscribed);

        let publish = Publish::new("storage-events/incoming", QoS::AtLeastOnce, &b"{}"[..]);
        match on_packet(&mut state, Packet::Publish(publish)) {
            Step::Forward(message) => {
                assert_eq!(message.topic, "storage-events/incoming");
                assert_eq!(message.payload, Bytes::from_static(b"{}"));
            }
            other => panic!("expected Forward, got {other:?}"),
        }

        assert!(matches!(
            on_packet(&mut state, Packet::PingResp),
            Step::Ignore
        ));
        assert_eq!(state, SubscriptionState::Subscribed);
    }

    #[test]
    fn reconnect_backoff_doubles_and_caps() {
        let max = Duration::from_millis(80);
        let mut backoff = Duration::from_millis(10);
        backoff = next_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_millis(20));
        backoff = next_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_millis(40));
        backoff = next_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_millis(80));
        assert_eq!(next_backoff(backoff, max), max);
    }

    #[tokio::test]
    async fn reconnects_after_connection_loss_until_shutdown() {
        // A listener that accepts and immediately drops every connection,
        // forcing the subscriber through its reconnect path.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                }
            }
        });

        let broker =
            BrokerConfig::from_url(&format!("mqtt://127.0.0.1:{port}"), "test-subscriber").unwrap();
        let subscriber = Subscriber::new(SubscriberConfig {
            broker,
            topic_pattern: "storage-events/#".to_string(),
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(20),
        });

        let (tx, _rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { subscriber.run(tx, shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(
            accepted.load(Ordering::SeqCst) >= 2,
            "subscriber never reconnected"
        );

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("subscriber ignored shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}
