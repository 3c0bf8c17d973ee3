use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared topic exchange all tick traffic goes through.
pub const EXCHANGE: &str = "network";

/// AMQP persistent delivery.
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One pub/sub handle per topic: ticks go out with persistent delivery to
/// `sync.<topic>`, and each subscriber holds its own durable queue bound
/// to the same routing key, so every subscriber sees every tick (fan-out,
/// not competing consumers).
pub struct NetworkPubSub {
    topic: String,
    connection: Connection,
    channel: lapin::Channel,
    consumer: Option<ConsumerHandle>,
}

struct ConsumerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NetworkPubSub {
    pub async fn connect(url: &str, topic: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .with_context(|| format!("connecting to bus at {url}"))?;

        let channel = connection
            .create_channel()
            .await
            .context("opening bus channel")?;

        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("declaring tick exchange")?;

        debug!(topic, "bus connected");

        Ok(Self {
            topic: topic.to_string(),
            connection,
            channel,
            consumer: None,
        })
    }

    fn routing_key(&self) -> String {
        format!("sync.{}", self.topic)
    }

    /// Publish one tick value, persistent, confirmed by the broker.
    pub async fn publish(&self, value: u64) -> Result<()> {
        let body = value.to_string();
        self.channel
            .basic_publish(
                EXCHANGE,
                &self.routing_key(),
                BasicPublishOptions::default(),
                body.as_bytes(),
                BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await
            .context("publishing tick")?
            .await
            .context("awaiting publish confirmation")?;

        debug!(topic = %self.topic, value, "tick published");
        Ok(())
    }

    /// Declare this subscriber's durable queue and start a consumer task
    /// invoking `callback` for each decoded tick.
    pub async fn subscribe<F>(&mut self, queue_prefix: &str, mut callback: F) -> Result<()>
    where
        F: FnMut(u64) + Send + 'static,
    {
        let queue_name = format!("{queue_prefix}-{}", self.topic);

        self.channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("declaring queue {queue_name}"))?;

        self.channel
            .queue_bind(
                &queue_name,
                EXCHANGE,
                &self.routing_key(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("binding queue {queue_name}"))?;

        let mut consumer = self
            .channel
            .basic_consume(
                &queue_name,
                &format!("{queue_name}-consumer"),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("consuming from {queue_name}"))?;

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let topic = self.topic.clone();

        let task = tokio::spawn(async move {
            info!(topic = %topic, "tick consumer started");
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    delivery = consumer.next() => match delivery {
                        Some(Ok(delivery)) => match parse_tick(&delivery.data) {
                            Ok(value) => callback(value),
                            Err(e) => warn!(topic = %topic, error = %e, "discarding malformed tick"),
                        },
                        Some(Err(e)) => warn!(topic = %topic, error = %e, "consumer error"),
                        None => {
                            debug!(topic = %topic, "consumer stream closed");
                            break;
                        }
                    },
                }
            }
        });

        self.consumer = Some(ConsumerHandle { cancel, task });
        Ok(())
    }

    /// Stop the consumer (bounded join) and close the connection.
    pub async fn close(mut self) {
        if let Some(handle) = self.consumer.take() {
            handle.cancel.cancel();
            match tokio::time::timeout(CLOSE_TIMEOUT, handle.task).await {
                Ok(Ok(())) => debug!(topic = %self.topic, "tick consumer stopped"),
                Ok(Err(e)) => error!(topic = %self.topic, error = %e, "tick consumer failed"),
                Err(_) => error!(topic = %self.topic, "tick consumer did not stop in time"),
            }
        }

        if let Err(e) = self.connection.close(0, "shutdown").await {
            warn!(topic = %self.topic, error = %e, "error closing bus connection");
        }
    }
}

/// Publishing side of a tick topic, narrow enough to fake in tests.
pub trait TickBus: Send + Sync {
    fn publish_tick(
        &self,
        value: u64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

impl TickBus for NetworkPubSub {
    async fn publish_tick(&self, value: u64) -> Result<()> {
        self.publish(value).await
    }
}

/// Tick bodies are UTF-8 decimal integers.
fn parse_tick(data: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(data).context("tick body is not UTF-8")?;
    text.trim()
        .parse::<u64>()
        .with_context(|| format!("tick body {text:?} is not an integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tick() {
        assert_eq!(parse_tick(b"42").expect("should parse"), 42);
        assert_eq!(parse_tick(b"0\n").expect("should parse"), 0);
        assert!(parse_tick(b"").is_err());
        assert!(parse_tick(b"-1").is_err());
        assert!(parse_tick(b"epoch").is_err());
        assert!(parse_tick(&[0xff, 0xfe]).is_err());
    }
}
