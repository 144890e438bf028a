use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::cli::config::BrokerSettings;
use crate::crawler::dispatcher::{Lane, TaskSink};
use crate::crawler::task::Task;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to broker at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: lapin::Error,
    },

    #[error("broker channel is closed")]
    Closed,

    #[error("failed to serialize task: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("broker protocol error: {0}")]
    Protocol(#[from] lapin::Error),
}

/// Broker URL without its password, for logs and errors
fn redact(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

/// Properties of every published task: persistent JSON
pub fn persistent_properties() -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type("application/json".into())
}

/// Settles one delivery with the broker
#[async_trait]
pub trait DeliveryAck: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    /// Negative acknowledgement without requeue
    async fn reject(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl DeliveryAck for Acker {
    async fn ack(&self) -> Result<(), TransportError> {
        Acker::ack(self, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self) -> Result<(), TransportError> {
        self.nack(BasicNackOptions {
            multiple: false,
            requeue: false,
        })
        .await?;
        Ok(())
    }
}

/// Parse one delivery and hand it to `sink`.
///
/// A body that is not a task is rejected without requeue. A task is acked only
/// after the sink has taken it.
pub async fn handle_delivery(
    data: &[u8],
    ack: &dyn DeliveryAck,
    sink: &dyn TaskSink,
) -> Result<Option<Lane>, TransportError> {
    let task = match Task::from_bytes(data) {
        Ok(task) => task,
        Err(e) => {
            warn!("Rejecting malformed message ({} bytes): {}", data.len(), e);
            ack.reject().await?;
            return Ok(None);
        }
    };

    debug!(topic = %task.topic, "Received task");
    let lane = sink.submit(task).await;
    ack.ack().await?;
    Ok(Some(lane))
}

struct Link {
    connection: Connection,
    channel: Channel,
}

/// AMQP transport for tasks: a durable topic exchange with one durable queue
pub struct TransportChannel {
    settings: BrokerSettings,
    link: Mutex<Option<Link>>,
    closed: AtomicBool,
}

impl TransportChannel {
    /// Connect and declare the topology. Failing here is fatal for the caller.
    pub async fn connect(settings: BrokerSettings) -> Result<Self, TransportError> {
        let transport = Self {
            settings,
            link: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        transport.open().await?;
        Ok(transport)
    }

    async fn open(&self) -> Result<Channel, TransportError> {
        let url = redact(&self.settings.url);
        let connection = Connection::connect(&self.settings.url, ConnectionProperties::default())
            .await
            .map_err(|source| TransportError::Connect {
                url: url.clone(),
                source,
            })?;
        connection.on_error(|e| error!("Broker connection error: {}", e));

        let channel = connection.create_channel().await?;
        self.declare_topology(&channel).await?;

        info!("Connected to broker at {}", url);
        *self.link.lock().await = Some(Link {
            connection,
            channel: channel.clone(),
        });
        Ok(channel)
    }

    async fn declare_topology(&self, channel: &Channel) -> Result<(), TransportError> {
        channel
            .exchange_declare(
                &self.settings.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &self.settings.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for key in &self.settings.routing_keys {
            channel
                .queue_bind(
                    &self.settings.queue,
                    &self.settings.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            debug!("Bound {} to {} with {}", self.settings.queue, self.settings.exchange, key);
        }

        channel
            .basic_qos(self.settings.prefetch, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    /// Current channel if it is still usable
    async fn live_channel(&self) -> Option<Channel> {
        let link = self.link.lock().await;
        link.as_ref()
            .filter(|l| l.connection.status().connected() && l.channel.status().connected())
            .map(|l| l.channel.clone())
    }

    /// Reopen until it works or the transport is closed
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Channel> {
        let interval = Duration::from_secs(self.settings.reconnect_interval_secs);

        loop {
            if self.closed.load(Ordering::SeqCst) || *shutdown.borrow() {
                return None;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return None,
            }

            match self.open().await {
                Ok(channel) => return Some(channel),
                Err(e) => warn!("Reconnect failed, retrying in {:?}: {}", interval, e),
            }
        }
    }

    /// Publish `task` on its topic with persistent delivery
    pub async fn publish(&self, task: &Task) -> Result<(), TransportError> {
        let channel = self.live_channel().await.ok_or(TransportError::Closed)?;
        let body = task.to_bytes()?;

        channel
            .basic_publish(
                &self.settings.exchange,
                &task.topic,
                BasicPublishOptions::default(),
                &body,
                persistent_properties(),
            )
            .await?
            .await?;

        info!(topic = %task.topic, "Published task");
        Ok(())
    }

    /// Feed deliveries to `sink` until shutdown, reconnecting whenever the
    /// channel drops
    pub async fn consume(&self, sink: Arc<dyn TaskSink>, mut shutdown: watch::Receiver<bool>) {
        let tag = format!("agent-{}", Uuid::new_v4());

        loop {
            let channel = match self.live_channel().await {
                Some(channel) => channel,
                None => match self.reconnect(&mut shutdown).await {
                    Some(channel) => channel,
                    None => break,
                },
            };

            let mut consumer = match channel
                .basic_consume(
                    &self.settings.queue,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    warn!("Could not start consuming: {}", e);
                    *self.link.lock().await = None;
                    continue;
                }
            };
            info!("Consuming from {}", self.settings.queue);

            loop {
                let next = tokio::select! {
                    next = consumer.next() => next,
                    _ = shutdown.changed() => None,
                };

                match next {
                    Some(Ok(delivery)) => {
                        if let Err(e) = handle_delivery(&delivery.data, &delivery.acker, sink.as_ref()).await {
                            warn!("Could not settle delivery: {}", e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Broker consumer error: {}", e);
                        break;
                    }
                    None => break,
                }
            }

            if self.closed.load(Ordering::SeqCst) || *shutdown.borrow() {
                break;
            }
            warn!("Broker channel dropped, reconnecting");
            *self.link.lock().await = None;
        }

        info!("Stopped consuming");
    }

    /// Close the connection; no reconnect happens afterwards
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(link) = self.link.lock().await.take() {
            if let Err(e) = link.connection.close(200, "agent shutdown").await {
                debug!("Error closing broker connection: {}", e);
            }
        }
    }
}
