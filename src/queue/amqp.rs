//! AMQP 0-9-1 broker adapter (RabbitMQ).
//!
//! The publisher side keeps one lazily opened connection/channel with
//! publisher confirms enabled and reuses it across a batch. The consumer
//! side runs a prefetch-1 manual-ack loop that reconnects after a
//! connection loss.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DeliveryOutcome, Publisher, QueueMessage};
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

const CONTENT_TYPE: &str = "application/json";

/// Pause before reconnecting the consume loop.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Processes one delivery body and decides its disposition.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> DeliveryOutcome;
}

/// RabbitMQ connection for one role (producer or consumer).
pub struct AmqpBroker {
    config: BrokerConfig,
    publisher: Mutex<Option<(Connection, Channel)>>,
}

impl AmqpBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            publisher: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    async fn connect(&self) -> Result<Connection, BrokerError> {
        let connection =
            Connection::connect_uri(build_uri(&self.config), ConnectionProperties::default())
                .await
                .map_err(|e| BrokerError::Connect {
                    host: self.config.host.clone(),
                    port: self.config.port,
                    reason: e.to_string(),
                })?;
        info!(host = %self.config.host, port = self.config.port, "Connected to broker");
        Ok(connection)
    }

    async fn open_channel(&self, connection: &Connection) -> Result<Channel, BrokerError> {
        connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connect {
                host: self.config.host.clone(),
                port: self.config.port,
                reason: format!("channel: {e}"),
            })
    }

    /// Same arguments every time, so repeat declarations are no-ops.
    async fn declare_on(&self, channel: &Channel, passive: bool) -> Result<u32, BrokerError> {
        let queue = channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    passive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: self.config.queue.clone(),
                reason: e.to_string(),
            })?;
        Ok(queue.message_count())
    }

    /// The cached publisher channel, opening a fresh one if needed.
    async fn publisher_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.publisher.lock().await;
        if let Some((connection, channel)) = guard.as_ref() {
            if connection.status().connected() && channel.status().connected() {
                return Ok(channel.clone());
            }
            debug!("Cached broker channel is closed, reopening");
        }

        let connection = self.connect().await?;
        let channel = self.open_channel(&connection).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connect {
                host: self.config.host.clone(),
                port: self.config.port,
                reason: format!("confirm_select: {e}"),
            })?;
        self.declare_on(&channel, false).await?;
        *guard = Some((connection, channel.clone()));
        Ok(channel)
    }

    async fn reset_publisher(&self) {
        if let Some((connection, _)) = self.publisher.lock().await.take() {
            if let Err(e) = connection.close(200, "reconnecting").await {
                debug!(error = %e, "Ignoring error while closing stale connection");
            }
        }
    }

    async fn try_publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let publish_err = |e: lapin::Error| BrokerError::Publish {
            queue: self.config.queue.clone(),
            reason: e.to_string(),
        };

        let channel = self.publisher_channel().await?;
        let confirmation = channel
            .basic_publish(
                "",
                &self.config.queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;

        if confirmation.is_nack() {
            return Err(BrokerError::Nacked {
                queue: self.config.queue.clone(),
            });
        }
        Ok(())
    }

    /// Number of ready messages, via a passive declaration.
    pub async fn queue_depth(&self) -> Result<u32, BrokerError> {
        let connection = self.connect().await?;
        let channel = self.open_channel(&connection).await?;
        let depth = self.declare_on(&channel, true).await;
        if let Err(e) = connection.close(200, "done").await {
            debug!(error = %e, "Ignoring error while closing queue-depth connection");
        }
        depth
    }

    /// Close the cached publisher connection, if any.
    pub async fn close(&self) {
        self.reset_publisher().await;
    }

    /// Run the consume loop until `shutdown` resolves.
    ///
    /// Each delivery is handled to completion before the next is taken
    /// (prefetch 1). A lost connection is re-established after a short
    /// delay; the broker redelivers whatever was unacknowledged. Only the
    /// first connection attempt is fatal.
    pub async fn consume(
        &self,
        handler: &dyn DeliveryHandler,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BrokerError> {
        tokio::pin!(shutdown);
        let mut first_attempt = true;

        loop {
            match self.consume_session(handler, shutdown.as_mut()).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("Consumer stopped");
                    return Ok(());
                }
                Ok(SessionEnd::Lost(reason)) => {
                    warn!(reason = %reason, "Broker connection lost, reconnecting");
                }
                Err(e) if first_attempt => return Err(e),
                Err(e) => {
                    error!(error = %e, "Broker reconnect failed");
                }
            }
            first_attempt = false;

            tokio::select! {
                _ = shutdown.as_mut() => return Ok(()),
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn consume_session(
        &self,
        handler: &dyn DeliveryHandler,
        mut shutdown: Pin<&mut impl Future<Output = ()>>,
    ) -> Result<SessionEnd, BrokerError> {
        let connection = self.connect().await?;
        let channel = self.open_channel(&connection).await?;
        self.declare_on(&channel, false).await?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| self.consume_err(e))?;
        let consumer_tag = format!("mail-triage-{}", Uuid::new_v4());
        let mut deliveries = channel
            .basic_consume(
                &self.config.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.consume_err(e))?;
        info!(queue = %self.config.queue, consumer_tag = %consumer_tag, "Waiting for messages");

        loop {
            let next = tokio::select! {
                _ = shutdown.as_mut() => {
                    if let Err(e) = connection.close(200, "shutdown").await {
                        debug!(error = %e, "Ignoring error while closing consumer connection");
                    }
                    return Ok(SessionEnd::Shutdown);
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Ok(SessionEnd::Lost(e.to_string())),
                None => return Ok(SessionEnd::Lost("consumer stream ended".into())),
            };

            let tag = delivery.delivery_tag;
            let outcome = handler.handle(&delivery.data).await;
            debug!(delivery_tag = tag, outcome = outcome.label(), "Settling delivery");

            let settled = match requeue_flag(outcome) {
                None => delivery.acker.ack(BasicAckOptions::default()).await,
                Some(requeue) => {
                    delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue,
                            ..BasicNackOptions::default()
                        })
                        .await
                }
            };
            if let Err(e) = settled {
                let e = BrokerError::Settle {
                    delivery_tag: tag,
                    reason: e.to_string(),
                };
                return Ok(SessionEnd::Lost(e.to_string()));
            }
        }
    }

    fn consume_err(&self, e: lapin::Error) -> BrokerError {
        BrokerError::Consume {
            queue: self.config.queue.clone(),
            reason: e.to_string(),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

#[async_trait]
impl Publisher for AmqpBroker {
    async fn declare(&self) -> Result<(), BrokerError> {
        let channel = self.publisher_channel().await?;
        self.declare_on(&channel, false).await?;
        Ok(())
    }

    async fn publish(&self, message: &QueueMessage) -> Result<(), BrokerError> {
        let payload = message.to_bytes()?;
        match self.try_publish(&payload).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "Publish failed, retrying on a fresh connection");
                self.reset_publisher().await;
                self.try_publish(&payload).await
            }
        }
    }
}

/// `None` acknowledges; `Some(requeue)` negatively acknowledges.
fn requeue_flag(outcome: DeliveryOutcome) -> Option<bool> {
    match outcome {
        DeliveryOutcome::Acknowledge => None,
        DeliveryOutcome::RejectDiscard => Some(false),
        DeliveryOutcome::RejectRequeue => Some(true),
    }
}

fn build_uri(config: &BrokerConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = config.host.clone();
    uri.authority.port = config.port;
    uri.authority.userinfo.username = config.username.clone();
    uri.authority.userinfo.password = config.password.expose_secret().to_string();
    uri.query.heartbeat = Some(u16::try_from(config.heartbeat.as_secs()).unwrap_or(u16::MAX));
    uri
}
