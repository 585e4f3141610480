use std::{fmt::Display, panic::AssertUnwindSafe, sync::Arc};

use futures_util::{FutureExt, Stream, StreamExt};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    message::Delivery,
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::constants::REPLY_SUCCESS,
    types::FieldTable,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    handler::MessageHandler,
    models::{
        event::NotificationEvent,
        topology::{EXCHANGE_NAME, QueueTopology},
    },
    utils::panic_message,
};

const CONSUMER_TAG: &str = "notification_worker";

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to connect to RabbitMQ: {0}")]
    Connect(#[source] lapin::Error),

    #[error("RabbitMQ channel creation failed: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare exchange '{exchange}': {source}")]
    ExchangeDeclare {
        exchange: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to declare queue '{queue}': {source}")]
    QueueDeclare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to bind queue '{queue}' to {exchange}/{routing_key}: {source}")]
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
        #[source]
        source: lapin::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to start consuming from '{queue}': {source}")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("broker closed the delivery stream for '{0}'")]
    DeliveryStreamEnded(String),

    #[error("failed to close RabbitMQ {resource}: {source}")]
    Shutdown {
        resource: &'static str,
        #[source]
        source: lapin::Error,
    },
}

/// Lifecycle of a [`RabbitMqClient`], observable through
/// [`RabbitMqClient::subscribe_state`] after `start` takes ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connected,
    Consuming,
    ShuttingDown,
    Closed,
}

/// A received message, detached from the broker's delivery type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
        }
    }
}

impl From<Delivery> for InboundMessage {
    fn from(delivery: Delivery) -> Self {
        Self {
            routing_key: delivery.routing_key.as_str().to_string(),
            payload: delivery.data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    StreamEnded,
}

impl LoopExit {
    /// Result of a consume run once teardown has been attempted. A lost
    /// delivery stream is reported ahead of any teardown failure it caused.
    pub fn resolve(
        self,
        queue: String,
        teardown: Result<(), ConsumerError>,
    ) -> Result<(), ConsumerError> {
        match self {
            LoopExit::Cancelled => teardown,
            LoopExit::StreamEnded => {
                if let Err(e) = teardown {
                    debug!(error = %e, "Teardown after lost delivery stream also failed");
                }
                Err(ConsumerError::DeliveryStreamEnded(queue))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub exit: LoopExit,
    pub handled: u64,
    pub panicked: u64,
    pub stream_errors: u64,
}

/// Feeds deliveries to `handler` one at a time, in order, until `cancel` fires
/// or the stream ends.
///
/// Cancellation is checked before every receive but never interrupts a handler
/// that is already running. A handler panic is logged and the loop moves on.
pub async fn consume_deliveries<S, E, H>(
    mut deliveries: S,
    handler: &H,
    cancel: &CancellationToken,
) -> ConsumeSummary
where
    S: Stream<Item = Result<InboundMessage, E>> + Unpin,
    E: Display,
    H: MessageHandler + ?Sized,
{
    let mut summary = ConsumeSummary {
        exit: LoopExit::StreamEnded,
        handled: 0,
        panicked: 0,
        stream_errors: 0,
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                summary.exit = LoopExit::Cancelled;
                break;
            }
            next = deliveries.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                summary.stream_errors += 1;
                warn!(error = %e, "Failed to receive delivery");
                continue;
            }
            None => {
                summary.exit = LoopExit::StreamEnded;
                break;
            }
        };

        debug!(
            event = %message.routing_key,
            payload = %String::from_utf8_lossy(&message.payload),
            "Received message"
        );

        let outcome = AssertUnwindSafe(handler.handle(&message.routing_key, &message.payload))
            .catch_unwind()
            .await;

        summary.handled += 1;

        if let Err(panic) = outcome {
            summary.panicked += 1;
            error!(
                event = %message.routing_key,
                panic = %panic_message(panic.as_ref()),
                "Notification handler panicked"
            );
        }
    }

    summary
}

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    topology: QueueTopology,
    handler: Arc<dyn MessageHandler>,
    state: watch::Sender<ConsumerState>,
}

impl RabbitMqClient {
    /// Dials the broker and declares the `events` exchange, the durable queue and
    /// its bindings. Declarations are idempotent, so this is safe on every start.
    pub async fn connect(
        rabbitmq_url: &str,
        topology: QueueTopology,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, TopologyError> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(TopologyError::Connect)?;

        info!("RabbitMQ connection established");

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly(&connection).await;
                return Err(TopologyError::Channel(e));
            }
        };

        debug!("RabbitMQ channel created");

        if let Err(e) = declare_topology(&channel, &topology).await {
            close_quietly(&connection).await;
            return Err(e);
        }

        Ok(Self {
            connection,
            channel,
            topology,
            handler,
            state: watch::Sender::new(ConsumerState::Connected),
        })
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Consumes with automatic acknowledgment until `cancel` fires, then closes
    /// the channel and connection. Ends in `DeliveryStreamEnded` if the broker
    /// stops delivering first.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        let queue = self.topology.queue_name().to_string();

        let consumer = match self
            .channel
            .basic_consume(
                &queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to start consuming messages");
                if let Err(teardown) = self.shutdown().await {
                    debug!(error = %teardown, "Teardown after consume failure also failed");
                }
                return Err(ConsumerError::Consume { queue, source: e });
            }
        };

        self.state.send_replace(ConsumerState::Consuming);
        info!(queue = %queue, "Notification consumer listening on queue");

        let deliveries = consumer.map(|delivery| delivery.map(InboundMessage::from));
        let summary = consume_deliveries(deliveries, self.handler.as_ref(), &cancel).await;

        info!(
            handled = summary.handled,
            panicked = summary.panicked,
            stream_errors = summary.stream_errors,
            "Stopping notification consumer..."
        );

        if summary.exit == LoopExit::StreamEnded {
            error!(queue = %queue, "Delivery stream ended unexpectedly");
        }

        let teardown = self.shutdown().await;
        summary.exit.resolve(queue, teardown)
    }

    /// Closes the channel, then the connection. Both are attempted; the first
    /// failure is returned.
    async fn shutdown(&self) -> Result<(), ConsumerError> {
        self.state.send_replace(ConsumerState::ShuttingDown);

        let channel_result = self
            .channel
            .close(REPLY_SUCCESS, "consumer shutting down")
            .await
            .map_err(|e| ConsumerError::Shutdown {
                resource: "channel",
                source: e,
            });

        let connection_result = self
            .connection
            .close(REPLY_SUCCESS, "consumer shutting down")
            .await
            .map_err(|e| ConsumerError::Shutdown {
                resource: "connection",
                source: e,
            });

        self.state.send_replace(ConsumerState::Closed);

        match (channel_result, connection_result) {
            (Err(e), _) | (Ok(()), Err(e)) => {
                warn!(error = %e, "RabbitMQ teardown incomplete");
                Err(e)
            }
            (Ok(()), Ok(())) => {
                info!("RabbitMQ connection closed");
                Ok(())
            }
        }
    }
}

async fn declare_topology(channel: &Channel, topology: &QueueTopology) -> Result<(), TopologyError> {
    channel
        .exchange_declare(
            EXCHANGE_NAME,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| TopologyError::ExchangeDeclare {
            exchange: EXCHANGE_NAME.to_string(),
            source: e,
        })?;

    info!(exchange = EXCHANGE_NAME, "Ensured exchange");

    channel
        .queue_declare(
            topology.queue_name(),
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| TopologyError::QueueDeclare {
            queue: topology.queue_name().to_string(),
            source: e,
        })?;

    info!(queue = topology.queue_name(), "Declared queue");

    for routing_key in topology.binding_keys() {
        channel
            .queue_bind(
                topology.queue_name(),
                EXCHANGE_NAME,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError::Bind {
                queue: topology.queue_name().to_string(),
                exchange: EXCHANGE_NAME.to_string(),
                routing_key: routing_key.clone(),
                source: e,
            })?;

        info!(
            queue = topology.queue_name(),
            exchange = EXCHANGE_NAME,
            routing_key = %routing_key,
            default = topology.uses_default_binding(),
            "Bound queue"
        );
    }

    Ok(())
}

async fn close_quietly(connection: &Connection) {
    if let Err(e) = connection.close(REPLY_SUCCESS, "topology setup failed").await {
        debug!(error = %e, "Failed to close RabbitMQ connection after setup error");
    }
}

/// Publishes notification events to the `events` exchange.
pub struct EventPublisher {
    connection: Connection,
    channel: Channel,
}

impl EventPublisher {
    pub async fn connect(rabbitmq_url: &str) -> Result<Self, TopologyError> {
        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(TopologyError::Connect)?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly(&connection).await;
                return Err(TopologyError::Channel(e));
            }
        };

        let declared = channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError::ExchangeDeclare {
                exchange: EXCHANGE_NAME.to_string(),
                source: e,
            });

        if let Err(e) = declared {
            close_quietly(&connection).await;
            return Err(e);
        }

        Ok(Self {
            connection,
            channel,
        })
    }

    pub async fn publish(
        &self,
        routing_key: &str,
        event: &NotificationEvent,
    ) -> Result<(), anyhow::Error> {
        let payload = serde_json::to_vec(event)?;
        self.publish_raw(routing_key, &payload).await
    }

    pub async fn publish_raw(&self, routing_key: &str, payload: &[u8]) -> Result<(), anyhow::Error> {
        self.channel
            .basic_publish(
                EXCHANGE_NAME,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await?;

        debug!(exchange = EXCHANGE_NAME, routing_key, "Published notification event");

        Ok(())
    }

    pub async fn close(self) -> Result<(), anyhow::Error> {
        self.channel.close(REPLY_SUCCESS, "publisher done").await?;
        self.connection.close(REPLY_SUCCESS, "publisher done").await?;
        Ok(())
    }
}
