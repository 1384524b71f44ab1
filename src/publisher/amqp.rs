use super::{TransactionPublisher, QUEUE_BEGIN_TRANSACTION, QUEUE_END_TRANSACTION};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Mutex;
use tracing::{debug, info};

const DEAD_LETTER_EXCHANGE: &str = "rpc.dlx";
const CONTENT_TYPE_JSON: &str = "application/json";

struct Session {
    connection: Connection,
    channel: Channel,
}

/// Publishes on the default exchange through a single channel; the routing key
/// is the queue name.
pub struct AmqpPublisher {
    uri: String,
    session: Mutex<Option<Session>>,
}

impl AmqpPublisher {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            session: Mutex::new(None),
        }
    }

    fn channel(&self) -> Result<Channel> {
        self.session
            .lock()
            .map_err(|e| anyhow!("amqp session lock poisoned: {}", e))?
            .as_ref()
            .map(|session| session.channel.clone())
            .ok_or_else(|| anyhow!("not connected to the message bus"))
    }
}

pub(crate) fn queue_arguments() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
    );
    args
}

pub(crate) fn queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: false,
        auto_delete: true,
        exclusive: false,
        nowait: false,
        passive: false,
    }
}

#[async_trait]
impl TransactionPublisher for AmqpPublisher {
    async fn connect(&self) -> Result<()> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("unable to connect to the message bus: {}", e))?;
        let channel = connection.create_channel().await?;
        for queue in [QUEUE_BEGIN_TRANSACTION, QUEUE_END_TRANSACTION] {
            channel
                .queue_declare(queue, queue_options(), queue_arguments())
                .await
                .map_err(|e| anyhow!("unable to declare queue {}: {}", queue, e))?;
        }
        self.session
            .lock()
            .map_err(|e| anyhow!("amqp session lock poisoned: {}", e))?
            .replace(Session {
                connection,
                channel,
            });
        info!("amqp publisher: connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .map_err(|e| anyhow!("amqp session lock poisoned: {}", e))?
            .take();
        if let Some(session) = session {
            session.channel.close(200, "bye").await?;
            session.connection.close(200, "bye").await?;
        }
        Ok(())
    }

    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let channel = self.channel()?;
        channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type(CONTENT_TYPE_JSON.into()),
            )
            .await?
            .await?;
        debug!(routing_key, bytes = body.len(), "amqp publisher: published");
        Ok(())
    }
}
