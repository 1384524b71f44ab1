pub mod amqp;

use anyhow::Result;
use async_trait::async_trait;


pub const QUEUE_BEGIN_TRANSACTION: &str = "begin_transaction";
pub const QUEUE_END_TRANSACTION: &str = "end_transaction";

/// Delivers encoded transaction events to the message bus, at most once.
#[async_trait]
pub trait TransactionPublisher: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()>;
}
