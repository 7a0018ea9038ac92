use super::{JobEnvelope, QueueBroker, QueueError, QueueResult};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

/// Redis list broker: producers `LPUSH` to `queue:{name}`, workers `RPOP`.
#[derive(Clone)]
pub struct RedisBroker {
    connection: MultiplexedConnection,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(Self { connection })
    }

    #[must_use]
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    fn list_key(queue: &str) -> String {
        format!("queue:{queue}")
    }
}

#[async_trait]
impl QueueBroker for RedisBroker {
    async fn push(&self, queue: &str, envelope: &JobEnvelope) -> QueueResult<()> {
        let body = serde_json::to_string(envelope)?;
        let mut con = self.connection.clone();
        let _: i64 = con
            .lpush(Self::list_key(queue), body)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<JobEnvelope>> {
        let mut con = self.connection.clone();
        let body: Option<String> = con
            .rpop(Self::list_key(queue), None)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        body.map(|b| serde_json::from_str(&b)).transpose().map_err(QueueError::from)
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}
