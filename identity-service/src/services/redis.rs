use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::time::Duration;

use super::events::EventBus;
use super::oauth::OAuthStateStore;
use super::store::{bounded, HealthCheck};
use super::ServiceError;
use crate::config::RedisConfig;
use crate::models::DomainEvent;

/// Redis-backed OAuth state store and event bus.
///
/// Events go to one stream per type, `{prefix}:{event_type}`, with the
/// event id as a field so consumers can dedupe redeliveries. Streams are
/// never trimmed here; entries a consumer group has not acknowledged must
/// survive, so retention belongs to the consumers.
#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
    stream_prefix: String,
    timeout: Duration,
}

impl RedisService {
    pub async fn new(config: &RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            stream_prefix: config.stream_prefix.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    fn state_key(state: &str) -> String {
        format!("oauth_state:{}", state)
    }

    fn stream_key(&self, event: &DomainEvent) -> String {
        format!("{}:{}", self.stream_prefix, event.event_type.as_str())
    }
}

#[async_trait]
impl HealthCheck for RedisService {
    fn component(&self) -> &'static str {
        "redis"
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        bounded("redis", self.timeout, async {
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map_err(ServiceError::from)
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl OAuthStateStore for RedisService {
    async fn save_state(
        &self,
        state: &str,
        code_verifier: &str,
        ttl_seconds: u64,
    ) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        let key = Self::state_key(state);

        let stored: Option<String> = bounded("redis", self.timeout, async {
            redis::cmd("SET")
                .arg(&key)
                .arg(code_verifier)
                .arg("NX")
                .arg("EX")
                .arg(ttl_seconds)
                .query_async(&mut conn)
                .await
                .map_err(ServiceError::from)
        })
        .await?;

        match stored {
            Some(_) => Ok(()),
            None => Err(ServiceError::Conflict("OAuth state collision".to_string())),
        }
    }

    /// GETDEL makes consumption single-use even under concurrent callbacks.
    async fn consume_state(&self, state: &str) -> Result<Option<String>, ServiceError> {
        let mut conn = self.manager.clone();
        let key = Self::state_key(state);

        bounded("redis", self.timeout, async {
            redis::cmd("GETDEL")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(ServiceError::from)
        })
        .await
    }
}

#[async_trait]
impl EventBus for RedisService {
    async fn publish(&self, event: &DomainEvent) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        let stream = self.stream_key(event);
        let command = append_command(&stream, event)?;

        let entry_id: String = bounded("redis", self.timeout, async {
            command
                .query_async(&mut conn)
                .await
                .map_err(ServiceError::from)
        })
        .await?;

        tracing::debug!(stream = %stream, entry_id = %entry_id, "Appended event to stream");
        Ok(())
    }
}

/// `XADD stream * event_id .. event_type .. event ..` without a length cap.
fn append_command(stream: &str, event: &DomainEvent) -> Result<redis::Cmd, ServiceError> {
    let body = serde_json::to_string(event)
        .map_err(|e| anyhow::anyhow!("Failed to serialize event: {}", e))?;
    let mut command = redis::cmd("XADD");
    command
        .arg(stream)
        .arg("*")
        .arg("event_id")
        .arg(event.event_id.to_string())
        .arg("event_type")
        .arg(event.event_type.as_str())
        .arg("event")
        .arg(body);
    Ok(command)
}
