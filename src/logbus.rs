//! Append-only per-deployment log stream over redis lists. Producers push
//! JSON-encoded events and never block; consumers poll `[offset, end)` slices
//! on a fixed cadence and stop at the terminal `done` event. Streams expire
//! an hour after the last write.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

/// How often consumers poll for new records.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive empty polls before a consumer gives up: 20 minutes of silence.
pub const MAX_EMPTY_READS: u32 = 2400;

const STREAM_TTL_SECONDS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Info,
    Log,
    Success,
    Error,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEvent {
    pub fn message(kind: EventType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            success: None,
            deployment: None,
            error: None,
        }
    }

    pub fn done_success(deployment: Value) -> Self {
        Self {
            kind: EventType::Done,
            message: None,
            success: Some(true),
            deployment: Some(deployment),
            error: None,
        }
    }

    pub fn done_failure(error: impl Into<String>) -> Self {
        Self {
            kind: EventType::Done,
            message: None,
            success: Some(false),
            deployment: None,
            error: Some(error.into()),
        }
    }
}

/// A raw record is terminal when it parses as a `done` event. Unparsable
/// records are forwarded but never terminate a stream.
pub fn is_done_record(raw: &str) -> bool {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|value| value.get("type").and_then(Value::as_str).map(|t| t == "done"))
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct LogBus {
    redis: ConnectionManager,
}

impl LogBus {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn key(deployment_id: &str) -> String {
        format!("logs:{deployment_id}")
    }

    pub async fn append(&self, deployment_id: &str, event: &LogEvent) -> Result<()> {
        let key = Self::key(deployment_id);
        let record = serde_json::to_string(event)?;
        debug!(deployment_id, kind = ?event.kind, "log bus append");

        let mut redis = self.redis.clone();
        let _: i64 = redis.rpush(&key, record).await?;
        let _: bool = redis.expire(&key, STREAM_TTL_SECONDS).await?;
        Ok(())
    }

    pub async fn info(&self, deployment_id: &str, message: impl Into<String>) -> Result<()> {
        self.append(deployment_id, &LogEvent::message(EventType::Info, message))
            .await
    }

    pub async fn log(&self, deployment_id: &str, message: impl Into<String>) -> Result<()> {
        self.append(deployment_id, &LogEvent::message(EventType::Log, message))
            .await
    }

    pub async fn success(&self, deployment_id: &str, message: impl Into<String>) -> Result<()> {
        self.append(
            deployment_id,
            &LogEvent::message(EventType::Success, message),
        )
        .await
    }

    pub async fn error(&self, deployment_id: &str, message: impl Into<String>) -> Result<()> {
        self.append(deployment_id, &LogEvent::message(EventType::Error, message))
            .await
    }

    /// Raw JSON records from `offset` to the end of the stream. The caller
    /// advances its own offset by the number of records it consumed.
    pub async fn range(&self, deployment_id: &str, offset: usize) -> Result<Vec<String>> {
        let mut redis = self.redis.clone();
        let records: Vec<String> = redis
            .lrange(Self::key(deployment_id), offset as isize, -1)
            .await?;
        Ok(records)
    }

    /// Just the human-readable `message` fields of the whole stream, for the
    /// historical logs endpoint while a deployment is still in flight.
    pub async fn messages(&self, deployment_id: &str) -> Result<Vec<String>> {
        let records = self.range(deployment_id, 0).await?;

        Ok(records
            .into_iter()
            .map(|raw| {
                serde_json::from_str::<Value>(&raw)
                    .ok()
                    .and_then(|value| {
                        value
                            .get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or(raw)
            })
            .collect())
    }

    pub async fn ping(&self) -> bool {
        let mut redis = self.redis.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut redis).await;
        pong.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_to_the_wire_shape() {
        let event = LogEvent::message(EventType::Info, "Cloning repository...");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "info");
        assert_eq!(json["message"], "Cloning repository...");
        assert!(json.get("success").is_none());

        let done = LogEvent::done_success(serde_json::json!({"id": "abc"}));
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["success"], true);
        assert_eq!(json["deployment"]["id"], "abc");
    }

    #[test]
    fn done_detection() {
        assert!(is_done_record(r#"{"type": "done", "success": false}"#));
        assert!(!is_done_record(r#"{"type": "log", "message": "done"}"#));
        assert!(!is_done_record("not json at all"));
    }

    #[test]
    fn round_trip_preserves_done_fields() {
        let done = LogEvent::done_failure("build exploded");
        let raw = serde_json::to_string(&done).unwrap();
        let parsed: LogEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.kind, EventType::Done);
        assert_eq!(parsed.success, Some(false));
        assert_eq!(parsed.error.as_deref(), Some("build exploded"));
    }
}
