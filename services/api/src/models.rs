//! API and Database Models
//!
//! Core data structures mapped with `sqlx` and documented for OpenAPI
//! generation with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One tutoring session for a topic. At most one row is active at a time;
/// rows are deactivated, never deleted.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct Session {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    /// Language tag for the session, e.g. "es".
    pub topic: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// One transcript entry. `id` carries the per-session insertion order;
/// `message_id` is the client-visible identifier used for dedup/UI keys.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct Message {
    pub id: i64,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(value_type = String, example = "user")]
    pub role: MessageRole,
    pub content: String,
    #[schema(value_type = String, format = Uuid)]
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_role_uses_lowercase_on_the_wire() {
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );

        let role: MessageRole = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, MessageRole::Assistant);
    }

    #[test]
    fn invalid_role_fails_to_deserialize() {
        let result: Result<MessageRole, _> = serde_json::from_str("\"system\"");
        assert!(result.is_err());
    }

    #[test]
    fn message_role_display() {
        assert_eq!(format!("{}", MessageRole::User), "user");
        assert_eq!(format!("{}", MessageRole::Assistant), "assistant");
    }

    #[test]
    fn session_round_trips_through_json() {
        let session = Session {
            id: Uuid::new_v4(),
            topic: "es".to_string(),
            active: true,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"es\""));

        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.topic, session.topic);
        assert!(back.active);
        assert_eq!(back.created_at, session.created_at);
    }

    #[test]
    fn message_round_trips_through_json() {
        let message = Message {
            id: 42,
            session_id: Uuid::new_v4(),
            role: MessageRole::User,
            content: "¿Cómo se dice 'house'?".to_string(),
            message_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, message.id);
        assert_eq!(back.session_id, message.session_id);
        assert_eq!(back.role, message.role);
        assert_eq!(back.content, message.content);
        assert_eq!(back.message_id, message.message_id);
    }
}
