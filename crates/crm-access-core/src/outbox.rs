use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    UserChanged,
    PermissionSetChanged,
    RoleChanged,
    GroupChanged,
    ObjectChanged,
    TerritoryChanged,
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::UserChanged => "user_changed",
            Self::PermissionSetChanged => "permission_set_changed",
            Self::RoleChanged => "role_changed",
            Self::GroupChanged => "group_changed",
            Self::ObjectChanged => "object_changed",
            Self::TerritoryChanged => "territory_changed",
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value {
            "user_changed" => Self::UserChanged,
            "permission_set_changed" => Self::PermissionSetChanged,
            "role_changed" => Self::RoleChanged,
            "group_changed" => Self::GroupChanged,
            "object_changed" => Self::ObjectChanged,
            "territory_changed" => Self::TerritoryChanged,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A change notification appended in the same transaction as the write it describes.
/// `processed_at == None` means the event is still pending.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: EventId,
    pub event_type: EventType,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_type: EventType,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn new(event_type: EventType, entity_type: impl Into<String>, entity_id: Uuid) -> Self {
        Self {
            event_type,
            entity_type: entity_type.into(),
            entity_id,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_event_types_round_trip() {
        for name in [
            "user_changed",
            "permission_set_changed",
            "role_changed",
            "group_changed",
            "object_changed",
            "territory_changed",
        ] {
            let parsed = EventType::from(name);
            assert!(!matches!(parsed, EventType::Unknown(_)), "{name}");
            assert_eq!(parsed.as_str(), name);
        }
    }

    #[test]
    fn unrecognized_event_type_is_preserved() {
        let parsed = EventType::from("queue_changed");

        assert_eq!(parsed, EventType::Unknown("queue_changed".to_string()));
        assert_eq!(parsed.to_string(), "queue_changed");
    }

    #[test]
    fn new_event_defaults_to_null_payload() {
        let entity = Uuid::new_v4();
        let event = NewOutboxEvent::new(EventType::GroupChanged, "group", entity)
            .with_payload(serde_json::json!({ "op": "update" }));

        assert_eq!(event.entity_id, entity);
        assert_eq!(event.payload["op"], "update");
    }
}
