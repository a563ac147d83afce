use crm_access_core::outbox::OutboxEvent;

use crate::error::DispatchError;

pub fn audit_event_processed(event: &OutboxEvent) {
    tracing::info!(
        target: "audit",
        event = "outbox_processed",
        event_id = %event.id,
        event_type = event.event_type.as_str(),
        entity_type = event.entity_type.as_str(),
        entity_id = %event.entity_id,
        "outbox event processed"
    );
}

pub fn audit_event_failed(event: &OutboxEvent, error: &DispatchError) {
    tracing::error!(
        target: "audit",
        event = "outbox_failed",
        event_id = %event.id,
        event_type = event.event_type.as_str(),
        entity_type = event.entity_type.as_str(),
        entity_id = %event.entity_id,
        error = %error,
        "outbox event failed, left pending for retry"
    );
}

pub fn audit_event_ignored(event: &OutboxEvent, reason: &str) {
    tracing::warn!(
        target: "audit",
        event = "outbox_ignored",
        event_id = %event.id,
        event_type = event.event_type.as_str(),
        entity_id = %event.entity_id,
        reason = reason,
        "outbox event consumed without action"
    );
}
