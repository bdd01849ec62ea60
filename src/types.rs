use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of the tenant (guild) an event belongs to.
///
/// Strongly typed so tenant, subject and resource identifiers
/// can never be swapped by accident.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// Identifier of the subject (the joining user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub String);

/// Outbound call target whose rate-limit budget is tracked independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub String);

/// Per-delivery identifier assigned by the transport.
///
/// Redeliveries of the same logical event may carry different ids,
/// so this is never used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

macro_rules! id_conversions {
    ($($ty:ident),*) => {$(
        impl $ty {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    )*};
}

id_conversions!(TenantId, SubjectId, ResourceId, DeliveryId);

/// The entity an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub display_name: String,
}

/// A validated membership-join notification.
///
/// Produced only by the validator; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub delivery_id: Option<DeliveryId>,
    pub tenant_id: TenantId,
    pub subject: Subject,
    /// Upstream timestamp, carried through verbatim.
    pub timestamp: Option<String>,
}

impl InboundEvent {
    /// Key under which this event is deduplicated.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.tenant_id.clone(), self.subject.id.clone())
    }
}

/// Composite key identifying one logical join: (tenant, subject).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
}

impl DedupKey {
    pub fn new(tenant_id: TenantId, subject_id: SubjectId) -> Self {
        Self { tenant_id, subject_id }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.subject_id)
    }
}

/// Outbound message body.
///
/// Serializes to the chat platform's create-message shape: `{"content": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub content: String,
}

impl Payload {
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into() }
    }

    /// Render a template for `event`.
    ///
    /// Recognized placeholders: `{subject_id}`, `{display_name}`, `{tenant_id}`.
    pub fn render(template: &str, event: &InboundEvent) -> Self {
        let content = template
            .replace("{subject_id}", event.subject.id.as_str())
            .replace("{display_name}", &event.subject.display_name)
            .replace("{tenant_id}", event.tenant_id.as_str());
        Self { content }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> InboundEvent {
        InboundEvent {
            delivery_id: None,
            tenant_id: TenantId::new("123"),
            subject: Subject {
                id: SubjectId::new("987"),
                display_name: "new_user".to_string(),
            },
            timestamp: None,
        }
    }

    #[test]
    fn render_substitutes_every_placeholder() {
        let payload = Payload::render("Welcome <@{subject_id}> ({display_name}) to {tenant_id}!", &event());
        assert_eq!(payload.content, "Welcome <@987> (new_user) to 123!");
    }

    #[test]
    fn payload_serializes_as_message_body() {
        let json = serde_json::to_string(&Payload::new("hi")).unwrap();
        assert_eq!(json, r#"{"content":"hi"}"#);
    }

    #[test]
    fn dedup_key_ignores_delivery_id() {
        let mut a = event();
        let mut b = event();
        a.delivery_id = Some(DeliveryId::new("d1"));
        b.delivery_id = Some(DeliveryId::new("d2"));
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
