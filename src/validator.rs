//! Shape check for raw member-join notifications.
//!
//! Expected payload (extra fields are ignored):
//!
//! ```json
//! { "id": "delivery-1", "guild_id": "123", "user": { "id": "987", "username": "new_user" },
//!   "joined_at": "2024-01-01T00:00:00Z" }
//! ```

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::types::{DeliveryId, InboundEvent, Subject, SubjectId, TenantId};

pub fn validate(raw: &Value) -> Result<InboundEvent, ValidationError> {
    let object = raw.as_object().ok_or_else(|| ValidationError::Malformed {
        field: "event",
        reason: format!("expected object, got {}", type_name(raw)),
    })?;

    let tenant_id = required_id(object, "guild_id", "guild_id")?;

    let user = match object.get("user") {
        None | Some(Value::Null) => return Err(ValidationError::Missing { field: "user" }),
        Some(Value::Object(user)) => user,
        Some(other) => {
            return Err(ValidationError::Malformed {
                field: "user",
                reason: format!("expected object, got {}", type_name(other)),
            })
        }
    };

    let subject_id = required_id(user, "id", "user.id")?;
    let display_name = required_string(user, "username", "user.username")?;

    Ok(InboundEvent {
        delivery_id: optional_string(object, "id").map(DeliveryId),
        tenant_id: TenantId(tenant_id),
        subject: Subject {
            id: SubjectId(subject_id),
            display_name,
        },
        timestamp: optional_string(object, "joined_at"),
    })
}

/// Snowflake ids arrive either as strings or as unsigned integers.
fn required_id(
    object: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<String, ValidationError> {
    match object.get(key) {
        Some(Value::Number(n)) if n.is_u64() => Ok(n.to_string()),
        Some(Value::Number(_)) => Err(ValidationError::Malformed {
            field,
            reason: "numeric id must be an unsigned integer".to_string(),
        }),
        _ => required_string(object, key, field),
    }
}

fn required_string(
    object: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<String, ValidationError> {
    match object.get(key) {
        None | Some(Value::Null) => Err(ValidationError::Missing { field }),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::Empty { field }),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(other) => Err(ValidationError::Malformed {
            field,
            reason: format!("expected string, got {}", type_name(other)),
        }),
    }
}

fn optional_string(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_well_formed_event() {
        let event = validate(&json!({
            "id": "d-1",
            "guild_id": "123456789",
            "user": { "id": "987654321", "username": "new_user", "discriminator": "1234" },
            "joined_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(event.tenant_id.as_str(), "123456789");
        assert_eq!(event.subject.id.as_str(), "987654321");
        assert_eq!(event.subject.display_name, "new_user");
        assert_eq!(event.delivery_id, Some(DeliveryId::new("d-1")));
        assert_eq!(event.timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn numeric_ids_are_normalized() {
        let event = validate(&json!({
            "guild_id": 42,
            "user": { "id": 7, "username": "u" }
        }))
        .unwrap();

        assert_eq!(event.tenant_id.as_str(), "42");
        assert_eq!(event.subject.id.as_str(), "7");
        assert!(event.delivery_id.is_none());
    }

    #[test]
    fn names_each_missing_field() {
        let cases = [
            (json!({ "user": { "id": "1", "username": "u" } }), "guild_id"),
            (json!({ "guild_id": "1" }), "user"),
            (json!({ "guild_id": "1", "user": { "username": "u" } }), "user.id"),
            (json!({ "guild_id": "1", "user": { "id": "2" } }), "user.username"),
        ];

        for (raw, field) in cases {
            assert_eq!(validate(&raw), Err(ValidationError::Missing { field }));
        }
    }

    #[test]
    fn rejects_blank_and_mistyped_fields() {
        assert_eq!(
            validate(&json!({ "guild_id": "1", "user": { "id": "  ", "username": "u" } })),
            Err(ValidationError::Empty { field: "user.id" })
        );
        assert!(matches!(
            validate(&json!({ "guild_id": "1", "user": "987" })),
            Err(ValidationError::Malformed { field: "user", .. })
        ));
        assert!(matches!(
            validate(&json!({ "guild_id": -5, "user": { "id": "1", "username": "u" } })),
            Err(ValidationError::Malformed { field: "guild_id", .. })
        ));
        assert!(matches!(
            validate(&json!([1, 2, 3])),
            Err(ValidationError::Malformed { field: "event", .. })
        ));
    }
}
