//! Typed view of harvested items at the handler boundary.
//!
//! Queue payloads stay opaque JSON; each item is parsed into a [`DeviceItem`]
//! only when a handler is about to persist it. Keys the typed shapes do not
//! name are kept in `extra` and stored verbatim.

use ingest_sdk::model::DataKind;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("malformed item: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid email address `{0}`")]
    InvalidEmail(String),
    #[error("unsupported data type: {0}")]
    Unsupported(DataKind),
}

/// Accepts natural keys sent as strings or numbers; devices are inconsistent.
fn lenient_key<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn require(value: &Option<String>, field: &'static str) -> Result<(), ItemError> {
    present(value).map(|_| ()).ok_or(ItemError::MissingField(field))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default, deserialize_with = "lenient_key", skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLog {
    #[serde(default, deserialize_with = "lenient_key", skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, deserialize_with = "lenient_key", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_incoming: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default, deserialize_with = "lenient_key", skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceItem {
    Contact(Contact),
    CallLog(CallLog),
    Message(Message),
    Notification(Notification),
    EmailAccount(EmailAccount),
}

impl DeviceItem {
    pub fn parse(kind: DataKind, raw: &Value) -> Result<Self, ItemError> {
        let raw = raw.clone();
        Ok(match kind {
            DataKind::Contacts => DeviceItem::Contact(serde_json::from_value(raw)?),
            DataKind::CallLogs => DeviceItem::CallLog(serde_json::from_value(raw)?),
            DataKind::Messages => DeviceItem::Message(serde_json::from_value(raw)?),
            DataKind::Notifications => DeviceItem::Notification(serde_json::from_value(raw)?),
            DataKind::EmailAccounts => DeviceItem::EmailAccount(serde_json::from_value(raw)?),
            DataKind::Whatsapp => return Err(ItemError::Unsupported(kind)),
        })
    }

    pub fn natural_key(&self) -> Option<&str> {
        match self {
            DeviceItem::Contact(c) => present(&c.contact_id),
            DeviceItem::CallLog(c) => present(&c.call_id),
            DeviceItem::Message(m) => present(&m.message_id),
            DeviceItem::Notification(n) => present(&n.notification_id),
            DeviceItem::EmailAccount(e) => present(&e.email),
        }
    }

    pub fn validate(&self) -> Result<(), ItemError> {
        match self {
            DeviceItem::Contact(c) => {
                require(&c.contact_id, "contactId")?;
                require(&c.name, "name")
            }
            DeviceItem::CallLog(c) => {
                require(&c.call_id, "callId")?;
                require(&c.phone_number, "phoneNumber")
            }
            DeviceItem::Message(m) => require(&m.message_id, "messageId"),
            DeviceItem::Notification(n) => {
                require(&n.notification_id, "notificationId")?;
                require(&n.package_name, "packageName")
            }
            DeviceItem::EmailAccount(e) => {
                require(&e.email, "email")?;
                match present(&e.email) {
                    Some(addr) if addr.contains('@') => Ok(()),
                    Some(addr) => Err(ItemError::InvalidEmail(addr.to_string())),
                    None => Err(ItemError::MissingField("email")),
                }
            }
        }
    }

    /// Flattens back into a JSON object ready for storage.
    pub fn into_fields(self) -> Result<Map<String, Value>, ItemError> {
        let value = match self {
            DeviceItem::Contact(c) => serde_json::to_value(c)?,
            DeviceItem::CallLog(c) => serde_json::to_value(c)?,
            DeviceItem::Message(m) => serde_json::to_value(m)?,
            DeviceItem::Notification(n) => serde_json::to_value(n)?,
            DeviceItem::EmailAccount(e) => serde_json::to_value(e)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}

pub fn natural_key_field(kind: DataKind) -> &'static str {
    match kind {
        DataKind::Contacts => "contactId",
        DataKind::CallLogs => "callId",
        DataKind::Messages => "messageId",
        DataKind::Notifications => "notificationId",
        DataKind::EmailAccounts => "email",
        DataKind::Whatsapp => "id",
    }
}

/// Key pulled straight from raw JSON, for error text when parsing failed.
pub fn raw_natural_key(kind: DataKind, raw: &Value) -> String {
    match raw.get(natural_key_field(kind)) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "unknown".to_string(),
    }
}

pub fn label(kind: DataKind) -> &'static str {
    match kind {
        DataKind::Contacts => "Contact",
        DataKind::CallLogs => "CallLog",
        DataKind::Messages => "Message",
        DataKind::Notifications => "Notification",
        DataKind::EmailAccounts => "EmailAccount",
        DataKind::Whatsapp => "Whatsapp",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contact_keeps_unknown_fields() {
        let raw = json!({"contactId": 42, "name": "Ana", "organization": "Acme"});
        let item = DeviceItem::parse(DataKind::Contacts, &raw).unwrap();
        assert_eq!(item.natural_key(), Some("42"));
        item.validate().unwrap();
        let fields = item.into_fields().unwrap();
        assert_eq!(fields["organization"], json!("Acme"));
        assert_eq!(fields["contactId"], json!("42"));
    }

    #[test]
    fn required_fields_are_enforced() {
        let item = DeviceItem::parse(DataKind::Contacts, &json!({"contactId": "c1"})).unwrap();
        let err = item.validate().unwrap_err();
        assert_eq!(err.to_string(), "missing required field `name`");

        let item =
            DeviceItem::parse(DataKind::Notifications, &json!({"notificationId": "n1", "packageName": "  "}))
                .unwrap();
        assert!(matches!(item.validate(), Err(ItemError::MissingField("packageName"))));
    }

    #[test]
    fn email_account_requires_at_sign() {
        let item = DeviceItem::parse(DataKind::EmailAccounts, &json!({"email": "nobody"})).unwrap();
        assert!(matches!(item.validate(), Err(ItemError::InvalidEmail(_))));
        let item =
            DeviceItem::parse(DataKind::EmailAccounts, &json!({"email": "a@b.io"})).unwrap();
        item.validate().unwrap();
        assert_eq!(item.natural_key(), Some("a@b.io"));
    }

    #[test]
    fn non_object_items_fail_to_parse() {
        assert!(matches!(
            DeviceItem::parse(DataKind::Messages, &json!("hello")),
            Err(ItemError::Parse(_))
        ));
        assert!(matches!(
            DeviceItem::parse(DataKind::Whatsapp, &json!({})),
            Err(ItemError::Unsupported(DataKind::Whatsapp))
        ));
    }

    #[test]
    fn raw_key_falls_back_to_unknown() {
        assert_eq!(raw_natural_key(DataKind::CallLogs, &json!({"callId": 7})), "7");
        assert_eq!(raw_natural_key(DataKind::CallLogs, &json!({})), "unknown");
        assert_eq!(raw_natural_key(DataKind::Messages, &json!(3)), "unknown");
    }
}
