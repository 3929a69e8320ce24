//! Connection log data model
//!
//! Durable rows ([`UserConnectionState`], [`ConnectionHistoryEntry`]), the
//! wire-level [`ConnectionEvent`] consumed by the ingestion pipeline, and the
//! cacheable [`LastConnection`] read result.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Current state of one user: the most recently applied connection
///
/// One row per `id`. Events are applied in arrival order, so a late event with
/// an older timestamp still overwrites the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConnectionState {
    pub id: i64,
    pub current_ip_address: String,
    pub last_connection_time_utc: DateTime<Utc>,
}

/// One connection of one user (append-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHistoryEntry {
    /// Assigned by the store on commit
    pub id: i64,
    pub user_id: i64,
    pub ip_address: String,
    pub connection_time_utc: DateTime<Utc>,
}

impl ConnectionHistoryEntry {
    /// Entry not yet persisted; the store assigns `id`
    pub fn pending(user_id: i64, ip_address: impl Into<String>, connection_time_utc: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            user_id,
            ip_address: ip_address.into(),
            connection_time_utc,
        }
    }
}

/// Connection event as published on the broker
///
/// Wire shape: `{ "userId": 42, "ipAddress": "127.0.0.1", "eventTimeUtc": "..." }`.
/// The PascalCase names used by older producers (`UserId`, `IpAddress`,
/// `EventTime`) are accepted as aliases, and timestamps without an offset are
/// taken as UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    #[serde(alias = "UserId")]
    pub user_id: i64,
    #[serde(alias = "IpAddress")]
    pub ip_address: String,
    #[serde(alias = "EventTime", alias = "eventTime", deserialize_with = "deserialize_timestamp")]
    pub event_time_utc: DateTime<Utc>,
}

impl ConnectionEvent {
    pub fn new(user_id: i64, ip_address: impl Into<String>, event_time_utc: DateTime<Utc>) -> Self {
        Self {
            user_id,
            ip_address: ip_address.into(),
            event_time_utc,
        }
    }

    /// Decode a broker message body
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the body is not a connection event.
    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }

    /// Encode for publishing
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(with_offset.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// Result of a last-connection lookup
///
/// Both fields are `None` for an unknown user; that value is cached like any
/// other result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastConnection {
    pub ip_address: Option<String>,
    pub last_connection_time: Option<DateTime<Utc>>,
}

impl LastConnection {
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.ip_address.is_some()
    }
}

impl From<Option<UserConnectionState>> for LastConnection {
    fn from(row: Option<UserConnectionState>) -> Self {
        match row {
            Some(user) => Self {
                ip_address: Some(user.current_ip_address),
                last_connection_time: Some(user.last_connection_time_utc),
            },
            None => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_decodes_camel_case() {
        let body = r#"{"userId":42,"ipAddress":"127.0.0.1","eventTimeUtc":"2024-03-01T10:00:00Z"}"#;
        let event = ConnectionEvent::from_json(body).unwrap();
        assert_eq!(event.user_id, 42);
        assert_eq!(event.ip_address, "127.0.0.1");
        assert_eq!(event.event_time_utc, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_event_normalizes_offset_to_utc() {
        let body = r#"{"UserId":7,"IpAddress":"10.0.0.1","EventTime":"2024-03-01T13:00:00.5+03:00"}"#;
        let event = ConnectionEvent::from_json(body).unwrap();
        assert_eq!(event.user_id, 7);
        assert_eq!(
            event.event_time_utc,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(500)
        );
    }

    #[test]
    fn test_event_without_offset_is_utc() {
        let body = r#"{"userId":1,"ipAddress":"::1","eventTimeUtc":"2024-03-01T10:00:00.1234567"}"#;
        let event = ConnectionEvent::from_json(body).unwrap();
        assert_eq!(event.event_time_utc.timestamp(), Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap().timestamp());
    }

    #[test]
    fn test_event_rejects_missing_fields() {
        assert!(ConnectionEvent::from_json(r#"{"userId":1}"#).is_err());
        assert!(ConnectionEvent::from_json("not json").is_err());
    }

    #[test]
    fn test_last_connection_wire_names() {
        let absent = serde_json::to_value(LastConnection::default()).unwrap();
        assert_eq!(absent, serde_json::json!({"ip_address": null, "last_connection_time": null}));

        let known = LastConnection::from(Some(UserConnectionState {
            id: 1,
            current_ip_address: "127.0.0.1".to_string(),
            last_connection_time_utc: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }));
        assert!(known.is_known());
        assert_eq!(known.ip_address.as_deref(), Some("127.0.0.1"));
    }
}
