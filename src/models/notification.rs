//! Storage change notifications and their backend-native wire layout.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::record::NaturalKey;
use crate::errors::ProcessError;

/// What happened to the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Removed,
}

impl EventKind {
    /// Prefix-match a backend event name such as `ObjectCreated:Put` or
    /// `ObjectRemoved:DeleteMarkerCreated`. Bare `Created*`/`Removed*` names
    /// are accepted too.
    pub fn from_event_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix("Object").unwrap_or(name);
        if name.starts_with("Created") {
            Some(Self::Created)
        } else if name.starts_with("Removed") {
            Some(Self::Removed)
        } else {
            None
        }
    }
}

/// One storage event. Delivery is at-least-once, so the same notification
/// may be seen several times.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeNotification {
    pub bucket: String,
    pub key: String,
    pub event_kind: EventKind,
    pub event_time: DateTime<Utc>,
    /// Fingerprint carried by the event itself. Advisory only.
    pub advisory_fingerprint: Option<String>,
}

impl ChangeNotification {
    pub fn created(bucket: &str, key: &str, event_time: DateTime<Utc>) -> Self {
        Self::new(bucket, key, EventKind::Created, event_time)
    }

    pub fn removed(bucket: &str, key: &str, event_time: DateTime<Utc>) -> Self {
        Self::new(bucket, key, EventKind::Removed, event_time)
    }

    fn new(bucket: &str, key: &str, event_kind: EventKind, event_time: DateTime<Utc>) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            event_kind,
            event_time,
            advisory_fingerprint: None,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(&self.bucket, &self.key)
    }

    /// Parse one entry of an inbound `Records` array. `index` is the entry's
    /// position in the batch and is echoed in validation messages.
    pub fn from_record(index: usize, value: &serde_json::Value) -> Result<Self, ProcessError> {
        let invalid = |reason: String| ProcessError::Validation(format!("record {index}: {reason}"));

        let record: EventRecord =
            serde_json::from_value(value.clone()).map_err(|err| invalid(err.to_string()))?;

        let event_name = record
            .event_name
            .ok_or_else(|| invalid("missing eventName".into()))?;
        let event_kind = EventKind::from_event_name(&event_name)
            .ok_or_else(|| invalid(format!("unsupported eventName `{event_name}`")))?;

        let event_time = record
            .event_time
            .ok_or_else(|| invalid("missing eventTime".into()))?;
        let event_time = DateTime::parse_from_rfc3339(&event_time)
            .map_err(|err| invalid(format!("invalid eventTime `{event_time}`: {err}")))?
            .with_timezone(&Utc);

        let s3 = record.s3.ok_or_else(|| invalid("missing s3 entity".into()))?;
        let bucket = s3
            .bucket
            .and_then(|b| b.name)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| invalid("missing s3.bucket.name".into()))?;
        let object = s3
            .object
            .ok_or_else(|| invalid("missing s3.object".into()))?;
        let key = object
            .key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| invalid("missing s3.object.key".into()))?;

        Ok(Self {
            bucket,
            key,
            event_kind,
            event_time,
            advisory_fingerprint: object.e_tag,
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EventRecord {
    event_name: Option<String>,
    event_time: Option<String>,
    s3: Option<S3Entity>,
}

#[derive(Deserialize, Debug)]
struct S3Entity {
    bucket: Option<BucketEntity>,
    object: Option<ObjectEntity>,
}

#[derive(Deserialize, Debug)]
struct BucketEntity {
    name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ObjectEntity {
    key: Option<String>,
    #[serde(rename = "eTag")]
    e_tag: Option<String>,
}
