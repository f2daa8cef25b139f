//! Represents the persisted index entry for one object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// The (bucket, key) pair that uniquely identifies one index record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub bucket: String,
    pub key: String,
}

impl NaturalKey {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Metadata tracked for a single object in the namespace.
///
/// At most one record exists per (bucket, key). The fingerprint is the one the
/// storage backend reported at or after `last_seen`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Bucket holding the object.
    pub bucket: String,

    /// Full object key (path-like, e.g. `reports/2025/q1.csv`).
    pub key: String,

    /// Opaque content identity token, normalized without surrounding quotes.
    pub content_fingerprint: String,

    /// Event time of the notification that last changed this record.
    pub last_seen: DateTime<Utc>,
}

impl MetadataRecord {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        fingerprint: &str,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            content_fingerprint: normalize_fingerprint(fingerprint),
            last_seen,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(&self.bucket, &self.key)
    }

    /// True when `fingerprint` identifies the same content as this record.
    pub fn fingerprint_matches(&self, fingerprint: &str) -> bool {
        self.content_fingerprint == normalize_fingerprint(fingerprint)
    }
}

/// Strip whitespace and the double quotes backends put around entity tags.
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}
