//! src/services/reconciler.rs
//!
//! ReconciliationEngine: decides, per change notification, whether the index
//! gets an insert, an update, nothing, or a delete, and applies that decision.
//!
//! Fingerprints always come from the object source, never from the
//! notification. Comparing the live fingerprint with the stored one is what
//! makes duplicate and stale deliveries harmless.

use futures::{StreamExt, stream};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, hash_map::Entry};
use std::sync::Arc;
use tracing::{info, warn};

use super::{metadata_store::MetadataStore, object_source::ObjectSource, retry::CallPolicy};
use crate::errors::ProcessError;
use crate::models::{
    envelope::ResponseEnvelope,
    notification::{ChangeNotification, EventKind},
    record::{MetadataRecord, NaturalKey, normalize_fingerprint},
};

/// What a notification does to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Insert(MetadataRecord),
    Update(MetadataRecord),
    NoOp,
    Delete(NaturalKey),
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Insert,
    Update,
    Noop,
    Delete,
}

impl Effect {
    pub fn kind(&self) -> EffectKind {
        match self {
            Effect::Insert(_) => EffectKind::Insert,
            Effect::Update(_) => EffectKind::Update,
            Effect::NoOp => EffectKind::Noop,
            Effect::Delete(_) => EffectKind::Delete,
        }
    }
}

/// Pure decision step. `live_fingerprint` is `None` when the object could not
/// be found at lookup time, which is handled like a removal.
pub fn decide(
    notification: &ChangeNotification,
    current: Option<&MetadataRecord>,
    live_fingerprint: Option<&str>,
) -> Effect {
    let fingerprint = match (notification.event_kind, live_fingerprint) {
        (EventKind::Removed, _) | (EventKind::Created, None) => {
            return Effect::Delete(notification.natural_key());
        }
        (EventKind::Created, Some(fingerprint)) => fingerprint,
    };

    match current {
        None => Effect::Insert(MetadataRecord::new(
            &notification.bucket,
            &notification.key,
            fingerprint,
            notification.event_time,
        )),
        Some(record) if record.fingerprint_matches(fingerprint) => Effect::NoOp,
        Some(record) => Effect::Update(MetadataRecord {
            content_fingerprint: normalize_fingerprint(fingerprint),
            last_seen: notification.event_time,
            ..record.clone()
        }),
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn MetadataStore>,
    source: Arc<dyn ObjectSource>,
    policy: CallPolicy,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        source: Arc<dyn ObjectSource>,
        policy: CallPolicy,
    ) -> Self {
        Self {
            store,
            source,
            policy,
        }
    }

    /// Compute the effect of `notification` given the record currently stored
    /// for its key. Created notifications trigger a head lookup.
    pub async fn reconcile(
        &self,
        notification: &ChangeNotification,
        current: Option<&MetadataRecord>,
    ) -> Result<Effect, ProcessError> {
        if notification.event_kind == EventKind::Removed {
            return Ok(decide(notification, current, None));
        }

        let source = &self.source;
        let (bucket, key) = (notification.bucket.as_str(), notification.key.as_str());
        let live = self
            .policy
            .run("head_fingerprint", || async move {
                source
                    .head_fingerprint(bucket, key)
                    .await
                    .map_err(|err| err.into_process("head_fingerprint"))
            })
            .await;

        match live {
            Ok(fingerprint) => Ok(decide(notification, current, Some(&fingerprint))),
            Err(ProcessError::NotFound { .. }) => {
                info!(
                    "object {}/{} vanished before lookup; treating as removed",
                    bucket, key
                );
                Ok(decide(notification, current, None))
            }
            Err(err) => Err(err),
        }
    }

    /// Write `effect` through to the store.
    pub async fn apply(&self, effect: &Effect) -> Result<(), ProcessError> {
        let store = &self.store;
        match effect {
            Effect::Insert(record) | Effect::Update(record) => {
                self.policy
                    .run("upsert", || async move {
                        store
                            .upsert(record)
                            .await
                            .map_err(|err| err.into_process("upsert"))
                    })
                    .await
            }
            Effect::Delete(natural_key) => {
                let existed = self
                    .policy
                    .run("delete", || async move {
                        store
                            .delete(&natural_key.bucket, &natural_key.key)
                            .await
                            .map_err(|err| err.into_process("delete"))
                    })
                    .await?;
                if !existed {
                    info!("no index record for {}; delete absorbed", natural_key);
                }
                Ok(())
            }
            Effect::NoOp => Ok(()),
        }
    }

    /// Look up, decide and apply for one notification.
    pub async fn process(&self, notification: &ChangeNotification) -> Result<Effect, ProcessError> {
        let store = &self.store;
        let (bucket, key) = (notification.bucket.as_str(), notification.key.as_str());
        let current = self
            .policy
            .run("find_by_key", || async move {
                store
                    .find_by_key(bucket, key)
                    .await
                    .map_err(|err| err.into_process("find_by_key"))
            })
            .await?;

        let effect = self.reconcile(notification, current.as_ref()).await?;
        self.apply(&effect).await?;

        match &effect {
            Effect::Insert(record) => info!(
                "New file detected: {}/{} ({})",
                bucket, key, record.content_fingerprint
            ),
            Effect::Update(record) => info!(
                "Modified file detected: {}/{} ({})",
                bucket, key, record.content_fingerprint
            ),
            Effect::NoOp => info!("File {}/{} has not changed (fingerprint matches)", bucket, key),
            Effect::Delete(_) => info!("File deleted: {}/{}", bucket, key),
        }

        Ok(effect)
    }

    /// Process a batch in delivery order. One notification failing never stops
    /// the others.
    ///
    /// With `concurrency > 1`, notifications are grouped by natural key and
    /// groups run concurrently while each group stays in delivery order.
    pub async fn process_batch(
        &self,
        notifications: &[ChangeNotification],
        concurrency: usize,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        if concurrency <= 1 {
            for (index, notification) in notifications.iter().enumerate() {
                let result = self.process(notification).await;
                report.record(index, notification, result);
            }
            return report;
        }

        let engine = self;
        let mut results: Vec<(usize, Result<Effect, ProcessError>)> =
            stream::iter(group_by_key(notifications))
                .map(move |group| async move {
                    let mut out = Vec::with_capacity(group.len());
                    for index in group {
                        out.push((index, engine.process(&notifications[index]).await));
                    }
                    out
                })
                .buffer_unordered(concurrency)
                .flat_map(stream::iter)
                .collect()
                .await;

        results.sort_by_key(|(index, _)| *index);
        for (index, result) in results {
            report.record(index, &notifications[index], result);
        }
        report
    }
}

/// Indices of `notifications` grouped by natural key, each group in delivery
/// order, groups ordered by first appearance.
pub fn group_by_key(notifications: &[ChangeNotification]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut positions: HashMap<NaturalKey, usize> = HashMap::new();

    for (index, notification) in notifications.iter().enumerate() {
        match positions.entry(notification.natural_key()) {
            Entry::Occupied(slot) => groups[*slot.get()].push(index),
            Entry::Vacant(slot) => {
                slot.insert(groups.len());
                groups.push(vec![index]);
            }
        }
    }
    groups
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct NotificationOutcome {
    pub index: usize,
    pub bucket: String,
    pub key: String,
    pub effect: EffectKind,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct NotificationFailure {
    pub index: usize,
    pub bucket: String,
    pub key: String,
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

/// Per-notification results of one batch, both lists in delivery order.
#[derive(Serialize, Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<NotificationOutcome>,
    pub failures: Vec<NotificationFailure>,
}

impl BatchReport {
    fn record(
        &mut self,
        index: usize,
        notification: &ChangeNotification,
        result: Result<Effect, ProcessError>,
    ) {
        match result {
            Ok(effect) => self.outcomes.push(NotificationOutcome {
                index,
                bucket: notification.bucket.clone(),
                key: notification.key.clone(),
                effect: effect.kind(),
            }),
            Err(err) => {
                warn!(
                    "notification {} for {}/{} failed: {}",
                    index, notification.bucket, notification.key, err
                );
                self.failures.push(NotificationFailure {
                    index,
                    bucket: notification.bucket.clone(),
                    key: notification.key.clone(),
                    kind: err.kind(),
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                });
            }
        }
    }

    pub fn processed(&self) -> usize {
        self.outcomes.len() + self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// 200 when every notification succeeded, otherwise 500 with the failures.
    pub fn into_envelope(self) -> ResponseEnvelope {
        if self.is_success() {
            return ResponseEnvelope::json(
                axum::http::StatusCode::OK,
                &json!({
                    "message": "S3 event processed successfully.",
                    "processed": self.processed(),
                    "outcomes": self.outcomes,
                }),
            );
        }

        ResponseEnvelope::json(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            &json!({
                "message": format!(
                    "Error processing event: {} of {} notifications failed",
                    self.failures.len(),
                    self.processed()
                ),
                "processed": self.processed(),
                "outcomes": self.outcomes,
                "failures": self.failures,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        metadata_store::MemoryMetadataStore,
        object_source::MemoryObjectSource,
        retry::RetryConfig,
    };
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    const BUCKET: &str = "uploads";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn fingerprint(content: &str) -> String {
        format!("{:x}", md5::compute(content))
    }

    struct Harness {
        store: Arc<MemoryMetadataStore>,
        source: Arc<MemoryObjectSource>,
        engine: ReconciliationEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryMetadataStore::new());
        let source = Arc::new(MemoryObjectSource::new());
        let engine = ReconciliationEngine::new(
            store.clone(),
            source.clone(),
            CallPolicy::new(Duration::from_millis(200), RetryConfig::fast(1)),
        );
        Harness {
            store,
            source,
            engine,
        }
    }

    #[test]
    fn decide_covers_every_branch() {
        let created = ChangeNotification::created(BUCKET, "a.txt", at(10));
        let removed = ChangeNotification::removed(BUCKET, "a.txt", at(20));
        let stored = MetadataRecord::new(BUCKET, "a.txt", "aaa", at(0));

        assert_eq!(
            decide(&created, None, Some("aaa")),
            Effect::Insert(MetadataRecord::new(BUCKET, "a.txt", "aaa", at(10)))
        );
        assert_eq!(decide(&created, Some(&stored), Some("\"aaa\"")), Effect::NoOp);
        assert_eq!(
            decide(&created, Some(&stored), Some("bbb")),
            Effect::Update(MetadataRecord::new(BUCKET, "a.txt", "bbb", at(10)))
        );
        assert_eq!(
            decide(&removed, Some(&stored), Some("aaa")),
            Effect::Delete(NaturalKey::new(BUCKET, "a.txt"))
        );
        assert_eq!(
            decide(&created, Some(&stored), None),
            Effect::Delete(NaturalKey::new(BUCKET, "a.txt"))
        );
    }

    #[tokio::test]
    async fn duplicate_created_delivery_is_insert_then_noop() {
        let h = harness();
        h.source.put(BUCKET, "docs/a.txt", "v1", "text/plain");
        let n = ChangeNotification::created(BUCKET, "docs/a.txt", at(0));

        assert_eq!(h.engine.process(&n).await.unwrap().kind(), EffectKind::Insert);
        assert_eq!(h.engine.process(&n).await.unwrap(), Effect::NoOp);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.store.records()[0].content_fingerprint, fingerprint("v1"));
    }

    #[tokio::test]
    async fn changed_content_is_updated_in_place() {
        let h = harness();
        h.source.put(BUCKET, "docs/a.txt", "v1", "text/plain");
        h.engine
            .process(&ChangeNotification::created(BUCKET, "docs/a.txt", at(0)))
            .await
            .unwrap();

        h.source.put(BUCKET, "docs/a.txt", "v2", "text/plain");
        let effect = h
            .engine
            .process(&ChangeNotification::created(BUCKET, "docs/a.txt", at(30)))
            .await
            .unwrap();

        assert_eq!(effect.kind(), EffectKind::Update);
        let records = h.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_fingerprint, fingerprint("v2"));
        assert_eq!(records[0].last_seen, at(30));
    }

    #[tokio::test]
    async fn advisory_fingerprint_is_ignored() {
        let h = harness();
        h.source.put(BUCKET, "a.bin", "real", "application/octet-stream");
        let mut n = ChangeNotification::created(BUCKET, "a.bin", at(0));
        n.advisory_fingerprint = Some("\"stale-etag\"".into());

        h.engine.process(&n).await.unwrap();
        assert_eq!(h.store.records()[0].content_fingerprint, fingerprint("real"));
    }

    #[tokio::test]
    async fn removed_for_unknown_key_is_absorbed() {
        let h = harness();
        let effect = h
            .engine
            .process(&ChangeNotification::removed(BUCKET, "never-seen.txt", at(0)))
            .await
            .unwrap();

        assert_eq!(effect, Effect::Delete(NaturalKey::new(BUCKET, "never-seen.txt")));
        assert!(h.store.is_empty());
        assert_eq!(h.source.head_calls(), 0);
    }

    #[tokio::test]
    async fn vanished_object_is_treated_as_removed() {
        let h = harness();
        h.source.put(BUCKET, "tmp.txt", "x", "text/plain");
        h.engine
            .process(&ChangeNotification::created(BUCKET, "tmp.txt", at(0)))
            .await
            .unwrap();

        h.source.remove(BUCKET, "tmp.txt");
        let effect = h
            .engine
            .process(&ChangeNotification::created(BUCKET, "tmp.txt", at(5)))
            .await
            .unwrap();

        assert_eq!(effect.kind(), EffectKind::Delete);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn order_of_delivery_decides_final_state() {
        let h = harness();
        h.source.put(BUCKET, "k.txt", "A", "text/plain");
        let created = ChangeNotification::created(BUCKET, "k.txt", at(0));
        let removed = ChangeNotification::removed(BUCKET, "k.txt", at(1));

        let report = h
            .engine
            .process_batch(&[created.clone(), removed.clone()], 1)
            .await;
        assert!(report.is_success());
        assert!(h.store.is_empty());

        let report = h.engine.process_batch(&[removed, created], 1).await;
        assert!(report.is_success());
        let records = h.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_fingerprint, fingerprint("A"));
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_batch() {
        let h = harness();
        for key in ["a.txt", "b.txt", "c.txt"] {
            h.source.put(BUCKET, key, key, "text/plain");
        }
        h.store.fail_writes_for(BUCKET, "b.txt");

        let batch = [
            ChangeNotification::created(BUCKET, "a.txt", at(0)),
            ChangeNotification::created(BUCKET, "b.txt", at(0)),
            ChangeNotification::created(BUCKET, "c.txt", at(0)),
        ];
        let report = h.engine.process_batch(&batch, 1).await;

        assert!(!report.is_success());
        assert_eq!(report.processed(), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].kind, "backend");
        assert!(report.failures[0].retryable);
        assert_eq!(h.store.len(), 2);

        let envelope = report.into_envelope();
        assert_eq!(envelope.status_code, 500);
        let body: serde_json::Value = serde_json::from_str(&envelope.body).unwrap();
        assert_eq!(body["failures"][0]["key"], "b.txt");
    }

    #[tokio::test]
    async fn unavailable_source_fails_created_but_not_removed() {
        let h = harness();
        h.source.set_unavailable(true);
        let batch = [
            ChangeNotification::created(BUCKET, "a.txt", at(0)),
            ChangeNotification::removed(BUCKET, "b.txt", at(0)),
        ];
        let report = h.engine.process_batch(&batch, 1).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 0);
        assert_eq!(report.outcomes[0].effect, EffectKind::Delete);
        // one initial attempt plus one retry
        assert_eq!(h.source.head_calls(), 2);
    }

    #[test]
    fn grouping_keeps_per_key_order() {
        let batch = [
            ChangeNotification::created(BUCKET, "x", at(0)),
            ChangeNotification::created(BUCKET, "y", at(0)),
            ChangeNotification::removed(BUCKET, "x", at(1)),
            ChangeNotification::created("other", "x", at(2)),
            ChangeNotification::created(BUCKET, "y", at(3)),
        ];
        assert_eq!(group_by_key(&batch), vec![vec![0, 2], vec![1, 4], vec![3]]);
    }

    #[tokio::test]
    async fn concurrent_batch_preserves_per_key_order_and_report_order() {
        let h = harness();
        let mut batch = Vec::new();
        for i in 0..8 {
            let key = format!("f{i}.txt");
            h.source.put(BUCKET, &key, format!("content {i}"), "text/plain");
            batch.push(ChangeNotification::created(BUCKET, &key, at(i)));
        }
        // every even key is removed again later in the batch
        for i in (0..8).step_by(2) {
            batch.push(ChangeNotification::removed(BUCKET, &format!("f{i}.txt"), at(100 + i)));
        }

        let report = h.engine.process_batch(&batch, 4).await;

        assert!(report.is_success());
        let indices: Vec<usize> = report.outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, (0..batch.len()).collect::<Vec<_>>());
        let keys: Vec<String> = h.store.records().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["f1.txt", "f3.txt", "f5.txt", "f7.txt"]);
    }
}
