//! src/services/request_router.rs
//!
//! Single entry point for both request shapes the service handles: a batch
//! of change notifications (`Records`) or a retrieval request
//! (`queryStringParameters`). A request carrying both is treated as a batch.

use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::{
    metadata_store::MetadataStore,
    object_source::ObjectSource,
    reconciler::ReconciliationEngine,
    retrieval::RetrievalHandler,
    retry::CallPolicy,
};
use crate::errors::ProcessError;
use crate::models::{
    envelope::{ResponseEnvelope, RetrievalRequest},
    notification::ChangeNotification,
};

/// A validated inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRequest {
    Batch(Vec<ChangeNotification>),
    Retrieval(RetrievalRequest),
}

impl InboundRequest {
    /// Classify and validate a raw platform event. A batch is validated as a
    /// whole, so a malformed record rejects the request before any side effect.
    pub fn parse(event: &Value) -> Result<Self, ProcessError> {
        if let Some(records) = event
            .get("Records")
            .and_then(Value::as_array)
            .filter(|records| !records.is_empty())
        {
            let notifications = records
                .iter()
                .enumerate()
                .map(|(index, record)| ChangeNotification::from_record(index, record))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::Batch(notifications));
        }

        if let Some(params) = event.get("queryStringParameters") {
            let param = |name: &str| {
                params
                    .get(name)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let (bucket, key) = (param("bucket"), param("file"));
            if bucket.is_empty() || key.is_empty() {
                return Err(ProcessError::Validation(
                    "Missing 'bucket' or 'file' query parameter.".into(),
                ));
            }
            return Ok(Self::Retrieval(RetrievalRequest { bucket, key }));
        }

        Err(ProcessError::UnsupportedRequest)
    }
}

/// Shared, long-lived dispatcher. Cloning is cheap; the store and source
/// handles are reference-counted and reused across invocations.
#[derive(Clone)]
pub struct RequestRouter {
    engine: ReconciliationEngine,
    retrieval: RetrievalHandler,
    store: Arc<dyn MetadataStore>,
    source: Arc<dyn ObjectSource>,
    batch_concurrency: usize,
}

impl RequestRouter {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        source: Arc<dyn ObjectSource>,
        policy: CallPolicy,
        batch_concurrency: usize,
    ) -> Self {
        Self {
            engine: ReconciliationEngine::new(store.clone(), source.clone(), policy.clone()),
            retrieval: RetrievalHandler::new(source.clone(), policy),
            store,
            source,
            batch_concurrency: batch_concurrency.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn ObjectSource> {
        &self.source
    }

    /// Handle one raw invocation and produce the response envelope.
    pub async fn route(&self, event: &Value) -> ResponseEnvelope {
        let invocation_id = Uuid::new_v4();
        let span = info_span!("invoke", %invocation_id);

        async {
            match InboundRequest::parse(event) {
                Ok(request) => self.dispatch(request).await,
                Err(err) => {
                    warn!("rejecting request: {}", err);
                    ResponseEnvelope::from_error(&err)
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn dispatch(&self, request: InboundRequest) -> ResponseEnvelope {
        match request {
            InboundRequest::Batch(notifications) => {
                info!("processing batch of {} notifications", notifications.len());
                let report = self
                    .engine
                    .process_batch(&notifications, self.batch_concurrency)
                    .await;
                if !report.is_success() {
                    error!(
                        "{} of {} notifications failed",
                        report.failures.len(),
                        report.processed()
                    );
                }
                report.into_envelope()
            }
            InboundRequest::Retrieval(request) => {
                match self.retrieval.retrieve(&request.bucket, &request.key).await {
                    Ok(response) => response.into_envelope(),
                    Err(err) => {
                        error!(
                            "retrieval of {}/{} failed: {}",
                            request.bucket, request.key, err
                        );
                        ResponseEnvelope::from_error(&err)
                    }
                }
            }
        }
    }
}
