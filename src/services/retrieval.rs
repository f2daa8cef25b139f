//! Pass-through reads of object content, framed for the response envelope.

use std::sync::Arc;
use tracing::info;

use super::{object_source::ObjectSource, retry::CallPolicy};
use crate::errors::ProcessError;
use crate::models::envelope::RetrievalResponse;

#[derive(Clone)]
pub struct RetrievalHandler {
    source: Arc<dyn ObjectSource>,
    policy: CallPolicy,
}

impl RetrievalHandler {
    pub fn new(source: Arc<dyn ObjectSource>, policy: CallPolicy) -> Self {
        Self { source, policy }
    }

    pub async fn retrieve(&self, bucket: &str, key: &str) -> Result<RetrievalResponse, ProcessError> {
        if bucket.is_empty() || key.is_empty() {
            return Err(ProcessError::Validation(
                "Missing 'bucket' or 'file' query parameter.".into(),
            ));
        }

        let source = &self.source;
        let content = self
            .policy
            .run("read_content", || async move {
                source
                    .read_content(bucket, key)
                    .await
                    .map_err(|err| err.into_process("read_content"))
            })
            .await?;

        info!(
            "serving {}/{} ({} bytes, {})",
            bucket,
            key,
            content.bytes.len(),
            content.content_type
        );
        Ok(RetrievalResponse::new(key, content.bytes, content.content_type))
    }
}
