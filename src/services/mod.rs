//! Index reconciliation, retrieval, and the collaborators they talk to.

pub mod metadata_store;
pub mod object_source;
pub mod reconciler;
pub mod request_router;
pub mod retrieval;
pub mod retry;
