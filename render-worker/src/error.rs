use render_common::store::StoreError;
use thiserror::Error;

use crate::external::DispatchError;

/// Enumeration of errors surfaced by the background loops.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("dispatch to the external worker service failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("a webhook payload could not be serialized: {0}")]
    Payload(#[from] serde_json::Error),
}
