//! Error taxonomy for form lifecycle operations.
//!
//! Permission and precondition failures are decided entirely client-side
//! and never reach the RPC layer. Server failures are surfaced verbatim,
//! not interpreted. A declined confirmation dialog is not an error.

use formkit_types::FormAction;

#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("No permission to '{action}' {doctype}")]
    PermissionDenied { action: FormAction, doctype: String },

    /// A validate/before_save hook cleared the proceed flag. Normally a
    /// silent abort; this variant exists for callers that want to
    /// distinguish the branch.
    #[error("validation aborted the operation")]
    ValidationAborted,

    /// The server raised during a remote call (`exc` in the result).
    #[error("server error: {0}")]
    Server(String),

    /// Transport-level RPC failure, before any server response.
    #[error("rpc failure: {0}")]
    Rpc(String),

    #[error("{0}")]
    PreconditionMissing(String),

    #[error("document {doctype}/{name} was modified after it was loaded")]
    StaleDocument { doctype: String, name: String },

    #[error("Field {0} not found")]
    FieldNotFound(String),

    #[error("document {doctype}/{name} is not loaded")]
    DocumentMissing { doctype: String, name: String },

    #[error("no metadata registered for doctype {0}")]
    UnknownDoctype(String),

    #[error("action {0} is not valid for this document state")]
    InvalidAction(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
