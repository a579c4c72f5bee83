//! Remote-call contract.
//!
//! The engine never talks to a transport directly; everything goes
//! through [`RpcClient`]. A call either fails at the transport level
//! ([`FormError::Rpc`]) or returns an [`RpcResult`] whose `exc` field
//! carries a server-side failure verbatim. No call is ever retried by
//! the engine; a failed persist leaves the document dirty for the user
//! to try again.

use async_trait::async_trait;
use serde_json::{json, Value};

use formkit_types::{Document, FormAction, RpcResult};

use crate::error::FormError;

/// Persist a brand-new document.
pub const METHOD_INSERT: &str = "client.insert";
/// Persist an existing document; carries the action verb (Save, Update,
/// Submit, Cancel).
pub const METHOD_SAVE: &str = "client.save";
pub const METHOD_DELETE: &str = "client.delete";
/// Fetch a full document.
pub const METHOD_GET: &str = "client.get";
/// Fetch selected columns of one document (link auto-fetch).
pub const METHOD_GET_VALUE: &str = "client.get_value";

#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, method: &str, args: Value) -> Result<RpcResult, FormError>;
}

/// Issue the persist call for a document and unwrap the envelope. New
/// local documents go through `client.insert`; everything else through
/// `client.save` with the action verb.
pub async fn persist(
    rpc: &dyn RpcClient,
    doc: &Document,
    action: FormAction,
) -> Result<Value, FormError> {
    let wire = serde_json::to_value(doc)?;
    let (method, args) = if doc.islocal {
        (METHOD_INSERT, json!({ "doc": wire }))
    } else {
        (
            METHOD_SAVE,
            json!({ "doc": wire, "action": action.wire_action() }),
        )
    };

    tracing::debug!(doctype = %doc.doctype, name = %doc.name, method, action = %action, "persisting document");
    let result = rpc.call(method, args).await?;
    unwrap_result(result)
}

/// Map `exc` to a server error, otherwise hand back the message.
pub fn unwrap_result(result: RpcResult) -> Result<Value, FormError> {
    match result.exc {
        Some(exc) => Err(FormError::Server(exc)),
        None => Ok(result.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoRpc {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl RpcClient for EchoRpc {
        async fn call(&self, method: &str, args: Value) -> Result<RpcResult, FormError> {
            self.calls.lock().unwrap().push((method.to_string(), args.clone()));
            Ok(RpcResult::ok(args["doc"].clone()))
        }
    }

    #[tokio::test]
    async fn test_persist_routes_by_locality() {
        let rpc = EchoRpc { calls: Mutex::new(Vec::new()) };

        let mut doc = Document::new("ToDo", "new-todo-1");
        doc.islocal = true;
        persist(&rpc, &doc, FormAction::Save).await.unwrap();

        doc.islocal = false;
        doc.name = "TD-0001".into();
        persist(&rpc, &doc, FormAction::Submit).await.unwrap();

        let calls = rpc.calls.lock().unwrap();
        assert_eq!(calls[0].0, METHOD_INSERT);
        assert_eq!(calls[1].0, METHOD_SAVE);
        assert_eq!(calls[1].1["action"], "Submit");
    }

    #[test]
    fn test_unwrap_result_maps_exc() {
        assert!(matches!(
            unwrap_result(RpcResult::err("boom")),
            Err(FormError::Server(e)) if e == "boom"
        ));
        assert_eq!(unwrap_result(RpcResult::ok(json!(1))).unwrap(), json!(1));
    }
}
