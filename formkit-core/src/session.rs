//! Session registry: which forms are open, and which one has focus.
//!
//! The registry replaces any ambient "current form" global with an
//! explicit map plus an explicit focus pointer owned by the application
//! shell. Switching focus never destroys the previous session's
//! in-memory state.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::FormError;
use crate::form::{Form, FormDeps};

type Key = (String, String);

pub struct FormRegistry {
    deps: FormDeps,
    forms: Mutex<HashMap<Key, Form>>,
    current: Mutex<Option<Key>>,
}

impl FormRegistry {
    pub fn new(deps: FormDeps) -> Self {
        Self {
            deps,
            forms: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        }
    }

    fn key(doctype: &str, docname: &str) -> Key {
        (doctype.to_string(), docname.to_string())
    }

    /// Open (or focus) the session for a document. The document must
    /// already be in the store — loading is the caller's concern.
    pub async fn open(&self, doctype: &str, docname: &str) -> Result<Form, FormError> {
        let key = Self::key(doctype, docname);
        let form = {
            let mut forms = self.forms.lock().unwrap();
            match forms.get(&key) {
                Some(form) => form.clone(),
                None => {
                    let form = Form::new(doctype, self.deps.clone())?;
                    forms.insert(key.clone(), form.clone());
                    form
                }
            }
        };

        form.refresh(Some(docname)).await?;
        *self.current.lock().unwrap() = Some(key);
        tracing::debug!(doctype, docname, "form session focused");
        Ok(form)
    }

    /// Create a fresh local document and open a session on it.
    pub async fn open_new(&self, doctype: &str) -> Result<Form, FormError> {
        let meta = self.deps.meta.get_meta(doctype)?;
        let doc = self.deps.store.new_doc(&meta);
        self.open(doctype, &doc.name).await
    }

    pub fn get(&self, doctype: &str, docname: &str) -> Option<Form> {
        self.forms
            .lock()
            .unwrap()
            .get(&Self::key(doctype, docname))
            .cloned()
    }

    /// The focused session, if any.
    pub fn current(&self) -> Option<Form> {
        let key = self.current.lock().unwrap().clone()?;
        self.forms.lock().unwrap().get(&key).cloned()
    }

    /// Propagate a server-side rename: the store key moves, the session
    /// follows, focus stays intact.
    pub fn rename(&self, doctype: &str, old: &str, new: &str) -> Result<(), FormError> {
        self.deps.store.rename(doctype, old, new)?;

        let old_key = Self::key(doctype, old);
        let new_key = Self::key(doctype, new);
        let form = self.forms.lock().unwrap().remove(&old_key);
        if let Some(form) = form {
            form.rename_notify(old, new);
            self.forms.lock().unwrap().insert(new_key.clone(), form);

            let mut current = self.current.lock().unwrap();
            if current.as_ref() == Some(&old_key) {
                *current = Some(new_key);
            }
        }
        Ok(())
    }

    /// Drop a session. The document stays cached in the store.
    pub fn close(&self, doctype: &str, docname: &str) {
        let key = Self::key(doctype, docname);
        self.forms.lock().unwrap().remove(&key);
        let mut current = self.current.lock().unwrap();
        if current.as_ref() == Some(&key) {
            *current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcClient;
    use crate::store::{DocumentStore, MetaStore};
    use async_trait::async_trait;
    use formkit_types::{DocField, DocPerm, DocTypeMeta, FieldType, PermissionSet, RpcResult};
    use serde_json::Value;
    use std::sync::Arc;

    struct NullRpc;

    #[async_trait]
    impl RpcClient for NullRpc {
        async fn call(&self, _method: &str, _args: Value) -> Result<RpcResult, FormError> {
            Ok(RpcResult::ok(Value::Null))
        }
    }

    fn registry() -> FormRegistry {
        let store = DocumentStore::new();
        let meta = MetaStore::new();
        meta.register_meta(DocTypeMeta {
            name: "ToDo".into(),
            fields: vec![DocField::new("description", FieldType::Data)],
            ..Default::default()
        });
        meta.set_permissions(
            "ToDo",
            PermissionSet::from_rows([DocPerm {
                permlevel: 0,
                read: true,
                write: true,
                create: true,
                ..Default::default()
            }]),
        );
        FormRegistry::new(FormDeps::new(store, meta, Arc::new(NullRpc)))
    }

    #[tokio::test]
    async fn test_open_new_focuses_session() {
        let reg = registry();
        let form = reg.open_new("ToDo").await.unwrap();
        assert!(form.docname().starts_with("new-todo-"));
        assert_eq!(reg.current().unwrap().docname(), form.docname());
    }

    #[tokio::test]
    async fn test_switching_focus_keeps_sessions() {
        let reg = registry();
        let first = reg.open_new("ToDo").await.unwrap();
        let second = reg.open_new("ToDo").await.unwrap();

        assert_eq!(reg.current().unwrap().docname(), second.docname());
        // the first session is still registered, state intact
        assert!(reg.get("ToDo", &first.docname()).is_some());

        reg.open("ToDo", &first.docname()).await.unwrap();
        assert_eq!(reg.current().unwrap().docname(), first.docname());
    }

    #[tokio::test]
    async fn test_rename_moves_session_and_focus() {
        let reg = registry();
        let form = reg.open_new("ToDo").await.unwrap();
        let old = form.docname();

        reg.rename("ToDo", &old, "TD-0001").unwrap();
        assert!(reg.get("ToDo", &old).is_none());
        let renamed = reg.get("ToDo", "TD-0001").unwrap();
        assert_eq!(renamed.docname(), "TD-0001");
        assert_eq!(reg.current().unwrap().docname(), "TD-0001");
    }

    #[tokio::test]
    async fn test_close_clears_focus_but_not_store() {
        let reg = registry();
        let form = reg.open_new("ToDo").await.unwrap();
        let docname = form.docname();

        reg.close("ToDo", &docname);
        assert!(reg.current().is_none());
        assert!(reg.get("ToDo", &docname).is_none());
        // document survives in the store for the page session
        assert!(form.store().contains("ToDo", &docname));
    }

    #[tokio::test]
    async fn test_unknown_doctype_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.open_new("Nope").await,
            Err(FormError::UnknownDoctype(_))
        ));
    }
}
