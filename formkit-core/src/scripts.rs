//! Per-doctype lifecycle script hooks.
//!
//! An ordered registry maps an event name — a lifecycle stage like
//! `validate`, or a fieldname — to a sequence of async callbacks. A
//! trigger awaits the callbacks strictly in registration order; a later
//! hook never starts before the earlier one's future settles.
//!
//! Aborting a pipeline is a *soft-fail*: any hook may clear the proceed
//! flag on the [`ScriptContext`] it was handed, and the orchestrator
//! reads the final flag state after the chain settles. A hard error
//! short-circuits the chain instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::FormError;

/// Lifecycle event names fired by the form controller.
pub mod lifecycle {
    pub const BEFORE_LOAD: &str = "before_load";
    pub const ONLOAD: &str = "onload";
    pub const ONLOAD_POST_RENDER: &str = "onload_post_render";
    pub const REFRESH: &str = "refresh";
    pub const VALIDATE: &str = "validate";
    pub const BEFORE_SAVE: &str = "before_save";
    pub const AFTER_SAVE: &str = "after_save";
    pub const BEFORE_SUBMIT: &str = "before_submit";
    pub const ON_SUBMIT: &str = "on_submit";
    pub const BEFORE_CANCEL: &str = "before_cancel";
    pub const AFTER_CANCEL: &str = "after_cancel";
}

/// Context threaded through one trigger chain. Clones share the proceed
/// flag, so a whole save attempt (validate + before_save) can observe a
/// single abort signal.
#[derive(Clone)]
pub struct ScriptContext {
    pub doctype: String,
    pub docname: String,
    /// Event (or fieldname) this hook is running for.
    pub event: String,
    proceed: Arc<AtomicBool>,
}

impl ScriptContext {
    pub fn new(doctype: impl Into<String>, docname: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            docname: docname.into(),
            event: String::new(),
            proceed: Arc::new(AtomicBool::new(true)),
        }
    }

    fn for_event(&self, event: &str) -> Self {
        let mut ctx = self.clone();
        ctx.event = event.to_string();
        ctx
    }

    /// Signal the orchestrator to stop the pipeline. Not an error.
    pub fn invalidate(&self) {
        self.proceed.store(false, Ordering::SeqCst);
    }

    pub fn proceeding(&self) -> bool {
        self.proceed.load(Ordering::SeqCst)
    }
}

pub type HookFuture = BoxFuture<'static, Result<(), FormError>>;
pub type Hook = Arc<dyn Fn(ScriptContext) -> HookFuture + Send + Sync>;

/// Wrap an async closure as a registrable hook.
pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn(ScriptContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), FormError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Ordered hook registry for one doctype.
pub struct ScriptManager {
    doctype: String,
    hooks: Mutex<HashMap<String, Vec<Hook>>>,
}

impl ScriptManager {
    pub fn new(doctype: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            hooks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a hook for a lifecycle event or fieldname. Order of
    /// registration is order of execution.
    pub fn on(&self, event: &str, hook: Hook) {
        self.hooks
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push(hook);
    }

    /// Fresh context for a multi-stage chain (e.g. validate + before_save
    /// sharing one abort flag).
    pub fn context(&self, docname: &str) -> ScriptContext {
        ScriptContext::new(self.doctype.clone(), docname)
    }

    /// Fire one event with its own context; returns whether the chain
    /// left the proceed flag intact.
    pub async fn trigger(&self, event: &str, docname: &str) -> Result<bool, FormError> {
        let ctx = self.context(docname);
        self.trigger_ctx(event, &ctx).await?;
        Ok(ctx.proceeding())
    }

    /// Fire one event against a caller-owned context. Hooks run
    /// sequentially; a hard error short-circuits, a cleared proceed flag
    /// does not (remaining hooks still see the chain, matching the
    /// run-to-completion contract; the orchestrator checks the flag after).
    pub async fn trigger_ctx(&self, event: &str, ctx: &ScriptContext) -> Result<(), FormError> {
        let hooks: Vec<Hook> = self
            .hooks
            .lock()
            .unwrap()
            .get(event)
            .cloned()
            .unwrap_or_default();

        if hooks.is_empty() {
            return Ok(());
        }

        tracing::debug!(doctype = %self.doctype, event, hooks = hooks.len(), "running script chain");
        let event_ctx = ctx.for_event(event);
        for hook in hooks {
            hook(event_ctx.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_hooks_run_in_registration_order() {
        let scripts = ScriptManager::new("ToDo");
        let log: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            scripts.on(
                lifecycle::VALIDATE,
                hook(move |_ctx| {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push(tag);
                        Ok(())
                    }
                }),
            );
        }

        let proceed = scripts.trigger(lifecycle::VALIDATE, "TD-0001").await.unwrap();
        assert!(proceed);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_invalidate_is_soft() {
        let scripts = ScriptManager::new("ToDo");
        let ran_after: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

        scripts.on(
            lifecycle::VALIDATE,
            hook(|ctx| async move {
                ctx.invalidate();
                Ok(())
            }),
        );
        let flag = ran_after.clone();
        scripts.on(
            lifecycle::VALIDATE,
            hook(move |_ctx| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let proceed = scripts.trigger(lifecycle::VALIDATE, "TD-0001").await.unwrap();
        assert!(!proceed);
        // the chain itself ran to completion
        assert!(ran_after.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_error_short_circuits() {
        let scripts = ScriptManager::new("ToDo");
        let ran_after = Arc::new(AtomicBool::new(false));

        scripts.on(
            lifecycle::BEFORE_SAVE,
            hook(|_ctx| async move { Err(FormError::PreconditionMissing("nope".into())) }),
        );
        let flag = ran_after.clone();
        scripts.on(
            lifecycle::BEFORE_SAVE,
            hook(move |_ctx| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        assert!(scripts.trigger(lifecycle::BEFORE_SAVE, "TD-0001").await.is_err());
        assert!(!ran_after.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shared_context_spans_stages() {
        let scripts = ScriptManager::new("ToDo");
        scripts.on(
            lifecycle::VALIDATE,
            hook(|ctx| async move {
                ctx.invalidate();
                Ok(())
            }),
        );

        let ctx = scripts.context("TD-0001");
        scripts.trigger_ctx(lifecycle::VALIDATE, &ctx).await.unwrap();
        scripts.trigger_ctx(lifecycle::BEFORE_SAVE, &ctx).await.unwrap();
        assert!(!ctx.proceeding());
    }

    #[tokio::test]
    async fn test_unknown_event_is_noop() {
        let scripts = ScriptManager::new("ToDo");
        assert!(scripts.trigger("no_such_event", "TD-0001").await.unwrap());
    }
}
