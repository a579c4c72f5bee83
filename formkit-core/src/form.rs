//! The form controller: one document's editing session.
//!
//! A [`Form`] owns the lifecycle of a single `(doctype, docname)` pair —
//! refresh/render state, dirty tracking, the save/submit/cancel
//! pipelines with their permission gates and script chains, and the
//! field helpers client scripts call. The handle is a cheap clone over
//! shared inner state; locks are fine-grained and never held across an
//! await, so script hooks may call back into the form they run under.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Map, Value};

use formkit_types::{
    DocField, DocStatus, DocTypeMeta, Document, FormAction, PermAction, PermissionSet,
    EVENT_DOC_SAVED, EVENT_FORM_DIRTY, EVENT_FORM_LOAD, EVENT_FORM_REFRESH, EVENT_FORM_RENAME,
    EVENT_FORM_UNLOAD, EVENT_RENDER_COMPLETE,
};

use crate::config::Config;
use crate::error::FormError;
use crate::events::{EventBus, FormEvent};
use crate::layout::{Layout, QueryFn};
use crate::rpc::{self, RpcClient, METHOD_DELETE, METHOD_GET, METHOD_GET_VALUE};
use crate::scripts::{lifecycle, ScriptManager};
use crate::store::{DocumentStore, FieldChange, MetaStore};
use crate::ux::{AutoConfirm, ConfirmDialog, Cue, FileUploader, SilentFeedback, UxFeedback};
use crate::views::{Dashboard, HeadlineKind, Sidebar, Toolbar, ToolbarInput};

// ============================================================================
// Collaborators
// ============================================================================

/// Everything a form session needs from the outside world.
#[derive(Clone)]
pub struct FormDeps {
    pub store: DocumentStore,
    pub meta: MetaStore,
    pub rpc: Arc<dyn RpcClient>,
    pub bus: EventBus,
    pub confirm: Arc<dyn ConfirmDialog>,
    pub feedback: Arc<dyn UxFeedback>,
    pub config: Config,
}

impl FormDeps {
    /// Defaults: declining dialogs, silent feedback, stock config.
    pub fn new(store: DocumentStore, meta: MetaStore, rpc: Arc<dyn RpcClient>) -> Self {
        Self {
            store,
            meta,
            rpc,
            bus: EventBus::default(),
            confirm: Arc::new(AutoConfirm(false)),
            feedback: Arc::new(SilentFeedback),
            config: Config::default(),
        }
    }

    pub fn with_confirm(mut self, confirm: Arc<dyn ConfirmDialog>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_feedback(mut self, feedback: Arc<dyn UxFeedback>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Declarative link auto-fetch rules: parallel `(source column, target
/// field)` lists. Append-only; duplicates allowed.
#[derive(Debug, Clone, Default)]
pub struct FetchRules {
    pub columns: Vec<String>,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomButton {
    pub label: String,
    pub group: Option<String>,
}

#[derive(Default)]
struct SessionState {
    docname: String,
    perm: PermissionSet,
    read_only: bool,
    save_disabled: bool,
    setup_done: bool,
    not_permitted: bool,
    is_onload: bool,
    status_class: Option<&'static str>,
    /// Every docname opened in this session; gates the onload chain.
    opendocs: HashSet<String>,
    fetch_dict: HashMap<String, FetchRules>,
    custom_buttons: Vec<CustomButton>,
}

/// Result of a save-family operation. `Aborted` covers every clean
/// negative branch: declined confirmation, script soft-fail, disabled
/// save. The caller observes exactly one settle point either way.
#[derive(Debug)]
pub enum SaveOutcome {
    Saved(Document),
    Aborted,
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }
}

/// Field targets for the toggle helpers: one name, a list, or every
/// field on the form (`"*"`).
pub enum FieldSelector {
    One(String),
    Many(Vec<String>),
    All,
}

impl From<&str> for FieldSelector {
    fn from(s: &str) -> Self {
        if s == "*" {
            FieldSelector::All
        } else {
            FieldSelector::One(s.to_string())
        }
    }
}

impl From<String> for FieldSelector {
    fn from(s: String) -> Self {
        FieldSelector::from(s.as_str())
    }
}

impl From<Vec<String>> for FieldSelector {
    fn from(v: Vec<String>) -> Self {
        FieldSelector::Many(v)
    }
}

impl From<&[&str]> for FieldSelector {
    fn from(v: &[&str]) -> Self {
        FieldSelector::Many(v.iter().map(ToString::to_string).collect())
    }
}

/// Docfield properties scripts may override per session.
#[derive(Debug, Clone)]
pub enum DfProperty {
    ReadOnly(bool),
    Reqd(bool),
    Hidden(bool),
    Label(String),
    Options(String),
    Description(String),
}

// ============================================================================
// Form
// ============================================================================

#[derive(Clone)]
pub struct Form {
    inner: Arc<FormInner>,
}

struct FormInner {
    doctype: String,
    meta: Arc<DocTypeMeta>,
    deps: FormDeps,
    scripts: Arc<ScriptManager>,
    state: Mutex<SessionState>,
    layout: Mutex<Option<Layout>>,
    toolbar: Mutex<Toolbar>,
    dashboard: Mutex<Dashboard>,
    sidebar: Mutex<Sidebar>,
}

impl Form {
    /// A session is bound to one doctype for its lifetime; the docname it
    /// shows may change (switch, rename, local-to-persisted transition).
    pub fn new(doctype: &str, deps: FormDeps) -> Result<Self, FormError> {
        let meta = deps.meta.get_meta(doctype)?;
        let perm = deps.meta.get_permissions(doctype);

        Ok(Self {
            inner: Arc::new(FormInner {
                doctype: doctype.to_string(),
                scripts: Arc::new(ScriptManager::new(doctype)),
                meta,
                deps,
                state: Mutex::new(SessionState {
                    perm,
                    ..Default::default()
                }),
                layout: Mutex::new(None),
                toolbar: Mutex::new(Toolbar::default()),
                dashboard: Mutex::new(Dashboard::default()),
                sidebar: Mutex::new(Sidebar::default()),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn doctype(&self) -> &str {
        &self.inner.doctype
    }

    pub fn docname(&self) -> String {
        self.state().docname.clone()
    }

    pub fn meta(&self) -> &DocTypeMeta {
        &self.inner.meta
    }

    pub fn scripts(&self) -> Arc<ScriptManager> {
        self.inner.scripts.clone()
    }

    pub fn store(&self) -> &DocumentStore {
        &self.inner.deps.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.deps.bus
    }

    pub fn toolbar(&self) -> Toolbar {
        self.inner.toolbar.lock().unwrap().clone()
    }

    pub fn dashboard(&self) -> Dashboard {
        self.inner.dashboard.lock().unwrap().clone()
    }

    pub fn sidebar(&self) -> Sidebar {
        self.inner.sidebar.lock().unwrap().clone()
    }

    pub fn custom_buttons(&self) -> Vec<CustomButton> {
        self.state().custom_buttons.clone()
    }

    pub fn get_doc(&self) -> Option<Document> {
        let docname = self.docname();
        self.inner.deps.store.get(&self.inner.doctype, &docname)
    }

    pub fn is_dirty(&self) -> bool {
        self.get_doc().map(|d| d.unsaved).unwrap_or(false)
    }

    pub fn is_new(&self) -> bool {
        self.get_doc().map(|d| d.islocal).unwrap_or(false)
    }

    pub fn get_perm(&self, permlevel: u8, action: PermAction) -> bool {
        self.state().perm.allows(permlevel, action)
    }

    pub fn has_perm(&self, action: PermAction) -> bool {
        self.get_perm(0, action)
    }

    pub fn not_permitted(&self) -> bool {
        self.state().not_permitted
    }

    /// Presentational state class derived from docstatus.
    pub fn status_class(&self) -> Option<&'static str> {
        self.state().status_class
    }

    pub fn get_title(&self) -> String {
        let doc = match self.get_doc() {
            Some(doc) => doc,
            None => return String::new(),
        };
        self.inner
            .meta
            .title_field
            .as_deref()
            .and_then(|f| doc.get_str(f).map(ToString::to_string))
            .unwrap_or_else(|| doc.name.clone())
    }

    pub fn get_docinfo(&self) -> formkit_types::DocInfo {
        let docname = self.docname();
        self.inner.deps.store.docinfo(&self.inner.doctype, &docname)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap()
    }

    fn with_layout<T>(&self, f: impl FnOnce(&mut Layout) -> T) -> Option<T> {
        self.inner.layout.lock().unwrap().as_mut().map(f)
    }

    fn current_doc(&self) -> Result<Document, FormError> {
        let docname = self.docname();
        self.inner
            .deps
            .store
            .get(&self.inner.doctype, &docname)
            .ok_or_else(|| FormError::DocumentMissing {
                doctype: self.inner.doctype.clone(),
                name: docname,
            })
    }

    fn publish(&self, topic: &str, payload: Value) {
        let docname = self.docname();
        self.inner
            .deps
            .bus
            .publish(FormEvent::new(topic, &self.inner.doctype, docname, payload));
    }

    // ------------------------------------------------------------------
    // REFRESH
    // ------------------------------------------------------------------

    /// Entry point of the render state machine. Re-entrant-safe and
    /// idempotent: with no intervening mutation, repeated calls re-render
    /// the same values and fire no extra onload chains.
    pub async fn refresh(&self, docname: Option<&str>) -> Result<(), FormError> {
        let switched = match docname {
            Some(new_name) if new_name != self.docname() => {
                self.switch_doc(new_name);
                true
            }
            _ => false,
        };

        let docname = self.docname();
        if docname.is_empty() {
            return Ok(());
        }
        let doc = self.current_doc()?;

        // permission gate: a hard stop, not an error
        let perm = self.inner.deps.meta.get_permissions(&self.inner.doctype);
        if !perm.allows(0, PermAction::Read) {
            tracing::warn!(doctype = %self.inner.doctype, docname = %docname, "read permission denied");
            let mut state = self.state();
            state.not_permitted = true;
            drop(state);
            self.inner.dashboard.lock().unwrap().set_headline_alert(
                format!("Not permitted: {} {}", self.inner.doctype, docname),
                HeadlineKind::Warning,
            );
            return Ok(());
        }

        // workflow may freeze edits; downgrade the effective set, keep base
        let read_only = self
            .inner
            .deps
            .meta
            .workflow_read_only(&self.inner.doctype, &docname);
        {
            let mut state = self.state();
            state.not_permitted = false;
            state.read_only = read_only;
            state.perm = if read_only { perm.to_read_only() } else { perm };
        }

        // staleness gate: clean documents older than the threshold reload
        // instead of re-rendering; the reload re-invokes refresh
        let already_open = self.state().opendocs.contains(&docname);
        if already_open && self.check_reload(&doc).await? {
            return Ok(());
        }

        if !self.state().setup_done {
            self.setup();
        }

        self.trigger_onload(switched).await?;

        {
            let mut state = self.state();
            state.status_class = Some(match doc.docstatus {
                DocStatus::Draft => "editable-form",
                DocStatus::Submitted => "submitted-form",
                DocStatus::Cancelled => "cancelled-form",
            });
        }

        self.show_conflict_message().await?;
        Ok(())
    }

    /// Record switch: per-render view state resets, any open inline
    /// child-row editor closes, the session points at the new docname.
    fn switch_doc(&self, docname: &str) {
        self.with_layout(|layout| {
            layout.reset_view_state();
            layout.close_grid_form();
        });
        self.state().docname = docname.to_string();
        tracing::debug!(doctype = %self.inner.doctype, docname, "switched document");
    }

    /// True when a reload was started (the caller returns early).
    async fn check_reload(&self, doc: &Document) -> Result<bool, FormError> {
        if doc.unsaved {
            return Ok(false);
        }
        let stale = doc
            .last_sync_on
            .map(|ts| {
                let age = chrono::Utc::now() - ts;
                age.to_std()
                    .map(|age| age > self.inner.deps.config.stale_refresh_after)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if stale {
            tracing::info!(doctype = %self.inner.doctype, docname = %doc.name, "document is stale, reloading");
            self.reload_doc().await?;
        }
        Ok(stale)
    }

    /// One-time construction of layout and chrome for this session.
    fn setup(&self) {
        let layout = Layout::new(&self.inner.meta);
        *self.inner.layout.lock().unwrap() = Some(layout);
        self.inner.sidebar.lock().unwrap().make();

        // declarative fetch_from rules become fetch_dict entries
        for df in &self.inner.meta.fields {
            if let Some(fetch_from) = &df.fetch_from {
                if let Some((link_field, source)) = fetch_from.split_once('.') {
                    self.add_fetch(link_field, source, &df.fieldname);
                }
            }
        }

        self.state().setup_done = true;
        tracing::info!(doctype = %self.inner.doctype, "form session set up");
    }

    /// First open of a docname runs the load chain; later refreshes
    /// render directly and fire the rename cleanup when a temporary name
    /// just became a persisted one.
    async fn trigger_onload(&self, switched: bool) -> Result<(), FormError> {
        let docname = self.docname();
        let first_open = {
            let mut state = self.state();
            state.is_onload = false;
            !state.opendocs.contains(&docname)
        };

        if first_open {
            self.state().is_onload = true;
            self.inner
                .scripts
                .trigger(lifecycle::BEFORE_LOAD, &docname)
                .await?;
            self.inner.scripts.trigger(lifecycle::ONLOAD, &docname).await?;
            self.state().opendocs.insert(docname.clone());
            self.publish(EVENT_FORM_LOAD, Value::Null);
            self.render_form(switched).await?;
            self.trigger_link_fields().await?;
        } else {
            self.render_form(switched).await?;
            if let Some(old) = self
                .inner
                .deps
                .store
                .take_localname(&self.inner.doctype, &docname)
            {
                let mut state = self.state();
                state.opendocs.remove(&old);
                state.opendocs.insert(docname.clone());
                drop(state);
                self.publish(EVENT_FORM_RENAME, json!({ "old": old }));
            }
        }
        Ok(())
    }

    /// Ordered render pipeline. The ordering is a contract: the header
    /// (and with it custom buttons) refreshes before field-triggered
    /// scripts run, because scripts may invoke buttons.
    async fn render_form(&self, switched: bool) -> Result<(), FormError> {
        let docname = self.docname();

        if !self.inner.meta.istable {
            self.with_layout(|layout| layout.attach_doc(&docname));
            self.refresh_header(switched)?;
            self.publish(EVENT_FORM_REFRESH, Value::Null);
            self.refresh_fields()?;
            self.inner.scripts.trigger(lifecycle::REFRESH, &docname).await?;
            if self.state().is_onload {
                self.inner
                    .scripts
                    .trigger(lifecycle::ONLOAD_POST_RENDER, &docname)
                    .await?;
            }
            let docinfo = self.inner.deps.store.docinfo(&self.inner.doctype, &docname);
            self.inner.dashboard.lock().unwrap().set_docinfo(docinfo);
        } else {
            self.refresh_header(switched)?;
        }

        self.publish(EVENT_RENDER_COMPLETE, Value::Null);
        Ok(())
    }

    fn refresh_header(&self, switched: bool) -> Result<(), FormError> {
        let doc = self.current_doc()?;
        let save_disabled = self.state().save_disabled;

        {
            let mut toolbar = self.inner.toolbar.lock().unwrap();
            if switched {
                toolbar.current_status = None;
            }
            toolbar.refresh(ToolbarInput {
                docstatus: doc.docstatus,
                dirty: doc.unsaved,
                is_new: doc.islocal,
                is_submittable: self.inner.meta.is_submittable,
                save_disabled,
            });
        }

        self.inner.dashboard.lock().unwrap().refresh();
        self.show_submit_message(&doc);
        self.clear_custom_buttons();
        Ok(())
    }

    fn refresh_fields(&self) -> Result<(), FormError> {
        let doc = self.current_doc()?;
        self.with_layout(|layout| layout.refresh(&doc));
        self.cleanup_refresh(&doc);
        Ok(())
    }

    /// Post-render housekeeping: amendment and trash fields only show
    /// when they carry data; autoname source fields hide once the name
    /// is assigned.
    fn cleanup_refresh(&self, doc: &Document) {
        let has_field = |f: &str| self.with_layout(|l| l.has_field(f)).unwrap_or(false);

        if has_field("amended_from") {
            let show = doc.has_value("amended_from");
            self.toggle_display("amended_from", show);
            if has_field("amendment_date") {
                self.toggle_display("amendment_date", show);
            }
        }

        if has_field("trash_reason") {
            self.toggle_display(
                "trash_reason",
                doc.has_value("trash_reason") && doc.docstatus == DocStatus::Cancelled,
            );
        }

        if let Some(fieldname) = self.inner.meta.autoname.strip_prefix("field:") {
            let fieldname = fieldname.to_string();
            if !doc.islocal && doc.has_value(&fieldname) {
                self.toggle_display(fieldname.as_str(), false);
            }
        }

        if self.inner.meta.autoname == "naming_series:" && !doc.islocal {
            self.toggle_display("naming_series", false);
        }
    }

    fn show_submit_message(&self, doc: &Document) {
        let submit_ok = self.state().perm.allows(0, PermAction::Submit);
        if self.inner.meta.is_submittable
            && submit_ok
            && !doc.unsaved
            && !doc.islocal
            && doc.docstatus == DocStatus::Draft
            && !self
                .inner
                .deps
                .meta
                .has_workflow(&self.inner.doctype, &doc.name)
        {
            self.inner
                .dashboard
                .lock()
                .unwrap()
                .add_comment("Submit this document to confirm", "blue");
        }
    }

    /// Someone else changed this document while it was open. Clean copy:
    /// silently reload. Dirty copy: banner only, never discard edits.
    async fn show_conflict_message(&self) -> Result<(), FormError> {
        let doc = match self.get_doc() {
            Some(doc) => doc,
            None => return Ok(()),
        };
        if !doc.needs_refresh {
            return Ok(());
        }
        if doc.unsaved {
            let mut dashboard = self.inner.dashboard.lock().unwrap();
            dashboard.clear_headline();
            dashboard.set_headline_alert(
                "This form has been modified after you have loaded it. Refresh to see the latest version.",
                HeadlineKind::Warning,
            );
        } else {
            self.reload_doc().await?;
        }
        Ok(())
    }

    /// Re-render one field and its dependents.
    pub fn refresh_field(&self, fieldname: &str) {
        if let Some(doc) = self.get_doc() {
            self.with_layout(|layout| layout.refresh_field(fieldname, &doc));
        }
    }

    // ------------------------------------------------------------------
    // SAVE
    // ------------------------------------------------------------------

    /// Route to plain save or the submitted-document update path based on
    /// docstatus. Does nothing while saving is disabled.
    pub async fn save_or_update(&self) -> Result<SaveOutcome, FormError> {
        if self.state().save_disabled {
            return Ok(SaveOutcome::Aborted);
        }
        let doc = self.current_doc()?;
        match doc.docstatus {
            DocStatus::Draft => self.save(FormAction::Save).await,
            DocStatus::Submitted if doc.unsaved => self.save(FormAction::Update).await,
            _ => Ok(SaveOutcome::Aborted),
        }
    }

    /// The save pipeline: disable the triggering control, let in-flight
    /// handlers settle, then gate on permissions, run the validation
    /// chains, persist, and re-render. Exactly one settle point.
    pub async fn save(&self, action: FormAction) -> Result<SaveOutcome, FormError> {
        self.set_busy(true);
        self.with_layout(|layout| layout.close_grid_form());

        // flush-pending semantics: one tick, plus whatever the host
        // configured on top
        tokio::task::yield_now().await;
        let defer = self.inner.deps.config.save_defer;
        if !defer.is_zero() {
            tokio::time::sleep(defer).await;
        }

        let result = self.validate_and_save(action).await;
        if result.is_err() {
            self.handle_save_fail();
        }
        result
    }

    async fn validate_and_save(&self, action: FormAction) -> Result<SaveOutcome, FormError> {
        let docname = self.docname();
        let doc = self.current_doc()?;

        match (action, doc.docstatus) {
            (FormAction::Update, status) if status != DocStatus::Submitted => {
                return Err(FormError::InvalidAction(
                    "Update is only valid for submitted documents".into(),
                ));
            }
            (FormAction::Submit, status) if status != DocStatus::Draft => {
                return Err(FormError::InvalidAction(
                    "only draft documents can be submitted".into(),
                ));
            }
            (FormAction::Cancel, status) if status != DocStatus::Submitted => {
                return Err(FormError::InvalidAction(
                    "only submitted documents can be cancelled".into(),
                ));
            }
            _ => {}
        }

        self.validate_form_action(action)?;

        if action != FormAction::Update {
            let ctx = self.inner.scripts.context(&docname);
            self.inner.scripts.trigger_ctx(lifecycle::VALIDATE, &ctx).await?;
            self.inner
                .scripts
                .trigger_ctx(lifecycle::BEFORE_SAVE, &ctx)
                .await?;
            if !ctx.proceeding() {
                // deliberate soft-fail: no error surfaced, control re-enabled
                tracing::info!(doctype = %self.inner.doctype, docname = %docname, "save aborted by validation script");
                self.handle_save_fail();
                return Ok(SaveOutcome::Aborted);
            }
        }

        // scripts may have mutated the document; persist what is current
        let doc = self.current_doc()?;
        let message = rpc::persist(&*self.inner.deps.rpc, &doc, action).await?;
        let synced = self.inner.deps.store.sync(message, Some(&docname))?;
        if synced.name != docname {
            // temporary-name-to-persisted-name transition; the rename
            // cleanup in the next render publishes the rename event
            let mut state = self.state();
            state.docname = synced.name.clone();
            state.opendocs.remove(&docname);
            state.opendocs.insert(synced.name.clone());
        }

        if matches!(
            action,
            FormAction::Save | FormAction::Create | FormAction::Update | FormAction::Amend
        ) {
            self.inner.deps.feedback.play_cue(Cue::Click);
        }

        self.inner
            .scripts
            .trigger(lifecycle::AFTER_SAVE, &synced.name)
            .await?;
        self.publish(EVENT_DOC_SAVED, json!({ "action": action.to_string() }));
        Box::pin(self.refresh(None)).await?;
        self.set_busy(false);

        tracing::info!(doctype = %self.inner.doctype, docname = %synced.name, action = %action, "document persisted");
        Ok(SaveOutcome::Saved(synced))
    }

    /// Submit = interactive confirmation, then the submit chains wrapped
    /// around a save. A declined dialog produces zero permission checks,
    /// zero script triggers and zero remote calls.
    pub async fn savesubmit(&self) -> Result<SaveOutcome, FormError> {
        let docname = self.docname();
        if !self
            .inner
            .deps
            .confirm
            .confirm(&format!("Permanently submit {docname}?"))
            .await
        {
            tracing::debug!(doctype = %self.inner.doctype, docname = %docname, "submit declined");
            return Ok(SaveOutcome::Aborted);
        }

        let ctx = self.inner.scripts.context(&docname);
        self.inner
            .scripts
            .trigger_ctx(lifecycle::BEFORE_SUBMIT, &ctx)
            .await?;
        if !ctx.proceeding() {
            self.handle_save_fail();
            return Ok(SaveOutcome::Aborted);
        }

        match self.save(FormAction::Submit).await? {
            SaveOutcome::Saved(doc) => {
                self.inner.deps.feedback.play_cue(Cue::Submit);
                self.inner.scripts.trigger(lifecycle::ON_SUBMIT, &doc.name).await?;
                Ok(SaveOutcome::Saved(doc))
            }
            SaveOutcome::Aborted => Ok(SaveOutcome::Aborted),
        }
    }

    /// Cancel mirrors submit: confirmation, permission, the before chain,
    /// then a direct persist — the validate/before_save chains do not run
    /// for cancellation.
    pub async fn savecancel(&self) -> Result<SaveOutcome, FormError> {
        let docname = self.docname();
        if !self
            .inner
            .deps
            .confirm
            .confirm(&format!("Permanently cancel {docname}?"))
            .await
        {
            return Ok(SaveOutcome::Aborted);
        }

        let result = self.cancel_inner(&docname).await;
        if result.is_err() {
            self.handle_save_fail();
        }
        result
    }

    async fn cancel_inner(&self, docname: &str) -> Result<SaveOutcome, FormError> {
        self.validate_form_action(FormAction::Cancel)?;

        let doc = self.current_doc()?;
        if doc.docstatus != DocStatus::Submitted {
            return Err(FormError::InvalidAction(
                "only submitted documents can be cancelled".into(),
            ));
        }

        let ctx = self.inner.scripts.context(docname);
        self.inner
            .scripts
            .trigger_ctx(lifecycle::BEFORE_CANCEL, &ctx)
            .await?;
        if !ctx.proceeding() {
            self.handle_save_fail();
            return Ok(SaveOutcome::Aborted);
        }

        self.set_busy(true);
        tokio::task::yield_now().await;

        let doc = self.current_doc()?;
        let message = rpc::persist(&*self.inner.deps.rpc, &doc, FormAction::Cancel).await?;
        let synced = self.inner.deps.store.sync(message, Some(docname))?;

        self.inner.deps.feedback.play_cue(Cue::Cancel);
        Box::pin(self.refresh(None)).await?;
        self.set_busy(false);
        self.inner
            .scripts
            .trigger(lifecycle::AFTER_CANCEL, &synced.name)
            .await?;

        tracing::info!(doctype = %self.inner.doctype, docname = %synced.name, "document cancelled");
        Ok(SaveOutcome::Saved(synced))
    }

    /// Delete the document. Returns false on a declined confirmation.
    pub async fn savetrash(&self) -> Result<bool, FormError> {
        self.validate_form_action(FormAction::Delete)?;

        let docname = self.docname();
        if !self
            .inner
            .deps
            .confirm
            .confirm(&format!("Permanently delete {docname}?"))
            .await
        {
            return Ok(false);
        }

        let result = self
            .inner
            .deps
            .rpc
            .call(
                METHOD_DELETE,
                json!({ "doctype": self.inner.doctype, "name": docname }),
            )
            .await?;
        rpc::unwrap_result(result)?;

        self.inner.deps.store.remove(&self.inner.doctype, &docname);
        self.publish(EVENT_FORM_UNLOAD, Value::Null);
        tracing::info!(doctype = %self.inner.doctype, docname = %docname, "document deleted");
        Ok(true)
    }

    /// Fork a cancelled document into a fresh draft pointing back at the
    /// original. Hard precondition: the schema must carry an
    /// `amended_from` field — checked before any copy happens.
    pub async fn amend_doc(&self) -> Result<Document, FormError> {
        if !self.inner.meta.has_field("amended_from") {
            let message = "\"amended_from\" field must be present to do an amendment.";
            self.inner.deps.feedback.show_alert(message);
            return Err(FormError::PreconditionMissing(message.into()));
        }
        self.validate_form_action(FormAction::Amend)?;

        let docname = self.docname();
        let new_doc = self
            .inner
            .deps
            .store
            .copy_doc(&self.inner.doctype, &docname, true)?;
        self.inner.deps.store.set_value(
            &self.inner.doctype,
            &new_doc.name,
            "amended_from",
            json!(docname),
        )?;
        if self.inner.meta.has_field("amendment_date") {
            self.inner.deps.store.set_value(
                &self.inner.doctype,
                &new_doc.name,
                "amendment_date",
                json!(chrono::Utc::now().date_naive().to_string()),
            )?;
        }
        self.inner.deps.feedback.play_cue(Cue::Click);

        self.inner
            .deps
            .store
            .get(&self.inner.doctype, &new_doc.name)
            .ok_or_else(|| FormError::DocumentMissing {
                doctype: self.inner.doctype.clone(),
                name: new_doc.name.clone(),
            })
    }

    /// Duplicate the current document into a new local draft.
    pub fn copy_doc(&self) -> Result<Document, FormError> {
        self.validate_form_action(FormAction::Create)?;
        let docname = self.docname();
        self.inner.deps.store.copy_doc(&self.inner.doctype, &docname, false)
    }

    /// Evict nothing, fetch the server copy, sync and re-render. Local
    /// drafts have nothing to reload.
    pub async fn reload_doc(&self) -> Result<(), FormError> {
        let docname = self.docname();
        let doc = self.current_doc()?;
        if doc.islocal {
            return Ok(());
        }

        let result = self
            .inner
            .deps
            .rpc
            .call(
                METHOD_GET,
                json!({ "doctype": self.inner.doctype, "name": docname }),
            )
            .await?;
        let message = rpc::unwrap_result(result)?;
        self.inner.deps.store.sync(message, Some(&docname))?;

        Box::pin(self.refresh(None)).await
    }

    /// Map the action to its required permission bit; a workflow override
    /// may grant the action the base bits deny. Denial re-enables the
    /// triggering control and never reaches the network.
    pub fn validate_form_action(&self, action: FormAction) -> Result<(), FormError> {
        let docname = self.docname();
        let required = action.required_perm();

        let perm_ok = self.state().perm.allows(0, required);
        let workflow_ok = self
            .inner
            .deps
            .meta
            .workflow_allows(&self.inner.doctype, &docname, action);

        if !perm_ok && !workflow_ok {
            self.handle_save_fail();
            let err = FormError::PermissionDenied {
                action,
                doctype: self.inner.doctype.clone(),
            };
            self.inner.deps.feedback.show_alert(&err.to_string());
            return Err(err);
        }
        Ok(())
    }

    pub fn enable_save(&self) {
        self.state().save_disabled = false;
        if let Some(doc) = self.get_doc() {
            self.inner.toolbar.lock().unwrap().refresh(ToolbarInput {
                docstatus: doc.docstatus,
                dirty: doc.unsaved,
                is_new: doc.islocal,
                is_submittable: self.inner.meta.is_submittable,
                save_disabled: false,
            });
        }
    }

    pub fn disable_save(&self) {
        self.state().save_disabled = true;
        self.inner.toolbar.lock().unwrap().clear_primary_action();
    }

    fn set_busy(&self, busy: bool) {
        self.inner.toolbar.lock().unwrap().busy = busy;
    }

    /// Restore the triggering control so the user may retry.
    fn handle_save_fail(&self) {
        self.set_busy(false);
    }

    // ------------------------------------------------------------------
    // HELPERS
    // ------------------------------------------------------------------

    /// Set one field. Unknown fieldnames are a blocking error. Table
    /// fields given an array replace all rows (clear, then rebuild in
    /// positional order) — deliberately not a merge.
    pub async fn set_value(&self, fieldname: &str, value: Value) -> Result<(), FormError> {
        self.set_single(fieldname, value).await
    }

    /// Set many fields sequentially in the given order; each field's
    /// change hooks settle before the next field is touched. An unknown
    /// field aborts the remaining batch.
    pub async fn set_values(&self, values: Vec<(String, Value)>) -> Result<(), FormError> {
        for (fieldname, value) in values {
            self.set_single(&fieldname, value).await?;
        }
        Ok(())
    }

    async fn set_single(&self, fieldname: &str, value: Value) -> Result<(), FormError> {
        let df = match self.get_docfield(fieldname, None) {
            Some(df) => df,
            None => {
                self.inner
                    .deps
                    .feedback
                    .show_alert(&format!("Field {fieldname} not found."));
                return Err(FormError::FieldNotFound(fieldname.to_string()));
            }
        };
        let docname = self.docname();

        if df.fieldtype.is_table() {
            if let Value::Array(rows) = &value {
                // replace-all: clear, then rebuild preserving position
                self.inner
                    .deps
                    .store
                    .clear_table(&self.inner.doctype, &docname, fieldname)?;
                for (i, row) in rows.iter().enumerate() {
                    let values = row.as_object().cloned();
                    self.inner.deps.store.add_child(
                        &self.inner.doctype,
                        &docname,
                        &df.options,
                        fieldname,
                        values,
                        Some(i + 1),
                    )?;
                }
                self.refresh_field(fieldname);
                self.publish(EVENT_FORM_DIRTY, json!({ "fieldname": fieldname }));
                return Ok(());
            }
        }

        if let Some(change) =
            self.inner
                .deps
                .store
                .set_value(&self.inner.doctype, &docname, fieldname, value)?
        {
            self.handle_field_change(change).await?;
        }
        Ok(())
    }

    /// Everything that follows a field mutation, in order: dirty
    /// notification, control re-render, link auto-fetch, field script
    /// triggers.
    async fn handle_field_change(&self, change: FieldChange) -> Result<(), FormError> {
        self.publish(EVENT_FORM_DIRTY, json!({ "fieldname": change.fieldname }));
        self.refresh_field(&change.fieldname);
        self.run_fetches(&change.fieldname, &change.value).await?;
        self.inner
            .scripts
            .trigger(&change.fieldname, &change.name)
            .await?;
        Ok(())
    }

    /// Register a link auto-fetch rule: when `link_field` resolves, copy
    /// `source` off the linked document into `target`. Stored, not
    /// executed; execution happens on the link-change path.
    pub fn add_fetch(&self, link_field: &str, source: &str, target: &str) {
        let mut state = self.state();
        let rules = state.fetch_dict.entry(link_field.to_string()).or_default();
        rules.columns.push(source.to_string());
        rules.fields.push(target.to_string());
    }

    pub fn fetch_rules(&self, link_field: &str) -> Option<FetchRules> {
        self.state().fetch_dict.get(link_field).cloned()
    }

    async fn run_fetches(&self, fieldname: &str, value: &Value) -> Result<(), FormError> {
        let rules = match self.state().fetch_dict.get(fieldname).cloned() {
            Some(rules) if !rules.columns.is_empty() => rules,
            _ => return Ok(()),
        };
        if formkit_types::value_is_empty(value) {
            return Ok(());
        }
        let target_doctype = match self.get_docfield(fieldname, None) {
            Some(df) if !df.options.is_empty() => df.options,
            _ => return Ok(()),
        };

        let result = self
            .inner
            .deps
            .rpc
            .call(
                METHOD_GET_VALUE,
                json!({
                    "doctype": target_doctype,
                    "name": value,
                    "fields": rules.columns,
                }),
            )
            .await?;
        let message = rpc::unwrap_result(result)?;

        let docname = self.docname();
        for (column, target) in rules.columns.iter().zip(rules.fields.iter()) {
            if let Some(fetched) = message.get(column) {
                if let Some(_change) = self.inner.deps.store.set_value(
                    &self.inner.doctype,
                    &docname,
                    target,
                    fetched.clone(),
                )? {
                    self.refresh_field(target);
                }
            }
        }
        Ok(())
    }

    /// Link fields that got default values on a new document run their
    /// fetch and trigger pass on the first render.
    async fn trigger_link_fields(&self) -> Result<(), FormError> {
        let docname = self.docname();
        if !self.is_new()
            || !self
                .inner
                .deps
                .store
                .take_run_link_triggers(&self.inner.doctype, &docname)
        {
            return Ok(());
        }

        let doc = self.current_doc()?;
        let link_fields: Vec<(String, Value)> = self
            .inner
            .meta
            .fields
            .iter()
            .filter(|df| df.fieldtype == formkit_types::FieldType::Link)
            .filter_map(|df| {
                doc.get(&df.fieldname)
                    .filter(|v| !formkit_types::value_is_empty(v))
                    .map(|v| (df.fieldname.clone(), v.clone()))
            })
            .collect();

        for (fieldname, value) in link_fields {
            self.run_fetches(&fieldname, &value).await?;
            self.inner.scripts.trigger(&fieldname, &docname).await?;
        }
        Ok(())
    }

    /// Append a child row; caller values never override row identity.
    pub fn add_child(
        &self,
        fieldname: &str,
        values: Option<Map<String, Value>>,
    ) -> Result<Map<String, Value>, FormError> {
        let df = self
            .get_docfield(fieldname, None)
            .ok_or_else(|| FormError::FieldNotFound(fieldname.to_string()))?;
        let docname = self.docname();
        let row = self.inner.deps.store.add_child(
            &self.inner.doctype,
            &docname,
            &df.options,
            fieldname,
            values,
            None,
        )?;
        self.refresh_field(fieldname);
        Ok(row)
    }

    pub fn clear_table(&self, fieldname: &str) -> Result<(), FormError> {
        let docname = self.docname();
        self.inner
            .deps
            .store
            .clear_table(&self.inner.doctype, &docname, fieldname)?;
        self.refresh_field(fieldname);
        Ok(())
    }

    /// Fill a child column in every row where it is missing.
    pub fn update_in_all_rows(
        &self,
        table_fieldname: &str,
        fieldname: &str,
        value: Value,
    ) -> Result<(), FormError> {
        if formkit_types::value_is_empty(&value) {
            return Ok(());
        }
        let doc = self.current_doc()?;
        let docname = doc.name.clone();
        let missing: Vec<usize> = doc
            .child_rows(table_fieldname)
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.get(fieldname)
                    .map(formkit_types::value_is_empty)
                    .unwrap_or(true)
            })
            .map(|(i, _)| i + 1)
            .collect();

        for idx in missing {
            self.inner.deps.store.set_child_value(
                &self.inner.doctype,
                &docname,
                table_fieldname,
                idx,
                fieldname,
                value.clone(),
            )?;
        }
        self.refresh_field(table_fieldname);
        Ok(())
    }

    pub fn get_sum(&self, table_fieldname: &str, fieldname: &str) -> f64 {
        self.get_doc()
            .map(|doc| {
                doc.child_rows(table_fieldname)
                    .iter()
                    .filter_map(|row| row.get(fieldname).and_then(Value::as_f64))
                    .sum()
            })
            .unwrap_or(0.0)
    }

    /// Display-formatted value of a field, via its control.
    pub fn get_formatted(&self, fieldname: &str) -> String {
        let doc = match self.get_doc() {
            Some(doc) => doc,
            None => return String::new(),
        };
        self.with_layout(|layout| layout.field(fieldname).map(|c| c.render_value(&doc)))
            .flatten()
            .unwrap_or_default()
    }

    /// Selected child rows per table field, by row name.
    pub fn get_selected(&self) -> HashMap<String, Vec<String>> {
        self.with_layout(|layout| {
            let mut selected = HashMap::new();
            for fieldname in layout.fieldnames().to_vec() {
                if let Some(grid) = layout.field(&fieldname).and_then(|c| c.grid()) {
                    if !grid.selected.is_empty() {
                        selected.insert(fieldname.clone(), grid.selected.clone());
                    }
                }
            }
            selected
        })
        .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Field property helpers
    // ------------------------------------------------------------------

    fn field_map(&self, fields: FieldSelector, apply: impl Fn(&mut DocField)) {
        let doc = self.get_doc();
        self.with_layout(|layout| {
            let names: Vec<String> = match fields {
                FieldSelector::One(name) => vec![name],
                FieldSelector::Many(names) => names,
                FieldSelector::All => layout.fieldnames().to_vec(),
            };
            for name in names {
                if let Some(control) = layout.field_mut(&name) {
                    apply(&mut control.df);
                    if let Some(doc) = &doc {
                        control.refresh(doc);
                    }
                }
            }
            if let Some(doc) = &doc {
                layout.refresh_dependency(doc);
            }
        });
    }

    pub fn toggle_enable(&self, fields: impl Into<FieldSelector>, enable: bool) {
        self.field_map(fields.into(), |df| df.read_only = !enable);
    }

    pub fn toggle_reqd(&self, fields: impl Into<FieldSelector>, mandatory: bool) {
        self.field_map(fields.into(), |df| df.reqd = mandatory);
    }

    pub fn toggle_display(&self, fields: impl Into<FieldSelector>, show: bool) {
        self.field_map(fields.into(), |df| df.hidden = !show);
    }

    /// Session-local docfield lookup: the layout overlay when present,
    /// the shared schema otherwise. With `child_fieldname`, resolves
    /// inside the table field's child doctype.
    pub fn get_docfield(&self, fieldname: &str, child_fieldname: Option<&str>) -> Option<DocField> {
        match child_fieldname {
            None => self
                .with_layout(|layout| layout.field(fieldname).map(|c| c.df.clone()))
                .flatten()
                .or_else(|| self.inner.meta.field(fieldname).cloned()),
            Some(child) => {
                let parent_df = self.get_docfield(fieldname, None)?;
                let overlay = self
                    .with_layout(|layout| {
                        layout
                            .field(fieldname)
                            .and_then(|c| c.grid())
                            .and_then(|g| g.child_df.get(child).cloned())
                    })
                    .flatten();
                overlay.or_else(|| self.inner.deps.meta.docfield(&parent_df.options, child))
            }
        }
    }

    /// Override one property of a field's session-local docfield; the
    /// control re-renders only when the value actually changed.
    pub fn set_df_property(&self, fieldname: &str, prop: DfProperty) -> Result<(), FormError> {
        let doc = self.get_doc();
        let changed = self
            .with_layout(|layout| {
                layout.field_mut(fieldname).map(|control| {
                    let changed = apply_df_property(&mut control.df, prop);
                    if changed {
                        if let Some(doc) = &doc {
                            control.refresh(doc);
                        }
                    }
                    changed
                })
            })
            .flatten()
            .ok_or_else(|| FormError::FieldNotFound(fieldname.to_string()))?;

        if changed {
            if let Some(doc) = &doc {
                self.with_layout(|layout| layout.refresh_dependency(doc));
            }
        }
        Ok(())
    }

    /// Same, for a field inside a child table.
    pub fn set_child_df_property(
        &self,
        table_field: &str,
        fieldname: &str,
        prop: DfProperty,
    ) -> Result<(), FormError> {
        let child_df = self
            .get_docfield(table_field, Some(fieldname))
            .ok_or_else(|| FormError::FieldNotFound(fieldname.to_string()))?;

        self.with_layout(|layout| {
            if let Some(grid) = layout.field_mut(table_field).and_then(|c| c.grid_mut()) {
                let df = grid
                    .child_df
                    .entry(fieldname.to_string())
                    .or_insert(child_df);
                apply_df_property(df, prop);
                Ok(())
            } else {
                Err(FormError::FieldNotFound(table_field.to_string()))
            }
        })
        .unwrap_or_else(|| Err(FormError::FieldNotFound(table_field.to_string())))?;

        self.refresh_field(table_field);
        Ok(())
    }

    /// Install a link-search filter on a field.
    pub fn set_query(&self, fieldname: &str, query: QueryFn) -> Result<(), FormError> {
        self.with_layout(|layout| {
            layout
                .field_mut(fieldname)
                .map(|control| control.get_query = Some(query))
        })
        .flatten()
        .ok_or_else(|| FormError::FieldNotFound(fieldname.to_string()))
    }

    /// Install a link-search filter on a column of a child table.
    pub fn set_child_query(
        &self,
        table_field: &str,
        fieldname: &str,
        query: QueryFn,
    ) -> Result<(), FormError> {
        self.with_layout(|layout| {
            layout
                .field_mut(table_field)
                .and_then(|c| c.grid_mut())
                .map(|grid| {
                    grid.child_queries.insert(fieldname.to_string(), query);
                })
        })
        .flatten()
        .ok_or_else(|| FormError::FieldNotFound(table_field.to_string()))
    }

    // ------------------------------------------------------------------
    // Custom buttons
    // ------------------------------------------------------------------

    pub fn add_custom_button(&self, label: &str, group: Option<&str>) {
        let mut state = self.state();
        let button = CustomButton {
            label: label.to_string(),
            group: group.map(ToString::to_string),
        };
        if !state.custom_buttons.contains(&button) {
            state.custom_buttons.push(button);
        }
    }

    pub fn remove_custom_button(&self, label: &str, group: Option<&str>) {
        self.state()
            .custom_buttons
            .retain(|b| !(b.label == label && b.group.as_deref() == group));
    }

    pub fn clear_custom_buttons(&self) {
        self.state().custom_buttons.clear();
    }

    // ------------------------------------------------------------------
    // ACTIONS
    // ------------------------------------------------------------------

    /// Another session renamed the document; follow it if it is ours.
    pub fn rename_notify(&self, old: &str, new: &str) {
        if self.inner.meta.istable {
            return;
        }
        {
            let mut state = self.state();
            if state.docname != old {
                return;
            }
            state.docname = new.to_string();
            state.opendocs.remove(old);
            state.opendocs.insert(new.to_string());
        }
        self.publish(EVENT_FORM_RENAME, json!({ "old": old, "new": new }));
        tracing::debug!(doctype = %self.inner.doctype, old, new, "form followed rename");
    }

    /// Call a document-bound server method; an object result merges into
    /// the document through the normal set_value path.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, FormError> {
        let docname = self.docname();
        let result = self
            .inner
            .deps
            .rpc
            .call(
                method,
                json!({
                    "doctype": self.inner.doctype,
                    "name": docname,
                    "args": args,
                }),
            )
            .await?;
        let message = rpc::unwrap_result(result)?;

        if let Value::Object(map) = &message {
            let known: Vec<(String, Value)> = map
                .iter()
                .filter(|(k, _)| self.get_docfield(k, None).is_some())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.set_values(known).await?;
        }
        Ok(message)
    }

    /// Fire a script event chain by name.
    pub async fn trigger(&self, event: &str) -> Result<bool, FormError> {
        let docname = self.docname();
        self.inner.scripts.trigger(event, &docname).await
    }

    /// Attach a file through the shell's upload widget. New documents
    /// must be saved first; uploads land in the document's attachment
    /// folder and show up in docinfo.
    pub async fn upload_attachment(
        &self,
        uploader: &dyn FileUploader,
    ) -> Result<formkit_types::FileRef, FormError> {
        if self.is_new() {
            let message = "Please save before attaching.";
            self.inner.deps.feedback.show_alert(message);
            return Err(FormError::PreconditionMissing(message.into()));
        }

        let docname = self.docname();
        let file = uploader
            .upload(&self.inner.doctype, &docname, "Home/Attachments")
            .await?;

        let mut info = self.inner.deps.store.docinfo(&self.inner.doctype, &docname);
        info.attachments.push(file.clone());
        self.inner
            .deps
            .store
            .set_docinfo(&self.inner.doctype, &docname, info.clone());
        self.inner.dashboard.lock().unwrap().set_docinfo(info);
        tracing::debug!(doctype = %self.inner.doctype, docname = %docname, file = %file.file_name, "attachment uploaded");
        Ok(file)
    }

    /// Attachments of the current document, sorted by file name.
    pub fn get_files(&self) -> Vec<formkit_types::FileRef> {
        let mut files = self.get_docinfo().attachments;
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        files
    }
}

fn apply_df_property(df: &mut DocField, prop: DfProperty) -> bool {
    match prop {
        DfProperty::ReadOnly(v) => set_if_changed(&mut df.read_only, v),
        DfProperty::Reqd(v) => set_if_changed(&mut df.reqd, v),
        DfProperty::Hidden(v) => set_if_changed(&mut df.hidden, v),
        DfProperty::Label(v) => set_if_changed(&mut df.label, v),
        DfProperty::Options(v) => set_if_changed(&mut df.options, v),
        DfProperty::Description(v) => set_if_changed(&mut df.description, v),
    }
}

fn set_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use formkit_types::{DocPerm, FieldType, RpcResult};

    struct NullRpc;

    #[async_trait]
    impl RpcClient for NullRpc {
        async fn call(&self, _method: &str, _args: Value) -> Result<RpcResult, FormError> {
            Ok(RpcResult::ok(Value::Null))
        }
    }

    fn todo_meta() -> DocTypeMeta {
        DocTypeMeta {
            name: "ToDo".into(),
            is_submittable: true,
            fields: vec![
                DocField::new("description", FieldType::Data),
                DocField::new("assignee", FieldType::Link).with_options("User"),
                DocField::new("items", FieldType::Table).with_options("ToDo Item"),
            ],
            ..Default::default()
        }
    }

    fn full_perms() -> PermissionSet {
        PermissionSet::from_rows([DocPerm {
            permlevel: 0,
            read: true,
            write: true,
            create: true,
            submit: true,
            cancel: true,
            amend: true,
            delete: true,
            print: true,
        }])
    }

    fn make_form() -> Form {
        let store = DocumentStore::new();
        let meta = MetaStore::new();
        meta.register_meta(todo_meta());
        meta.set_permissions("ToDo", full_perms());
        let deps = FormDeps::new(store, meta, Arc::new(NullRpc));
        Form::new("ToDo", deps).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_requires_loaded_doc() {
        let form = make_form();
        let err = form.refresh(Some("TD-0404")).await.unwrap_err();
        assert!(matches!(err, FormError::DocumentMissing { .. }));
    }

    #[tokio::test]
    async fn test_setup_happens_once() {
        let form = make_form();
        let doc = form.store().new_doc(form.meta());
        form.refresh(Some(&doc.name)).await.unwrap();
        assert!(form.sidebar().shown);

        // second refresh reuses the session layout
        form.set_df_property("description", DfProperty::Label("What".into()))
            .unwrap();
        form.refresh(None).await.unwrap();
        assert_eq!(
            form.get_docfield("description", None).unwrap().label,
            "What"
        );
    }

    #[tokio::test]
    async fn test_toggle_helpers_hit_all_fields() {
        let form = make_form();
        let doc = form.store().new_doc(form.meta());
        form.refresh(Some(&doc.name)).await.unwrap();

        form.toggle_enable("*", false);
        for f in ["description", "assignee", "items"] {
            assert!(form.get_docfield(f, None).unwrap().read_only, "{f}");
        }
        form.toggle_enable(vec!["description".to_string()], true);
        assert!(!form.get_docfield("description", None).unwrap().read_only);
        assert!(form.get_docfield("assignee", None).unwrap().read_only);
    }

    #[tokio::test]
    async fn test_set_value_unknown_field() {
        let form = make_form();
        let doc = form.store().new_doc(form.meta());
        form.refresh(Some(&doc.name)).await.unwrap();

        let err = form.set_value("no_such_field", json!(1)).await.unwrap_err();
        assert!(matches!(err, FormError::FieldNotFound(f) if f == "no_such_field"));
    }

    #[tokio::test]
    async fn test_table_set_value_replaces_rows() {
        let form = make_form();
        let doc = form.store().new_doc(form.meta());
        form.refresh(Some(&doc.name)).await.unwrap();

        form.add_child("items", None).unwrap();
        form.add_child("items", None).unwrap();

        form.set_value("items", json!([{ "item": "only" }])).await.unwrap();
        let doc = form.get_doc().unwrap();
        let rows = doc.child_rows("items");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["item"], json!("only"));
        assert_eq!(rows[0]["idx"], json!(1));
    }

    #[tokio::test]
    async fn test_add_fetch_is_append_only() {
        let form = make_form();
        form.add_fetch("assignee", "email", "assignee_email");
        form.add_fetch("assignee", "full_name", "assignee_name");
        form.add_fetch("assignee", "email", "assignee_email"); // duplicate allowed

        let rules = form.fetch_rules("assignee").unwrap();
        assert_eq!(rules.columns, vec!["email", "full_name", "email"]);
        assert_eq!(rules.fields, vec!["assignee_email", "assignee_name", "assignee_email"]);
    }

    #[tokio::test]
    async fn test_get_sum_and_update_in_all_rows() {
        let form = make_form();
        let doc = form.store().new_doc(form.meta());
        form.refresh(Some(&doc.name)).await.unwrap();

        let mut row = Map::new();
        row.insert("qty".into(), json!(2.5));
        form.add_child("items", Some(row)).unwrap();
        form.add_child("items", None).unwrap();

        form.update_in_all_rows("items", "qty", json!(4.0)).unwrap();
        assert_eq!(form.get_sum("items", "qty"), 6.5);
    }

    #[tokio::test]
    async fn test_custom_buttons_dedupe_and_clear() {
        let form = make_form();
        form.add_custom_button("Fetch Items", Some("Tools"));
        form.add_custom_button("Fetch Items", Some("Tools"));
        form.add_custom_button("Close", None);
        assert_eq!(form.custom_buttons().len(), 2);

        form.remove_custom_button("Close", None);
        assert_eq!(form.custom_buttons().len(), 1);

        form.clear_custom_buttons();
        assert!(form.custom_buttons().is_empty());
    }

    #[tokio::test]
    async fn test_rename_notify_follows_own_doc_only() {
        let form = make_form();
        let doc = form.store().new_doc(form.meta());
        form.refresh(Some(&doc.name)).await.unwrap();

        form.rename_notify("someone-else", "TD-0002");
        assert_eq!(form.docname(), doc.name);

        form.rename_notify(&doc.name, "TD-0002");
        assert_eq!(form.docname(), "TD-0002");
    }

    #[tokio::test]
    async fn test_save_disabled_blocks_save_or_update() {
        let form = make_form();
        let doc = form.store().new_doc(form.meta());
        form.refresh(Some(&doc.name)).await.unwrap();

        form.disable_save();
        assert!(!form.save_or_update().await.unwrap().is_saved());
        assert_eq!(form.toolbar().primary_action, None);
    }
}
