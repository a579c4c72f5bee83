//! Shared types between the formkit engine and its collaborators
//!
//! These types are used by:
//! - the core engine (stores, layout, form controller)
//! - host shells embedding the engine (toolbars, routers)
//!
//! Serializable with serde for JSON over whatever transport the host's
//! RPC client speaks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Document lifecycle status
// ============================================================================

/// Tri-state lifecycle marker carried by every document.
///
/// Transitions are one-directional in the normal flow:
/// Draft -> Submitted -> Cancelled, or Draft -> Submitted -> (amend forks a
/// new Draft). A submitted document may be updated in place, never reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "i64", try_from = "i64")]
pub enum DocStatus {
    #[default]
    Draft,
    Submitted,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid docstatus {0}, expected 0, 1 or 2")]
pub struct InvalidDocStatus(pub i64);

impl From<DocStatus> for i64 {
    fn from(s: DocStatus) -> i64 {
        match s {
            DocStatus::Draft => 0,
            DocStatus::Submitted => 1,
            DocStatus::Cancelled => 2,
        }
    }
}

impl TryFrom<i64> for DocStatus {
    type Error = InvalidDocStatus;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(DocStatus::Draft),
            1 => Ok(DocStatus::Submitted),
            2 => Ok(DocStatus::Cancelled),
            other => Err(InvalidDocStatus(other)),
        }
    }
}

// ============================================================================
// Document
// ============================================================================

/// A single document: identity plus a dynamic fieldname -> value map.
///
/// The `#[serde(skip)]` members are session-local bookkeeping; they never
/// travel over the wire and reset to defaults when a server payload is
/// deserialized.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Document {
    pub doctype: String,
    pub name: String,
    #[serde(default)]
    pub docstatus: DocStatus,

    /// Field values keyed by fieldname. Child tables live here as arrays
    /// of row objects (see [`child_rows`](Document::child_rows)).
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,

    /// True until the document is first persisted.
    #[serde(skip)]
    pub islocal: bool,
    /// Dirty flag: at least one mutation since last load or save.
    #[serde(skip)]
    pub unsaved: bool,
    /// When the document was last synced from the server.
    #[serde(skip)]
    pub last_sync_on: Option<DateTime<Utc>>,
    /// Server-pushed invalidation: someone else modified this document.
    #[serde(skip)]
    pub needs_refresh: bool,
    /// Set when a temporary local name was replaced by a persisted one;
    /// consumed by the form's rename-cleanup pass.
    #[serde(skip)]
    pub localname: Option<String>,
    /// One-shot: run link-field triggers on the first render (defaults
    /// filled link fields on a new document).
    #[serde(skip)]
    pub run_link_triggers: bool,
}

impl Document {
    pub fn new(doctype: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn get(&self, fieldname: &str) -> Option<&Value> {
        self.fields.get(fieldname)
    }

    pub fn set(&mut self, fieldname: impl Into<String>, value: Value) {
        self.fields.insert(fieldname.into(), value);
    }

    /// A field "has a value" when it is present and neither null nor "".
    pub fn has_value(&self, fieldname: &str) -> bool {
        self.get(fieldname).map(|v| !value_is_empty(v)).unwrap_or(false)
    }

    pub fn get_str(&self, fieldname: &str) -> Option<&str> {
        self.get(fieldname).and_then(Value::as_str)
    }

    /// Child rows of a table field, in positional order. Missing or
    /// non-array values read as an empty table.
    pub fn child_rows(&self, parentfield: &str) -> Vec<&serde_json::Map<String, Value>> {
        self.get(parentfield)
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(Value::as_object).collect())
            .unwrap_or_default()
    }
}

/// Null and the empty string are interchangeable "no value" markers: text
/// widgets round-trip nulls as empty strings on render.
pub fn value_is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Keys that identify a child row within its parent rather than carrying
/// user data. Never overridden by caller-supplied row values.
pub const CHILD_IDENTITY_KEYS: &[&str] = &["name", "idx", "parent", "parentfield", "parenttype"];

// ============================================================================
// Field metadata
// ============================================================================

/// Field behavior tag. `options` on the docfield refines it (Link: target
/// doctype, Table: child doctype, Select: newline-separated choices).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum FieldType {
    Data,
    Int,
    Float,
    Check,
    Select,
    Link,
    Date,
    Datetime,
    Text,
    Attach,
    Table,
    SectionBreak,
    ColumnBreak,
    ReadOnly,
}

impl FieldType {
    /// Table-typed fields own child rows.
    pub fn is_table(self) -> bool {
        matches!(self, FieldType::Table)
    }

    /// Layout markers carry no value and get no control.
    pub fn is_layout(self) -> bool {
        matches!(self, FieldType::SectionBreak | FieldType::ColumnBreak)
    }
}

/// A single field's descriptor within a doctype. Immutable for the session;
/// per-form overrides go through the layout's docfield overlay, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocField {
    pub fieldname: String,
    #[serde(default)]
    pub label: String,
    pub fieldtype: FieldType,
    /// Link: target doctype. Table: child doctype. Select: choices.
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub reqd: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub default: Option<Value>,
    /// Visibility condition evaluated against the document; bare fieldname
    /// truthiness or a `field`, `!field`, `field==literal` expression.
    #[serde(default)]
    pub depends_on: Option<String>,
    /// Declarative auto-fetch: "link_field.source_column".
    #[serde(default)]
    pub fetch_from: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl DocField {
    pub fn new(fieldname: impl Into<String>, fieldtype: FieldType) -> Self {
        let fieldname = fieldname.into();
        Self {
            label: fieldname.clone(),
            fieldname,
            fieldtype,
            options: String::new(),
            reqd: false,
            read_only: false,
            hidden: false,
            default: None,
            depends_on: None,
            fetch_from: None,
            description: String::new(),
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }
}

// ============================================================================
// Doctype metadata
// ============================================================================

/// Schema descriptor for a document kind, fetched from the server and
/// cached per session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocTypeMeta {
    pub name: String,
    #[serde(default)]
    pub module: String,
    /// This doctype only exists as child rows of another.
    #[serde(default)]
    pub istable: bool,
    /// Exactly one document of this kind exists.
    #[serde(default)]
    pub issingle: bool,
    #[serde(default)]
    pub is_submittable: bool,
    /// Naming rule, e.g. "field:title" or "naming_series:".
    #[serde(default)]
    pub autoname: String,
    /// Field whose value is shown as the document title; falls back to name.
    #[serde(default)]
    pub title_field: Option<String>,
    #[serde(default)]
    pub track_seen: bool,
    #[serde(default)]
    pub fields: Vec<DocField>,
    #[serde(default)]
    pub permissions: Vec<DocPerm>,
}

impl DocTypeMeta {
    pub fn field(&self, fieldname: &str) -> Option<&DocField> {
        self.fields.iter().find(|df| df.fieldname == fieldname)
    }

    pub fn has_field(&self, fieldname: &str) -> bool {
        self.field(fieldname).is_some()
    }

    pub fn table_fields(&self) -> impl Iterator<Item = &DocField> {
        self.fields.iter().filter(|df| df.fieldtype.is_table())
    }

    /// Fieldnames that carry values (layout markers excluded), in schema order.
    pub fn value_fields(&self) -> impl Iterator<Item = &DocField> {
        self.fields.iter().filter(|df| !df.fieldtype.is_layout())
    }
}

// ============================================================================
// Permissions
// ============================================================================

/// Actions a permission row can grant. Computed server-side; the client
/// only reads the bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermAction {
    Read,
    Write,
    Create,
    Submit,
    Cancel,
    Amend,
    Delete,
    Print,
}

/// One permission row at one level. Level 0 is the base; higher levels
/// gate individual fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct DocPerm {
    #[serde(default)]
    pub permlevel: u8,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub submit: bool,
    #[serde(default)]
    pub cancel: bool,
    #[serde(default)]
    pub amend: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub print: bool,
}

impl DocPerm {
    pub fn allows(&self, action: PermAction) -> bool {
        match action {
            PermAction::Read => self.read,
            PermAction::Write => self.write,
            PermAction::Create => self.create,
            PermAction::Submit => self.submit,
            PermAction::Cancel => self.cancel,
            PermAction::Amend => self.amend,
            PermAction::Delete => self.delete,
            PermAction::Print => self.print,
        }
    }

    pub fn read_only_row(permlevel: u8) -> Self {
        Self {
            permlevel,
            read: true,
            print: true,
            cancel: true,
            ..Default::default()
        }
    }
}

/// Permission rows indexed by level.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PermissionSet {
    levels: Vec<DocPerm>,
}

impl PermissionSet {
    pub fn from_rows(rows: impl IntoIterator<Item = DocPerm>) -> Self {
        let mut levels: Vec<DocPerm> = Vec::new();
        for row in rows {
            let idx = row.permlevel as usize;
            if levels.len() <= idx {
                levels.resize(idx + 1, DocPerm::default());
            }
            levels[idx] = row;
        }
        Self { levels }
    }

    pub fn get(&self, permlevel: u8) -> Option<&DocPerm> {
        self.levels.get(permlevel as usize)
    }

    /// Base-level check. A missing level denies everything.
    pub fn allows(&self, permlevel: u8, action: PermAction) -> bool {
        self.get(permlevel).map(|p| p.allows(action)).unwrap_or(false)
    }

    pub fn levels(&self) -> &[DocPerm] {
        &self.levels
    }

    /// Downgrade every level to read/print/cancel, keeping the level
    /// structure. Applied when workflow marks the document read-only.
    pub fn to_read_only(&self) -> Self {
        Self {
            levels: self
                .levels
                .iter()
                .map(|p| DocPerm::read_only_row(p.permlevel))
                .collect(),
        }
    }
}

// ============================================================================
// Form actions
// ============================================================================

/// User-facing lifecycle actions routed through the save pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum FormAction {
    Create,
    Save,
    Submit,
    /// In-place update of an already-submitted document.
    Update,
    Cancel,
    Amend,
    Delete,
}

impl FormAction {
    /// Permission bit an action requires.
    pub fn required_perm(self) -> PermAction {
        match self {
            FormAction::Create => PermAction::Create,
            FormAction::Save => PermAction::Write,
            FormAction::Submit | FormAction::Update => PermAction::Submit,
            FormAction::Cancel => PermAction::Cancel,
            FormAction::Amend => PermAction::Amend,
            FormAction::Delete => PermAction::Delete,
        }
    }

    /// Wire verb sent with the persist call.
    pub fn wire_action(self) -> &'static str {
        match self {
            FormAction::Create => "Save",
            FormAction::Save => "Save",
            FormAction::Submit => "Submit",
            FormAction::Update => "Update",
            FormAction::Cancel => "Cancel",
            FormAction::Amend => "Save",
            FormAction::Delete => "Delete",
        }
    }
}

// ============================================================================
// Workflow
// ============================================================================

/// Server-computed workflow verdict for one document. The client never
/// derives this; it reads what the workflow engine decided.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowState {
    /// Workflow has frozen direct edits for the current user.
    #[serde(default)]
    pub read_only: bool,
    /// Current state name, informational.
    #[serde(default)]
    pub state: Option<String>,
    /// Actions the workflow grants despite missing base permission bits.
    #[serde(default)]
    pub allowed_actions: Vec<FormAction>,
}

// ============================================================================
// RPC envelope
// ============================================================================

/// Result of a remote call. `exc` present means the server raised; the
/// message is still whatever the server managed to produce.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RpcResult {
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub exc: Option<String>,
}

impl RpcResult {
    pub fn ok(message: Value) -> Self {
        Self { message, exc: None }
    }

    pub fn err(exc: impl Into<String>) -> Self {
        Self {
            message: Value::Null,
            exc: Some(exc.into()),
        }
    }
}

// ============================================================================
// Attachments / docinfo
// ============================================================================

/// Descriptor of an uploaded file, as returned by the upload widget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    pub file_url: String,
    pub file_name: String,
}

/// Side metadata for a document: attachments, comment count. Cached per
/// `(doctype, name)` next to the document itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocInfo {
    #[serde(default)]
    pub attachments: Vec<FileRef>,
    #[serde(default)]
    pub comment_count: u32,
}

// ============================================================================
// Event topics
// ============================================================================

/// Form-level notification topics.
pub const EVENT_FORM_LOAD: &str = "form.load";
pub const EVENT_FORM_REFRESH: &str = "form.refresh";
pub const EVENT_FORM_RENAME: &str = "form.rename";
pub const EVENT_FORM_UNLOAD: &str = "form.unload";
pub const EVENT_FORM_DIRTY: &str = "form.dirty";
pub const EVENT_RENDER_COMPLETE: &str = "form.render_complete";
pub const EVENT_DOC_SAVED: &str = "doc.saved";

// ============================================================================
// Tests
// ============================================================================
