//! Field controls: one rendering/behavior variant per fieldtype.
//!
//! A control owns a session-local copy of its docfield (the overlay that
//! `set_df_property` and the toggle helpers write to — shared metadata is
//! never touched), the last rendered display value, and per-type state
//! (grid state for tables, choices for selects).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use formkit_types::{value_is_empty, DocField, Document, FieldType};

/// Produces link-search filters for a control, set via `set_query`.
pub type QueryFn = Arc<dyn Fn(&Document) -> Value + Send + Sync>;

/// Overrides the default value rendering of a control.
pub type FormatterFn = Arc<dyn Fn(&Value, &Document) -> String + Send + Sync>;

/// View state of a child-table control.
#[derive(Default)]
pub struct GridState {
    /// Visible-column cache; reset on doc switch since headings can
    /// differ between documents.
    pub visible_columns: Option<Vec<String>>,
    /// 1-based idx of the row open in the inline editor, if any.
    pub open_row: Option<usize>,
    /// Names of selected rows.
    pub selected: Vec<String>,
    /// Per-column link queries for fields inside the grid.
    pub child_queries: HashMap<String, QueryFn>,
    /// Session-local overrides of child docfields, seeded lazily from the
    /// child doctype's metadata.
    pub child_df: HashMap<String, DocField>,
}

pub enum ControlVariant {
    Data,
    Int,
    Float,
    Check,
    Select { choices: Vec<String> },
    Link { target: String },
    Date,
    Datetime,
    Text,
    Attach,
    Table(GridState),
    ReadOnly,
}

impl ControlVariant {
    fn for_field(df: &DocField) -> Self {
        match df.fieldtype {
            FieldType::Data => ControlVariant::Data,
            FieldType::Int => ControlVariant::Int,
            FieldType::Float => ControlVariant::Float,
            FieldType::Check => ControlVariant::Check,
            FieldType::Select => ControlVariant::Select {
                choices: df
                    .options
                    .lines()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            },
            FieldType::Link => ControlVariant::Link {
                target: df.options.clone(),
            },
            FieldType::Date => ControlVariant::Date,
            FieldType::Datetime => ControlVariant::Datetime,
            FieldType::Text => ControlVariant::Text,
            FieldType::Attach => ControlVariant::Attach,
            FieldType::Table => ControlVariant::Table(GridState::default()),
            FieldType::ReadOnly => ControlVariant::ReadOnly,
            // layout markers never get controls
            FieldType::SectionBreak | FieldType::ColumnBreak => ControlVariant::ReadOnly,
        }
    }
}

pub struct FieldControl {
    pub df: DocField,
    pub variant: ControlVariant,
    /// Last rendered display value.
    pub disp_value: String,
    /// Resolved visibility: `hidden` overlay plus `depends_on`.
    pub visible: bool,
    pub get_query: Option<QueryFn>,
    pub formatter: Option<FormatterFn>,
}

impl FieldControl {
    pub fn new(df: DocField) -> Self {
        let variant = ControlVariant::for_field(&df);
        let visible = !df.hidden;
        Self {
            df,
            variant,
            disp_value: String::new(),
            visible,
            get_query: None,
            formatter: None,
        }
    }

    pub fn fieldname(&self) -> &str {
        &self.df.fieldname
    }

    /// Re-render the display value from the document.
    pub fn refresh(&mut self, doc: &Document) {
        self.disp_value = self.render_value(doc);
    }

    pub fn value<'d>(&self, doc: &'d Document) -> Option<&'d Value> {
        doc.get(&self.df.fieldname)
    }

    /// Format the stored value for display. A formatter, when set, wins.
    pub fn render_value(&self, doc: &Document) -> String {
        let value = self.value(doc).cloned().unwrap_or(Value::Null);
        if let Some(formatter) = &self.formatter {
            return formatter(&value, doc);
        }

        match &self.variant {
            ControlVariant::Check => {
                let on = match &value {
                    Value::Bool(b) => *b,
                    Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
                    _ => false,
                };
                if on { "1" } else { "0" }.to_string()
            }
            ControlVariant::Table(_) => {
                let rows = value.as_array().map(Vec::len).unwrap_or(0);
                format!("{rows} rows")
            }
            ControlVariant::Attach => value
                .as_str()
                .map(|url| url.rsplit('/').next().unwrap_or(url).to_string())
                .unwrap_or_default(),
            _ => match value {
                Value::Null => String::new(),
                Value::String(s) => s,
                other => other.to_string(),
            },
        }
    }

    pub fn is_editable(&self) -> bool {
        self.visible && !self.df.read_only
    }

    pub fn grid(&self) -> Option<&GridState> {
        match &self.variant {
            ControlVariant::Table(grid) => Some(grid),
            _ => None,
        }
    }

    pub fn grid_mut(&mut self) -> Option<&mut GridState> {
        match &mut self.variant {
            ControlVariant::Table(grid) => Some(grid),
            _ => None,
        }
    }

    /// Valid when a required field carries a value (or is not required).
    pub fn is_valid(&self, doc: &Document) -> bool {
        if !self.df.reqd || !self.visible {
            return true;
        }
        self.value(doc).map(|v| !value_is_empty(v)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with(fieldname: &str, value: Value) -> Document {
        let mut doc = Document::new("ToDo", "TD-0001");
        doc.set(fieldname, value);
        doc
    }

    #[test]
    fn test_check_renders_binary() {
        let control = FieldControl::new(DocField::new("done", FieldType::Check));
        assert_eq!(control.render_value(&doc_with("done", json!(1))), "1");
        assert_eq!(control.render_value(&doc_with("done", json!(true))), "1");
        assert_eq!(control.render_value(&doc_with("done", json!(0))), "0");
        assert_eq!(control.render_value(&Document::new("ToDo", "x")), "0");
    }

    #[test]
    fn test_attach_renders_file_name() {
        let control = FieldControl::new(DocField::new("image", FieldType::Attach));
        assert_eq!(
            control.render_value(&doc_with("image", json!("/files/photos/cat.png"))),
            "cat.png"
        );
    }

    #[test]
    fn test_table_renders_row_count() {
        let control = FieldControl::new(
            DocField::new("items", FieldType::Table).with_options("ToDo Item"),
        );
        assert_eq!(
            control.render_value(&doc_with("items", json!([{"a": 1}, {"a": 2}]))),
            "2 rows"
        );
    }

    #[test]
    fn test_formatter_wins() {
        let mut control = FieldControl::new(DocField::new("status", FieldType::Select));
        control.formatter = Some(Arc::new(|v, _doc| {
            format!("[{}]", v.as_str().unwrap_or("-"))
        }));
        assert_eq!(control.render_value(&doc_with("status", json!("Open"))), "[Open]");
    }

    #[test]
    fn test_select_choices_parsed() {
        let df = DocField::new("priority", FieldType::Select).with_options("Low\nMedium\nHigh");
        let control = FieldControl::new(df);
        match &control.variant {
            ControlVariant::Select { choices } => {
                assert_eq!(choices, &["Low", "Medium", "High"]);
            }
            _ => panic!("expected select variant"),
        }
    }

    #[test]
    fn test_required_validity() {
        let mut df = DocField::new("description", FieldType::Data);
        df.reqd = true;
        let control = FieldControl::new(df);
        assert!(!control.is_valid(&Document::new("ToDo", "x")));
        assert!(control.is_valid(&doc_with("description", json!("hello"))));
    }
}
