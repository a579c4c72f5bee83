//! Field layout: folds a flat docfield list into sections and columns,
//! owns the field controls, and recomputes visibility dependencies.

pub mod controls;

use std::collections::HashMap;

use serde_json::Value;

use formkit_types::{DocTypeMeta, Document, FieldType};

pub use controls::{ControlVariant, FieldControl, FormatterFn, GridState, QueryFn};

/// One rendered section: columns of fieldnames in schema order.
#[derive(Debug, Clone, Default)]
pub struct Section {
    pub label: Option<String>,
    pub columns: Vec<Vec<String>>,
}

impl Section {
    fn push_field(&mut self, fieldname: &str) {
        if self.columns.is_empty() {
            self.columns.push(Vec::new());
        }
        self.columns
            .last_mut()
            .expect("section has a column")
            .push(fieldname.to_string());
    }
}

pub struct Layout {
    doctype: String,
    sections: Vec<Section>,
    /// Fieldnames in schema order (layout markers excluded).
    order: Vec<String>,
    controls: HashMap<String, FieldControl>,
    attached: Option<String>,
}

impl Layout {
    /// Build sections, columns and controls from the schema. SectionBreak
    /// opens a new section, ColumnBreak a new column; everything else
    /// gets a control.
    pub fn new(meta: &DocTypeMeta) -> Self {
        let mut sections: Vec<Section> = vec![Section::default()];
        let mut order = Vec::new();
        let mut controls = HashMap::new();

        for df in &meta.fields {
            match df.fieldtype {
                FieldType::SectionBreak => sections.push(Section {
                    label: (!df.label.is_empty()).then(|| df.label.clone()),
                    columns: Vec::new(),
                }),
                FieldType::ColumnBreak => sections
                    .last_mut()
                    .expect("layout starts with a section")
                    .columns
                    .push(Vec::new()),
                _ => {
                    sections
                        .last_mut()
                        .expect("layout starts with a section")
                        .push_field(&df.fieldname);
                    order.push(df.fieldname.clone());
                    controls.insert(df.fieldname.clone(), FieldControl::new(df.clone()));
                }
            }
        }

        Self {
            doctype: meta.name.clone(),
            sections,
            order,
            controls,
            attached: None,
        }
    }

    pub fn doctype(&self) -> &str {
        &self.doctype
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Bind the layout to a document; refresh calls render against it.
    pub fn attach_doc(&mut self, docname: &str) {
        self.attached = Some(docname.to_string());
    }

    pub fn attached(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    pub fn field(&self, fieldname: &str) -> Option<&FieldControl> {
        self.controls.get(fieldname)
    }

    pub fn field_mut(&mut self, fieldname: &str) -> Option<&mut FieldControl> {
        self.controls.get_mut(fieldname)
    }

    pub fn has_field(&self, fieldname: &str) -> bool {
        self.controls.contains_key(fieldname)
    }

    /// Fieldnames in schema order.
    pub fn fieldnames(&self) -> &[String] {
        &self.order
    }

    /// Re-render every control from the document, then re-evaluate
    /// visibility dependencies.
    pub fn refresh(&mut self, doc: &Document) {
        let order = self.order.clone();
        for fieldname in &order {
            if let Some(control) = self.controls.get_mut(fieldname) {
                control.refresh(doc);
            }
        }
        self.refresh_dependency(doc);
    }

    /// Re-render one control. Returns false when the field is unknown.
    pub fn refresh_field(&mut self, fieldname: &str, doc: &Document) -> bool {
        match self.controls.get_mut(fieldname) {
            Some(control) => {
                control.refresh(doc);
                self.refresh_dependency(doc);
                true
            }
            None => false,
        }
    }

    /// Recompute `visible` for every control from its hidden flag and
    /// `depends_on` condition.
    pub fn refresh_dependency(&mut self, doc: &Document) {
        for control in self.controls.values_mut() {
            let dep_ok = control
                .df
                .depends_on
                .as_deref()
                .map(|expr| eval_depends_on(expr, doc))
                .unwrap_or(true);
            control.visible = !control.df.hidden && dep_ok;
        }
    }

    /// Reset per-render view state on a doc switch: visible-column caches
    /// go stale (headings can change between documents) and any open
    /// inline row editor closes.
    pub fn reset_view_state(&mut self) {
        for control in self.controls.values_mut() {
            if let Some(grid) = control.grid_mut() {
                grid.visible_columns = None;
                grid.selected.clear();
                grid.open_row = None;
            }
        }
    }

    /// Close any open inline child-row editor.
    pub fn close_grid_form(&mut self) {
        for control in self.controls.values_mut() {
            if let Some(grid) = control.grid_mut() {
                grid.open_row = None;
            }
        }
    }

    /// Open the inline editor on one row of a table field.
    pub fn open_grid_row(&mut self, parentfield: &str, idx: usize) -> bool {
        match self.controls.get_mut(parentfield).and_then(FieldControl::grid_mut) {
            Some(grid) => {
                grid.open_row = Some(idx);
                true
            }
            None => false,
        }
    }

    /// The currently open `(parentfield, idx)` inline editor, if any.
    pub fn open_grid_form(&self) -> Option<(String, usize)> {
        self.controls.values().find_map(|c| {
            c.grid()
                .and_then(|g| g.open_row)
                .map(|idx| (c.fieldname().to_string(), idx))
        })
    }
}

/// Evaluate a visibility condition against the document. Supported forms:
/// `field` (truthy), `!field`, `field==literal`, `field!=literal`.
/// Anything unparseable evaluates visible rather than hiding data.
fn eval_depends_on(expr: &str, doc: &Document) -> bool {
    let expr = expr.trim();

    if let Some((field, literal)) = expr.split_once("==") {
        return field_matches(doc, field.trim(), literal.trim());
    }
    if let Some((field, literal)) = expr.split_once("!=") {
        return !field_matches(doc, field.trim(), literal.trim());
    }
    if let Some(field) = expr.strip_prefix('!') {
        return !truthy(doc.get(field.trim()));
    }
    truthy(doc.get(expr))
}

fn field_matches(doc: &Document, field: &str, literal: &str) -> bool {
    let literal = literal.trim_matches(|c| c == '"' || c == '\'');
    match doc.get(field) {
        Some(Value::String(s)) => s == literal,
        Some(Value::Number(n)) => n.to_string() == literal,
        Some(Value::Bool(b)) => b.to_string() == literal,
        _ => false,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formkit_types::DocField;
    use serde_json::json;

    fn layered_meta() -> DocTypeMeta {
        DocTypeMeta {
            name: "ToDo".into(),
            fields: vec![
                DocField::new("description", FieldType::Data),
                DocField::new("col", FieldType::ColumnBreak),
                DocField::new("priority", FieldType::Select),
                {
                    let mut df = DocField::new("details", FieldType::SectionBreak);
                    df.label = "Details".into();
                    df
                },
                {
                    let mut df = DocField::new("due_date", FieldType::Date);
                    df.depends_on = Some("has_deadline".into());
                    df
                },
                DocField::new("has_deadline", FieldType::Check),
                DocField::new("items", FieldType::Table).with_options("ToDo Item"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_section_and_column_folding() {
        let layout = Layout::new(&layered_meta());
        let sections = layout.sections();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].columns.len(), 2);
        assert_eq!(sections[0].columns[0], vec!["description"]);
        assert_eq!(sections[0].columns[1], vec!["priority"]);
        assert_eq!(sections[1].label.as_deref(), Some("Details"));
        // layout markers carry no control
        assert!(!layout.has_field("col"));
        assert!(layout.has_field("due_date"));
    }

    #[test]
    fn test_dependency_visibility() {
        let mut layout = Layout::new(&layered_meta());
        let mut doc = Document::new("ToDo", "TD-0001");

        layout.refresh(&doc);
        assert!(!layout.field("due_date").unwrap().visible);

        doc.set("has_deadline", json!(1));
        layout.refresh_dependency(&doc);
        assert!(layout.field("due_date").unwrap().visible);
    }

    #[test]
    fn test_depends_on_comparisons() {
        let mut doc = Document::new("ToDo", "TD-0001");
        doc.set("status", json!("Open"));
        assert!(eval_depends_on("status=='Open'", &doc));
        assert!(!eval_depends_on("status=='Closed'", &doc));
        assert!(eval_depends_on("status!='Closed'", &doc));
        assert!(!eval_depends_on("!status", &doc));
        // a missing field never equals a literal
        assert!(eval_depends_on("missing!='x'", &doc));
    }

    #[test]
    fn test_view_state_reset() {
        let mut layout = Layout::new(&layered_meta());
        assert!(layout.open_grid_row("items", 2));
        layout
            .field_mut("items")
            .unwrap()
            .grid_mut()
            .unwrap()
            .visible_columns = Some(vec!["item".into()]);

        assert_eq!(layout.open_grid_form(), Some(("items".into(), 2)));
        layout.reset_view_state();
        assert_eq!(layout.open_grid_form(), None);
        assert!(layout
            .field("items")
            .unwrap()
            .grid()
            .unwrap()
            .visible_columns
            .is_none());
    }

    #[test]
    fn test_refresh_renders_values() {
        let mut layout = Layout::new(&layered_meta());
        let mut doc = Document::new("ToDo", "TD-0001");
        doc.set("description", json!("hello"));

        layout.refresh(&doc);
        assert_eq!(layout.field("description").unwrap().disp_value, "hello");
    }
}
