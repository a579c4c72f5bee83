//! Presentational state for the chrome around a form: toolbar, dashboard
//! and sidebar. These consume the controller's read accessors and carry
//! no behavior of their own; a shell renders them however it likes.

use formkit_types::{DocInfo, DocStatus};

/// Inputs the toolbar derives its primary action from.
#[derive(Debug, Clone, Copy)]
pub struct ToolbarInput {
    pub docstatus: DocStatus,
    pub dirty: bool,
    pub is_new: bool,
    pub is_submittable: bool,
    pub save_disabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Toolbar {
    /// Label of the primary action button, if one applies.
    pub primary_action: Option<String>,
    /// Cached status line; cleared on doc switch so it recomputes.
    pub current_status: Option<String>,
    /// The triggering control is disabled while a save is in flight.
    pub busy: bool,
}

impl Toolbar {
    pub fn refresh(&mut self, input: ToolbarInput) {
        self.busy = false;
        self.primary_action = if input.save_disabled {
            None
        } else {
            match input.docstatus {
                DocStatus::Draft => {
                    if input.dirty || input.is_new {
                        Some("Save".to_string())
                    } else if input.is_submittable {
                        Some("Submit".to_string())
                    } else {
                        None
                    }
                }
                DocStatus::Submitted => input.dirty.then(|| "Update".to_string()),
                DocStatus::Cancelled => Some("Amend".to_string()),
            }
        };
        self.current_status = self.primary_action.clone();
    }

    pub fn clear_primary_action(&mut self) {
        self.primary_action = None;
        self.current_status = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadlineKind {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Headline {
    pub text: String,
    pub kind: HeadlineKind,
}

#[derive(Debug, Clone)]
pub struct Comment {
    pub text: String,
    pub color: String,
}

/// Banner area above the fields: headline alerts plus inline comments.
#[derive(Debug, Clone, Default)]
pub struct Dashboard {
    pub headline: Option<Headline>,
    pub comments: Vec<Comment>,
    pub docinfo: DocInfo,
}

impl Dashboard {
    /// Start of a header refresh: previous banners are stale.
    pub fn refresh(&mut self) {
        self.headline = None;
        self.comments.clear();
    }

    pub fn clear_headline(&mut self) {
        self.headline = None;
    }

    pub fn set_headline_alert(&mut self, text: impl Into<String>, kind: HeadlineKind) {
        self.headline = Some(Headline {
            text: text.into(),
            kind,
        });
    }

    pub fn add_comment(&mut self, text: impl Into<String>, color: impl Into<String>) {
        self.comments.push(Comment {
            text: text.into(),
            color: color.into(),
        });
    }

    /// Final render stage: pull side metadata in.
    pub fn set_docinfo(&mut self, docinfo: DocInfo) {
        self.docinfo = docinfo;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sidebar {
    pub user_actions: Vec<String>,
    pub shown: bool,
}

impl Sidebar {
    pub fn make(&mut self) {
        self.shown = true;
    }

    pub fn add_user_action(&mut self, label: impl Into<String>) {
        self.user_actions.push(label.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(docstatus: DocStatus, dirty: bool, is_new: bool) -> ToolbarInput {
        ToolbarInput {
            docstatus,
            dirty,
            is_new,
            is_submittable: true,
            save_disabled: false,
        }
    }

    #[test]
    fn test_primary_action_by_status() {
        let mut toolbar = Toolbar::default();

        toolbar.refresh(input(DocStatus::Draft, true, false));
        assert_eq!(toolbar.primary_action.as_deref(), Some("Save"));

        toolbar.refresh(input(DocStatus::Draft, false, false));
        assert_eq!(toolbar.primary_action.as_deref(), Some("Submit"));

        toolbar.refresh(input(DocStatus::Submitted, false, false));
        assert_eq!(toolbar.primary_action, None);

        toolbar.refresh(input(DocStatus::Submitted, true, false));
        assert_eq!(toolbar.primary_action.as_deref(), Some("Update"));

        toolbar.refresh(input(DocStatus::Cancelled, false, false));
        assert_eq!(toolbar.primary_action.as_deref(), Some("Amend"));
    }

    #[test]
    fn test_save_disabled_clears_action() {
        let mut toolbar = Toolbar::default();
        toolbar.refresh(ToolbarInput {
            save_disabled: true,
            ..input(DocStatus::Draft, true, true)
        });
        assert_eq!(toolbar.primary_action, None);
    }

    #[test]
    fn test_dashboard_refresh_clears_banners() {
        let mut dashboard = Dashboard::default();
        dashboard.set_headline_alert("stale data", HeadlineKind::Warning);
        dashboard.add_comment("Submit this document to confirm", "blue");

        dashboard.refresh();
        assert!(dashboard.headline.is_none());
        assert!(dashboard.comments.is_empty());
    }
}
