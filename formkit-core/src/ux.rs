//! Capability interfaces for user-facing affordances.
//!
//! The engine is headless; whatever shell embeds it supplies dialogs,
//! sounds and file pickers. Defaults here keep the engine usable without
//! a shell (tests, scripting).

use async_trait::async_trait;

use formkit_types::FileRef;

use crate::error::FormError;

/// Acknowledgment cues played at lifecycle milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Click,
    Submit,
    Cancel,
}

/// Interactive yes/no confirmation. A decline is a normal negative
/// branch, never an error.
#[async_trait]
pub trait ConfirmDialog: Send + Sync {
    async fn confirm(&self, message: &str) -> bool;
}

/// Fixed-answer dialog; the shell-less default declines everything so no
/// destructive action can run unattended.
pub struct AutoConfirm(pub bool);

#[async_trait]
impl ConfirmDialog for AutoConfirm {
    async fn confirm(&self, _message: &str) -> bool {
        self.0
    }
}

/// Sink for acknowledgment cues and blocking alerts.
pub trait UxFeedback: Send + Sync {
    fn play_cue(&self, cue: Cue);
    fn show_alert(&self, message: &str);
}

/// Logs alerts, swallows cues.
pub struct SilentFeedback;

impl UxFeedback for SilentFeedback {
    fn play_cue(&self, _cue: Cue) {}

    fn show_alert(&self, message: &str) {
        tracing::warn!(message, "form alert");
    }
}

/// File upload widget contract: the shell collects the file, uploads it
/// under the document's attachment folder, and hands back a descriptor.
#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn upload(
        &self,
        doctype: &str,
        docname: &str,
        folder: &str,
    ) -> Result<FileRef, FormError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_confirm() {
        assert!(AutoConfirm(true).confirm("sure?").await);
        assert!(!AutoConfirm(false).confirm("sure?").await);
    }
}
