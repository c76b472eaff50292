use serde::{Deserialize, Serialize};
use serde_json::json;

/// Result snapshot lifecycle: draft -> calculated -> published -> finalized.
/// Finalized is terminal; the edit-and-recalculate loop only exists before
/// publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Draft,
    Calculated,
    Published,
    Finalized,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Draft => "draft",
            ResultStatus::Calculated => "calculated",
            ResultStatus::Published => "published",
            ResultStatus::Finalized => "finalized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ResultStatus::Draft),
            "calculated" => Some(ResultStatus::Calculated),
            "published" => Some(ResultStatus::Published),
            "finalized" => Some(ResultStatus::Finalized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultAction {
    Calculate,
    RevertToDraft,
    Publish,
    Finalize,
}

impl ResultAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultAction::Calculate => "calculate",
            ResultAction::RevertToDraft => "revert_to_draft",
            ResultAction::Publish => "publish",
            ResultAction::Finalize => "finalize",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishConfirmation {
    #[serde(default)]
    pub marks_verified: bool,
    #[serde(default)]
    pub grades_reviewed: bool,
    #[serde(default)]
    pub approval_obtained: bool,
}

impl PublishConfirmation {
    pub fn missing_flags(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.marks_verified {
            missing.push("marksVerified");
        }
        if !self.grades_reviewed {
            missing.push("gradesReviewed");
        }
        if !self.approval_obtained {
            missing.push("approvalObtained");
        }
        missing
    }
}

/// Payload handed back to the caller when publication succeeds. Delivery is
/// the host's problem; this core only decides that a notification is due.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub kind: String,
    pub course_offering_id: String,
    pub publish_date: String,
    pub student_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionError {
    InvalidTransition {
        from: ResultStatus,
        action: ResultAction,
    },
    PublishPreconditionNotMet {
        missing: Vec<&'static str>,
    },
    ResultFinalized,
}

impl TransitionError {
    pub fn code(&self) -> &'static str {
        match self {
            TransitionError::InvalidTransition { .. } => "invalid_transition",
            TransitionError::PublishPreconditionNotMet { .. } => "publish_precondition_not_met",
            TransitionError::ResultFinalized => "result_finalized",
        }
    }

    pub fn message(&self) -> String {
        match self {
            TransitionError::InvalidTransition { from, action } => format!(
                "cannot {} a result in status '{}'",
                action.as_str(),
                from.as_str()
            ),
            TransitionError::PublishPreconditionNotMet { missing } => format!(
                "publish confirmation incomplete: {}",
                missing.join(", ")
            ),
            TransitionError::ResultFinalized => {
                "result is finalized; no further changes are permitted".to_string()
            }
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            TransitionError::InvalidTransition { from, action } => Some(json!({
                "currentStatus": from.as_str(),
                "requestedAction": action.as_str(),
            })),
            TransitionError::PublishPreconditionNotMet { missing } => {
                Some(json!({ "missing": missing }))
            }
            TransitionError::ResultFinalized => None,
        }
    }
}

/// The single legal-transition table. Everything not listed here is illegal;
/// finalized rejects every action with its own code so callers can tell a
/// locked snapshot from a mis-sequenced one.
pub fn transition(
    from: ResultStatus,
    action: ResultAction,
) -> Result<ResultStatus, TransitionError> {
    use ResultAction::*;
    use ResultStatus::*;

    if from == Finalized {
        return Err(TransitionError::ResultFinalized);
    }

    match (from, action) {
        (Draft, Calculate) => Ok(Calculated),
        (Calculated, Calculate) => Ok(Calculated),
        (Calculated, RevertToDraft) => Ok(Draft),
        (Calculated, Publish) => Ok(Published),
        (Published, Finalize) => Ok(Finalized),
        _ => Err(TransitionError::InvalidTransition { from, action }),
    }
}

pub fn check_publish_confirmation(
    confirmation: &PublishConfirmation,
) -> Result<(), TransitionError> {
    let missing = confirmation.missing_flags();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TransitionError::PublishPreconditionNotMet { missing })
    }
}
