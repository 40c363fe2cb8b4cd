use crate::{
    instantiate::{Outcome, Rejection, SecretError},
    k8s,
};
use std::fmt;

pub mod reason {
    pub const CREATED: &str = "Created";
    pub const MISSING_REQUESTER: &str = "MissingRequester";
    pub const SECRET_NOT_FOUND: &str = "SecretNotFound";
    pub const PARAMETER_ERROR: &str = "ParameterError";
    pub const FORBIDDEN: &str = "Forbidden";
    pub const INVALID: &str = "Invalid";
    pub const TRANSPORT_ERROR: &str = "TransportError";
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Ready,
    InstantiateFailure,
}

/// The single condition written when an instance finishes reconciling.
///
/// Its status is always `True`; the condition's presence is what marks the
/// instance as done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalCondition {
    pub type_: ConditionType,
    pub reason: &'static str,
    pub message: String,
}

// === impl ConditionType ===

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => k8s::template_instance::CONDITION_READY,
            Self::InstantiateFailure => k8s::template_instance::CONDITION_INSTANTIATE_FAILURE,
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl TerminalCondition ===

impl TerminalCondition {
    /// `Ready` only when every manifest was created. Any other outcome,
    /// including a partially created batch, is an `InstantiateFailure`
    /// whose reason is taken from the first failure in manifest order.
    pub fn from_outcome(outcome: &Outcome) -> Self {
        let total = match outcome {
            Outcome::Rejected(rejection) => {
                return Self::failure(rejection_reason(rejection), rejection.to_string());
            }
            Outcome::Attempted { total, .. } => *total,
        };

        let failures = outcome.failures().collect::<Vec<_>>();
        let Some((_, first)) = failures.first() else {
            let created = outcome.created().count();
            return Self {
                type_: ConditionType::Ready,
                reason: reason::CREATED,
                message: format!("created {created} of {total} objects"),
            };
        };

        let mut message = format!(
            "failed to create {} of {} objects: ",
            failures.len() + outcome.not_attempted(),
            total,
        );
        let details = failures
            .iter()
            .map(|(object, error)| format!("{object}: {error}"))
            .collect::<Vec<_>>();
        message.push_str(&details.join("; "));
        match outcome.not_attempted() {
            0 => {}
            1 => message.push_str("; 1 object not attempted"),
            n => message.push_str(&format!("; {n} objects not attempted")),
        }

        Self::failure(first.reason(), message)
    }

    fn failure(reason: &'static str, message: String) -> Self {
        Self {
            type_: ConditionType::InstantiateFailure,
            reason,
            message,
        }
    }

    pub fn to_status(&self, timestamp: k8s::Time) -> k8s::TemplateInstanceCondition {
        k8s::TemplateInstanceCondition {
            type_: self.type_.as_str().to_string(),
            status: "True".to_string(),
            last_transition_time: Some(timestamp),
            reason: Some(self.reason.to_string()),
            message: Some(self.message.clone()),
        }
    }
}

fn rejection_reason(rejection: &Rejection) -> &'static str {
    match rejection {
        Rejection::Identity(_) => reason::MISSING_REQUESTER,
        Rejection::Parameter(_) => reason::PARAMETER_ERROR,
        Rejection::Secret(SecretError::NotFound(_)) => reason::SECRET_NOT_FOUND,
        Rejection::Secret(SecretError::Forbidden(_)) => reason::FORBIDDEN,
        Rejection::Secret(SecretError::Transport(_)) => reason::TRANSPORT_ERROR,
    }
}
