//! Type errors reported by the checker.

use thiserror::Error;

use super::solver::{SolveError, SolveFailure};
use crate::context::Context;

#[derive(Debug, Clone, Error)]
pub enum TypeError {
    #[error("type error: {reason}")]
    Mismatch { reason: String, context: Context },

    #[error("ambiguous type")]
    Ambiguous { context: Context },

    #[error("cannot infer types for: {}", vars.join(", "))]
    Flounder {
        vars: Vec<String>,
        remaining: Vec<String>,
    },

    #[error("{message}")]
    BadProgram { message: String, context: Context },
}

impl TypeError {
    /// The source context to point diagnostics at, when there is one.
    pub fn context(&self) -> Option<&Context> {
        match self {
            TypeError::Mismatch { context, .. } => Some(context),
            TypeError::Ambiguous { context } => Some(context),
            TypeError::Flounder { .. } => None,
            TypeError::BadProgram { context, .. } => Some(context),
        }
    }
}

impl From<SolveFailure> for TypeError {
    fn from(failure: SolveFailure) -> Self {
        TypeError::Mismatch {
            reason: failure.reason.to_string(),
            context: failure.context,
        }
    }
}

impl From<SolveError> for TypeError {
    fn from(error: SolveError) -> Self {
        match error {
            SolveError::Failure(failure) => failure.into(),
            SolveError::Ambiguous { context } => TypeError::Ambiguous { context },
            SolveError::Flounder { vars, remaining } => TypeError::Flounder { vars, remaining },
        }
    }
}
