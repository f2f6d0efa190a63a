//! Why states die, and what kills the whole run.

use crate::solver::SolverError;
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// The error classes a state can terminate with. Each corresponds to one
/// kind of test-case artifact and can be selected by `exit-on-error-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum TerminateReason {
    Abort,
    Assert,
    BadVectorAccess,
    Exec,
    External,
    Free,
    Leak,
    Model,
    Overflow,
    Ptr,
    ReadOnly,
    ReportError,
    User,
    Unhandled,
}

/// Fatal-to-process failures. State-level trouble is handled by the
/// termination paths instead and never surfaces here.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("fatal solver failure: {0}")]
    Solver(#[from] SolverError),

    #[error("malformed module: {0}")]
    InvalidModule(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn reasons_parse_from_cli_names() {
        assert_eq!(
            TerminateReason::from_str("Ptr").unwrap(),
            TerminateReason::Ptr
        );
        assert_eq!(
            TerminateReason::from_str("BadVectorAccess").unwrap(),
            TerminateReason::BadVectorAccess
        );
        assert!(TerminateReason::from_str("NotAReason").is_err());
    }

    #[test]
    fn reasons_display_as_artifact_suffixes() {
        assert_eq!(TerminateReason::ReadOnly.to_string(), "ReadOnly");
    }
}
