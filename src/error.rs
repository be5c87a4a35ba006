use crate::compare::Mismatch;
use crate::converter::ConverterError;
use crate::fixture::FixtureError;
use crate::runtime::RuntimeError;

/// The four steps every case walks through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Locate,
    Convert,
    Execute,
    Compare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum FailureKind {
    FixtureNotFound,
    ConversionError,
    ExecutionError,
    MismatchError,
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("[locate] {case}: {source}")]
    FixtureNotFound { case: String, source: FixtureError },
    #[error("[convert] {case}: {source}")]
    ConversionError { case: String, source: ConverterError },
    #[error("[execute] {case}: {source}")]
    ExecutionError { case: String, source: RuntimeError },
    #[error("[compare] {case}: {mismatch}")]
    MismatchError { case: String, mismatch: Mismatch },
}

impl HarnessError {
    pub fn case(&self) -> &str {
        match self {
            HarnessError::FixtureNotFound { case, .. }
            | HarnessError::ConversionError { case, .. }
            | HarnessError::ExecutionError { case, .. }
            | HarnessError::MismatchError { case, .. } => case,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            HarnessError::FixtureNotFound { .. } => FailureKind::FixtureNotFound,
            HarnessError::ConversionError { .. } => FailureKind::ConversionError,
            HarnessError::ExecutionError { .. } => FailureKind::ExecutionError,
            HarnessError::MismatchError { .. } => FailureKind::MismatchError,
        }
    }

    pub fn stage(&self) -> Stage {
        match self.kind() {
            FailureKind::FixtureNotFound => Stage::Locate,
            FailureKind::ConversionError => Stage::Convert,
            FailureKind::ExecutionError => Stage::Execute,
            FailureKind::MismatchError => Stage::Compare,
        }
    }
}
