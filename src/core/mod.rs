mod engine;
mod error;
mod index;
mod types;

pub use engine::{
    CAP_FACTOR, CAP_RATE, REGIME_BRACKETS, cap_applies, classify_regime, compute_revision, offset,
};
pub use error::{IndexSourceError, RevisionError};
pub use index::IndexTable;
pub use types::{
    BreakdownStep, CapStatus, IndexPoint, IndexRole, IndexSnapshot, Quarter, Regime,
    RevisionRequest, RevisionResult, StepValue, VarianceBasis, VariancePolicy,
};
