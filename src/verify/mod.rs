//! Verification primitives: output equivalence, invariant guards, skip logic.

pub mod equivalence;
pub mod guards;
pub mod skip;
