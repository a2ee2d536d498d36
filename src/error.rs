//! Recoverable error surfaces.
//!
//! Most of this crate's precondition violations are fatal assertions
//! (debug-only, matching the original's `CRUNCH_ASSERT`), but the two
//! listed here are surfaced as `Result`s instead so a host application can
//! recover without installing a panic hook.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnterError {
    #[error("this thread has already entered this scheduler")]
    AlreadyEntered,
}

#[derive(Debug, Error)]
pub enum ExtendError {
    #[error("a task may install at most one continuation via extend_with")]
    AlreadyExtended,
}
