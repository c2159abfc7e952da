//! Reportable engine errors.
//!
//! Contract violations (mutating a running engine, decoder failure inside an
//! instrumented range, a just-written block missing from the cache) are not
//! here: those abort with a diagnostic. Soft failures are plain booleans.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmError {
    /// The callback/rule id counter would collide with the VM-event id bit.
    #[error("instrumentation id space exhausted")]
    InvalidEventId,
}
