//! Core types shared by every stage of a compilation request
//!
//! - `CompileRequest` / `CompileResult`: the public contract of the service
//! - `ServiceError`: internal failures, mapped onto a `FailureReason`
//! - `CancelToken`: explicit cancellation hook for in-flight requests

pub mod cancel;
pub mod error;
pub mod result;

pub use cancel::{cancel_pair, CancelHandle, CancelOnDrop, CancelToken};
pub use error::ServiceError;
pub use result::{CompileRequest, CompileResult, FailureReason};
