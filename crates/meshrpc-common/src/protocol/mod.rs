//! Core protocol types: the wire [`Frame`] and the error taxonomy.
//!
//! Errors are classified as retryable or non-retryable so callers (and the
//! retry layer) can decide whether re-issuing a request against another node
//! is worthwhile. Pool-level failures additionally carry a [`FailedRequest`]
//! describing the request that failed, which the retry layer inspects.

pub mod error;
pub mod frame;

pub use error::{FailedRequest, Result, RpcError};
pub use frame::Frame;
