//! Response finalization
//!
//! Every response a handler returns passes through the [`Finalizer`] before
//! it is written. The pipeline is ordered and fail-soft: a failing step is
//! logged and skipped, the remaining steps still run.
//!
//! 1. status-code override from configuration
//! 2. fixed, CORS and Content-Security-Policy headers ([`security`])
//! 3. `Connection` according to the negotiated keep-alive mode
//! 4. `Date`
//! 5. byte ranges for range-capable bodies ([`range`])
//! 6. content compression ([`compress`])
//! 7. final framing headers (`Content-Length`, bodiless statuses)
//!
//! A `Range` header that cannot be served turns the response into a 416,
//! which is finalized once more with steps 5 and 6 disabled.

pub mod compress;
pub mod finalizer;
pub mod range;
pub mod security;

pub use compress::{compress_fixed, encode_stream, CompressedStream, Compression, StreamEncoding};
pub use finalizer::{FinalizeContext, Finalizer};
pub use range::{ByteRange, RangeError};
pub use security::SecurityHeaders;

/// Why a finalizer step was skipped
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Invalid header: {0}")]
    Header(#[from] crate::http::Error),

    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error(transparent)]
    Range(#[from] RangeError),
}
