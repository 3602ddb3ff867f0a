use crate::types::{PaymentAttempt, TransactionIdentity, VerificationOutcome};
use async_trait::async_trait;
use thiserror::Error;

pub mod http;

pub use http::HttpPaymentVerifier;

/// Errors from the plain request/response endpoints (history, status).
///
/// The verification endpoints never fail; they classify everything into a
/// [`VerificationOutcome`].
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("config error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

/// Backend confirmation of a sent payment.
///
/// Both calls are idempotent for the same transaction identity, so callers may
/// repeat them, including concurrently.
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    /// First confirmation of a freshly sent payment.
    async fn verify(&self, attempt: &PaymentAttempt) -> VerificationOutcome;

    /// Re-checks a payment the backend already knows about.
    async fn reverify(&self, identity: &TransactionIdentity, chat_id: &str)
    -> VerificationOutcome;
}
