//! error.rs — the taxonomy of failures the engine can surface to callers.
use thiserror::Error;

/// Error kinds the chunked storage engine can produce.
///
/// Retryable transport failures (rate limits, transient network errors) are
/// retried internally by the bot pool and part fetcher; only failures past
/// retry exhaustion reach a caller as one of these variants.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("chat backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("rate limited, retry after {retry_after_s}s: {context}")]
    RateLimited { retry_after_s: u64, context: String },

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("source data missing: {0}")]
    SourceDataMissing(String),

    #[error("authentication failure decrypting part {part_number}")]
    AuthenticationFailure { part_number: u32 },

    #[error("file is encrypted but no key was supplied")]
    MissingKey,

    #[error("range not satisfiable: requested [{start}, {end}] outside [0, {size})")]
    RangeNotSatisfiable { start: u64, end: u64, size: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl From<sqlx::Error> for VaultError {
    fn from(e: sqlx::Error) -> Self {
        VaultError::Internal(format!("index store: {e}"))
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(e: reqwest::Error) -> Self {
        VaultError::TransferFailed(e.to_string())
    }
}

impl From<serenity::Error> for VaultError {
    fn from(e: serenity::Error) -> Self {
        classify_serenity_error(&e)
    }
}

fn classify_serenity_error(e: &serenity::Error) -> VaultError {
    if let serenity::Error::Http(http_err) = e {
        if let serenity::http::HttpError::UnsuccessfulRequest(resp) = http_err {
            let status = resp.status_code.as_u16();
            if status == 429 {
                let retry_after = resp
                    .error
                    .message
                    .parse::<f64>()
                    .unwrap_or(1.0)
                    .ceil() as u64;
                return VaultError::RateLimited {
                    retry_after_s: retry_after.max(1),
                    context: resp.error.message.clone(),
                };
            }
            if status == 403 || status == 404 {
                return VaultError::SourceDataMissing(format!("HTTP {status}: {}", resp.error.message));
            }
        }
    }
    VaultError::TransferFailed(e.to_string())
}

/// Classification of a raw HTTP status for retry purposes (bot pool, part fetcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    RetryableAfter(u64),
    Fatal,
}

pub fn classify_status(status: u16, retry_after_header: Option<u64>) -> Retryability {
    match status {
        200..=299 => Retryability::Fatal, // caller shouldn't be retrying a success
        429 => Retryability::RetryableAfter(retry_after_header.unwrap_or(1)),
        500..=599 => Retryability::Retryable,
        408 => Retryability::Retryable,
        _ => Retryability::Fatal,
    }
}
