use std::result::Result as StdResult;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error as ThisError;

use crate::range::BlockRange;

/// How a failed call should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Permanent,
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimited)
    }
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Failed to execute http request:\n{0}")]
    HttpRequest(reqwest::Error),
    #[error("Endpoint responded with http status {0}.")]
    HttpStatus(StatusCode),
    #[error("Endpoint returned rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Invalid RPC response.\n{0:?}")]
    InvalidRPCResponse(anyhow::Error),
    #[error("Endpoint request limit is exhausted for the current window.")]
    EndpointLimitTooLow,
    #[error("Endpoint worker is gone.")]
    EndpointClosed,
    #[error("Block range {range} spans {width} blocks, the maximum for a single call is {max}.")]
    RangeTooWide {
        range: BlockRange,
        width: u64,
        max: u64,
    },
    #[error("All {attempts} attempts failed. Last error: {last}")]
    RetriesFailed { attempts: u32, last: Box<Self> },
    #[error("Retry deadline of {deadline:?} exceeded. Last error: {last}")]
    DeadlineExceeded { deadline: Duration, last: Box<Self> },
    #[error("Request was cancelled.")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::HttpRequest(e) => match e.status() {
                Some(status) => status_kind(status),
                None if e.is_builder() => ErrorKind::Permanent,
                None => ErrorKind::Transient,
            },
            Error::HttpStatus(status) => status_kind(*status),
            Error::Rpc { code, message } => rpc_error_kind(*code, message),
            Error::InvalidRPCResponse(_) => ErrorKind::Transient,
            Error::EndpointLimitTooLow => ErrorKind::RateLimited,
            Error::EndpointClosed => ErrorKind::Permanent,
            Error::RangeTooWide { .. } => ErrorKind::Permanent,
            // exhausted retries surface as transient to the caller
            Error::RetriesFailed { .. } | Error::DeadlineExceeded { .. } => ErrorKind::Transient,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

fn status_kind(status: StatusCode) -> ErrorKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorKind::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

fn rpc_error_kind(code: i64, message: &str) -> ErrorKind {
    let message = message.to_ascii_lowercase();

    // result size limits, some providers send these as -32005
    if message.contains("more than") && message.contains("results")
        || message.contains("response size")
        || message.contains("too many results")
    {
        return ErrorKind::Permanent;
    }

    if code == -32005
        || message.contains("rate limit")
        || message.contains("too many requests")
    {
        return ErrorKind::RateLimited;
    }

    match code {
        // invalid request, method not found, invalid params
        -32600 | -32601 | -32602 => ErrorKind::Permanent,
        _ => ErrorKind::Transient,
    }
}

pub type Result<T> = StdResult<T, Error>;
