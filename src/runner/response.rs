//! Invocation results as reported to the caller.

use crate::db::{QueryResult, Row};
use crate::error::{ErrorKind, RunnerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message returned on success.
pub const SUCCESS_MESSAGE: &str = "SQL query executed successfully.";

/// Outcome tag of the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// JSON body returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub status: Status,

    pub message: String,

    /// Fetched rows, present only for row-returning statements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Row>>,
}

/// A finished invocation: response body plus transport-level details.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// HTTP-style status code: 200 on success, 500 on any failure.
    pub status_code: u16,

    pub response: InvocationResponse,

    /// Kind of the failure, if any.
    pub error_kind: Option<ErrorKind>,

    pub elapsed: Duration,
}

impl Invocation {
    /// Builds a success. Rows are included only when `include_rows` is set.
    pub fn success(result: QueryResult, include_rows: bool, elapsed: Duration) -> Self {
        Self {
            status_code: 200,
            response: InvocationResponse {
                status: Status::Success,
                message: SUCCESS_MESSAGE.to_string(),
                results: include_rows.then_some(result.rows),
            },
            error_kind: None,
            elapsed,
        }
    }

    /// Builds a failure from `error`.
    pub fn failure(error: &RunnerError, elapsed: Duration) -> Self {
        Self {
            status_code: error.status_code(),
            response: InvocationResponse {
                status: Status::Error,
                message: error.to_string(),
                results: None,
            },
            error_kind: Some(error.kind()),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.response.status == Status::Success
    }
}
