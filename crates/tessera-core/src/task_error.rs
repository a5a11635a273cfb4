//! Processing task errors
//!
//! A processing run reports failures as [`TaskError`], which carries whether the
//! worker should retry the run with backoff or mark the record `failed` right away.

use std::fmt;

use crate::error::AppError;

/// Failure of one processing attempt.
#[derive(Debug)]
pub struct TaskError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl TaskError {
    /// Content problems that will not change on retry: a declared type that does
    /// not match the bytes, an undecodable image, a truncated document.
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// Transient problems: storage I/O, timeouts, a metadata store hiccup.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for TaskError {
    /// Untyped failures default to recoverable
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

impl From<AppError> for TaskError {
    fn from(err: AppError) -> Self {
        if err.is_storage_failure() {
            Self::recoverable(err)
        } else {
            Self::unrecoverable(err)
        }
    }
}

/// Extension trait for Result to tag errors with a retry policy
pub trait TaskResultExt<T> {
    /// Mark this result as unrecoverable on error
    fn unrecoverable(self) -> Result<T, TaskError>;

    /// Mark this result as recoverable on error
    fn recoverable(self) -> Result<T, TaskError>;
}

impl<T, E: Into<anyhow::Error>> TaskResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, TaskError> {
        self.map_err(|e| TaskError::unrecoverable(e.into()))
    }

    fn recoverable(self) -> Result<T, TaskError> {
        self.map_err(|e| TaskError::recoverable(e.into()))
    }
}
