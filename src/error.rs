use std::time::Duration;

use crate::store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid upload plan: {reason}")]
    InvalidPlan { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("{operation} failed for {target}")]
    RemoteSetup {
        operation: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },

    #[error(
        "append of block #{} failed after {completed} completed blocks ({elapsed:?} elapsed)",
        .index + 1
    )]
    Append {
        index: u64,
        completed: u64,
        elapsed: Duration,
        #[source]
        source: StoreError,
    },
}

impl Error {
    pub(crate) fn invalid_plan(reason: impl Into<String>) -> Self {
        Error::InvalidPlan {
            reason: reason.into(),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
