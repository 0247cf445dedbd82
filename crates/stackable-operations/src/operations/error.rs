use std::time::Duration;

use snafu::Snafu;

use crate::{
    client, collaborators,
    crd::ops_request::OpsType,
    instance,
    quantity::ParseQuantityError,
    validation,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the manager reacts to an [`Error`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum ErrorKind {
    /// The request can never succeed and is moved to `Failed`.
    Fatal,

    /// A precondition is not met yet, the request is looked at again later without surfacing an
    /// error.
    NeedWaiting,

    /// Propagated to the caller, which retries with backoff. The request phase is unchanged.
    Transient,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{message}"))]
    Fatal { message: String },

    #[snafu(display("{message}"))]
    NeedWaiting {
        message: String,
        requeue_after: Duration,
    },

    #[snafu(display("object store request failed"), context(false))]
    Client { source: client::Error },

    #[snafu(display("failed to derive pod names"), context(false))]
    Instance { source: instance::Error },

    #[snafu(display("call to an external subsystem failed"), context(false))]
    Collaborator { source: collaborators::Error },

    #[snafu(display("invalid request"), context(false))]
    Validation { source: validation::Errors },

    #[snafu(display("failed to parse quantity {quantity:?}"))]
    ParseQuantity {
        source: ParseQuantityError,
        quantity: String,
    },

    #[snafu(display("the ops request queue annotation of cluster {cluster:?} is malformed"))]
    MalformedQueue {
        source: serde_json::Error,
        cluster: String,
    },

    #[snafu(display("failed to encode {what} as JSON"))]
    EncodeJson {
        source: serde_json::Error,
        what: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fatal { .. }
            | Self::Instance { .. }
            | Self::Validation { .. }
            | Self::ParseQuantity { .. }
            | Self::EncodeJson { .. } => ErrorKind::Fatal,
            Self::Collaborator { source } => match source {
                collaborators::Error::NotFound { .. } | collaborators::Error::ActionFailed { .. } => {
                    ErrorKind::Fatal
                }
                collaborators::Error::Unavailable { .. } => ErrorKind::Transient,
            },
            Self::NeedWaiting { .. } => ErrorKind::NeedWaiting,
            Self::Client { .. } | Self::MalformedQueue { .. } => ErrorKind::Transient,
        }
    }

    /// The error followed by all its sources, as recorded in condition messages.
    pub fn report(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(error) = source {
            message.push_str(": ");
            message.push_str(&error.to_string());
            source = error.source();
        }
        message
    }

    /// The delay before the next attempt, for [`ErrorKind::NeedWaiting`] errors.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::NeedWaiting { requeue_after, .. } => Some(*requeue_after),
            _ => None,
        }
    }
}

/// Fails with a fatal error carrying `message`.
pub(crate) fn fatal<T>(message: impl Into<String>) -> Result<T> {
    FatalSnafu {
        message: message.into(),
    }
    .fail()
}

/// A handler was invoked with the payload of another operation type.
pub(crate) fn unexpected_operation<T>(actual: OpsType, expected: OpsType) -> Result<T> {
    fatal(format!(
        "expected an operation of type {expected}, but got {actual}"
    ))
}
