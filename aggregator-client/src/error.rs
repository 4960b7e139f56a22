//! Error handling in [`aggregator_client`][crate]
use thiserror::Error;

pub use kube::core::ErrorResponse;

/// Possible errors when talking to the cluster
#[derive(Error, Debug)]
pub enum Error {
    /// The API server rejected a request
    ///
    /// Also used for error events on a watch stream, where a `410 Gone`
    /// means the cursor has expired.
    #[error("ApiError: {0} ({0:?})")]
    Api(#[source] ErrorResponse),

    /// Any other failure reported by the kube client
    #[error("KubeError: {0}")]
    Kube(#[source] kube::Error),

    /// Common error case when an object cannot be (de)serialized
    #[error("Error deserializing response")]
    SerdeError(#[source] serde_json::Error),

    /// The connection failed or was cut
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// HTTP status code of an API error
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Api(resp) => Some(resp.code),
            _ => None,
        }
    }

    /// Optimistic concurrency failure
    pub fn is_conflict(&self) -> bool {
        self.code() == Some(409)
    }

    /// The object does not exist
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    /// The object already exists
    pub fn is_already_exists(&self) -> bool {
        self.code() == Some(409) && matches!(self, Self::Api(resp) if resp.reason == "AlreadyExists")
    }

    /// The resource version is too old to resume from
    pub fn is_gone(&self) -> bool {
        self.code() == Some(410)
    }

    /// The kind cannot be listed by us at all: forbidden, not served or not listable
    pub fn is_unavailable(&self) -> bool {
        matches!(self.code(), Some(403 | 404 | 405)) || matches!(self, Self::Kube(kube::Error::Discovery(_)))
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(resp) => Self::Api(resp),
            kube::Error::SerdeError(e) => Self::SerdeError(e),
            other => Self::Kube(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::SerdeError(error)
    }
}

/// Build an API error the way the server reports it
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: message.into(),
        reason: reason.into(),
        code,
    })
}
