use thiserror::Error;

/// Errors raised by the client-less building blocks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An operator without a name cannot own a label key
    #[error("operator name is empty")]
    EmptyName,

    /// The name cannot be used as the name segment of a label key
    #[error("operator name {name:?} cannot form a label key: {reason}")]
    InvalidName {
        /// The offending name
        name: String,
        /// Which label key rule the name violates
        reason: &'static str,
    },

    /// An object lacks a field needed to reference it
    #[error("object is missing {0}")]
    MissingField(&'static str),

    /// A group/version/kind string could not be parsed
    #[error("failed to parse group version kind: {0:?}")]
    InvalidKind(String),
}
