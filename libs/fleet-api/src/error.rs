//! Model-level validation errors

use thiserror::Error;

/// Errors raised while interpreting resource specs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("node {node}: no credential secret on the node or the node template")]
    MissingCredential { node: String },

    #[error("node {node}: hostname {hostname} is already used by node {other}")]
    DuplicateHostname {
        node: String,
        hostname: String,
        other: String,
    },

    #[error("invalid {field}: {message}")]
    Invalid { field: String, message: String },
}
