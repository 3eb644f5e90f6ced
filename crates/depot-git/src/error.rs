//! Error types for depot-git

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid object type: {0}")]
    InvalidObjectType(String),

    #[error("Invalid object format: {0}")]
    InvalidObjectFormat(String),

    #[error("Ref not found: {0}")]
    RefNotFound(String),

    #[error("Invalid ref name: {0}")]
    InvalidRefName(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Pack error: {0}")]
    PackError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error(transparent)]
    Store(#[from] depot_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// A named object, ref, or path that does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ObjectNotFound(_) | Error::RefNotFound(_) | Error::PathNotFound(_) => true,
            Error::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
