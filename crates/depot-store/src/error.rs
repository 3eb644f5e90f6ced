//! Error types for depot-store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The key is confirmed absent (the ENOENT of this filesystem).
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(String),

    #[error("Object store error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<heed::Error> for Error {
    fn from(e: heed::Error) -> Self {
        Error::Backend(format!("lmdb: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
