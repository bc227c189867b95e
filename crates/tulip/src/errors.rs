use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction input: unparseable connection argument, bad
    /// identifier, zero interval. Surfaced synchronously from construction.
    #[error("config error: {0}")]
    Config(String),
    /// Storage failure surfaced from the operation that triggered it.
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
