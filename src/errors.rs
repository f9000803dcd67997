//! The unified error type for the archiver.

use thiserror::Error;

/// Any fault the archiver can surface, wrapping the per-module errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Fabric(#[from] crate::fabric::FabricError),

    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    #[error(transparent)]
    Store(#[from] crate::stores::StoreError),

    #[error(transparent)]
    Prefix(#[from] crate::prefix::PrefixStoreError),

    #[error(transparent)]
    Query(#[from] crate::query::QueryEvalError),

    #[error(transparent)]
    Envelope(#[from] crate::envelope::EnvelopeError),

    #[error(transparent)]
    Request(#[from] crate::requests::RequestParseError),
}
