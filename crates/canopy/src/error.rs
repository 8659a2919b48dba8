use thiserror::Error as ThisError;

///
/// Error
///
/// Facade error wrapper: everything the engine surfaces to applications.
///

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] canopy_core::error::EngineError),

    #[error(transparent)]
    Store(#[from] canopy_core::store::StoreError),

    #[error("unknown merge target: {0}")]
    UnknownTarget(u32),
}
