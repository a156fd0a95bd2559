use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("timestamp row `{id}` was modified concurrently")]
    VersionConflict { id: String },
    #[error("timestamp row `{0}` not found")]
    RowNotFound(String),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn version_conflict(id: impl Into<String>) -> Self {
        Self::VersionConflict { id: id.into() }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
