/// Errors that can occur in bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] procbus_frame::FrameError),

    /// A control payload failed to serialize or parse.
    #[error("control payload error: {0}")]
    Json(#[from] serde_json::Error),

    /// A second anonymous connection tried to register an already-held name.
    #[error("module {module} already has an anonymous registration")]
    DuplicateRegistration { module: String },

    /// No connection serves the named module.
    #[error("no route to module {0}")]
    UnknownModule(String),

    /// Transport-level I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
