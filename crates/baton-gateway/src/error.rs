use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Refusing to listen on non-loopback address: {0}")]
    NonLoopback(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Gateway server error: {0}")]
    ServerError(String),
}

#[derive(Debug, Error)]
pub enum ScreenshotError {
    #[error("Invalid screenshot request: {0}")]
    InvalidRequest(String),

    #[error("Unknown screenshot run: {0}")]
    UnknownRun(String),

    #[error("Failed to prepare screenshot directory: {0}")]
    Io(#[from] std::io::Error),
}
