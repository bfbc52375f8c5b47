use axum::http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conservation error: {0}")]
    Conservation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Receiver rejected the transfer: {0}")]
    Rejected(String),

    #[error("Relay answered {status}: {message}")]
    Relay { status: u16, message: String },

    #[error("Timed out connecting to the receiver")]
    ConnectTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Error: could not get $HOME value")]
    NoHomeDir,

    #[error("Could not serialize config")]
    ConfigSerialization(#[from] toml::ser::Error),

    #[error("Could not parse config file")]
    Config(#[from] Box<figment::Error>),
}

impl TransferError {
    /// HTTP status used when this error is surfaced by the relay endpoints.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransferError::Validation(_)
            | TransferError::Conservation(_)
            | TransferError::Rejected(_) => StatusCode::BAD_REQUEST,
            TransferError::UnknownSession(_) => StatusCode::NOT_FOUND,
            TransferError::ConnectTimeout => StatusCode::GATEWAY_TIMEOUT,
            TransferError::Connection(_) | TransferError::Framing(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Maps an IO failure on a live socket to a connection error.
    pub(crate) fn connection(e: std::io::Error) -> Self {
        TransferError::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
