use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] concern_protocol::ProtocolError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("connection failed after {attempts} attempts: {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    #[error("live channel stopped")]
    ChannelClosed,

    #[error("sync engine stopped")]
    EngineStopped,

    #[error("{0}")]
    Other(String),
}
