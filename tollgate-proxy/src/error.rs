use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("proxy bind error: {0}")]
    Bind(String),
    #[error("proxy cannot {operation} while {state}")]
    State {
        operation: &'static str,
        state: &'static str,
    },
    #[error("malformed client request: {0}")]
    Protocol(String),
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },
    #[error("proxy runtime error: {0}")]
    Runtime(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
}
