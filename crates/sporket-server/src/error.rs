use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already listening")]
    AlreadyListening,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
