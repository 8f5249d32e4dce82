use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An operation ran before the caller provided a mandatory parameter.
    /// The caller can correct the configuration and retry.
    #[error("missing configuration: {0}")]
    NotConfigured(&'static str),

    #[error("missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    #[error("dialog already terminated")]
    DialogTerminated,

    #[error("malformed MSRP message: {0}")]
    MsrpParse(String),

    #[error("MSRP session closed")]
    SessionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
