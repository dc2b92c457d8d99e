use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriftnetError {
    #[error("History store error: {0}")]
    History(String),

    #[error("Fingerprint error: {0}")]
    Fingerprint(String),

    #[error("Media fetch error: {0}")]
    MediaFetch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
