//! Error types for surge-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid store name: {0:?}")]
    InvalidName(String),

    #[error("document {name} is {size} bytes, over the {limit} byte ceiling")]
    Oversized {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("document {name} is not valid JSON: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("file {} is {size} bytes, over the {limit} byte ceiling", path.display())]
    FileTooLarge {
        path: std::path::PathBuf,
        size: u64,
        limit: u64,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
