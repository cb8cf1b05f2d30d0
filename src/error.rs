use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeridianError {
    #[error("failed to read file")]
    FsIo(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to parse document: {0}")]
    DocumentParse(#[from] serde_yaml::Error),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("failed to decode tile data")]
    TileDecode,
    #[error("item not found")]
    NotFound,
    #[error("{0}")]
    Generic(String),
}
