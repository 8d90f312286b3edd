use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unknown job: {0}")]
    JobNotFound(String),

    #[error("no thumbnail for item {item_id} in job {job_id}")]
    ThumbnailMissing { job_id: String, item_id: String },

    #[error("cannot open browser: {0}")]
    BrowserLaunch(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("job canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
