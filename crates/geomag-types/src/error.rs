use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeoMagError {
    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Numerical breakdown at iteration {iteration}: {message}")]
    Numerical { iteration: usize, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type GeoMagResult<T> = Result<T, GeoMagError>;
