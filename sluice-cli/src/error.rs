use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream error: {0}")]
    Stream(#[from] sluice_engine::SluiceError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Broken pipe: consumer closed the connection")]
    BrokenPipe,
}

pub type Result<T> = std::result::Result<T, AppError>;
