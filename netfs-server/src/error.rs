use netfs::FsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("connection error")]
    Io(#[from] std::io::Error),
}
