use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that keep the server from starting or reconfiguring.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create listening socket for {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("malformed bind address {0:?}")]
    BindAddress(String),
    #[error("shared folder {path} is unusable: {source}")]
    InvalidRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("shared folder {0} is not a directory")]
    RootNotDirectory(PathBuf),
    #[error("server is already running")]
    AlreadyRunning,
    #[error("failed to spawn accept thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to create wake pipe: {0}")]
    WakePipe(#[source] nix::Error),
}

/// A failure while handling one request. Each variant becomes an HTML error page.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("File not found")]
    NotFound,
    #[error("No shared folder selected")]
    NoRootConfigured,
    #[error("Reading directory failed: {0}")]
    DirectoryRead(#[source] io::Error),
    #[error("You don't have permission to access this URL.")]
    Forbidden,
    #[error("File processing failed: {0}")]
    FileIo(#[source] io::Error),
    #[error("Malformed upload: {0}")]
    MalformedUpload(&'static str),
    #[error("Bad request: {0}")]
    BadRequest(&'static str),
    #[error("Upload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("Your request was dropped because it was too long.")]
    HeaderTooLarge,
    #[error("The method you specified is not implemented.")]
    NotImplemented,
}

impl RequestError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::NoRootConfigured | Self::DirectoryRead(_) | Self::FileIo(_) => 500,
            Self::Forbidden => 403,
            Self::MalformedUpload(_) | Self::BadRequest(_) => 400,
            Self::PayloadTooLarge { .. } | Self::HeaderTooLarge => 413,
            Self::NotImplemented => 501,
        }
    }

    /// Classify a failure to open or stat a file that is about to be served.
    pub fn from_open(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::Forbidden,
            _ => Self::FileIo(e),
        }
    }
}
