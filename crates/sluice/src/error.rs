use std::io;

/// Errors produced while opening, reading or seeking a fragmented stream.
#[derive(Debug, thiserror::Error)]
pub enum SluiceError {
    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("no usable representation: {reason}")]
    RepresentationUnavailable { reason: String },

    #[error("transport failed for `{locator}`: {source}")]
    Transport {
        locator: String,
        #[source]
        source: io::Error,
    },

    #[error("sequence discontinuity: expected {expected}, manifest starts at {first_available}")]
    Discontinuity { expected: u64, first_available: u64 },

    #[error("manifest redirect chain exceeded {hops} hops at `{locator}`")]
    RedirectLoop { locator: String, hops: u32 },

    #[error("stream is not seekable in {mode} mode")]
    NotSeekable { mode: &'static str },

    #[error("invalid seek: {reason}")]
    InvalidSeek { reason: String },

    #[error("session is closed")]
    Closed,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SluiceError {
    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn representation_unavailable(reason: impl Into<String>) -> Self {
        Self::RepresentationUnavailable {
            reason: reason.into(),
        }
    }

    pub fn transport(locator: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            locator: locator.into(),
            source,
        }
    }

    pub fn invalid_seek(reason: impl Into<String>) -> Self {
        Self::InvalidSeek {
            reason: reason.into(),
        }
    }

    /// Whether a live session may continue after this error by switching
    /// its continuation strategy or resetting to the first fragment.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Discontinuity { .. } => true,
            Self::Manifest { .. }
            | Self::RepresentationUnavailable { .. }
            | Self::RedirectLoop { .. }
            | Self::NotSeekable { .. }
            | Self::InvalidSeek { .. }
            | Self::Closed
            | Self::Io { .. } => false,
        }
    }
}

impl From<SluiceError> for io::Error {
    fn from(err: SluiceError) -> Self {
        match err {
            SluiceError::Io { source } => source,
            SluiceError::Transport { source, .. } => source,
            SluiceError::NotSeekable { .. } => io::Error::new(io::ErrorKind::Unsupported, err),
            SluiceError::InvalidSeek { .. } => io::Error::new(io::ErrorKind::InvalidInput, err),
            other => io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_recoverable() {
        let err = SluiceError::transport("http://a/b.ts", io::Error::other("reset"));
        assert!(err.is_recoverable());
        assert!(!SluiceError::manifest("empty").is_recoverable());
        assert!(
            !SluiceError::RedirectLoop {
                locator: "x".into(),
                hops: 4
            }
            .is_recoverable()
        );
    }

    #[test]
    fn converts_into_io_error_kinds() {
        let io_err: io::Error = SluiceError::NotSeekable { mode: "live" }.into();
        assert_eq!(io_err.kind(), io::ErrorKind::Unsupported);

        let io_err: io::Error = SluiceError::invalid_seek("negative").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidInput);

        let io_err: io::Error =
            SluiceError::transport("a", io::Error::new(io::ErrorKind::NotFound, "404")).into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
    }
}
