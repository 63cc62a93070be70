use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Invalid argument or an operation against a closed queue. Caller bug, not retryable.
    Usage,
    /// The file contents are inconsistent with the on-disk format. The queue closes itself.
    Corrupt,
    /// The data does not fit within the configured maximum file size. The queue stays usable.
    Full,
    /// The backing file is exclusively locked by another queue instance.
    Busy,
    Permission,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<PathBuf>,
    offset: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};
    use std::error::Error as StdError;

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::Corrupt)
            .with_message("element header mismatch")
            .with_path("/tmp/sensors.stow")
            .with_offset(4132);
        let rendered = err.to_string();
        assert!(rendered.contains("Corrupt"));
        assert!(rendered.contains("element header mismatch"));
        assert!(rendered.contains("/tmp/sensors.stow"));
        assert!(rendered.contains("4132"));
    }

    #[test]
    fn source_chain_is_preserved() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = Error::new(ErrorKind::Io).with_source(inner);
        let source = err.source().expect("source");
        assert!(source.to_string().contains("disk on fire"));
    }
}
