use std::{error::Error, fmt, sync::Arc};

#[derive(Debug, Clone)]
pub enum StreamError {
    /// Write or close against a stream that has already closed
    Closed,
    /// Write while a close is queued or in flight, or a duplicate close
    Closing,
    /// The stream was aborted, with the caller's optional reason
    Aborted(Option<String>),
    /// An abort was requested, but the in-flight close completed first
    AbortedAfterClose,
    /// A second writer tried to acquire the lock, or a stream-level
    /// operation was attempted while a writer holds the lock
    Locked,
    /// Operation through a writer that has released its lock
    Released,
    /// The queuing strategy reported a NaN, negative, or infinite chunk size
    InvalidSize(f64),
    /// The strategy's high water mark is NaN, negative, or infinite
    InvalidHighWaterMark(f64),
    /// The stream's driver task was dropped while a caller waited on it
    TaskDropped,
    /// An error propagated from the sink or another collaborator
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap a sink's or strategy's own error type so it can flow through
    /// the stream as the stored error. The original error stays reachable
    /// through [`Error::source`].
    pub fn other<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(error))
    }
}

/// Text-only payload for sinks that report plain messages.
#[derive(Debug)]
struct Message(Box<str>);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for Message {}

impl From<&str> for StreamError {
    fn from(message: &str) -> Self {
        StreamError::Other(Arc::new(Message(message.into())))
    }
}

impl From<String> for StreamError {
    fn from(message: String) -> Self {
        StreamError::Other(Arc::new(Message(message.into_boxed_str())))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(error: std::io::Error) -> Self {
        StreamError::Other(Arc::new(error))
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Closed => write!(f, "Stream is closed"),
            StreamError::Closing => write!(f, "Stream is closing"),
            StreamError::Aborted(Some(reason)) => write!(f, "Stream was aborted: {}", reason),
            StreamError::Aborted(None) => write!(f, "Stream was aborted"),
            StreamError::AbortedAfterClose => {
                write!(f, "Stream abort was requested, but the close completed successfully")
            }
            StreamError::Locked => write!(f, "Stream is locked to a writer"),
            StreamError::Released => write!(f, "Writer has released its lock"),
            StreamError::InvalidSize(size) => write!(f, "Invalid chunk size: {}", size),
            StreamError::InvalidHighWaterMark(hwm) => {
                write!(f, "Invalid high water mark: {}", hwm)
            }
            StreamError::TaskDropped => write!(f, "Stream task was dropped"),
            StreamError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
