//! Error types for the streaming engine.

use std::sync::Arc;

type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// The main error type for pumps, transforms and pipes.
///
/// Errors are `Clone` so that a pipe can keep the first failure of a round
/// while later failures are discarded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A source failed while filling a buffer
    #[error("Source error: {0}")]
    Source(#[source] Cause),

    /// A sink failed to accept a write or an end
    #[error("Sink error: {0}")]
    Sink(#[source] Cause),

    /// A transformer failed while converting bytes
    #[error("Transform error: {0}")]
    Transform(#[source] Cause),

    /// A collaborator broke the streaming protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A pipe was started without any outputs
    #[error("Pipe has no outputs")]
    NoOutputs,

    /// The stream was already ended or its peer went away
    #[error("Stream closed")]
    Closed,

    /// A gate cell was closed while someone was waiting on it
    #[error("Gate `{0}` was closed before it was released")]
    GateClosed(String),

    /// Invalid pool bounds or sizes
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A background task stopped without producing a result
    #[error("Stream task was shut down")]
    Shutdown,

    /// An I/O error from a tokio adapter
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a source error from any error type
    pub fn from_source<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Source(Arc::new(error))
    }

    /// Create a sink error from any error type
    pub fn from_sink<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Sink(Arc::new(error))
    }

    /// Create a transform error from any error type
    pub fn from_transform<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Transform(Arc::new(error))
    }

    /// Create a protocol violation error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Error::Protocol(message.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config(message.into())
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Error::Shutdown
        } else {
            Error::Custom(format!("Task panicked: {}", e))
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for converting errors into our Error type
pub trait IntoError<T> {
    fn into_source_error(self) -> Result<T>;
    fn into_sink_error(self) -> Result<T>;
    fn into_transform_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_source_error(self) -> Result<T> {
        self.map_err(Error::from_source)
    }

    fn into_sink_error(self) -> Result<T> {
        self.map_err(Error::from_sink)
    }

    fn into_transform_error(self) -> Result<T> {
        self.map_err(Error::from_transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn wrapped_causes_are_exposed_as_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer hung up");
        let err: Result<()> = Err::<(), _>(io).into_sink_error();
        let err = err.unwrap_err();

        assert!(matches!(err, Error::Sink(_)));
        assert_eq!(err.to_string(), "Sink error: peer hung up");
        assert!(err.source().is_some());
    }

    #[test]
    fn clones_share_the_cause() {
        let err = Error::from_transform(std::io::Error::other("bad block"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn gate_closed_names_the_gate() {
        assert_eq!(
            Error::GateClosed("ready".into()).to_string(),
            "Gate `ready` was closed before it was released"
        );
    }
}
