//! Pipeline error taxonomy.
//!
//! Every failure a pipeline step can produce is classified into a closed set
//! of kinds. Errors form a cause chain and carry the id of the handler that
//! raised them, so error handlers and operators can identify the failing
//! step without parsing messages.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Result type alias used throughout the pipeline core.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input from the client, e.g. a missing credential of the
    /// expected shape. Triggers fallback in the authenticator chain.
    Argument,
    /// The credential was present but could not be accepted.
    Authentication,
    /// The authenticated principal is not permitted.
    Authorization,
    /// Static configuration is invalid. Only raised during construction.
    Configuration,
    /// An outbound dependency is unreachable or answered with an
    /// unexpected status.
    Communication,
    /// An outbound call exceeded its deadline.
    CommunicationTimeout,
    /// Programming or environment failure.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Argument => "argument error",
            ErrorKind::Authentication => "authentication error",
            ErrorKind::Authorization => "authorization error",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Communication => "communication error",
            ErrorKind::CommunicationTimeout => "communication timeout error",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A classified pipeline error with an optional cause chain and the id of
/// the handler it originated from.
///
/// The cause is reference counted, which keeps the error cheap to clone
/// when it has to be recorded on the request context and returned to the
/// caller at the same time.
#[derive(Clone)]
pub struct PipelineError {
    kind: ErrorKind,
    message: Cow<'static, str>,
    handler_id: Option<String>,
    cause: Option<Cause>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            handler_id: None,
            cause: None,
        }
    }

    /// An error carrying nothing but its kind. Used to inject a
    /// classification into a cause chain.
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, "")
    }

    pub fn argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Argument, message)
    }

    pub fn authentication(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn authorization(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn communication(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Communication, message)
    }

    pub fn communication_timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::CommunicationTimeout, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attaches the id of the handler this error originates from.
    pub fn with_handler_id(mut self, id: impl Into<String>) -> Self {
        self.handler_id = Some(id.into());
        self
    }

    /// Attaches a cause. Nested chains are built by passing an already
    /// chained `PipelineError` as the cause.
    pub fn caused_by<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Checks whether this error or any error in its cause chain is of the
    /// given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }

        let mut current: Option<&(dyn std::error::Error + 'static)> =
            self.cause.as_deref().map(|c| c as _);
        while let Some(err) = current {
            if let Some(pipeline_err) = err.downcast_ref::<PipelineError>() {
                if pipeline_err.kind == kind {
                    return true;
                }
            }
            current = err.source();
        }

        false
    }

    /// The id of the handler this error (or the nearest error in its cause
    /// chain) was raised by.
    pub fn handler_id(&self) -> Option<&str> {
        if let Some(id) = self.handler_id.as_deref() {
            return Some(id);
        }

        let mut current: Option<&(dyn std::error::Error + 'static)> =
            self.cause.as_deref().map(|c| c as _);
        while let Some(err) = current {
            if let Some(pipeline_err) = err.downcast_ref::<PipelineError>() {
                if let Some(id) = pipeline_err.handler_id.as_deref() {
                    return Some(id);
                }
            }
            current = err.source();
        }

        None
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("handler_id", &self.handler_id)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as _)
    }
}
