use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their meaning at the contract boundary,
/// independent of the backend that produced them.
///
/// Contract kinds, the outcomes callers are expected to handle:
/// [`NotImplemented`](Self::NotImplemented), [`NotFound`](Self::NotFound) and
/// [`UnsupportedOperation`](Self::UnsupportedOperation).
///
/// Ambient kinds, for failures which are not contract outcomes at all but
/// still need a category: [`InvalidRequest`](Self::InvalidRequest),
/// [`PermissionDenied`](Self::PermissionDenied), [`Io`](Self::Io) and
/// [`Serialization`](Self::Serialization). The `Storage` handle in
/// `registry-storage` logs these as warnings; see
/// [`is_contract`](Self::is_contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// The backend does not provide this primitive, or the requested backend
    /// is not installed.
    NotImplemented,

    /// The path was expected to hold content or act as a container, and it
    /// does not exist.
    ///
    /// **Caller action:** Treat as a missing entity. Enumeration recovers from
    /// this kind locally by yielding nothing.
    NotFound,

    /// An optional capability (byte ranges, redirects) was requested from a
    /// backend which does not offer it.
    ///
    /// **Caller action:** Check [`Capabilities`](crate::Capabilities) first.
    UnsupportedOperation,

    /// The request itself was malformed, e.g. a raw path escaping the root.
    InvalidRequest,

    /// The backend refused access to the path.
    PermissionDenied,

    /// The operation failed due to I/O errors (network, disk, etc.).
    Io,

    /// Stored bytes could not be decoded as UTF-8 or as structured data.
    Serialization,
}

impl StorageErrorKind {
    /// Returns whether this kind is one of the three contract outcomes.
    pub fn is_contract(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::NotImplemented
                | StorageErrorKind::NotFound
                | StorageErrorKind::UnsupportedOperation
        )
    }

    /// Returns whether this error indicates a client-side fault (bad request, invalid params).
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::InvalidRequest
                | StorageErrorKind::PermissionDenied
                | StorageErrorKind::UnsupportedOperation
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotImplemented => write!(f, "not implemented"),
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::UnsupportedOperation => write!(f, "unsupported operation"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::Serialization => write!(f, "serialization error"),
        }
    }
}

impl From<std::io::ErrorKind> for StorageErrorKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::Unsupported => StorageErrorKind::UnsupportedOperation,
            std::io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            std::io::ErrorKind::InvalidData => StorageErrorKind::Serialization,
            _ => StorageErrorKind::Io,
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace for debugging.
    ///
    /// Note: Backtrace capture is controlled by RUST_BACKTRACE environment variable.
    backtrace: Backtrace,

    /// Span context at the point where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// The error returned by every operation of the storage driver contract.
///
/// This error type provides:
/// - **Semantic categorization** via [`StorageErrorKind`]
/// - **Operation context** (engine, path)
/// - **Error chain preservation** via `Box<dyn Error + Send + Sync>`
/// - **Backtrace and span trace capture** for debugging
///
/// # Example
///
/// ```rust
/// use registry_storage_driver::{StorageError, StorageErrorKind};
///
/// fn read_layer() -> Result<(), StorageError> {
///     let result = std::fs::File::open("missing.txt");
///
///     match result {
///         Err(err) => Err(StorageError::builder("local", StorageErrorKind::NotFound, err)
///             .path("images/abc123/layer")
///             .build()),
///         Ok(_) => Ok(()),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,

    /// The name of the storage engine that produced this error.
    engine: &'static str,

    path: Option<String>,

    /// Additional context about the error.
    context: Option<String>,

    source: Box<dyn StdError + Send + Sync + 'static>,

    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    ///
    /// For more control, use `StorageError::builder()`.
    #[track_caller]
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for constructing a storage error with full context.
    ///
    /// ```rust
    /// use registry_storage_driver::{StorageError, StorageErrorKind};
    ///
    /// let error = StorageError::builder("memory", StorageErrorKind::NotFound,
    ///     std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"))
    ///     .path("images/abc123/json")
    ///     .context("get_content")
    ///     .build();
    /// assert_eq!(error.path(), Some("images/abc123/json"));
    /// ```
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            path: None,
            context: None,
        }
    }

    /// Returns a boxed closure that creates a storage error from a downstream error.
    ///
    /// This is useful with `.map_err()` for simple error conversion.
    ///
    /// ```rust
    /// use registry_storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn operation() -> Result<(), StorageError> {
    ///     std::fs::File::open("file.txt")
    ///         .map_err(StorageError::with("local", StorageErrorKind::Io))?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Translate an I/O error, picking the kind from the I/O error kind.
    #[track_caller]
    pub fn io(engine: &'static str, path: impl Into<String>, error: std::io::Error) -> Self {
        StorageError::builder(engine, error.kind().into(), error)
            .path(path)
            .build()
    }

    /// The path was expected to exist and does not.
    #[track_caller]
    pub fn not_found(engine: &'static str, path: impl Into<String>) -> Self {
        let path = path.into();
        StorageError::builder(
            engine,
            StorageErrorKind::NotFound,
            format!("path not found: {path}"),
        )
        .path(path)
        .build()
    }

    /// The backend never provided `operation`.
    #[track_caller]
    pub fn not_implemented(engine: &'static str, operation: &str) -> Self {
        StorageError::builder(
            engine,
            StorageErrorKind::NotImplemented,
            format!("you must implement {operation} on your storage {engine}"),
        )
        .context(operation.to_owned())
        .build()
    }

    /// The backend does not offer the capability behind `operation`.
    #[track_caller]
    pub fn unsupported(engine: &'static str, operation: &str) -> Self {
        StorageError::builder(
            engine,
            StorageErrorKind::UnsupportedOperation,
            format!("storage {engine} does not support {operation}"),
        )
        .context(operation.to_owned())
        .build()
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns true if this error is [`StorageErrorKind::NotFound`].
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the storage path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error indicates a client-side fault.
    pub fn is_client_fault(&self) -> bool {
        self.kind.is_client_fault()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing `StorageError` with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the storage path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
