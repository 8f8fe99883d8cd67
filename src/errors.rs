//! Error types for measurement sessions.
//!
//! Every failure in the crate is a [`NetgaugeError`] tagged with an
//! [`ErrorKind`]. The kind decides how the failure is handled: probe
//! failures (network, DNS, timeout, TLS) are recovered locally by the
//! session orchestrator, configuration errors are rejected before a session
//! exists, and session errors are fatal to the session they occur in.

use std::error::Error;
use std::fmt;

/// Process exit statuses used by the `netgauge` binary.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    /// A probe could not reach the transport and nothing could stand in.
    pub const NETWORK_ERROR: i32 = 1;
    /// Configuration error (invalid arguments, out-of-range settings).
    pub const CONFIG_ERROR: i32 = 3;
    /// Results were produced but failed validation.
    pub const VALIDATION_ERROR: i32 = 4;
    /// Session bookkeeping failed or the session ended in FAILED.
    pub const SESSION_ERROR: i32 = 5;
    /// Session was cancelled externally.
    pub const CANCELLED: i32 = 6;
    /// Anything we could not classify.
    pub const UNKNOWN_ERROR: i32 = 99;
}

/// Categories of errors that can occur during a measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect, read or write against the transport failed.
    Network,
    /// The latency host did not resolve.
    Dns,
    /// Connection or read timeout.
    Timeout,
    /// Handshake with a TLS port failed.
    Tls,
    /// Rejected settings; no session was created.
    Config,
    /// Metrics failed the sanity checks.
    Validation,
    /// Session record missing, unreadable or in an unexpected state.
    Session,
    /// Session was cancelled by an external caller.
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        if self.is_probe_failure() {
            return exit_codes::NETWORK_ERROR;
        }

        match self {
            ErrorKind::Config => exit_codes::CONFIG_ERROR,
            ErrorKind::Validation => exit_codes::VALIDATION_ERROR,
            ErrorKind::Session => exit_codes::SESSION_ERROR,
            ErrorKind::Cancelled => exit_codes::CANCELLED,
            _ => exit_codes::UNKNOWN_ERROR,
        }
    }

    /// Short label shown ahead of the message.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Transport unreachable",
            ErrorKind::Dns => "Name lookup failed",
            ErrorKind::Timeout => "Timed out",
            ErrorKind::Tls => "TLS handshake failed",
            ErrorKind::Config => "Invalid settings",
            ErrorKind::Validation => "Result rejected",
            ErrorKind::Session => "Session error",
            ErrorKind::Cancelled => "Session cancelled",
            ErrorKind::Unknown => "Unexpected failure",
        }
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            ErrorKind::Network => {
                Some("Check that the measurement server is running and reachable.")
            }
            ErrorKind::Dns => Some("Check the resolver or pass the server by IP address."),
            ErrorKind::Timeout => Some("The server is slow or unreachable; retry later."),
            ErrorKind::Tls => Some("Verify the certificate chain and the system clock."),
            _ => None,
        }
    }

    /// Whether this kind is a network-level probe failure that the
    /// orchestrator recovers from with a sentinel or simulated metric.
    pub fn is_probe_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Dns
                | ErrorKind::Timeout
                | ErrorKind::Tls
        )
    }
}

/// A user-friendly error type for measurement operations.
#[derive(Debug)]
pub struct NetgaugeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Hint printed under the message by the CLI.
    pub suggestion: Option<String>,
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl NetgaugeError {
    /// Create a new NetgaugeError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), suggestion: None, source: None }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// Build an error of `kind`, attaching the stock hint for probe
    /// failures.
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let error = Self::new(kind, message);
        match kind.hint() {
            Some(hint) => error.with_suggestion(hint),
            None => error,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::Network, message)
    }

    pub fn dns(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::Dns, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::Timeout, message)
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::Tls, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::of_kind(ErrorKind::Config, message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Create a session bookkeeping error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Session, message)
    }

    /// Create a cancellation error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }
}

impl fmt::Display for NetgaugeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind.description(), self.message)?;
        match &self.suggestion {
            Some(hint) => write!(f, "; {}", hint),
            None => Ok(()),
        }
    }
}

impl Error for NetgaugeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        let source = self.source.as_deref()?;
        Some(source)
    }
}

impl From<std::io::Error> for NetgaugeError {
    fn from(error: std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::AddrNotAvailable => ErrorKind::Network,
            _ => classify_error(&error),
        };

        to_netgauge_error(kind, Box::new(error), "I/O failure")
    }
}

impl From<tokio::time::error::Elapsed> for NetgaugeError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        NetgaugeError::timeout("operation timed out").with_source(error)
    }
}

impl From<tokio::task::JoinError> for NetgaugeError {
    fn from(error: tokio::task::JoinError) -> Self {
        NetgaugeError::new(ErrorKind::Unknown, "background task failed")
            .with_source(error)
    }
}

/// Message fragments that identify a probe failure, checked in order.
const KIND_HINTS: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::Dns, &["dns", "resolve", "no such host", "no record"]),
    (ErrorKind::Timeout, &["timeout", "timed out", "deadline"]),
    (ErrorKind::Tls, &["tls", "ssl", "certificate", "handshake"]),
    (
        ErrorKind::Network,
        &[
            "connection refused",
            "connection reset",
            "unreachable",
            "no route",
            "broken pipe",
        ],
    ),
];

/// Guess the kind of a foreign error from its message.
pub fn classify_error(error: &dyn Error) -> ErrorKind {
    let text = error.to_string().to_lowercase();

    KIND_HINTS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| text.contains(n)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// Wrap a boxed error of a known kind, prefixing its message with context.
pub fn to_netgauge_error(
    kind: ErrorKind,
    error: Box<dyn Error + Send + Sync>,
    context: &str,
) -> NetgaugeError {
    let message = format!("{}: {}", context, error);
    NetgaugeError { source: Some(error), ..NetgaugeError::of_kind(kind, message) }
}

/// Render an error for the terminal: the message, then the hint on its
/// own paragraph.
pub fn format_error_for_display(error: &NetgaugeError) -> String {
    match &error.suggestion {
        Some(hint) => format!("{}: {}\n\n{}", error.kind.description(), error.message, hint),
        None => format!("{}: {}", error.kind.description(), error.message),
    }
}
