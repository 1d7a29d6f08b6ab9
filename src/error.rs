use crate::socket::SocketErrorKind;
use thiserror::Error;

#[cfg(feature = "tls")]
use crate::tls::VerificationError;

/// The error type for rustsock operations.
///
/// Transport-level failures carry a [`SocketErrorKind`], trust failures carry
/// the list of [`VerificationError`](crate::tls::VerificationError)s that
/// caused the handshake to be rejected. The two never mix: a transport error
/// always aborts a TLS session outright, while a verification error only
/// aborts it when the caller did not register it as ignorable.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A socket operation failed with a normalized error kind.
    #[error("Socket error: {0}")]
    Socket(#[from] SocketErrorKind),

    /// The provided address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Attempted a data operation on a session whose socket is not connected.
    #[error("Socket is not connected")]
    NotConnected,

    /// Internal polling mechanism encountered an error.
    #[error("Poll error: {0}")]
    PollError(String),

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// TLS handshake or record processing failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Attempted to start server encryption without a local certificate and key.
    ///
    /// Provide `tls_local_cert` and `tls_private_key` (or set them on the
    /// [`TlsConfiguration`](crate::tls::TlsConfiguration) directly) before
    /// calling `start_server_encryption()`.
    #[error("TLS server configuration requires a local certificate and private key")]
    TlsServerConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    /// The peer certificate failed verification with errors that were not ignored.
    #[cfg(feature = "tls")]
    #[error("Peer verification failed: {}", format_verification_errors(.0))]
    Verification(Vec<VerificationError>),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration key holds a value outside its accepted set.
    #[error("Invalid value '{got}' for '{key}', expected one of: {}", .valid.join(", "))]
    InvalidConfigValue {
        key: String,
        got: String,
        valid: Vec<String>,
    },
}

#[cfg(feature = "tls")]
fn format_verification_errors(errors: &[VerificationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
