//! Error types for the FTP transport.

use std::path::PathBuf;

use crate::reply::Reply;

/// Errors produced by the FTP server and client roles.
#[derive(Debug, thiserror::Error)]
pub enum FtpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// 4xx reply: the server asks us to try again later.
    #[error("transient server error {code}: {message}")]
    Transient { code: u16, message: String },

    /// 5xx reply: the server refused the request.
    #[error("permanent server error {code}: {message}")]
    Permanent { code: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The local side of a transfer failed (missing file, permission denied).
    #[error("local file error at {}: {source}", path.display())]
    LocalFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("permission denied binding port {port}")]
    PermissionDenied { port: u16 },

    #[error("port {port} already in use")]
    PortInUse { port: u16 },

    #[error("server already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl FtpError {
    /// Classifies a negative server reply.
    pub fn from_reply(reply: &Reply) -> Self {
        let message = reply.text();
        match reply.code {
            530 => FtpError::AuthFailed(message),
            400..=499 => FtpError::Transient {
                code: reply.code,
                message,
            },
            500..=599 => FtpError::Permanent {
                code: reply.code,
                message,
            },
            code => FtpError::Protocol(format!("unexpected reply {code}: {message}")),
        }
    }

    /// Whether a caller may reasonably try the same operation again.
    ///
    /// Local file problems and configuration errors will not change by
    /// retrying. Everything network-facing is retryable, including 5xx
    /// replies, which are expected to fail again but are not special-cased.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FtpError::LocalFile { .. }
                | FtpError::Config(_)
                | FtpError::InvalidPath(_)
                | FtpError::AlreadyRunning
                | FtpError::Cancelled
        )
    }

    /// Whether the failure originated on the local side of a transfer.
    pub fn is_local(&self) -> bool {
        matches!(self, FtpError::LocalFile { .. })
    }

    pub(crate) fn local(path: &std::path::Path, source: std::io::Error) -> Self {
        FtpError::LocalFile {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<tokio::time::error::Elapsed> for FtpError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FtpError::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_classification() {
        assert!(matches!(
            FtpError::from_reply(&Reply::new(530, "Login incorrect.")),
            FtpError::AuthFailed(_)
        ));
        assert!(matches!(
            FtpError::from_reply(&Reply::new(421, "Too many connections.")),
            FtpError::Transient { code: 421, .. }
        ));
        assert!(matches!(
            FtpError::from_reply(&Reply::new(552, "Quota exceeded.")),
            FtpError::Permanent { code: 552, .. }
        ));
        assert!(matches!(
            FtpError::from_reply(&Reply::new(226, "ok")),
            FtpError::Protocol(_)
        ));
    }

    #[test]
    fn local_errors_are_not_retryable() {
        let err = FtpError::local(
            std::path::Path::new("/tmp/x"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.is_local());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("/tmp/x"));
    }

    #[test]
    fn remote_errors_are_retryable() {
        assert!(FtpError::Timeout.is_retryable());
        assert!(
            FtpError::Permanent {
                code: 550,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(FtpError::AuthFailed("x".into()).is_retryable());
    }
}
