//! Error kinds and X error classification

use thiserror::Error;
use x11rb::protocol::ErrorKind;

/// Errors that decide how the compositor reacts: configuration and
/// initialization errors end the process, plugin errors skip one plugin
/// for one frame.
#[derive(Error, Debug)]
pub enum CompositorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("initialization error: {0}")]
    Init(String),

    #[error("plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("monotonic clock unavailable: {0}")]
    Time(#[from] nix::errno::Errno),
}

impl CompositorError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }
}

/// How an X protocol error must be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XErrorSeverity {
    /// The resource vanished under us; the owning window goes away with
    /// its next DestroyNotify.
    Transient,
    Fatal,
}

// Core protocol error codes
const BAD_WINDOW: u8 = 3;
const BAD_PIXMAP: u8 = 4;
const BAD_DRAWABLE: u8 = 9;

/// Classify a raw X error code (used by the Xlib error handler).
pub fn classify_error_code(code: u8) -> XErrorSeverity {
    match code {
        BAD_WINDOW | BAD_PIXMAP | BAD_DRAWABLE => XErrorSeverity::Transient,
        _ => XErrorSeverity::Fatal,
    }
}

/// Classify an x11rb error kind.
pub fn classify_error_kind(kind: ErrorKind) -> XErrorSeverity {
    match kind {
        ErrorKind::Window | ErrorKind::Pixmap | ErrorKind::Drawable => XErrorSeverity::Transient,
        _ => XErrorSeverity::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vanished_resources_are_transient() {
        assert_eq!(classify_error_code(3), XErrorSeverity::Transient);
        assert_eq!(classify_error_code(4), XErrorSeverity::Transient);
        assert_eq!(classify_error_code(9), XErrorSeverity::Transient);
        assert_eq!(classify_error_kind(ErrorKind::Drawable), XErrorSeverity::Transient);
    }

    #[test]
    fn test_other_errors_are_fatal() {
        assert_eq!(classify_error_code(8), XErrorSeverity::Fatal);
        assert_eq!(classify_error_code(11), XErrorSeverity::Fatal);
        assert_eq!(classify_error_kind(ErrorKind::Match), XErrorSeverity::Fatal);
        assert_eq!(classify_error_kind(ErrorKind::Alloc), XErrorSeverity::Fatal);
    }

    #[test]
    fn test_plugin_error_message() {
        let err = CompositorError::Plugin {
            plugin: "fade".into(),
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "plugin fade failed: boom");
    }
}
