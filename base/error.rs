// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Error type carrying a stable kind tag, a context message, and a cause chain.

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for
/// descriptions of each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// An error with a kind tag, optional message, and optional source.
///
/// Construct via the [`crate::err!`] and [`crate::bail!`] macros. Boxed so
/// `Result<T, Error>` stays a pointer wide.
pub struct Error(Box<ErrorInner>);

impl Error {
    #[doc(hidden)]
    pub fn new(
        kind: ErrorKind,
        msg: Option<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error(Box::new(ErrorInner { kind, msg, source }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display` adapter which prints this error and all its causes,
    /// `: `-separated, for single-line log fields.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

/// See [`Error::chain`].
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.msg {
            Some(ref msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Multi-line form with causes; `{:?}` is what `main` prints on exit.
        fmt::Display::fmt(self, f)?;
        let mut source = std::error::Error::source(self);
        while let Some(s) = source {
            write!(f, "\ncaused by: {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::AlreadyExists => ErrorKind::AlreadyExists,
            IoKind::TimedOut => ErrorKind::DeadlineExceeded,
            IoKind::InvalidInput => ErrorKind::InvalidArgument,
            IoKind::StorageFull | IoKind::QuotaExceeded => ErrorKind::ResourceExhausted,
            IoKind::UnexpectedEof | IoKind::ConnectionReset | IoKind::ConnectionAborted => {
                ErrorKind::Unavailable
            }
            _ => ErrorKind::Unknown,
        };
        Error::new(kind, None, Some(Box::new(e)))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let kind = match e {
            rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        };
        Error::new(kind, None, Some(Box::new(e)))
    }
}

impl From<crate::shutdown::ShutdownError> for Error {
    fn from(e: crate::shutdown::ShutdownError) -> Self {
        Error::new(ErrorKind::Cancelled, None, Some(Box::new(e)))
    }
}

/// Constructs an [`Error`], tagged with a kind and optionally a message
/// (`format!`-style) and a source.
///
/// Example:
/// ```
/// use argus_base::{err, ErrorKind};
/// let e = err!(NotFound, msg("no stream {}", "back"));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no stream back");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, None)
    };
    ($kind:ident, msg($($msg:tt)+) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)+)), None)
    };
    ($kind:ident, msg($($msg:tt)+), source($source:expr) $(,)?) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)+)),
            Some(Box::new($source)),
        )
    };
    ($kind:ident, source($source:expr) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, Some(Box::new($source)))
    };
}

/// As [`crate::err!`], but returns from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_includes_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "boom");
        let e = err!(Unavailable, msg("read failed"), source(io));
        assert_eq!(e.kind(), ErrorKind::Unavailable);
        assert_eq!(e.chain().to_string(), "Unavailable: read failed: boom");
    }

    #[test]
    fn bail_returns() {
        fn f() -> Result<(), Error> {
            bail!(InvalidArgument, msg("bad name {:?}", "x"));
        }
        let e = f().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert_eq!(e.to_string(), "Invalid argument: bad name \"x\"");
    }

    #[test]
    fn io_kind_mapping() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }
}
