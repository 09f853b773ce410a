//! Error and Result types shared across the core runtime (spec §7).

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// An opaque error produced by the core runtime.
///
/// The concrete reason is available through [`Error::kind`] (crate-internal)
/// and the bucket queryable via the `is_*` methods; the underlying cause, if
/// any, is reachable through the standard [`std::error::Error::source`] chain.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

/// The abstract error kinds from spec §7.
#[derive(Debug)]
pub(crate) enum Kind {
    /// Surfaced at startup / config reload; does not swap in new config.
    ConfigInvalid,
    /// EAGAIN / EINTR: handled by retrying on readiness, never escapes to a caller
    /// but is kept as a distinguishable kind for log call sites.
    IoTransient,
    /// ECONNRESET, EPIPE, EBADF, unexpected short reads: close the connection.
    IoFatal,
    /// Malformed HTTP / PROXY header / TLS ClientHello.
    ProtocolInvalid,
    /// A backend reported itself overloaded; handled by the balancer.
    BackendOverload,
    /// A backend reported itself dead; handled by the balancer.
    BackendDead,
    /// EMFILE and friends: pause accepts, notify the supervisor.
    ResourceExhausted,
    /// State-machine invariant violation.
    Internal,
}

// Sentinel type to mark a cause chain as timeout-derived.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// Returns true if this is a configuration error (spec §7 `ConfigInvalid`).
    pub fn is_config_invalid(&self) -> bool {
        matches!(self.inner.kind, Kind::ConfigInvalid)
    }

    /// Returns true if this is a fatal, connection-closing I/O error.
    pub fn is_io_fatal(&self) -> bool {
        matches!(self.inner.kind, Kind::IoFatal)
    }

    /// Returns true if this was a malformed-wire-data error (HTTP, PROXY, TLS).
    pub fn is_protocol_invalid(&self) -> bool {
        matches!(self.inner.kind, Kind::ProtocolInvalid)
    }

    /// Returns true if a backend reported itself overloaded.
    pub fn is_backend_overload(&self) -> bool {
        matches!(self.inner.kind, Kind::BackendOverload)
    }

    /// Returns true if a backend reported itself dead.
    pub fn is_backend_dead(&self) -> bool {
        matches!(self.inner.kind, Kind::BackendDead)
    }

    /// Returns true if this was caused by resource exhaustion (e.g. EMFILE).
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::ResourceExhausted)
    }

    /// Returns true if this was a state-machine invariant violation.
    pub fn is_internal(&self) -> bool {
        matches!(self.inner.kind, Kind::Internal)
    }

    /// Returns true if the error was (transitively) caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        self.find_source::<TimedOut>().is_some()
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }
        None
    }

    pub(crate) fn config_invalid<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::ConfigInvalid).with(cause)
    }

    pub(crate) fn io_fatal(cause: io::Error) -> Error {
        Error::new(Kind::IoFatal).with(cause)
    }

    pub(crate) fn protocol_invalid<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::ProtocolInvalid).with(cause)
    }

    pub(crate) fn backend_overload() -> Error {
        Error::new(Kind::BackendOverload)
    }

    pub(crate) fn backend_dead() -> Error {
        Error::new(Kind::BackendDead)
    }

    pub(crate) fn resource_exhausted<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::ResourceExhausted).with(cause)
    }

    pub(crate) fn internal<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Internal).with(cause)
    }

    pub(crate) fn timed_out() -> Error {
        Error::new(Kind::IoFatal).with(TimedOut)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("lighttpd2_core::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.inner.kind {
            Kind::ConfigInvalid => "invalid configuration",
            Kind::IoTransient => "transient I/O condition",
            Kind::IoFatal => "fatal I/O error",
            Kind::ProtocolInvalid => "invalid wire protocol data",
            Kind::BackendOverload => "backend overloaded",
            Kind::BackendDead => "backend dead",
            Kind::ResourceExhausted => "resource exhausted",
            Kind::Internal => "internal error",
        })
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|cause| &**cause as _)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                Error::new(Kind::IoTransient).with(err)
            }
            _ => Error::io_fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_would_block_as_transient() {
        let err: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(err.kind(), Kind::IoTransient));
    }

    #[test]
    fn classifies_connection_reset_as_fatal() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(err.is_io_fatal());
    }

    #[test]
    fn display_is_stable_per_kind() {
        assert_eq!(Error::backend_dead().to_string(), "backend dead");
        assert_eq!(Error::backend_overload().to_string(), "backend overloaded");
    }
}
