//! The crate-wide error type.
//!
//! Every fallible stack operation returns `Result<T>`; the variants group
//! into the not-ready / timeout / bad-argument / not-found / busy /
//! permission classes the control surface reports to callers.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A pool had no free rtskb.
    PoolEmpty,
    /// A socket could not obtain a transmit buffer.
    NoBufs,
    /// A non-blocking call would have to wait.
    WouldBlock,
    /// A bounded wait expired without progress.
    Timeout,
    /// A frame failed parsing or validation.
    Malformed,
    /// An argument was out of range or inconsistent.
    BadParam,
    /// No device matched the request.
    NoDevice,
    /// No table entry matched the request.
    NoEntry,
    /// No route leads to the destination network.
    NoRoute,
    /// A host route could not be resolved.
    HostUnreachable,
    /// The object is in a conflicting state.
    Busy,
    /// The object already exists.
    Exists,
    /// The entry is referenced and cannot be removed.
    InUse,
    /// No discipline is attached to the device.
    NotAttached,
    /// A discipline is already attached to the device.
    AlreadyAttached,
    /// The underlying object was shut down while waiting.
    Closed,
    /// The operation is not supported by this object.
    NotSupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::PoolEmpty => "rtskb pool empty",
            Error::NoBufs => "no buffer space available",
            Error::WouldBlock => "operation would block",
            Error::Timeout => "timed out",
            Error::Malformed => "malformed frame",
            Error::BadParam => "invalid argument",
            Error::NoDevice => "no such device",
            Error::NoEntry => "no such entry",
            Error::NoRoute => "no route to network",
            Error::HostUnreachable => "no route to host",
            Error::Busy => "device or resource busy",
            Error::Exists => "entry already exists",
            Error::InUse => "entry is in use",
            Error::NotAttached => "no discipline attached",
            Error::AlreadyAttached => "discipline already attached",
            Error::Closed => "object was closed",
            Error::NotSupported => "operation not supported",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<crate::wire::Error> for Error {
    fn from(_: crate::wire::Error) -> Error {
        Error::Malformed
    }
}

pub type Result<T> = core::result::Result<T, Error>;
