//! This is the module that contains the error types used in `ovsdp`
//!
//! There are four main types:
//! * [`Nlmsgerr`][crate::err::Nlmsgerr] - an application error
//!   returned from netlink as a packet.
//! * [`NlError`][crate::err::NlError] - a general error wrapping
//!   application errors, serialization and deserialization errors,
//!   and other errors that occur while talking to the datapath.
//! * [`DeError`] - error while deserializing
//! * [`SerError`] - error while serializing
//!
//! # Design decisions
//! All errors implement `std::error::Error` in an attempt to allow
//! them to be used in conjunction with `Result` for easier error
//! management even at the protocol error level.
//!
//! "Not found" answers from the kernel are not errors at the
//! datapath layer. Lookups return `Option` and flow removal returns
//! [`FlowRemoval`][crate::ovs::flow::FlowRemoval], so callers never
//! need to match on raw errno values for them.

use std::{
    error::Error,
    fmt::{self, Display},
    io, str,
};

use crate::nl::Nlmsghdr;

/// Struct representing netlink packets containing errors
#[derive(Debug, PartialEq)]
pub struct Nlmsgerr {
    /// Error code as sent by the kernel, a negated errno
    pub error: libc::c_int,
    /// Packet header for request that failed
    pub nlmsg: Nlmsghdr,
}

impl Nlmsgerr {
    /// The positive errno carried by this error packet
    pub fn errno(&self) -> i32 {
        -self.error
    }
}

impl Display for Nlmsgerr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.errno()))
    }
}

impl Error for Nlmsgerr {}

macro_rules! err_from {
    ($err:ident, $($from_err:path { $from_impl:expr }),+) => {
        $(
            impl From<$from_err> for $err {
                fn from(e: $from_err) -> Self {
                    $from_impl(e)
                }
            }
        )*
    };
}

/// General netlink error
#[derive(Debug)]
pub enum NlError {
    /// Variant for [`String`]-based messages.
    Msg(String),
    /// An error packet sent back by netlink.
    Nlmsgerr(Nlmsgerr),
    /// A serialization error.
    Ser(SerError),
    /// A deserialization error.
    De(DeError),
    /// An OS level error from the socket, including receive timeouts.
    Io(io::Error),
    /// Incorrect PID socket identifier in received message.
    BadPid {
        /// Port ID of the socket
        expected: u32,
        /// Port ID found in the message
        found: u32,
    },
    /// The generic netlink family is not registered, even after one
    /// attempt to load the kernel module.
    FamilyUnavailable(String),
    /// A response named a different datapath than the request.
    IfindexMismatch {
        /// Interface index of the datapath the request was sent for
        expected: i32,
        /// Interface index found in the response
        found: i32,
    },
    /// A datagram was longer than the receive buffer and got cut off.
    Truncated {
        /// Length of the datagram
        len: usize,
        /// Size of the receive buffer
        buffer_len: usize,
    },
    /// The client owning the socket has been closed.
    Closed,
}

err_from!(
    NlError,
    Nlmsgerr { NlError::Nlmsgerr },
    SerError { NlError::Ser },
    DeError { NlError::De },
    io::Error { NlError::Io }
);

impl NlError {
    /// Create new error from a data type implementing
    /// [`Display`][std::fmt::Display]
    pub fn new<D>(s: D) -> Self
    where
        D: Display,
    {
        NlError::Msg(s.to_string())
    }

    /// The errno of the kernel error packet or OS error behind this
    /// error, if there is one.
    pub fn errno(&self) -> Option<i32> {
        match *self {
            NlError::Nlmsgerr(ref e) => Some(e.errno()),
            NlError::Io(ref e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Returns true if the kernel answered with the given errno.
    pub fn is_errno(&self, errno: i32) -> bool {
        match *self {
            NlError::Nlmsgerr(ref e) => e.errno() == errno,
            _ => false,
        }
    }

    /// Returns true if the kernel refused to create an object because
    /// one with the same name already exists.
    pub fn is_already_exists(&self) -> bool {
        self.is_errno(libc::EEXIST)
    }
}

impl Display for NlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            NlError::Msg(ref msg) => write!(f, "{}", msg),
            NlError::Nlmsgerr(ref err) => {
                write!(f, "Error response received from netlink: {}", err)
            }
            NlError::Ser(ref err) => {
                write!(f, "Serialization error: {}", err)
            }
            NlError::De(ref err) => {
                write!(f, "Deserialization error: {}", err)
            }
            NlError::Io(ref err) => write!(f, "Netlink socket failure: {}", err),
            NlError::BadPid { expected, found } => write!(
                f,
                "PID {} does not match the socket PID {}",
                found, expected
            ),
            NlError::FamilyUnavailable(ref name) => write!(
                f,
                "Generic netlink family {} is not available; is the kernel module loaded?",
                name
            ),
            NlError::IfindexMismatch { expected, found } => write!(
                f,
                "Response is for datapath {} but the request was for datapath {}",
                found, expected
            ),
            NlError::Truncated { len, buffer_len } => write!(
                f,
                "Received a {} byte datagram into a {} byte buffer; raise recv_buffer_len",
                len, buffer_len
            ),
            NlError::Closed => write!(f, "The datapath client has been closed"),
        }
    }
}

impl Error for NlError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            NlError::Nlmsgerr(ref e) => Some(e),
            NlError::Ser(ref e) => Some(e),
            NlError::De(ref e) => Some(e),
            NlError::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

/// Serialization error
#[derive(Debug)]
pub enum SerError {
    /// Abitrary error message.
    Msg(String),
    /// A wrapped error from the underlying writer.
    Io(io::Error),
    /// An attribute grew beyond the 16 bit length field.
    AttrTooLong(usize),
    /// A message grew beyond the 32 bit length field.
    MsgTooLong(usize),
    /// A string attribute contained an interior null byte.
    NullError,
}

err_from!(SerError, io::Error { SerError::Io });

impl SerError {
    /// Create a new error with the given message as description.
    pub fn new<D>(msg: D) -> Self
    where
        D: Display,
    {
        SerError::Msg(msg.to_string())
    }
}

impl Display for SerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SerError::Msg(ref s) => write!(f, "{}", s),
            SerError::Io(ref e) => write!(f, "Error while serializing: {}", e),
            SerError::AttrTooLong(len) => {
                write!(f, "Attribute of {} bytes does not fit in a netlink attribute", len)
            }
            SerError::MsgTooLong(len) => {
                write!(f, "Message of {} bytes does not fit in a netlink message", len)
            }
            SerError::NullError => {
                write!(f, "A null byte was found inside a string attribute")
            }
        }
    }
}

impl Error for SerError {}

/// Deserialization error
#[derive(Debug)]
pub enum DeError {
    /// Abitrary error message.
    Msg(String),
    /// The end of the buffer was reached before deserialization
    /// finished.
    UnexpectedEOB {
        /// What was being read
        context: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },
    /// A length field is too small for the header it belongs to.
    BadLength {
        /// What was being read
        context: &'static str,
        /// The declared length
        len: usize,
    },
    /// The netlink message type differs from the one expected.
    UnexpectedType {
        /// Expected `nl_type`
        expected: u16,
        /// Received `nl_type`
        found: u16,
    },
    /// The generic netlink command differs from the one expected.
    UnexpectedCmd {
        /// Expected commands
        expected: Vec<u8>,
        /// Received command
        found: u8,
    },
    /// An attribute value has the wrong size for its type.
    BadAttrLength {
        /// Attribute type
        ty: u16,
        /// Expected value length
        expected: usize,
        /// Received value length
        found: usize,
    },
    /// A mandatory attribute is absent.
    MissingAttr(u16),
    /// A null byte was not found at the end of the serialized
    /// [`String`].
    NoNullError,
    /// A string attribute holds a null byte before its terminator.
    InteriorNull,
    /// A string attribute is not valid UTF-8.
    Utf8(str::Utf8Error),
    /// A flow key type this crate cannot interpret.
    UnknownKeyType(u16),
    /// A flow action type this crate cannot interpret.
    UnknownActionType(u16),
    /// A non-zero mask was reported for a key type without a key
    /// value.
    MaskWithoutKey(u16),
}

err_from!(DeError, str::Utf8Error { DeError::Utf8 });

impl DeError {
    /// Create new error from a type implementing
    /// [`Display`][std::fmt::Display]
    pub fn new<D>(s: D) -> Self
    where
        D: Display,
    {
        DeError::Msg(s.to_string())
    }
}

impl Display for DeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DeError::Msg(ref s) => write!(f, "{}", s),
            DeError::UnexpectedEOB {
                context,
                needed,
                available,
            } => write!(
                f,
                "Truncated {}: needed {} bytes but only {} are left",
                context, needed, available
            ),
            DeError::BadLength { context, len } => {
                write!(f, "Invalid {} length {}", context, len)
            }
            DeError::UnexpectedType { expected, found } => write!(
                f,
                "Unexpected netlink message type {} (expected {})",
                found, expected
            ),
            DeError::UnexpectedCmd {
                ref expected,
                found,
            } => write!(
                f,
                "Unexpected generic netlink command {} (expected one of {:?})",
                found, expected
            ),
            DeError::BadAttrLength {
                ty,
                expected,
                found,
            } => write!(
                f,
                "Attribute {} has length {} (expected {})",
                ty, found, expected
            ),
            DeError::MissingAttr(ty) => write!(f, "Missing attribute {}", ty),
            DeError::NoNullError => write!(f, "No terminating null byte was found in the buffer"),
            DeError::InteriorNull => write!(f, "String attribute contains an interior null byte"),
            DeError::Utf8(ref e) => write!(f, "Invalid string attribute: {}", e),
            DeError::UnknownKeyType(ty) => write!(f, "Unknown flow key type {}", ty),
            DeError::UnknownActionType(ty) => write!(f, "Unknown flow action type {}", ty),
            DeError::MaskWithoutKey(ty) => write!(
                f,
                "Flow key type {} has a non-zero mask but no key value",
                ty
            ),
        }
    }
}

impl Error for DeError {}
