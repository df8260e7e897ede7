//! This module provides code that glues the message builder and
//! parser to a socket and allows request and receive operations.
//!
//! ## Important methods
//! * [`Transport::send`] and [`Transport::recv`] are the most low
//!   level calls. On an [`NlSocket`] they do what the C system calls
//!   `send` and `recv` do with very little abstraction.
//! * [`NlSocketHandle::request`][crate::socket::NlSocketHandle::request],
//!   [`NlSocketHandle::request_multi`][crate::socket::NlSocketHandle::request_multi]
//!   and [`NlSocketHandle::receive`][crate::socket::NlSocketHandle::receive]
//!   correlate responses with requests by sequence number.
//!
//! ## Design decisions
//!
//! The handle talks to the kernel through the [`Transport`] trait so
//! that request and dump correlation can be exercised without a
//! kernel.
//!
//! The receive buffer is allocated once per handle on the heap. Its
//! size can be tuned at compile time with the `OVSDP_RECV_BUFFER_LEN`
//! environment variable or per client through
//! [`DpifConfig`][crate::ovs::DpifConfig].
//!
//! A handle does not pipeline requests. Each request is drained to its
//! reply or to the end of its dump before the next one is sent.

use std::io;

use crate::err::NlError;

#[cfg(test)]
pub(crate) mod mock;
mod shared;
mod synchronous;

pub use crate::socket::{shared::NlSocket, synchronous::NlSocketHandle};

/// A datagram oriented connection to the kernel
pub trait Transport {
    /// Send one datagram.
    fn send(&self, buf: &[u8]) -> Result<(), io::Error>;

    /// Receive one datagram into `buf` and return its full length.
    /// A length above `buf.len()` means the datagram was truncated.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, io::Error>;
}

/// The received part of `buf` given the length reported by
/// [`Transport::recv`], or [`NlError::Truncated`] if the datagram did
/// not fit.
pub(crate) fn received(buf: &[u8], len: usize) -> Result<&[u8], NlError> {
    if len > buf.len() {
        return Err(NlError::Truncated {
            len,
            buffer_len: buf.len(),
        });
    }
    Ok(&buf[..len])
}
