//! # High level notes
//!
//! The items in this module are created by macros, which give them
//! lossless conversions to and from the integer type they occupy on
//! the wire. The `impl_var` macro is exported so that callers can
//! describe further kernel constants the same way.
//!
//! Netlink and generic netlink values come from `libc`, which mirrors
//! `/usr/include/linux`. The Open vSwitch values are not exported by
//! `libc` and are transcribed from `linux/openvswitch.h`.
//!
//! # Design decisions
//!
//! * Enums are used so that only valid constants can be passed where
//!   a command, attribute or type is expected.
//! * `UnrecognizedVariant` is included in each enum because a newer
//!   kernel may send values this crate does not know about. Decoding
//!   code decides per context whether such a value is an error.
//! * Values that combine as bit sets use `bitflags`.

#[macro_use]
mod macros;

/// Constants related to generic netlink
pub mod genl;
pub use crate::consts::genl::*;
/// Constants related to netlink top level headers
pub mod nl;
pub use crate::consts::nl::*;
/// Constants of the Open vSwitch datapath families
pub mod ovs;
pub use crate::consts::ovs::*;
/// Constants related to netlink socket operations
pub mod socket;
pub use crate::consts::socket::*;

/// Reimplementation of alignto macro in C
pub fn alignto(len: usize) -> usize {
    (len + libc::NLA_ALIGNTO as usize - 1) & !(libc::NLA_ALIGNTO as usize - 1)
}
