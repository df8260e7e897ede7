//! This module contains the top level netlink header and the
//! attribute header. Every netlink message will be encapsulated in a
//! top level `Nlmsghdr`.
//!
//! # Design decisions
//!
//! Records are never reinterpreted in place. Each one has a fixed
//! `SIZE` and explicit `write_to`/`read_from` functions that read and
//! write every field at its kernel ABI offset in native byte order.

use byteorder::{ByteOrder, NativeEndian};

use crate::{
    consts::nl::{NlmF, Nlmsg},
    de::ensure_len,
    err::{DeError, Nlmsgerr},
};

/// Netlink attribute type bits that are flags rather than part of the
/// type.
pub const NLA_TYPE_MASK: u16 = !((libc::NLA_F_NESTED | libc::NLA_F_NET_BYTEORDER) as u16);

/// Top level netlink header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nlmsghdr {
    /// Length of the netlink message
    pub nl_len: u32,
    /// Type of the netlink message
    pub nl_type: u16,
    /// Flags indicating properties of the request or response
    pub nl_flags: NlmF,
    /// Sequence number for netlink protocol
    pub nl_seq: u32,
    /// ID of the netlink destination for requests and source for
    /// responses
    pub nl_pid: u32,
}

impl Nlmsghdr {
    /// Size of the header on the wire
    pub const SIZE: usize = 16;

    /// Write the header into the first [`Nlmsghdr::SIZE`] bytes of
    /// `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        NativeEndian::write_u32(&mut buf[0..4], self.nl_len);
        NativeEndian::write_u16(&mut buf[4..6], self.nl_type);
        NativeEndian::write_u16(&mut buf[6..8], self.nl_flags.bits());
        NativeEndian::write_u32(&mut buf[8..12], self.nl_seq);
        NativeEndian::write_u32(&mut buf[12..16], self.nl_pid);
    }

    /// Read a header from the start of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<Self, DeError> {
        ensure_len("netlink header", buf, Self::SIZE)?;
        Ok(Nlmsghdr {
            nl_len: NativeEndian::read_u32(&buf[0..4]),
            nl_type: NativeEndian::read_u16(&buf[4..6]),
            nl_flags: NlmF::from_bits_retain(NativeEndian::read_u16(&buf[6..8])),
            nl_seq: NativeEndian::read_u32(&buf[8..12]),
            nl_pid: NativeEndian::read_u32(&buf[12..16]),
        })
    }

    /// Whether this message carries a netlink error or ack
    pub fn is_error(&self) -> bool {
        self.nl_type == u16::from(Nlmsg::Error)
    }

    /// Whether this message terminates a dump
    pub fn is_done(&self) -> bool {
        self.nl_type == u16::from(Nlmsg::Done)
    }
}

/// Header of a netlink attribute
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nlattr {
    /// Length of the attribute header and value without trailing
    /// padding
    pub nla_len: u16,
    /// Type of the attribute with the nested and byte order flags
    /// stripped
    pub nla_type: u16,
}

impl Nlattr {
    /// Size of the header on the wire
    pub const SIZE: usize = 4;

    /// Write the header into the first [`Nlattr::SIZE`] bytes of
    /// `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        NativeEndian::write_u16(&mut buf[0..2], self.nla_len);
        NativeEndian::write_u16(&mut buf[2..4], self.nla_type);
    }

    /// Read a header from the start of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<Self, DeError> {
        ensure_len("attribute header", buf, Self::SIZE)?;
        Ok(Nlattr {
            nla_len: NativeEndian::read_u16(&buf[0..2]),
            nla_type: NativeEndian::read_u16(&buf[2..4]) & NLA_TYPE_MASK,
        })
    }
}

/// Size of the payload of an `NLMSG_ERROR` message
pub const NLMSGERR_SIZE: usize = 4 + Nlmsghdr::SIZE;

/// Read the payload of an `NLMSG_ERROR` message.
pub fn read_nlmsgerr(buf: &[u8]) -> Result<Nlmsgerr, DeError> {
    ensure_len("netlink error", buf, NLMSGERR_SIZE)?;
    Ok(Nlmsgerr {
        error: NativeEndian::read_i32(&buf[0..4]),
        nlmsg: Nlmsghdr::read_from(&buf[4..])?,
    })
}
