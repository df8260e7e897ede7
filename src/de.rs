//! Netlink message parsing.
//!
//! [`next_message`] splits a received datagram into messages and
//! [`NlMsgParser`] walks the headers of one message before handing
//! out its attributes as an [`Attrs`] map or an ordered list.
//!
//! # Design decisions
//!
//! Attribute values are borrowed from the receive buffer. All length
//! checks happen before a slice is taken, so malformed input turns
//! into a [`DeError`] instead of a panic.

use std::{collections::HashMap, str};

use byteorder::{ByteOrder, NativeEndian};
use log::trace;

use crate::{
    consts::alignto,
    err::{DeError, NlError},
    genl::Genlmsghdr,
    nl::{read_nlmsgerr, Nlattr, Nlmsghdr},
    ovs::OvsHeader,
};

/// Fail with [`DeError::UnexpectedEOB`] unless `buf` holds at least
/// `needed` bytes.
pub fn ensure_len(context: &'static str, buf: &[u8], needed: usize) -> Result<(), DeError> {
    if buf.len() < needed {
        Err(DeError::UnexpectedEOB {
            context,
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Slice the next message out of a datagram that may hold several,
/// starting at `pos`. Advances `pos` past the message and its
/// alignment padding. Returns `None` once the datagram is exhausted.
pub fn next_message<'a>(datagram: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, DeError> {
    if *pos >= datagram.len() {
        return Ok(None);
    }
    let rest = &datagram[*pos..];
    let hdr = Nlmsghdr::read_from(rest)?;
    let len = hdr.nl_len as usize;
    if len < Nlmsghdr::SIZE {
        return Err(DeError::BadLength {
            context: "netlink message",
            len,
        });
    }
    ensure_len("netlink message", rest, len)?;
    *pos += alignto(len).min(rest.len());
    Ok(Some(&rest[..len]))
}

/// Outcome of checking a response header against a request
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderCheck {
    /// The message answers the request. Kernel acks (error messages
    /// with errno 0) are valid answers.
    Valid(Nlmsghdr),
    /// The message carries another sequence number and should be
    /// skipped.
    Ignorable(Nlmsghdr),
}

/// Cursor over a single netlink message
#[derive(Debug)]
pub struct NlMsgParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NlMsgParser<'a> {
    /// Start parsing at the first byte of a message.
    pub fn new(data: &'a [u8]) -> Self {
        NlMsgParser { data, pos: 0 }
    }

    /// Unparsed bytes of the message
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Take the next `len` bytes and move to the following four byte
    /// boundary.
    pub fn advance(&mut self, context: &'static str, len: usize) -> Result<&'a [u8], DeError> {
        let rest = self.remaining();
        ensure_len(context, rest, len)?;
        self.pos += alignto(len).min(rest.len());
        Ok(&rest[..len])
    }

    /// Read the netlink header.
    pub fn take_nlmsghdr(&mut self) -> Result<Nlmsghdr, DeError> {
        let hdr = Nlmsghdr::read_from(self.advance("netlink header", Nlmsghdr::SIZE)?)?;
        trace!("Parsing message header: {:?}", hdr);
        Ok(hdr)
    }

    /// Read the netlink header and fail unless it has type `nl_type`.
    pub fn expect_nlmsghdr(&mut self, nl_type: u16) -> Result<Nlmsghdr, DeError> {
        let hdr = self.take_nlmsghdr()?;
        if hdr.nl_type != nl_type {
            return Err(DeError::UnexpectedType {
                expected: nl_type,
                found: hdr.nl_type,
            });
        }
        Ok(hdr)
    }

    /// Read the netlink header and match it against the port ID and
    /// sequence number of a request.
    ///
    /// A different port ID is an error. A different sequence number
    /// makes the message ignorable. An error message with a non-zero
    /// errno is returned as [`NlError::Nlmsgerr`].
    pub fn check_header(&mut self, pid: u32, seq: u32) -> Result<HeaderCheck, NlError> {
        let hdr = self.take_nlmsghdr()?;
        if hdr.nl_pid != pid {
            return Err(NlError::BadPid {
                expected: pid,
                found: hdr.nl_pid,
            });
        }
        if hdr.nl_seq != seq {
            return Ok(HeaderCheck::Ignorable(hdr));
        }
        if hdr.is_error() {
            let err = read_nlmsgerr(self.remaining())?;
            if err.error != 0 {
                return Err(NlError::Nlmsgerr(err));
            }
        }
        Ok(HeaderCheck::Valid(hdr))
    }

    /// Read the generic netlink header and fail unless its command is
    /// `cmd`.
    pub fn expect_genlhdr(&mut self, cmd: impl Into<u8>) -> Result<Genlmsghdr, DeError> {
        self.expect_genlhdr_of(&[cmd.into()])
    }

    /// Read the generic netlink header and fail unless its command is
    /// one of `cmds`.
    pub fn expect_genlhdr_of(&mut self, cmds: &[u8]) -> Result<Genlmsghdr, DeError> {
        let hdr = Genlmsghdr::read_from(self.advance("generic netlink header", Genlmsghdr::SIZE)?)?;
        if !cmds.contains(&hdr.cmd) {
            return Err(DeError::UnexpectedCmd {
                expected: cmds.to_vec(),
                found: hdr.cmd,
            });
        }
        Ok(hdr)
    }

    /// Read the Open vSwitch datapath header.
    pub fn take_ovs_header(&mut self) -> Result<OvsHeader, DeError> {
        OvsHeader::read_from(self.advance("datapath header", OvsHeader::SIZE)?)
    }

    /// Consume the rest of the message as a flat attribute set.
    pub fn take_attrs(&mut self) -> Result<Attrs<'a>, DeError> {
        let attrs = Attrs::parse(self.remaining())?;
        self.pos = self.data.len();
        Ok(attrs)
    }

    /// Consume the rest of the message as an ordered attribute list.
    pub fn take_ordered_attrs(&mut self) -> Result<Vec<(u16, &'a [u8])>, DeError> {
        let attrs = parse_ordered_attrs(self.remaining())?;
        self.pos = self.data.len();
        Ok(attrs)
    }
}

/// Parse a buffer of attributes into `(type, value)` pairs, keeping
/// their order and any repeated types.
pub fn parse_ordered_attrs(data: &[u8]) -> Result<Vec<(u16, &[u8])>, DeError> {
    let mut attrs = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let rest = &data[pos..];
        let hdr = Nlattr::read_from(rest)?;
        let len = hdr.nla_len as usize;
        if len < Nlattr::SIZE {
            return Err(DeError::BadLength {
                context: "attribute",
                len,
            });
        }
        ensure_len("attribute", rest, len)?;
        attrs.push((hdr.nla_type, &rest[Nlattr::SIZE..len]));
        pos += alignto(len).min(rest.len());
    }
    Ok(attrs)
}

fn fixed<const N: usize>(ty: u16, val: &[u8]) -> Result<[u8; N], DeError> {
    <[u8; N]>::try_from(val).map_err(|_| DeError::BadAttrLength {
        ty,
        expected: N,
        found: val.len(),
    })
}

/// A flat attribute set keyed by attribute type. When a type repeats,
/// the last value wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attrs<'a> {
    attrs: HashMap<u16, &'a [u8]>,
}

impl<'a> Attrs<'a> {
    /// Parse a buffer of attributes.
    pub fn parse(data: &'a [u8]) -> Result<Self, DeError> {
        Ok(Attrs {
            attrs: parse_ordered_attrs(data)?.into_iter().collect(),
        })
    }

    /// Number of distinct attribute types
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Iterate over `(type, value)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &'a [u8])> + '_ {
        self.attrs.iter().map(|(ty, val)| (*ty, *val))
    }

    /// Whether an attribute of this type is present
    pub fn contains(&self, ty: impl Into<u16>) -> bool {
        self.attrs.contains_key(&ty.into())
    }

    /// Raw value of an attribute if present
    pub fn get(&self, ty: impl Into<u16>) -> Option<&'a [u8]> {
        self.attrs.get(&ty.into()).copied()
    }

    /// Raw value of a mandatory attribute
    pub fn get_bytes(&self, ty: impl Into<u16>) -> Result<&'a [u8], DeError> {
        let ty = ty.into();
        self.get(ty).ok_or(DeError::MissingAttr(ty))
    }

    /// Value of a mandatory attribute with exactly `N` bytes
    pub fn get_array<const N: usize>(&self, ty: impl Into<u16>) -> Result<[u8; N], DeError> {
        let ty = ty.into();
        fixed(ty, self.get_bytes(ty)?)
    }

    /// Mandatory `u8` attribute
    pub fn get_u8(&self, ty: impl Into<u16>) -> Result<u8, DeError> {
        Ok(self.get_array::<1>(ty)?[0])
    }

    /// Mandatory `u16` attribute
    pub fn get_u16(&self, ty: impl Into<u16>) -> Result<u16, DeError> {
        Ok(NativeEndian::read_u16(&self.get_array::<2>(ty)?))
    }

    /// Mandatory `u32` attribute
    pub fn get_u32(&self, ty: impl Into<u16>) -> Result<u32, DeError> {
        Ok(NativeEndian::read_u32(&self.get_array::<4>(ty)?))
    }

    /// Mandatory `u64` attribute
    pub fn get_u64(&self, ty: impl Into<u16>) -> Result<u64, DeError> {
        Ok(NativeEndian::read_u64(&self.get_array::<8>(ty)?))
    }

    /// Mandatory null terminated string attribute
    pub fn get_string(&self, ty: impl Into<u16>) -> Result<String, DeError> {
        let val = self.get_bytes(ty)?;
        match val.split_last() {
            Some((&0, s)) if !s.contains(&0) => Ok(str::from_utf8(s)?.to_string()),
            Some((&0, _)) => Err(DeError::InteriorNull),
            _ => Err(DeError::NoNullError),
        }
    }

    /// Whether a flag attribute is set
    pub fn get_flag(&self, ty: impl Into<u16>) -> bool {
        self.contains(ty)
    }

    /// Mandatory nested attribute set
    pub fn get_nested(&self, ty: impl Into<u16>) -> Result<Attrs<'a>, DeError> {
        Attrs::parse(self.get_bytes(ty)?)
    }

    /// Mandatory nested attribute list keeping order and repeats
    pub fn get_ordered(&self, ty: impl Into<u16>) -> Result<Vec<(u16, &'a [u8])>, DeError> {
        parse_ordered_attrs(self.get_bytes(ty)?)
    }

    /// Optional `u8` attribute
    pub fn get_optional_u8(&self, ty: impl Into<u16>) -> Result<Option<u8>, DeError> {
        self.optional(ty, |a, ty| a.get_u8(ty))
    }

    /// Optional `u16` attribute
    pub fn get_optional_u16(&self, ty: impl Into<u16>) -> Result<Option<u16>, DeError> {
        self.optional(ty, |a, ty| a.get_u16(ty))
    }

    /// Optional `u32` attribute
    pub fn get_optional_u32(&self, ty: impl Into<u16>) -> Result<Option<u32>, DeError> {
        self.optional(ty, |a, ty| a.get_u32(ty))
    }

    /// Optional `u64` attribute
    pub fn get_optional_u64(&self, ty: impl Into<u16>) -> Result<Option<u64>, DeError> {
        self.optional(ty, |a, ty| a.get_u64(ty))
    }

    /// Optional string attribute
    pub fn get_optional_string(&self, ty: impl Into<u16>) -> Result<Option<String>, DeError> {
        self.optional(ty, |a, ty| a.get_string(ty))
    }

    /// Optional nested attribute set
    pub fn get_optional_nested(&self, ty: impl Into<u16>) -> Result<Option<Attrs<'a>>, DeError> {
        self.optional(ty, |a, ty| a.get_nested(ty))
    }

    fn optional<T, F>(&self, ty: impl Into<u16>, get: F) -> Result<Option<T>, DeError>
    where
        F: FnOnce(&Self, u16) -> Result<T, DeError>,
    {
        let ty = ty.into();
        if self.contains(ty) {
            get(self, ty).map(Some)
        } else {
            Ok(None)
        }
    }
}
