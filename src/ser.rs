//! Append-only netlink message builder.
//!
//! A message is built front to back: the netlink header is reserved
//! by [`NlMsgBuilder::new`], fixed headers and attributes are appended,
//! and [`NlMsgBuilder::finish`] stamps the total length and a fresh
//! sequence number.
//!
//! # Design decisions
//!
//! Every `put_*` leaves the buffer aligned to four bytes. The length
//! of an attribute covers its header and value but not the padding
//! that follows it. Nested attributes are aligned before their length
//! is patched, so the padding of their last inner attribute is
//! counted. The kernel rejects messages that deviate from this.

use std::{
    ffi::CString,
    sync::atomic::{AtomicU32, Ordering},
};

use byteorder::{ByteOrder, NativeEndian, WriteBytesExt};
use log::trace;

use crate::{
    consts::{alignto, nl::NlmF},
    err::SerError,
    nl::{Nlattr, Nlmsghdr},
};

const INITIAL_CAPACITY: usize = 1024;

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

/// Allocate the next process wide sequence number.
pub fn next_seq() -> u32 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Builder for a single netlink message
#[derive(Debug)]
pub struct NlMsgBuilder {
    buf: Vec<u8>,
}

impl NlMsgBuilder {
    /// Start a message of type `nl_type` with the given header flags.
    pub fn new(flags: NlmF, nl_type: u16) -> Self {
        let mut builder = NlMsgBuilder {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
        };
        let pos = builder.grow(Nlmsghdr::SIZE);
        Nlmsghdr {
            nl_len: 0,
            nl_type,
            nl_flags: flags,
            nl_seq: 0,
            nl_pid: 0,
        }
        .write_to(&mut builder.buf[pos..]);
        builder
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written. Never true for a
    /// builder created by [`NlMsgBuilder::new`].
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pad the buffer with zeros to the next four byte boundary.
    pub fn align(&mut self) {
        let aligned = alignto(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Align, then reserve `size` zeroed bytes and return their
    /// offset.
    pub fn grow(&mut self, size: usize) -> usize {
        self.align();
        let pos = self.buf.len();
        self.buf.resize(pos + size, 0);
        pos
    }

    /// Append a generic netlink header.
    pub fn put_genlhdr(&mut self, cmd: u8, version: u8) {
        let pos = self.grow(crate::genl::Genlmsghdr::SIZE);
        crate::genl::Genlmsghdr { cmd, version }.write_to(&mut self.buf[pos..]);
    }

    /// Append the datapath header carried by every Open vSwitch
    /// message.
    pub fn put_ovs_header(&mut self, dp_ifindex: i32) {
        let pos = self.grow(crate::ovs::OvsHeader::SIZE);
        crate::ovs::OvsHeader { dp_ifindex }.write_to(&mut self.buf[pos..]);
    }

    /// Append an attribute whose value is written by `write_value`.
    pub fn put_attr<F>(&mut self, ty: u16, write_value: F) -> Result<(), SerError>
    where
        F: FnOnce(&mut Self) -> Result<(), SerError>,
    {
        let pos = self.grow(Nlattr::SIZE);
        write_value(self)?;
        self.close_attr(pos, ty)?;
        self.align();
        Ok(())
    }

    /// Append an attribute containing a nested attribute set written
    /// by `write_attrs`.
    pub fn put_nested_attr<F>(&mut self, ty: u16, write_attrs: F) -> Result<(), SerError>
    where
        F: FnOnce(&mut Self) -> Result<(), SerError>,
    {
        let pos = self.grow(Nlattr::SIZE);
        write_attrs(self)?;
        self.align();
        self.close_attr(pos, ty)
    }

    fn close_attr(&mut self, pos: usize, ty: u16) -> Result<(), SerError> {
        let len = self.buf.len() - pos;
        let nla_len = u16::try_from(len).map_err(|_| SerError::AttrTooLong(len))?;
        Nlattr {
            nla_len,
            nla_type: ty,
        }
        .write_to(&mut self.buf[pos..]);
        Ok(())
    }

    /// Append raw bytes to the value of the attribute being written.
    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append an attribute without a value.
    pub fn put_empty_attr(&mut self, ty: u16) -> Result<(), SerError> {
        self.put_attr(ty, |_| Ok(()))
    }

    /// Append an attribute holding a `u8`.
    pub fn put_u8_attr(&mut self, ty: u16, val: u8) -> Result<(), SerError> {
        self.put_attr(ty, |b| Ok(b.buf.write_u8(val)?))
    }

    /// Append an attribute holding a native endian `u16`.
    pub fn put_u16_attr(&mut self, ty: u16, val: u16) -> Result<(), SerError> {
        self.put_attr(ty, |b| Ok(b.buf.write_u16::<NativeEndian>(val)?))
    }

    /// Append an attribute holding a native endian `u32`.
    pub fn put_u32_attr(&mut self, ty: u16, val: u32) -> Result<(), SerError> {
        self.put_attr(ty, |b| Ok(b.buf.write_u32::<NativeEndian>(val)?))
    }

    /// Append an attribute holding a native endian `u64`.
    pub fn put_u64_attr(&mut self, ty: u16, val: u64) -> Result<(), SerError> {
        self.put_attr(ty, |b| Ok(b.buf.write_u64::<NativeEndian>(val)?))
    }

    /// Append an attribute holding a null terminated string.
    pub fn put_string_attr(&mut self, ty: u16, val: &str) -> Result<(), SerError> {
        let cstr = CString::new(val).map_err(|_| SerError::NullError)?;
        self.put_slice_attr(ty, cstr.as_bytes_with_nul())
    }

    /// Append an attribute holding raw bytes.
    pub fn put_slice_attr(&mut self, ty: u16, data: &[u8]) -> Result<(), SerError> {
        self.put_attr(ty, |b| {
            b.put_slice(data);
            Ok(())
        })
    }

    /// Stamp the message length and a new sequence number and return
    /// the finished message with its sequence number.
    pub fn finish(mut self) -> Result<(Vec<u8>, u32), SerError> {
        self.align();
        let len = self.buf.len();
        let nl_len = u32::try_from(len).map_err(|_| SerError::MsgTooLong(len))?;
        let seq = next_seq();
        NativeEndian::write_u32(&mut self.buf[0..4], nl_len);
        NativeEndian::write_u32(&mut self.buf[8..12], seq);
        trace!("Finished message with sequence number {}: {:?}", seq, self.buf);
        Ok((self.buf, seq))
    }
}
