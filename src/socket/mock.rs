//! Scripted in-memory transport for exercising request, dump and
//! listener logic without a kernel.

use std::{collections::VecDeque, io, sync::Arc};

use byteorder::{ByteOrder, NativeEndian, WriteBytesExt};
use parking_lot::Mutex;

use crate::{
    consts::nl::{NlmF, Nlmsg},
    nl::Nlmsghdr,
    ser::NlMsgBuilder,
    socket::Transport,
};

type Responder = Box<dyn FnOnce(u32) -> Vec<u8> + Send>;

#[derive(Default)]
struct MockState {
    sent: Vec<Vec<u8>>,
    datagrams: VecDeque<Responder>,
}

/// Transport returning scripted datagrams. Each datagram is produced
/// from the sequence number of the most recently sent message.
/// Clones share their script.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport::default()
    }

    /// Queue the next datagram.
    pub fn push<F>(&self, f: F)
    where
        F: FnOnce(u32) -> Vec<u8> + Send + 'static,
    {
        self.state.lock().datagrams.push_back(Box::new(f));
    }

    /// Messages sent so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    /// Number of datagrams not yet received
    pub fn pending(&self) -> usize {
        self.state.lock().datagrams.len()
    }
}

impl Transport for MockTransport {
    fn send(&self, buf: &[u8]) -> Result<(), io::Error> {
        self.state.lock().sent.push(buf.to_vec());
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, io::Error> {
        let mut state = self.state.lock();
        let seq = state
            .sent
            .last()
            .map(|m| NativeEndian::read_u32(&m[8..12]))
            .unwrap_or(0);
        let responder = state
            .datagrams
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no scripted datagram"))?;
        drop(state);
        let datagram = responder(seq);
        let copied = datagram.len().min(buf.len());
        buf[..copied].copy_from_slice(&datagram[..copied]);
        Ok(datagram.len())
    }
}

/// Finish `builder` as a kernel message with the given sequence
/// number and port ID.
pub fn response(builder: NlMsgBuilder, seq: u32, pid: u32) -> Vec<u8> {
    let (mut buf, _) = builder.finish().unwrap();
    NativeEndian::write_u32(&mut buf[8..12], seq);
    NativeEndian::write_u32(&mut buf[12..16], pid);
    buf
}

/// A `DONE` message ending a dump.
pub fn done(seq: u32, pid: u32) -> Vec<u8> {
    let mut b = NlMsgBuilder::new(NlmF::MULTI, Nlmsg::Done.into());
    b.put_slice(&[0; 4]);
    response(b, seq, pid)
}

/// An error message carrying `errno`, or an ack for errno 0.
pub fn error(errno: i32, seq: u32, pid: u32) -> Vec<u8> {
    let mut b = NlMsgBuilder::new(NlmF::empty(), Nlmsg::Error.into());
    let mut payload = Vec::new();
    payload.write_i32::<NativeEndian>(-errno).unwrap();
    payload.resize(4 + Nlmsghdr::SIZE, 0);
    b.put_slice(&payload);
    response(b, seq, pid)
}
