use std::time::Duration;

use log::{debug, trace};

use crate::{
    consts::socket::NlFamily,
    de::{next_message, HeaderCheck, NlMsgParser},
    err::NlError,
    ser::NlMsgBuilder,
    socket::{received, shared::NlSocket, Transport},
    utils::Groups,
};

/// Higher level handle for socket operations.
pub struct NlSocketHandle {
    transport: Box<dyn Transport + Send>,
    pid: u32,
    buffer: Vec<u8>,
}

impl NlSocketHandle {
    /// Open a blocking generic netlink socket bound to a kernel
    /// assigned port ID and joined to `groups`.
    pub fn connect(
        groups: Groups,
        recv_timeout: Option<Duration>,
        buffer_len: usize,
    ) -> Result<Self, NlError> {
        let socket = NlSocket::connect(NlFamily::Generic, None, groups)?;
        socket.set_recv_timeout(recv_timeout)?;
        let pid = socket.pid()?;
        debug!("Opened netlink socket with port ID {}", pid);
        Ok(NlSocketHandle::from_transport(Box::new(socket), pid, buffer_len))
    }

    /// Wrap an already bound transport.
    pub fn from_transport(
        transport: Box<dyn Transport + Send>,
        pid: u32,
        buffer_len: usize,
    ) -> Self {
        NlSocketHandle {
            transport,
            pid,
            buffer: vec![0; buffer_len],
        }
    }

    /// Get the PID for the current socket.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Finish and send a message without waiting for a reply. Returns
    /// the sequence number of the message.
    pub fn send(&mut self, builder: NlMsgBuilder) -> Result<u32, NlError> {
        let (buf, seq) = builder.finish()?;
        trace!("Buffer sent: {:?}", buf);
        self.transport.send(&buf)?;
        Ok(seq)
    }

    /// Send a request and return the single message answering it.
    /// Messages with other sequence numbers are skipped.
    pub fn request(&mut self, builder: NlMsgBuilder) -> Result<Vec<u8>, NlError> {
        let seq = self.send(builder)?;
        let pid = self.pid;
        let mut response = None;
        while response.is_none() {
            self.receive(|msg| {
                match NlMsgParser::new(msg).check_header(pid, seq)? {
                    HeaderCheck::Ignorable(hdr) => {
                        debug!(
                            "Skipping message with sequence number {} while waiting for {}",
                            hdr.nl_seq, seq
                        );
                        Ok(true)
                    }
                    HeaderCheck::Valid(_) => {
                        response = Some(msg.to_vec());
                        Ok(false)
                    }
                }
            })?;
        }
        response.ok_or_else(|| NlError::new("No response received"))
    }

    /// Send a dump request and pass every message of the dump to
    /// `consumer` until the kernel signals its end. An error from
    /// `consumer` aborts the dump and is returned.
    ///
    /// A plain ack ends the dump like `DONE` does.
    pub fn request_multi<F>(&mut self, builder: NlMsgBuilder, mut consumer: F) -> Result<(), NlError>
    where
        F: FnMut(&[u8]) -> Result<(), NlError>,
    {
        let seq = self.send(builder)?;
        let pid = self.pid;
        let mut done = false;
        while !done {
            self.receive(|msg| {
                match NlMsgParser::new(msg).check_header(pid, seq)? {
                    HeaderCheck::Ignorable(hdr) => {
                        debug!(
                            "Skipping message with sequence number {} during dump {}",
                            hdr.nl_seq, seq
                        );
                        Ok(true)
                    }
                    HeaderCheck::Valid(hdr) if hdr.is_done() || hdr.is_error() => {
                        done = true;
                        Ok(false)
                    }
                    HeaderCheck::Valid(_) => {
                        consumer(msg)?;
                        Ok(true)
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Receive one datagram and pass each message in it to
    /// `handler`. Stops early and returns `false` as soon as `handler`
    /// does.
    pub fn receive<F>(&mut self, mut handler: F) -> Result<bool, NlError>
    where
        F: FnMut(&[u8]) -> Result<bool, NlError>,
    {
        let len = self.transport.recv(&mut self.buffer)?;
        let datagram = received(&self.buffer, len)?;
        trace!("Buffer received: {:?}", datagram);
        let mut pos = 0;
        while let Some(msg) = next_message(datagram, &mut pos)? {
            if !handler(msg)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        consts::nl::{NlmF, REQUEST_FLAGS},
        socket::mock::{self, MockTransport},
        test::setup,
    };

    const PID: u32 = 4242;
    const TY: u16 = 30;

    fn handle(mock: &MockTransport) -> NlSocketHandle {
        NlSocketHandle::from_transport(Box::new(mock.clone()), PID, 8192)
    }

    fn data(seq: u32, val: u32) -> Vec<u8> {
        let mut b = NlMsgBuilder::new(NlmF::MULTI, TY);
        b.put_genlhdr(1, 1);
        b.put_u32_attr(1, val).unwrap();
        mock::response(b, seq, PID)
    }

    fn value(msg: &[u8]) -> u32 {
        let mut p = NlMsgParser::new(msg);
        p.expect_nlmsghdr(TY).unwrap();
        p.expect_genlhdr(1u8).unwrap();
        p.take_attrs().unwrap().get_u32(1u16).unwrap()
    }

    #[test]
    fn test_request_skips_stray_sequence() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| data(seq + 100, 1));
        mock.push(|seq| data(seq, 2));
        let mut h = handle(&mock);

        let resp = h.request(NlMsgBuilder::new(REQUEST_FLAGS, TY)).unwrap();
        assert_eq!(value(&resp), 2);
        assert_eq!(mock.sent().len(), 1);
    }

    #[test]
    fn test_request_kernel_error() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| mock::error(libc::ENODEV, seq, PID));
        let mut h = handle(&mock);

        let err = h.request(NlMsgBuilder::new(REQUEST_FLAGS, TY)).unwrap_err();
        assert!(err.is_errno(libc::ENODEV));
    }

    #[test]
    fn test_request_bad_pid() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| {
            let mut b = NlMsgBuilder::new(NlmF::empty(), TY);
            b.put_genlhdr(1, 1);
            mock::response(b, seq, PID + 1)
        });
        let mut h = handle(&mock);

        assert!(matches!(
            h.request(NlMsgBuilder::new(REQUEST_FLAGS, TY)),
            Err(NlError::BadPid { .. })
        ));
    }

    #[test]
    fn test_request_transport_error() {
        setup();

        let mock = MockTransport::new();
        let mut h = handle(&mock);
        assert!(matches!(
            h.request(NlMsgBuilder::new(REQUEST_FLAGS, TY)),
            Err(NlError::Io(_))
        ));
    }

    #[test]
    fn test_receive_truncated_datagram() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| [data(seq, 1), data(seq, 2)].concat());
        let mut h = NlSocketHandle::from_transport(Box::new(mock.clone()), PID, 40);

        let err = h.request(NlMsgBuilder::new(REQUEST_FLAGS, TY)).unwrap_err();
        assert!(matches!(
            err,
            NlError::Truncated {
                len: 56,
                buffer_len: 40
            }
        ));
        assert!(err.to_string().contains("recv_buffer_len"));
    }

    #[test]
    fn test_dump_ends_on_ack() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| [data(seq, 0), mock::error(0, seq, PID)].concat());
        let mut h = handle(&mock);

        let mut seen = Vec::new();
        h.request_multi(NlMsgBuilder::new(REQUEST_FLAGS, TY), |msg| {
            seen.push(value(msg));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![0]);
        assert_eq!(mock.pending(), 0);
    }

    #[test]
    fn test_dump_runs_consumer_per_message() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| [data(seq, 0), data(seq, 1)].concat());
        mock.push(|seq| [data(seq + 7, 99), data(seq, 2)].concat());
        mock.push(|seq| mock::done(seq, PID));
        let mut h = handle(&mock);

        let mut seen = Vec::new();
        h.request_multi(NlMsgBuilder::new(REQUEST_FLAGS, TY), |msg| {
            seen.push(value(msg));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_dump_consumer_error_stops() {
        setup();

        let mock = MockTransport::new();
        mock.push(|seq| [data(seq, 0), data(seq, 1), data(seq, 2)].concat());
        mock.push(|seq| mock::done(seq, PID));
        let mut h = handle(&mock);

        let mut calls = 0;
        let res = h.request_multi(NlMsgBuilder::new(REQUEST_FLAGS, TY), |msg| {
            calls += 1;
            if value(msg) == 1 {
                Err(NlError::new("stop"))
            } else {
                Ok(())
            }
        });
        assert!(matches!(res, Err(NlError::Msg(ref m)) if m == "stop"));
        assert_eq!(calls, 2);
    }
}
