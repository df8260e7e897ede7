//! Background receive loop for sockets carrying unsolicited
//! messages, such as packet misses and vport notifications.
//!
//! # Design decisions
//!
//! The socket is switched to non-blocking mode and polled with
//! `epoll` together with an `eventfd`. Writing to the `eventfd` wakes
//! the thread and makes it exit, so a listener can be stopped without
//! waiting for traffic.
//!
//! A message that fails to decode is reported to the handler as a
//! recoverable error and the loop continues. A failing receive call is
//! reported as fatal and ends the loop.

use std::{
    io,
    mem::MaybeUninit,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    thread::{spawn, JoinHandle},
};

use log::{debug, error, trace, warn};

use crate::{
    de::next_message,
    err::NlError,
    socket::{received, NlSocket, Transport},
};

/// Receiver of the messages arriving on a listener socket
pub trait MessageHandler: Send + 'static {
    /// Handle one netlink message. An error is passed to
    /// [`MessageHandler::error`] as recoverable.
    fn handle(&mut self, msg: &[u8]) -> Result<(), NlError>;

    /// Report an error. `fatal` is true if the listener has stopped.
    fn error(&mut self, err: NlError, fatal: bool);
}

/// Pass every message in `datagram` to `handler`, reporting decode
/// and handler errors as recoverable.
pub fn dispatch_datagram<H>(datagram: &[u8], handler: &mut H)
where
    H: MessageHandler,
{
    let mut pos = 0;
    loop {
        match next_message(datagram, &mut pos) {
            Ok(Some(msg)) => {
                trace!("Listener message received: {:?}", msg);
                if let Err(e) = handler.handle(msg) {
                    warn!("Failed to handle message: {}", e);
                    handler.error(e, false);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping malformed datagram: {}", e);
                handler.error(NlError::from(e), false);
                break;
            }
        }
    }
}

/// A running listener thread. Dropping the listener signals the
/// thread to exit.
pub struct Listener {
    pid: u32,
    event_fd: OwnedFd,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Start a thread receiving from `socket` and feeding `handler`.
    pub fn spawn<H>(socket: NlSocket, buffer_len: usize, handler: H) -> Result<Self, NlError>
    where
        H: MessageHandler,
    {
        let pid = socket.pid()?;

        let owned_event_fd = {
            let event_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if event_fd < 0 {
                return Err(NlError::Io(io::Error::last_os_error()));
            }
            unsafe { OwnedFd::from_raw_fd(event_fd) }
        };

        let owned_duped_event_fd = {
            let duped_event_fd = unsafe { libc::dup(owned_event_fd.as_raw_fd()) };
            if duped_event_fd < 0 {
                return Err(NlError::Io(io::Error::last_os_error()));
            }
            unsafe { OwnedFd::from_raw_fd(duped_event_fd) }
        };

        socket.set_nonblocking()?;

        let epoll = {
            let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epoll_fd < 0 {
                return Err(NlError::Io(io::Error::last_os_error()));
            }
            unsafe { OwnedFd::from_raw_fd(epoll_fd) }
        };

        const EVENT_FD_TOKEN: u64 = 0;
        const SOCKET_TOKEN: u64 = 1;

        for (fd, token) in [
            (owned_event_fd.as_raw_fd(), EVENT_FD_TOKEN),
            (socket.as_raw_fd(), SOCKET_TOKEN),
        ] {
            let mut event = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: token,
            };
            if unsafe {
                libc::epoll_ctl(
                    epoll.as_raw_fd(),
                    libc::EPOLL_CTL_ADD,
                    fd,
                    &mut event as *mut _,
                )
            } < 0
            {
                return Err(NlError::Io(io::Error::last_os_error()));
            }
        }

        let thread = spawn(move || {
            let mut handler = handler;
            let mut buffer = vec![0u8; buffer_len];
            let mut events = vec![MaybeUninit::<libc::epoll_event>::uninit(); 2];
            debug!("Listener on port ID {} started", pid);
            loop {
                let event_count = unsafe {
                    libc::epoll_wait(
                        epoll.as_raw_fd(),
                        events.as_mut_ptr() as *mut _,
                        events.len() as libc::c_int,
                        100, /* ms */
                    )
                };
                if event_count < 0 {
                    let e = io::Error::last_os_error();
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!("Failed to epoll file descriptors: {}; exiting listener", e);
                    handler.error(NlError::Io(e), true);
                    return;
                }
                for event in events.iter().take(event_count as usize) {
                    let token = unsafe { event.assume_init_ref() }.u64;
                    if token == EVENT_FD_TOKEN {
                        let mut signal = [0u8; 8];
                        let ret = unsafe {
                            libc::read(
                                owned_event_fd.as_raw_fd(),
                                signal.as_mut_ptr() as *mut _,
                                signal.len(),
                            )
                        };
                        if ret > 0 {
                            debug!("Listener on port ID {} signaled to exit; exiting", pid);
                            return;
                        }
                    } else if token == SOCKET_TOKEN {
                        loop {
                            match socket.recv(&mut buffer[..]) {
                                Ok(len) => match received(&buffer, len) {
                                    Ok(datagram) => dispatch_datagram(datagram, &mut handler),
                                    Err(e) => {
                                        warn!("Dropping datagram on port ID {}: {}", pid, e);
                                        handler.error(e, false);
                                    }
                                },
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                                Err(e) => {
                                    error!(
                                        "Receive failed on listener port ID {}: {}; exiting",
                                        pid, e
                                    );
                                    handler.error(NlError::Io(e), true);
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(Listener {
            pid,
            event_fd: owned_duped_event_fd,
            thread: Some(thread),
        })
    }

    /// Port ID of the listening socket
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the listener thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| t.is_finished())
            .unwrap_or(true)
    }

    fn signal_exit(&self) {
        let buffer: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 1];
        let ret = unsafe {
            libc::write(
                self.event_fd.as_raw_fd(),
                buffer.as_ptr() as *const _,
                buffer.len(),
            )
        };
        if ret < 0 {
            warn!(
                "Failed to signal listener to exit: {}",
                io::Error::last_os_error()
            );
        }
    }

    /// Signal the thread to exit and wait for it.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.signal_exit();
            if thread.join().is_err() {
                error!("Listener on port ID {} panicked", self.pid);
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.signal_exit();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::{
        consts::nl::NlmF, err::DeError, ser::NlMsgBuilder, socket::mock, test::setup,
        utils::Groups,
    };

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<u32>>>,
        errors: Arc<Mutex<Vec<(String, bool)>>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&mut self, msg: &[u8]) -> Result<(), NlError> {
            let hdr = crate::nl::Nlmsghdr::read_from(msg)?;
            if hdr.nl_type == 99 {
                return Err(NlError::new("bad message"));
            }
            self.seen.lock().push(hdr.nl_seq);
            Ok(())
        }

        fn error(&mut self, err: NlError, fatal: bool) {
            self.errors.lock().push((err.to_string(), fatal));
        }
    }

    fn msg(nl_type: u16, seq: u32) -> Vec<u8> {
        mock::response(NlMsgBuilder::new(NlmF::empty(), nl_type), seq, 0)
    }

    #[test]
    fn test_dispatch_continues_after_handler_error() {
        setup();

        let datagram = [msg(20, 1), msg(99, 2), msg(20, 3)].concat();
        let mut rec = Recorder::default();
        dispatch_datagram(&datagram, &mut rec);
        assert_eq!(*rec.seen.lock(), vec![1, 3]);
        assert_eq!(
            *rec.errors.lock(),
            vec![("bad message".to_string(), false)]
        );
    }

    #[test]
    fn test_dispatch_malformed_datagram() {
        setup();

        let mut datagram = [msg(20, 1), msg(20, 2)].concat();
        datagram.truncate(datagram.len() - 2);
        let mut rec = Recorder::default();
        dispatch_datagram(&datagram, &mut rec);
        assert_eq!(*rec.seen.lock(), vec![1]);
        let errors = rec.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].1);
        assert_eq!(
            errors[0].0,
            NlError::from(DeError::UnexpectedEOB {
                context: "netlink header",
                needed: 16,
                available: 14
            })
            .to_string()
        );
    }

    #[test]
    #[ignore]
    fn real_listener_stops() {
        setup();

        let socket =
            NlSocket::connect(crate::consts::socket::NlFamily::Generic, None, Groups::empty())
                .unwrap();
        let mut listener = Listener::spawn(socket, 4096, Recorder::default()).unwrap();
        assert!(listener.pid() != 0);
        listener.stop();
        assert!(listener.is_finished());
    }
}
