use std::{
    io,
    mem::{size_of, zeroed},
    os::unix::io::{AsRawFd, RawFd},
    time::Duration,
};

use libc::{c_int, c_void, socklen_t};

use crate::{consts::socket::*, socket::Transport, utils::Groups};

/// Turn the `-1` of a failed system call into the pending OS error.
fn cvt<T>(ret: T) -> Result<T, io::Error>
where
    T: Copy + PartialOrd + From<i8>,
{
    if ret < T::from(0) {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Low level access to a netlink socket.
#[derive(Debug)]
pub struct NlSocket {
    fd: c_int,
}

impl NlSocket {
    /// Open a blocking netlink socket of protocol `proto`, bind it to
    /// port ID `pid` (kernel assigned if `None`) and join `groups`.
    pub fn connect(proto: NlFamily, pid: Option<u32>, groups: Groups) -> Result<Self, io::Error> {
        let fd = cvt(unsafe {
            libc::socket(
                AddrFamily::Netlink.into(),
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                proto.into(),
            )
        })?;
        // Owned from here on so that a failed bind closes it.
        let socket = NlSocket { fd };

        let mut addr = unsafe { zeroed::<libc::sockaddr_nl>() };
        addr.nl_family = c_int::from(AddrFamily::Netlink) as libc::sa_family_t;
        addr.nl_pid = pid.unwrap_or(0);
        cvt(unsafe {
            libc::bind(
                socket.fd,
                &addr as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_nl>() as socklen_t,
            )
        })?;

        for group in groups.as_groups() {
            socket.set_opt(libc::SOL_NETLINK, libc::NETLINK_ADD_MEMBERSHIP, &group)?;
        }
        Ok(socket)
    }

    fn set_opt<T>(&self, level: c_int, name: c_int, val: &T) -> Result<(), io::Error> {
        cvt(unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                val as *const T as *const c_void,
                size_of::<T>() as socklen_t,
            )
        })
        .map(|_| ())
    }

    /// Make receives return [`WouldBlock`][io::ErrorKind::WouldBlock]
    /// instead of waiting. Used by sockets polled from a listener
    /// thread.
    pub fn set_nonblocking(&self) -> Result<(), io::Error> {
        let flags = cvt(unsafe { libc::fcntl(self.fd, libc::F_GETFL) })?;
        cvt(unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(|_| ())
    }

    /// Bound the time a blocking receive waits. `None` waits forever.
    /// An expired receive fails with
    /// [`WouldBlock`][io::ErrorKind::WouldBlock].
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<(), io::Error> {
        let tv = timeout.map_or(
            libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            |t| libc::timeval {
                tv_sec: t.as_secs() as libc::time_t,
                tv_usec: t.subsec_micros() as libc::suseconds_t,
            },
        );
        self.set_opt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
    }

    /// Port ID the socket is bound to.
    pub fn pid(&self) -> Result<u32, io::Error> {
        let mut addr = unsafe { zeroed::<libc::sockaddr_nl>() };
        let mut len = size_of::<libc::sockaddr_nl>() as socklen_t;
        cvt(unsafe {
            libc::getsockname(
                self.fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        Ok(addr.nl_pid)
    }
}

impl Transport for NlSocket {
    fn send(&self, buf: &[u8]) -> Result<(), io::Error> {
        let sent = cvt(unsafe { libc::send(self.fd, buf.as_ptr() as *const c_void, buf.len(), 0) })?;
        if sent as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("Sent {} of {} bytes", sent, buf.len()),
            ));
        }
        Ok(())
    }

    /// `MSG_TRUNC` makes the kernel report the full datagram length
    /// even when `buf` only holds part of it.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, io::Error> {
        cvt(unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                libc::MSG_TRUNC,
            )
        })
        .map(|len| len as usize)
    }
}

impl AsRawFd for NlSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for NlSocket {
    /// Closes underlying file descriptor to avoid file descriptor
    /// leaks.
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test::setup;

    #[test]
    #[ignore]
    fn real_test_pid() {
        setup();

        let s = NlSocket::connect(NlFamily::Generic, Some(5555), Groups::empty()).unwrap();
        assert_eq!(s.pid().unwrap(), 5555);
    }

    #[test]
    #[ignore]
    fn real_test_nonblocking() {
        setup();

        let s = NlSocket::connect(NlFamily::Generic, None, Groups::empty()).unwrap();
        s.set_nonblocking().unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(
            s.recv(&mut buf[..]).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    #[ignore]
    fn real_test_recv_timeout() {
        setup();

        let s = NlSocket::connect(NlFamily::Generic, None, Groups::empty()).unwrap();
        s.set_recv_timeout(Some(Duration::from_millis(10))).unwrap();
        let mut buf = [0u8; 64];
        assert!(s.recv(&mut buf[..]).is_err());
    }
}
