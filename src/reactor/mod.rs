//! Per-thread readiness reactor: an epoll-backed demultiplexer plus a
//! monotonic timer heap.
//!
//! Registration is edge-triggered, so every consumer must drain its
//! socket to `WouldBlock` on each wakeup. Events carry the token the
//! socket was registered with; the driver (worker or fetch loop) maps
//! tokens back to its own slab slots instead of the reactor holding
//! callbacks, since slots reconnect and stable handles don't alias.
//!
//! Dispatch contract per event: when the error flag is set, handle the
//! error only; otherwise handle writability first, then readability.

pub mod timer;

pub use timer::{TimerHandle, Timers};

use std::io;
use std::os::unix::io::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Readable + writable; used while connecting, handshaking, writing.
    ReadWrite,
    /// Readable only; used while reading the response.
    ReadOnly,
}

impl Interest {
    fn events(self) -> u32 {
        let base = (libc::EPOLLIN as u32) | (libc::EPOLLET as u32);
        match self {
            Interest::ReadWrite => base | (libc::EPOLLOUT as u32),
            Interest::ReadOnly => base,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

mod sys {
    use std::io;
    use std::os::unix::io::RawFd;

    pub fn epoll_create() -> io::Result<RawFd> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    pub fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32, token: usize) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: token as u64,
        };
        let ev_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event
        };
        if unsafe { libc::epoll_ctl(epfd, op, fd, ev_ptr) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn epoll_wait(
        epfd: RawFd,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

const MAX_EVENTS: usize = 256;

/// The demux half of the reactor. Owns only the epoll descriptor; the
/// sockets it watches belong to their connections.
pub struct Poller {
    epfd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epfd: sys::epoll_create()?,
            buf: vec![unsafe { std::mem::zeroed() }; MAX_EVENTS],
        })
    }

    pub fn add(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        sys::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, interest.events(), token)
    }

    pub fn modify(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        sys::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, interest.events(), token)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        sys::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Wait up to `timeout_ms` and collect readiness events into `out`.
    /// An interrupted wait yields zero events; any other failure is
    /// returned and aborts the caller's loop.
    pub fn poll(&mut self, out: &mut Vec<Event>, timeout_ms: i32) -> io::Result<usize> {
        out.clear();
        let n = match sys::epoll_wait(self.epfd, &mut self.buf, timeout_ms) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        };
        for raw in &self.buf[..n] {
            let flags = raw.events;
            out.push(Event {
                token: raw.u64 as usize,
                readable: flags & (libc::EPOLLIN as u32) != 0,
                writable: flags & (libc::EPOLLOUT as u32) != 0,
                error: flags & ((libc::EPOLLERR as u32) | (libc::EPOLLHUP as u32)) != 0,
            });
        }
        Ok(n)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn poll_reports_readable_after_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut poller = Poller::new().unwrap();
        poller.add(client.as_raw_fd(), 7, Interest::ReadOnly).unwrap();

        server.write_all(b"x").unwrap();
        let mut events = Vec::new();
        // Allow a couple of wakeups for the byte to arrive.
        for _ in 0..50 {
            poller.poll(&mut events, 100).unwrap();
            if !events.is_empty() {
                break;
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].readable);
        assert!(!events[0].error);
    }

    #[test]
    fn timeout_returns_no_events() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let mut poller = Poller::new().unwrap();
        poller.add(client.as_raw_fd(), 1, Interest::ReadOnly).unwrap();
        let mut events = Vec::new();
        let n = poller.poll(&mut events, 10).unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());
    }
}
