//! One-shot start gate shared by threads and forked processes
//!
//! The gate is a pipe. Waiters poll the read end and the launcher opens the
//! gate by writing a single byte that nobody ever reads, so the read end
//! stays readable for every waiter.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::HarnessError;

pub struct StartBarrier {
    read: OwnedFd,
    write: OwnedFd,
}

impl StartBarrier {
    /// Create a closed gate
    pub fn open() -> Result<Self, HarnessError> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(HarnessError::last_os_error("pipe"));
        }

        let (read, write) = unsafe {
            (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))
        };
        Ok(StartBarrier { read, write })
    }

    /// Poll the read end, `timeout` in milliseconds (-1 blocks). Signals
    /// that interrupt the poll never count as the gate opening
    fn poll(&self, timeout: libc::c_int) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if ret >= 0 {
                return Ok(ret > 0);
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Block until the gate has been opened
    pub fn wait(&self) -> io::Result<()> {
        while !self.poll(-1)? {}
        Ok(())
    }

    /// Whether the gate is already open, without blocking
    pub fn is_released(&self) -> io::Result<bool> {
        self.poll(0)
    }

    /// Open the gate for every current and future waiter
    pub fn release(&self) -> Result<(), HarnessError> {
        let byte = 0u8;
        let ret = unsafe {
            libc::write(self.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void, 1)
        };
        if ret != 1 {
            return Err(HarnessError::last_os_error("write"));
        }
        Ok(())
    }
}
