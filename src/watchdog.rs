//! Make sure worker processes exit when the harness does
//!
//! Every second a worker checks whether the process that forked it is still
//! around, and exits if it is not.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

/// Seconds between two checks
pub const WATCHDOG_INTERVAL: libc::c_uint = 1;

/// Process the current worker reports to
static PARENT_PID: AtomicI32 = AtomicI32::new(0);

/// Whether `pid` still names a process we can signal
pub fn parent_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

extern "C" fn check_parent(_signal: libc::c_int) {
    if !parent_alive(PARENT_PID.load(Ordering::Relaxed)) {
        unsafe { libc::_exit(0); }
    }

    unsafe { libc::alarm(WATCHDOG_INTERVAL); }
}

/// Arm the watchdog in a freshly forked worker
pub fn install(parent: libc::pid_t) -> io::Result<()> {
    PARENT_PID.store(parent, Ordering::Relaxed);

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = check_parent as extern "C" fn(libc::c_int)
            as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);

        if libc::sigaction(libc::SIGALRM, &sa, core::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }

        libc::alarm(WATCHDOG_INTERVAL);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(parent_alive(unsafe { libc::getpid() }));
    }

    #[test]
    fn reaped_child_is_gone() {
        let child = unsafe { libc::fork() };
        assert!(child != -1);
        if child == 0 {
            unsafe { libc::_exit(0); }
        }

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
        assert!(!parent_alive(child));
    }

    /// Whether `pid` is gone or only left as a zombie
    fn dead(pid: libc::pid_t) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
        }
    }

    #[test]
    fn worker_exits_once_parent_is_gone() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        // Intermediate process plays the harness, its child the worker
        let harness = unsafe { libc::fork() };
        assert!(harness != -1);
        if harness == 0 {
            let parent = unsafe { libc::getpid() };
            let worker = unsafe { libc::fork() };
            if worker == 0 {
                if install(parent).is_err() {
                    unsafe { libc::_exit(2); }
                }
                loop {
                    unsafe { libc::pause(); }
                }
            }

            // Hand the worker's pid up, then vanish
            unsafe {
                libc::write(fds[1], &worker as *const libc::pid_t as *const _,
                    std::mem::size_of::<libc::pid_t>());
                libc::_exit(0);
            }
        }

        let mut worker: libc::pid_t = 0;
        let ret = unsafe {
            libc::read(fds[0], &mut worker as *mut libc::pid_t as *mut _,
                std::mem::size_of::<libc::pid_t>())
        };
        assert_eq!(ret as usize, std::mem::size_of::<libc::pid_t>());
        assert!(worker > 0);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(harness, &mut status, 0) }, harness);

        let deadline = std::time::Instant::now()
            + std::time::Duration::from_secs(5);
        while !dead(worker) {
            assert!(std::time::Instant::now() < deadline,
                    "worker {} outlived its parent", worker);
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }
}
