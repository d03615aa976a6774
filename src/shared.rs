//! Counter memory shared between the harness and every worker
//!
//! The area is backed by an unlinked temporary file mapped `MAP_SHARED`, so
//! the same physical pages are seen by threads of this process and by every
//! child forked after the mapping was created.

use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::HarnessError;

/// Bytes reserved per counter. Larger than any cache line we expect to see so
/// two workers never write to the same line
pub const MAX_CACHELINE_SIZE: usize = 256;

/// One cache-line-padded `u64` counter per worker
pub struct SharedArea {
    base: NonNull<u8>,
    len: usize,
    slots: usize,
}

// Every slot has exactly one writer and is only ever accessed atomically
unsafe impl Send for SharedArea {}
unsafe impl Sync for SharedArea {}

/// Round `size` up to a multiple of the page size
fn page_align(size: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    (size + page - 1) & !(page - 1)
}

impl SharedArea {
    /// Map a zeroed area holding `slots` counters
    pub fn allocate(slots: usize) -> Result<Self, HarnessError> {
        let len = page_align(slots.max(1) * MAX_CACHELINE_SIZE);

        // Create a new file to use for the shared memory backing
        let mut template = std::env::temp_dir()
            .join("shared_area_XXXXXX")
            .as_os_str()
            .as_bytes()
            .to_vec();
        template.push(0);
        let fd = unsafe {
            libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char)
        };
        if fd < 0 {
            return Err(HarnessError::last_os_error("mkstemp"));
        }
        let file = unsafe { File::from_raw_fd(fd) };

        // Nobody needs the name, only the mapping
        let ret = unsafe { libc::unlink(template.as_ptr() as *const _) };
        if ret != 0 {
            return Err(HarnessError::last_os_error("unlink"));
        }

        file.set_len(len as u64)
            .map_err(|err| HarnessError::resource("ftruncate", err))?;

        // Map in the shared memory
        let ret = unsafe {
            libc::mmap(core::ptr::null_mut(), len,
                libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED,
                file.as_raw_fd(), 0)
        };
        if ret == libc::MAP_FAILED {
            return Err(HarnessError::last_os_error("mmap"));
        }

        // Start every counter from zero, whatever the file held
        unsafe { core::ptr::write_bytes(ret as *mut u8, 0, len); }

        let base = NonNull::new(ret as *mut u8)
            .ok_or_else(|| HarnessError::last_os_error("mmap"))?;

        Ok(SharedArea { base, len, slots })
    }

    /// Number of counter slots
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Size of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Counter for `index`. Only worker `index` may write it
    pub fn slot(&self, index: usize) -> &AtomicU64 {
        assert!(index < self.slots, "slot {} out of {}", index, self.slots);
        unsafe {
            &*(self.base.as_ptr().add(index * MAX_CACHELINE_SIZE)
                as *const AtomicU64)
        }
    }

    /// Copy every counter into `into`
    pub fn snapshot(&self, into: &mut [u64]) {
        for (index, value) in into.iter_mut().enumerate() {
            *value = self.slot(index).load(Ordering::Relaxed);
        }
    }
}

impl Drop for SharedArea {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr() as *mut _, self.len); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_is_zeroed_and_page_aligned() {
        let area = SharedArea::allocate(5).unwrap();
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        assert_eq!(area.slots(), 5);
        assert!(area.len() >= 5 * MAX_CACHELINE_SIZE);
        assert_eq!(area.len() % page, 0);
        assert_eq!(area.base.as_ptr() as usize % page, 0);

        let mut values = vec![u64::MAX; 5];
        area.snapshot(&mut values);
        assert_eq!(values, vec![0; 5]);
    }

    #[test]
    fn slots_never_share_a_cache_line() {
        let area = SharedArea::allocate(4).unwrap();
        for index in 1..4 {
            let prev = area.slot(index - 1) as *const AtomicU64 as usize;
            let cur = area.slot(index) as *const AtomicU64 as usize;
            assert_eq!(cur - prev, MAX_CACHELINE_SIZE);
        }
    }

    #[test]
    fn writes_land_in_their_own_slot() {
        let area = SharedArea::allocate(3).unwrap();
        area.slot(1).store(7, Ordering::Relaxed);

        let mut values = [0; 3];
        area.snapshot(&mut values);
        assert_eq!(values, [0, 7, 0]);
    }

    #[test]
    #[should_panic]
    fn slot_past_the_end_panics() {
        let area = SharedArea::allocate(2).unwrap();
        area.slot(2);
    }

    #[test]
    fn child_writes_are_visible_after_fork() {
        let area = SharedArea::allocate(2).unwrap();

        let child = unsafe { libc::fork() };
        assert!(child != -1);
        if child == 0 {
            // Only async-signal-safe work in the child
            area.slot(1).store(42, Ordering::Relaxed);
            unsafe { libc::_exit(0); }
        }

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
        assert!(libc::WIFEXITED(status));
        assert_eq!(area.slot(1).load(Ordering::Relaxed), 42);
        assert_eq!(area.slot(0).load(Ordering::Relaxed), 0);
    }
}
