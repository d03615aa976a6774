//! Workloads shipped with the harness

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use clap::ValueEnum;

use crate::workload::{Counter, Workload};

/// Selectable built-in workloads
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Builtin {
    /// Bare counter increments, the harness's own ceiling
    Spin,

    /// One `getppid()` system call per iteration
    Getppid,

    /// One `sched_yield()` per iteration
    SchedYield,

    /// Create, stat, truncate, write, mmap and unlink a temporary file
    Vfsmix,
}

impl Builtin {
    pub fn workload(self) -> Arc<dyn Workload> {
        match self {
            Builtin::Spin => Arc::new(Spin),
            Builtin::Getppid => Arc::new(Getppid),
            Builtin::SchedYield => Arc::new(SchedYield),
            Builtin::Vfsmix => Arc::new(Vfsmix),
        }
    }
}

pub struct Spin;

impl Workload for Spin {
    fn description(&self) -> &str {
        "Counter increment only"
    }

    fn run(&self, counter: &Counter<'_>, _index: usize) -> ! {
        loop {
            counter.incr();
        }
    }
}

pub struct Getppid;

impl Workload for Getppid {
    fn description(&self) -> &str {
        "getppid"
    }

    fn run(&self, counter: &Counter<'_>, _index: usize) -> ! {
        loop {
            unsafe { libc::getppid(); }
            counter.incr();
        }
    }
}

pub struct SchedYield;

impl Workload for SchedYield {
    fn description(&self) -> &str {
        "sched_yield"
    }

    fn run(&self, counter: &Counter<'_>, _index: usize) -> ! {
        loop {
            unsafe { libc::sched_yield(); }
            counter.incr();
        }
    }
}

/// Mix of VFS operations on a private temporary file
pub struct Vfsmix;

impl Vfsmix {
    /// One pass over the file life cycle
    fn cycle(path: &Path, page_size: usize) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;

        fs::symlink_metadata(path)?;

        let end = page_size as u64 - 1;
        if file.seek(SeekFrom::Start(end))? != end {
            return Err(io::Error::new(io::ErrorKind::Other, "short seek"));
        }
        drop(file);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&[1])?;

        Self::touch_page(&file, page_size)?;
        drop(file);

        fs::remove_file(path)
    }

    /// Map the first page of `file` shared and write to it
    fn touch_page(file: &File, page_size: usize) -> io::Result<()> {
        let map = unsafe {
            libc::mmap(core::ptr::null_mut(), page_size,
                libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED,
                file.as_raw_fd(), 0)
        };
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            core::ptr::write_volatile(map as *mut u8, 1);
            if libc::munmap(map, page_size) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }
}

impl Workload for Vfsmix {
    fn description(&self) -> &str {
        "vfsmix"
    }

    fn run(&self, counter: &Counter<'_>, index: usize) -> ! {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        // Unique per worker whether workers are threads or processes
        let path = std::env::temp_dir().join(format!("willitscale.{}.{}",
            unsafe { libc::getpid() }, index));

        loop {
            if let Err(err) = Self::cycle(&path, page_size) {
                panic!("vfsmix on {}: {}", path.display(), err);
            }
            counter.incr();
        }
    }
}
