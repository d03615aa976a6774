//! Logical processor discovery and CPU binding

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;

/// Where the kernel lists per-CPU topology ids
const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// What a topology unit is made of
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    /// A physical core, with all of its SMT siblings
    Core,

    /// A single SMT thread (logical processor)
    Thread,
}

impl Granularity {
    /// Plural name used in operator facing messages
    pub fn name(self) -> &'static str {
        match self {
            Granularity::Core => "Cores",
            Granularity::Thread => "PUs",
        }
    }
}

/// Set of logical processors, as understood by `sched_setaffinity`
#[derive(Clone, Copy)]
pub struct CpuSet {
    raw: libc::cpu_set_t,
}

impl CpuSet {
    /// Largest CPU number plus one a set can hold
    pub const CAPACITY: usize = libc::CPU_SETSIZE as usize;

    /// An empty set
    pub fn new() -> Self {
        let mut raw: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe { libc::CPU_ZERO(&mut raw); }
        CpuSet { raw }
    }

    /// A set holding exactly `cpus`
    pub fn from_cpus(cpus: impl IntoIterator<Item = usize>) -> Self {
        let mut set = CpuSet::new();
        for cpu in cpus {
            set.insert(cpu);
        }
        set
    }

    /// Add `cpu`, returns false if it is past what the set can hold
    pub fn insert(&mut self, cpu: usize) -> bool {
        if cpu >= Self::CAPACITY {
            return false;
        }
        unsafe { libc::CPU_SET(cpu, &mut self.raw); }
        true
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < Self::CAPACITY && unsafe { libc::CPU_ISSET(cpu, &self.raw) }
    }

    pub fn count(&self) -> usize {
        unsafe { libc::CPU_COUNT(&self.raw) as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// CPU numbers in ascending order
    pub fn cpus(&self) -> impl Iterator<Item = usize> + '_ {
        (0..Self::CAPACITY).filter(move |&cpu| self.contains(cpu))
    }

    /// Affinity of the calling thread
    pub fn current() -> io::Result<Self> {
        let mut set = CpuSet::new();
        let ret = unsafe {
            libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(),
                &mut set.raw)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(set)
    }

    /// Pin the calling thread to this set. Threads and processes created
    /// afterwards by this thread inherit the binding
    pub fn bind_current(&self) -> io::Result<()> {
        let ret = unsafe {
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(),
                &self.raw)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        CpuSet::new()
    }
}

impl PartialEq for CpuSet {
    fn eq(&self, other: &Self) -> bool {
        self.cpus().eq(other.cpus())
    }
}

impl Eq for CpuSet {}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.cpus()).finish()
    }
}

/// One logical processor and where it sits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogicalProcessor {
    /// OS CPU number
    pub id: usize,

    /// Socket the processor is in
    pub package: usize,

    /// Core within the package
    pub core: usize,
}

/// Parse `/proc/cpuinfo` formatted text into logical processors.
///
/// Architectures that do not report `physical id` / `core id` get one core
/// per processor in package 0.
pub fn parse_cpuinfo(cpuinfo: &str) -> Vec<LogicalProcessor> {
    let mut ret = Vec::new();
    let mut current: Option<(usize, Option<usize>, Option<usize>)> = None;

    let mut flush = |entry: Option<(usize, Option<usize>, Option<usize>)>| {
        if let Some((id, package, core)) = entry {
            ret.push(LogicalProcessor {
                id,
                package: package.unwrap_or(0),
                core: core.unwrap_or(id),
            });
        }
    };

    for line in cpuinfo.lines() {
        let (key, value) = match line.split_once(':') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => continue,
        };
        let value: Option<usize> = value.parse().ok();

        match key {
            "processor" => {
                flush(current.take());
                current = value.map(|id| (id, None, None));
            }
            "physical id" => {
                if let Some(entry) = current.as_mut() {
                    entry.1 = value;
                }
            }
            "core id" => {
                if let Some(entry) = current.as_mut() {
                    entry.2 = value;
                }
            }
            _ => {}
        }
    }
    flush(current.take());

    ret
}

/// Fill in package and core ids from `cpuN/topology/` under `root`.
///
/// Architectures whose `/proc/cpuinfo` carries no core ids still report them
/// there. Processors without readable ids keep what they had.
pub fn apply_sysfs_topology(root: &Path, processors: &mut [LogicalProcessor]) {
    let read_id = |cpu: usize, name: &str| -> Option<usize> {
        let path = root.join(format!("cpu{}", cpu)).join("topology").join(name);
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    };

    for proc in processors {
        if let Some(package) = read_id(proc.id, "physical_package_id") {
            proc.package = package;
        }
        if let Some(core) = read_id(proc.id, "core_id") {
            proc.core = core;
        }
    }
}

/// Cores and SMT threads available to this process
#[derive(Clone, Debug, Default)]
pub struct Topology {
    cores: Vec<CpuSet>,
    threads: Vec<CpuSet>,
}

impl Topology {
    /// Discover the processors listed in `/proc/cpuinfo` that the calling
    /// thread is allowed to run on, placed by sysfs where it knows better
    pub fn discover() -> io::Result<Self> {
        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo")?;
        let allowed = CpuSet::current()?;

        let mut processors: Vec<LogicalProcessor> = parse_cpuinfo(&cpuinfo)
            .into_iter()
            .filter(|proc| allowed.contains(proc.id))
            .collect();
        apply_sysfs_topology(Path::new(SYSFS_CPU_ROOT), &mut processors);

        Ok(Topology::from_processors(processors))
    }

    /// Build units from a processor list. Units are ordered by package, then
    /// core, then processor number
    pub fn from_processors(mut processors: Vec<LogicalProcessor>) -> Self {
        processors.sort_by_key(|proc| (proc.package, proc.core, proc.id));
        processors.dedup_by_key(|proc| proc.id);

        let mut cores: BTreeMap<(usize, usize), CpuSet> = BTreeMap::new();
        let mut threads = Vec::with_capacity(processors.len());
        for proc in &processors {
            if proc.id >= CpuSet::CAPACITY {
                continue;
            }

            cores.entry((proc.package, proc.core))
                .or_insert_with(CpuSet::new)
                .insert(proc.id);
            threads.push(CpuSet::from_cpus(Some(proc.id)));
        }

        Topology { cores: cores.into_values().collect(), threads }
    }

    fn units(&self, granularity: Granularity) -> &[CpuSet] {
        match granularity {
            Granularity::Core => &self.cores,
            Granularity::Thread => &self.threads,
        }
    }

    /// Number of units of the given kind
    pub fn unit_count(&self, granularity: Granularity) -> usize {
        self.units(granularity).len()
    }

    /// Processors making up unit `index`
    pub fn unit_at(&self, granularity: Granularity, index: usize)
            -> Option<&CpuSet> {
        self.units(granularity).get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two cores with two hyperthreads each, siblings numbered apart like
    /// most x86 machines
    const X86_CPUINFO: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
physical id\t: 0
siblings\t: 4
core id\t\t: 0
cpu cores\t: 2

processor\t: 1
vendor_id\t: GenuineIntel
physical id\t: 0
siblings\t: 4
core id\t\t: 1
cpu cores\t: 2

processor\t: 2
vendor_id\t: GenuineIntel
physical id\t: 0
siblings\t: 4
core id\t\t: 0
cpu cores\t: 2

processor\t: 3
vendor_id\t: GenuineIntel
physical id\t: 0
siblings\t: 4
core id\t\t: 1
cpu cores\t: 2
";

    const ARM_CPUINFO: &str = "\
processor\t: 0
BogoMIPS\t: 48.00
CPU implementer\t: 0x41

processor\t: 1
BogoMIPS\t: 48.00
CPU implementer\t: 0x41

Hardware\t: example board
";

    #[test]
    fn parse_x86() {
        let procs = parse_cpuinfo(X86_CPUINFO);
        assert_eq!(procs.len(), 4);
        assert_eq!(procs[2], LogicalProcessor { id: 2, package: 0, core: 0 });
        assert_eq!(procs[3], LogicalProcessor { id: 3, package: 0, core: 1 });
    }

    #[test]
    fn parse_without_core_ids() {
        let procs = parse_cpuinfo(ARM_CPUINFO);
        assert_eq!(procs, vec![
            LogicalProcessor { id: 0, package: 0, core: 0 },
            LogicalProcessor { id: 1, package: 0, core: 1 },
        ]);
    }

    #[test]
    fn sysfs_ids_group_siblings() {
        let root = std::env::temp_dir().join(format!("willitscale.sysfs.{}",
            unsafe { libc::getpid() }));
        // Two SMT siblings on core 5, cpu1 has no topology directory
        for (cpu, core) in [(0, "5\n"), (2, "5\n")] {
            let dir = root.join(format!("cpu{}", cpu)).join("topology");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("core_id"), core).unwrap();
            std::fs::write(dir.join("physical_package_id"), "1\n").unwrap();
        }

        let mut procs = parse_cpuinfo(&ARM_CPUINFO.replace(
            "Hardware", "processor\t: 2\n\nHardware"));
        apply_sysfs_topology(&root, &mut procs);
        std::fs::remove_dir_all(&root).unwrap();

        assert_eq!(procs, vec![
            LogicalProcessor { id: 0, package: 1, core: 5 },
            LogicalProcessor { id: 1, package: 0, core: 1 },
            LogicalProcessor { id: 2, package: 1, core: 5 },
        ]);

        let topo = Topology::from_processors(procs);
        assert_eq!(topo.unit_count(Granularity::Core), 2);
        assert_eq!(topo.unit_at(Granularity::Core, 1),
                   Some(&CpuSet::from_cpus(vec![0, 2])));
    }

    #[test]
    fn cores_group_siblings() {
        let topo = Topology::from_processors(parse_cpuinfo(X86_CPUINFO));

        assert_eq!(topo.unit_count(Granularity::Core), 2);
        assert_eq!(topo.unit_at(Granularity::Core, 0),
                   Some(&CpuSet::from_cpus(vec![0, 2])));
        assert_eq!(topo.unit_at(Granularity::Core, 1),
                   Some(&CpuSet::from_cpus(vec![1, 3])));
        assert_eq!(topo.unit_at(Granularity::Core, 2), None);
    }

    #[test]
    fn threads_follow_core_order() {
        let topo = Topology::from_processors(parse_cpuinfo(X86_CPUINFO));
        let order: Vec<usize> = (0..topo.unit_count(Granularity::Thread))
            .map(|i| {
                topo.unit_at(Granularity::Thread, i).unwrap()
                    .cpus().next().unwrap()
            })
            .collect();
        assert_eq!(order, vec![0, 2, 1, 3]);
    }

    #[test]
    fn empty_topology_has_no_units() {
        let topo = Topology::from_processors(Vec::new());
        assert_eq!(topo.unit_count(Granularity::Core), 0);
        assert_eq!(topo.unit_count(Granularity::Thread), 0);
    }

    #[test]
    fn cpuset_basics() {
        let mut set = CpuSet::new();
        assert!(set.is_empty());
        assert!(set.insert(3));
        assert!(set.insert(64));
        assert!(!set.insert(CpuSet::CAPACITY));
        assert_eq!(set.count(), 2);
        assert!(set.contains(64));
        assert!(!set.contains(4));
        assert_eq!(set.cpus().collect::<Vec<_>>(), vec![3, 64]);
        assert_eq!(format!("{:?}", set), "{3, 64}");
    }

    #[test]
    fn discovered_units_are_allowed() {
        let allowed = CpuSet::current().unwrap();
        let topo = Topology::discover().unwrap();

        for index in 0..topo.unit_count(Granularity::Thread) {
            let unit = topo.unit_at(Granularity::Thread, index).unwrap();
            assert_eq!(unit.count(), 1);
            assert!(unit.cpus().all(|cpu| allowed.contains(cpu)));
        }
    }
}
