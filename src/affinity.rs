//! Placement of workers onto hardware units

use tracing::debug;

use crate::config::Affinity;
use crate::error::HarnessError;
use crate::topology::{CpuSet, Granularity, Topology};

/// Unit a worker lands on, round robin once workers outnumber units
pub fn unit_for(index: usize, units: usize) -> usize {
    index % units
}

/// Decides which unit each worker runs on and pins the launching thread
/// there while the worker is created
pub struct AffinityPlanner {
    plan: Option<(Granularity, Topology)>,
}

impl AffinityPlanner {
    /// Discover the machine topology for `affinity`. Nothing is discovered
    /// when affinity is disabled
    pub fn new(affinity: Affinity) -> Result<Self, HarnessError> {
        match affinity.granularity() {
            None => Ok(AffinityPlanner { plan: None }),
            Some(granularity) => {
                let topology = Topology::discover().map_err(|err| {
                    HarnessError::resource("topology discovery", err)
                })?;
                Self::from_topology(granularity, topology)
            }
        }
    }

    /// Plan over an already known topology
    pub fn from_topology(granularity: Granularity, topology: Topology)
            -> Result<Self, HarnessError> {
        let units = topology.unit_count(granularity);
        if units == 0 {
            return Err(HarnessError::NoUnits {
                kind: granularity.name(),
                hint: match granularity {
                    Granularity::Core => "adding",
                    Granularity::Thread => "removing",
                },
            });
        }

        debug!(units, ?granularity, "topology discovered");
        Ok(AffinityPlanner { plan: Some((granularity, topology)) })
    }

    /// A planner that never binds
    pub fn disabled() -> Self {
        AffinityPlanner { plan: None }
    }

    /// Number of units workers are spread over, 0 when disabled
    pub fn unit_count(&self) -> usize {
        match &self.plan {
            Some((granularity, topology)) => topology.unit_count(*granularity),
            None => 0,
        }
    }

    /// Unit for worker `index`, `None` when affinity is disabled
    pub fn unit_for(&self, index: usize) -> Option<usize> {
        match self.unit_count() {
            0 => None,
            units => Some(unit_for(index, units)),
        }
    }

    /// Processors of unit `unit`
    pub fn cpus(&self, unit: usize) -> Option<&CpuSet> {
        let (granularity, topology) = self.plan.as_ref()?;
        topology.unit_at(*granularity, unit)
    }

    /// Run `spawn` with the calling thread bound to worker `index`'s unit so
    /// whatever it creates inherits the binding, then restore the previous
    /// binding
    pub fn with_binding<T, F>(&self, index: usize, spawn: F)
            -> Result<T, HarnessError>
        where F: FnOnce(Option<usize>) -> Result<T, HarnessError>
    {
        let unit = match self.unit_for(index) {
            Some(unit) => unit,
            None => return spawn(None),
        };
        let cpus = self.cpus(unit).ok_or_else(|| HarnessError::NoUnits {
            kind: "units",
            hint: "toggling",
        })?;

        // Save where we are so we can go back after the worker exists
        let saved = CpuSet::current()
            .map_err(|err| HarnessError::resource("sched_getaffinity", err))?;

        cpus.bind_current()
            .map_err(|err| HarnessError::resource("sched_setaffinity", err))?;

        let ret = spawn(Some(unit));

        saved.bind_current()
            .map_err(|err| HarnessError::resource("sched_setaffinity", err))?;

        ret
    }
}
