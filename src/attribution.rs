//! # Attribution
//!
//! Splits the energy consumed during a window between the tasks listed in a
//! sample.
//!
//! Two ways of knowing how much energy the window consumed exist:
//!
//! * ratio mode uses the sample's own processor power figure,
//! * reconciled mode uses the battery counters read at both ends of the window.
//!
//! In both cases the total is then shared between tasks in proportion to
//! their weight (energy impact or CPU time) relative to the `all_tasks`
//! aggregate.
use crate::errors::{AttributionError, SnapshotUnavailable};
use crate::sensors::battery::BatterySnapshot;
use crate::sensors::plist::DocumentNode;
use crate::sensors::units::Unit;
use crate::sensors::Sample;
use std::collections::HashMap;
use std::fmt;

/// Key of the aggregate entry every sample must carry.
pub const ALL_TASKS: &str = "all_tasks";
const PROCESSOR: &str = "processor";
/// Processor power over the window, in mW.
const COMBINED_POWER: &str = "combined_power";
/// Processor energy over the window, in mWh, for sources reporting energy.
const ENERGY_MWH: &str = "energy_mwh";
const ELAPSED_NS: &str = "elapsed_ns";

/// Which per-task figure the total is shared by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightKind {
    #[default]
    EnergyImpact,
    CputimeNs,
    /// Energy accounted per application, in mWh.
    EnergyMwh,
}

impl WeightKind {
    pub fn key(&self) -> &'static str {
        match self {
            WeightKind::EnergyImpact => "energy_impact",
            WeightKind::CputimeNs => "cputime_ns",
            WeightKind::EnergyMwh => ENERGY_MWH,
        }
    }
}

/// Which list of the sample the records are made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskGrouping {
    /// One record per coalition (an application and its helpers).
    #[default]
    Coalitions,
    /// One record per process.
    Tasks,
}

impl TaskGrouping {
    pub fn key(&self) -> &'static str {
        match self {
            TaskGrouping::Coalitions => "coalitions",
            TaskGrouping::Tasks => "tasks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributionConfig {
    pub weight: WeightKind,
    pub grouping: TaskGrouping,
}

/// Energy attributed to one task (or coalition) over a window.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnergyRecord {
    pub name: String,
    /// Joules.
    pub energy: f64,
    pub pid: Option<i32>,
    /// Pids of the processes grouped under this record.
    pub member_pids: Vec<i32>,
    /// Free form details added by enrichers.
    pub metadata: HashMap<String, String>,
}

impl TaskEnergyRecord {
    pub fn new(name: &str, energy: f64, pid: Option<i32>) -> TaskEnergyRecord {
        TaskEnergyRecord {
            name: String::from(name),
            energy,
            pid,
            member_pids: vec![],
            metadata: HashMap::new(),
        }
    }

    /// True if `pid` is this record's process or one of its members.
    pub fn has_pid(&self, pid: i32) -> bool {
        self.pid == Some(pid) || self.member_pids.contains(&pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionMode {
    /// Total computed from the battery counters.
    Reconciled,
    /// Total computed from the sample itself.
    Ratio,
}

impl fmt::Display for AttributionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributionMode::Reconciled => write!(f, "reconciled"),
            AttributionMode::Ratio => write!(f, "ratio"),
        }
    }
}

/// Energy flows of a window, from the battery point of view. All in joules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyBalance {
    /// Drawn from the power adapter.
    pub drawn: f64,
    /// Delivered to the system.
    pub delivered: f64,
    /// Conversion loss, `drawn - delivered`.
    pub inefficiency: f64,
    /// Change of the energy stored in the battery, negative when discharging.
    pub battery_net_change: f64,
    /// Energy consumed by the system over the window.
    pub total: f64,
}

impl EnergyBalance {
    pub fn from_joules(drawn: f64, delivered: f64, battery_net_change: f64) -> EnergyBalance {
        let inefficiency = drawn - delivered;
        EnergyBalance {
            drawn,
            delivered,
            inefficiency,
            battery_net_change,
            total: delivered - battery_net_change + inefficiency,
        }
    }

    /// Balance between two snapshots. Fails if a cumulative counter went
    /// backwards, which happens when the battery controller resets.
    pub fn from_snapshots(
        start: &BatterySnapshot,
        stop: &BatterySnapshot,
    ) -> Result<EnergyBalance, SnapshotUnavailable> {
        if stop.accumulated_wall_energy < start.accumulated_wall_energy {
            return Err(SnapshotUnavailable::CounterReset(
                "AccumulatedWallEnergyEstimate",
            ));
        }
        if stop.accumulated_system_energy < start.accumulated_system_energy {
            return Err(SnapshotUnavailable::CounterReset(
                "AccumulatedSystemEnergyConsumed",
            ));
        }
        Ok(EnergyBalance::from_joules(
            stop.wall_energy_joules() - start.wall_energy_joules(),
            stop.system_energy_joules() - start.system_energy_joules(),
            stop.stored_energy_joules() - start.stored_energy_joules(),
        ))
    }
}

/// Result of the attribution of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAttribution {
    pub mode: AttributionMode,
    /// Joules.
    pub total: f64,
    pub balance: Option<EnergyBalance>,
    pub records: Vec<TaskEnergyRecord>,
    /// Own records of the processes grouped under coalition records, empty
    /// when grouping by task.
    pub members: Vec<TaskEnergyRecord>,
    /// The aggregate weight was zero: every record got zero energy.
    pub degenerate: bool,
}

struct TaskWeight {
    name: String,
    pid: Option<i32>,
    member_pids: Vec<i32>,
    weight: f64,
}

pub struct AttributionEngine {
    config: AttributionConfig,
}

impl AttributionEngine {
    pub fn new(config: AttributionConfig) -> AttributionEngine {
        AttributionEngine { config }
    }

    pub fn config(&self) -> &AttributionConfig {
        &self.config
    }

    /// Attributes the energy of `sample`, whose parsed document is `root`.
    /// With a `balance`, the window total comes from the battery (reconciled
    /// mode); otherwise from the sample (ratio mode).
    pub fn attribute(
        &self,
        sample: &Sample,
        root: &DocumentNode,
        balance: Option<&EnergyBalance>,
    ) -> Result<WindowAttribution, AttributionError> {
        if sample.stop < sample.start {
            return Err(AttributionError::InvalidWindow);
        }
        let aggregate = self.aggregate_weight(root)?;
        let (tasks, members) = self.task_weights(root)?;

        let (mode, total) = match balance {
            Some(balance) => {
                if let Ok(ratio) = ratio_total(root, sample.window_seconds()) {
                    debug!(
                        "window total: {:.3} J from battery, {:.3} J from sample",
                        balance.total, ratio
                    );
                }
                (AttributionMode::Reconciled, balance.total)
            }
            None => (
                AttributionMode::Ratio,
                ratio_total(root, sample.window_seconds())?,
            ),
        };

        let degenerate = aggregate.is_nan() || aggregate <= 0.0;
        if degenerate {
            debug!("all_tasks {} is {}, attributing nothing", self.config.weight.key(), aggregate);
        }
        let share = |task: TaskWeight| {
            let energy = if degenerate {
                0.0
            } else {
                task.weight / aggregate * total
            };
            TaskEnergyRecord {
                name: task.name,
                energy,
                pid: task.pid,
                member_pids: task.member_pids,
                metadata: HashMap::new(),
            }
        };

        Ok(WindowAttribution {
            mode,
            total,
            balance: balance.copied(),
            records: tasks.into_iter().map(share).collect(),
            members: members.into_iter().map(share).collect(),
            degenerate,
        })
    }

    fn aggregate_weight(&self, root: &DocumentNode) -> Result<f64, AttributionError> {
        let all_tasks = root
            .get(ALL_TASKS)
            .ok_or_else(|| AttributionError::MissingAggregate(String::from("no all_tasks entry")))?;
        if all_tasks.as_mapping().is_none() {
            return Err(AttributionError::InvalidField {
                key: String::from(ALL_TASKS),
                expected: "a dict",
            });
        }
        let key = self.config.weight.key();
        match all_tasks.get(key) {
            None => Err(AttributionError::MissingAggregate(format!(
                "all_tasks has no {key}"
            ))),
            Some(node) => node.as_f64().ok_or_else(|| AttributionError::InvalidField {
                key: format!("{ALL_TASKS}.{key}"),
                expected: "a number",
            }),
        }
    }

    /// Weights of the records, and of the coalition members when grouping
    /// by coalition.
    fn task_weights(
        &self,
        root: &DocumentNode,
    ) -> Result<(Vec<TaskWeight>, Vec<TaskWeight>), AttributionError> {
        match self.config.grouping {
            TaskGrouping::Coalitions => {
                let mut weights = vec![];
                let mut members = vec![];
                for coalition in list(root, TaskGrouping::Coalitions.key())? {
                    let mut weight = self.task_weight(coalition, "coalitions")?;
                    weight.pid = None;
                    if let Some(tasks) = coalition.get("tasks").and_then(|t| t.as_sequence()) {
                        for task in tasks {
                            let member = self.task_weight(task, "coalitions.tasks")?;
                            weight.member_pids.extend(member.pid);
                            members.push(member);
                        }
                    }
                    weights.push(weight);
                }
                Ok((weights, members))
            }
            TaskGrouping::Tasks => {
                let tasks: Vec<&DocumentNode> = if root.get("tasks").is_some() {
                    list(root, "tasks")?.collect()
                } else {
                    // Coalition only samples: flatten the coalitions' members.
                    list(root, TaskGrouping::Coalitions.key())?
                        .filter_map(|c| c.get("tasks").and_then(|t| t.as_sequence()))
                        .flatten()
                        .collect()
                };
                let weights = tasks
                    .into_iter()
                    .map(|task| self.task_weight(task, "tasks"))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((weights, vec![]))
            }
        }
    }

    fn task_weight(
        &self,
        entry: &DocumentNode,
        list_key: &str,
    ) -> Result<TaskWeight, AttributionError> {
        if entry.as_mapping().is_none() {
            return Err(AttributionError::InvalidField {
                key: String::from(list_key),
                expected: "an array of dict",
            });
        }
        let key = self.config.weight.key();
        let weight = match entry.get(key) {
            None => {
                trace!("{} entry without {}, counted as 0", list_key, key);
                0.0
            }
            Some(node) => node.as_f64().ok_or_else(|| AttributionError::InvalidField {
                key: format!("{list_key}.{key}"),
                expected: "a number",
            })?,
        };
        let pid = pid_of(entry);
        let name = match entry.get("name").and_then(|n| n.as_str()) {
            Some(name) => String::from(name),
            None => match pid {
                Some(pid) => format!("pid {pid}"),
                None => String::from("unknown"),
            },
        };
        Ok(TaskWeight {
            name,
            pid,
            member_pids: vec![],
            weight,
        })
    }
}

fn pid_of(entry: &DocumentNode) -> Option<i32> {
    entry
        .get("pid")
        .and_then(|p| p.as_i64())
        .and_then(|p| i32::try_from(p).ok())
}

/// Entries of the array stored under `key`, nothing if it is absent.
fn list<'a>(
    root: &'a DocumentNode,
    key: &str,
) -> Result<impl Iterator<Item = &'a DocumentNode>, AttributionError> {
    match root.get(key) {
        None => {
            debug!("sample has no {} list", key);
            Ok(<&[DocumentNode]>::default().iter())
        }
        Some(node) => node
            .as_sequence()
            .map(|items| items.iter())
            .ok_or_else(|| AttributionError::InvalidField {
                key: String::from(key),
                expected: "an array",
            }),
    }
}

/// Window total as reported by the sample, in joules.
///
/// Uses the processor's combined power (mW) over `elapsed_ns` (or over
/// `window_seconds` when the sample has no elapsed time), or the processor
/// energy in mWh for sources that report energy directly.
pub fn ratio_total(root: &DocumentNode, window_seconds: f64) -> Result<f64, AttributionError> {
    let processor = root.get(PROCESSOR).ok_or_else(|| {
        AttributionError::MissingAggregate(String::from("no processor entry"))
    })?;
    let number = |key: &str| -> Result<Option<f64>, AttributionError> {
        match processor.get(key) {
            None => Ok(None),
            Some(node) => node
                .as_f64()
                .map(Some)
                .ok_or_else(|| AttributionError::InvalidField {
                    key: format!("{PROCESSOR}.{key}"),
                    expected: "a number",
                }),
        }
    };
    if let Some(milliwatts) = number(COMBINED_POWER)? {
        let seconds = match root.get(ELAPSED_NS).and_then(|n| n.as_f64()) {
            Some(ns) => ns * 1e-9,
            None => window_seconds,
        };
        return Unit::energy_joules(milliwatts, &Unit::MilliWatt, seconds).map_err(|_| {
            AttributionError::InvalidField {
                key: format!("{PROCESSOR}.{COMBINED_POWER}"),
                expected: "a power",
            }
        });
    }
    if let Some(milliwatt_hours) = number(ENERGY_MWH)? {
        return Unit::to(milliwatt_hours, &Unit::MilliWattHour, &Unit::Joule).map_err(|_| {
            AttributionError::InvalidField {
                key: format!("{PROCESSOR}.{ENERGY_MWH}"),
                expected: "an energy",
            }
        });
    }
    Err(AttributionError::MissingAggregate(format!(
        "processor has neither {COMBINED_POWER} nor {ENERGY_MWH}"
    )))
}
