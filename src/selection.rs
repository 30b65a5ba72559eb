//! # Selection
//!
//! Keeps the biggest consumers of a window, plus the observer itself so that
//! its own footprint is always reported.
use crate::attribution::TaskEnergyRecord;
use ordered_float::OrderedFloat;

/// Name the observer's own record is reported under.
pub const OBSERVER_LABEL: &str = "Power Observer";
pub const DEFAULT_TOP_CONSUMERS: usize = 10;

pub struct TaskSelector {
    observer_pid: i32,
    observer_name: Option<String>,
    top: usize,
}

impl TaskSelector {
    pub fn new(observer_pid: i32, top: usize) -> TaskSelector {
        TaskSelector {
            observer_pid,
            observer_name: None,
            top,
        }
    }

    /// Also recognizes the observer in records carrying no pid at all, by
    /// looking for `name` in the record name (sources keyed by executable).
    pub fn with_observer_name(mut self, name: &str) -> TaskSelector {
        self.observer_name = Some(String::from(name));
        self
    }

    pub fn observer_pid(&self) -> i32 {
        self.observer_pid
    }

    /// Returns at most `top` records sorted by decreasing energy, followed by
    /// the observer's own record (relabelled) when the window has one.
    ///
    /// `members` are the records of the processes grouped under `records`,
    /// when those are coalitions. The observer is then taken from the members
    /// and its coalition keeps its rank.
    pub fn select(
        &self,
        records: Vec<TaskEnergyRecord>,
        members: &[TaskEnergyRecord],
    ) -> Vec<TaskEnergyRecord> {
        let mut consumers = records;
        // sort_by is stable: equal consumers keep the order of the sample.
        consumers.sort_by(|x, y| OrderedFloat(y.energy).cmp(&OrderedFloat(x.energy)));

        let observer = match consumers.iter().position(|r| self.is_observer(r)) {
            Some(index) => Some(consumers.remove(index)),
            None => members
                .iter()
                .find(|m| m.pid == Some(self.observer_pid))
                .cloned(),
        };

        consumers.truncate(self.top);
        if let Some(mut observer) = observer {
            trace!(
                "observer was {} ({:.3} J)",
                observer.name,
                observer.energy
            );
            observer.name = String::from(OBSERVER_LABEL);
            consumers.push(observer);
        }
        consumers
    }

    fn is_observer(&self, record: &TaskEnergyRecord) -> bool {
        if record.pid == Some(self.observer_pid) {
            return true;
        }
        match &self.observer_name {
            Some(name) if record.pid.is_none() && record.member_pids.is_empty() => {
                record.name.contains(name.as_str())
            }
            _ => false,
        }
    }
}
