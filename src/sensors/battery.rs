//! # battery
//!
//! Battery telemetry, used as ground truth to reconcile the energy reported
//! by the sampler with what the host actually drew.
use super::units::{microwatt_hours_to_joules, milliwatt_hours_to_joules};
use crate::errors::SnapshotUnavailable;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::VecDeque;
use std::process::Command;

/// A point-in-time reading of the battery counters.
#[derive(Debug, Clone, PartialEq)]
pub struct BatterySnapshot {
    pub taken_at: DateTime<Utc>,
    /// Remaining charge, in mAh.
    pub raw_current_capacity: u64,
    /// Battery voltage, in mV.
    pub voltage: u64,
    pub is_charging: bool,
    /// Energy drawn from the external power source since boot, in µWh.
    pub accumulated_wall_energy: u64,
    /// Energy delivered to the system since boot, in µWh.
    pub accumulated_system_energy: u64,
}

impl BatterySnapshot {
    /// Energy stored in the battery, in joules.
    pub fn stored_energy_joules(&self) -> f64 {
        // mAh * V = mWh
        let milliwatt_hours = self.raw_current_capacity as f64 * (self.voltage as f64 / 1000.0);
        milliwatt_hours_to_joules(milliwatt_hours)
    }

    pub fn wall_energy_joules(&self) -> f64 {
        microwatt_hours_to_joules(self.accumulated_wall_energy as f64)
    }

    pub fn system_energy_joules(&self) -> f64 {
        microwatt_hours_to_joules(self.accumulated_system_energy as f64)
    }
}

/// Something able to read the battery counters at a window boundary.
pub trait BatteryInfoProvider {
    fn snapshot(&mut self) -> Result<BatterySnapshot, SnapshotUnavailable>;

    fn kind(&self) -> &str;
}

/// Reads the AppleSmartBattery entry of the IO registry.
pub struct IoregBattery {
    capacity_re: Regex,
    voltage_re: Regex,
    charging_re: Regex,
    telemetry_re: Regex,
    wall_re: Regex,
    system_re: Regex,
}

impl Default for IoregBattery {
    fn default() -> Self {
        IoregBattery::new()
    }
}

impl IoregBattery {
    pub fn new() -> IoregBattery {
        // Top level keys only: nested dicts repeat some names (Voltage...).
        let top_level = |key: &str, value: &str| {
            Regex::new(&format!(r#"(?m)^\s*"{key}"\s*=\s*{value}"#))
                .expect("battery field regex should compile")
        };
        let counter = |key: &str| {
            Regex::new(&format!(r#""{key}"\s*=\s*(\d+)"#))
                .expect("telemetry counter regex should compile")
        };
        IoregBattery {
            capacity_re: top_level("AppleRawCurrentCapacity", r"(\d+)"),
            voltage_re: top_level("Voltage", r"(\d+)"),
            charging_re: top_level("IsCharging", r"(\w+)"),
            telemetry_re: top_level("PowerTelemetryData", r"\{([^}]*)\}"),
            wall_re: counter("AccumulatedWallEnergyEstimate"),
            system_re: counter("AccumulatedSystemEnergyConsumed"),
        }
    }

    /// Extracts a snapshot from the output of `ioreg -rc AppleSmartBattery`.
    pub fn parse(
        &self,
        output: &str,
        taken_at: DateTime<Utc>,
    ) -> Result<BatterySnapshot, SnapshotUnavailable> {
        if output.trim().is_empty() {
            return Err(SnapshotUnavailable::Unsupported);
        }
        let raw_current_capacity =
            Self::read_number(&self.capacity_re, output, "AppleRawCurrentCapacity")?;
        let voltage = Self::read_number(&self.voltage_re, output, "Voltage")?;
        let is_charging = self
            .charging_re
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().eq_ignore_ascii_case("yes"))
            .ok_or(SnapshotUnavailable::MissingField("IsCharging"))?;
        let telemetry = self
            .telemetry_re
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or(SnapshotUnavailable::MissingField("PowerTelemetryData"))?;
        let accumulated_wall_energy =
            Self::read_number(&self.wall_re, telemetry, "AccumulatedWallEnergyEstimate")?;
        let accumulated_system_energy =
            Self::read_number(&self.system_re, telemetry, "AccumulatedSystemEnergyConsumed")?;

        Ok(BatterySnapshot {
            taken_at,
            raw_current_capacity,
            voltage,
            is_charging,
            accumulated_wall_energy,
            accumulated_system_energy,
        })
    }

    fn read_number(
        re: &Regex,
        haystack: &str,
        name: &'static str,
    ) -> Result<u64, SnapshotUnavailable> {
        let raw = re
            .captures(haystack)
            .and_then(|c| c.get(1))
            .ok_or(SnapshotUnavailable::MissingField(name))?;
        raw.as_str()
            .parse::<u64>()
            .map_err(|_| SnapshotUnavailable::InvalidValue(name))
    }
}

impl BatteryInfoProvider for IoregBattery {
    fn snapshot(&mut self) -> Result<BatterySnapshot, SnapshotUnavailable> {
        let taken_at = Utc::now();
        let output = Command::new("ioreg")
            .args(["-rc", "AppleSmartBattery"])
            .output()?;
        if !output.status.success() {
            debug!("ioreg exited with {}", output.status);
            return Err(SnapshotUnavailable::Unsupported);
        }
        self.parse(&String::from_utf8_lossy(&output.stdout), taken_at)
    }

    fn kind(&self) -> &str {
        "ioreg"
    }
}

/// Provider for hosts without battery telemetry: every window falls back
/// to the energy reported by the sampler itself.
#[derive(Debug, Default)]
pub struct NoBattery;

impl BatteryInfoProvider for NoBattery {
    fn snapshot(&mut self) -> Result<BatterySnapshot, SnapshotUnavailable> {
        Err(SnapshotUnavailable::Unsupported)
    }

    fn kind(&self) -> &str {
        "none"
    }
}

/// Serves prerecorded snapshots in order, `None` entries standing for an
/// unavailable reading. Once exhausted, every reading is unavailable.
#[derive(Debug, Default)]
pub struct ScriptedBattery {
    snapshots: VecDeque<Option<BatterySnapshot>>,
}

impl ScriptedBattery {
    pub fn new(snapshots: Vec<Option<BatterySnapshot>>) -> ScriptedBattery {
        ScriptedBattery {
            snapshots: snapshots.into(),
        }
    }
}

impl BatteryInfoProvider for ScriptedBattery {
    fn snapshot(&mut self) -> Result<BatterySnapshot, SnapshotUnavailable> {
        self.snapshots
            .pop_front()
            .flatten()
            .ok_or(SnapshotUnavailable::Unsupported)
    }

    fn kind(&self) -> &str {
        "scripted"
    }
}
