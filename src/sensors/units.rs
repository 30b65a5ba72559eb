use std::fmt;

// !!!!!!!!!!!!!!!!! Unit !!!!!!!!!!!!!!!!!!!!!!!
/// Units the telemetry sources report energy and power in.
/// Everything ends up in joules in the reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Joule,
    MilliJoule,
    MicroJoule,
    WattHour,
    MilliWattHour,
    MicroWattHour,
    Watt,
    MilliWatt,
    MicroWatt,
}

/// Number of joules in one watt-hour.
const JOULES_PER_WATT_HOUR: f64 = 3600.0;

/// Joules in `measure` milliwatt-hours.
pub fn milliwatt_hours_to_joules(measure: f64) -> f64 {
    measure * JOULES_PER_WATT_HOUR / 1000.0
}

/// Joules in `measure` microwatt-hours.
pub fn microwatt_hours_to_joules(measure: f64) -> f64 {
    measure * JOULES_PER_WATT_HOUR / 1_000_000.0
}

impl Unit {
    /// Converts `measure` from `source_unit` to `dest_unit`.
    /// Fails when asked to convert between energy and power.
    pub fn to(measure: f64, source_unit: &Unit, dest_unit: &Unit) -> Result<f64, String> {
        match (source_unit.joules_factor(), dest_unit.joules_factor()) {
            (Some(source), Some(dest)) => return Ok(measure * source / dest),
            (None, None) => {}
            _ => {
                return Err(format!(
                    "Impossible conversion asked from {source_unit} to {dest_unit} (without time dimension)."
                ))
            }
        }
        match (source_unit.watts_factor(), dest_unit.watts_factor()) {
            (Some(source), Some(dest)) => Ok(measure * source / dest),
            _ => Err(format!(
                "Impossible conversion asked from {source_unit} to {dest_unit}."
            )),
        }
    }

    /// Energy in joules drawn by a constant `power` over `seconds`.
    pub fn energy_joules(power: f64, power_unit: &Unit, seconds: f64) -> Result<f64, String> {
        let watts = Unit::to(power, power_unit, &Unit::Watt)?;
        Ok(watts * seconds)
    }

    fn joules_factor(&self) -> Option<f64> {
        match self {
            Unit::Joule => Some(1.0),
            Unit::MilliJoule => Some(1e-3),
            Unit::MicroJoule => Some(1e-6),
            Unit::WattHour => Some(JOULES_PER_WATT_HOUR),
            Unit::MilliWattHour => Some(JOULES_PER_WATT_HOUR / 1000.0),
            Unit::MicroWattHour => Some(JOULES_PER_WATT_HOUR / 1_000_000.0),
            _ => None,
        }
    }

    fn watts_factor(&self) -> Option<f64> {
        match self {
            Unit::Watt => Some(1.0),
            Unit::MilliWatt => Some(1e-3),
            Unit::MicroWatt => Some(1e-6),
            _ => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Joule => write!(f, "Joules"),
            Unit::MilliJoule => write!(f, "MilliJoules"),
            Unit::MicroJoule => write!(f, "MicroJoules"),
            Unit::WattHour => write!(f, "WattHours"),
            Unit::MilliWattHour => write!(f, "MilliWattHours"),
            Unit::MicroWattHour => write!(f, "MicroWattHours"),
            Unit::Watt => write!(f, "Watts"),
            Unit::MilliWatt => write!(f, "MilliWatts"),
            Unit::MicroWatt => write!(f, "MicroWatts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn milliwatthour_equals_3_6_joules() {
        let value = Unit::to(1.0, &Unit::MilliWattHour, &Unit::Joule).unwrap();
        assert!(close(value, 3.6));
    }

    #[test]
    fn microwatthour_equals_0_0036_joules() {
        let value = Unit::to(1000.0, &Unit::MicroWattHour, &Unit::Joule).unwrap();
        assert!(close(value, 3.6));
    }

    #[test]
    fn joule_equals_1000000microjoules() {
        let value = Unit::to(1.0, &Unit::Joule, &Unit::MicroJoule).unwrap();
        assert!(close(value, 1000000.0));
    }

    #[test]
    fn milliwatts_over_seconds() {
        // 1500 mW during 4 s
        let value = Unit::energy_joules(1500.0, &Unit::MilliWatt, 4.0).unwrap();
        assert!(close(value, 6.0));
    }

    #[test]
    fn helpers_agree_with_unit_table() {
        let table = Unit::to(250.0, &Unit::MilliWattHour, &Unit::Joule).unwrap();
        assert!(close(milliwatt_hours_to_joules(250.0), table));
        let table = Unit::to(250.0, &Unit::MicroWattHour, &Unit::Joule).unwrap();
        assert!(close(microwatt_hours_to_joules(250.0), table));
    }

    #[test]
    fn energy_to_power_is_refused() {
        assert!(Unit::to(1.0, &Unit::Joule, &Unit::Watt).is_err());
        assert!(Unit::energy_joules(1.0, &Unit::MilliWattHour, 1.0).is_err());
    }
}

//  Copyright 2024 The power-observer authors.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
