//! Power-observer is a daemon attributing the energy consumed by a computer to
//! the applications running on it.
//!
//! It reads the documents periodically written by a platform sampler
//! (Apple's `powermetrics`, or `powercfg /srumutil` on Windows), computes how much energy every task consumed
//! during each window, optionally reconciled with the battery counters, and
//! hands the top consumers to an [`exporters::Exporter`].
//!
//! Typical use, as a library:
//!
//! ```no_run
//! use power_observer::daemon::{Daemon, DaemonConfig};
//! use power_observer::exporters::Report;
//! use power_observer::sensors::{battery::IoregBattery, powermetrics::PowermetricsSensor};
//!
//! let mut daemon = Daemon::new(
//!     Box::new(PowermetricsSensor::new()),
//!     Box::new(IoregBattery::new()),
//!     DaemonConfig::default(),
//! );
//! let mut sink = |report: &Report| println!("{:.2} J", report.total_energy);
//! if let Err(e) = daemon.run(&mut sink) {
//!     eprintln!("{e}");
//! }
//! ```
#[macro_use]
extern crate log;
pub mod attribution;
pub mod daemon;
pub mod errors;
pub mod exporters;
pub mod selection;
pub mod sensors;

use sensors::battery::{BatteryInfoProvider, IoregBattery, NoBattery};
use sensors::{powermetrics::PowermetricsSensor, srumutil::SrumutilSensor, Sensor};

/// Returns the sensor available on this platform.
pub fn get_default_sensor() -> Box<dyn Sensor> {
    if cfg!(target_os = "windows") {
        Box::new(SrumutilSensor::new())
    } else {
        Box::new(PowermetricsSensor::new())
    }
}

/// Returns the battery provider available on this platform.
pub fn get_default_battery() -> Box<dyn BatteryInfoProvider> {
    if cfg!(target_os = "macos") {
        Box::new(IoregBattery::new())
    } else {
        Box::new(NoBattery)
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
