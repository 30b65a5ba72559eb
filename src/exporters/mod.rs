//! # Exporters
//!
//! An exporter receives the report of every window the daemon managed to
//! attribute and writes it somewhere. It is called exactly once per report.
#[cfg(feature = "json")]
pub mod json;
pub mod stdout;
pub mod utils;

use crate::attribution::{AttributionMode, TaskEnergyRecord};
use chrono::{DateTime, Utc};
use std::error::Error;

/// Energy consumption of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub device_id: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    /// Joules consumed by the whole system during the window.
    pub total_energy: f64,
    pub mode: AttributionMode,
    /// Top consumers, the observer's own record last.
    pub tasks: Vec<TaskEnergyRecord>,
    pub platform: String,
}

/// A sink for reports.
///
/// Closures taking a `&Report` are exporters too, which is handy to
/// collect reports in tests or to forward them to another component.
pub trait Exporter {
    fn export(&mut self, report: &Report) -> Result<(), Box<dyn Error>>;

    fn kind(&self) -> &str;
}

impl<F> Exporter for F
where
    F: FnMut(&Report),
{
    fn export(&mut self, report: &Report) -> Result<(), Box<dyn Error>> {
        self(report);
        Ok(())
    }

    fn kind(&self) -> &str {
        "closure"
    }
}

/// Gives the identifier reports are tagged with.
pub trait DeviceIdentity {
    fn device_id(&self) -> Result<String, Box<dyn Error>>;
}

/// Identifies the device by its hostname.
#[derive(Debug, Default)]
pub struct HostnameIdentity;

impl DeviceIdentity for HostnameIdentity {
    fn device_id(&self) -> Result<String, Box<dyn Error>> {
        utils::get_hostname()
    }
}

/// Identity fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub String);

impl DeviceIdentity for StaticIdentity {
    fn device_id(&self) -> Result<String, Box<dyn Error>> {
        Ok(self.0.clone())
    }
}

/// Adds details to a selected record before it is exported.
pub trait TaskEnricher {
    fn enrich(&self, record: &mut TaskEnergyRecord) -> Result<(), Box<dyn Error>>;
}

/// Metadata key holding a human friendly name of the task.
pub const DISPLAY_NAME: &str = "display_name";

/// Turns bundle identifiers such as `com.apple.Safari` into display names
/// (`Apple Safari`), stored under [`DISPLAY_NAME`].
#[derive(Debug, Default)]
pub struct DisplayNameEnricher;

impl TaskEnricher for DisplayNameEnricher {
    fn enrich(&self, record: &mut TaskEnergyRecord) -> Result<(), Box<dyn Error>> {
        // Names with spaces are display names already.
        let display_name = if record.name.contains(' ') {
            record.name.clone()
        } else {
            utils::translate_app_name(&record.name)
        };
        record
            .metadata
            .insert(String::from(DISPLAY_NAME), display_name);
        Ok(())
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
