use crate::exporters::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
};

/// Timestamp layout of the reports.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// An Exporter that writes every report as one JSON object per line,
/// either in a file or to the standard output.
pub struct JsonExporter {
    out_writer: BufWriter<Box<dyn Write>>,
}

// Note: clap::Args automatically generate Args for the fields of this struct,
// using the field's name as the argument's name, and the doc comment
// above the field as the argument's description.

/// Holds the arguments for a JsonExporter.
///
/// When using power-observer as a command-line application, such a struct will be
/// automatically populated by the clap library. If you're using power-observer as
/// a library, you should populate the arguments yourself.
#[derive(clap::Args, Debug, Default)]
pub struct ExporterArgs {
    /// Destination file for the reports, appended to (if absent, print the reports to stdout)
    #[arg(short, long)]
    pub file: Option<String>,
}

// Below are the structures that will store the reports.

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TaskPayload {
    pub task_name: String,
    pub energy_consumption: f64,
    pub details: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ReportPayload {
    pub pc_id: String,
    pub total_energy_consumption: f64,
    pub tasks: Vec<TaskPayload>,
    pub start_time: String,
    pub stop_time: String,
    pub platform: String,
    pub attribution_mode: String,
}

impl From<&Report> for ReportPayload {
    fn from(report: &Report) -> Self {
        ReportPayload {
            pc_id: report.device_id.clone(),
            total_energy_consumption: report.total_energy,
            tasks: report
                .tasks
                .iter()
                .map(|task| {
                    let mut details: BTreeMap<String, String> = task
                        .metadata
                        .iter()
                        .filter(|(k, _)| k.as_str() != DISPLAY_NAME)
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    if let Some(pid) = task.pid {
                        details.insert(String::from("pid"), pid.to_string());
                    }
                    TaskPayload {
                        task_name: task
                            .metadata
                            .get(DISPLAY_NAME)
                            .unwrap_or(&task.name)
                            .clone(),
                        energy_consumption: task.energy,
                        details,
                    }
                })
                .collect(),
            start_time: report.start.format(TIME_FORMAT).to_string(),
            stop_time: report.stop.format(TIME_FORMAT).to_string(),
            platform: report.platform.clone(),
            attribution_mode: report.mode.to_string(),
        }
    }
}

impl Exporter for JsonExporter {
    fn export(&mut self, report: &Report) -> Result<(), Box<dyn Error>> {
        let payload = ReportPayload::from(report);
        serde_json::to_writer(&mut self.out_writer, &payload)?;
        self.out_writer.write_all(b"\n")?;
        self.out_writer.flush()?;
        Ok(())
    }

    fn kind(&self) -> &str {
        "json"
    }
}

impl JsonExporter {
    /// Instantiates and returns a new JsonExporter.
    pub fn new(args: ExporterArgs) -> Result<JsonExporter, std::io::Error> {
        // Prepare the output (either stdout or a file)
        let output: Box<dyn Write> = match args.file {
            Some(f) => {
                info!("writing reports to {}", f);
                Box::new(OpenOptions::new().create(true).append(true).open(f)?)
            }
            None => Box::new(std::io::stdout()),
        };
        Ok(JsonExporter::from_writer(output))
    }

    pub fn from_writer(output: Box<dyn Write>) -> JsonExporter {
        JsonExporter {
            out_writer: BufWriter::new(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::{AttributionMode, TaskEnergyRecord};
    use chrono::TimeZone;
    use std::io::{BufRead, BufReader};

    fn report() -> Report {
        let mut safari = TaskEnergyRecord::new("com.apple.Safari", 12.5, None);
        safari
            .metadata
            .insert(String::from(DISPLAY_NAME), String::from("Apple Safari"));
        safari
            .metadata
            .insert(String::from("icon"), String::from("safari.png"));
        Report {
            device_id: String::from("my-mac"),
            start: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            stop: Utc.with_ymd_and_hms(2024, 3, 1, 10, 1, 0).unwrap(),
            total_energy: 95.0,
            mode: AttributionMode::Reconciled,
            tasks: vec![
                safari,
                TaskEnergyRecord::new("Power Observer", 0.5, Some(42)),
            ],
            platform: String::from("macOS 14.2 (aarch64)"),
        }
    }

    #[test]
    fn payload_layout() {
        let payload = ReportPayload::from(&report());
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["pc_id"], "my-mac");
        assert_eq!(value["total_energy_consumption"], 95.0);
        assert_eq!(value["start_time"], "2024-03-01 10:00:00");
        assert_eq!(value["stop_time"], "2024-03-01 10:01:00");
        assert_eq!(value["attribution_mode"], "reconciled");
        assert_eq!(value["tasks"][0]["task_name"], "Apple Safari");
        assert_eq!(value["tasks"][0]["details"]["icon"], "safari.png");
        assert!(value["tasks"][0]["details"].get(DISPLAY_NAME).is_none());
        assert_eq!(value["tasks"][1]["task_name"], "Power Observer");
        assert_eq!(value["tasks"][1]["details"]["pid"], "42");
    }

    #[test]
    fn one_line_per_report_appended() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        for _ in 0..2 {
            let mut exporter = JsonExporter::new(ExporterArgs {
                file: Some(path.clone()),
            })
            .unwrap();
            exporter.export(&report()).unwrap();
        }
        let lines: Vec<String> = BufReader::new(std::fs::File::open(&path).unwrap())
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let payload: ReportPayload = serde_json::from_str(&line).unwrap();
            assert_eq!(payload.tasks.len(), 2);
        }
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
