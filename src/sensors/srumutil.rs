//! # SrumutilSensor
//!
//! Sensor backed by the Windows System Resource Usage Monitor, read through
//! `powercfg /srumutil`. The tool has no streaming mode: it is run once per
//! window and its per-application energy records, merged by application, are
//! turned into a document of the same shape as the other samplers'. Every
//! task carries an `energy_mwh` figure, to be attributed with
//! [`WeightKind::EnergyMwh`](crate::attribution::WeightKind).
use super::plist::{self, DocumentNode, Mapping};
use super::utils::find_in_path;
use super::{SampleStream, Sensor};
use crate::errors::{DaemonError, SamplerExit};
use regex::Regex;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, BufRead, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

pub const POWERCFG: &str = if cfg!(windows) {
    "powercfg.exe"
} else {
    "powercfg"
};
const REPORT_FILE: &str = "power-observer-srum.xml";
const ENERGY_MWH: &str = "energy_mwh";

/// Energy accounted to one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEnergy {
    pub app_id: String,
    /// mWh.
    pub energy: u64,
}

/// Extracts the `Record` elements of a srumutil XML report.
///
/// `AppId` and `TotalEnergyConsumption` are read from the record's attributes,
/// from a child element's text or from a child's `Value` attribute.
pub struct SrumParser {
    record_re: Regex,
    attribute_re: Regex,
    child_re: Regex,
}

impl Default for SrumParser {
    fn default() -> Self {
        SrumParser::new()
    }
}

impl SrumParser {
    pub fn new() -> SrumParser {
        SrumParser {
            record_re: Regex::new(r"(?s)<Record\b([^>]*?)(?:/>|>(.*?)</Record>)")
                .expect("record regex should compile"),
            attribute_re: Regex::new(r#"([\w:.-]+)\s*=\s*"([^"]*)""#)
                .expect("attribute regex should compile"),
            child_re: Regex::new(r"(?s)<([\w:.-]+)\b([^>]*?)(?:/>|>([^<]*)</[\w:.-]+>)")
                .expect("child regex should compile"),
        }
    }

    /// Records of `xml`, in document order. Records without an application
    /// or an energy figure are skipped.
    pub fn parse(&self, xml: &str) -> Result<Vec<AppEnergy>, io::Error> {
        let mut records = vec![];
        for record in self.record_re.captures_iter(xml) {
            let mut fields: HashMap<String, String> = HashMap::new();
            if let Some(attributes) = record.get(1) {
                fields.extend(self.attributes(attributes.as_str()));
            }
            if let Some(body) = record.get(2) {
                for child in self.child_re.captures_iter(body.as_str()) {
                    let name = child[1].to_string();
                    let value = match child.get(3) {
                        Some(text) if !text.as_str().trim().is_empty() => {
                            Some(text.as_str().trim().to_string())
                        }
                        _ => child.get(2).and_then(|a| {
                            self.attributes(a.as_str())
                                .find(|(key, _)| key == "Value")
                                .map(|(_, value)| value)
                        }),
                    };
                    if let Some(value) = value {
                        fields.insert(name, value);
                    }
                }
            }
            let (app_id, energy) = match (
                fields.remove("AppId"),
                fields.remove("TotalEnergyConsumption"),
            ) {
                (Some(app_id), Some(energy)) => (app_id, energy),
                _ => {
                    trace!("skipping a srum record without AppId or TotalEnergyConsumption");
                    continue;
                }
            };
            let energy = energy.trim().parse::<u64>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("TotalEnergyConsumption of {app_id}: {e}"),
                )
            })?;
            records.push(AppEnergy {
                app_id: unescape(&app_id),
                energy,
            });
        }
        Ok(records)
    }

    fn attributes<'a>(&'a self, raw: &'a str) -> impl Iterator<Item = (String, String)> + 'a {
        self.attribute_re
            .captures_iter(raw)
            .map(|c| (c[1].to_string(), c[2].to_string()))
    }
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Sums the energy of the records of each application, keeping the order in
/// which applications first appear.
pub fn merge_energy(records: Vec<AppEnergy>) -> Vec<AppEnergy> {
    let mut merged: Vec<AppEnergy> = vec![];
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in records {
        match index.get(&record.app_id) {
            Some(&i) => merged[i].energy += record.energy,
            None => {
                index.insert(record.app_id.clone(), merged.len());
                merged.push(record);
            }
        }
    }
    merged
}

/// Builds the sample document: one task per application, and the sum of
/// all of them as both the aggregate and the processor energy.
pub fn to_document(apps: &[AppEnergy]) -> DocumentNode {
    let total: u64 = apps.iter().map(|a| a.energy).sum();
    let tasks = apps
        .iter()
        .map(|app| {
            let mut task = Mapping::new();
            let _ = task.insert(String::from("name"), DocumentNode::String(app.app_id.clone()));
            let _ = task.insert(String::from(ENERGY_MWH), energy_node(app.energy));
            DocumentNode::Mapping(task)
        })
        .collect();
    let mut all_tasks = Mapping::new();
    let _ = all_tasks.insert(String::from(ENERGY_MWH), energy_node(total));
    let mut processor = Mapping::new();
    let _ = processor.insert(String::from(ENERGY_MWH), energy_node(total));

    let mut root = Mapping::new();
    let _ = root.insert(String::from("tasks"), DocumentNode::Sequence(tasks));
    let _ = root.insert(String::from("all_tasks"), DocumentNode::Mapping(all_tasks));
    let _ = root.insert(String::from("processor"), DocumentNode::Mapping(processor));
    DocumentNode::Mapping(root)
}

fn energy_node(energy: u64) -> DocumentNode {
    DocumentNode::Integer(i64::try_from(energy).unwrap_or(i64::MAX))
}

pub struct SrumutilSensor {
    program: String,
    report_path: PathBuf,
}

impl Default for SrumutilSensor {
    fn default() -> Self {
        SrumutilSensor::new()
    }
}

impl SrumutilSensor {
    pub fn new() -> SrumutilSensor {
        SrumutilSensor {
            program: String::from(POWERCFG),
            report_path: env::temp_dir().join(REPORT_FILE),
        }
    }

    /// Uses `program` instead of `powercfg`, with the same arguments.
    pub fn with_program(program: &str) -> SrumutilSensor {
        SrumutilSensor {
            program: String::from(program),
            ..SrumutilSensor::new()
        }
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> SrumutilSensor {
        self.report_path = path.into();
        self
    }

    pub fn report_args(report_path: &str) -> Vec<String> {
        vec![
            String::from("/srumutil"),
            String::from("/output"),
            String::from(report_path),
            String::from("/xml"),
        ]
    }
}

impl Sensor for SrumutilSensor {
    fn open(&mut self, interval: Duration) -> Result<SampleStream, DaemonError> {
        let program = find_in_path(&self.program).ok_or_else(|| {
            DaemonError::SamplerUnavailable(format!("{} not found in PATH", self.program))
        })?;
        info!(
            "reading {} every {:?}, reports in {}",
            program.display(),
            interval,
            self.report_path.display()
        );
        let reader = SrumReader {
            program,
            report_path: self.report_path.clone(),
            interval,
            parser: SrumParser::new(),
            pending: vec![],
            pos: 0,
        };
        Ok(SampleStream::from_reader(
            Box::new(reader),
            SamplerExit {
                code: Some(0),
                stderr: String::new(),
            },
        ))
    }

    fn kind(&self) -> &str {
        "srumutil"
    }
}

/// Serves one document per interval, read from a fresh srumutil report.
struct SrumReader {
    program: PathBuf,
    report_path: PathBuf,
    interval: Duration,
    parser: SrumParser,
    pending: Vec<u8>,
    pos: usize,
}

impl SrumReader {
    fn collect(&self) -> io::Result<String> {
        let report_path = self.report_path.to_string_lossy();
        let output = Command::new(&self.program)
            .args(SrumutilSensor::report_args(&report_path))
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        let xml = fs::read_to_string(&self.report_path)?;
        let apps = merge_energy(self.parser.parse(&xml)?);
        debug!("srum report lists {} applications", apps.len());
        Ok(plist::to_plist_string(&to_document(&apps)))
    }
}

impl Read for SrumReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for SrumReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.pending.len() {
            thread::sleep(self.interval);
            self.pending = self.collect()?.into_bytes();
            self.pos = 0;
        }
        Ok(&self.pending[self.pos..])
    }

    fn consume(&mut self, amount: usize) {
        self.pos = (self.pos + amount).min(self.pending.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::{AttributionConfig, AttributionEngine, TaskGrouping, WeightKind};
    use crate::sensors::Sample;
    use chrono::Utc;

    const REPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<SrumData>
  <Record AppId="\Device\HarddiskVolume3\Windows\explorer.exe" UserId="S-1-5-21" TimeStamp="2024-03-01 10:00:00" TotalEnergyConsumption="30" />
  <Record AppId="\Device\HarddiskVolume3\Program Files\App &amp; Co\app.exe" TimeStamp="2024-03-01 10:00:00">
    <TotalEnergyConsumption Value="10" />
  </Record>
  <Record>
    <AppId>\Device\HarddiskVolume3\Windows\explorer.exe</AppId>
    <TotalEnergyConsumption>20</TotalEnergyConsumption>
  </Record>
  <Record AppId="System" ScreenOnEnergyConsumption="4" />
</SrumData>
"#;

    #[test]
    fn parses_every_record_form() {
        let records = SrumParser::new().parse(REPORT).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].energy, 30);
        assert_eq!(
            records[1].app_id,
            "\\Device\\HarddiskVolume3\\Program Files\\App & Co\\app.exe"
        );
        assert_eq!(records[1].energy, 10);
        assert_eq!(records[2].energy, 20);
    }

    #[test]
    fn invalid_energy_is_an_error() {
        let xml = r#"<SrumData><Record AppId="a" TotalEnergyConsumption="lots" /></SrumData>"#;
        assert!(SrumParser::new().parse(xml).is_err());
    }

    #[test]
    fn merges_by_application() {
        let merged = merge_energy(SrumParser::new().parse(REPORT).unwrap());
        assert_eq!(merged.len(), 2);
        assert!(merged[0].app_id.ends_with("explorer.exe"));
        assert_eq!(merged[0].energy, 50);
        assert_eq!(merged[1].energy, 10);
    }

    #[test]
    fn document_attributes_milliwatt_hours() {
        let merged = merge_energy(SrumParser::new().parse(REPORT).unwrap());
        let text = plist::to_plist_string(&to_document(&merged));
        let root = plist::parse(&text).unwrap();
        let engine = AttributionEngine::new(AttributionConfig {
            weight: WeightKind::EnergyMwh,
            grouping: TaskGrouping::Tasks,
        });
        let now = Utc::now();
        let result = engine
            .attribute(&Sample::new(text.clone(), now, now), &root, None)
            .unwrap();
        // 60 mWh
        assert!((result.total - 216.0).abs() < 1e-9);
        assert!((result.records[0].energy - 180.0).abs() < 1e-9);
        assert!((result.records[1].energy - 36.0).abs() < 1e-9);
    }

    #[test]
    fn missing_tool_is_unavailable() {
        let mut sensor = SrumutilSensor::with_program("surely-not-powercfg-4242");
        assert!(matches!(
            sensor.open(Duration::from_secs(1)),
            Err(DaemonError::SamplerUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn serves_a_document_per_report() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.xml");
        fs::write(&report, REPORT).unwrap();
        // Stands in for powercfg: the report is already there.
        let program = dir.path().join("powercfg");
        fs::write(&program, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

        let mut sensor =
            SrumutilSensor::with_program(program.to_str().unwrap()).with_report_path(&report);
        let mut stream = sensor.open(Duration::from_millis(10)).unwrap();
        for _ in 0..2 {
            let document = stream.next_document().unwrap().unwrap();
            let root = plist::parse(&document).unwrap();
            let tasks = root.get("tasks").and_then(|t| t.as_sequence()).unwrap();
            assert_eq!(tasks.len(), 2);
            assert_eq!(
                root.get("all_tasks").and_then(|a| a.get(ENERGY_MWH)).and_then(|e| e.as_i64()),
                Some(60)
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut sensor = SrumutilSensor::with_program("false")
            .with_report_path(dir.path().join("report.xml"));
        let mut stream = sensor.open(Duration::from_millis(10)).unwrap();
        assert!(matches!(stream.next_document(), Some(Err(_))));
        assert!(stream.next_document().is_none());
    }
}
