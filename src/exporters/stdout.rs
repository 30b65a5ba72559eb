use crate::exporters::*;
use colored::*;
use std::io::Write;

/// An Exporter that displays the reports on the standard output of the terminal.
pub struct StdoutExporter {
    out: Box<dyn Write>,
    show_pids: bool,
}

/// Holds the arguments for a StdoutExporter.
///
/// When using power-observer as a command-line application, such a struct will be
/// automatically populated by the clap library. If you're using power-observer as
/// a library, you should populate the arguments yourself.
#[derive(clap::Args, Debug, Default)]
pub struct ExporterArgs {
    /// Show the pids grouped under each task
    #[arg(long)]
    pub pids: bool,
}

impl Exporter for StdoutExporter {
    fn export(&mut self, report: &Report) -> Result<(), Box<dyn Error>> {
        let text = self.render(report);
        self.out.write_all(text.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    fn kind(&self) -> &str {
        "stdout"
    }
}

impl StdoutExporter {
    /// Instantiates and returns a new StdoutExporter
    pub fn new(args: ExporterArgs) -> StdoutExporter {
        StdoutExporter::with_writer(Box::new(std::io::stdout()), args)
    }

    pub fn with_writer(out: Box<dyn Write>, args: ExporterArgs) -> StdoutExporter {
        StdoutExporter {
            out,
            show_pids: args.pids,
        }
    }

    fn render(&self, report: &Report) -> String {
        let mut text = format!(
            "{} -> {}\t{} ({})\n",
            report.start.format("%Y-%m-%d %H:%M:%S"),
            report.stop.format("%H:%M:%S"),
            format!("{:.2} J", report.total_energy).bold(),
            report.mode
        );
        text.push_str("Energy\t\tTask\n");
        if report.tasks.is_empty() {
            text.push_str("No task found in this window.\n");
        }
        for task in &report.tasks {
            let name = task.metadata.get(DISPLAY_NAME).unwrap_or(&task.name);
            let energy = format!("{:.2} J", task.energy);
            text.push_str(&format!("{}\t\t{}", energy.green(), utils::filter_name(name)));
            if self.show_pids {
                let pids: Vec<String> = task
                    .pid
                    .iter()
                    .chain(task.member_pids.iter())
                    .map(|p| p.to_string())
                    .collect();
                if !pids.is_empty() {
                    text.push_str(&format!("\t[{}]", pids.join(", ")));
                }
            }
            text.push('\n');
        }
        text.push_str("------------------------------------------------------------\n");
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::{AttributionMode, TaskEnergyRecord};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn shows_every_task() {
        let buffer = SharedBuffer::default();
        let mut exporter = StdoutExporter::with_writer(
            Box::new(buffer.clone()),
            ExporterArgs { pids: true },
        );
        let mut coalition = TaskEnergyRecord::new("com.apple.Safari", 3.0, None);
        coalition.member_pids = vec![11, 12];
        let start = Utc::now();
        let report = Report {
            device_id: String::from("host"),
            start,
            stop: start,
            total_energy: 95.0,
            mode: AttributionMode::Ratio,
            tasks: vec![coalition, TaskEnergyRecord::new("Power Observer", 0.25, Some(7))],
            platform: String::from("test"),
        };
        exporter.export(&report).unwrap();
        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("95.00 J"));
        assert!(text.contains("com.apple.Safari\t[11, 12]"));
        assert!(text.contains("Power Observer\t[7]"));
        assert!(text.contains("(ratio)"));
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
