//! Energy consumption observer, attributing the power drawn by the host to its applications.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use power_observer::attribution::{AttributionConfig, TaskGrouping, WeightKind};
use power_observer::daemon::{Daemon, DaemonConfig, DEFAULT_INTERVAL_SECS};
use power_observer::exporters::{self, utils, DisplayNameEnricher};
use power_observer::selection::DEFAULT_TOP_CONSUMERS;
use power_observer::sensors::battery::{BatteryInfoProvider, NoBattery};
use power_observer::sensors::{
    debug::DebugSensor, powermetrics::PowermetricsSensor, srumutil::SrumutilSensor, Sensor,
};
use std::process;
use std::time::Duration;

// the struct below defines the main power-observer command-line interface
/// Samples the energy consumed by the host and reports its top consumers.
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// The exporter module to use to output the reports
    #[command(subcommand)]
    exporter: ExporterChoice,

    /// Increase the verbosity level
    #[arg(short, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Don't print the header to the standard output
    #[arg(long, default_value_t = false)]
    no_header: bool,

    /// The sensor module to use to gather the samples
    #[arg(short, long, value_enum, default_value_t = SensorChoice::default())]
    sensor: SensorChoice,

    /// Recorded sampler output, replayed by the debug sensor
    #[arg(long, value_name = "FILE")]
    debug_file: Option<String>,

    /// Length of a reporting window, in seconds
    #[arg(short, long, value_name = "SECONDS", default_value_t = DEFAULT_INTERVAL_SECS)]
    interval: u64,

    /// Where to read the battery counters from ("none" on desktops)
    #[arg(long, value_enum, default_value_t = BatteryChoice::Ioreg)]
    battery: BatteryChoice,

    /// Per-task figure the window energy is shared by (srumutil always uses energy-mwh)
    #[arg(long, value_enum, default_value_t = WeightChoice::EnergyImpact)]
    weight: WeightChoice,

    /// Report coalitions (applications) or individual processes
    #[arg(long, value_enum, default_value_t = GroupingChoice::Coalitions)]
    grouping: GroupingChoice,

    /// Maximum number of consumers in a report, besides the observer itself
    #[arg(long, default_value_t = DEFAULT_TOP_CONSUMERS)]
    max_top_consumers: usize,
}

/// Defines the possible subcommands, one per exporter.
///
/// ### Description style
/// Per the clap documentation, the description of commands and arguments should be written in the style applied here,
/// *not* in the third-person. That is, use "Do xyz" instead of "Does xyz".
#[derive(Subcommand)]
enum ExporterChoice {
    /// Write the reports in the JSON format to a file or to stdout
    #[cfg(feature = "json")]
    Json(exporters::json::ExporterArgs),

    /// Write the reports to the terminal
    Stdout(exporters::stdout::ExporterArgs),
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SensorChoice {
    Powermetrics,
    Srumutil,
    Debug,
}

impl Default for SensorChoice {
    fn default() -> Self {
        if cfg!(target_os = "windows") {
            SensorChoice::Srumutil
        } else {
            SensorChoice::Powermetrics
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BatteryChoice {
    Ioreg,
    None,
}

#[derive(Clone, Copy, ValueEnum)]
enum WeightChoice {
    EnergyImpact,
    Cputime,
    EnergyMwh,
}

#[derive(Clone, Copy, ValueEnum)]
enum GroupingChoice {
    Coalitions,
    Tasks,
}

fn main() {
    let cli = Cli::parse();
    loggerv::init_with_verbosity(cli.verbose.into()).expect("unable to initialize the logger");

    let sensor = build_sensor(&cli);
    let battery = build_battery(&cli);
    let config = build_config(&cli);
    let mut exporter = build_exporter(cli.exporter);
    if !cli.no_header {
        print_observer_header(exporter.kind());
    }

    let mut daemon =
        Daemon::new(sensor, battery, config).with_enricher(Box::new(DisplayNameEnricher));
    if let Err(e) = daemon.run(exporter.as_mut()) {
        fail(&e.to_string());
    }
}

fn build_exporter(choice: ExporterChoice) -> Box<dyn exporters::Exporter> {
    match choice {
        #[cfg(feature = "json")]
        ExporterChoice::Json(args) => match exporters::json::JsonExporter::new(args) {
            Ok(exporter) => Box::new(exporter),
            Err(e) => fail(&format!("couldn't open the report file: {e}")),
        },
        ExporterChoice::Stdout(args) => {
            Box::new(exporters::stdout::StdoutExporter::new(args)) // keep this in braces
        }
    }
    // Note that invalid choices are automatically turned into errors by `parse()` before the Cli is populated,
    // that's why they don't appear in this function.
}

/// Returns the sensor to use, given the command-line arguments.
fn build_sensor(cli: &Cli) -> Box<dyn Sensor> {
    match cli.sensor {
        SensorChoice::Powermetrics => Box::new(PowermetricsSensor::new()),
        SensorChoice::Srumutil => Box::new(SrumutilSensor::new()),
        SensorChoice::Debug => match &cli.debug_file {
            Some(path) => Box::new(DebugSensor::from_file(path)),
            None => fail("the debug sensor needs a recording, see --debug-file"),
        },
    }
}

fn build_battery(cli: &Cli) -> Box<dyn BatteryInfoProvider> {
    match cli.battery {
        BatteryChoice::Ioreg => power_observer::get_default_battery(),
        BatteryChoice::None => Box::new(NoBattery),
    }
}

fn build_config(cli: &Cli) -> DaemonConfig {
    let mut attribution = AttributionConfig {
        weight: match cli.weight {
            WeightChoice::EnergyImpact => WeightKind::EnergyImpact,
            WeightChoice::Cputime => WeightKind::CputimeNs,
            WeightChoice::EnergyMwh => WeightKind::EnergyMwh,
        },
        grouping: match cli.grouping {
            GroupingChoice::Coalitions => TaskGrouping::Coalitions,
            GroupingChoice::Tasks => TaskGrouping::Tasks,
        },
    };
    // srum reports applications, each with its own energy.
    if cli.sensor == SensorChoice::Srumutil {
        attribution.weight = WeightKind::EnergyMwh;
        attribution.grouping = TaskGrouping::Tasks;
    }
    DaemonConfig {
        interval: Duration::from_secs(cli.interval.max(1)),
        attribution,
        max_top_consumers: cli.max_top_consumers,
        ..Default::default()
    }
}

fn print_observer_header(exporter_name: &str) {
    let title = format!("Power Observer v{} {exporter_name} exporter", utils::get_version());
    println!("{}", title.red().bold());
    println!("Sending ⚡ reports");
}

fn fail(message: &str) -> ! {
    eprintln!("{}", message.red());
    process::exit(1)
}
