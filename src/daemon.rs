//! # Daemon
//!
//! Drives the sampler: every document it writes closes a window, which is
//! parsed, attributed, reduced to its top consumers and handed to an
//! exporter. A sample that can't be processed is skipped and recorded as a
//! [`Diagnostic`]; only the sampler failing to start or exiting stops the
//! daemon.
use crate::attribution::{AttributionConfig, AttributionEngine, EnergyBalance};
use crate::errors::{DaemonError, SampleError, SamplerExit, SnapshotUnavailable};
use crate::exporters::{utils, DeviceIdentity, Exporter, HostnameIdentity, Report, TaskEnricher};
use crate::selection::{TaskSelector, DEFAULT_TOP_CONSUMERS};
use crate::sensors::battery::{BatteryInfoProvider, BatterySnapshot};
use crate::sensors::{lock_child, plist, Sample, SampleStream, Sensor, SharedChild};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Number of diagnostics kept, the oldest are dropped first.
pub const MAX_DIAGNOSTICS: usize = 256;
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
const UNKNOWN_DEVICE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Starting,
    Sampling,
    Attributing,
    Delivering,
    Stopped,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonState::Idle => "idle",
            DaemonState::Starting => "starting",
            DaemonState::Sampling => "sampling",
            DaemonState::Attributing => "attributing",
            DaemonState::Delivering => "delivering",
            DaemonState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Length of a window.
    pub interval: Duration,
    pub attribution: AttributionConfig,
    pub max_top_consumers: usize,
    /// Pid whose record is always reported, as the observer.
    pub observer_pid: i32,
    /// Executable name identifying the observer in records without pids.
    pub observer_name: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            attribution: AttributionConfig::default(),
            max_top_consumers: DEFAULT_TOP_CONSUMERS,
            observer_pid: std::process::id() as i32,
            observer_name: current_executable(),
        }
    }
}

fn current_executable() -> Option<String> {
    let path = std::env::current_exe().ok()?;
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(String::from)
}

/// A non fatal problem met while sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Stops a running daemon from another thread: the sampler is killed, the
/// daemon then ends its current read and returns.
#[derive(Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    child: Arc<Mutex<Option<SharedChild>>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(child) = self.slot().as_ref() {
            if let Err(e) = lock_child(child).kill() {
                debug!("couldn't kill the sampler: {}", e);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn attach(&self, child: Option<SharedChild>) {
        *self.slot() = child;
        if self.is_stopped() {
            self.stop();
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<SharedChild>> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct Daemon {
    sensor: Box<dyn Sensor>,
    battery: Box<dyn BatteryInfoProvider>,
    identity: Box<dyn DeviceIdentity>,
    enrichers: Vec<Box<dyn TaskEnricher>>,
    config: DaemonConfig,
    engine: AttributionEngine,
    selector: TaskSelector,
    state: DaemonState,
    stream: Option<SampleStream>,
    stop_handle: StopHandle,
    device_id: String,
    platform: String,
    window_start: DateTime<Utc>,
    start_snapshot: Option<BatterySnapshot>,
    diagnostics: VecDeque<Diagnostic>,
    exit: Option<SamplerExit>,
    /// A stop was requested before the sampler output ended.
    stop_requested: bool,
}

impl Daemon {
    pub fn new(
        sensor: Box<dyn Sensor>,
        battery: Box<dyn BatteryInfoProvider>,
        config: DaemonConfig,
    ) -> Daemon {
        let mut selector = TaskSelector::new(config.observer_pid, config.max_top_consumers);
        if let Some(name) = &config.observer_name {
            selector = selector.with_observer_name(name);
        }
        Daemon {
            sensor,
            battery,
            identity: Box::new(HostnameIdentity),
            enrichers: vec![],
            engine: AttributionEngine::new(config.attribution),
            selector,
            config,
            state: DaemonState::Idle,
            stream: None,
            stop_handle: StopHandle::default(),
            device_id: String::from(UNKNOWN_DEVICE),
            platform: utils::get_platform(),
            window_start: Utc::now(),
            start_snapshot: None,
            diagnostics: VecDeque::new(),
            exit: None,
            stop_requested: false,
        }
    }

    pub fn with_identity(mut self, identity: Box<dyn DeviceIdentity>) -> Daemon {
        self.identity = identity;
        self
    }

    /// Adds an enricher, run on every selected record in insertion order.
    pub fn with_enricher(mut self, enricher: Box<dyn TaskEnricher>) -> Daemon {
        self.enrichers.push(enricher);
        self
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Problems met so far, oldest first.
    pub fn diagnostics(&self) -> &VecDeque<Diagnostic> {
        &self.diagnostics
    }

    /// How the sampler ended, once the daemon is stopped.
    pub fn sampler_exit(&self) -> Option<&SamplerExit> {
        self.exit.as_ref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Starts the sampler. The first window starts now.
    pub fn start(&mut self) -> Result<(), DaemonError> {
        if self.state != DaemonState::Idle {
            return Err(DaemonError::SamplerUnavailable(format!(
                "daemon is {}, not idle",
                self.state
            )));
        }
        self.state = DaemonState::Starting;
        info!(
            "starting {} sensor, one window every {:?}",
            self.sensor.kind(),
            self.config.interval
        );
        let stream = match self.sensor.open(self.config.interval) {
            Ok(stream) => stream,
            Err(e) => {
                error!("{}", e);
                self.state = DaemonState::Stopped;
                return Err(e);
            }
        };
        self.stop_handle.attach(stream.child());
        self.stream = Some(stream);

        self.device_id = match self.identity.device_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("couldn't identify the device: {}", e);
                String::from(UNKNOWN_DEVICE)
            }
        };
        self.window_start = Utc::now();
        self.start_snapshot = self.take_snapshot();
        self.state = DaemonState::Sampling;
        Ok(())
    }

    /// Runs until the sampler exits or the daemon is stopped through its
    /// [`StopHandle`]. Starts the daemon if needed.
    pub fn run(&mut self, sink: &mut dyn Exporter) -> Result<(), DaemonError> {
        if self.state == DaemonState::Idle {
            self.start()?;
        }
        info!("sending reports to the {} exporter", sink.kind());
        while self.next_window(sink).is_some() {}

        if self.stop_requested {
            info!("daemon stopped");
            return Ok(());
        }
        let exit = self.exit.clone().unwrap_or_default();
        Err(DaemonError::SamplerExited(exit))
    }

    /// Waits for the next document and processes it.
    ///
    /// Returns the report handed to `sink`, the reason the window was
    /// skipped, or None once the daemon is stopped.
    pub fn next_window(&mut self, sink: &mut dyn Exporter) -> Option<Result<Report, SampleError>> {
        if self.state != DaemonState::Sampling {
            return None;
        }
        if self.stop_handle.is_stopped() {
            self.stop_requested = true;
            self.shutdown();
            return None;
        }
        let document = match self.stream.as_mut().and_then(|s| s.next_document()) {
            None => {
                self.stop_requested = self.stop_handle.is_stopped();
                self.shutdown();
                return None;
            }
            Some(Err(e)) => {
                let error = SampleError::from(e);
                self.record(&error);
                return Some(Err(error));
            }
            Some(Ok(document)) => document,
        };

        let stop = Utc::now();
        let sample = Sample::new(document, self.window_start, stop);
        self.window_start = stop;
        let balance = self.close_battery_window();

        let outcome = self.process(&sample, balance.as_ref(), sink);
        if let Err(e) = &outcome {
            self.record(e);
        }
        self.state = DaemonState::Sampling;
        Some(outcome)
    }

    fn process(
        &mut self,
        sample: &Sample,
        balance: Option<&EnergyBalance>,
        sink: &mut dyn Exporter,
    ) -> Result<Report, SampleError> {
        self.state = DaemonState::Attributing;
        let root = plist::parse(&sample.text)?;
        let attribution = self.engine.attribute(sample, &root, balance)?;
        if attribution.degenerate {
            info!("no activity recorded between {} and {}", sample.start, sample.stop);
        }

        let mut tasks = self.selector.select(attribution.records, &attribution.members);
        for task in tasks.iter_mut() {
            for enricher in &self.enrichers {
                if let Err(e) = enricher.enrich(task) {
                    warn!("couldn't enrich {}: {}", task.name, e);
                }
            }
        }
        let report = Report {
            device_id: self.device_id.clone(),
            start: sample.start,
            stop: sample.stop,
            total_energy: attribution.total,
            mode: attribution.mode,
            tasks,
            platform: self.platform.clone(),
        };
        info!(
            "window {} -> {}: {:.3} J ({}), {} tasks",
            report.start,
            report.stop,
            report.total_energy,
            report.mode,
            report.tasks.len()
        );

        self.state = DaemonState::Delivering;
        sink.export(&report)
            .map_err(|e| SampleError::Export(e.to_string()))?;
        Ok(report)
    }

    /// Reads the battery at the end of the window. The reading also opens
    /// the next window.
    fn close_battery_window(&mut self) -> Option<EnergyBalance> {
        let stop_snapshot = self.take_snapshot();
        let balance = match (self.start_snapshot.as_ref(), stop_snapshot.as_ref()) {
            (Some(start), Some(stop)) => Some(EnergyBalance::from_snapshots(start, stop)),
            _ => None,
        };
        self.start_snapshot = stop_snapshot;
        match balance {
            Some(Ok(balance)) => Some(balance),
            Some(Err(e)) => {
                self.record(&SampleError::Snapshot(e));
                None
            }
            None => None,
        }
    }

    fn take_snapshot(&mut self) -> Option<BatterySnapshot> {
        match self.battery.snapshot() {
            Ok(snapshot) => Some(snapshot),
            Err(SnapshotUnavailable::Unsupported) => {
                trace!("no battery telemetry from {}", self.battery.kind());
                None
            }
            Err(e) => {
                self.record(&SampleError::Snapshot(e));
                None
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if self.stop_requested {
                if let Some(child) = stream.child() {
                    if let Err(e) = lock_child(&child).kill() {
                        debug!("couldn't kill the sampler: {}", e);
                    }
                }
            }
            let exit = stream.finish();
            if self.stop_requested {
                debug!("sampler ended with {}", exit);
            } else {
                error!("sampler exited: {}", exit);
            }
            self.exit = Some(exit);
        }
        self.state = DaemonState::Stopped;
    }

    fn record(&mut self, error: &SampleError) {
        warn!("{}", error);
        if self.diagnostics.len() >= MAX_DIAGNOSTICS {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(Diagnostic {
            at: Utc::now(),
            message: error.to_string(),
        });
    }
}
