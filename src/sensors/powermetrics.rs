//! # PowermetricsSensor
//!
//! Sensor backed by Apple's `powermetrics`, run with per-process energy
//! and coalition sampling enabled. It needs root privileges.
use super::utils::find_in_path;
use super::{SampleStream, Sensor};
use crate::errors::DaemonError;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default name of the sampler binary.
pub const POWERMETRICS: &str = "powermetrics";
/// Time the one-shot test run gets before the sampler is deemed unusable.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const CHECK_POLL: Duration = Duration::from_millis(50);

pub struct PowermetricsSensor {
    program: String,
    check_first: bool,
    check_timeout: Duration,
}

impl Default for PowermetricsSensor {
    fn default() -> Self {
        PowermetricsSensor::new()
    }
}

impl PowermetricsSensor {
    pub fn new() -> PowermetricsSensor {
        PowermetricsSensor::with_program(POWERMETRICS)
    }

    /// Uses `program` (a name looked up in PATH, or a path) as the sampler.
    pub fn with_program(program: &str) -> PowermetricsSensor {
        PowermetricsSensor {
            program: String::from(program),
            check_first: true,
            check_timeout: CHECK_TIMEOUT,
        }
    }

    /// Enables or disables the one-shot run made before starting the sampler.
    pub fn check_first(mut self, check_first: bool) -> PowermetricsSensor {
        self.check_first = check_first;
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> PowermetricsSensor {
        self.check_timeout = timeout;
        self
    }

    /// Arguments of the long running sampler.
    pub fn sampling_args(interval: Duration) -> Vec<String> {
        let millis = interval.as_millis().max(1);
        vec![
            String::from("-i"),
            millis.to_string(),
            String::from("--show-process-energy"),
            String::from("--show-process-coalition"),
            String::from("--format"),
            String::from("plist"),
        ]
    }

    /// Arguments of a single, silent sample used to check the sampler is usable.
    pub fn check_args() -> Vec<&'static str> {
        vec!["--samplers", "cpu_power", "-n", "1", "-i", "1", "-o", "/dev/null"]
    }

    fn check_available(&self, path: &Path) -> Result<(), DaemonError> {
        if !self.check_first {
            return Ok(());
        }
        let mut trial = Command::new(path)
            .args(Self::check_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let deadline = Instant::now() + self.check_timeout;
        let status = loop {
            if let Some(status) = trial.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                if let Err(e) = trial.kill() {
                    debug!("couldn't kill the {} test run: {}", self.program, e);
                }
                let _ = trial.wait();
                return Err(DaemonError::SamplerUnavailable(format!(
                    "{} test run timed out after {:?}",
                    self.program, self.check_timeout
                )));
            }
            thread::sleep(CHECK_POLL);
        };
        if status.success() {
            Ok(())
        } else {
            Err(DaemonError::SamplerUnavailable(format!(
                "{} test run failed with {} (is the daemon running as root ?)",
                self.program, status
            )))
        }
    }
}

impl Sensor for PowermetricsSensor {
    fn open(&mut self, interval: Duration) -> Result<SampleStream, DaemonError> {
        let path = find_in_path(&self.program).ok_or_else(|| {
            DaemonError::SamplerUnavailable(format!("{} not found in PATH", self.program))
        })?;
        self.check_available(&path)?;
        let args = Self::sampling_args(interval);
        info!("starting {} {}", path.display(), args.join(" "));
        let child = Command::new(&path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        SampleStream::from_child(child)
    }

    fn kind(&self) -> &str {
        POWERMETRICS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_command_line() {
        let args = PowermetricsSensor::sampling_args(Duration::from_secs(60));
        assert_eq!(
            args,
            vec![
                "-i",
                "60000",
                "--show-process-energy",
                "--show-process-coalition",
                "--format",
                "plist"
            ]
        );
        let args = PowermetricsSensor::sampling_args(Duration::from_micros(10));
        assert_eq!(args[1], "1");
    }

    #[test]
    fn missing_sampler_is_unavailable() {
        let mut sensor = PowermetricsSensor::with_program("surely-not-powermetrics-4242");
        match sensor.open(Duration::from_secs(1)) {
            Err(DaemonError::SamplerUnavailable(reason)) => assert!(reason.contains("not found")),
            _ => panic!("expected SamplerUnavailable"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn failed_test_run_is_unavailable() {
        let mut sensor = PowermetricsSensor::with_program("false");
        assert!(matches!(
            sensor.open(Duration::from_secs(1)),
            Err(DaemonError::SamplerUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn hanging_test_run_is_unavailable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("powermetrics");
        std::fs::write(&program, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut sensor = PowermetricsSensor::with_program(program.to_str().unwrap())
            .with_check_timeout(Duration::from_millis(300));
        let began = Instant::now();
        match sensor.open(Duration::from_secs(1)) {
            Err(DaemonError::SamplerUnavailable(reason)) => assert!(reason.contains("timed out")),
            _ => panic!("expected SamplerUnavailable"),
        }
        assert!(began.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn sampler_without_output_ends_the_stream() {
        let mut sensor = PowermetricsSensor::with_program("true");
        let mut stream = sensor.open(Duration::from_secs(1)).unwrap();
        assert!(stream.next_document().is_none());
        assert_eq!(stream.finish().code, Some(0));
    }
}
