//! # Sensors
//!
//! A sensor starts the external sampler and hands out its output as a stream
//! of framed documents. The battery provider and the document parser live
//! here too, as they are the other two readers of platform telemetry.
pub mod battery;
pub mod debug;
pub mod framer;
pub mod plist;
pub mod powermetrics;
pub mod srumutil;
pub mod units;
pub mod utils;

use crate::errors::{DaemonError, SamplerExit};
use chrono::{DateTime, Utc};
use framer::DocumentFramer;
use std::io::{self, BufRead, BufReader};
use std::process::Child;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long a sampler whose output ended may take to exit before it is killed.
pub const EXIT_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(50);

// !!!!!!!!!!!!!!!!! Sensor !!!!!!!!!!!!!!!!!!!!!!!
/// Sensor trait, the Sensor API.
pub trait Sensor {
    /// Starts sampling every `interval`.
    fn open(&mut self, interval: Duration) -> Result<SampleStream, DaemonError>;

    fn kind(&self) -> &str;
}

/// Anything the sampler output can be read from.
pub type SampleReader = Box<dyn BufRead + Send>;

/// The child process, shared between the stream and the stop handle.
pub type SharedChild = Arc<Mutex<Child>>;

/// Locks the child, ignoring a poisoned lock: the child handle stays usable.
pub fn lock_child(child: &SharedChild) -> MutexGuard<'_, Child> {
    match child.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Output of a running sampler.
pub struct SampleStream {
    documents: DocumentFramer<SampleReader>,
    child: Option<SharedChild>,
    stderr: Option<JoinHandle<String>>,
    exit: SamplerExit,
}

impl SampleStream {
    /// A stream over already recorded output. `exit` is what `finish` reports.
    pub fn from_reader(reader: SampleReader, exit: SamplerExit) -> SampleStream {
        SampleStream {
            documents: DocumentFramer::new(reader),
            child: None,
            stderr: None,
            exit,
        }
    }

    /// A stream over the standard output of `child`, which must have been
    /// spawned with piped stdout (and optionally piped stderr).
    pub fn from_child(mut child: Child) -> Result<SampleStream, DaemonError> {
        let stdout = child.stdout.take().ok_or_else(|| {
            DaemonError::SamplerUnavailable(String::from("sampler stdout isn't piped"))
        })?;
        let stderr = child.stderr.take().map(utils::drain_stderr);
        let reader: SampleReader = Box::new(BufReader::new(stdout));
        Ok(SampleStream {
            documents: DocumentFramer::new(reader),
            child: Some(Arc::new(Mutex::new(child))),
            stderr,
            exit: SamplerExit::default(),
        })
    }

    /// Handle on the sampler process, if there is one.
    pub fn child(&self) -> Option<SharedChild> {
        self.child.clone()
    }

    /// Blocks until the next complete document, None once the sampler output ends.
    pub fn next_document(&mut self) -> Option<io::Result<String>> {
        self.documents.next()
    }

    /// Waits for the sampler to terminate and reports how it ended. A
    /// sampler still running after [`EXIT_GRACE`] is killed.
    ///
    /// The child lock is only held while polling, so that the sampler can
    /// still be killed from another thread meanwhile.
    pub fn finish(&mut self) -> SamplerExit {
        let mut exit = self.exit.clone();
        if let Some(child) = self.child.take() {
            exit.code = Self::wait_for(&child, EXIT_GRACE);
        }
        if let Some(handle) = self.stderr.take() {
            match handle.join() {
                Ok(stderr) => exit.stderr = stderr,
                Err(_) => warn!("sampler stderr reader panicked"),
            }
        }
        exit
    }

    fn wait_for(child: &SharedChild, grace: Duration) -> Option<i32> {
        let deadline = Instant::now() + grace;
        loop {
            let polled = lock_child(child).try_wait();
            match polled {
                Ok(Some(status)) => return status.code(),
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                Ok(None) => {
                    warn!("sampler still running {:?} after its output ended, killing it", grace);
                    let mut child = lock_child(child);
                    if let Err(e) = child.kill() {
                        debug!("couldn't kill the sampler: {}", e);
                    }
                    return match child.wait() {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!("couldn't wait for the sampler: {}", e);
                            None
                        }
                    };
                }
                Err(e) => {
                    warn!("couldn't wait for the sampler: {}", e);
                    return None;
                }
            }
        }
    }
}

/// One framed document and the window it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub text: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl Sample {
    pub fn new(text: String, start: DateTime<Utc>, stop: DateTime<Utc>) -> Sample {
        Sample { text, start, stop }
    }

    /// Wall-clock length of the window, in seconds.
    pub fn window_seconds(&self) -> f64 {
        (self.stop - self.start)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::io::Cursor;

    #[test]
    fn recorded_stream_reports_given_exit() {
        let text = "<plist><dict></dict></plist>\n\0<plist><dict></dict></plist>\n";
        let exit = SamplerExit {
            code: Some(3),
            stderr: String::from("done"),
        };
        let mut stream = SampleStream::from_reader(Box::new(Cursor::new(text)), exit.clone());
        assert!(stream.child().is_none());
        assert!(stream.next_document().is_some());
        assert!(stream.next_document().is_some());
        assert!(stream.next_document().is_none());
        assert_eq!(stream.finish(), exit);
    }

    #[cfg(unix)]
    #[test]
    fn child_stream_reports_exit_code_and_stderr() {
        use std::process::{Command, Stdio};
        let child = Command::new("sh")
            .args(["-c", "printf '<plist><dict></dict></plist>\\n'; echo denied >&2; exit 2"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut stream = SampleStream::from_child(child).unwrap();
        assert!(stream.child().is_some());
        assert_eq!(
            stream.next_document().unwrap().unwrap(),
            "<plist><dict></dict></plist>"
        );
        assert!(stream.next_document().is_none());
        let exit = stream.finish();
        assert_eq!(exit.code, Some(2));
        assert_eq!(exit.stderr.trim(), "denied");
    }

    #[cfg(unix)]
    #[test]
    fn sampler_can_be_killed_while_finishing() {
        use std::process::{Command, Stdio};
        let child = Command::new("sh")
            .args(["-c", "exec >&- 2>&-; exec sleep 30"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut stream = SampleStream::from_child(child).unwrap();
        assert!(stream.next_document().is_none());
        let shared = stream.child().unwrap();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            lock_child(&shared).kill().unwrap();
        });
        let began = Instant::now();
        let exit = stream.finish();
        killer.join().unwrap();
        assert!(began.elapsed() < EXIT_GRACE);
        assert_eq!(exit.code, None);
    }

    #[cfg(unix)]
    #[test]
    fn lingering_sampler_is_killed_after_the_grace_period() {
        use std::process::{Command, Stdio};
        let child = Command::new("sh")
            .args(["-c", "exec >&- 2>&-; exec sleep 30"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let shared: SharedChild = Arc::new(Mutex::new(child));
        let began = Instant::now();
        assert_eq!(SampleStream::wait_for(&shared, Duration::from_millis(200)), None);
        assert!(began.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn window_length() {
        let start = Utc::now();
        let sample = Sample::new(String::new(), start, start + ChronoDuration::milliseconds(1500));
        assert!((sample.window_seconds() - 1.5).abs() < 1e-9);
        let backwards = Sample::new(String::new(), start, start - ChronoDuration::seconds(1));
        assert_eq!(backwards.window_seconds(), 0.0);
    }
}
