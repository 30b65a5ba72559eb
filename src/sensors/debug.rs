use super::{SampleReader, SampleStream, Sensor};
use crate::errors::{DaemonError, SamplerExit};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::PathBuf;
use std::time::Duration;

enum Recording {
    Text(String),
    File(PathBuf),
}

/// Replays recorded sampler output instead of running a sampler.
/// The interval is ignored: documents are served as fast as they are read.
pub struct DebugSensor {
    recording: Recording,
    exit: SamplerExit,
}

impl DebugSensor {
    pub fn new(output: impl Into<String>) -> DebugSensor {
        DebugSensor {
            recording: Recording::Text(output.into()),
            exit: SamplerExit {
                code: Some(0),
                stderr: String::new(),
            },
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> DebugSensor {
        DebugSensor {
            recording: Recording::File(path.into()),
            exit: SamplerExit {
                code: Some(0),
                stderr: String::new(),
            },
        }
    }

    /// Sets how the replayed sampler pretends to have ended.
    pub fn with_exit(mut self, exit: SamplerExit) -> DebugSensor {
        self.exit = exit;
        self
    }
}

impl Sensor for DebugSensor {
    fn open(&mut self, _interval: Duration) -> Result<SampleStream, DaemonError> {
        let reader: SampleReader = match &self.recording {
            Recording::Text(text) => Box::new(Cursor::new(text.clone().into_bytes())),
            Recording::File(path) => {
                let file = File::open(path).map_err(|e| {
                    DaemonError::SamplerUnavailable(format!("{}: {}", path.display(), e))
                })?;
                Box::new(BufReader::new(file))
            }
        };
        Ok(SampleStream::from_reader(reader, self.exit.clone()))
    }

    fn kind(&self) -> &str {
        "debug"
    }
}
