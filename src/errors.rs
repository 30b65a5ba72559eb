use std::convert;
use std::io;
use std::num::{ParseFloatError, ParseIntError};
use std::{error::Error, fmt};

/// Number of characters of the input kept in a MalformedDocument error.
const FRAGMENT_MAX_CHARS: usize = 48;

/// A sample document that couldn't be turned into a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedDocument {
    /// Byte offset in the document where the problem was detected.
    pub offset: usize,
    /// Excerpt of the document starting at `offset`.
    pub fragment: String,
    pub reason: String,
}

impl MalformedDocument {
    pub fn new(text: &str, offset: usize, reason: impl Into<String>) -> MalformedDocument {
        let start = offset.min(text.len());
        let fragment = text
            .get(start..)
            .unwrap_or_default()
            .chars()
            .take(FRAGMENT_MAX_CHARS)
            .collect();
        MalformedDocument {
            offset,
            fragment,
            reason: reason.into(),
        }
    }
}

impl Error for MalformedDocument {}

impl fmt::Display for MalformedDocument {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "malformed document at byte {}: {} (near {:?})",
            self.offset, self.reason, self.fragment
        )
    }
}

/// A parsed sample that doesn't carry what the attribution needs.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributionError {
    /// The "all_tasks" aggregate entry is absent or has no usable weight.
    MissingAggregate(String),
    /// A field is present but holds an unexpected kind of value.
    InvalidField { key: String, expected: &'static str },
    /// The window stops before it starts.
    InvalidWindow,
}

impl Error for AttributionError {}

impl fmt::Display for AttributionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AttributionError::MissingAggregate(detail) => {
                write!(f, "sample has no usable all_tasks aggregate: {detail}")
            }
            AttributionError::InvalidField { key, expected } => {
                write!(f, "field {key} should be {expected}")
            }
            AttributionError::InvalidWindow => write!(f, "window stop is earlier than its start"),
        }
    }
}

/// The battery telemetry couldn't be read for this window.
#[derive(Debug)]
pub enum SnapshotUnavailable {
    /// The platform doesn't expose battery counters.
    Unsupported,
    /// Running the battery info command failed.
    IoError(io::Error),
    /// A counter is missing from the battery info output.
    MissingField(&'static str),
    /// A counter couldn't be parsed as a number.
    InvalidValue(&'static str),
    /// A cumulative counter went backwards between two snapshots.
    CounterReset(&'static str),
}

impl Error for SnapshotUnavailable {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SnapshotUnavailable::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SnapshotUnavailable::Unsupported => write!(f, "no battery telemetry on this host"),
            SnapshotUnavailable::IoError(e) => write!(f, "couldn't read battery telemetry: {e}"),
            SnapshotUnavailable::MissingField(name) => {
                write!(f, "battery telemetry has no {name} field")
            }
            SnapshotUnavailable::InvalidValue(name) => {
                write!(f, "battery telemetry field {name} isn't a number")
            }
            SnapshotUnavailable::CounterReset(name) => {
                write!(f, "battery counter {name} went backwards")
            }
        }
    }
}

impl convert::From<io::Error> for SnapshotUnavailable {
    fn from(error: io::Error) -> Self {
        SnapshotUnavailable::IoError(error)
    }
}

/// Everything that can make the daemon skip one sample.
/// None of those stop the sampling loop.
#[derive(Debug)]
pub enum SampleError {
    Malformed(MalformedDocument),
    Attribution(AttributionError),
    Snapshot(SnapshotUnavailable),
    /// Reading the sampler output failed.
    IoError(io::Error),
    /// The report sink refused the report.
    Export(String),
}

impl Error for SampleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SampleError::Malformed(e) => Some(e),
            SampleError::Attribution(e) => Some(e),
            SampleError::Snapshot(e) => Some(e),
            SampleError::IoError(e) => Some(e),
            SampleError::Export(_) => None,
        }
    }
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SampleError::Malformed(e) => write!(f, "{e}"),
            SampleError::Attribution(e) => write!(f, "{e}"),
            SampleError::Snapshot(e) => write!(f, "{e}"),
            SampleError::IoError(e) => write!(f, "couldn't read sampler output: {e}"),
            SampleError::Export(msg) => write!(f, "report export failed: {msg}"),
        }
    }
}

impl convert::From<MalformedDocument> for SampleError {
    fn from(error: MalformedDocument) -> Self {
        SampleError::Malformed(error)
    }
}

impl convert::From<AttributionError> for SampleError {
    fn from(error: AttributionError) -> Self {
        SampleError::Attribution(error)
    }
}

impl convert::From<SnapshotUnavailable> for SampleError {
    fn from(error: SnapshotUnavailable) -> Self {
        SampleError::Snapshot(error)
    }
}

impl convert::From<io::Error> for SampleError {
    fn from(error: io::Error) -> Self {
        SampleError::IoError(error)
    }
}

/// How the sampler process ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SamplerExit {
    /// Exit code, None when the process was killed by a signal.
    pub code: Option<i32>,
    /// Whatever the sampler wrote on its standard error.
    pub stderr: String,
}

impl SamplerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for SamplerExit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}")?,
            None => write!(f, "terminated by signal")?,
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, " ({stderr})")?;
        }
        Ok(())
    }
}

/// Errors that end the daemon.
#[derive(Debug)]
pub enum DaemonError {
    /// The sampler couldn't be located, authorized or spawned.
    SamplerUnavailable(String),
    /// The sampler process terminated on its own.
    SamplerExited(SamplerExit),
}

impl Error for DaemonError {}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DaemonError::SamplerUnavailable(reason) => {
                write!(f, "couldn't start the sampler: {reason}")
            }
            DaemonError::SamplerExited(exit) => write!(f, "sampler exited: {exit}"),
        }
    }
}

impl convert::From<io::Error> for DaemonError {
    fn from(error: io::Error) -> Self {
        DaemonError::SamplerUnavailable(error.to_string())
    }
}

/// Number parsing failures inside a document, mapped to MalformedDocument by the parser.
#[derive(Debug)]
pub enum ScalarParseError {
    Integer(ParseIntError),
    Real(ParseFloatError),
}

impl Error for ScalarParseError {}

impl fmt::Display for ScalarParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScalarParseError::Integer(e) => write!(f, "invalid integer: {e}"),
            ScalarParseError::Real(e) => write!(f, "invalid real: {e}"),
        }
    }
}

impl convert::From<ParseIntError> for ScalarParseError {
    fn from(error: ParseIntError) -> Self {
        ScalarParseError::Integer(error)
    }
}

impl convert::From<ParseFloatError> for ScalarParseError {
    fn from(error: ParseFloatError) -> Self {
        ScalarParseError::Real(error)
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
