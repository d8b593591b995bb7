//! Worker process boundary: input handshake stream and exit signals.

use std::io::{BufRead, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::config::MutationConfig;
use super::model::TestGroup;

/// Handshake errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Stream ended before `field` was read.
    #[error("handshake stream ended before the {0} field")]
    MissingField(&'static str),
    /// Field could not be encoded.
    #[error("could not encode the {field} field: {source}")]
    Encode {
        /// Field name.
        field: &'static str,
        /// Encoder error.
        #[source]
        source: serde_json::Error,
    },
    /// Field could not be decoded.
    #[error("could not decode the {field} field: {source}")]
    Decode {
        /// Field name.
        field: &'static str,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

/// The three fields a worker reads before mutating: configuration, context descriptor, tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake<D> {
    /// Analysis configuration.
    pub config: MutationConfig,
    /// Descriptor used to build the execution context.
    pub context: D,
    /// Tests run against every mutant.
    pub tests: TestGroup,
}

fn read_field<T, R>(reader: &mut R, field: &'static str) -> Result<T, HandshakeError>
where
    T: DeserializeOwned,
    R: BufRead,
{
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
        return Err(HandshakeError::MissingField(field));
    }
    serde_json::from_str(line.trim_end()).map_err(|source| HandshakeError::Decode { field, source })
}

impl<D: Serialize + DeserializeOwned> Handshake<D> {
    /// Read the three newline-delimited fields.
    pub fn read_from<R: BufRead>(mut reader: R) -> Result<Self, HandshakeError> {
        Ok(Self {
            config: read_field(&mut reader, "configuration")?,
            context: read_field(&mut reader, "context descriptor")?,
            tests: read_field(&mut reader, "test group")?,
        })
    }

    /// Write the three fields, one JSON document per line.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), HandshakeError> {
        write_field(&mut writer, "configuration", &self.config)?;
        write_field(&mut writer, "context descriptor", &self.context)?;
        write_field(&mut writer, "test group", &self.tests)?;
        writer.flush()?;
        Ok(())
    }
}

fn write_field<T, W>(writer: &mut W, field: &'static str, value: &T) -> Result<(), HandshakeError>
where
    T: Serialize,
    W: Write,
{
    let line =
        serde_json::to_string(value).map_err(|source| HandshakeError::Encode { field, source })?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Exit signals a launcher must tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Range processed.
    Ok,
    /// Watchdog abort on memory pressure.
    OutOfMemory,
    /// Static initializer reached mid-range; relaunch at the next unprocessed index.
    ForcedRestart,
    /// Unrecoverable internal error.
    UnknownError,
    /// Stopped by an operator interrupt.
    Interrupted,
}

impl WorkerExit {
    /// Every exit signal.
    pub const ALL: [WorkerExit; 5] = [
        Self::Ok,
        Self::OutOfMemory,
        Self::ForcedRestart,
        Self::UnknownError,
        Self::Interrupted,
    ];

    /// Process exit code.
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::OutOfMemory => 11,
            Self::ForcedRestart => 12,
            Self::UnknownError => 13,
            Self::Interrupted => 130,
        }
    }

    /// Map a process exit code back to a signal. Unknown codes are internal errors.
    pub fn from_code(code: i32) -> Self {
        Self::ALL
            .into_iter()
            .find(|exit| exit.code() == code)
            .unwrap_or(Self::UnknownError)
    }
}
