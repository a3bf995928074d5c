//! Parser for the sandbox executor's run report.
//!
//! The sandbox prints one `Key: Value` record per line on stdout. `Status`
//! is mandatory and maps onto [`Verdict`]; the resource counters are
//! optional integers defaulting to zero. Unknown keys are ignored and a
//! repeated key takes the last value, so the parser stays total over
//! whatever a future sandbox version may emit.

use thiserror::Error;

use crate::verdict::Verdict;

/// Typed outcome of one sandboxed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRecord {
    pub verdict: Verdict,
    /// CPU time consumed, in milliseconds.
    pub cpu_time_ms: i64,
    /// Wall-clock time, in milliseconds.
    pub real_time_ms: i64,
    /// Peak virtual memory, in bytes.
    pub vm_size_bytes: i64,
}

/// Failure to decode the sandbox's stdout.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("sandbox reported no Status")]
    MissingStatus,
    #[error("sandbox reported unknown Status: {0:?}")]
    UnknownStatus(String),
    #[error("sandbox reported malformed {key}: {value:?}")]
    MalformedValue { key: &'static str, value: String },
}

/// Decodes the raw bytes the sandbox printed.
pub fn parse(raw: &[u8]) -> Result<RunRecord, ProtocolError> {
    let mut verdict = None;
    let mut cpu_time_ms = 0;
    let mut real_time_ms = 0;
    let mut vm_size_bytes = 0;

    for line in raw.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(sep) = line.windows(2).position(|w| w == b": ") else {
            continue;
        };
        let (key, value) = (&line[..sep], &line[sep + 2..]);
        match key {
            b"Status" => {
                let status = String::from_utf8_lossy(value);
                verdict = Some(
                    Verdict::from_status(&status)
                        .ok_or_else(|| ProtocolError::UnknownStatus(status.to_string()))?,
                );
            }
            b"CPUTime" => cpu_time_ms = parse_counter("CPUTime", value)?,
            b"RealTime" => real_time_ms = parse_counter("RealTime", value)?,
            b"VMSize" => vm_size_bytes = parse_counter("VMSize", value)?,
            _ => {}
        }
    }

    Ok(RunRecord {
        verdict: verdict.ok_or(ProtocolError::MissingStatus)?,
        cpu_time_ms,
        real_time_ms,
        vm_size_bytes,
    })
}

fn parse_counter(key: &'static str, value: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| ProtocolError::MalformedValue {
            key,
            value: String::from_utf8_lossy(value).into_owned(),
        })
}
