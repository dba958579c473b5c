//! Download progress reporting.
//!
//! Progress is emitted on **stderr** so stdout keeps only the run summaries.

use std::io::{IsTerminal, Write};

/// A single progress event for one file transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Transfer opened; `total` is the advertised length, if any.
    Started { file: String, total: Option<u64> },
    /// `bytes` written so far.
    Transferred {
        file: String,
        bytes: u64,
        total: Option<u64>,
    },
    /// Stream completed with `bytes` written.
    Finished { file: String, bytes: u64 },
}

/// Receives byte-level progress from the download cache.
pub trait ProgressReporter {
    fn report(&self, event: DownloadEvent);
}

/// Human-friendly single-line progress: "premier/003.dem.bz2  12.5 MiB / 80.1 MiB (15%)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: DownloadEvent) {
        let line = match &event {
            DownloadEvent::Started { file, total } => match total {
                Some(t) => format!("{}  starting ({})", file, format_bytes(*t)),
                None => format!("{}  starting", file),
            },
            DownloadEvent::Transferred { file, bytes, total } => match total {
                Some(t) if *t > 0 => format!(
                    "\r{}  {} / {} ({}%)",
                    file,
                    format_bytes(*bytes),
                    format_bytes(*t),
                    bytes.saturating_mul(100) / t
                ),
                _ => format!("\r{}  {}", file, format_bytes(*bytes)),
            },
            DownloadEvent::Finished { file, bytes } => {
                format!("\r{}  done, {}\n", file, format_bytes(*bytes))
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: DownloadEvent) {}
}

/// Human progress when stderr is a terminal, otherwise none
pub fn default_reporter() -> Box<dyn ProgressReporter> {
    if std::io::stderr().is_terminal() {
        Box::new(StderrProgress)
    } else {
        Box::new(NoProgress)
    }
}

fn format_bytes(n: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    const GIB: f64 = MIB * 1024.0;
    let f = n as f64;
    if f >= GIB {
        format!("{:.2} GiB", f / GIB)
    } else if f >= MIB {
        format!("{:.1} MiB", f / MIB)
    } else if f >= KIB {
        format!("{:.1} KiB", f / KIB)
    } else {
        format!("{} B", n)
    }
}
