use std::io::{self, Write};

use serde::Serialize;

use crate::merge::MergeSummary;
use crate::migrate::UpgradeSummary;
use crate::pipeline::{BuildResult, ProgressEvent, ProgressSink};
use crate::sanitize::SanitizeReport;

#[derive(Debug, Clone, Serialize)]
pub struct SanitizeResult {
    pub input: String,
    pub output: String,
    pub size: usize,
    #[serde(flatten)]
    pub report: SanitizeReport,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_build(result: &BuildResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sanitize(result: &SanitizeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_upgrade(result: &UpgradeSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_merge(result: &MergeSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress to the tracing subscriber.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}
