use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;

use crate::app::{IngestReport, PlanResult, ProgressEvent, ProgressSink, TablesResult};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_ingest(result: &IngestReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_plan(result: &PlanResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_tables(result: &TablesResult) -> io::Result<()> {
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

#[derive(Default)]
pub struct LogProgress {
    last_step: Mutex<HashMap<String, u64>>,
}

const UNSIZED_STEP: u64 = 64 * 1024 * 1024;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::State { dataset, state, message } => {
                tracing::info!(dataset = %dataset, %state, "{message}");
            }
            ProgressEvent::Transfer { dataset, written, total } => {
                let step = match total {
                    Some(total) if total > 0 => written.saturating_mul(10) / total,
                    _ => written / UNSIZED_STEP,
                };
                let Ok(mut last) = self.last_step.lock() else {
                    return;
                };
                let previous = last.insert(dataset.clone(), step);
                if previous.is_some_and(|previous| previous >= step) {
                    return;
                }
                match total {
                    Some(total) => tracing::info!(
                        dataset = %dataset,
                        "downloaded {} of {}",
                        format_bytes(written),
                        format_bytes(total)
                    ),
                    None => tracing::info!(dataset = %dataset, "downloaded {}", format_bytes(written)),
                }
            }
            ProgressEvent::Table { dataset, table, rows } => {
                tracing::info!(dataset = %dataset, table = %table, rows, "table loaded");
            }
            ProgressEvent::Finished { dataset, .. } => {
                if let Ok(mut last) = self.last_step.lock() {
                    last.remove(&dataset);
                }
            }
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
