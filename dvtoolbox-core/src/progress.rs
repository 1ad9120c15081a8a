//! Progress reporting for long-running operations.
//!
//! The tracker and the reconciliation engine only see [`ProgressReporter`].
//! Which sink is active is chosen once by the caller via [`ProgressMode`].

use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

/// Number of units on the visual bar; one percent is a hundred units.
pub const BAR_UNITS: u64 = 10_000;

pub trait ProgressReporter: Send + Sync {
    /// Emit one progress event. `percentage` is in `0.0..=100.0`.
    fn report(&self, message: &str, percentage: f64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    #[default]
    Plain,
    Bar,
    Ci,
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(ProgressMode::Plain),
            "bar" => Ok(ProgressMode::Bar),
            "ci" | "ci-marker" | "devops" => Ok(ProgressMode::Ci),
            other => Err(format!("unknown progress mode '{other}' (expected plain, bar or ci)")),
        }
    }
}

impl ProgressMode {
    /// Build the reporter for this mode, writing to stdout.
    pub fn reporter(self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Plain => Box::new(PlainReporter::new(Box::new(std::io::stdout()))),
            ProgressMode::Bar => Box::new(BarReporter::new()),
            ProgressMode::Ci => Box::new(CiMarkerReporter::new(Box::new(std::io::stdout()))),
        }
    }
}

/// Writes the message of every event as its own line.
pub struct PlainReporter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl PlainReporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl ProgressReporter for PlainReporter {
    fn report(&self, message: &str, _percentage: f64) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{message}");
            let _ = out.flush();
        }
    }
}

/// Bounded 0..=10000 unit bar.
pub struct BarReporter {
    bar: ProgressBar,
}

impl BarReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new(BAR_UNITS);
        let template = "{bar:40.cyan/blue} {percent:>3}% {msg}";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            bar.set_style(style);
        }
        Self { bar }
    }

    /// A bar that draws nothing; used where no terminal is attached.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

impl Default for BarReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for BarReporter {
    fn report(&self, message: &str, percentage: f64) {
        let units = (percentage * 100.0).round().clamp(0.0, BAR_UNITS as f64) as u64;
        self.bar.set_message(message.to_string());
        self.bar.set_position(units);
        if units >= BAR_UNITS {
            self.bar.finish_with_message(message.to_string());
        }
    }
}

impl Drop for BarReporter {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}

/// Azure Pipelines logging commands: a progress marker per event and a
/// completion marker once the final event reaches 100 %.
pub struct CiMarkerReporter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl CiMarkerReporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl ProgressReporter for CiMarkerReporter {
    fn report(&self, message: &str, percentage: f64) {
        let value = percentage.clamp(0.0, 100.0) as u32;
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "##vso[task.setprogress value={value};]{message}");
            if percentage >= 100.0 {
                let _ = writeln!(out, "##vso[task.complete result=Succeeded;]DONE");
            }
            let _ = out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SharedBuffer;

    #[test]
    fn test_plain_writes_one_line_per_event() {
        let buf = SharedBuffer::default();
        let reporter = PlainReporter::new(Box::new(buf.clone()));
        reporter.report("Importing", 10.0);
        reporter.report("Done", 100.0);
        assert_eq!(buf.contents(), "Importing\nDone\n");
    }

    #[test]
    fn test_ci_marker_completes_only_on_final_event() {
        let buf = SharedBuffer::default();
        let reporter = CiMarkerReporter::new(Box::new(buf.clone()));
        reporter.report("Solution Import", 42.7);
        assert_eq!(
            buf.contents(),
            "##vso[task.setprogress value=42;]Solution Import\n"
        );
        reporter.report("Solution Import", 100.0);
        let lines: Vec<String> = buf.contents().lines().map(String::from).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "##vso[task.setprogress value=100;]Solution Import");
        assert_eq!(lines[2], "##vso[task.complete result=Succeeded;]DONE");
    }

    #[test]
    fn test_bar_maps_percentage_onto_units() {
        let reporter = BarReporter::hidden();
        reporter.report("halfway", 50.0);
        assert_eq!(reporter.position(), 5_000);
        reporter.report("overflow", 250.0);
        assert_eq!(reporter.position(), BAR_UNITS);
        assert!(reporter.is_finished());
    }

    #[test]
    fn test_progress_mode_parses_aliases() {
        assert_eq!("CI".parse::<ProgressMode>(), Ok(ProgressMode::Ci));
        assert_eq!("bar".parse::<ProgressMode>(), Ok(ProgressMode::Bar));
        assert!("fancy".parse::<ProgressMode>().is_err());
    }
}
