//
// progress.rs
// dicom2mesh
//
// Progress notification hook injected into long-running operations.
//

use std::io::Write;
use std::sync::Mutex;

/// Receives completion fractions in `[0.0, 1.0]` from long-running
/// operations (loading, extraction, filtering). Implementations must be
/// thread-safe; parallel stages report from worker threads.
pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64);
}

/// Rewrites a single terminal status line for each report.
#[derive(Debug, Default)]
pub struct TerminalProgress;

impl ProgressSink for TerminalProgress {
    fn report(&self, fraction: f64) {
        let mut out = std::io::stdout();
        // erase line, carriage return
        let _ = write!(out, "\x1b[2K\rProgress: ");
        if fraction > 0.999 {
            let _ = write!(out, "done");
        } else {
            let _ = write!(out, "{:.1}%", fraction * 100.0);
        }
        let _ = out.flush();
    }
}

/// Collects every reported fraction; used by tests to assert that an
/// operation actually drove its progress hook.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    reports: Mutex<Vec<f64>>,
}

impl RecordingProgress {
    pub fn reports(&self) -> Vec<f64> {
        self.reports.lock().expect("progress lock").clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, fraction: f64) {
        self.reports.lock().expect("progress lock").push(fraction);
    }
}
