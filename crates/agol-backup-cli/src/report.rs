//! End-of-run console report.

use agol_backup_core::backup::RunReport;
use agol_backup_core::config::MAX_ITEMS;
use std::fmt;
use std::time::Duration;

/// The ignored-items audit list and the run summary, printed when a run ends.
///
/// ```
/// use agol_backup_cli::RunSummary;
/// use agol_backup_core::RunReport;
/// use std::time::Duration;
///
/// let report = RunReport::default();
/// let text = RunSummary::new(&report, Duration::from_secs(2)).to_string();
/// assert!(text.contains("2.00 seconds to complete"));
/// ```
pub struct RunSummary<'a> {
    report: &'a RunReport,
    elapsed: Duration,
}

impl<'a> RunSummary<'a> {
    pub fn new(report: &'a RunReport, elapsed: Duration) -> Self {
        Self { report, elapsed }
    }
}

impl fmt::Display for RunSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.report;
        let stats = &report.stats;

        writeln!(f, "\n\n### Items ignored and not backed up: ###")?;
        for item in &report.ignored {
            writeln!(f, "{} - {}", item.title, item.item_type)?;
        }

        if !report.failures.is_empty() {
            writeln!(f, "\n### Items that failed: ###")?;
            for failure in &report.failures {
                writeln!(
                    f,
                    "{} - {}: {}",
                    failure.title, failure.item_type, failure.error
                )?;
            }
        }

        writeln!(f, "\nDone.")?;
        writeln!(f, "  Items processed:      {}", stats.total())?;
        writeln!(f, "  Backed up:            {}", stats.snapshotted)?;
        writeln!(f, "  Geodatabases saved:   {}", stats.exported)?;
        writeln!(f, "  Exports not found:    {}", stats.export_not_found)?;
        writeln!(f, "  Views (JSON only):    {}", stats.views_skipped)?;
        writeln!(f, "  Ignored:              {}", stats.ignored)?;
        if stats.failed > 0 {
            writeln!(f, "  Failed:               {}", stats.failed)?;
        }
        if report.truncated {
            writeln!(
                f,
                "  WARNING: listing stopped at {} items; the rest were not backed up",
                MAX_ITEMS
            )?;
        }
        writeln!(f, "{:.2} seconds to complete", self.elapsed.as_secs_f64())
    }
}
