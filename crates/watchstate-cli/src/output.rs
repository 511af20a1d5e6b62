use clap::ValueEnum;
use watchstate_core::RunReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Renders run summaries to stdout; log records go to tracing separately.
pub struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    pub fn new(format: OutputFormat, quiet: bool) -> Self {
        Self { format, quiet }
    }

    pub fn line(&self, message: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", message.as_ref());
        }
    }

    pub fn json(&self, value: &serde_json::Value) {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string()));
    }

    /// End-of-run summary: one row per backend plus its errors.
    pub fn report(&self, operation: &str, report: &RunReport) {
        match self.format {
            OutputFormat::Json => {
                self.json(&serde_json::json!({ "operation": operation, "report": report }));
            }
            OutputFormat::Human => {
                if self.quiet {
                    return;
                }
                println!("{operation} summary:");
                for (name, entry) in &report.backends {
                    println!(
                        "  {name}: libraries={} items={} dropped={} queued={} succeeded={} failed={}{}",
                        entry.libraries,
                        entry.items,
                        entry.dropped,
                        entry.queued,
                        entry.succeeded,
                        entry.failed,
                        if entry.has_errors { " [errors]" } else { "" }
                    );
                    for error in &entry.errors {
                        println!("    - {error}");
                    }
                }
                if report.backends.is_empty() {
                    println!("  nothing to do");
                }
            }
        }
    }
}
