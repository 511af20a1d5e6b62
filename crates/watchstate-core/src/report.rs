use serde::Serialize;
use std::collections::BTreeMap;

/// Per-backend counters for one orchestrator run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendReport {
    pub libraries: u64,
    pub items: u64,
    pub dropped: u64,
    pub queued: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Total payload bytes parsed across pages.
    pub response_size: u64,
    pub errors: Vec<String>,
    pub has_errors: bool,
}

/// Counters threaded through an orchestrator run and returned to the caller.
/// Replaces any global message bus: the report is a value, owned by the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub backends: BTreeMap<String, BackendReport>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend_mut(&mut self, name: &str) -> &mut BackendReport {
        self.backends.entry(name.to_string()).or_default()
    }

    pub fn record_error(&mut self, name: &str, error: impl Into<String>) {
        let report = self.backend_mut(name);
        report.errors.push(error.into());
        report.has_errors = true;
    }

    /// True when every backend finished without errors.
    pub fn ok(&self) -> bool {
        self.backends.values().all(|b| !b.has_errors)
    }

    /// True when at least one backend produced results.
    pub fn any_succeeded(&self) -> bool {
        self.backends.values().any(|b| !b.has_errors)
    }

    pub fn total_items(&self) -> u64 {
        self.backends.values().map(|b| b.items).sum()
    }

    pub fn merge_queue_counts(&mut self, counts: &BTreeMap<String, crate::queue::TagCounts>) {
        for (tag, tag_counts) in counts {
            let report = self.backend_mut(tag);
            report.queued += tag_counts.queued;
            report.succeeded += tag_counts.succeeded;
            report.failed += tag_counts.failed;
            if tag_counts.failed > 0 {
                report.has_errors = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_marks_backend() {
        let mut report = RunReport::new();
        report.backend_mut("a").items = 5;
        report.record_error("b", "unreachable");

        assert!(!report.ok());
        assert!(report.any_succeeded());
        assert!(report.backends["b"].has_errors);
        assert!(!report.backends["a"].has_errors);
        assert_eq!(report.total_items(), 5);
    }
}
