pub mod backup;
pub mod export;
pub mod import;
pub mod log_format;
pub mod mapper;
pub mod progress;
pub mod queue;
pub mod report;
pub mod webhook;

pub use backup::run_backup;
pub use export::{run_export, ExportRunOptions};
pub use import::{run_import, ImportRunOptions};
pub use mapper::{DirectMapper, MemoryMapper};
pub use progress::run_progress;
pub use queue::{QueueOptions, RequestQueue, TagCounts};
pub use report::{BackendReport, RunReport};
pub use webhook::{drain_requests, ingest, WebhookOutcome};
