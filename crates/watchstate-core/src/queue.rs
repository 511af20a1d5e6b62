use rand::Rng;
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use watchstate_backends::{ActionSink, HttpAction};

/// Worker-pool settings. Defaults: 10 workers, 300 s request timeout, three
/// attempts with exponential backoff, 5 s cancellation grace.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub workers: usize,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub grace: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            request_timeout: Duration::from_secs(300),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagCounts {
    pub queued: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Bounded concurrent HTTP pool consuming adapter-submitted actions.
///
/// The queue is a library, not a daemon: an orchestrator constructs it,
/// hands it to adapters as an [`ActionSink`], waits for [`RequestQueue::drain`],
/// and discards it. On cancellation no new work starts and in-flight requests
/// get `grace` to finish before they are aborted.
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<HttpAction>,
    counts: Arc<Mutex<BTreeMap<String, TagCounts>>>,
    workers: Vec<JoinHandle<()>>,
}

impl RequestQueue {
    pub fn new(options: QueueOptions, cancel: CancellationToken) -> Self {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(options.workers)
            .build()
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel::<HttpAction>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counts: Arc<Mutex<BTreeMap<String, TagCounts>>> = Arc::new(Mutex::new(BTreeMap::new()));

        let mut workers = Vec::with_capacity(options.workers);
        for worker_id in 0..options.workers {
            let rx = Arc::clone(&rx);
            let counts = Arc::clone(&counts);
            let client = client.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let action = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            action = rx.recv() => action,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    let Some(action) = action else { break };

                    let tag = action.tag.clone();
                    let ok = execute(&client, action, &options, &cancel, worker_id).await;
                    let mut counts = counts.lock().expect("queue counts lock");
                    let entry = counts.entry(tag).or_default();
                    if ok {
                        entry.succeeded += 1;
                    } else {
                        entry.failed += 1;
                    }
                }
            }));
        }

        Self { tx, counts, workers }
    }

    /// Close the channel, join the workers, and return per-tag counts.
    pub async fn drain(self) -> BTreeMap<String, TagCounts> {
        drop(self.tx);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "queue worker panicked");
            }
        }
        Arc::try_unwrap(self.counts)
            .map(|m| m.into_inner().expect("queue counts lock"))
            .unwrap_or_else(|arc| arc.lock().expect("queue counts lock").clone())
    }
}

impl ActionSink for RequestQueue {
    fn submit(&self, action: HttpAction) {
        let mut counts = self.counts.lock().expect("queue counts lock");
        counts.entry(action.tag.clone()).or_default().queued += 1;
        drop(counts);
        if self.tx.send(action).is_err() {
            warn!("queue channel closed, action dropped");
        }
    }
}

async fn execute(
    client: &Client,
    action: HttpAction,
    options: &QueueOptions,
    cancel: &CancellationToken,
    worker_id: usize,
) -> bool {
    let mut attempt = 0;
    loop {
        attempt += 1;
        debug!(
            worker = worker_id,
            attempt,
            tag = %action.tag,
            action = %action.description,
            "executing request"
        );

        let mut request = client.request(action.method.clone(), &action.url);
        for (key, value) in &action.headers {
            request = request.header(key, value);
        }
        if let Some(body) = &action.body {
            request = request.json(body);
        }

        let send = request.send();
        tokio::pin!(send);

        // On cancel the in-flight deadline shrinks to grace, then hard abort.
        let result = tokio::select! {
            result = &mut send => Some(result),
            _ = cancel.cancelled() => {
                match tokio::time::timeout(options.grace, &mut send).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                }
            }
        };

        let retryable = match result {
            Some(Ok(response)) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    return true;
                }
                warn!(
                    tag = %action.tag,
                    action = %action.description,
                    status,
                    "request failed"
                );
                status >= 500 || status == 429
            }
            Some(Err(e)) => {
                warn!(tag = %action.tag, action = %action.description, error = %e, "request error");
                e.is_timeout() || e.is_connect() || e.is_request()
            }
            None => {
                warn!(tag = %action.tag, action = %action.description, "request aborted on cancel");
                return false;
            }
        };

        if !retryable || attempt >= options.max_attempts || cancel.is_cancelled() {
            return false;
        }

        let exponential = options.base_delay * 2u32.saturating_pow(attempt - 1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        let delay = exponential.min(options.max_delay) + jitter;
        debug!(delay_ms = delay.as_millis() as u64, attempt, "retrying after backoff");
        tokio::time::sleep(delay).await;
    }
}
