//! Fan-in relay hub: N readers → 1 shared buffer → 1 output queue → M
//! writers → sink, with cooperative cancellation and orderly shutdown.
//!
//! Grounded on `vzclient/asyncio/influx_hub.py::InfluxHub`. The Python
//! original relies on single-threaded cooperative scheduling to make the
//! shared buffer append-then-maybe-flush sequence atomic without a lock
//! (`spec.md` §5, §9). Running on Tokio's multi-threaded runtime requires
//! making that critical section explicit, so `buffer` and `t_buffer` here
//! are guarded together by one [`tokio::sync::Mutex`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::Buffer;
use crate::driver::{render_record, Sample};

/// Tunables for a [`RelayHub`]. Grounded on `InfluxHub.__init__`. Parsed
/// directly from the config's `hub` tool-specific section (`spec.md` §6,
/// "plus tool-specific sections").
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub buffer_size: usize,
    pub max_buffer_age_ms: i64,
    /// Negative means infinite retries.
    pub max_retries: i64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1_000_000,
            max_buffer_age_ms: 30_000,
            max_retries: 5,
        }
    }
}

struct Shared {
    buffer: Buffer,
    t_buffer: Option<i64>,
}

/// A handle a sink driver factory can use to open one fresh connection per
/// write attempt, matching the original's "each writer opens its own
/// connection" model (`spec.md` §5, "Shared resources").
#[async_trait::async_trait]
pub trait SinkConnector: Send + Sync {
    async fn post(&self, batch: Bytes) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub struct RelayHub {
    config: HubConfig,
    shared: Arc<Mutex<Shared>>,
    queue_tx: mpsc::UnboundedSender<Bytes>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<Bytes>>>,
    reader_cancel: CancellationToken,
    writer_cancel: CancellationToken,
    reader_tasks: Vec<JoinHandle<()>>,
    writer_tasks: Vec<JoinHandle<()>>,
}

impl RelayHub {
    pub fn new(config: HubConfig) -> Result<Self, crate::error::Error> {
        let buffer = Buffer::new(config.buffer_size, None)?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            shared: Arc::new(Mutex::new(Shared {
                buffer,
                t_buffer: None,
            })),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            reader_cancel: CancellationToken::new(),
            writer_cancel: CancellationToken::new(),
            reader_tasks: Vec::new(),
            writer_tasks: Vec::new(),
        })
    }

    /// Connect a reader: spawns a task that pulls samples from `samples`
    /// (fed by a [`crate::device_reader::DeviceReader`] elsewhere) and
    /// appends rendered line-protocol records into the shared buffer,
    /// flushing on size or age.
    pub fn connect_reader(&mut self, prefix: Vec<u8>, mut samples: mpsc::Receiver<Sample>) {
        let shared = self.shared.clone();
        let queue_tx = self.queue_tx.clone();
        let max_age = self.config.max_buffer_age_ms;
        let cancel = self.reader_cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // Drain whatever is already sitting in the channel
                        // before flushing: the producer side (`try_send` in
                        // the relay binary) may have buffered samples the
                        // consumer hasn't pulled yet, and those must still
                        // reach the output queue (spec.md §4.5).
                        while let Ok(sample) = samples.try_recv() {
                            append_and_maybe_flush(&shared, &queue_tx, &prefix, sample, max_age).await;
                        }
                        flush(&shared, &queue_tx).await;
                        debug!("reader cancelled, final flush done");
                        return;
                    }
                    next = samples.recv() => {
                        match next {
                            Some(sample) => {
                                append_and_maybe_flush(&shared, &queue_tx, &prefix, sample, max_age).await;
                            }
                            None => {
                                flush(&shared, &queue_tx).await;
                                return;
                            }
                        }
                    }
                }
            }
        });
        self.reader_tasks.push(handle);
    }

    /// Connect a writer: spawns a task that pulls batches from the output
    /// queue and writes them via a fresh `SinkConnector` each attempt,
    /// retrying transient failures with a fixed 2s backoff.
    pub fn connect_writer(&mut self, connector: Arc<dyn SinkConnector>) {
        let queue_rx = self.queue_rx.clone();
        let max_retries = self.config.max_retries;
        let cancel = self.writer_cancel.clone();

        let handle = tokio::spawn(async move {
            let mut batch: Option<Bytes> = None;
            let mut retries: i64 = 0;
            loop {
                if batch.is_none() {
                    let next = {
                        let mut rx = queue_rx.lock().await;
                        if cancel.is_cancelled() {
                            rx.try_recv().ok()
                        } else {
                            rx.recv().await
                        }
                    };
                    match next {
                        Some(b) => {
                            batch = Some(b);
                            retries = 0;
                        }
                        None if cancel.is_cancelled() => {
                            debug!("writer drained, exiting");
                            return;
                        }
                        None => return,
                    }
                }

                let Some(b) = batch.clone() else { continue };
                match connector.post(b).await {
                    Ok(()) => {
                        batch = None;
                    }
                    Err(err) => {
                        if max_retries < 0 || retries < max_retries {
                            retries += 1;
                            warn!(%err, retries, "write failed, retrying");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        } else {
                            error!(%err, bytes = batch.as_ref().map(|b| b.len()).unwrap_or(0), "write failed, discarding batch");
                            batch = None;
                        }
                    }
                }
            }
        });
        self.writer_tasks.push(handle);
    }

    /// Stop the hub: cancel readers (each performs one final flush),
    /// await them within `reader_timeout`, then cancel writers (each
    /// drains the queue before exiting), await within `writer_timeout`.
    pub async fn stop(&mut self, timeout_total: Duration) {
        self.stop_split(timeout_total / 5, timeout_total - timeout_total / 5)
            .await;
    }

    /// As [`RelayHub::stop`] but with an explicit reader/writer timeout
    /// split instead of the default 20/80.
    pub async fn stop_split(&mut self, reader_timeout: Duration, writer_timeout: Duration) {
        info!("stopping relay hub");
        self.reader_cancel.cancel();
        let readers = std::mem::take(&mut self.reader_tasks);
        await_tasks("readers", readers, reader_timeout).await;

        self.writer_cancel.cancel();
        let writers = std::mem::take(&mut self.writer_tasks);
        await_tasks("writers", writers, writer_timeout).await;
    }
}

async fn await_tasks(kind: &str, tasks: Vec<JoinHandle<()>>, budget: Duration) {
    let joined = timeout(budget, futures::future::join_all(tasks)).await;
    match joined {
        Ok(_) => debug!(kind, "all tasks joined"),
        Err(_) => warn!(kind, "timed out waiting for tasks; leaving them to finish"),
    }
}

async fn append_and_maybe_flush(
    shared: &Arc<Mutex<Shared>>,
    queue_tx: &mpsc::UnboundedSender<Bytes>,
    prefix: &[u8],
    sample: Sample,
    max_age: i64,
) {
    let (t, _) = sample;
    let record = render_record(prefix, sample);
    let mut guard = shared.lock().await;
    if guard.t_buffer.is_none() {
        guard.t_buffer = Some(t);
    }
    if let Err(err) = guard.buffer.write(&[&record]) {
        error!(%err, "buffer overflow appending sample");
        return;
    }
    let should_flush = guard.buffer.is_full()
        || guard
            .t_buffer
            .map(|t0| t - t0 > max_age)
            .unwrap_or(false);
    if should_flush {
        do_flush(&mut guard, queue_tx);
    }
}

async fn flush(shared: &Arc<Mutex<Shared>>, queue_tx: &mpsc::UnboundedSender<Bytes>) {
    let mut guard = shared.lock().await;
    if !guard.buffer.is_empty() {
        do_flush(&mut guard, queue_tx);
    }
}

fn do_flush(guard: &mut Shared, queue_tx: &mpsc::UnboundedSender<Bytes>) {
    guard.t_buffer = None;
    let batch = guard.buffer.take();
    let _ = queue_tx.send(batch);
}
