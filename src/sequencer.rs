// ===============================
// src/sequencer.rs (per-symbol FIFO)
// ===============================
//
// Satu worker per symbol: task untuk symbol yang sama jalan berurutan,
// symbol berbeda jalan paralel. Worker berhenti sendiri setelah idle dan
// keluar dari map di bawah lock yang sama dengan enqueue, jadi tidak ada
// task yang tertinggal di queue yatim.
//
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::metrics::SEQUENCER_WORKERS;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub const DEFAULT_IDLE: Duration = Duration::from_secs(30);

struct Inner {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    idle: Duration,
}

#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<Inner>,
}

impl Default for Sequencer {
    fn default() -> Self { Self::new(DEFAULT_IDLE) }
}

impl Sequencer {
    pub fn new(idle: Duration) -> Self {
        Self { inner: Arc::new(Inner { queues: Mutex::new(HashMap::new()), idle }) }
    }

    /// Queue `task` behind everything already queued for `symbol`. Returns immediately.
    pub fn enqueue<F>(&self, symbol: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut job: Job = Box::pin(task);
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = queues.get(symbol) {
            match tx.send(job) {
                Ok(()) => return,
                // worker already gone; start a fresh one below
                Err(mpsc::error::SendError(j)) => job = j,
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            return;
        }
        queues.insert(symbol.to_string(), tx);
        drop(queues);
        tokio::spawn(worker(self.inner.clone(), symbol.to_string(), rx));
    }

    pub fn active_workers(&self) -> usize {
        self.inner.queues.lock().map(|q| q.len()).unwrap_or_default()
    }
}

async fn run_job(symbol: &str, job: Job) {
    // Own task so a panic is contained and the queue keeps draining.
    if let Err(e) = tokio::spawn(job).await {
        error!(%symbol, error = %e, "sequencer: task aborted");
    }
}

async fn worker(inner: Arc<Inner>, symbol: String, mut rx: mpsc::UnboundedReceiver<Job>) {
    SEQUENCER_WORKERS.inc();
    debug!(%symbol, "sequencer: worker started");
    loop {
        match tokio::time::timeout(inner.idle, rx.recv()).await {
            Ok(Some(job)) => run_job(&symbol, job).await,
            Ok(None) => break,
            Err(_) => {
                let next = {
                    let mut queues = inner.queues.lock().unwrap_or_else(|e| e.into_inner());
                    match rx.try_recv() {
                        Ok(job) => Some(job),
                        Err(_) => {
                            queues.remove(&symbol);
                            None
                        }
                    }
                };
                match next {
                    Some(job) => run_job(&symbol, job).await,
                    None => break,
                }
            }
        }
    }
    SEQUENCER_WORKERS.dec();
    debug!(%symbol, "sequencer: worker retired");
}
