// ===============================
// src/recorder.rs
// ===============================
//
// Journal JSONL untuk audit eksekusi:
// - Setiap intake, outcome, dan event order stream ditulis satu baris (append).
// - BufWriter, flush tiap 1s atau tiap 100 event.
// - Parent directory dibuat otomatis.
// - Tulis gagal -> reopen file sekali lalu lanjut.
//
// ENV: set `RECORD_FILE=/path/to/journal.jsonl` agar aktif (lihat main.rs).
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::JournalEvent;

const FLUSH_EVERY_N_EVENTS: u32 = 100;

/// Cheap clonable handle. A disabled journal drops everything.
#[derive(Clone, Default)]
pub struct Journal {
    tx: Option<mpsc::Sender<JournalEvent>>,
}

impl Journal {
    pub fn new(tx: mpsc::Sender<JournalEvent>) -> Self { Self { tx: Some(tx) } }

    pub fn disabled() -> Self { Self::default() }

    /// Never blocks the caller; a full channel drops the event.
    pub fn record(&self, ev: JournalEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(ev) {
                warn!(error = %e, "journal: event dropped");
            }
        }
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<JournalEvent>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, journal disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "recorder: write failed again after reopen, drop event");
                        continue;
                    }
                }
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}
