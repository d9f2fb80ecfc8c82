// ===============================
// src/recorder.rs
// ===============================
//
// JSONL recorder untuk StoreEvent:
// - Satu baris per event: {"tsMs": .., "kind": .., "event": {..}} (append).
// - Bufer dengan BufWriter agar hemat syscall.
// - Flush periodik tiap 1s dan/atau tiap 1000 event.
// - Otomatis membuat parent directory jika belum ada.
// - Jika tulis gagal, coba reopen file dan lanjut; file tak bisa dibuka = recorder mati, app jalan terus.
//
// ENV: set `RECORD_FILE=/path/to/events.jsonl` agar aktif (lihat config.rs).
//
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{broadcast, broadcast::error::RecvError},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::StoreEvent;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Line<'a> {
    ts_ms: i64,
    kind: &'static str,
    event: &'a StoreEvent,
}

async fn open_writer(path: &str) -> Option<BufWriter<tokio::fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            error!(?e, %path, "recorder: open failed");
            None
        }
    }
}

fn encode(ev: &StoreEvent) -> Option<String> {
    let line = Line { ts_ms: Utc::now().timestamp_millis(), kind: ev.kind(), event: ev };
    match serde_json::to_string(&line) {
        Ok(s) => Some(s),
        Err(e) => {
            error!(?e, "recorder: serialize error, skip event");
            None
        }
    }
}

pub async fn run(mut rx: broadcast::Receiver<StoreEvent>, path: String) {
    let Some(mut writer) = open_writer(&path).await else {
        warn!(%path, "recorder: disabled");
        return;
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            res = rx.recv() => {
                let ev = match res {
                    Ok(ev) => ev,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "recorder: lagged, events lost");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        // Store selesai: flush dan keluar
                        let _ = writer.flush().await;
                        info!("recorder: store closed, stopped");
                        break;
                    }
                };
                let Some(mut line) = encode(&ev) else { continue };
                line.push('\n');

                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(?e, "recorder: write_all failed, attempting reopen");
                    // buang isi buffer lama, buka ulang, coba sekali lagi
                    match open_writer(&path).await {
                        Some(w) => writer = w,
                        None => continue,
                    }
                    if let Err(e2) = writer.write_all(line.as_bytes()).await {
                        error!(?e2, "recorder: write_all failed again after reopen, drop event");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GridType;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("portfolio_grid_{}_{}", std::process::id(), name))
    }

    #[tokio::test]
    async fn writes_one_line_per_event() {
        let dir = temp_path("rec");
        let path = dir.join("events.jsonl");
        let (tx, rx) = broadcast::channel(16);
        let task = tokio::spawn(run(rx, path.to_string_lossy().into_owned()));

        // let the recorder open its file before sending
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(StoreEvent::DisplayTypeChanged { from: GridType::Youland, to: GridType::CashFlow }).unwrap();
        tx.send(StoreEvent::SessionChanged { signed_in: false }).unwrap();
        drop(tx);
        task.await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "display_type");
        assert_eq!(lines[0]["event"]["DisplayTypeChanged"]["to"], "CASH_FLOW");
        assert!(lines[1]["tsMs"].as_i64().unwrap() > 0);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn unopenable_path_disables_recorder() {
        let blocker = temp_path("blocker");
        tokio::fs::write(&blocker, b"x").await.unwrap();
        // parent is a regular file, so open fails
        let path = blocker.join("events.jsonl");
        let (_tx, rx) = broadcast::channel::<StoreEvent>(4);
        run(rx, path.to_string_lossy().into_owned()).await;
        let _ = tokio::fs::remove_file(&blocker).await;
    }
}
