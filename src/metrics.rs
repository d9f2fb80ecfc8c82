// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Store --------
pub static STORE_COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("store_commands_total", "commands applied by the root store"),
        &["command"],
    )
    .unwrap()
});

pub static DISPLAY_TYPE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("grid_display_active", "1 for the grid currently displayed"),
        &["grid"],
    )
    .unwrap()
});

// -------- Fetch / coordinator --------
pub static FETCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("grid_fetches_total", "grid fetches by outcome (ok, error, cache_hit)"),
        &["grid", "outcome"],
    )
    .unwrap()
});

pub static STALE_RESPONSES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("grid_stale_responses_total", "responses dropped because a newer fetch was issued"),
        &["grid"],
    )
    .unwrap()
});

pub static FETCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("grid_fetch_latency_ms", "grid fetch latency (ms)"))
        .unwrap()
});

pub static ROWS_DISPLAYED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("grid_rows_displayed", "visible rows in the last published view"),
        &["grid"],
    )
    .unwrap()
});

// -------- Settings persistence --------
pub static SETTINGS_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("settings_writes_total", "settings writes (labels: kind, outcome)"),
        &["kind", "outcome"],
    )
    .unwrap()
});

pub static DEBOUNCE_DISCARDED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("debounce_discarded_total", "values superseded inside a debounce window"),
        &["debouncer"],
    )
    .unwrap()
});

pub static NOTIFICATIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("notifications_total", "user notifications raised").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(STORE_COMMANDS.clone())),
        REGISTRY.register(Box::new(DISPLAY_TYPE.clone())),
        REGISTRY.register(Box::new(FETCHES.clone())),
        REGISTRY.register(Box::new(STALE_RESPONSES.clone())),
        REGISTRY.register(Box::new(FETCH_LATENCY.clone())),
        REGISTRY.register(Box::new(ROWS_DISPLAYED.clone())),
        REGISTRY.register(Box::new(SETTINGS_WRITES.clone())),
        REGISTRY.register(Box::new(DEBOUNCE_DISCARDED.clone())),
        REGISTRY.register(Box::new(NOTIFICATIONS.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metrics: register failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, ?e, "metrics: bind failed, endpoint disabled");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics: accept error"),
            }
        }
    });
}
