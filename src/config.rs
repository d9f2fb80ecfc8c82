// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : portfolio_grid — async state engine for loan portfolio grids
Module  : config.rs
Version : 0.3.0
License : MIT (see LICENSE)

Summary : Per-grid query conditions, column configuration and expanded
          groups held by a single-writer store; coordinators fetch and shape
          grid pages (mock or REST backend), settings are written back with a
          debounce, Prometheus metrics and an optional JSONL event log.
=============================================================================
*/
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use tokio::time::Duration;

use crate::domain::GridType;
use crate::query::DEFAULT_PAGE_SIZE;

/// Sumber data grid & tujuan penulisan setting
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendMode {
    Mock,
    Http,
}

fn parse_grid(s: &str) -> Result<GridType, String> {
    GridType::parse(s).ok_or_else(|| format!("unknown grid `{s}`"))
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("{v} is not within 0..=1"))
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "portfolio_grid", version, about = "Loan portfolio grid state engine")]
pub struct Args {
    // backend
    #[arg(long, env = "BACKEND_MODE", value_enum, default_value_t = BackendMode::Mock)]
    pub backend_mode: BackendMode,
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:8080/api")]
    pub api_base_url: String,
    /// Bearer token for the REST backend.
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    // grid behaviour
    #[arg(long, env = "DEBOUNCE_MS", default_value_t = 500)]
    pub debounce_ms: u64,
    #[arg(long, env = "PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub page_size: u32,
    #[arg(long, env = "DISPLAY_TYPE", default_value = "YOULAND", value_parser = parse_grid)]
    pub display_type: GridType,

    // files/metrics
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,

    // mock backend
    #[arg(long, env = "MOCK_LATENCY_MS", default_value_t = 120)]
    pub mock_latency_ms: u64,
    #[arg(long, env = "MOCK_FAIL_RATE", default_value_t = 0.0, value_parser = parse_rate)]
    pub mock_fail_rate: f64,
    #[arg(long, env = "MOCK_LOANS", default_value_t = 240)]
    pub mock_loans: usize,
    #[arg(long, env = "MOCK_SEED", default_value_t = 42)]
    pub mock_seed: u64,
}

impl Args {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// `.env` dulu, lalu flag CLI / env var.
pub fn load() -> Result<Args, clap::Error> {
    let _ = dotenv();
    Args::try_parse()
}
