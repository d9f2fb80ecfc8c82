// ===============================
// src/main.rs
// ===============================
/*
 # grid yang sedang tampil & hasil fetch
 curl -s localhost:9898/metrics | egrep '^grid_(display_active|fetches_total|stale_responses_total)'

 # penulisan setting (column width, group expanded, column order)
 curl -s localhost:9898/metrics | grep '^settings_writes_total'
*/
/*
=============================================================================
Project : portfolio_grid — async state engine for loan portfolio grids
Module  : main.rs
Version : 0.3.0
License : MIT (see LICENSE)

Summary : Per-grid query conditions, column configuration and expanded
          groups held by a single-writer store; coordinators fetch and shape
          grid pages (mock or REST backend), settings are written back with a
          debounce, Prometheus metrics and an optional JSONL event log.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod query;
mod columns;
mod store;
mod api;
mod debounce;
mod persistence;
mod coordinator;
mod backend;          // in-memory loan book (default)
mod backend_http;     // servicing REST API
mod forms;

use std::sync::Arc;

use ahash::AHashMap as HashMap;
use anyhow::Context;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{sleep, timeout, Duration},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{LogNavigator, LogNotifier, LoanApi, LoanDetailApi, Navigator, Notifier, SettingsApi};
use crate::config::BackendMode;
use crate::coordinator::{handle_row_click, Collaborators, GridCoordinator, GridView, ViewStatus};
use crate::domain::{ColumnDescriptor, GridState, GridType, SortDirection, SortItem, UserProfile, UserSession};
use crate::persistence::{FilterInput, Persistence};
use crate::query::{parse_lenient_date, DateRange, QueryUpdate};
use crate::store::{Command, RootStore};

type Views = HashMap<GridType, watch::Receiver<GridView>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let args = config::load().unwrap_or_else(|e| e.exit());

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        backend = ?args.backend_mode,
        api = %args.api_base_url,
        display_type = %args.display_type,
        page_size = args.page_size,
        debounce_ms = args.debounce_ms,
        "startup config"
    );

    // ---- Backend ----
    let (loans, settings, detail): (Arc<dyn LoanApi>, Arc<dyn SettingsApi>, Arc<dyn LoanDetailApi>) =
        match args.backend_mode {
            BackendMode::Mock => {
                let b = Arc::new(backend::MockBackend::new(
                    args.mock_seed,
                    args.mock_loans,
                    args.mock_latency_ms,
                    args.mock_fail_rate,
                ));
                let loans: Arc<dyn LoanApi> = b.clone();
                let settings: Arc<dyn SettingsApi> = b.clone();
                (loans, settings, b as Arc<dyn LoanDetailApi>)
            }
            BackendMode::Http => {
                let b = Arc::new(
                    backend_http::HttpBackend::new(&args.api_base_url, args.api_token.clone())
                        .with_context(|| format!("invalid API_BASE_URL `{}`", args.api_base_url))?,
                );
                let loans: Arc<dyn LoanApi> = b.clone();
                let settings: Arc<dyn SettingsApi> = b.clone();
                (loans, settings, b as Arc<dyn LoanDetailApi>)
            }
        };
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let navigator = LogNavigator;

    // ---- Store (subscribe everything before it starts publishing) ----
    let store = RootStore::new(args.page_size, args.display_type);
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(1024);

    let mut views: Views = HashMap::new();
    for grid in GridType::ALL {
        let initial = store
            .grid(grid)
            .cloned()
            .unwrap_or_else(|| GridState::new(grid, args.page_size));
        let (coord, view) = GridCoordinator::new(
            grid,
            columns::default_columns(grid),
            Collaborators { api: loans.clone(), notifier: notifier.clone() },
            initial,
            args.page_size,
            grid == store.display_type(),
        );
        views.insert(grid, view);
        tokio::spawn(coord.run(store.subscribe()));
    }

    tokio::spawn(Persistence::new(settings, notifier.clone(), args.debounce()).run(store.subscribe()));

    // ---- Recorder (optional) ----
    if let Some(path) = args.record_file.clone() {
        tokio::spawn(recorder::run(store.subscribe(), path));
    }

    let mut heartbeat_rx = store.subscribe();
    tokio::spawn(store::run(store, cmd_rx));

    // ---- Scripted session ----
    tokio::spawn({
        let cmd_tx = cmd_tx.clone();
        let views = views.clone();
        let start = args.display_type;
        let delay = args.debounce();
        let notifier = notifier.clone();
        async move {
            if let Err(e) = demo_session(cmd_tx, views, start, delay, &navigator, detail, notifier).await {
                warn!(error = %e, "demo session aborted");
            }
        }
    });

    // ---- Heartbeat ----
    let mut events: u64 = 0;
    let mut shown = args.display_type;
    loop {
        select! {
            Ok(ev) = heartbeat_rx.recv() => {
                events += 1;
                if let domain::StoreEvent::DisplayTypeChanged { to, .. } | domain::StoreEvent::Reset { display_type: to } = ev {
                    shown = to;
                }
            },
            _ = sleep(Duration::from_secs(5)) => {
                if let Some(v) = views.get(&shown) {
                    let v = v.borrow();
                    info!(grid = %shown, status = ?v.status, rows = v.visible_rows().len(),
                          total = ?v.footer.total_items, events, "heartbeat");
                }
                events = 0;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c, shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn wait_ready(views: &Views, grid: GridType) -> anyhow::Result<GridView> {
    let mut rx = views.get(&grid).cloned().context("no view for grid")?;
    let ready = async {
        loop {
            {
                let v = rx.borrow_and_update();
                if matches!(v.status, ViewStatus::Ready | ViewStatus::Stale | ViewStatus::Empty { .. }) {
                    return Ok(v.clone());
                }
            }
            if rx.changed().await.is_err() {
                anyhow::bail!("view channel closed");
            }
        }
    };
    timeout(Duration::from_secs(10), ready).await.context("view not ready in time")?
}

/// Sign in, type a filter, sort, resize, switch grid, click rows and edit
/// one loan.
async fn demo_session(
    cmd: mpsc::Sender<Command>,
    views: Views,
    start: GridType,
    delay: Duration,
    navigator: &dyn Navigator,
    detail: Arc<dyn LoanDetailApi>,
    notifier: Arc<dyn Notifier>,
) -> anyhow::Result<()> {
    cmd.send(Command::InjectSession(UserSession {
        access_token: "demo-access".into(),
        refresh_token: "demo-refresh".into(),
    }))
    .await?;
    cmd.send(Command::InjectProfile(UserProfile {
        user_id: "u-1".into(),
        name: "Demo User".into(),
        email: "demo@example.com".into(),
    }))
    .await?;

    // stored column settings as the settings endpoint would hand them back
    let mut stored: Vec<ColumnDescriptor> = columns::default_columns(start)
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let mut d = ColumnDescriptor::new(b.field.clone(), b.header_name.clone());
            d.order = Some(i as i32);
            d
        })
        .collect();
    if let Some(d) = stored.iter_mut().find(|d| d.field == "submitDate") {
        d.visibility = false;
    }
    cmd.send(Command::UpdateOrderColumns { grid: start, columns: stored }).await?;

    let v = wait_ready(&views, start).await?;
    info!(grid = %start, rows = v.rows.len(), columns = ?v.column_order, "demo: first page");

    // typing in the search box
    let mut filters = FilterInput::new(start, delay, cmd.clone());
    for kw in ["o", "oa", "oak"] {
        filters.update(QueryUpdate::Keyword(kw.into()));
        sleep(Duration::from_millis(80)).await;
    }
    filters.update_date_range(DateRange { start_date: String::new(), end_date: String::new() });
    sleep(delay + Duration::from_millis(200)).await;

    cmd.send(Command::UpdateSort {
        grid: start,
        items: vec![SortItem {
            property: "totalLoanAmount".into(),
            direction: SortDirection::Desc,
            label: "Loan amount".into(),
        }],
    })
    .await?;
    cmd.send(Command::ToggleSort { grid: start }).await?;

    for w in [180.0, 200.0, 240.0] {
        cmd.send(Command::SetColumnWidth { grid: start, field: "investor".into(), width: w }).await?;
        sleep(Duration::from_millis(60)).await;
    }
    cmd.send(Command::PinColumn { grid: start, field: "propertyAddress".into(), pin: domain::PinType::Left })
        .await?;
    sleep(delay + Duration::from_millis(200)).await;

    // grouped grid: expand the first group, then open one of its loans
    let grouped = GridType::ByInvestor;
    cmd.send(Command::SetDisplayType(grouped)).await?;
    let v = wait_ready(&views, grouped).await?;
    info!(groups = v.rows.len(), "demo: investor groups");
    if let Some(group) = v.rows.iter().find(|r| r.is_group) {
        let outcome = handle_row_click(&v, &group.id, navigator, &cmd).await;
        info!(?outcome, "demo: group click");
        if let Some(child) = group.children.first() {
            let outcome = handle_row_click(&v, &child.id, navigator, &cmd).await;
            info!(?outcome, "demo: loan click");
        }
    }
    cmd.send(Command::ExpandAll { grid: grouped, group_ids: v.group_ids(), collapsed: false }).await?;
    sleep(delay + Duration::from_millis(200)).await;

    // loan detail screens; invalid forms are stopped before the backend
    let loan_id = 100_001;
    let today = chrono::Utc::now().date_naive();
    let (detail, notes) = (detail.as_ref(), notifier.as_ref());

    let aom = forms::AomForm { loan_id, recorded_date: Some(today.to_string()), ..Default::default() };
    let _ = forms::submit_aom(&aom, detail, notes).await;
    let buyer = match detail.fetch_aom_investors().await {
        Ok(list) => list.into_iter().next().map(|o| (o.value, o.label)),
        Err(e) => {
            notes.notify(e.notification());
            None
        }
    };
    let aom = forms::AomForm { instrument_number: Some("INS-2024-0042".into()), investor: buyer, ..aom };
    let maturity = match forms::submit_aom(&aom, detail, notes).await {
        Ok(card) => {
            info!(loan_id, instrument = ?card.instrument_number, "demo: aom generated");
            card.maturity_date.as_deref().and_then(parse_lenient_date).unwrap_or(today)
        }
        Err(_) => today,
    };

    let current_due = match detail.fetch_current_bill(loan_id).await {
        Ok(bills) => forms::current_due_date(&bills).unwrap_or(today),
        Err(e) => {
            notes.notify(e.notification());
            today
        }
    };
    let payment = forms::PaymentForm {
        loan_id,
        date_received: Some(today.to_string()),
        payment_method: Some(forms::PaymentMethod::Ach),
        total_payment: Some(2_450.0),
        ..Default::default()
    };
    if let Ok(history) = forms::submit_payment(&payment, current_due, detail, notes).await {
        info!(loan_id, entries = history.total_item, total = history.accumulate_total_pmt, "demo: payment saved");
        // server rows changed under the grid
        cmd.send(Command::Invalidate { grid: grouped }).await?;
    }

    let extension = forms::ExtensionForm {
        loan_id,
        new_maturity_date: Some("2020-01-01".into()),
        extension_fee: Some(1.0),
    };
    let _ = forms::submit_extension(&extension, maturity, detail, notes).await;
    let extension = forms::ExtensionForm {
        new_maturity_date: Some((maturity + chrono::Duration::days(90)).to_string()),
        ..extension
    };
    let _ = forms::submit_extension(&extension, maturity, detail, notes).await;

    info!("demo: session finished");
    Ok(())
}
