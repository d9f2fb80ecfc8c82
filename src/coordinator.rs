// ===============================
// src/coordinator.rs (grid display coordinator)
// ===============================
//
// One task per grid. Listens to store events, keeps a private copy of its
// grid's state, fetches rows while its grid is the one displayed and
// publishes a `GridView` on a watch channel.
//
// - fetch key = grid + serialized payload; successful pages are cached per key
//   (bounded, least recently shown goes first)
// - a cache hit is shown at once and fetched again in the background
// - every fetch carries a token; only the newest token may touch the view
// - logout starts a new session; answers from an older session are dropped
// - fetch errors notify and keep the previous rows (or the empty state)
//
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap as HashMap;
use serde::Serialize;
use tokio::sync::{broadcast, broadcast::error::RecvError, mpsc, watch};
use tracing::{debug, info, warn};

use crate::api::{ApiError, LoanApi, Navigator, Notifier};
use crate::columns::{column_order_keys, BaseColumn, ResolvedColumn};
use crate::domain::{
    ExpandedGroupEntry, Footer, GridPage, GridState, GridType, PageInfo, Row, SelectOption,
    StoreEvent,
};
use crate::metrics::{DISPLAY_TYPE, FETCHES, FETCH_LATENCY, NOTIFICATIONS, ROWS_DISPLAYED, STALE_RESPONSES};
use crate::query::FetchKey;
use crate::store::Command;

pub const LOAN_OVERVIEW_PATH: &str = "/loan/overview";
pub const CACHE_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ViewStatus {
    /// Grid is not the displayed one; nothing fetched.
    Idle,
    Loading,
    Ready,
    /// Last fetch failed, previous rows kept.
    Stale,
    /// Last fetch failed and there is nothing to show.
    Empty { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayRow {
    pub id: String,
    /// Server loan id; `None` for groups and rows that came without one.
    pub loan_id: Option<String>,
    pub is_group: bool,
    pub expanded: bool,
    /// Row fields without the `servicingLoans` children.
    pub data: Row,
    pub children: Vec<DisplayRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridView {
    pub grid: GridType,
    pub status: ViewStatus,
    pub columns: Vec<ResolvedColumn>,
    pub column_order: Vec<String>,
    pub rows: Vec<DisplayRow>,
    pub page: PageInfo,
    pub footer: Footer,
    pub empty_message: &'static str,
    pub status_options: Vec<SelectOption>,
    pub investor_options: Vec<SelectOption>,
}

impl GridView {
    fn idle(grid: GridType) -> Self {
        Self {
            grid,
            status: ViewStatus::Idle,
            columns: Vec::new(),
            column_order: Vec::new(),
            rows: Vec::new(),
            page: PageInfo::default(),
            footer: Footer::default(),
            empty_message: grid.empty_message(),
            status_options: Vec::new(),
            investor_options: Vec::new(),
        }
    }

    /// Rows in render order: groups, then their children if expanded.
    pub fn visible_rows(&self) -> Vec<&DisplayRow> {
        let mut out = Vec::new();
        for r in &self.rows {
            out.push(r);
            if r.expanded {
                out.extend(r.children.iter());
            }
        }
        out
    }

    pub fn find_row(&self, id: &str) -> Option<&DisplayRow> {
        self.rows
            .iter()
            .find_map(|r| if r.id == id { Some(r) } else { r.children.iter().find(|c| c.id == id) })
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.rows.iter().filter(|r| r.is_group).map(|r| r.id.clone()).collect()
    }
}

/// Build the display tree. Group rows use `groupById`, leaves `loanId`;
/// rows with neither get a positional id.
pub fn build_display_tree(rows: &[Row], expanded: &[ExpandedGroupEntry]) -> Vec<DisplayRow> {
    let is_expanded = |id: &str| expanded.iter().any(|e| e.group_id == id && !e.collapsed);
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            if row.is_group() {
                let id = row.group_key().unwrap_or_else(|| format!("group-{i}"));
                let children = row
                    .servicing_loans
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .enumerate()
                    .map(|(j, c)| leaf(c, format!("{id}-{j}")))
                    .collect();
                let mut data = row.clone();
                data.servicing_loans = None;
                DisplayRow { expanded: is_expanded(&id), id, loan_id: None, is_group: true, data, children }
            } else {
                leaf(row, format!("row-{i}"))
            }
        })
        .collect()
}

fn leaf(row: &Row, fallback: String) -> DisplayRow {
    let loan_id = row.loan_key();
    DisplayRow {
        id: loan_id.clone().unwrap_or(fallback),
        loan_id,
        is_group: false,
        expanded: false,
        data: row.clone(),
        children: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    Navigated { loan_id: String },
    ToggledGroup { group_id: String },
}

/// Leaf rows open the loan overview; group rows toggle their expansion.
/// A leaf without a server loan id goes nowhere.
pub async fn handle_row_click(
    view: &GridView,
    row_id: &str,
    navigator: &dyn Navigator,
    commands: &mpsc::Sender<Command>,
) -> Option<ClickOutcome> {
    let row = view.find_row(row_id)?;
    if row.is_group {
        let cmd = Command::ToggleGroup { grid: view.grid, group_id: row.id.clone() };
        if commands.send(cmd).await.is_err() {
            warn!(grid = %view.grid, "click: store is gone");
        }
        return Some(ClickOutcome::ToggledGroup { group_id: row.id.clone() });
    }
    let Some(loan_id) = row.loan_id.clone() else {
        debug!(grid = %view.grid, row = %row.id, "click: row has no loan id");
        return None;
    };
    navigator.navigate_to(LOAN_OVERVIEW_PATH, &[("loanId", loan_id.clone())]).await;
    Some(ClickOutcome::Navigated { loan_id })
}

#[derive(Debug)]
enum FetchDone {
    Page { session: u64, token: u64, key: FetchKey, result: Result<GridPage, ApiError> },
    Reference {
        session: u64,
        statuses: Result<Vec<SelectOption>, ApiError>,
        investors: Result<Vec<SelectOption>, ApiError>,
    },
}

#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn LoanApi>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct GridCoordinator {
    grid: GridType,
    base_columns: Vec<BaseColumn>,
    api: Arc<dyn LoanApi>,
    notifier: Arc<dyn Notifier>,
    active: bool,
    state: GridState,
    page_size: u32,
    cache: HashMap<FetchKey, GridPage>,
    cache_order: VecDeque<FetchKey>,
    current_key: Option<FetchKey>,
    current_token: u64,
    session: u64,
    last_page: Option<GridPage>,
    status: ViewStatus,
    status_options: Vec<SelectOption>,
    investor_options: Vec<SelectOption>,
    view_tx: watch::Sender<GridView>,
    done_tx: mpsc::Sender<FetchDone>,
    done_rx: Option<mpsc::Receiver<FetchDone>>,
}

impl GridCoordinator {
    pub fn new(
        grid: GridType,
        base_columns: Vec<BaseColumn>,
        collab: Collaborators,
        initial: GridState,
        page_size: u32,
        active: bool,
    ) -> (Self, watch::Receiver<GridView>) {
        let (view_tx, view_rx) = watch::channel(GridView::idle(grid));
        let (done_tx, done_rx) = mpsc::channel(64);
        let c = Self {
            grid,
            base_columns,
            api: collab.api,
            notifier: collab.notifier,
            active,
            state: initial,
            page_size,
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            current_key: None,
            current_token: 0,
            session: 0,
            last_page: None,
            status: ViewStatus::Idle,
            status_options: Vec::new(),
            investor_options: Vec::new(),
            view_tx,
            done_tx,
            done_rx: Some(done_rx),
        };
        (c, view_rx)
    }

    fn notify(&self, err: &ApiError) {
        NOTIFICATIONS.inc();
        self.notifier.notify(err.notification());
    }

    /// Insert or refresh `key`, evicting the least recently used entry.
    fn cache_put(&mut self, key: FetchKey, page: GridPage) {
        self.touch(&key);
        self.cache.insert(key, page);
        while self.cache.len() > CACHE_CAPACITY {
            let Some(old) = self.cache_order.pop_front() else { break };
            self.cache.remove(&old);
        }
    }

    fn touch(&mut self, key: &FetchKey) {
        if let Some(i) = self.cache_order.iter().position(|k| k == key) {
            self.cache_order.remove(i);
        }
        self.cache_order.push_back(key.clone());
    }

    fn clear_cache(&mut self) {
        self.cache.clear();
        self.cache_order.clear();
    }

    fn on_event(&mut self, ev: &StoreEvent) {
        match ev {
            StoreEvent::QueryChanged { grid, query } if *grid == self.grid => {
                self.state.query = query.clone();
                if self.active {
                    self.refresh();
                }
            }
            StoreEvent::ColumnsChanged { grid, columns } if *grid == self.grid => {
                // the store already validated this sequence
                if let Err(e) = self.state.columns.update_order_columns(columns.clone()) {
                    warn!(grid = %self.grid, error = %e, "coordinator: column snapshot rejected");
                }
                self.publish();
            }
            StoreEvent::ColumnWidthChanged { grid, widths } if *grid == self.grid => {
                for w in widths {
                    if let Err(e) = self.state.columns.set_width(&w.field, w.column_width) {
                        warn!(grid = %self.grid, error = %e, "coordinator: width rejected");
                    }
                }
                self.publish();
            }
            StoreEvent::ExpansionChanged { grid, expanded } if *grid == self.grid => {
                self.state.expanded = expanded.clone();
                self.publish();
            }
            StoreEvent::DisplayTypeChanged { to, .. } => self.set_active(*to == self.grid),
            StoreEvent::Invalidated { grid } if *grid == self.grid => {
                debug!(grid = %self.grid, entries = self.cache.len(), "coordinator: cache invalidated");
                self.clear_cache();
                if self.active {
                    self.refresh();
                }
            }
            StoreEvent::Reset { display_type } => {
                self.state = GridState::new(self.grid, self.page_size);
                self.clear_cache();
                self.current_key = None;
                self.last_page = None;
                self.status_options.clear();
                self.investor_options.clear();
                // anything still in flight belongs to the old session
                self.session += 1;
                self.current_token += 1;
                self.status = ViewStatus::Idle;
                self.active = false;
                self.set_active(*display_type == self.grid);
                DISPLAY_TYPE.with_label_values(&[self.grid.as_str()]).set(self.active as i64);
                self.publish();
            }
            _ => {}
        }
    }

    fn set_active(&mut self, active: bool) {
        if active == self.active {
            return;
        }
        self.active = active;
        DISPLAY_TYPE.with_label_values(&[self.grid.as_str()]).set(active as i64);
        if active {
            info!(grid = %self.grid, "coordinator: mounted");
            self.load_reference_data();
            self.refresh();
        } else {
            debug!(grid = %self.grid, "coordinator: unmounted");
            self.status = ViewStatus::Idle;
            self.publish();
        }
    }

    fn load_reference_data(&self) {
        let api = self.api.clone();
        let tx = self.done_tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            let (statuses, investors) =
                futures_util::future::join(api.fetch_repayment_statuses(), api.fetch_investors()).await;
            let _ = tx.send(FetchDone::Reference { session, statuses, investors }).await;
        });
    }

    /// Recompute the fetch key and fetch it. A cached page for the key is
    /// shown while the fetch runs.
    fn refresh(&mut self) {
        let payload = self.state.query.fetch_payload(self.grid);
        let key = match payload.key(self.grid) {
            Ok(k) => k,
            Err(e) => {
                warn!(grid = %self.grid, ?e, "coordinator: payload not serializable");
                return;
            }
        };
        self.current_token += 1;
        let token = self.current_token;
        self.current_key = Some(key.clone());

        if let Some(page) = self.cache.get(&key).cloned() {
            FETCHES.with_label_values(&[self.grid.as_str(), "cache_hit"]).inc();
            debug!(grid = %self.grid, key = %key.fingerprint(), token, "coordinator: cache hit, revalidating");
            self.touch(&key);
            self.last_page = Some(page);
            self.status = ViewStatus::Ready;
        } else {
            debug!(grid = %self.grid, key = %key.fingerprint(), token, "coordinator: fetch");
            self.status = ViewStatus::Loading;
        }
        self.publish();

        let api = self.api.clone();
        let tx = self.done_tx.clone();
        let grid = self.grid;
        let session = self.session;
        tokio::spawn(async move {
            let started = Instant::now();
            let result = api.fetch_grid(grid, payload).await;
            FETCH_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);
            let _ = tx.send(FetchDone::Page { session, token, key, result }).await;
        });
    }

    fn on_fetch_done(&mut self, done: FetchDone) {
        match done {
            FetchDone::Page { session, token, .. } if session != self.session => {
                STALE_RESPONSES.with_label_values(&[self.grid.as_str()]).inc();
                debug!(grid = %self.grid, token, "coordinator: answer from before logout dropped");
            }
            FetchDone::Page { token, key, result, .. } => {
                let fresh = token == self.current_token;
                match result {
                    Ok(page) => {
                        FETCHES.with_label_values(&[self.grid.as_str(), "ok"]).inc();
                        if !fresh {
                            STALE_RESPONSES.with_label_values(&[self.grid.as_str()]).inc();
                            debug!(grid = %self.grid, token, current = self.current_token, "coordinator: stale response dropped");
                            // still a valid answer for its own key
                            self.cache_put(key, page);
                            return;
                        }
                        self.cache_put(key, page.clone());
                        self.last_page = Some(page);
                        self.status = ViewStatus::Ready;
                    }
                    Err(e) => {
                        FETCHES.with_label_values(&[self.grid.as_str(), "error"]).inc();
                        if !fresh {
                            STALE_RESPONSES.with_label_values(&[self.grid.as_str()]).inc();
                            debug!(grid = %self.grid, error = %e, "coordinator: stale failure ignored");
                            return;
                        }
                        warn!(grid = %self.grid, error = %e, "coordinator: fetch failed");
                        self.notify(&e);
                        self.status = if self.last_page.is_some() {
                            ViewStatus::Stale
                        } else {
                            ViewStatus::Empty { message: self.grid.empty_message().to_string() }
                        };
                    }
                }
                self.publish();
            }
            FetchDone::Reference { session, .. } if session != self.session => {
                debug!(grid = %self.grid, "coordinator: reference data from before logout dropped");
            }
            FetchDone::Reference { statuses, investors, .. } => {
                match statuses {
                    Ok(v) => self.status_options = v,
                    Err(e) => {
                        warn!(grid = %self.grid, error = %e, "coordinator: status options failed");
                        self.notify(&e);
                    }
                }
                match investors {
                    Ok(v) => self.investor_options = v,
                    Err(e) => {
                        warn!(grid = %self.grid, error = %e, "coordinator: investor list failed");
                        self.notify(&e);
                    }
                }
                if self.active {
                    self.publish();
                }
            }
        }
    }

    fn build_view(&self) -> GridView {
        let columns = self.state.columns.resolve(&self.base_columns);
        let column_order = column_order_keys(&columns, self.grid.is_grouped());
        let (rows, page, footer) = match &self.last_page {
            Some(p) => (build_display_tree(&p.content, &self.state.expanded), p.page.clone(), Footer::from(p)),
            None => (Vec::new(), PageInfo::default(), Footer::default()),
        };
        GridView {
            grid: self.grid,
            status: self.status.clone(),
            columns,
            column_order,
            rows,
            page,
            footer,
            empty_message: self.grid.empty_message(),
            status_options: self.status_options.clone(),
            investor_options: self.investor_options.clone(),
        }
    }

    fn publish(&self) {
        let view = self.build_view();
        ROWS_DISPLAYED
            .with_label_values(&[self.grid.as_str()])
            .set(view.visible_rows().len() as i64);
        self.view_tx.send_replace(view);
    }

    pub async fn run(mut self, mut events: broadcast::Receiver<StoreEvent>) {
        let Some(mut done_rx) = self.done_rx.take() else {
            warn!(grid = %self.grid, "coordinator: already running");
            return;
        };
        DISPLAY_TYPE.with_label_values(&[self.grid.as_str()]).set(self.active as i64);
        if self.active {
            self.load_reference_data();
            self.refresh();
        } else {
            self.publish();
        }

        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Ok(ev) => self.on_event(&ev),
                    Err(RecvError::Lagged(n)) => {
                        warn!(grid = %self.grid, skipped = n, "coordinator: lagged behind store events");
                    }
                    Err(RecvError::Closed) => {
                        info!(grid = %self.grid, "coordinator: store closed, stopped");
                        break;
                    }
                },
                Some(done) = done_rx.recv() => self.on_fetch_done(done),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::ColumnConfig;
    use crate::domain::{ColumnDescriptor, ColumnWidth, Notification, Variant};
    use crate::query::QueryUpdate;
    use crate::store::RootStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout, Duration};

    fn row(v: Value) -> Row {
        serde_json::from_value(v).unwrap()
    }

    fn page_of(rows: Vec<Row>) -> GridPage {
        GridPage { content: rows, total_items: Some(7), total_loan_amount: Some(99.5), ..Default::default() }
    }

    /// Scripted backend: answers by keyword, optional per-keyword delay/failure.
    /// Every row carries `rev`, the number of grid calls so far.
    #[derive(Default)]
    struct ScriptedApi {
        calls: Mutex<Vec<String>>,
        delays: Mutex<HashMap<String, u64>>,
        failing: Mutex<Vec<String>>,
        gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
        /// Consumed in order by status-list loads.
        reference_gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
    }

    impl ScriptedApi {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LoanApi for ScriptedApi {
        async fn fetch_grid(&self, _grid: GridType, payload: crate::query::FetchPayload) -> Result<GridPage, ApiError> {
            let kw = payload.search_condition.keyword.clone();
            let rev = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(kw.clone());
                calls.len()
            };
            let gate = self.gates.lock().unwrap().remove(&kw);
            if let Some(g) = gate {
                let _ = g.await;
            }
            let delay = self.delays.lock().unwrap().get(&kw).copied();
            if let Some(ms) = delay {
                sleep(Duration::from_millis(ms)).await;
            }
            if self.failing.lock().unwrap().contains(&kw) {
                return Err(ApiError::Server {
                    status: 500,
                    message: format!("boom {kw}"),
                    header: Some("Grid".into()),
                    variant: Variant::Error,
                });
            }
            Ok(page_of(vec![row(json!({"loanId": format!("loan-{kw}"), "rev": rev}))]))
        }
        async fn fetch_repayment_statuses(&self) -> Result<Vec<SelectOption>, ApiError> {
            let gate = self.reference_gates.lock().unwrap().pop_front();
            if let Some(g) = gate {
                let _ = g.await;
            }
            Ok(vec![SelectOption { label: "Current".into(), value: "CURRENT".into() }])
        }
        async fn fetch_investors(&self) -> Result<Vec<SelectOption>, ApiError> {
            Err(ApiError::Transport("investors down".into()))
        }
    }

    #[derive(Default)]
    struct CollectNotifier(Mutex<Vec<Notification>>);

    impl Notifier for CollectNotifier {
        fn notify(&self, n: Notification) {
            self.0.lock().unwrap().push(n);
        }
    }

    struct Harness {
        store: RootStore,
        api: Arc<ScriptedApi>,
        notes: Arc<CollectNotifier>,
        view: watch::Receiver<GridView>,
    }

    fn harness(grid: GridType, active: bool) -> Harness {
        let store = RootStore::new(50, if active { grid } else { GridType::Youland });
        let api = Arc::new(ScriptedApi::default());
        let notes = Arc::new(CollectNotifier::default());
        let collab = Collaborators { api: api.clone(), notifier: notes.clone() };
        let initial = store.grid(grid).cloned().unwrap();
        let (coord, view) = GridCoordinator::new(
            grid,
            vec![BaseColumn::new("loanId", "Loan", None), BaseColumn::new("investor", "Investor", None)],
            collab,
            initial,
            50,
            active,
        );
        tokio::spawn(coord.run(store.subscribe()));
        Harness { store, api, notes, view }
    }

    async fn wait_calls(api: &ScriptedApi, n: usize) {
        timeout(Duration::from_secs(5), async {
            while api.calls().len() < n {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("grid fetches not issued");
    }

    fn rev(v: &GridView) -> u64 {
        v.rows.first().and_then(|r| r.data.fields.get("rev")).and_then(Value::as_u64).unwrap_or(0)
    }

    async fn wait_for<F: Fn(&GridView) -> bool>(view: &mut watch::Receiver<GridView>, pred: F) -> GridView {
        timeout(Duration::from_secs(30), async {
            loop {
                {
                    let v = view.borrow_and_update();
                    if pred(&v) {
                        return v.clone();
                    }
                }
                if view.changed().await.is_err() {
                    panic!("view channel closed");
                }
            }
        })
        .await
        .expect("view condition not reached")
    }

    #[test]
    fn group_children_follow_expansion_entry() {
        let rows = vec![row(json!({
            "groupById": "G1",
            "servicingLoans": [{"loanId": 1}, {"loanId": 2}]
        }))];
        let view_with = |expanded: Vec<ExpandedGroupEntry>| {
            let mut v = GridView::idle(GridType::ByInvestor);
            v.rows = build_display_tree(&rows, &expanded);
            v
        };

        let open = view_with(vec![ExpandedGroupEntry { group_id: "G1".into(), collapsed: false }]);
        let ids: Vec<_> = open.visible_rows().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["G1", "1", "2"]);
        assert!(open.rows[0].data.servicing_loans.is_none());

        let closed = view_with(vec![ExpandedGroupEntry { group_id: "G1".into(), collapsed: true }]);
        assert_eq!(closed.visible_rows().len(), 1);

        let absent = view_with(vec![]);
        assert_eq!(absent.visible_rows().len(), 1);
        assert_eq!(absent.group_ids(), vec!["G1".to_string()]);
    }

    #[test]
    fn flat_rows_use_loan_id_or_position() {
        let rows = vec![row(json!({"loanId": 42, "investor": "A"})), row(json!({"investor": "B"}))];
        let tree = build_display_tree(&rows, &[]);
        assert_eq!(tree[0].id, "42");
        assert!(!tree[0].is_group);
        assert_eq!(tree[1].id, "row-1");
        assert_eq!(tree[0].loan_id.as_deref(), Some("42"));
        assert_eq!(tree[1].loan_id, None);
    }

    #[tokio::test]
    async fn active_grid_fetches_and_passes_footer_through() {
        let mut h = harness(GridType::AllLoans, true);
        let v = wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && !v.status_options.is_empty()).await;
        assert_eq!(v.rows[0].id, "loan-");
        assert_eq!(v.footer.total_items, Some(7));
        assert_eq!(v.footer.total_loan_amount, Some(99.5));
        assert_eq!(v.column_order, vec!["loanId", "investor"]);
        assert_eq!(v.status_options.len(), 1);
        // investor list failed: notified, options stay empty
        let v = wait_for(&mut h.view, |_| !h.notes.0.lock().unwrap().is_empty()).await;
        assert!(v.investor_options.is_empty());
    }

    #[tokio::test]
    async fn inactive_grid_does_not_fetch_until_displayed() {
        let mut h = harness(GridType::CashFlow, false);
        sleep(Duration::from_millis(50)).await;
        assert!(h.api.calls().is_empty());
        assert_eq!(h.view.borrow().status, ViewStatus::Idle);

        h.store.apply(Command::SetDisplayType(GridType::CashFlow));
        let v = wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        assert_eq!(v.column_order[0], crate::columns::EXPAND_COLUMN);
        assert_eq!(h.api.calls().len(), 1);
    }

    #[tokio::test]
    async fn cached_key_is_shown_then_refetched() {
        let mut h = harness(GridType::AllLoans, true);
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        let g = GridType::AllLoans;
        h.store.apply(Command::UpdateQuery { grid: g, update: QueryUpdate::Keyword("oak".into()) });
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && v.rows[0].id == "loan-oak").await;

        // hold the refetch so the cached page is what the view shows meanwhile
        let (release, gate) = oneshot::channel();
        h.api.gates.lock().unwrap().insert(String::new(), gate);
        h.store.apply(Command::UpdateQuery { grid: g, update: QueryUpdate::Keyword(String::new()) });
        let v = wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && v.rows[0].id == "loan-").await;
        assert_eq!(rev(&v), 1);

        release.send(()).unwrap();
        wait_for(&mut h.view, |v| rev(v) == 3).await;
        assert_eq!(h.api.calls(), vec!["".to_string(), "oak".to_string(), "".to_string()]);
    }

    #[tokio::test]
    async fn returning_to_grid_refetches() {
        let mut h = harness(GridType::AllLoans, true);
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        h.store.apply(Command::SetDisplayType(GridType::CashFlow));
        wait_for(&mut h.view, |v| v.status == ViewStatus::Idle).await;
        h.store.apply(Command::SetDisplayType(GridType::AllLoans));
        let v = wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && rev(v) == 2).await;
        assert_eq!(v.rows[0].id, "loan-");
        assert_eq!(h.api.calls().len(), 2);
    }

    #[tokio::test]
    async fn invalidate_drops_cache_and_refetches() {
        let mut h = harness(GridType::AllLoans, true);
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        h.store.apply(Command::Invalidate { grid: GridType::CashFlow });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(h.api.calls().len(), 1);

        h.store.apply(Command::Invalidate { grid: GridType::AllLoans });
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && rev(v) == 2).await;
    }

    #[test]
    fn cache_is_bounded_and_evicts_least_recent() {
        let api = Arc::new(ScriptedApi::default());
        let (mut coord, _view) = GridCoordinator::new(
            GridType::AllLoans,
            vec![],
            Collaborators { api, notifier: Arc::new(CollectNotifier::default()) },
            GridState::new(GridType::AllLoans, 50),
            50,
            false,
        );
        let key = |i: usize| {
            let mut q = GridState::new(GridType::AllLoans, 50).query;
            q.keyword = format!("k{i}");
            q.fetch_payload(GridType::AllLoans).key(GridType::AllLoans).unwrap()
        };
        for i in 0..CACHE_CAPACITY {
            coord.cache_put(key(i), page_of(vec![]));
        }
        // k0 used again, so k1 is the oldest now
        coord.touch(&key(0));
        coord.cache_put(key(CACHE_CAPACITY), page_of(vec![]));

        assert_eq!(coord.cache.len(), CACHE_CAPACITY);
        assert!(coord.cache.contains_key(&key(0)));
        assert!(!coord.cache.contains_key(&key(1)));
        assert_eq!(coord.cache_order.len(), CACHE_CAPACITY);
    }

    #[test]
    fn rejected_width_skips_only_that_column() {
        let api = Arc::new(ScriptedApi::default());
        let mut state = GridState::new(GridType::AllLoans, 50);
        state.columns =
            ColumnConfig::new(vec![ColumnDescriptor::new("loanId", "Loan")]).unwrap();
        let (mut coord, view) = GridCoordinator::new(
            GridType::AllLoans,
            vec![BaseColumn::new("loanId", "Loan", None)],
            Collaborators { api, notifier: Arc::new(CollectNotifier::default()) },
            state,
            50,
            false,
        );
        let width = |field: &str, w: f64| ColumnWidth { field: field.into(), column_width: w };
        coord.on_event(&StoreEvent::ColumnWidthChanged {
            grid: GridType::AllLoans,
            widths: vec![width("ghost", 90.0), width("loanId", -3.0), width("loanId", 140.0)],
        });

        assert_eq!(coord.state.columns.descriptors()[0].column_width, Some(140.0));
        assert_eq!(view.borrow().columns.len(), 1);
    }

    #[tokio::test]
    async fn late_response_for_superseded_key_is_dropped() {
        let mut h = harness(GridType::AllLoans, true);
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        let (release, gate) = oneshot::channel();
        h.api.gates.lock().unwrap().insert("slow".into(), gate);

        let g = GridType::AllLoans;
        h.store.apply(Command::UpdateQuery { grid: g, update: QueryUpdate::Keyword("slow".into()) });
        h.store.apply(Command::UpdateQuery { grid: g, update: QueryUpdate::Keyword("fast".into()) });
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && v.rows[0].id == "loan-fast").await;

        release.send(()).unwrap();
        sleep(Duration::from_millis(50)).await;
        let v = h.view.borrow().clone();
        assert_eq!(v.rows[0].id, "loan-fast");
        assert_eq!(v.status, ViewStatus::Ready);
    }

    #[tokio::test]
    async fn failure_keeps_previous_rows_and_notifies() {
        let mut h = harness(GridType::AllLoans, true);
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        h.api.failing.lock().unwrap().push("bad".into());
        h.store.apply(Command::UpdateQuery { grid: GridType::AllLoans, update: QueryUpdate::Keyword("bad".into()) });
        let v = wait_for(&mut h.view, |v| v.status == ViewStatus::Stale).await;
        assert_eq!(v.rows[0].id, "loan-");
        let notes = h.notes.0.lock().unwrap().clone();
        let grid_note = notes.iter().find(|n| n.message == "boom bad").unwrap();
        assert_eq!(grid_note.header.as_deref(), Some("Grid"));
    }

    #[tokio::test]
    async fn failure_without_previous_data_shows_empty_state() {
        let store = RootStore::new(50, GridType::Delinquent);
        let api = Arc::new(ScriptedApi::default());
        api.failing.lock().unwrap().push(String::new());
        let notes = Arc::new(CollectNotifier::default());
        let initial = store.grid(GridType::Delinquent).cloned().unwrap();
        let (coord, mut view) = GridCoordinator::new(
            GridType::Delinquent,
            vec![],
            Collaborators { api: api.clone(), notifier: notes.clone() },
            initial,
            50,
            true,
        );
        tokio::spawn(coord.run(store.subscribe()));
        let v = wait_for(&mut view, |v| matches!(v.status, ViewStatus::Empty { .. })).await;
        assert_eq!(v.status, ViewStatus::Empty { message: "No loans found".into() });
        assert!(v.rows.is_empty());
    }

    #[tokio::test]
    async fn expansion_event_rebuilds_without_refetch() {
        let mut h = harness(GridType::ByInvestor, true);
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        h.store.apply(Command::ToggleGroup { grid: GridType::ByInvestor, group_id: "whatever".into() });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(h.api.calls().len(), 1);
    }

    #[tokio::test]
    async fn logout_resets_and_refetches_default_grid() {
        let mut h = harness(GridType::AllLoans, true);
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        h.store.apply(Command::UpdateQuery { grid: GridType::AllLoans, update: QueryUpdate::Keyword("oak".into()) });
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && v.rows[0].id == "loan-oak").await;
        h.store.apply(Command::Logout);
        // default display is AllLoans for this harness; cache was cleared
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && v.rows[0].id == "loan-").await;
        assert_eq!(h.api.calls(), vec!["".to_string(), "oak".to_string(), "".to_string()]);
    }

    #[tokio::test]
    async fn answer_from_before_logout_is_dropped() {
        let mut h = harness(GridType::AllLoans, true);
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        let (release, gate) = oneshot::channel();
        h.api.gates.lock().unwrap().insert("old".into(), gate);

        h.store.apply(Command::UpdateQuery { grid: GridType::AllLoans, update: QueryUpdate::Keyword("old".into()) });
        h.store.apply(Command::Logout);
        wait_calls(&h.api, 3).await;
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && v.rows[0].id == "loan-").await;

        release.send(()).unwrap();
        sleep(Duration::from_millis(50)).await;
        let v = h.view.borrow().clone();
        assert_eq!(v.rows[0].id, "loan-");
        assert_eq!(v.status, ViewStatus::Ready);
        assert_eq!(h.api.calls(), vec!["".to_string(), "old".to_string(), "".to_string()]);
    }

    #[tokio::test]
    async fn logout_clears_reference_data_and_drops_late_loads() {
        let mut h = harness(GridType::CashFlow, false);
        h.store.apply(Command::SetDisplayType(GridType::CashFlow));
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready && !v.status_options.is_empty()).await;

        h.store.apply(Command::Logout);
        let v = wait_for(&mut h.view, |v| v.status == ViewStatus::Idle).await;
        assert!(v.status_options.is_empty());

        let (release_old, gate_old) = oneshot::channel();
        let (_hold_new, gate_new) = oneshot::channel::<()>();
        h.api.reference_gates.lock().unwrap().extend([gate_old, gate_new]);

        // load A starts, the session ends, load B starts and stays pending
        h.store.apply(Command::SetDisplayType(GridType::CashFlow));
        wait_for(&mut h.view, |v| v.status == ViewStatus::Ready).await;
        h.store.apply(Command::Logout);
        h.store.apply(Command::SetDisplayType(GridType::CashFlow));
        wait_calls(&h.api, 3).await;

        release_old.send(()).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(h.view.borrow().status_options.is_empty());
    }

    #[derive(Default)]
    struct RecordingNavigator(Mutex<Vec<String>>);

    #[async_trait]
    impl Navigator for RecordingNavigator {
        async fn navigate_to(&self, path: &str, query: &[(&str, String)]) {
            self.0.lock().unwrap().push(crate::api::build_location(path, query));
        }
    }

    #[tokio::test]
    async fn clicks_navigate_leaves_and_toggle_groups() {
        let mut view = GridView::idle(GridType::CashFlow);
        view.rows = build_display_tree(
            &[
                row(json!({"groupById": "G1", "servicingLoans": [{"loanId": 11}]})),
                row(json!({"loanId": 12})),
            ],
            &[],
        );
        let nav = RecordingNavigator::default();
        let (tx, mut rx) = mpsc::channel(4);

        let out = handle_row_click(&view, "12", &nav, &tx).await;
        assert_eq!(out, Some(ClickOutcome::Navigated { loan_id: "12".into() }));
        let out = handle_row_click(&view, "11", &nav, &tx).await;
        assert_eq!(out, Some(ClickOutcome::Navigated { loan_id: "11".into() }));
        assert_eq!(nav.0.lock().unwrap().clone(), vec!["/loan/overview?loanId=12", "/loan/overview?loanId=11"]);

        let out = handle_row_click(&view, "G1", &nav, &tx).await;
        assert_eq!(out, Some(ClickOutcome::ToggledGroup { group_id: "G1".into() }));
        match rx.recv().await.unwrap() {
            Command::ToggleGroup { grid, group_id } => {
                assert_eq!(grid, GridType::CashFlow);
                assert_eq!(group_id, "G1");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(nav.0.lock().unwrap().len(), 2);
        assert_eq!(handle_row_click(&view, "missing", &nav, &tx).await, None);
    }

    #[tokio::test]
    async fn leaf_without_loan_id_does_not_navigate() {
        let mut view = GridView::idle(GridType::ByInvestor);
        view.rows = build_display_tree(
            &[
                row(json!({"groupById": "G1", "servicingLoans": [{"investor": "A"}]})),
                row(json!({"investor": "B"})),
            ],
            &[],
        );
        let nav = RecordingNavigator::default();
        let (tx, _rx) = mpsc::channel(4);
        assert_eq!(handle_row_click(&view, "G1-0", &nav, &tx).await, None);
        assert_eq!(handle_row_click(&view, "row-1", &nav, &tx).await, None);
        assert!(nav.0.lock().unwrap().is_empty());
    }
}
