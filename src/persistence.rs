// ===============================
// src/persistence.rs (settings write-back)
// ===============================
//
// Listens to store events and writes user settings back to the backend.
// - column widths, group expansion: debounced per grid
// - column order replacement: written right away, one write in flight per
//   grid, later snapshots replace one still waiting (server ends on the last)
// - grid leaves the display: its debounced writers are dropped, pending values lost
// - write failure: notify only, local state stays as the user left it
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::sync::{broadcast, broadcast::error::RecvError, mpsc};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{ApiError, Notifier, SettingsApi};
use crate::debounce::Debounced;
use crate::domain::{
    ColumnDescriptor, ColumnWidth, ColumnWidthsPayload, ExpandedGroupEntry, GridType, GroupExpandedPayload,
    StoreEvent,
};
use crate::metrics::{NOTIFICATIONS, SETTINGS_WRITES};
use crate::query::{DateRange, QueryField, QueryUpdate};
use crate::store::Command;

fn record(kind: &'static str, grid: GridType, res: Result<(), ApiError>, notifier: &dyn Notifier) {
    match res {
        Ok(()) => {
            SETTINGS_WRITES.with_label_values(&[kind, "ok"]).inc();
            debug!(%grid, kind, "settings: written");
        }
        Err(e) => {
            SETTINGS_WRITES.with_label_values(&[kind, "error"]).inc();
            warn!(%grid, kind, error = %e, "settings: write failed");
            NOTIFICATIONS.inc();
            notifier.notify(e.notification());
        }
    }
}

/// Debounced writers of one mounted grid.
struct GridWriters {
    widths: Debounced<Vec<ColumnWidth>>,
    expanded: Debounced<Vec<ExpandedGroupEntry>>,
}

impl GridWriters {
    fn spawn(grid: GridType, delay: Duration, settings: Arc<dyn SettingsApi>, notifier: Arc<dyn Notifier>) -> Self {
        let (s1, n1) = (settings.clone(), notifier.clone());
        let widths = Debounced::spawn("column_widths", delay, move |column_widths: Vec<ColumnWidth>| {
            let (s, n) = (s1.clone(), n1.clone());
            async move {
                let res = s.write_column_widths(ColumnWidthsPayload { page_column: grid, column_widths }).await;
                record("column_widths", grid, res, n.as_ref());
            }
        });
        let expanded = Debounced::spawn("group_expanded", delay, move |drop_downs: Vec<ExpandedGroupEntry>| {
            let (s, n) = (settings.clone(), notifier.clone());
            async move {
                let res = s.write_group_expanded(GroupExpandedPayload { page_column: grid, drop_downs }).await;
                record("group_expanded", grid, res, n.as_ref());
            }
        });
        Self { widths, expanded }
    }
}

/// Serial column-order writer: no quiet window, the sink is awaited before
/// the next snapshot is taken.
fn order_writer(
    grid: GridType,
    settings: Arc<dyn SettingsApi>,
    notifier: Arc<dyn Notifier>,
) -> Debounced<Vec<ColumnDescriptor>> {
    Debounced::spawn("column_order", Duration::ZERO, move |columns: Vec<ColumnDescriptor>| {
        let (s, n) = (settings.clone(), notifier.clone());
        async move {
            let res = s.write_column_order(grid, columns).await;
            record("column_order", grid, res, n.as_ref());
        }
    })
}

pub struct Persistence {
    settings: Arc<dyn SettingsApi>,
    notifier: Arc<dyn Notifier>,
    delay: Duration,
    writers: HashMap<GridType, GridWriters>,
    // survive unmount; only logout drops them
    order_writers: HashMap<GridType, Debounced<Vec<ColumnDescriptor>>>,
}

impl Persistence {
    pub fn new(settings: Arc<dyn SettingsApi>, notifier: Arc<dyn Notifier>, delay: Duration) -> Self {
        Self { settings, notifier, delay, writers: HashMap::new(), order_writers: HashMap::new() }
    }

    fn writers(&mut self, grid: GridType) -> &GridWriters {
        let (delay, s, n) = (self.delay, &self.settings, &self.notifier);
        self.writers
            .entry(grid)
            .or_insert_with(|| GridWriters::spawn(grid, delay, s.clone(), n.clone()))
    }

    fn on_event(&mut self, ev: StoreEvent) {
        match ev {
            StoreEvent::ColumnWidthChanged { grid, widths } => self.writers(grid).widths.call(widths),
            StoreEvent::ExpansionChanged { grid, expanded } => self.writers(grid).expanded.call(expanded),
            StoreEvent::ColumnsChanged { grid, columns } => {
                let (s, n) = (&self.settings, &self.notifier);
                self.order_writers
                    .entry(grid)
                    .or_insert_with(|| order_writer(grid, s.clone(), n.clone()))
                    .call(columns);
            }
            StoreEvent::DisplayTypeChanged { from, .. } => {
                if self.writers.remove(&from).is_some() {
                    debug!(grid = %from, "settings: writers unmounted");
                }
            }
            StoreEvent::Reset { .. } => {
                self.writers.clear();
                self.order_writers.clear();
            }
            StoreEvent::QueryChanged { .. }
            | StoreEvent::SessionChanged { .. }
            | StoreEvent::Invalidated { .. } => {}
        }
    }

    pub async fn run(mut self, mut events: broadcast::Receiver<StoreEvent>) {
        info!(delay_ms = self.delay.as_millis() as u64, "settings: persistence started");
        loop {
            match events.recv().await {
                Ok(ev) => self.on_event(ev),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "settings: lagged behind store events"),
                Err(RecvError::Closed) => break,
            }
        }
        info!("settings: store closed, persistence stopped");
    }
}

/// Filter inputs of one grid. Each field gets its own quiet window, so a
/// keyword typed while an investor filter is settling does not delay it.
pub struct FilterInput {
    grid: GridType,
    delay: Duration,
    commands: mpsc::Sender<Command>,
    fields: HashMap<QueryField, Debounced<QueryUpdate>>,
    date_range: Option<Debounced<DateRange>>,
}

impl FilterInput {
    pub fn new(grid: GridType, delay: Duration, commands: mpsc::Sender<Command>) -> Self {
        Self { grid, delay, commands, fields: HashMap::new(), date_range: None }
    }

    pub fn update(&mut self, update: QueryUpdate) {
        let (grid, tx, delay) = (self.grid, self.commands.clone(), self.delay);
        let name = update.field().as_str();
        self.fields
            .entry(update.field())
            .or_insert_with(|| {
                Debounced::spawn(name, delay, move |update: QueryUpdate| {
                    let tx = tx.clone();
                    async move {
                        if tx.send(Command::UpdateQuery { grid, update }).await.is_err() {
                            warn!(%grid, "filter: store is gone");
                        }
                    }
                })
            })
            .call(update);
    }

    pub fn update_date_range(&mut self, range: DateRange) {
        let (grid, tx, delay) = (self.grid, self.commands.clone(), self.delay);
        self.date_range
            .get_or_insert_with(|| {
                Debounced::spawn("date_range", delay, move |range: DateRange| {
                    let tx = tx.clone();
                    async move {
                        if tx.send(Command::UpdateDateRange { grid, range }).await.is_err() {
                            warn!(%grid, "filter: store is gone");
                        }
                    }
                })
            })
            .call(range);
    }
}
