// ===============================
// src/store.rs (root aggregate)
// ===============================
//
// One GridState per grid + display type + session. Single writer: the
// store is owned by `run`, everything else talks to it with `Command`s and
// listens to `StoreEvent`s.
//
use ahash::AHashMap as HashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::columns::ColumnConfig;
use crate::domain::{
    ColumnDescriptor, DelinquentRange, ExpandedGroupEntry, GridState, GridType, MaturityRange,
    PinType, SortItem, StoreEvent, UserProfile, UserSession,
};
use crate::metrics::STORE_COMMANDS;
use crate::query::{DateRange, QueryCondition, QueryUpdate};

pub const EVENT_CAPACITY: usize = 1024;

impl GridState {
    /// Default snapshot for `grid`.
    pub fn new(grid: GridType, page_size: u32) -> Self {
        let mut query = QueryCondition { size: page_size.max(1), ..QueryCondition::default() };
        match grid {
            GridType::Delinquent => query.delinquent_days = Some(DelinquentRange::All),
            GridType::Maturity => query.maturity_days = Some(MaturityRange::AlreadyEnd),
            _ => {}
        }
        Self { query, columns: ColumnConfig::default(), expanded: Vec::new() }
    }

    /// Absent groups count as collapsed.
    pub fn is_expanded(&self, group_id: &str) -> bool {
        self.expanded.iter().any(|e| e.group_id == group_id && !e.collapsed)
    }

    pub fn set_group_collapsed(&mut self, group_id: &str, collapsed: bool) {
        match self.expanded.iter_mut().find(|e| e.group_id == group_id) {
            Some(e) => e.collapsed = collapsed,
            None => self.expanded.push(ExpandedGroupEntry { group_id: group_id.to_string(), collapsed }),
        }
    }

    pub fn toggle_group(&mut self, group_id: &str) {
        let expanded = self.is_expanded(group_id);
        self.set_group_collapsed(group_id, expanded);
    }
}

#[derive(Debug)]
pub enum Command {
    UpdateQuery { grid: GridType, update: QueryUpdate },
    UpdateDateRange { grid: GridType, range: DateRange },
    UpdateSort { grid: GridType, items: Vec<SortItem> },
    ToggleSort { grid: GridType },
    UpdateOrderColumns { grid: GridType, columns: Vec<ColumnDescriptor> },
    SetColumnVisible { grid: GridType, field: String, visible: bool },
    SetColumnWidth { grid: GridType, field: String, width: f64 },
    PinColumn { grid: GridType, field: String, pin: PinType },
    MoveColumn { grid: GridType, field: String, to_index: usize },
    ToggleGroup { grid: GridType, group_id: String },
    SetGroupCollapsed { grid: GridType, group_id: String, collapsed: bool },
    /// Expand-all / collapse-all button; ids are the groups currently loaded.
    ExpandAll { grid: GridType, group_ids: Vec<String>, collapsed: bool },
    SetDisplayType(GridType),
    /// Drop cached pages of `grid` after an edit made elsewhere.
    Invalidate { grid: GridType },
    InjectSession(UserSession),
    InjectProfile(UserProfile),
    Logout,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::UpdateQuery { .. } => "update_query",
            Command::UpdateDateRange { .. } => "update_date_range",
            Command::UpdateSort { .. } => "update_sort",
            Command::ToggleSort { .. } => "toggle_sort",
            Command::UpdateOrderColumns { .. } => "update_order_columns",
            Command::SetColumnVisible { .. } => "set_column_visible",
            Command::SetColumnWidth { .. } => "set_column_width",
            Command::PinColumn { .. } => "pin_column",
            Command::MoveColumn { .. } => "move_column",
            Command::ToggleGroup { .. } => "toggle_group",
            Command::SetGroupCollapsed { .. } => "set_group_collapsed",
            Command::ExpandAll { .. } => "expand_all",
            Command::SetDisplayType(_) => "set_display_type",
            Command::Invalidate { .. } => "invalidate",
            Command::InjectSession(_) => "inject_session",
            Command::InjectProfile(_) => "inject_profile",
            Command::Logout => "logout",
        }
    }
}

pub struct RootStore {
    grids: HashMap<GridType, GridState>,
    display_type: GridType,
    default_display: GridType,
    page_size: u32,
    session: Option<UserSession>,
    profile: Option<UserProfile>,
    events: broadcast::Sender<StoreEvent>,
}

impl RootStore {
    pub fn new(page_size: u32, display_type: GridType) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            grids: Self::default_grids(page_size),
            display_type,
            default_display: display_type,
            page_size,
            session: None,
            profile: None,
            events,
        }
    }

    fn default_grids(page_size: u32) -> HashMap<GridType, GridState> {
        GridType::ALL.iter().map(|&g| (g, GridState::new(g, page_size))).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn display_type(&self) -> GridType {
        self.display_type
    }

    pub fn grid(&self, grid: GridType) -> Option<&GridState> {
        self.grids.get(&grid)
    }

    pub fn session(&self) -> Option<&UserSession> {
        self.session.as_ref()
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    fn grid_mut(&mut self, grid: GridType) -> &mut GridState {
        let page_size = self.page_size;
        self.grids.entry(grid).or_insert_with(|| GridState::new(grid, page_size))
    }

    fn emit(&self, ev: StoreEvent) {
        // Err hanya berarti belum ada subscriber
        let _ = self.events.send(ev);
    }

    fn emit_query(&mut self, grid: GridType) {
        let query = self.grid_mut(grid).query.clone();
        self.emit(StoreEvent::QueryChanged { grid, query });
    }

    fn emit_columns(&mut self, grid: GridType) {
        let columns = self.grid_mut(grid).columns.descriptors().to_vec();
        self.emit(StoreEvent::ColumnsChanged { grid, columns });
    }

    fn emit_expansion(&mut self, grid: GridType) {
        let expanded = self.grid_mut(grid).expanded.clone();
        self.emit(StoreEvent::ExpansionChanged { grid, expanded });
    }

    pub fn apply(&mut self, cmd: Command) {
        STORE_COMMANDS.with_label_values(&[cmd.kind()]).inc();
        debug!(command = cmd.kind(), "store: apply");
        match cmd {
            Command::UpdateQuery { grid, update } => {
                self.grid_mut(grid).query.update_query_condition(update);
                self.emit_query(grid);
            }
            Command::UpdateDateRange { grid, range } => {
                self.grid_mut(grid).query.update_query_date_range(range);
                self.emit_query(grid);
            }
            Command::UpdateSort { grid, items } => {
                self.grid_mut(grid).query.update_sort(items);
                self.emit_query(grid);
            }
            Command::ToggleSort { grid } => {
                let q = &mut self.grid_mut(grid).query;
                if q.sort.is_empty() {
                    return;
                }
                q.toggle_sort_direction();
                self.emit_query(grid);
            }
            Command::UpdateOrderColumns { grid, columns } => {
                match self.grid_mut(grid).columns.update_order_columns(columns) {
                    Ok(()) => self.emit_columns(grid),
                    Err(e) => warn!(%grid, error = %e, "store: column update rejected"),
                }
            }
            Command::SetColumnVisible { grid, field, visible } => {
                match self.grid_mut(grid).columns.set_visible(&field, visible) {
                    Ok(()) => self.emit_columns(grid),
                    Err(e) => warn!(%grid, error = %e, "store: visibility change rejected"),
                }
            }
            Command::SetColumnWidth { grid, field, width } => {
                match self.grid_mut(grid).columns.set_width(&field, width) {
                    Ok(()) => {
                        let widths = self.grid_mut(grid).columns.widths();
                        self.emit(StoreEvent::ColumnWidthChanged { grid, widths });
                    }
                    Err(e) => warn!(%grid, error = %e, "store: width change rejected"),
                }
            }
            Command::PinColumn { grid, field, pin } => {
                match self.grid_mut(grid).columns.pin(&field, pin) {
                    Ok(()) => self.emit_columns(grid),
                    Err(e) => warn!(%grid, error = %e, "store: pin rejected"),
                }
            }
            Command::MoveColumn { grid, field, to_index } => {
                match self.grid_mut(grid).columns.move_column(&field, to_index) {
                    Ok(()) => self.emit_columns(grid),
                    Err(e) => warn!(%grid, error = %e, "store: move rejected"),
                }
            }
            Command::ToggleGroup { grid, group_id } => {
                self.grid_mut(grid).toggle_group(&group_id);
                self.emit_expansion(grid);
            }
            Command::SetGroupCollapsed { grid, group_id, collapsed } => {
                self.grid_mut(grid).set_group_collapsed(&group_id, collapsed);
                self.emit_expansion(grid);
            }
            Command::ExpandAll { grid, group_ids, collapsed } => {
                let state = self.grid_mut(grid);
                for id in &group_ids {
                    state.set_group_collapsed(id, collapsed);
                }
                self.emit_expansion(grid);
            }
            Command::SetDisplayType(to) => {
                let from = self.display_type;
                if from == to {
                    return;
                }
                self.display_type = to;
                info!(%from, %to, "store: display type changed");
                self.emit(StoreEvent::DisplayTypeChanged { from, to });
            }
            Command::Invalidate { grid } => self.emit(StoreEvent::Invalidated { grid }),
            Command::InjectSession(session) => {
                self.session = Some(session);
                self.emit(StoreEvent::SessionChanged { signed_in: true });
            }
            Command::InjectProfile(profile) => {
                self.profile = Some(profile);
            }
            Command::Logout => self.logout(),
        }
    }

    /// Back to the default snapshot.
    pub fn logout(&mut self) {
        self.grids = Self::default_grids(self.page_size);
        self.display_type = self.default_display;
        self.session = None;
        self.profile = None;
        info!("store: logout, state reset");
        self.emit(StoreEvent::Reset { display_type: self.display_type });
    }
}

/// Single-writer loop.
pub async fn run(mut store: RootStore, mut cmd_rx: mpsc::Receiver<Command>) {
    info!(display_type = %store.display_type(), "store: started");
    while let Some(cmd) = cmd_rx.recv().await {
        store.apply(cmd);
    }
    info!("store: command channel closed, stopped");
}
