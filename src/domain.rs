// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::columns::ColumnConfig;
use crate::query::QueryCondition;

/// Named grids on the portfolio page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GridType {
    AllLoans,
    CashFlow,
    ByInvestor,
    Delinquent,
    Maturity,
    Youland,
}

impl GridType {
    pub const ALL: [GridType; 6] = [
        GridType::AllLoans,
        GridType::CashFlow,
        GridType::ByInvestor,
        GridType::Delinquent,
        GridType::Maturity,
        GridType::Youland,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GridType::AllLoans => "ALL_LOANS",
            GridType::CashFlow => "CASH_FLOW",
            GridType::ByInvestor => "BY_INVESTOR",
            GridType::Delinquent => "DELINQUENT",
            GridType::Maturity => "MATURITY",
            GridType::Youland => "YOULAND",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "all_loans" | "all" => Some(GridType::AllLoans),
            "cash_flow" | "cashflow" => Some(GridType::CashFlow),
            "by_investor" | "investor" => Some(GridType::ByInvestor),
            "delinquent" => Some(GridType::Delinquent),
            "maturity" => Some(GridType::Maturity),
            "youland" => Some(GridType::Youland),
            _ => None,
        }
    }

    /// Grids whose rows arrive grouped (`servicingLoans` children).
    pub fn is_grouped(&self) -> bool {
        matches!(
            self,
            GridType::CashFlow | GridType::ByInvestor | GridType::Delinquent | GridType::Maturity
        )
    }

    pub fn empty_message(&self) -> &'static str {
        match self {
            GridType::CashFlow => "No recorded transactions",
            _ => "No loans found",
        }
    }
}

impl Default for GridType {
    fn default() -> Self {
        GridType::Youland
    }
}

impl std::fmt::Display for GridType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

impl SortDirection {
    pub fn flipped(self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortItem {
    pub property: String,
    pub direction: SortDirection,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelinquentRange {
    All,
    OneToThirty,
    ThirtyOneToSixty,
    SixtyOneToNinety,
    OverNinety,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaturityRange {
    AlreadyEnd,
    ThirtyDays,
    SixtyDays,
    NinetyDays,
}

/// Which edge a column is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PinType {
    #[serde(rename = "LEFT")]
    Left,
    #[serde(rename = "RIGHT")]
    Right,
    #[default]
    #[serde(rename = "NONE")]
    Unpinned,
}

/// Persisted configuration of one grid column.
///
/// `visibility` and `hidden` both come from the settings backend; a column is
/// shown iff `visibility` is true and `hidden` is not `Some(true)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub field: String,
    #[serde(default)]
    pub header_name: String,
    #[serde(default = "default_true")]
    pub visibility: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    #[serde(default)]
    pub column_width: Option<f64>,
    #[serde(default)]
    pub pin_type: Option<PinType>,
    #[serde(default, alias = "sort")]
    pub order: Option<i32>,
    #[serde(default)]
    pub left_order: Option<i32>,
    #[serde(default)]
    pub right_order: Option<i32>,
}

fn default_true() -> bool {
    true
}

impl ColumnDescriptor {
    pub fn new(field: impl Into<String>, header_name: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            header_name: header_name.into(),
            visibility: true,
            hidden: None,
            column_width: None,
            pin_type: None,
            order: None,
            left_order: None,
            right_order: None,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visibility && self.hidden != Some(true)
    }

    pub fn pin(&self) -> PinType {
        self.pin_type.unwrap_or_default()
    }

    /// Order value of the partition this column currently sits in.
    pub fn partition_order(&self) -> Option<i32> {
        match self.pin() {
            PinType::Left => self.left_order,
            PinType::Right => self.right_order,
            PinType::Unpinned => self.order,
        }
    }

    pub fn set_partition_order(&mut self, value: i32) {
        match self.pin() {
            PinType::Left => self.left_order = Some(value),
            PinType::Right => self.right_order = Some(value),
            PinType::Unpinned => self.order = Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpandedGroupEntry {
    #[serde(rename = "dropDownId", alias = "groupId")]
    pub group_id: String,
    pub collapsed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnWidth {
    pub field: String,
    pub column_width: f64,
}

// ---- Settings payloads ----
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnWidthsPayload {
    pub page_column: GridType,
    pub column_widths: Vec<ColumnWidth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupExpandedPayload {
    pub page_column: GridType,
    pub drop_downs: Vec<ExpandedGroupEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnOrderPayload {
    pub page_column: GridType,
    pub columns: Vec<ColumnDescriptor>,
}

// ---- Fetch response ----
/// One loan row, or a group row carrying `servicingLoans`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servicing_loans: Option<Vec<Row>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Row {
    pub fn is_group(&self) -> bool {
        self.servicing_loans.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn loan_key(&self) -> Option<String> {
        self.loan_id.as_ref().and_then(value_key)
    }

    pub fn group_key(&self) -> Option<String> {
        self.group_by_id.as_ref().and_then(value_key)
    }
}

/// Ids arrive either as JSON strings or numbers.
pub fn value_key(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub total_elements: u64,
    #[serde(default)]
    pub total_pages: u32,
}

/// Group endpoints answer `contents` / `totalAmount`; list endpoints answer
/// `content` / `totalLoanAmount`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridPage {
    #[serde(default, alias = "contents")]
    pub content: Vec<Row>,
    #[serde(default)]
    pub page: PageInfo,
    #[serde(default, alias = "totalAmount")]
    pub total_loan_amount: Option<f64>,
    #[serde(default)]
    pub total_items: Option<u64>,
    #[serde(default)]
    pub weighted_average_margin: Option<f64>,
    #[serde(default)]
    pub weighted_average_sheet: Option<f64>,
}

/// Footer aggregates, passed through from the server unmodified.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Footer {
    pub total_loan_amount: Option<f64>,
    pub total_items: Option<u64>,
    pub weighted_average_margin: Option<f64>,
    pub weighted_average_sheet: Option<f64>,
}

impl From<&GridPage> for Footer {
    fn from(p: &GridPage) -> Self {
        Footer {
            total_loan_amount: p.total_loan_amount,
            total_items: p.total_items,
            weighted_average_margin: p.weighted_average_margin,
            weighted_average_sheet: p.weighted_average_sheet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
}

// ---- Notifications ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Error,
    Success,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    pub variant: Variant,
    pub header: Option<String>,
}

// ---- Session ----
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

/// Per-grid state owned by the root store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridState {
    pub query: QueryCondition,
    pub columns: ColumnConfig,
    pub expanded: Vec<ExpandedGroupEntry>,
}

/// Published by the store after every accepted mutation. Payloads are owned
/// snapshots; subscribers never see store internals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StoreEvent {
    QueryChanged { grid: GridType, query: QueryCondition },
    ColumnsChanged { grid: GridType, columns: Vec<ColumnDescriptor> },
    ColumnWidthChanged { grid: GridType, widths: Vec<ColumnWidth> },
    ExpansionChanged { grid: GridType, expanded: Vec<ExpandedGroupEntry> },
    DisplayTypeChanged { from: GridType, to: GridType },
    SessionChanged { signed_in: bool },
    /// Server data for `grid` changed behind its back; cached pages are void.
    Invalidated { grid: GridType },
    Reset { display_type: GridType },
}

impl StoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::QueryChanged { .. } => "query",
            StoreEvent::ColumnsChanged { .. } => "columns",
            StoreEvent::ColumnWidthChanged { .. } => "column_width",
            StoreEvent::ExpansionChanged { .. } => "expansion",
            StoreEvent::DisplayTypeChanged { .. } => "display_type",
            StoreEvent::SessionChanged { .. } => "session",
            StoreEvent::Invalidated { .. } => "invalidated",
            StoreEvent::Reset { .. } => "reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_page_uses_contents_and_total_amount() {
        let raw = r#"{
            "contents": [
                {"groupById": "G1", "investor": "Alpha",
                 "servicingLoans": [{"loanId": 1}, {"loanId": "2"}]}
            ],
            "totalAmount": 1250000.5,
            "totalItems": 2
        }"#;
        let page: GridPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.content.len(), 1);
        let group = &page.content[0];
        assert!(group.is_group());
        assert_eq!(group.group_key().as_deref(), Some("G1"));
        assert_eq!(group.fields.get("investor"), Some(&Value::from("Alpha")));
        let kids = group.servicing_loans.as_ref().unwrap();
        assert_eq!(kids[0].loan_key().as_deref(), Some("1"));
        assert_eq!(kids[1].loan_key().as_deref(), Some("2"));
        assert_eq!(page.total_loan_amount, Some(1250000.5));
        assert_eq!(Footer::from(&page).total_items, Some(2));
    }

    #[test]
    fn descriptor_visibility_merges_both_flags() {
        let mut c = ColumnDescriptor::new("investor", "Investor");
        assert!(c.is_visible());
        c.hidden = Some(true);
        assert!(!c.is_visible());
        c.hidden = Some(false);
        c.visibility = false;
        assert!(!c.is_visible());
    }

    #[test]
    fn descriptor_reads_backend_shape() {
        let raw = r#"{"field":"investor","headerName":"Investor","visibility":true,
                      "pinType":"LEFT","leftOrder":2,"sort":7,"columnWidth":180}"#;
        let c: ColumnDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(c.pin(), PinType::Left);
        assert_eq!(c.partition_order(), Some(2));
        assert_eq!(c.order, Some(7));
        assert_eq!(c.column_width, Some(180.0));
    }

    #[test]
    fn empty_servicing_loans_is_a_leaf() {
        let row = Row { loan_id: Some(Value::from(9)), servicing_loans: Some(vec![]), ..Default::default() };
        assert!(!row.is_group());
    }

    #[test]
    fn grid_type_parses_env_spellings() {
        assert_eq!(GridType::parse("cash-flow"), Some(GridType::CashFlow));
        assert_eq!(GridType::parse("BY_INVESTOR"), Some(GridType::ByInvestor));
        assert_eq!(GridType::parse("nope"), None);
    }
}
