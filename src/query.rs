// ===============================
// src/query.rs (query condition per grid)
// ===============================
//
// Filter / sort / pagination state for one grid, plus the payload that is
// sent to the list endpoints. Every filter change throws the user back to
// page 0; the payload is always an owned copy so the fetch cache key never
// aliases live store vectors.
//
use ahash::AHashSet;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::{DelinquentRange, GridType, MaturityRange, SortItem};

pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCondition {
    pub keyword: String,
    pub maturity_start_date: Option<String>,
    pub maturity_end_date: Option<String>,
    pub investors: Vec<String>,
    pub repayment_status_list: Vec<String>,
    pub trade_status: Vec<String>,
    pub prospective_buyers: Vec<String>,
    pub delinquent_days: Option<DelinquentRange>,
    pub maturity_days: Option<MaturityRange>,
    pub sort: Vec<SortItem>,
    pub page: u32,
    pub size: u32,
}

impl Default for QueryCondition {
    fn default() -> Self {
        Self {
            keyword: String::new(),
            maturity_start_date: None,
            maturity_end_date: None,
            investors: Vec::new(),
            repayment_status_list: Vec::new(),
            trade_status: Vec::new(),
            prospective_buyers: Vec::new(),
            delinquent_days: None,
            maturity_days: None,
            sort: Vec::new(),
            page: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Single-field update, the typed form of `updateQueryCondition(field, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryUpdate {
    Keyword(String),
    Investors(Vec<String>),
    RepaymentStatusList(Vec<String>),
    TradeStatus(Vec<String>),
    ProspectiveBuyers(Vec<String>),
    DelinquentDays(DelinquentRange),
    MaturityDays(MaturityRange),
    Page(u32),
    Size(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryField {
    Keyword,
    Investors,
    RepaymentStatusList,
    TradeStatus,
    ProspectiveBuyers,
    DelinquentDays,
    MaturityDays,
    Page,
    Size,
}

impl QueryUpdate {
    pub fn field(&self) -> QueryField {
        match self {
            QueryUpdate::Keyword(_) => QueryField::Keyword,
            QueryUpdate::Investors(_) => QueryField::Investors,
            QueryUpdate::RepaymentStatusList(_) => QueryField::RepaymentStatusList,
            QueryUpdate::TradeStatus(_) => QueryField::TradeStatus,
            QueryUpdate::ProspectiveBuyers(_) => QueryField::ProspectiveBuyers,
            QueryUpdate::DelinquentDays(_) => QueryField::DelinquentDays,
            QueryUpdate::MaturityDays(_) => QueryField::MaturityDays,
            QueryUpdate::Page(_) => QueryField::Page,
            QueryUpdate::Size(_) => QueryField::Size,
        }
    }
}

impl QueryField {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryField::Keyword => "keyword",
            QueryField::Investors => "investors",
            QueryField::RepaymentStatusList => "repayment_status_list",
            QueryField::TradeStatus => "trade_status",
            QueryField::ProspectiveBuyers => "prospective_buyers",
            QueryField::DelinquentDays => "delinquent_days",
            QueryField::MaturityDays => "maturity_days",
            QueryField::Page => "page",
            QueryField::Size => "size",
        }
    }
}

/// Both ends of the maturity filter. An empty string clears that end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
}

impl DateRange {
    pub fn cleared() -> Self {
        Self::default()
    }
}

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Set semantics, first occurrence wins its position.
fn dedup_keep_order(values: Vec<String>) -> Vec<String> {
    let mut seen = AHashSet::with_capacity(values.len());
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

/// Lenient date parse: RFC 3339 timestamps (what the date picker emits) or
/// plain `YYYY-MM-DD`. Anything else is treated as "no bound".
pub fn parse_lenient_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(d) => Some(d),
        Err(e) => {
            debug!(%raw, ?e, "ignoring unparseable date");
            None
        }
    }
}

impl QueryCondition {
    pub fn update_query_condition(&mut self, update: QueryUpdate) {
        let field = update.field();
        match update {
            QueryUpdate::Keyword(k) => self.keyword = k,
            QueryUpdate::Investors(v) => self.investors = dedup_keep_order(v),
            QueryUpdate::RepaymentStatusList(v) => self.repayment_status_list = dedup_keep_order(v),
            QueryUpdate::TradeStatus(v) => self.trade_status = dedup_keep_order(v),
            QueryUpdate::ProspectiveBuyers(v) => self.prospective_buyers = dedup_keep_order(v),
            QueryUpdate::DelinquentDays(r) => self.delinquent_days = Some(r),
            QueryUpdate::MaturityDays(r) => self.maturity_days = Some(r),
            QueryUpdate::Page(p) => self.page = p,
            // size 0 makes no sense for the backend; coerce instead of rejecting
            QueryUpdate::Size(s) => self.size = s.max(1),
        }
        if field != QueryField::Page {
            self.page = 0;
        }
    }

    pub fn update_query_date_range(&mut self, range: DateRange) {
        self.maturity_start_date = non_empty(range.start_date);
        self.maturity_end_date = non_empty(range.end_date);
        self.page = 0;
    }

    /// Replaces the sort wholesale. Only the first item is kept.
    pub fn update_sort(&mut self, items: Vec<SortItem>) {
        self.sort = items.into_iter().take(1).collect();
        self.page = 0;
    }

    /// Flip the active sort in place. No-op when unsorted.
    pub fn toggle_sort_direction(&mut self) {
        if let Some(item) = self.sort.first_mut() {
            item.direction = item.direction.flipped();
            self.page = 0;
        }
    }

    pub fn maturity_window(&self) -> (Option<NaiveDate>, Option<NaiveDate>) {
        (
            self.maturity_start_date.as_deref().and_then(parse_lenient_date),
            self.maturity_end_date.as_deref().and_then(parse_lenient_date),
        )
    }

    /// Owned request body for `grid`. Grid-specific filters are only sent to
    /// the grid that understands them; `DelinquentRange::All` means no filter.
    pub fn fetch_payload(&self, grid: GridType) -> FetchPayload {
        let cash_flow = grid == GridType::CashFlow;
        FetchPayload {
            page: self.page,
            size: self.size,
            sort: self.sort.clone(),
            search_condition: SearchCondition {
                keyword: self.keyword.clone(),
                maturity_start_date: self.maturity_start_date.clone().unwrap_or_default(),
                maturity_end_date: self.maturity_end_date.clone().unwrap_or_default(),
                investors: self.investors.clone(),
                repayment_status_list: self.repayment_status_list.clone(),
                trade_status: if cash_flow { self.trade_status.clone() } else { Vec::new() },
                prospective_buyers: if cash_flow { self.prospective_buyers.clone() } else { Vec::new() },
                delinquent_days: match (grid, self.delinquent_days) {
                    (GridType::Delinquent, Some(r)) if r != DelinquentRange::All => Some(r),
                    _ => None,
                },
                maturity_days: if grid == GridType::Maturity { self.maturity_days } else { None },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCondition {
    pub keyword: String,
    pub maturity_start_date: String,
    pub maturity_end_date: String,
    pub investors: Vec<String>,
    pub repayment_status_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trade_status: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prospective_buyers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delinquent_days: Option<DelinquentRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maturity_days: Option<MaturityRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPayload {
    pub page: u32,
    pub size: u32,
    pub sort: Vec<SortItem>,
    pub search_condition: SearchCondition,
}

impl FetchPayload {
    pub fn key(&self, grid: GridType) -> Result<FetchKey, serde_json::Error> {
        Ok(FetchKey { grid, body: serde_json::to_string(self)? })
    }
}

/// Structural identity of a fetch: grid + serialized payload. Vector order
/// matters, so `["A","B"]` and `["B","A"]` are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub grid: GridType,
    pub body: String,
}

impl FetchKey {
    /// Short digest for log fields.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.grid.as_str().as_bytes());
        h.update(self.body.as_bytes());
        let digest = hex::encode(h.finalize());
        digest[..12].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SortDirection;

    fn sort_by(property: &str, direction: SortDirection) -> SortItem {
        SortItem { property: property.into(), direction, label: property.into() }
    }

    #[test]
    fn any_filter_update_resets_page() {
        let updates = vec![
            QueryUpdate::Keyword("main st".into()),
            QueryUpdate::Investors(vec!["inv-1".into()]),
            QueryUpdate::RepaymentStatusList(vec!["DELINQUENT".into()]),
            QueryUpdate::TradeStatus(vec!["SOLD".into()]),
            QueryUpdate::ProspectiveBuyers(vec!["buyer".into()]),
            QueryUpdate::DelinquentDays(DelinquentRange::OverNinety),
            QueryUpdate::MaturityDays(MaturityRange::SixtyDays),
            QueryUpdate::Size(25),
        ];
        let mut q = QueryCondition::default();
        for u in updates {
            q.update_query_condition(QueryUpdate::Page(4));
            assert_eq!(q.page, 4);
            q.update_query_condition(u);
            assert_eq!(q.page, 0);
        }
        assert_eq!(q.keyword, "main st");
        assert_eq!(q.size, 25);
    }

    #[test]
    fn set_valued_filters_drop_duplicates_but_keep_order() {
        let mut q = QueryCondition::default();
        q.update_query_condition(QueryUpdate::Investors(vec!["B".into(), "A".into(), "B".into()]));
        assert_eq!(q.investors, vec!["B".to_string(), "A".to_string()]);
    }

    #[test]
    fn size_zero_is_coerced() {
        let mut q = QueryCondition::default();
        q.update_query_condition(QueryUpdate::Size(0));
        assert_eq!(q.size, 1);
    }

    #[test]
    fn date_range_sets_both_ends_and_clears_with_empty_strings() {
        let mut q = QueryCondition::default();
        q.update_query_condition(QueryUpdate::Page(3));
        q.update_query_date_range(DateRange {
            start_date: "2024-01-01T00:00:00.000Z".into(),
            end_date: "2024-06-30".into(),
        });
        assert_eq!(q.page, 0);
        let (start, end) = q.maturity_window();
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 6, 30));

        q.update_query_date_range(DateRange::cleared());
        assert_eq!(q.maturity_start_date, None);
        assert_eq!(q.maturity_end_date, None);
    }

    #[test]
    fn malformed_date_is_kept_but_has_no_bound() {
        let mut q = QueryCondition::default();
        q.update_query_date_range(DateRange { start_date: "31/02/2024".into(), end_date: String::new() });
        assert_eq!(q.maturity_start_date.as_deref(), Some("31/02/2024"));
        assert_eq!(q.maturity_window(), (None, None));
    }

    #[test]
    fn empty_sort_always_clears() {
        let mut q = QueryCondition::default();
        q.update_sort(vec![]);
        assert!(q.sort.is_empty());
        q.update_sort(vec![sort_by("loanAmount", SortDirection::Desc)]);
        q.update_sort(vec![]);
        assert!(q.sort.is_empty());
        q.update_sort(vec![]);
        assert!(q.sort.is_empty());
    }

    #[test]
    fn sort_keeps_one_entry_and_toggles_in_place() {
        let mut q = QueryCondition::default();
        q.update_sort(vec![
            sort_by("loanAmount", SortDirection::Desc),
            sort_by("maturityDate", SortDirection::Asc),
        ]);
        assert_eq!(q.sort.len(), 1);
        q.toggle_sort_direction();
        assert_eq!(q.sort, vec![sort_by("loanAmount", SortDirection::Asc)]);
        q.toggle_sort_direction();
        assert_eq!(q.sort[0].direction, SortDirection::Desc);
    }

    #[test]
    fn separately_built_equal_vectors_share_a_key() {
        let mut a = QueryCondition::default();
        let mut b = QueryCondition::default();
        a.update_query_condition(QueryUpdate::Investors(vec!["A".into(), "B".into()]));
        b.update_query_condition(QueryUpdate::Investors(["A", "B"].iter().map(|s| s.to_string()).collect()));
        let ka = a.fetch_payload(GridType::AllLoans).key(GridType::AllLoans).unwrap();
        let kb = b.fetch_payload(GridType::AllLoans).key(GridType::AllLoans).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka.fingerprint(), kb.fingerprint());
    }

    #[test]
    fn investor_order_changes_the_key() {
        let mut a = QueryCondition::default();
        let mut b = QueryCondition::default();
        a.update_query_condition(QueryUpdate::Investors(vec!["A".into(), "B".into()]));
        b.update_query_condition(QueryUpdate::Investors(vec!["B".into(), "A".into()]));
        let ka = a.fetch_payload(GridType::AllLoans).key(GridType::AllLoans).unwrap();
        let kb = b.fetch_payload(GridType::AllLoans).key(GridType::AllLoans).unwrap();
        assert_ne!(ka, kb);
    }

    #[test]
    fn same_query_on_two_grids_is_two_keys() {
        let q = QueryCondition::default();
        let a = q.fetch_payload(GridType::AllLoans).key(GridType::AllLoans).unwrap();
        let b = q.fetch_payload(GridType::Youland).key(GridType::Youland).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn payload_is_grid_specific() {
        let mut q = QueryCondition::default();
        q.update_query_condition(QueryUpdate::TradeStatus(vec!["SOLD".into()]));
        q.update_query_condition(QueryUpdate::DelinquentDays(DelinquentRange::All));
        q.update_query_condition(QueryUpdate::MaturityDays(MaturityRange::ThirtyDays));

        let cf = serde_json::to_value(q.fetch_payload(GridType::CashFlow)).unwrap();
        assert_eq!(cf["searchCondition"]["tradeStatus"][0], "SOLD");
        assert!(cf["searchCondition"].get("maturityDays").is_none());

        let del = serde_json::to_value(q.fetch_payload(GridType::Delinquent)).unwrap();
        assert!(del["searchCondition"].get("delinquentDays").is_none());
        assert!(del["searchCondition"].get("tradeStatus").is_none());

        q.update_query_condition(QueryUpdate::DelinquentDays(DelinquentRange::OneToThirty));
        let del = serde_json::to_value(q.fetch_payload(GridType::Delinquent)).unwrap();
        assert_eq!(del["searchCondition"]["delinquentDays"], "ONE_TO_THIRTY");

        let mat = serde_json::to_value(q.fetch_payload(GridType::Maturity)).unwrap();
        assert_eq!(mat["searchCondition"]["maturityDays"], "THIRTY_DAYS");
        assert_eq!(mat["size"], 50);
    }

    #[test]
    fn payload_does_not_alias_store_vectors() {
        let mut q = QueryCondition::default();
        q.update_query_condition(QueryUpdate::Investors(vec!["A".into()]));
        let payload = q.fetch_payload(GridType::AllLoans);
        q.investors.push("B".into());
        assert_eq!(payload.search_condition.investors, vec!["A".to_string()]);
    }
}
