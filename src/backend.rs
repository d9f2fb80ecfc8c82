// ===============================
// src/backend.rs (in-memory backend)
// ===============================
//
// Deterministic loan book for demos and tests. Answers grid fetches the way
// the servicing API does (filter, sort, page; grouped grids group by
// investor) and keeps the last settings written per grid. Loan detail
// edits (AOM, payments, extensions) are kept in memory too.
// Latency and failure rate are configurable.
//
use std::cmp::Ordering;
use std::sync::Mutex;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::api::{ApiError, LoanApi, LoanDetailApi, SettingsApi};
use crate::domain::{
    ColumnDescriptor, ColumnWidthsPayload, DelinquentRange, GridPage, GridType, GroupExpandedPayload,
    MaturityRange, PageInfo, Row, SelectOption, SortDirection, Variant,
};
use crate::forms::{
    AomInfo, AomRequest, BillEntry, BillStatus, ExtensionRequest, PaymentEntry, PaymentHistoryPage, PaymentRequest,
};
use crate::query::{parse_lenient_date, FetchPayload, SearchCondition};

const INVESTORS: [&str; 5] = ["Alameda", "Bayview Capital", "Cedar Trust", "Delta Notes", "Elm Street Fund"];
const STATUSES: [(&str, &str); 5] = [
    ("Current", "CURRENT"),
    ("Grace period", "GRACE_PERIOD"),
    ("Delinquent", "DELINQUENT"),
    ("Paid off", "PAID_OFF"),
    ("REO", "REO"),
];
const TRADE_STATUSES: [&str; 3] = ["UNTRADED", "PENDING", "TRADED"];
const STREETS: [&str; 6] = ["Oak Ave", "Pine St", "Maple Dr", "Harbor Blvd", "Sunset Way", "Lake Rd"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedSettings {
    pub widths: Option<ColumnWidthsPayload>,
    pub expanded: Option<GroupExpandedPayload>,
    pub columns: Option<Vec<ColumnDescriptor>>,
}

#[derive(Default)]
struct LoanDetails {
    aom: HashMap<u64, AomRequest>,
    payments: Vec<PaymentEntry>,
    next_payment_id: u64,
    extensions: HashMap<u64, ExtensionRequest>,
}

pub struct MockBackend {
    loans: Vec<Map<String, Value>>,
    today: NaiveDate,
    latency_ms: u64,
    fail_rate: f64,
    rng: Mutex<StdRng>,
    settings: Mutex<HashMap<GridType, SavedSettings>>,
    details: Mutex<LoanDetails>,
}

impl MockBackend {
    pub fn new(seed: u64, loans: usize, latency_ms: u64, fail_rate: f64) -> Self {
        let today = Utc::now().date_naive();
        let mut rng = StdRng::seed_from_u64(seed);
        let loans = (0..loans).map(|i| gen_loan(&mut rng, i, today)).collect();
        info!(latency_ms, fail_rate, "mock backend ready");
        Self {
            loans,
            today,
            latency_ms,
            fail_rate: fail_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
            settings: Mutex::new(HashMap::new()),
            details: Mutex::new(LoanDetails::default()),
        }
    }

    /// Last settings written for `grid`.
    pub fn saved(&self, grid: GridType) -> SavedSettings {
        self.settings
            .lock()
            .map(|s| s.get(&grid).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    async fn round_trip(&self, what: &str) -> Result<(), ApiError> {
        let (jitter, fail) = match self.rng.lock() {
            Ok(mut rng) => {
                let jitter = if self.latency_ms > 0 { rng.gen_range(0..=self.latency_ms / 2) } else { 0 };
                (jitter, self.fail_rate > 0.0 && rng.gen_bool(self.fail_rate))
            }
            Err(_) => (0, false),
        };
        if self.latency_ms > 0 {
            sleep(Duration::from_millis(self.latency_ms + jitter)).await;
        }
        if fail {
            debug!(what, "mock: injected failure");
            return Err(ApiError::Server {
                status: 500,
                message: format!("{what} is temporarily unavailable"),
                header: Some("Server error".into()),
                variant: Variant::Error,
            });
        }
        Ok(())
    }

    fn save(&self, grid: GridType, f: impl FnOnce(&mut SavedSettings)) {
        if let Ok(mut s) = self.settings.lock() {
            f(s.entry(grid).or_default());
        }
    }

    fn loan(&self, loan_id: u64) -> Result<&Map<String, Value>, ApiError> {
        self.loans
            .iter()
            .find(|l| l.get("loanId").and_then(Value::as_u64) == Some(loan_id))
            .ok_or_else(|| not_found(format!("Loan {loan_id} not found")))
    }

    fn with_details<T>(&self, f: impl FnOnce(&mut LoanDetails) -> Result<T, ApiError>) -> Result<T, ApiError> {
        match self.details.lock() {
            Ok(mut d) => f(&mut d),
            Err(_) => Err(ApiError::Transport("mock loan detail state poisoned".into())),
        }
    }

    /// Two past installments, the current month and the next one.
    fn bills(&self, loan: &Map<String, Value>, loan_id: u64, d: &LoanDetails) -> Vec<BillEntry> {
        let delinquent = loan.get("delinquentDays").and_then(Value::as_i64).unwrap_or(0) > 0;
        (-2..=1)
            .filter_map(|offset| month_start(self.today, offset))
            .map(|due| {
                let date_due = due.format("%Y-%m-%d").to_string();
                let paid = d.payments.iter().find(|p| p.loan_id == loan_id && p.date_due == date_due);
                let bill_status = match paid {
                    Some(p) if p.data_received_time <= date_due => BillStatus::Paid,
                    Some(_) => BillStatus::PaidLate,
                    None if due < self.today && delinquent => BillStatus::Late,
                    None if due < self.today => BillStatus::Paid,
                    None => BillStatus::Unpaid,
                };
                BillEntry { date_due, bill_status }
            })
            .collect()
    }

    fn matches(&self, loan: &Map<String, Value>, grid: GridType, c: &SearchCondition) -> bool {
        let text = |k: &str| loan.get(k).and_then(Value::as_str).unwrap_or_default();
        if !c.keyword.trim().is_empty() {
            let kw = c.keyword.trim().to_lowercase();
            let hit = ["propertyAddress", "investor", "borrowerName"]
                .iter()
                .any(|k| text(*k).to_lowercase().contains(&kw))
                || loan.get("loanId").map(|v| v.to_string().contains(&kw)).unwrap_or(false);
            if !hit {
                return false;
            }
        }
        if !c.investors.is_empty() && !c.investors.iter().any(|i| i == text("investor")) {
            return false;
        }
        if !c.repayment_status_list.is_empty()
            && !c.repayment_status_list.iter().any(|s| s == text("repaymentStatus"))
        {
            return false;
        }
        if !c.trade_status.is_empty() && !c.trade_status.iter().any(|s| s == text("tradeStatus")) {
            return false;
        }
        if !c.prospective_buyers.is_empty()
            && !c.prospective_buyers.iter().any(|s| s == text("prospectiveBuyer"))
        {
            return false;
        }

        let maturity = NaiveDate::parse_from_str(text("maturityDate"), "%Y-%m-%d").ok();
        let bound = |raw: &str| if raw.trim().is_empty() { None } else { parse_lenient_date(raw) };
        if let (Some(start), Some(m)) = (bound(&c.maturity_start_date), maturity) {
            if m < start {
                return false;
            }
        }
        if let (Some(end), Some(m)) = (bound(&c.maturity_end_date), maturity) {
            if m > end {
                return false;
            }
        }

        let days = loan.get("delinquentDays").and_then(Value::as_i64).unwrap_or(0);
        if grid == GridType::Delinquent {
            if days == 0 {
                return false;
            }
            let in_range = match c.delinquent_days.unwrap_or(DelinquentRange::All) {
                DelinquentRange::All => true,
                DelinquentRange::OneToThirty => (1..=30).contains(&days),
                DelinquentRange::ThirtyOneToSixty => (31..=60).contains(&days),
                DelinquentRange::SixtyOneToNinety => (61..=90).contains(&days),
                DelinquentRange::OverNinety => days > 90,
            };
            if !in_range {
                return false;
            }
        }
        if let (GridType::Maturity, Some(range), Some(m)) = (grid, c.maturity_days, maturity) {
            let left = (m - self.today).num_days();
            let in_range = match range {
                MaturityRange::AlreadyEnd => left < 0,
                MaturityRange::ThirtyDays => (0..=30).contains(&left),
                MaturityRange::SixtyDays => (0..=60).contains(&left),
                MaturityRange::NinetyDays => (0..=90).contains(&left),
            };
            if !in_range {
                return false;
            }
        }
        if grid == GridType::Youland && text("investor") != INVESTORS[0] {
            return false;
        }
        true
    }

    /// Pure query over the loan book.
    pub fn query(&self, grid: GridType, p: &FetchPayload) -> GridPage {
        let mut hits: Vec<&Map<String, Value>> =
            self.loans.iter().filter(|l| self.matches(l, grid, &p.search_condition)).collect();
        if let Some(s) = p.sort.first() {
            hits.sort_by(|a, b| {
                let ord = compare_values(a.get(&s.property), b.get(&s.property));
                if s.direction == SortDirection::Desc { ord.reverse() } else { ord }
            });
        }
        let total_amount: f64 = hits.iter().filter_map(|l| l.get("totalLoanAmount").and_then(Value::as_f64)).sum();
        let rate_sum: f64 = hits.iter().filter_map(|l| l.get("interestRate").and_then(Value::as_f64)).sum();
        let margin = if hits.is_empty() { None } else { Some(round2(rate_sum / hits.len() as f64)) };

        let size = p.size.max(1) as usize;
        let start = p.page as usize * size;

        if grid.is_grouped() {
            let mut groups: Vec<(String, Vec<&Map<String, Value>>)> = Vec::new();
            for l in hits.iter().copied() {
                let key = l.get("investor").and_then(Value::as_str).unwrap_or_default().to_string();
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, v)) => v.push(l),
                    None => groups.push((key, vec![l])),
                }
            }
            let total = groups.len();
            let content = groups
                .into_iter()
                .skip(start)
                .take(size)
                .map(|(key, loans)| group_row(key, loans))
                .collect();
            return GridPage {
                content,
                page: page_info(p.page, size, total),
                total_loan_amount: Some(round2(total_amount)),
                total_items: Some(hits.len() as u64),
                weighted_average_margin: margin,
                weighted_average_sheet: None,
            };
        }

        let total = hits.len();
        let content = hits.into_iter().skip(start).take(size).map(|l| leaf_row(l.clone())).collect();
        GridPage {
            content,
            page: page_info(p.page, size, total),
            total_loan_amount: Some(round2(total_amount)),
            total_items: Some(total as u64),
            weighted_average_margin: margin,
            weighted_average_sheet: margin.map(|m| round2(m - 0.5)),
        }
    }
}

fn gen_loan(rng: &mut StdRng, i: usize, today: NaiveDate) -> Map<String, Value> {
    let investor = INVESTORS[rng.gen_range(0..INVESTORS.len())];
    let (_, status) = STATUSES[rng.gen_range(0..STATUSES.len())];
    let delinquent_days = if status == "DELINQUENT" { rng.gen_range(1..150) } else { 0 };
    let maturity = today + ChronoDuration::days(rng.gen_range(-60..365));
    let submit = today - ChronoDuration::days(rng.gen_range(30..720));
    let amount = (rng.gen_range(150..2500) as f64) * 1000.0;
    let rate = round2(rng.gen_range(7.5..13.0));
    let address = format!("{} {}", rng.gen_range(10..9999), STREETS[rng.gen_range(0..STREETS.len())]);
    let buyer = if rng.gen_bool(0.3) { INVESTORS[rng.gen_range(0..INVESTORS.len())] } else { "" };
    let row = json!({
        "loanId": 100_000 + i as u64,
        "investor": investor,
        "repaymentStatus": status,
        "submitDate": submit.format("%Y-%m-%d").to_string(),
        "maturityDate": maturity.format("%Y-%m-%d").to_string(),
        "estSaleDate": (submit + ChronoDuration::days(45)).format("%Y-%m-%d").to_string(),
        "propertyAddress": address,
        "borrowerName": format!("Borrower {i:03}"),
        "prospectiveBuyer": buyer,
        "tradeStatus": TRADE_STATUSES[rng.gen_range(0..TRADE_STATUSES.len())],
        "interestRate": rate,
        "buyRate": round2(rate - 1.25),
        "originatorSpread": 1.25,
        "totalLoanAmount": amount,
        "delinquentDays": delinquent_days,
        "tradeConfirm": false,
    });
    match row {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

fn not_found(message: String) -> ApiError {
    ApiError::Server { status: 404, message, header: Some("Loan".into()), variant: Variant::Warning }
}

fn month_start(today: NaiveDate, offset: i32) -> Option<NaiveDate> {
    let months = today.year() * 12 + today.month0() as i32 + offset;
    NaiveDate::from_ymd_opt(months.div_euclid(12), months.rem_euclid(12) as u32 + 1, 1)
}

fn leaf_row(mut fields: Map<String, Value>) -> Row {
    let loan_id = fields.remove("loanId");
    Row { loan_id, group_by_id: None, servicing_loans: None, fields }
}

fn group_row(key: String, loans: Vec<&Map<String, Value>>) -> Row {
    let amount: f64 = loans.iter().filter_map(|l| l.get("totalLoanAmount").and_then(Value::as_f64)).sum();
    let mut fields = Map::new();
    fields.insert("investor".into(), Value::from(key.clone()));
    fields.insert("totalLoanAmount".into(), json!(round2(amount)));
    fields.insert("count".into(), Value::from(loans.len() as u64));
    Row {
        loan_id: None,
        group_by_id: Some(Value::from(key)),
        servicing_loans: Some(loans.into_iter().map(|l| leaf_row(l.clone())).collect()),
        fields,
    }
}

fn page_info(number: u32, size: usize, total: usize) -> PageInfo {
    PageInfo {
        number,
        size: size as u32,
        total_elements: total as u64,
        total_pages: total.div_ceil(size) as u32,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[async_trait]
impl LoanApi for MockBackend {
    async fn fetch_grid(&self, grid: GridType, payload: FetchPayload) -> Result<GridPage, ApiError> {
        self.round_trip("loan list").await?;
        let page = self.query(grid, &payload);
        debug!(%grid, rows = page.content.len(), total = ?page.total_items, "mock: grid page");
        Ok(page)
    }

    async fn fetch_repayment_statuses(&self) -> Result<Vec<SelectOption>, ApiError> {
        self.round_trip("repayment status list").await?;
        Ok(STATUSES
            .iter()
            .map(|(label, value)| SelectOption { label: label.to_string(), value: value.to_string() })
            .collect())
    }

    async fn fetch_investors(&self) -> Result<Vec<SelectOption>, ApiError> {
        self.round_trip("investor list").await?;
        Ok(INVESTORS.iter().map(|i| SelectOption { label: i.to_string(), value: i.to_string() }).collect())
    }
}

#[async_trait]
impl SettingsApi for MockBackend {
    async fn write_column_widths(&self, payload: ColumnWidthsPayload) -> Result<(), ApiError> {
        self.round_trip("column width setting").await?;
        self.save(payload.page_column, |s| s.widths = Some(payload.clone()));
        Ok(())
    }

    async fn write_group_expanded(&self, payload: GroupExpandedPayload) -> Result<(), ApiError> {
        self.round_trip("group setting").await?;
        self.save(payload.page_column, |s| s.expanded = Some(payload.clone()));
        Ok(())
    }

    async fn write_column_order(&self, grid: GridType, columns: Vec<ColumnDescriptor>) -> Result<(), ApiError> {
        self.round_trip("column setting").await?;
        self.save(grid, |s| s.columns = Some(columns));
        Ok(())
    }
}

#[async_trait]
impl LoanDetailApi for MockBackend {
    async fn fetch_aom_info(&self, loan_id: u64) -> Result<AomInfo, ApiError> {
        self.round_trip("aom info").await?;
        let loan = self.loan(loan_id)?;
        let text = |k: &str| loan.get(k).and_then(Value::as_str).map(str::to_string);
        self.with_details(|d| {
            let aom = d.aom.get(&loan_id);
            Ok(AomInfo {
                loan_id,
                system_loan_number: Some(format!("YL{loan_id}")),
                property_full_address: text("propertyAddress"),
                total_loan_amount: loan.get("totalLoanAmount").and_then(Value::as_f64),
                maturity_date: d
                    .extensions
                    .get(&loan_id)
                    .map(|e| e.new_maturity_date.clone())
                    .or_else(|| text("maturityDate")),
                investor_id: aom.and_then(|a| a.investor_id.clone()),
                instrument_number: aom.map(|a| a.instrument_number.clone()),
                recorded_date: aom.map(|a| a.recorded_date.clone()),
            })
        })
    }

    async fn fetch_aom_investors(&self) -> Result<Vec<SelectOption>, ApiError> {
        self.round_trip("aom investor list").await?;
        Ok(INVESTORS
            .iter()
            .enumerate()
            .map(|(i, name)| SelectOption { label: name.to_string(), value: format!("inv-{}", i + 1) })
            .collect())
    }

    async fn create_aom_pdf(&self, req: AomRequest) -> Result<(), ApiError> {
        self.round_trip("aom document").await?;
        self.loan(req.loan_id)?;
        debug!(loan_id = req.loan_id, instrument = %req.instrument_number, "mock: aom generated");
        self.with_details(|d| {
            d.aom.insert(req.loan_id, req);
            Ok(())
        })
    }

    async fn fetch_current_bill(&self, loan_id: u64) -> Result<Vec<BillEntry>, ApiError> {
        self.round_trip("current bill").await?;
        let loan = self.loan(loan_id)?;
        self.with_details(|d| Ok(self.bills(loan, loan_id, d)))
    }

    async fn fetch_payments_history(&self, loan_id: u64, page: u32, size: u32) -> Result<PaymentHistoryPage, ApiError> {
        self.round_trip("payment history").await?;
        self.loan(loan_id)?;
        self.with_details(|d| {
            let mut rows: Vec<PaymentEntry> = d.payments.iter().filter(|p| p.loan_id == loan_id).cloned().collect();
            rows.sort_by(|a, b| b.data_received_time.cmp(&a.data_received_time));
            let total: f64 = rows.iter().map(|p| p.total_pmt).sum();
            let total_item = rows.len() as u64;
            let size = size.max(1) as usize;
            let content = rows.into_iter().skip(page as usize * size).take(size).collect();
            Ok(PaymentHistoryPage { content, total_item, accumulate_total_pmt: round2(total) })
        })
    }

    async fn save_payment(&self, req: PaymentRequest) -> Result<(), ApiError> {
        self.round_trip("payment").await?;
        self.loan(req.loan_id)?;
        self.with_details(|d| {
            let entry = |id| PaymentEntry {
                id,
                loan_id: req.loan_id,
                data_received_time: req.data_received_time.clone(),
                date_due: req.date_due.clone(),
                payment_method: req.payment_method,
                total_pmt: req.total_pmt,
                nsf: req.nsf,
            };
            match req.id {
                Some(id) => {
                    let slot = d
                        .payments
                        .iter_mut()
                        .find(|p| p.id == id)
                        .ok_or_else(|| not_found(format!("Payment {id} not found")))?;
                    *slot = entry(id);
                }
                None => {
                    d.next_payment_id += 1;
                    let id = d.next_payment_id;
                    d.payments.push(entry(id));
                }
            }
            Ok(())
        })
    }

    async fn delete_payment(&self, id: u64) -> Result<(), ApiError> {
        self.round_trip("payment delete").await?;
        self.with_details(|d| {
            let before = d.payments.len();
            d.payments.retain(|p| p.id != id);
            if d.payments.len() == before {
                return Err(not_found(format!("Payment {id} not found")));
            }
            Ok(())
        })
    }

    async fn request_extension(&self, req: ExtensionRequest) -> Result<(), ApiError> {
        self.round_trip("extension request").await?;
        self.loan(req.loan_id)?;
        self.with_details(|d| {
            d.extensions.insert(req.loan_id, req);
            Ok(())
        })
    }
}
