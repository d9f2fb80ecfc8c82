// ===============================
// src/forms.rs (loan detail forms)
// ===============================
//
// Loan detail screens: assignment of mortgage, payment history, extension
// request. Every submit runs the client-side checks first; a form that
// fails them never reaches the backend. Failures of either kind are
// reported through the notifier.
//
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{ApiError, LoanDetailApi, Notifier};
use crate::domain::{Notification, Variant};
use crate::metrics::NOTIFICATIONS;
use crate::query::parse_lenient_date;

/// Page size of the payment history reloaded after an edit.
pub const HISTORY_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FormError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{field} is not a valid date: {raw}")]
    InvalidDate { field: &'static str, raw: String },
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("extension fee must be at most 100%, got {0}")]
    FeeTooHigh(f64),
    #[error("new maturity date {new} must be after the current maturity date {current}")]
    MaturityNotExtended { current: NaiveDate, new: NaiveDate },
}

impl FormError {
    pub fn notification(&self) -> Notification {
        Notification { message: self.to_string(), variant: Variant::Warning, header: None }
    }
}

fn required<'a>(field: &'static str, v: &'a Option<String>) -> Result<&'a str, FormError> {
    match v.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(FormError::Missing(field)),
    }
}

fn required_date(field: &'static str, v: &Option<String>) -> Result<NaiveDate, FormError> {
    let raw = required(field, v)?;
    parse_lenient_date(raw).ok_or_else(|| FormError::InvalidDate { field, raw: raw.to_string() })
}

fn positive(field: &'static str, v: Option<f64>) -> Result<f64, FormError> {
    match v {
        Some(x) if x.is_finite() && x > 0.0 => Ok(x),
        Some(_) => Err(FormError::NotPositive(field)),
        None => Err(FormError::Missing(field)),
    }
}

fn ymd(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

// ---- Assignment of mortgage ----
#[derive(Debug, Clone, Default)]
pub struct AomForm {
    pub loan_id: u64,
    pub recorded_date: Option<String>,
    pub instrument_number: Option<String>,
    /// Prospective buyer, optional.
    pub investor: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AomRequest {
    pub loan_id: u64,
    pub recorded_date: String,
    pub instrument_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investor_name: Option<String>,
}

impl AomForm {
    pub fn validate(&self) -> Result<AomRequest, FormError> {
        let recorded = required_date("recorded date", &self.recorded_date)?;
        let instrument = required("instrument number", &self.instrument_number)?;
        let (investor_id, investor_name) = match &self.investor {
            Some((id, name)) if !id.trim().is_empty() => (Some(id.clone()), Some(name.clone())),
            _ => (None, None),
        };
        Ok(AomRequest {
            loan_id: self.loan_id,
            recorded_date: ymd(recorded),
            instrument_number: instrument.to_string(),
            investor_id,
            investor_name,
        })
    }
}

/// Loan card shown next to the AOM form, with what was recorded so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AomInfo {
    pub loan_id: u64,
    #[serde(default)]
    pub system_loan_number: Option<String>,
    #[serde(default)]
    pub property_full_address: Option<String>,
    #[serde(default)]
    pub total_loan_amount: Option<f64>,
    #[serde(default)]
    pub maturity_date: Option<String>,
    #[serde(default)]
    pub investor_id: Option<String>,
    #[serde(default)]
    pub instrument_number: Option<String>,
    #[serde(default)]
    pub recorded_date: Option<String>,
}

// ---- Payment history ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Ach,
    Wire,
    Check,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentForm {
    /// Set when editing an existing entry.
    pub id: Option<u64>,
    pub loan_id: u64,
    pub date_received: Option<String>,
    /// Falls back to the current bill's due date.
    pub date_due: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub total_payment: Option<f64>,
    pub nsf: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub loan_id: u64,
    pub data_received_time: String,
    pub date_due: String,
    pub payment_method: PaymentMethod,
    pub total_pmt: f64,
    pub nsf: bool,
}

impl PaymentForm {
    pub fn validate(&self, current_due: NaiveDate) -> Result<PaymentRequest, FormError> {
        let received = required_date("received date", &self.date_received)?;
        let payment_method = self.payment_method.ok_or(FormError::Missing("payment method"))?;
        let total = positive("total payment", self.total_payment)?;
        let due = match self.date_due.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => required_date("due date", &self.date_due)?,
            _ => current_due,
        };
        Ok(PaymentRequest {
            id: self.id,
            loan_id: self.loan_id,
            data_received_time: ymd(received),
            date_due: ymd(due),
            payment_method,
            total_pmt: total,
            nsf: self.nsf,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Paid,
    PaidLate,
    Unpaid,
    Late,
    #[serde(other)]
    Other,
}

/// One installment of the repayment timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillEntry {
    pub date_due: String,
    pub bill_status: BillStatus,
}

/// Due date a new payment defaults to: the first bill not yet paid, or the
/// last one when everything is settled.
pub fn current_due_date(bills: &[BillEntry]) -> Option<NaiveDate> {
    let open = bills
        .iter()
        .find(|b| !matches!(b.bill_status, BillStatus::Paid | BillStatus::PaidLate))
        .or_else(|| bills.last())?;
    parse_lenient_date(&open.date_due)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEntry {
    pub id: u64,
    pub loan_id: u64,
    pub data_received_time: String,
    pub date_due: String,
    pub payment_method: PaymentMethod,
    pub total_pmt: f64,
    pub nsf: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentHistoryPage {
    #[serde(default)]
    pub content: Vec<PaymentEntry>,
    #[serde(default)]
    pub total_item: u64,
    #[serde(default)]
    pub accumulate_total_pmt: f64,
}

// ---- Extension request ----
#[derive(Debug, Clone, Default)]
pub struct ExtensionForm {
    pub loan_id: u64,
    pub new_maturity_date: Option<String>,
    /// Percent of the loan amount.
    pub extension_fee: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRequest {
    pub loan_id: u64,
    pub new_maturity_date: String,
    pub extension_fee: f64,
}

impl ExtensionForm {
    pub fn validate(&self, current_maturity: NaiveDate) -> Result<ExtensionRequest, FormError> {
        let new = required_date("new maturity date", &self.new_maturity_date)?;
        if new <= current_maturity {
            return Err(FormError::MaturityNotExtended { current: current_maturity, new });
        }
        let fee = positive("extension fee", self.extension_fee)?;
        if fee > 100.0 {
            return Err(FormError::FeeTooHigh(fee));
        }
        Ok(ExtensionRequest { loan_id: self.loan_id, new_maturity_date: ymd(new), extension_fee: fee })
    }
}

// ---- Submission ----
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] FormError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SubmitError {
    pub fn notification(&self) -> Notification {
        match self {
            SubmitError::Invalid(e) => e.notification(),
            SubmitError::Api(e) => e.notification(),
        }
    }
}

fn report<T>(
    what: &'static str,
    loan_id: u64,
    res: Result<T, SubmitError>,
    notifier: &dyn Notifier,
) -> Result<T, SubmitError> {
    match &res {
        Ok(_) => info!(what, loan_id, "loan detail: submitted"),
        Err(e) => {
            warn!(what, loan_id, error = %e, "loan detail: not submitted");
            NOTIFICATIONS.inc();
            notifier.notify(e.notification());
        }
    }
    res
}

async fn send_aom(form: &AomForm, api: &dyn LoanDetailApi) -> Result<AomInfo, SubmitError> {
    let req = form.validate()?;
    api.create_aom_pdf(req).await?;
    Ok(api.fetch_aom_info(form.loan_id).await?)
}

/// Generates the AOM document and returns the loan card as recorded now.
pub async fn submit_aom(
    form: &AomForm,
    api: &dyn LoanDetailApi,
    notifier: &dyn Notifier,
) -> Result<AomInfo, SubmitError> {
    report("aom", form.loan_id, send_aom(form, api).await, notifier)
}

async fn send_payment(
    form: &PaymentForm,
    current_due: NaiveDate,
    api: &dyn LoanDetailApi,
) -> Result<PaymentHistoryPage, SubmitError> {
    let req = form.validate(current_due)?;
    api.save_payment(req).await?;
    Ok(api.fetch_payments_history(form.loan_id, 0, HISTORY_PAGE_SIZE).await?)
}

/// Creates or edits a payment entry and returns the first history page.
pub async fn submit_payment(
    form: &PaymentForm,
    current_due: NaiveDate,
    api: &dyn LoanDetailApi,
    notifier: &dyn Notifier,
) -> Result<PaymentHistoryPage, SubmitError> {
    report("payment", form.loan_id, send_payment(form, current_due, api).await, notifier)
}

async fn send_payment_delete(loan_id: u64, id: u64, api: &dyn LoanDetailApi) -> Result<PaymentHistoryPage, SubmitError> {
    api.delete_payment(id).await?;
    Ok(api.fetch_payments_history(loan_id, 0, HISTORY_PAGE_SIZE).await?)
}

pub async fn delete_payment(
    loan_id: u64,
    id: u64,
    api: &dyn LoanDetailApi,
    notifier: &dyn Notifier,
) -> Result<PaymentHistoryPage, SubmitError> {
    report("payment_delete", loan_id, send_payment_delete(loan_id, id, api).await, notifier)
}

async fn send_extension(
    form: &ExtensionForm,
    current_maturity: NaiveDate,
    api: &dyn LoanDetailApi,
) -> Result<(), SubmitError> {
    let req = form.validate(current_maturity)?;
    Ok(api.request_extension(req).await?)
}

pub async fn submit_extension(
    form: &ExtensionForm,
    current_maturity: NaiveDate,
    api: &dyn LoanDetailApi,
    notifier: &dyn Notifier,
) -> Result<(), SubmitError> {
    report("extension", form.loan_id, send_extension(form, current_maturity, api).await, notifier)
}
