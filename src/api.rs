// ===============================
// src/api.rs (collaborator seams)
// ===============================
use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{
    ColumnDescriptor, ColumnWidthsPayload, GridPage, GridType, GroupExpandedPayload, Notification,
    SelectOption, Variant,
};
use crate::forms::{AomInfo, AomRequest, BillEntry, ExtensionRequest, PaymentHistoryPage, PaymentRequest};
use crate::query::FetchPayload;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("{message}")]
    Server {
        status: u16,
        message: String,
        header: Option<String>,
        variant: Variant,
    },
    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// What the user gets to see for this failure.
    pub fn notification(&self) -> Notification {
        match self {
            ApiError::Server { message, header, variant, .. } => Notification {
                message: message.clone(),
                variant: *variant,
                header: header.clone(),
            },
            other => Notification { message: other.to_string(), variant: Variant::Error, header: None },
        }
    }
}

/// Grid rows and filter reference data.
#[async_trait]
pub trait LoanApi: Send + Sync {
    async fn fetch_grid(&self, grid: GridType, payload: FetchPayload) -> Result<GridPage, ApiError>;
    async fn fetch_repayment_statuses(&self) -> Result<Vec<SelectOption>, ApiError>;
    async fn fetch_investors(&self) -> Result<Vec<SelectOption>, ApiError>;
}

/// Remote user settings for grids.
#[async_trait]
pub trait SettingsApi: Send + Sync {
    async fn write_column_widths(&self, payload: ColumnWidthsPayload) -> Result<(), ApiError>;
    async fn write_group_expanded(&self, payload: GroupExpandedPayload) -> Result<(), ApiError>;
    async fn write_column_order(
        &self,
        grid: GridType,
        columns: Vec<ColumnDescriptor>,
    ) -> Result<(), ApiError>;
}

/// Loan detail screens reached from a grid row.
#[async_trait]
pub trait LoanDetailApi: Send + Sync {
    async fn fetch_aom_info(&self, loan_id: u64) -> Result<AomInfo, ApiError>;
    /// Buyers selectable on the AOM form.
    async fn fetch_aom_investors(&self) -> Result<Vec<SelectOption>, ApiError>;
    async fn create_aom_pdf(&self, req: AomRequest) -> Result<(), ApiError>;
    async fn fetch_current_bill(&self, loan_id: u64) -> Result<Vec<BillEntry>, ApiError>;
    async fn fetch_payments_history(&self, loan_id: u64, page: u32, size: u32) -> Result<PaymentHistoryPage, ApiError>;
    /// Creates the entry when `req.id` is `None`, edits it otherwise.
    async fn save_payment(&self, req: PaymentRequest) -> Result<(), ApiError>;
    async fn delete_payment(&self, id: u64) -> Result<(), ApiError>;
    async fn request_extension(&self, req: ExtensionRequest) -> Result<(), ApiError>;
}

#[async_trait]
pub trait Navigator: Send + Sync {
    async fn navigate_to(&self, path: &str, query: &[(&str, String)]);
}

pub trait Notifier: Send + Sync {
    fn notify(&self, n: Notification);
}

/// Builds `path?k=v&...` with encoded values.
pub fn build_location(path: &str, query: &[(&str, String)]) -> String {
    if query.is_empty() {
        return path.to_string();
    }
    let qs: Vec<String> = query
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    format!("{}?{}", path, qs.join("&"))
}

/// Navigator for headless runs: logs the destination.
#[derive(Debug, Default)]
pub struct LogNavigator;

#[async_trait]
impl Navigator for LogNavigator {
    async fn navigate_to(&self, path: &str, query: &[(&str, String)]) {
        info!(location = %build_location(path, query), "navigate");
    }
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        warn!(
            variant = ?n.variant,
            header = n.header.as_deref().unwrap_or(""),
            message = %n.message,
            "notification"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_keeps_backend_message() {
        let e = ApiError::Server {
            status: 400,
            message: "Column not found".into(),
            header: Some("Settings".into()),
            variant: Variant::Warning,
        };
        let n = e.notification();
        assert_eq!(n.message, "Column not found");
        assert_eq!(n.variant, Variant::Warning);
        assert_eq!(n.header.as_deref(), Some("Settings"));
    }

    #[test]
    fn transport_error_is_an_error_variant() {
        let n = ApiError::Transport("connection refused".into()).notification();
        assert_eq!(n.variant, Variant::Error);
        assert_eq!(n.message, "request failed: connection refused");
        assert_eq!(n.header, None);
    }

    #[test]
    fn location_encodes_query() {
        assert_eq!(
            build_location("/loan/overview", &[("loanId", "12 34".to_string())]),
            "/loan/overview?loanId=12%2034"
        );
        assert_eq!(build_location("/loan/overview", &[]), "/loan/overview");
    }
}
