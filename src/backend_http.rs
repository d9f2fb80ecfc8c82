// ===============================
// src/backend_http.rs
// ===============================
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};
use url::Url;

use crate::api::{ApiError, LoanApi, LoanDetailApi, SettingsApi};
use crate::domain::{
    ColumnDescriptor, ColumnOrderPayload, ColumnWidthsPayload, GridPage, GridType, GroupExpandedPayload,
    SelectOption, Variant,
};
use crate::forms::{AomInfo, AomRequest, BillEntry, ExtensionRequest, PaymentHistoryPage, PaymentRequest};
use crate::query::FetchPayload;

/// Servicing REST API (JSON over HTTP, optional bearer token).
pub struct HttpBackend {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

/// Error body the servicing API sends with non-2xx answers.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    header: Option<String>,
    #[serde(default)]
    variant: Option<Variant>,
}

pub fn grid_path(grid: GridType) -> &'static str {
    match grid {
        GridType::AllLoans => "servicing/loan/list",
        GridType::CashFlow => "servicing/cashflow/list",
        GridType::ByInvestor => "servicing/loan/investor/group",
        GridType::Delinquent => "servicing/loan/delinquent/group",
        GridType::Maturity => "servicing/loan/maturity/group",
        GridType::Youland => "servicing/loan/youland/list",
    }
}

const STATUS_PATH: &str = "servicing/loan/status";
const INVESTORS_PATH: &str = "servicing/investor/list";
const WIDTHS_PATH: &str = "servicing/setting/column/width";
const EXPANDED_PATH: &str = "servicing/setting/group/expanded";
const ORDER_PATH: &str = "servicing/setting/column/order";
const AOM_INVESTORS_PATH: &str = "servicing/loan/aom/investors";
const AOM_PDF_PATH: &str = "servicing/loan/aom/pdf";
const CURRENT_BILL_PATH: &str = "servicing/loan/bill/current";
const PAYMENT_HISTORY_PATH: &str = "servicing/loan/payment/history";
const PAYMENT_SAVE_PATH: &str = "servicing/loan/payment/save";
const PAYMENT_DELETE_PATH: &str = "servicing/loan/payment/delete";
const EXTENSION_PATH: &str = "servicing/loan/extension";

fn aom_info_path(loan_id: u64) -> String {
    format!("servicing/loan/aom/{loan_id}")
}

/// Buyer entry as the AOM investor endpoint sends it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AomInvestor {
    id: String,
    investor_name: String,
}

/// Maps a non-2xx answer to `ApiError::Server`, keeping whatever the
/// backend said about how to show it.
pub fn server_error(status: u16, body: &str) -> ApiError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| {
            let b = body.trim();
            if b.is_empty() || b.starts_with('{') {
                format!("HTTP {status}")
            } else {
                b.to_string()
            }
        });
    ApiError::Server { status, message, header: parsed.header, variant: parsed.variant.unwrap_or_default() }
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, url::ParseError> {
        // Url::join drops the last segment unless the base ends with '/'
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self { http: reqwest::Client::new(), base: Url::parse(&base)?, token })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base.join(path).map_err(|e| ApiError::Transport(format!("bad url {path}: {e}")))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let req = match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        };
        let rsp = req.send().await.map_err(|e| {
            error!(?e, "http: request failed");
            ApiError::Transport(e.to_string())
        })?;
        if rsp.status().is_success() {
            return Ok(rsp);
        }
        let code = rsp.status().as_u16();
        let body = rsp.text().await.unwrap_or_default();
        error!(code, %body, "http: error response");
        Err(server_error(code, &body))
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let url = self.url(path)?;
        debug!(%url, "http: POST");
        let rsp = self.send(self.http.post(url).json(body)).await?;
        rsp.json::<T>().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path)?;
        debug!(%url, "http: GET");
        let rsp = self.send(self.http.get(url)).await?;
        rsp.json::<T>().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn post_unit<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let url = self.url(path)?;
        debug!(%url, "http: POST");
        self.send(self.http.post(url).json(body)).await.map(|_| ())
    }
}

#[async_trait]
impl LoanApi for HttpBackend {
    async fn fetch_grid(&self, grid: GridType, payload: FetchPayload) -> Result<GridPage, ApiError> {
        self.post_json(grid_path(grid), &payload).await
    }

    async fn fetch_repayment_statuses(&self) -> Result<Vec<SelectOption>, ApiError> {
        self.get_json(STATUS_PATH).await
    }

    async fn fetch_investors(&self) -> Result<Vec<SelectOption>, ApiError> {
        self.get_json(INVESTORS_PATH).await
    }
}

#[async_trait]
impl SettingsApi for HttpBackend {
    async fn write_column_widths(&self, payload: ColumnWidthsPayload) -> Result<(), ApiError> {
        self.post_unit(WIDTHS_PATH, &payload).await
    }

    async fn write_group_expanded(&self, payload: GroupExpandedPayload) -> Result<(), ApiError> {
        self.post_unit(EXPANDED_PATH, &payload).await
    }

    async fn write_column_order(&self, grid: GridType, columns: Vec<ColumnDescriptor>) -> Result<(), ApiError> {
        self.post_unit(ORDER_PATH, &ColumnOrderPayload { page_column: grid, columns }).await
    }
}

#[async_trait]
impl LoanDetailApi for HttpBackend {
    async fn fetch_aom_info(&self, loan_id: u64) -> Result<AomInfo, ApiError> {
        self.get_json(&aom_info_path(loan_id)).await
    }

    async fn fetch_aom_investors(&self) -> Result<Vec<SelectOption>, ApiError> {
        let list: Vec<AomInvestor> = self.get_json(AOM_INVESTORS_PATH).await?;
        Ok(list.into_iter().map(|i| SelectOption { label: i.investor_name, value: i.id }).collect())
    }

    async fn create_aom_pdf(&self, req: AomRequest) -> Result<(), ApiError> {
        self.post_unit(AOM_PDF_PATH, &req).await
    }

    async fn fetch_current_bill(&self, loan_id: u64) -> Result<Vec<BillEntry>, ApiError> {
        self.post_json(CURRENT_BILL_PATH, &json!({ "loanId": loan_id })).await
    }

    async fn fetch_payments_history(&self, loan_id: u64, page: u32, size: u32) -> Result<PaymentHistoryPage, ApiError> {
        self.post_json(PAYMENT_HISTORY_PATH, &json!({ "loanId": loan_id, "page": page, "size": size })).await
    }

    async fn save_payment(&self, req: PaymentRequest) -> Result<(), ApiError> {
        self.post_unit(PAYMENT_SAVE_PATH, &req).await
    }

    async fn delete_payment(&self, id: u64) -> Result<(), ApiError> {
        self.post_unit(PAYMENT_DELETE_PATH, &json!({ "id": id })).await
    }

    async fn request_extension(&self, req: ExtensionRequest) -> Result<(), ApiError> {
        self.post_unit(EXTENSION_PATH, &req).await
    }
}
