//! HTTP accounting service
//!
//! Talks to the fund-accounting REST API. Reference data is paginated with
//! `limit`/`offset`; fund search is fuzzy-matched locally over all fund
//! names. Document operations return a background task that is polled at
//! `/v1/tasks/{id}` until it completes, fails or runs out of attempts.

use crate::config::AccountingApiConfig;
use crate::error::WorkflowError;
use crate::models::{CapitalCallData, Fund, GLAccount, Investor, ScoredCandidate};
use crate::services::search::SearchableList;
use crate::services::AccountingService;
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

const ENDPOINT_FUNDS: &str = "/v1/funds";
const ENDPOINT_GL_ACCOUNTS: &str = "/v1/gl-accounts";
const ENDPOINT_INVESTORS: &str = "/v1/investors";
const ENDPOINT_TRANSACTIONS: &str = "/v1/transactions";
const ENDPOINT_TASKS: &str = "/v1/tasks";

const HEADER_COMPANY_NAME: &str = "X-Company-Name";
const TRANSACTION_CODE: &str = "CAPCALL";

//
// ================= Wire Models =================
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    total_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundResponse {
    code: String,
    name: String,
    #[serde(default)]
    currency_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GLAccountResponse {
    no: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvestorResponse {
    no: String,
    name: String,
    #[serde(default)]
    commitment: f64,
    #[serde(default)]
    called_amount: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackgroundTaskResponse {
    task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Error,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    status: TaskStatus,
    #[serde(default)]
    messages: Vec<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionLineItem {
    company_code: String,
    description: String,
    gl_account_no: String,
    amount: f64,
    trade_date: String,
    settlement_date: String,
    transaction_code: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionRequest {
    integration_code: &'static str,
    is_auto_submit_and_post: bool,
    line_items: Vec<TransactionLineItem>,
}

//
// ================= Client =================
//

pub struct HttpAccountingService {
    client: Client,
    config: AccountingApiConfig,
}

impl HttpAccountingService {
    pub fn new(config: AccountingApiConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { client, config })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.config.base_url, path);

        let mut request = self.client.request(method.clone(), &url).query(query);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        if let Some(company) = &self.config.company_name {
            request = request.header(HEADER_COMPANY_NAME, company);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            error!(%method, path, "Accounting API request failed: {}", e);
            if e.is_timeout() {
                WorkflowError::ServiceTimeout(format!("{} {} timed out", method, path))
            } else if e.is_connect() {
                WorkflowError::ServiceUnavailable(format!("{} {}: {}", method, path, e))
            } else {
                WorkflowError::ServiceError(format!("{} {}: {}", method, path, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(%method, path, status = status.as_u16(), "Accounting API error response");
            let message = format!("HTTP {} from {} {}: {}", status.as_u16(), method, path, text);
            return Err(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                WorkflowError::ServiceUnavailable(message)
            } else {
                WorkflowError::ServiceError(message)
            });
        }

        response.json::<T>().await.map_err(|e| {
            WorkflowError::ServiceError(format!("Invalid JSON from {} {}: {}", method, path, e))
        })
    }

    /// Fetch every page of a listing endpoint.
    async fn fetch_all<T: DeserializeOwned>(
        &self,
        path: &str,
        filter: Option<(&str, &str)>,
    ) -> Result<Vec<T>> {
        let limit = self.config.page_limit.max(1);
        let mut offset: u64 = 0;
        let mut items = Vec::new();

        loop {
            let mut query = vec![("limit", limit.to_string()), ("offset", offset.to_string())];
            if let Some((key, value)) = filter {
                query.push((key, value.to_string()));
            }

            let page: Page<T> = self.request(Method::GET, path, &query, None).await?;
            let fetched = page.items.len() as u64;
            items.extend(page.items);
            offset += fetched;

            let exhausted = match page.total_count {
                Some(total) => offset >= total,
                None => fetched < limit as u64,
            };
            if fetched == 0 || exhausted {
                break;
            }
        }

        debug!(path, count = items.len(), "Fetched listing");
        Ok(items)
    }

    async fn poll_task(&self, task_id: &str) -> Result<TaskResponse> {
        let path = format!("{}/{}", ENDPOINT_TASKS, task_id);

        for attempt in 1..=self.config.poll_max_attempts {
            let task: TaskResponse = self.request(Method::GET, &path, &[], None).await?;

            match task.status {
                TaskStatus::Completed => {
                    info!(task_id, attempts = attempt, "Task completed");
                    return Ok(task);
                }
                TaskStatus::Failed | TaskStatus::Error => {
                    error!(task_id, status = ?task.status, messages = ?task.messages, "Task failed");
                    return Err(WorkflowError::TaskFailed {
                        task_id: task_id.to_string(),
                        status: format!("{:?}", task.status),
                    });
                }
                TaskStatus::Pending | TaskStatus::Running => {
                    debug!(task_id, status = ?task.status, attempt, "Task pending");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        Err(WorkflowError::TaskTimeout {
            task_id: task_id.to_string(),
            attempts: self.config.poll_max_attempts,
        })
    }

    async fn run_task(&self, path: &str, body: Option<&Value>) -> Result<TaskResponse> {
        let task: BackgroundTaskResponse = self.request(Method::POST, path, &[], body).await?;
        self.poll_task(&task.task_id).await
    }

    fn transaction_request(data: &CapitalCallData) -> Result<TransactionRequest> {
        let missing = data.missing_fields();
        if !missing.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "cannot create document, missing: {}",
                missing.join(", ")
            )));
        }

        let fund_id = data.fund_id.clone().unwrap_or_default();
        let fund_name = data.fund_name.clone().unwrap_or_else(|| fund_id.clone());
        let trade_date = data.submit_date.map(|d| d.to_string()).unwrap_or_default();
        let settlement_date = data.posting_date.map(|d| d.to_string()).unwrap_or_default();
        let single_account = data.gl_accounts.len() == 1;

        let line_items = data
            .gl_accounts
            .iter()
            .map(|account| TransactionLineItem {
                company_code: fund_id.clone(),
                description: format!("Capital call - {}", fund_name),
                gl_account_no: account.code.clone(),
                amount: match (account.allocated_amount, single_account) {
                    (Some(amount), _) => amount,
                    (None, true) => data.amount.unwrap_or_default(),
                    (None, false) => 0.0,
                },
                trade_date: trade_date.clone(),
                settlement_date: settlement_date.clone(),
                transaction_code: TRANSACTION_CODE,
            })
            .collect();

        Ok(TransactionRequest {
            integration_code: "API",
            is_auto_submit_and_post: false,
            line_items,
        })
    }
}

#[async_trait]
impl AccountingService for HttpAccountingService {
    async fn search_funds(&self, query: &str) -> Result<Vec<ScoredCandidate<Fund>>> {
        let funds: Vec<FundResponse> = self.fetch_all(ENDPOINT_FUNDS, None).await?;
        let funds = funds
            .into_iter()
            .map(|f| Fund {
                id: f.code,
                name: f.name,
                currency_code: f.currency_code.unwrap_or_else(|| "USD".to_string()),
            })
            .collect();

        let list = SearchableList::new(funds, |f: &Fund| f.name.clone());
        Ok(list.search(query).into_hits().into_iter().map(Into::into).collect())
    }

    async fn get_gl_accounts(&self, fund_id: &str) -> Result<Vec<GLAccount>> {
        let accounts: Vec<GLAccountResponse> = self
            .fetch_all(ENDPOINT_GL_ACCOUNTS, Some(("fundCode", fund_id)))
            .await?;
        Ok(accounts
            .into_iter()
            .map(|a| GLAccount {
                code: a.no,
                name: a.name,
                allocated_amount: None,
            })
            .collect())
    }

    async fn get_investors(&self, fund_id: &str) -> Result<Vec<Investor>> {
        let investors: Vec<InvestorResponse> = self
            .fetch_all(ENDPOINT_INVESTORS, Some(("fundCode", fund_id)))
            .await?;
        Ok(investors
            .into_iter()
            .map(|i| Investor {
                id: i.no,
                name: i.name,
                commitment: i.commitment,
                called_amount: i.called_amount,
            })
            .collect())
    }

    async fn create_document(&self, data: &CapitalCallData) -> Result<String> {
        let body = serde_json::to_value(Self::transaction_request(data)?)?;
        let task = self.run_task(ENDPOINT_TRANSACTIONS, Some(&body)).await?;

        task.data
            .as_ref()
            .and_then(|d| d.get("transactionId").or_else(|| d.get("TransactionId")))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                WorkflowError::ServiceError("create task completed without a transaction id".into())
            })
    }

    async fn submit_document(&self, document_id: &str) -> Result<bool> {
        let path = format!("{}/{}/submit", ENDPOINT_TRANSACTIONS, document_id);
        self.run_task(&path, Some(&json!({}))).await?;
        Ok(true)
    }

    async fn post_document(&self, document_id: &str) -> Result<bool> {
        let path = format!("{}/{}/post", ENDPOINT_TRANSACTIONS, document_id);
        self.run_task(&path, Some(&json!({}))).await?;
        Ok(true)
    }
}
