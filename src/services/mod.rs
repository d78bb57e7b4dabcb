//! Accounting service boundary
//!
//! Every external call the workflow makes goes through `AccountingService`,
//! so nodes can be exercised against the in-memory fake.

use crate::config::AppConfig;
use crate::models::{CapitalCallData, Fund, GLAccount, Investor, ScoredCandidate};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub mod http;
pub mod memory;
pub mod retry;
pub mod search;

pub use http::HttpAccountingService;
pub use memory::{InMemoryAccountingService, InjectedFailure, ServiceOperation};
pub use retry::RetryingAccountingService;
pub use search::{SearchHit, SearchResults, SearchableList};

#[async_trait]
pub trait AccountingService: Send + Sync {
    /// Candidates ranked by score, highest first
    async fn search_funds(&self, query: &str) -> Result<Vec<ScoredCandidate<Fund>>>;

    async fn get_gl_accounts(&self, fund_id: &str) -> Result<Vec<GLAccount>>;

    async fn get_investors(&self, fund_id: &str) -> Result<Vec<Investor>>;

    /// Investors of a fund ranked by name similarity to `query`.
    async fn search_investors(
        &self,
        fund_id: &str,
        query: &str,
    ) -> Result<Vec<ScoredCandidate<Investor>>> {
        let investors = self.get_investors(fund_id).await?;
        let list = SearchableList::new(investors, |i: &Investor| i.name.clone());
        Ok(list.search(query).into_hits().into_iter().map(Into::into).collect())
    }

    /// Creates the document and returns its id. Not idempotent.
    async fn create_document(&self, data: &CapitalCallData) -> Result<String>;

    async fn submit_document(&self, document_id: &str) -> Result<bool>;

    async fn post_document(&self, document_id: &str) -> Result<bool>;
}

/// HTTP client for the configured accounting API, wrapped in the retry policy.
pub fn build_accounting_service(config: &AppConfig) -> Result<Arc<dyn AccountingService>> {
    let http = HttpAccountingService::new(config.accounting.clone())?;
    Ok(Arc::new(RetryingAccountingService::new(
        Arc::new(http),
        config.retry.clone(),
    )))
}
