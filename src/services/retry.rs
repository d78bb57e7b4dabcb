//! Retry policy around an accounting service
//!
//! Transient failures (timeouts, 429, 5xx, refused connections) are retried
//! with exponential backoff and jitter. Document creation is never retried:
//! a timed-out create may still have produced a document.

use crate::config::RetryConfig;
use crate::models::{CapitalCallData, Fund, GLAccount, Investor, ScoredCandidate};
use crate::services::AccountingService;
use crate::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct RetryingAccountingService {
    inner: Arc<dyn AccountingService>,
    config: RetryConfig,
}

impl RetryingAccountingService {
    pub fn new(inner: Arc<dyn AccountingService>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.config.max_retries;
        let mut attempt = 0;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    let backoff = calculate_backoff(attempt, &self.config);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying accounting call"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let initial = config.initial_backoff.as_millis() as u64;
    let cap = config.max_backoff.as_millis() as u64;
    let ms = initial
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(cap);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[async_trait]
impl AccountingService for RetryingAccountingService {
    async fn search_funds(&self, query: &str) -> Result<Vec<ScoredCandidate<Fund>>> {
        self.with_retry("search_funds", || self.inner.search_funds(query))
            .await
    }

    async fn get_gl_accounts(&self, fund_id: &str) -> Result<Vec<GLAccount>> {
        self.with_retry("get_gl_accounts", || self.inner.get_gl_accounts(fund_id))
            .await
    }

    async fn get_investors(&self, fund_id: &str) -> Result<Vec<Investor>> {
        self.with_retry("get_investors", || self.inner.get_investors(fund_id))
            .await
    }

    async fn create_document(&self, data: &CapitalCallData) -> Result<String> {
        self.inner.create_document(data).await
    }

    async fn submit_document(&self, document_id: &str) -> Result<bool> {
        self.with_retry("submit_document", || self.inner.submit_document(document_id))
            .await
    }

    async fn post_document(&self, document_id: &str) -> Result<bool> {
        self.with_retry("post_document", || self.inner.post_document(document_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{InMemoryAccountingService, InjectedFailure, ServiceOperation};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn wrap(inner: &Arc<InMemoryAccountingService>, max_retries: u32) -> RetryingAccountingService {
        let inner: Arc<dyn AccountingService> = inner.clone();
        RetryingAccountingService::new(inner, fast_config(max_retries))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8_000),
        };
        let first = calculate_backoff(0, &config).as_millis();
        assert!((400..=600).contains(&first));

        let third = calculate_backoff(2, &config).as_millis();
        assert!((1_600..=2_400).contains(&third));

        let capped = calculate_backoff(30, &config).as_millis();
        assert!(capped <= 9_600);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let inner = Arc::new(InMemoryAccountingService::seeded());
        inner
            .fail_next(ServiceOperation::GetGlAccounts, InjectedFailure::Transient, 2)
            .await;

        let service = wrap(&inner, 3);
        let accounts = service.get_gl_accounts("EGF3").await.unwrap();
        assert_eq!(accounts.len(), 3);
        assert_eq!(inner.call_count(ServiceOperation::GetGlAccounts).await, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let inner = Arc::new(InMemoryAccountingService::seeded());
        inner
            .fail_next(ServiceOperation::SearchFunds, InjectedFailure::Transient, 10)
            .await;

        let service = wrap(&inner, 2);
        assert!(service.search_funds("Evergreen").await.is_err());
        assert_eq!(inner.call_count(ServiceOperation::SearchFunds).await, 3);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let inner = Arc::new(InMemoryAccountingService::seeded());
        inner
            .fail_next(ServiceOperation::GetInvestors, InjectedFailure::Permanent, 1)
            .await;

        let service = wrap(&inner, 3);
        assert!(service.get_investors("EGF3").await.is_err());
        assert_eq!(inner.call_count(ServiceOperation::GetInvestors).await, 1);
    }

    #[tokio::test]
    async fn test_create_document_is_never_retried() {
        let inner = Arc::new(InMemoryAccountingService::seeded());
        inner
            .fail_next(ServiceOperation::CreateDocument, InjectedFailure::Transient, 1)
            .await;

        let service = wrap(&inner, 3);
        let data = CapitalCallData::default();
        assert!(service.create_document(&data).await.is_err());
        assert_eq!(inner.call_count(ServiceOperation::CreateDocument).await, 1);
        assert!(inner.documents().await.is_empty());
    }
}
