//! In-memory accounting service
//!
//! Seeded reference data, a record of created documents, and failure
//! injection per operation. Used by tests and the demo binary.

use crate::error::WorkflowError;
use crate::models::{CapitalCallData, DocumentStatus, Fund, GLAccount, Investor, ScoredCandidate};
use crate::services::search::SearchableList;
use crate::services::AccountingService;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceOperation {
    SearchFunds,
    GetGlAccounts,
    GetInvestors,
    CreateDocument,
    SubmitDocument,
    PostDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Surfaces as `ServiceUnavailable`
    Transient,
    /// Surfaces as `ServiceError`
    Permanent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document_id: String,
    pub data: CapitalCallData,
    pub status: DocumentStatus,
}

#[derive(Default)]
struct Inner {
    documents: Vec<StoredDocument>,
    failures: HashMap<ServiceOperation, (InjectedFailure, u32)>,
    calls: HashMap<ServiceOperation, u32>,
}

pub struct InMemoryAccountingService {
    funds: Vec<Fund>,
    accounts: HashMap<String, Vec<GLAccount>>,
    investors: HashMap<String, Vec<Investor>>,
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryAccountingService {
    pub fn new() -> Self {
        Self {
            funds: Vec::new(),
            accounts: HashMap::new(),
            investors: HashMap::new(),
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn with_fund(mut self, fund: Fund) -> Self {
        self.funds.push(fund);
        self
    }

    pub fn with_accounts(mut self, fund_id: &str, accounts: Vec<GLAccount>) -> Self {
        self.accounts.insert(fund_id.to_string(), accounts);
        self
    }

    pub fn with_investors(mut self, fund_id: &str, investors: Vec<Investor>) -> Self {
        self.investors.insert(fund_id.to_string(), investors);
        self
    }

    /// A small fund book used by the demo binary and tests.
    pub fn seeded() -> Self {
        let fund = |id: &str, name: &str| Fund {
            id: id.to_string(),
            name: name.to_string(),
            currency_code: "USD".to_string(),
        };
        let account = |code: &str, name: &str| GLAccount {
            code: code.to_string(),
            name: name.to_string(),
            allocated_amount: None,
        };
        let investor = |id: &str, name: &str, commitment: f64, called: f64| Investor {
            id: id.to_string(),
            name: name.to_string(),
            commitment,
            called_amount: called,
        };

        let standard_accounts = vec![
            account("4000", "Capital Contributions"),
            account("4100", "Management Fee Contributions"),
            account("4200", "Organizational Expense Contributions"),
        ];

        Self::new()
            .with_fund(fund("EGF3", "Evergreen Growth Fund III"))
            .with_fund(fund("EIF1", "Evergreen Income Fund"))
            .with_fund(fund("HCO2", "Harbor Credit Opportunities Fund"))
            .with_fund(fund("SVF4", "Summit Ventures Fund IV"))
            .with_accounts("EGF3", standard_accounts.clone())
            .with_accounts("EIF1", standard_accounts.clone())
            .with_accounts("HCO2", standard_accounts.clone())
            .with_accounts("SVF4", standard_accounts)
            .with_investors(
                "EGF3",
                vec![
                    investor("INV-001", "Northwind Pension Plan", 20_000_000.0, 5_000_000.0),
                    investor("INV-002", "Bluebird Endowment", 10_000_000.0, 2_500_000.0),
                ],
            )
            .with_investors(
                "HCO2",
                vec![investor("INV-010", "Granite Family Office", 5_000_000.0, 4_000_000.0)],
            )
    }

    /// Make the next `times` calls to `operation` fail.
    pub async fn fail_next(&self, operation: ServiceOperation, failure: InjectedFailure, times: u32) {
        let mut inner = self.inner.write().await;
        inner.failures.insert(operation, (failure, times));
    }

    pub async fn call_count(&self, operation: ServiceOperation) -> u32 {
        let inner = self.inner.read().await;
        inner.calls.get(&operation).copied().unwrap_or(0)
    }

    pub async fn documents(&self) -> Vec<StoredDocument> {
        self.inner.read().await.documents.clone()
    }

    async fn enter(&self, operation: ServiceOperation) -> Result<()> {
        let mut inner = self.inner.write().await;
        *inner.calls.entry(operation).or_insert(0) += 1;

        let Some((failure, remaining)) = inner.failures.get_mut(&operation) else {
            return Ok(());
        };
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;

        let message = format!("injected failure in {:?}", operation);
        Err(match failure {
            InjectedFailure::Transient => WorkflowError::ServiceUnavailable(message),
            InjectedFailure::Permanent => WorkflowError::ServiceError(message),
        })
    }

    async fn advance(&self, document_id: &str, to: DocumentStatus) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let doc = inner
            .documents
            .iter_mut()
            .find(|d| d.document_id == document_id)
            .ok_or_else(|| WorkflowError::ServiceError(format!("unknown document {}", document_id)))?;
        doc.status = to;
        Ok(true)
    }
}

impl Default for InMemoryAccountingService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountingService for InMemoryAccountingService {
    async fn search_funds(&self, query: &str) -> Result<Vec<ScoredCandidate<Fund>>> {
        self.enter(ServiceOperation::SearchFunds).await?;
        let list = SearchableList::new(self.funds.clone(), |f: &Fund| f.name.clone());
        Ok(list.search(query).into_hits().into_iter().map(Into::into).collect())
    }

    async fn get_gl_accounts(&self, fund_id: &str) -> Result<Vec<GLAccount>> {
        self.enter(ServiceOperation::GetGlAccounts).await?;
        Ok(self.accounts.get(fund_id).cloned().unwrap_or_default())
    }

    async fn get_investors(&self, fund_id: &str) -> Result<Vec<Investor>> {
        self.enter(ServiceOperation::GetInvestors).await?;
        Ok(self.investors.get(fund_id).cloned().unwrap_or_default())
    }

    async fn create_document(&self, data: &CapitalCallData) -> Result<String> {
        self.enter(ServiceOperation::CreateDocument).await?;
        let mut inner = self.inner.write().await;
        let document_id = format!("CC-{:05}", inner.documents.len() + 1);
        inner.documents.push(StoredDocument {
            document_id: document_id.clone(),
            data: data.clone(),
            status: DocumentStatus::Created,
        });
        Ok(document_id)
    }

    async fn submit_document(&self, document_id: &str) -> Result<bool> {
        self.enter(ServiceOperation::SubmitDocument).await?;
        self.advance(document_id, DocumentStatus::Submitted).await
    }

    async fn post_document(&self, document_id: &str) -> Result<bool> {
        self.enter(ServiceOperation::PostDocument).await?;
        self.advance(document_id, DocumentStatus::Posted).await
    }
}
