//! Caller-facing operations.
//!
//! `LendingService` turns harvest, bid and analysis requests into background
//! jobs. Input is validated before a job exists; everything after that is
//! reported through the job record.

use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::jobs::JobRegistry;
use crate::marketplace::{listing, Marketplace};
use crate::storage::LoanStore;
use crate::types::{
    BidRequest, JobId, JobKind, JobSnapshot, JobSummary, LendError, LoanPage, LoanStats,
    SaveSummary,
};

/// Largest page accepted by [`LendingService::stored_loans`].
pub const MAX_LOANS_PER_PAGE: usize = 500;

pub struct LendingService {
    marketplace: Marketplace,
    store: Arc<dyn LoanStore>,
    registry: JobRegistry,
    default_max_pages: u32,
}

impl LendingService {
    pub fn new(
        marketplace: Marketplace,
        store: Arc<dyn LoanStore>,
        registry: JobRegistry,
        default_max_pages: u32,
    ) -> Self {
        Self {
            marketplace,
            store,
            registry,
            default_max_pages,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn default_max_pages(&self) -> u32 {
        self.default_max_pages
    }

    /// Harvest up to `max_pages` listing pages and persist the valid loans.
    pub fn submit_harvest_job(&self, max_pages: u32) -> Result<JobId, LendError> {
        if max_pages == 0 {
            return Err(LendError::Validation("max_pages must be at least 1".into()));
        }

        let marketplace = self.marketplace.clone();
        let store = self.store.clone();
        let work = async move { run_harvest(marketplace, store, max_pages).await }.boxed();
        self.registry.submit(JobKind::Harvest { max_pages }, work)
    }

    /// Place one bid. Invalid input is rejected here, before a job exists.
    pub fn submit_bid_job(
        &self,
        loan_id: i64,
        amount: i64,
        payment_option: &str,
    ) -> Result<JobId, LendError> {
        let request = BidRequest::new(loan_id, amount, payment_option, "")?;
        let kind = JobKind::Bid {
            loan_id,
            amount,
            payment_option: request.payment_option,
        };

        let marketplace = self.marketplace.clone();
        let work = async move {
            marketplace.session.ensure_authenticated().await?;
            let mut context = marketplace.bidding.load_context(request.loan_id).await?;
            let result = marketplace
                .bidding
                .place_bid_in_context(&mut context, request.amount, request.payment_option)
                .await?;
            Ok(json!(result))
        }
        .boxed();
        self.registry.submit(kind, work)
    }

    /// Analyze a loan for bidding in the background.
    pub fn submit_analysis_job(&self, loan_id: i64) -> Result<JobId, LendError> {
        if loan_id <= 0 {
            return Err(LendError::Validation(format!("invalid loan id {loan_id}")));
        }

        let marketplace = self.marketplace.clone();
        let work = async move {
            marketplace.session.ensure_authenticated().await?;
            match marketplace.bidding.analyze(loan_id).await? {
                Some(analysis) => Ok(json!(analysis)),
                None => Err(LendError::NotFound(format!(
                    "loan {loan_id} is not among current listings"
                ))),
            }
        }
        .boxed();
        self.registry.submit(JobKind::Analysis { loan_id }, work)
    }

    pub fn get_job(&self, job_id: JobId) -> Result<JobSnapshot, LendError> {
        self.registry.get(job_id)
    }

    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.registry.list()
    }

    pub fn cancel_job(&self, job_id: JobId) -> bool {
        self.registry.cancel(job_id)
    }

    /// Page through persisted loans. `limit` is capped at [`MAX_LOANS_PER_PAGE`].
    pub async fn stored_loans(&self, page: usize, limit: usize) -> Result<LoanPage, LendError> {
        if limit > MAX_LOANS_PER_PAGE {
            return Err(LendError::Validation(format!(
                "limit {limit} exceeds {MAX_LOANS_PER_PAGE}"
            )));
        }
        self.store.list_loans(page, limit).await
    }

    pub async fn loan_stats(&self) -> Result<LoanStats, LendError> {
        self.store.stats().await
    }
}

async fn run_harvest(
    marketplace: Marketplace,
    store: Arc<dyn LoanStore>,
    max_pages: u32,
) -> Result<Value, LendError> {
    marketplace.session.ensure_authenticated().await?;
    let outcome = marketplace.harvester.harvest(max_pages).await?;
    let (loans, rejected) = listing::normalize_all(&outcome.records);

    let saved = if loans.is_empty() {
        SaveSummary::default()
    } else {
        store.upsert_loans(&loans).await?
    };

    info!(
        fetched = outcome.records.len(),
        valid = loans.len(),
        created = saved.created,
        updated = saved.updated,
        "Harvest job finished"
    );

    let mut result = json!({
        "count": outcome.records.len(),
        "valid": loans.len(),
        "rejected": rejected,
        "saved": saved,
        "pages_fetched": outcome.pages_fetched,
        "stopped_by": outcome.stop,
    });
    if outcome.records.is_empty() {
        result["message"] = json!("No loans found");
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
