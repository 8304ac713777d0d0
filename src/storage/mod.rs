//! Persistence layer.
//!
//! Harvested loans are handed to a [`LoanStore`], which upserts them keyed
//! by loan id. [`JsonLoanStore`] keeps the set in memory and, when given a
//! path, snapshots it to a JSON file after every batch. Snapshots are
//! written to a temp file and renamed into place, one at a time.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{LendError, LoanListing, LoanPage, LoanStats, LoanStatus, SaveSummary};

/// Default snapshot file path.
pub const DEFAULT_LOANS_FILE: &str = "lendbot_loans.json";

/// Idempotent loan persistence.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoanStore: Send + Sync {
    /// Insert or update each listing by `loan_id`. Invalid listings are
    /// counted as failed and skipped; they never abort the batch.
    async fn upsert_loans(&self, loans: &[LoanListing]) -> Result<SaveSummary, LendError>;

    /// Number of distinct loans stored.
    async fn count(&self) -> Result<usize, LendError>;

    /// Stored loans ordered by id, `limit` per page, pages 1-based.
    async fn list_loans(&self, page: usize, limit: usize) -> Result<LoanPage, LendError>;

    /// Counts and amount/rate aggregates over all stored loans.
    async fn stats(&self) -> Result<LoanStats, LendError>;
}

/// In-memory loan map with an optional JSON snapshot.
pub struct JsonLoanStore {
    loans: RwLock<HashMap<String, LoanListing>>,
    path: Option<PathBuf>,
    /// Held from serialization until the file is renamed into place.
    snapshot_lock: tokio::sync::Mutex<()>,
}

impl JsonLoanStore {
    pub fn in_memory() -> Self {
        Self::with_loans(HashMap::new(), None)
    }

    fn with_loans(loans: HashMap<String, LoanListing>, path: Option<PathBuf>) -> Self {
        Self {
            loans: RwLock::new(loans),
            path,
            snapshot_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a store backed by `path`, loading an existing snapshot if any.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LendError> {
        let path = path.as_ref().to_path_buf();
        let mut loans = HashMap::new();

        if path.exists() {
            let json = std::fs::read_to_string(&path).map_err(|e| {
                LendError::Persistence(format!("failed to read {}: {e}", path.display()))
            })?;
            let stored: Vec<LoanListing> = serde_json::from_str(&json).map_err(|e| {
                LendError::Persistence(format!("failed to parse {}: {e}", path.display()))
            })?;
            for loan in stored {
                loans.insert(loan.loan_id.clone(), loan);
            }
            info!(path = %path.display(), loans = loans.len(), "Loan snapshot loaded");
        } else {
            info!(path = %path.display(), "No loan snapshot found, starting empty");
        }

        Ok(Self::with_loans(loans, Some(path)))
    }

    pub fn get(&self, loan_id: &str) -> Option<LoanListing> {
        self.loans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(loan_id)
            .cloned()
    }

    fn sorted(&self) -> Vec<LoanListing> {
        let mut loans: Vec<LoanListing> = self
            .loans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        loans.sort_by(|a, b| a.loan_id.cmp(&b.loan_id));
        loans
    }

    async fn snapshot(&self, path: &Path) -> Result<(), LendError> {
        let _guard = self.snapshot_lock.lock().await;

        let loans = self.sorted();
        let json = serde_json::to_string_pretty(&loans)
            .map_err(|e| LendError::Persistence(format!("failed to serialise loans: {e}")))?;

        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_atomically(&target, &json))
            .await
            .map_err(|e| LendError::Persistence(format!("snapshot task failed: {e}")))??;

        debug!(path = %path.display(), loans = loans.len(), "Loan snapshot saved");
        Ok(())
    }
}

/// Write `contents` next to `path` under a unique name, then rename over it.
fn write_atomically(path: &Path, contents: &str) -> Result<(), LendError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_LOANS_FILE.to_string());
    let tmp = path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()));

    std::fs::write(&tmp, contents)
        .map_err(|e| LendError::Persistence(format!("failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        LendError::Persistence(format!("failed to replace {}: {e}", path.display()))
    })
}

fn loan_stats(loans: &[LoanListing]) -> LoanStats {
    if loans.is_empty() {
        return LoanStats::default();
    }

    let with_status = |status: LoanStatus| loans.iter().filter(|l| l.status == status).count();
    let total_amount: Decimal = loans.iter().map(|l| l.amount).sum();
    let rates: Vec<Decimal> = loans.iter().filter_map(|l| l.interest_rate).collect();
    let average_interest_rate = (!rates.is_empty()).then(|| {
        (rates.iter().copied().sum::<Decimal>() / Decimal::from(rates.len())).round_dp(2)
    });

    LoanStats {
        total_loans: loans.len(),
        open_loans: with_status(LoanStatus::Open),
        closed_loans: with_status(LoanStatus::Closed),
        funded_loans: with_status(LoanStatus::Funded),
        total_amount,
        average_amount: (total_amount / Decimal::from(loans.len())).round_dp(2),
        min_amount: loans.iter().map(|l| l.amount).min().unwrap_or_default(),
        max_amount: loans.iter().map(|l| l.amount).max().unwrap_or_default(),
        average_interest_rate,
    }
}

#[async_trait]
impl LoanStore for JsonLoanStore {
    async fn upsert_loans(&self, loans: &[LoanListing]) -> Result<SaveSummary, LendError> {
        let mut summary = SaveSummary::default();
        {
            let mut stored = self.loans.write().unwrap_or_else(PoisonError::into_inner);
            for loan in loans {
                if let Err(e) = loan.validate() {
                    warn!(loan_id = %loan.loan_id, error = %e, "Not saving invalid loan");
                    summary.failed += 1;
                    continue;
                }
                match stored.insert(loan.loan_id.clone(), loan.clone()) {
                    Some(_) => summary.updated += 1,
                    None => summary.created += 1,
                }
            }
        }

        if let Some(ref path) = self.path {
            self.snapshot(path).await?;
        }

        info!(
            created = summary.created,
            updated = summary.updated,
            failed = summary.failed,
            "Loans saved"
        );
        Ok(summary)
    }

    async fn count(&self) -> Result<usize, LendError> {
        Ok(self.loans.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    async fn list_loans(&self, page: usize, limit: usize) -> Result<LoanPage, LendError> {
        if page == 0 || limit == 0 {
            return Err(LendError::Validation(format!(
                "page and limit must be at least 1 (got page {page}, limit {limit})"
            )));
        }

        let all = self.sorted();
        let total = all.len();
        let loans = all
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();
        Ok(LoanPage {
            loans,
            total,
            page,
            limit,
        })
    }

    async fn stats(&self) -> Result<LoanStats, LendError> {
        Ok(loan_stats(&self.sorted()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
