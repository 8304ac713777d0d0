//! Paginated listing harvester.
//!
//! Walks the investment-options endpoint page by page until the page limit,
//! an empty page, or a failed request. Nothing is retried. Records are
//! returned raw; the same loan may appear on two pages if the listing
//! shifts between requests, so callers de-duplicate by loan id.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::session::SessionClient;
use crate::types::{HarvestStop, LendError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const LISTING_PATH: &str = "/loans/listing/investment-options";
const LOAN_DETAILS_PATH: &str = "/loans";

/// Market filters sent with every listing request.
const ORIGIN_FILTERS: &[(&str, &str)] = &[
    ("subscription_origin_sweden", "1"),
    ("subscription_origin_norway", "0"),
    ("subscription_origin_denmark", "1"),
];

/// Result of one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestOutcome {
    /// Raw records in page order. May contain duplicates across pages.
    pub records: Vec<Value>,
    pub pages_fetched: u32,
    pub stop: HarvestStop,
}

// ---------------------------------------------------------------------------
// Harvester
// ---------------------------------------------------------------------------

pub struct ListingHarvester {
    session: Arc<SessionClient>,
    page_size: u32,
}

impl ListingHarvester {
    pub fn new(session: Arc<SessionClient>, page_size: u32) -> Self {
        Self {
            session,
            page_size: page_size.max(1),
        }
    }

    /// Fetch one page (1-based) and extract its records.
    pub async fn fetch_page(&self, page: u32) -> Result<Vec<Value>, LendError> {
        let url = self.session.config().api_url(LISTING_PATH);
        let mut query: Vec<(&str, String)> = ORIGIN_FILTERS
            .iter()
            .map(|(k, v)| (*k, (*v).to_string()))
            .collect();
        query.push(("limit", self.page_size.to_string()));
        query.push(("page", page.to_string()));

        let body = self.session.get_json(&url, &query).await?;
        let records = extract_records(&body)?;
        debug!(page, count = records.len(), "Fetched listing page");
        Ok(records)
    }

    /// Fetch pages `1..=max_pages`, stopping early on an empty page or error.
    ///
    /// A failure on the first page is returned as an error. A failure on a
    /// later page keeps what was already collected and is reported through
    /// [`HarvestOutcome::stop`].
    pub async fn harvest(&self, max_pages: u32) -> Result<HarvestOutcome, LendError> {
        let mut records = Vec::new();
        let mut pages_fetched = 0;
        let mut stop = HarvestStop::PageLimit;

        for page in 1..=max_pages {
            match self.fetch_page(page).await {
                Ok(batch) if batch.is_empty() => {
                    info!(page, "Empty listing page, stopping");
                    stop = HarvestStop::EmptyPage { page };
                    break;
                }
                Ok(batch) => {
                    pages_fetched += 1;
                    records.extend(batch);
                }
                Err(e) if page == 1 => return Err(e),
                Err(e) => {
                    warn!(page, error = %e, "Listing page failed, keeping earlier pages");
                    stop = HarvestStop::RequestFailed {
                        page,
                        error: e.to_string(),
                    };
                    break;
                }
            }
        }

        info!(
            records = records.len(),
            pages = pages_fetched,
            stop = ?stop,
            "Harvest complete"
        );
        Ok(HarvestOutcome {
            records,
            pages_fetched,
            stop,
        })
    }

    /// Full record for a single loan.
    pub async fn fetch_loan_details(&self, loan_id: &str) -> Result<Value, LendError> {
        let path = format!("{LOAN_DETAILS_PATH}/{}", urlencoding::encode(loan_id));
        let url = self.session.config().api_url(&path);
        match self.session.get_json(&url, &[]).await {
            Err(LendError::Transport(crate::types::TransportError::Status { status: 404, .. })) => {
                Err(LendError::NotFound(format!("loan {loan_id}")))
            }
            other => other,
        }
    }
}

/// Records from either `{"data": [...]}` or `{"data": {"investment_options":
/// [...]}}`, also accepting `{"data": {"loans": [...]}}`.
pub fn extract_records(body: &Value) -> Result<Vec<Value>, LendError> {
    let data = body
        .get("data")
        .ok_or_else(|| LendError::ProtocolShape("listing response has no `data` field".into()))?;

    let list = match data {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("investment_options").or_else(|| obj.get("loans")) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => return Ok(Vec::new()),
            Some(_) => {
                return Err(LendError::ProtocolShape(
                    "listing `data` collection is not an array".into(),
                ))
            }
        },
        Value::Null => return Ok(Vec::new()),
        _ => {
            return Err(LendError::ProtocolShape(
                "listing `data` is neither an array nor an object".into(),
            ))
        }
    };

    Ok(list.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
