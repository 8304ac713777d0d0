//! Bid placement and advisory loan analysis.
//!
//! Bids go to `/bidding/{loan_id}/load` on the JSON API. Every bid carries
//! the loan's current sequence hash; the server answers with the next one,
//! so consecutive bids on one loan must be sent in order through a
//! [`BiddingContext`].

use chrono::{DateTime, Utc};
use reqwest::header;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::harvester::ListingHarvester;
use super::listing;
use super::session::{read_json, read_text, SessionClient};
use crate::types::{
    BidRequest, BidResult, LendError, LoanAnalysis, LoanListing, PaymentOption, RiskLevel,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const RATE_LIMIT_HEADER: &str = "x-ratelimit-remaining";

/// Interest rate (percent) at or above which a loan is high risk.
const HIGH_RISK_RATE: Decimal = dec!(8.0);

/// Interest rate (percent) at or above which a loan is medium risk.
const MEDIUM_RISK_RATE: Decimal = dec!(6.0);

/// Share of the loan amount suggested as a bid.
const RECOMMENDED_SHARE: Decimal = dec!(0.10);

// ---------------------------------------------------------------------------
// Bidding context
// ---------------------------------------------------------------------------

/// Bidding state for one loan as last seen from the server.
#[derive(Debug, Clone, Serialize)]
pub struct BiddingContext {
    pub loan_id: i64,
    pub sequence_hash: String,
    pub raw: Value,
    pub fetched_at: DateTime<Utc>,
}

impl BiddingContext {
    /// Adopt the hash echoed by an accepted bid. Empty echoes are ignored.
    pub fn advance(&mut self, echoed: &str) {
        let echoed = echoed.trim();
        if !echoed.is_empty() {
            self.sequence_hash = echoed.to_string();
        }
    }

    /// Build the next bid in this context.
    pub fn bid(&self, amount: i64, payment_option: PaymentOption) -> Result<BidRequest, LendError> {
        let request = BidRequest {
            loan_id: self.loan_id,
            amount,
            payment_option,
            sequence_hash: self.sequence_hash.clone(),
        };
        request.validate()?;
        Ok(request)
    }
}

#[derive(Serialize)]
struct BidPayload<'a> {
    amount: String,
    intention: &'static str,
    sequence_hash: &'a str,
    payment_options: [&'static str; 1],
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BiddingEngine {
    session: Arc<SessionClient>,
    harvester: Arc<ListingHarvester>,
    min_bid_floor: i64,
}

impl BiddingEngine {
    pub fn new(
        session: Arc<SessionClient>,
        harvester: Arc<ListingHarvester>,
        min_bid_floor: i64,
    ) -> Self {
        Self {
            session,
            harvester,
            min_bid_floor,
        }
    }

    fn bidding_url(&self, loan_id: i64) -> String {
        self.session
            .config()
            .api_url(&format!("/bidding/{loan_id}/load"))
    }

    fn referer(&self) -> String {
        format!("{}/", self.session.config().base_url.trim_end_matches('/'))
    }

    /// Load the current bidding state (and sequence hash) for a loan.
    pub async fn load_context(&self, loan_id: i64) -> Result<BiddingContext, LendError> {
        if loan_id <= 0 {
            return Err(LendError::Validation(format!("invalid loan id {loan_id}")));
        }

        let request = self
            .session
            .http()
            .get(self.bidding_url(loan_id))
            .header(header::ORIGIN, &self.session.config().base_url)
            .header(header::REFERER, self.referer());
        let resp = self.session.send(request).await?;
        let raw = read_json(resp).await?;

        let sequence_hash = raw
            .get("sequence_hash")
            .or_else(|| raw.pointer("/data/sequence_hash"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if sequence_hash.is_empty() {
            warn!(loan_id, "Bidding context carries no sequence hash");
        }
        info!(loan_id, "Loaded bidding context");

        Ok(BiddingContext {
            loan_id,
            sequence_hash,
            raw,
            fetched_at: Utc::now(),
        })
    }

    /// Submit a bid, returning an error for anything but an accepted bid.
    ///
    /// Invalid requests fail with [`LendError::Validation`] before any
    /// network traffic.
    pub async fn try_place_bid(&self, request: &BidRequest) -> Result<BidResult, LendError> {
        request.validate()?;

        let payload = BidPayload {
            amount: request.amount.to_string(),
            intention: "add",
            sequence_hash: &request.sequence_hash,
            payment_options: [request.payment_option.code()],
        };
        let builder = self
            .session
            .http()
            .post(self.bidding_url(request.loan_id))
            .header(header::ORIGIN, &self.session.config().base_url)
            .header(header::REFERER, self.referer())
            .json(&payload);

        let resp = self.session.send(builder).await?;
        let remaining = resp
            .headers()
            .get(RATE_LIMIT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());

        let text = read_text(resp).await?;
        let body: Value = serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text));
        let echoed = body
            .get("sequence_hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        info!(
            loan_id = request.loan_id,
            amount = request.amount,
            option = %request.payment_option,
            rate_limit_remaining = ?remaining,
            "Bid accepted"
        );
        if remaining == Some(0) {
            warn!(loan_id = request.loan_id, "Bid rate limit exhausted");
        }

        Ok(BidResult::accepted(echoed, remaining, body))
    }

    /// Submit a bid, folding every failure into the returned [`BidResult`].
    pub async fn place_bid(&self, request: &BidRequest) -> BidResult {
        match self.try_place_bid(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(loan_id = request.loan_id, error = %e, "Bid failed");
                BidResult::rejected(&e)
            }
        }
    }

    /// Bid within a context and carry the echoed hash forward on success.
    pub async fn place_bid_in_context(
        &self,
        context: &mut BiddingContext,
        amount: i64,
        payment_option: PaymentOption,
    ) -> Result<BidResult, LendError> {
        let request = context.bid(amount, payment_option)?;
        let result = self.try_place_bid(&request).await?;
        context.advance(result.sequence_hash.as_deref().unwrap_or_default());
        Ok(result)
    }

    /// Assess a loan from the first listing page. `Ok(None)` when the loan is
    /// not currently listed there.
    pub async fn analyze(&self, loan_id: i64) -> Result<Option<LoanAnalysis>, LendError> {
        if loan_id <= 0 {
            return Err(LendError::Validation(format!("invalid loan id {loan_id}")));
        }

        let target = loan_id.to_string();
        let records = self.harvester.fetch_page(1).await?;
        let Some(record) = records
            .iter()
            .find(|r| listing::record_id(r).as_deref() == Some(target.as_str()))
        else {
            info!(loan_id, "Loan not found among current listings");
            return Ok(None);
        };

        let listing = listing::convert(record)?;
        let mut notes = Vec::new();
        let sequence_hash = match self.load_context(loan_id).await {
            Ok(context) => Some(context.sequence_hash),
            Err(e) => {
                debug!(loan_id, error = %e, "Analysis continues without bidding context");
                notes.push(format!("bidding context unavailable: {e}"));
                None
            }
        };

        Ok(Some(assess(&listing, sequence_hash, notes, self.min_bid_floor)))
    }
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

pub fn risk_level(interest_rate: Option<Decimal>) -> RiskLevel {
    match interest_rate {
        Some(rate) if rate >= HIGH_RISK_RATE => RiskLevel::High,
        Some(rate) if rate >= MEDIUM_RISK_RATE => RiskLevel::Medium,
        Some(rate) if rate > Decimal::ZERO => RiskLevel::Low,
        _ => RiskLevel::Unknown,
    }
}

/// max(floor, 10% of amount), rounded down to whole currency units.
pub fn recommended_bid(amount: Decimal, floor: i64) -> i64 {
    let share = (amount * RECOMMENDED_SHARE)
        .floor()
        .to_i64()
        .unwrap_or(i64::MAX);
    share.max(floor)
}

fn assess(
    listing: &LoanListing,
    sequence_hash: Option<String>,
    mut notes: Vec<String>,
    floor: i64,
) -> LoanAnalysis {
    let accepts_bids = listing.status.accepts_bids();
    let has_amount = listing.amount > Decimal::ZERO;
    let viable = accepts_bids && has_amount;

    if !accepts_bids {
        notes.push(format!("loan is {}, not accepting bids", listing.status));
    }
    if !has_amount {
        notes.push("loan has no positive amount".to_string());
    }

    let risk = risk_level(listing.interest_rate);
    match risk {
        RiskLevel::High => notes.push("high interest rate, elevated default risk".to_string()),
        RiskLevel::Unknown => notes.push("no interest rate listed".to_string()),
        _ => {}
    }

    LoanAnalysis {
        loan_id: listing.loan_id.clone(),
        title: listing.title.clone(),
        status: listing.status,
        amount: listing.amount,
        interest_rate: listing.interest_rate,
        viable,
        risk_level: risk,
        recommended_bid_amount: viable.then(|| recommended_bid(listing.amount, floor)),
        sequence_hash,
        notes,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
