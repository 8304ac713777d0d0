//! Shared types for the LENDBOT agent.
//!
//! These types form the data model used across all modules: credentials
//! and session state, normalized loan listings, bid requests/results,
//! job records, and the domain error taxonomy.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Credentials & session state
// ---------------------------------------------------------------------------

/// Login credentials, immutable for the lifetime of the process.
///
/// Password and TOTP secret are wrapped in [`SecretString`] so they never
/// end up in `Debug` output or logs.
pub struct Credentials {
    email: String,
    password: SecretString,
    totp_secret: Option<SecretString>,
}

impl Credentials {
    /// Build and validate credentials.
    ///
    /// Fails with [`LendError::Configuration`] when the email or password is
    /// empty, or when a TOTP secret is supplied that does not decode to at
    /// least one byte. A blank secret is treated as "no second factor".
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        totp_secret: Option<String>,
    ) -> Result<Self, LendError> {
        let email = email.into().trim().to_string();
        if email.is_empty() {
            return Err(LendError::Configuration("email must not be empty".into()));
        }

        let password = password.into();
        if password.is_empty() {
            return Err(LendError::Configuration("password must not be empty".into()));
        }

        let totp_secret = totp_secret.filter(|s| !s.trim().is_empty());
        if let Some(ref secret) = totp_secret {
            crate::totp::decode_secret(secret)?;
        }

        Ok(Self {
            email,
            password: SecretString::new(password),
            totp_secret: totp_secret.map(SecretString::new),
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret().as_str()
    }

    pub fn totp_secret(&self) -> Option<&str> {
        self.totp_secret.as_ref().map(|s| s.expose_secret().as_str())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("totp_secret", &self.totp_secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Authentication state of the marketplace session.
///
/// Transitions are driven by HTTP responses only:
/// `Unauthenticated → LoginSubmitted → TwoFactorPending → Authenticated`,
/// with any step able to land in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    LoginSubmitted,
    TwoFactorPending,
    Authenticated,
    Failed,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::LoginSubmitted => "login_submitted",
            AuthState::TwoFactorPending => "two_factor_pending",
            AuthState::Authenticated => "authenticated",
            AuthState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Loan listings
// ---------------------------------------------------------------------------

/// Lifecycle status of a listed loan, as reported by the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Open,
    Closed,
    Funded,
    Active,
    Completed,
    Canceled,
    Unknown,
}

impl LoanStatus {
    /// Map a free-form remote status string. Anything unrecognised is `Unknown`.
    pub fn from_remote(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "open" => LoanStatus::Open,
            "closed" => LoanStatus::Closed,
            "funded" => LoanStatus::Funded,
            "active" => LoanStatus::Active,
            "completed" => LoanStatus::Completed,
            "canceled" | "cancelled" => LoanStatus::Canceled,
            _ => LoanStatus::Unknown,
        }
    }

    /// Whether a loan in this status can still receive bids.
    pub fn accepts_bids(&self) -> bool {
        matches!(self, LoanStatus::Open | LoanStatus::Active)
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoanStatus::Open => "open",
            LoanStatus::Closed => "closed",
            LoanStatus::Funded => "funded",
            LoanStatus::Active => "active",
            LoanStatus::Completed => "completed",
            LoanStatus::Canceled => "canceled",
            LoanStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A normalized loan listing.
///
/// `loan_id` is opaque and stable; the remote may send it as a string or an
/// integer. `raw` keeps the untouched payload for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanListing {
    pub loan_id: String,
    pub title: String,
    pub amount: Decimal,
    /// Annual interest rate in percent (e.g. 7.5).
    pub interest_rate: Option<Decimal>,
    pub status: LoanStatus,
    pub open_date: Option<DateTime<Utc>>,
    pub close_date: Option<DateTime<Utc>>,
    /// Funding progress in percent (0–100).
    pub funding_progress: Option<Decimal>,
    pub funded_amount: Option<Decimal>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub borrower_type: Option<String>,
    pub loan_type: Option<String>,
    pub risk_grade: Option<String>,
    pub duration_months: Option<u32>,
    pub raw: serde_json::Value,
}

impl LoanListing {
    /// Check the validity invariant required before persistence.
    pub fn validate(&self) -> Result<(), LendError> {
        if self.loan_id.trim().is_empty() {
            return Err(LendError::Validation("loan id is required".into()));
        }
        if self.title.trim().is_empty() {
            return Err(LendError::Validation(format!(
                "loan {} has no title",
                self.loan_id
            )));
        }
        if self.amount <= Decimal::ZERO {
            return Err(LendError::Validation(format!(
                "loan {} has non-positive amount {}",
                self.loan_id, self.amount
            )));
        }
        let percent = Decimal::ZERO..=Decimal::ONE_HUNDRED;
        if let Some(rate) = self.interest_rate {
            if !percent.contains(&rate) {
                return Err(LendError::Validation(format!(
                    "loan {} interest rate {rate} outside 0-100",
                    self.loan_id
                )));
            }
        }
        if let Some(progress) = self.funding_progress {
            if !percent.contains(&progress) {
                return Err(LendError::Validation(format!(
                    "loan {} funding progress {progress} outside 0-100",
                    self.loan_id
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for LoanListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({} SEK", self.loan_id, self.title, self.amount)?;
        if let Some(rate) = self.interest_rate {
            write!(f, " @ {rate}%")?;
        }
        write!(f, ", {})", self.status)
    }
}

// ---------------------------------------------------------------------------
// Bidding
// ---------------------------------------------------------------------------

/// How the investor wants to be repaid on a bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentOption {
    #[serde(rename = "ip")]
    InterestPayment,
    #[serde(rename = "dp")]
    DownPayment,
}

impl PaymentOption {
    /// Wire code sent in `payment_options`.
    pub fn code(&self) -> &'static str {
        match self {
            PaymentOption::InterestPayment => "ip",
            PaymentOption::DownPayment => "dp",
        }
    }
}

impl fmt::Display for PaymentOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for PaymentOption {
    type Err = LendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ip" | "interest-payment" | "interest_payment" => Ok(PaymentOption::InterestPayment),
            "dp" | "down-payment" | "down_payment" => Ok(PaymentOption::DownPayment),
            other => Err(LendError::Validation(format!(
                "payment option must be 'ip' (interest payment) or 'dp' (down payment), got '{other}'"
            ))),
        }
    }
}

/// A single bid submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidRequest {
    pub loan_id: i64,
    /// Whole currency units.
    pub amount: i64,
    pub payment_option: PaymentOption,
    pub sequence_hash: String,
}

impl BidRequest {
    /// Build a request from loosely-typed caller input, validating it.
    pub fn new(
        loan_id: i64,
        amount: i64,
        payment_option: &str,
        sequence_hash: impl Into<String>,
    ) -> Result<Self, LendError> {
        let request = Self {
            loan_id,
            amount,
            payment_option: payment_option.parse()?,
            sequence_hash: sequence_hash.into(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), LendError> {
        if self.loan_id <= 0 {
            return Err(LendError::Validation(format!("invalid loan id {}", self.loan_id)));
        }
        if self.amount <= 0 {
            return Err(LendError::Validation(format!(
                "bid amount must be positive, got {}",
                self.amount
            )));
        }
        Ok(())
    }
}

/// Outcome of a bid submission.
///
/// Failures are values, not errors: the caller inspects `error_kind` to
/// decide between backing off (rate limit) and giving up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidResult {
    pub success: bool,
    /// Sequence hash echoed by the server (empty string when absent).
    pub sequence_hash: Option<String>,
    pub rate_limit_remaining: Option<u32>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub response: Option<serde_json::Value>,
}

impl BidResult {
    pub fn accepted(
        sequence_hash: String,
        rate_limit_remaining: Option<u32>,
        response: serde_json::Value,
    ) -> Self {
        Self {
            success: true,
            sequence_hash: Some(sequence_hash),
            rate_limit_remaining,
            error: None,
            error_kind: None,
            response: Some(response),
        }
    }

    pub fn rejected(error: &LendError) -> Self {
        let kind = error.kind();
        Self {
            success: false,
            sequence_hash: None,
            rate_limit_remaining: (kind == ErrorKind::RateLimited).then_some(0),
            error: Some(error.to_string()),
            error_kind: Some(kind),
            response: None,
        }
    }

    /// True when the server signalled that no more bids may be sent for now,
    /// either by status or by an exhausted remaining-count header.
    pub fn is_rate_limited(&self) -> bool {
        self.error_kind == Some(ErrorKind::RateLimited) || self.rate_limit_remaining == Some(0)
    }
}

/// Coarse risk bucket derived from the interest rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
    Unknown,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::High => "high",
            RiskLevel::Medium => "medium",
            RiskLevel::Low => "low",
            RiskLevel::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Advisory assessment of a loan for bidding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanAnalysis {
    pub loan_id: String,
    pub title: String,
    pub status: LoanStatus,
    pub amount: Decimal,
    pub interest_rate: Option<Decimal>,
    pub viable: bool,
    pub risk_level: RiskLevel,
    pub recommended_bid_amount: Option<i64>,
    /// Sequence hash from the bidding context, when it could be loaded.
    pub sequence_hash: Option<String>,
    pub notes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Harvesting & persistence
// ---------------------------------------------------------------------------

/// Why a harvest run stopped paginating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HarvestStop {
    PageLimit,
    EmptyPage { page: u32 },
    RequestFailed { page: u32, error: String },
}

/// Counts returned by the persistence collaborator after an upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSummary {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

/// One page of stored loans, ordered by loan id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanPage {
    pub loans: Vec<LoanListing>,
    pub total: usize,
    /// 1-based.
    pub page: usize,
    pub limit: usize,
}

/// Aggregates over every stored loan. Amount figures are zero and the
/// average rate absent when nothing is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoanStats {
    pub total_loans: usize,
    pub open_loans: usize,
    pub closed_loans: usize,
    pub funded_loans: usize,
    pub total_amount: Decimal,
    pub average_amount: Decimal,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub average_interest_rate: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// What a job does, kept on the record for listing and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Harvest { max_pages: u32 },
    Bid { loan_id: i64, amount: i64, payment_option: PaymentOption },
    Analysis { loan_id: i64 },
}

/// Point-in-time copy of a job record, safe to hand to pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing row for `list_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failure talking to the remote endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} from {url}: {body}")]
    Status { status: u16, url: String, body: String },
}

/// Domain-specific error types for LENDBOT.
#[derive(Debug, thiserror::Error)]
pub enum LendError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unexpected response shape: {0}")]
    ProtocolShape(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Flat classification of [`LendError`], recorded on jobs and bid results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Timeout,
    Network,
    HttpStatus,
    ProtocolShape,
    Validation,
    RateLimited,
    Authentication,
    NotFound,
    Persistence,
}

impl LendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LendError::Configuration(_) => ErrorKind::Configuration,
            LendError::Transport(TransportError::Timeout { .. }) => ErrorKind::Timeout,
            LendError::Transport(TransportError::Network { .. }) => ErrorKind::Network,
            LendError::Transport(TransportError::Status { .. }) => ErrorKind::HttpStatus,
            LendError::ProtocolShape(_) => ErrorKind::ProtocolShape,
            LendError::Validation(_) => ErrorKind::Validation,
            LendError::RateLimited { .. } => ErrorKind::RateLimited,
            LendError::Authentication(_) => ErrorKind::Authentication,
            LendError::NotFound(_) => ErrorKind::NotFound,
            LendError::Persistence(_) => ErrorKind::Persistence,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_listing() -> LoanListing {
        LoanListing {
            loan_id: "4711".to_string(),
            title: "Fastighetslån Solna".to_string(),
            amount: dec!(250000),
            interest_rate: Some(dec!(7.5)),
            status: LoanStatus::Open,
            open_date: None,
            close_date: None,
            funding_progress: Some(dec!(40)),
            funded_amount: None,
            url: None,
            description: None,
            borrower_type: None,
            loan_type: None,
            risk_grade: None,
            duration_months: Some(12),
            raw: serde_json::json!({"id": 4711}),
        }
    }

    // -- Credentials --

    #[test]
    fn test_credentials_reject_empty_email() {
        let err = Credentials::new("  ", "pw", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_credentials_reject_undecodable_secret() {
        let err = Credentials::new("a@b.se", "pw", Some("!!!!".into())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_credentials_blank_secret_means_none() {
        let creds = Credentials::new("a@b.se", "pw", Some("   ".into())).unwrap();
        assert!(creds.totp_secret().is_none());
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = Credentials::new("a@b.se", "hunter2", Some("JBSWY3DPEHPK3PXP".into())).unwrap();
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("JBSWY3DPEHPK3PXP"));
        assert!(dbg.contains("a@b.se"));
    }

    // -- LoanStatus --

    #[test]
    fn test_status_from_remote() {
        assert_eq!(LoanStatus::from_remote("OPEN"), LoanStatus::Open);
        assert_eq!(LoanStatus::from_remote("cancelled"), LoanStatus::Canceled);
        assert_eq!(LoanStatus::from_remote(""), LoanStatus::Unknown);
        assert!(LoanStatus::Active.accepts_bids());
        assert!(!LoanStatus::Funded.accepts_bids());
    }

    // -- LoanListing validation --

    #[test]
    fn test_listing_valid() {
        assert!(sample_listing().validate().is_ok());
    }

    #[test]
    fn test_listing_requires_title_and_positive_amount() {
        let mut l = sample_listing();
        l.title = " ".into();
        assert!(l.validate().is_err());

        let mut l = sample_listing();
        l.amount = Decimal::ZERO;
        assert!(l.validate().is_err());
    }

    #[test]
    fn test_listing_rejects_out_of_range_percentages() {
        let mut l = sample_listing();
        l.interest_rate = Some(dec!(120));
        assert!(l.validate().is_err());

        let mut l = sample_listing();
        l.funding_progress = Some(dec!(-1));
        assert!(l.validate().is_err());
    }

    // -- Bidding --

    #[test]
    fn test_payment_option_parse() {
        assert_eq!("ip".parse::<PaymentOption>().unwrap(), PaymentOption::InterestPayment);
        assert_eq!("Down-Payment".parse::<PaymentOption>().unwrap(), PaymentOption::DownPayment);
        let err = "xx".parse::<PaymentOption>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_payment_option_serializes_as_code() {
        assert_eq!(serde_json::to_string(&PaymentOption::DownPayment).unwrap(), "\"dp\"");
    }

    #[test]
    fn test_bid_request_validation() {
        assert!(BidRequest::new(1, 500, "ip", "").is_ok());
        assert!(BidRequest::new(0, 500, "ip", "").is_err());
        assert!(BidRequest::new(1, 0, "ip", "").is_err());
        assert!(BidRequest::new(1, -5, "dp", "").is_err());
        assert!(BidRequest::new(1, 500, "zz", "").is_err());
    }

    #[test]
    fn test_bid_result_rate_limit_signals() {
        let limited = BidResult::rejected(&LendError::RateLimited {
            url: "x".into(),
            retry_after_secs: None,
        });
        assert!(limited.is_rate_limited());
        assert_eq!(limited.rate_limit_remaining, Some(0));

        let exhausted = BidResult::accepted("h".into(), Some(0), serde_json::json!({}));
        assert!(exhausted.success);
        assert!(exhausted.is_rate_limited());

        let generic = BidResult::rejected(&LendError::ProtocolShape("x".into()));
        assert!(!generic.is_rate_limited());
    }

    // -- Jobs & errors --

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_error_kind_mapping() {
        let timeout = LendError::from(TransportError::Timeout { url: "u".into() });
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        let status = LendError::from(TransportError::Status {
            status: 500,
            url: "u".into(),
            body: String::new(),
        });
        assert_eq!(status.kind(), ErrorKind::HttpStatus);
        assert!(status.to_string().contains("HTTP 500"));
    }
}
