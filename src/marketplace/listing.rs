//! Normalization of raw listing records into [`LoanListing`].
//!
//! The listing API is loosely typed: ids arrive as strings or integers,
//! amounts as numbers or localized strings ("250 000,50"), dates in several
//! formats. Parsing here is tolerant field by field; the record as a whole
//! must still pass [`LoanListing::validate`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::*;
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{LendError, LoanListing, LoanStatus};

/// Naive date-time layouts seen in listing payloads, all interpreted as UTC.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.fZ",
];

/// Convert one raw record. Fails with [`LendError::Validation`] when the
/// record lacks an id, title or positive amount.
pub fn normalize(raw: &Value) -> Result<LoanListing, LendError> {
    let listing = convert(raw)?;
    listing.validate()?;
    Ok(listing)
}

/// Field conversion without the validity check. Only the id is required;
/// a missing amount becomes zero and a missing title an empty string.
pub fn convert(raw: &Value) -> Result<LoanListing, LendError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| LendError::ProtocolShape("listing record is not an object".into()))?;

    let loan_id = record_id(raw)
        .ok_or_else(|| LendError::Validation("listing record has no id".into()))?;

    Ok(LoanListing {
        title: text_field(raw, "title").unwrap_or_default(),
        amount: obj.get("amount").and_then(decimal).unwrap_or(Decimal::ZERO),
        interest_rate: obj.get("interest_rate").and_then(decimal),
        status: text_field(raw, "status")
            .map(|s| LoanStatus::from_remote(&s))
            .unwrap_or(LoanStatus::Unknown),
        open_date: obj.get("open_date").and_then(date),
        close_date: obj.get("close_date").and_then(date),
        funding_progress: obj.get("funding_progress").and_then(decimal),
        funded_amount: obj.get("funded_amount").and_then(decimal),
        url: text_field(raw, "url"),
        description: text_field(raw, "description"),
        borrower_type: text_field(raw, "borrower_type"),
        loan_type: text_field(raw, "loan_type"),
        risk_grade: text_field(raw, "risk_grade"),
        duration_months: obj.get("duration_months").and_then(months),
        raw: raw.clone(),
        loan_id,
    })
}

/// Normalize a batch, dropping invalid records. Returns the valid listings
/// and the number of records that were rejected.
pub fn normalize_all(records: &[Value]) -> (Vec<LoanListing>, usize) {
    let mut listings = Vec::with_capacity(records.len());
    let mut rejected = 0;

    for record in records {
        match normalize(record) {
            Ok(listing) => listings.push(listing),
            Err(e) => {
                rejected += 1;
                warn!(
                    loan_id = %record_id(record).unwrap_or_else(|| "unknown".into()),
                    error = %e,
                    "Skipping invalid listing record"
                );
            }
        }
    }

    debug!(valid = listings.len(), rejected, "Normalized listing batch");
    (listings, rejected)
}

/// Loan id of a raw record, from `id` or else `loan_id`.
pub fn record_id(raw: &Value) -> Option<String> {
    raw.get("id")
        .and_then(id_string)
        .or_else(|| raw.get("loan_id").and_then(id_string))
}

/// Opaque id as a string; integers are rendered in decimal.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers, or strings with spaces as thousands separators and an optional
/// decimal comma or trailing percent sign.
pub fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let rendered = n.to_string();
            Decimal::from_str(&rendered)
                .or_else(|_| Decimal::from_scientific(&rendered))
                .ok()
                .or_else(|| n.as_f64().and_then(Decimal::from_f64))
        }
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .trim_end_matches('%')
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
                .map(|c| if c == ',' { '.' } else { c })
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            Decimal::from_str(&cleaned).ok()
        }
        _ => None,
    }
}

fn date(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return day.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    warn!(value = raw, "Unparseable date in listing record");
    None
}

fn months(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|m| u32::try_from(m).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
