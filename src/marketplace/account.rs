//! Account number discovery.
//!
//! The account number is needed for transfers and appears in three places
//! of decreasing reliability. Strategies run in order and each one only
//! after the previous one conclusively failed.

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{error, info, warn};

use super::session::{read_text, SessionClient};
use crate::types::LendError;

/// Selectors tried on the dashboard, most specific first.
const ACCOUNT_SELECTORS: &[&str] = &[
    ".account-number",
    "[data-account-number]",
    "#account-number",
    ".account-info .number",
];

const ACCOUNT_PATTERN: &str = r"(?i)(?:kontonummer|account\s+number)[:\s]*(\d+)";

/// One way of finding the account number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountLookup {
    /// Structured JSON endpoint (`content.account_number`).
    JsonApi,
    /// Dashboard HTML via the selector list.
    HtmlSelectors,
    /// Numeric pattern over the dashboard's visible text.
    TextPattern,
}

impl AccountLookup {
    pub const ORDER: [AccountLookup; 3] = [
        AccountLookup::JsonApi,
        AccountLookup::HtmlSelectors,
        AccountLookup::TextPattern,
    ];

    fn log_failure(&self, reason: &str) {
        match self {
            AccountLookup::JsonApi => info!(reason, "Account number not available from API, falling back to dashboard"),
            AccountLookup::HtmlSelectors => warn!(reason, "Account number not found by selectors, scanning page text"),
            AccountLookup::TextPattern => error!(reason, "Account number not found in page text"),
        }
    }
}

impl SessionClient {
    /// Find the investor's account number, authenticating first if needed.
    pub async fn account_number(&self) -> Result<String, LendError> {
        self.ensure_authenticated().await?;

        // Fetched at most once and shared by the two HTML strategies.
        let mut dashboard: Option<String> = None;

        for lookup in AccountLookup::ORDER {
            let attempt = match lookup {
                AccountLookup::JsonApi => self.account_number_from_api().await,
                AccountLookup::HtmlSelectors | AccountLookup::TextPattern => {
                    if dashboard.is_none() {
                        match self.fetch_dashboard().await {
                            Ok(html) => dashboard = Some(html),
                            Err(e) => {
                                lookup.log_failure(&e.to_string());
                                return Err(e);
                            }
                        }
                    }
                    let html = dashboard.as_deref().unwrap_or_default();
                    Ok(if lookup == AccountLookup::HtmlSelectors {
                        account_number_from_selectors(html)
                    } else {
                        account_number_from_text(html)
                    })
                }
            };

            match attempt {
                Ok(Some(number)) => {
                    info!(strategy = ?lookup, "Found account number");
                    return Ok(number);
                }
                Ok(None) => lookup.log_failure("no match"),
                Err(e) => lookup.log_failure(&e.to_string()),
            }
        }

        Err(LendError::ProtocolShape(
            "account number not found by any lookup strategy".into(),
        ))
    }

    async fn account_number_from_api(&self) -> Result<Option<String>, LendError> {
        let url = self.config().site_url(&self.config().account_api_path);
        let body = self.get_json(&url, &[]).await?;
        Ok(account_number_from_json(&body))
    }

    async fn fetch_dashboard(&self) -> Result<String, LendError> {
        let url = self.config().site_url(&self.config().landing_path);
        let resp = self.send(self.http().get(&url)).await?;
        read_text(resp).await
    }
}

fn account_number_from_json(body: &serde_json::Value) -> Option<String> {
    match body.pointer("/content/account_number")? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn account_number_from_selectors(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    ACCOUNT_SELECTORS.iter().find_map(|raw| {
        let selector = Selector::parse(raw).ok()?;
        document.select(&selector).find_map(|el| {
            let from_attr = el.value().attr("data-account-number").map(str::to_string);
            let text = from_attr.unwrap_or_else(|| el.text().collect::<String>());
            let digits: String = text.chars().filter(char::is_ascii_digit).collect();
            (!digits.is_empty()).then_some(digits)
        })
    })
}

fn account_number_from_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    let pattern = Regex::new(ACCOUNT_PATTERN).ok()?;
    pattern
        .captures(&text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
