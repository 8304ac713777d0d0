//! Authenticated marketplace session.
//!
//! The marketplace is a server-rendered site guarded by a form login and a
//! TOTP second factor. Authentication state lives in the cookie jar of one
//! shared `reqwest::Client`; this module drives the state machine
//!
//! ```text
//! Unauthenticated -> LoginSubmitted -> TwoFactorPending -> Authenticated
//!                          \                  \
//!                           `------------------`--> Failed
//! ```
//!
//! Every transition is decided by the final URL of a response after
//! redirects, never by timing. All HTTP traffic for the crate goes through
//! [`SessionClient::send`], which owns timeout, redirect and status mapping.

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use scraper::{Html, Selector};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::MarketplaceConfig;
use crate::totp::TotpGenerator;
use crate::types::{AuthState, Credentials, LendError, TransportError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Hidden anti-forgery field carried by the two-factor form.
const FORM_TOKEN_FIELD: &str = "ezxform_token";

/// Longest body excerpt kept on HTTP status errors.
const ERROR_BODY_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Stateful HTTP session against the marketplace.
pub struct SessionClient {
    http: Client,
    config: MarketplaceConfig,
    credentials: Credentials,
    state: RwLock<AuthState>,
    /// Serializes login attempts so concurrent jobs never interleave them.
    auth_lock: Mutex<()>,
}

impl SessionClient {
    /// Build a session with a cookie store, default headers, bounded
    /// redirects and the configured connect/read timeouts.
    pub fn new(config: MarketplaceConfig, credentials: Credentials) -> Result<Self, LendError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("sv-SE,sv;q=0.9,en;q=0.8"),
        );

        let http = Client::builder()
            .cookie_store(true)
            .default_headers(headers)
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .redirect(Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| LendError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            credentials,
            state: RwLock::new(AuthState::Unauthenticated),
            auth_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &MarketplaceConfig {
        &self.config
    }

    /// Underlying client, for callers building their own requests.
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn state(&self) -> AuthState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: AuthState) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *guard != next {
            debug!(from = %*guard, to = %next, "Session state transition");
            *guard = next;
        }
    }

    // -- Authentication ----------------------------------------------------

    /// Run the full login flow, including the second factor when challenged.
    ///
    /// No step is retried. On any error the session ends in
    /// [`AuthState::Failed`]; a later call starts over from the login page.
    pub async fn login(&self) -> Result<(), LendError> {
        let _guard = self.auth_lock.lock().await;
        self.login_locked().await
    }

    /// Log in unless the session is already authenticated.
    pub async fn ensure_authenticated(&self) -> Result<(), LendError> {
        if self.state() == AuthState::Authenticated {
            return Ok(());
        }
        let _guard = self.auth_lock.lock().await;
        // Another caller may have finished logging in while we waited.
        if self.state() == AuthState::Authenticated {
            return Ok(());
        }
        self.login_locked().await
    }

    async fn login_locked(&self) -> Result<(), LendError> {
        self.set_state(AuthState::Unauthenticated);
        let outcome = match self.submit_credentials().await {
            Ok(AuthState::TwoFactorPending) => self.complete_two_factor().await,
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.set_state(AuthState::Authenticated);
                info!(email = %self.credentials.email(), "Marketplace session authenticated");
                Ok(())
            }
            Err(e) => {
                self.set_state(AuthState::Failed);
                error!(error = %e, kind = ?e.kind(), "Marketplace login failed");
                Err(e)
            }
        }
    }

    /// Submit the login form and classify where the server sent us.
    async fn submit_credentials(&self) -> Result<AuthState, LendError> {
        let login_url = self.config.site_url(&self.config.login_path);
        info!(email = %self.credentials.email(), "Starting marketplace login");

        // Seeds the session cookies and exposes the optional CSRF token.
        let page = self.send(self.http.get(&login_url)).await?;
        let html = read_text(page).await?;
        let csrf_token = extract_csrf_token(&html);
        if let Some(ref token) = csrf_token {
            debug!(prefix = %prefix(token), "Captured CSRF token");
        }

        let mut request = self
            .http
            .post(&login_url)
            .header(header::REFERER, &login_url)
            .header(header::ORIGIN, &self.config.base_url)
            .form(&[
                ("Login", self.credentials.email()),
                ("Password", self.credentials.password()),
                ("LoginButton", ""),
                ("RedirectURI", ""),
            ]);
        if let Some(token) = csrf_token {
            request = request.header("X-CSRF-Token", token);
        }

        self.set_state(AuthState::LoginSubmitted);
        let resp = self.send(request).await?;
        let landed = resp.url().clone();
        info!(url = %landed, status = resp.status().as_u16(), "Login form submitted");

        if landed.path().contains(&self.config.two_factor_path) {
            self.set_state(AuthState::TwoFactorPending);
            Ok(AuthState::TwoFactorPending)
        } else if landed.path().contains(&self.config.landing_path) {
            info!("Login landed on the dashboard without a second factor");
            Ok(AuthState::Authenticated)
        } else {
            Err(LendError::Authentication(format!(
                "login ended on unexpected page {landed}"
            )))
        }
    }

    /// Answer the TOTP challenge. Exactly one code is submitted.
    async fn complete_two_factor(&self) -> Result<(), LendError> {
        let secret = self.credentials.totp_secret().ok_or_else(|| {
            LendError::Configuration(
                "server requested a second factor but no TOTP secret is configured".into(),
            )
        })?;
        let totp = TotpGenerator::new(secret)?;

        let challenge_url = self.config.site_url(&self.config.two_factor_path);
        let page = self.send(self.http.get(&challenge_url)).await?;
        let referer = page.url().to_string();
        let html = read_text(page).await?;

        let form_token = extract_form_token(&html, &self.config.two_factor_path).ok_or_else(|| {
            LendError::ProtocolShape(format!(
                "two-factor form at {referer} carries no {FORM_TOKEN_FIELD}"
            ))
        })?;
        debug!(prefix = %prefix(&form_token), "Captured two-factor form token");

        let code = totp.generate()?;
        let request = self
            .http
            .post(&challenge_url)
            .header(header::REFERER, &referer)
            .header(header::ORIGIN, &self.config.base_url)
            .form(&[
                (FORM_TOKEN_FIELD, form_token.as_str()),
                ("code", code.as_str()),
                ("submit_code", ""),
            ]);

        let resp = self.send(request).await?;
        let landed = resp.url().clone();
        if !landed.path().contains(&self.config.two_factor_path) {
            info!(url = %landed, "Second factor accepted");
            return Ok(());
        }

        let html = read_text(resp).await?;
        let message = extract_alert_message(&html)
            .unwrap_or_else(|| "no error message rendered".to_string());
        warn!(url = %landed, message = %message, "Second factor rejected");
        Err(LendError::Authentication(format!(
            "two-factor code rejected: {message}"
        )))
    }

    // -- HTTP helper -------------------------------------------------------

    /// Send a request built from [`Self::http`], mapping failures to typed
    /// errors: timeouts and network faults become [`TransportError`], HTTP
    /// 429 becomes [`LendError::RateLimited`] and any other non-2xx status
    /// becomes [`TransportError::Status`] with a body excerpt.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, LendError> {
        let request = builder
            .build()
            .map_err(|e| LendError::Validation(format!("invalid request: {e}")))?;
        let url = request.url().to_string();
        debug!(method = %request.method(), url = %url, "Marketplace request");

        let resp = self
            .http
            .execute(request)
            .await
            .map_err(|e| transport_error(e, &url))?;

        check_status(resp).await
    }

    /// GET a URL and parse the body as JSON.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, LendError> {
        let resp = self.send(self.http.get(url).query(query)).await?;
        read_json(resp).await
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

pub(crate) fn transport_error(err: reqwest::Error, url: &str) -> LendError {
    if err.is_timeout() {
        warn!(url = %url, "Request timed out");
        TransportError::Timeout { url: url.to_string() }.into()
    } else {
        warn!(url = %url, error = %err, "Request failed");
        TransportError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
        .into()
    }
}

async fn check_status(resp: Response) -> Result<Response, LendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let url = resp.url().to_string();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = resp
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        warn!(url = %url, retry_after_secs = ?retry_after_secs, "Rate limited");
        return Err(LendError::RateLimited { url, retry_after_secs });
    }

    let body: String = resp
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(ERROR_BODY_LIMIT)
        .collect();
    warn!(url = %url, status = status.as_u16(), "Non-success response");
    Err(TransportError::Status {
        status: status.as_u16(),
        url,
        body,
    }
    .into())
}

pub(crate) async fn read_text(resp: Response) -> Result<String, LendError> {
    let url = resp.url().to_string();
    resp.text().await.map_err(|e| transport_error(e, &url))
}

pub(crate) async fn read_json(resp: Response) -> Result<serde_json::Value, LendError> {
    let url = resp.url().to_string();
    let text = read_text(resp).await?;
    serde_json::from_str(&text)
        .map_err(|e| LendError::ProtocolShape(format!("{url} did not return JSON: {e}")))
}

fn prefix(token: &str) -> String {
    token.chars().take(5).collect::<String>() + "..."
}

// ---------------------------------------------------------------------------
// HTML extraction
// ---------------------------------------------------------------------------

fn extract_csrf_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(r#"meta[name="csrf-token"]"#).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Hidden form token from the form posting to `action_path`.
fn extract_form_token(html: &str, action_path: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let forms = Selector::parse("form").ok()?;
    let input = Selector::parse(&format!(r#"input[name="{FORM_TOKEN_FIELD}"]"#)).ok()?;

    document
        .select(&forms)
        .filter(|form| {
            form.value()
                .attr("action")
                .map(|action| action == action_path || action.ends_with(action_path))
                .unwrap_or(false)
        })
        .flat_map(|form| form.select(&input).collect::<Vec<_>>())
        .filter_map(|el| el.value().attr("value"))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn extract_alert_message(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("div.alert-danger").ok()?;
    let alert = document.select(&selector).next()?;
    let text = alert.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
