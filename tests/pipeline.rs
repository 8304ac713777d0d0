//! End-to-end pipeline against a mock marketplace.
//!
//! Drives login with a second factor, harvesting, persistence, analysis
//! and bidding through the public `lendbot` API, the way the binary wires
//! it, with every marketplace endpoint served by `wiremock`.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use lendbot::config::{AppConfig, MarketplaceConfig};
use lendbot::engine::{JobRegistry, LendingService};
use lendbot::marketplace::Marketplace;
use lendbot::storage::{JsonLoanStore, LoanStore};
use lendbot::totp::TotpGenerator;
use lendbot::types::{AuthState, Credentials, ErrorKind, JobStatus};

const SECRET: &str = "JBSWY3DPEHPK3PXP";
const WAIT: Duration = Duration::from_secs(10);
const LISTING: &str = "/loans/listing/investment-options";

const LOGIN_PAGE: &str =
    r#"<html><head><meta name="csrf-token" content="csrf-e2e"></head><body></body></html>"#;
const CHALLENGE_PAGE: &str = r#"<html><body>
    <form method="post" action="/auth/2fa">
      <input type="hidden" name="ezxform_token" value="form-e2e">
      <input name="code">
    </form></body></html>"#;

// ---------------------------------------------------------------------------
// Mock marketplace
// ---------------------------------------------------------------------------

fn redirect(server: &MockServer, target: &str) -> ResponseTemplate {
    ResponseTemplate::new(302).insert_header("Location", format!("{}{target}", server.uri()))
}

/// Only accept a 2FA submission carrying a currently valid code.
fn valid_totp(req: &Request) -> bool {
    let body = String::from_utf8_lossy(&req.body);
    let code = body
        .split('&')
        .find_map(|pair| pair.strip_prefix("code="))
        .unwrap_or_default();
    TotpGenerator::new(SECRET)
        .map(|totp| totp.with_skew_windows(1).verify(code))
        .unwrap_or(false)
}

async fn mount_auth(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/user/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/user/login"))
        .respond_with(redirect(server, "/auth/2fa"))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/2fa"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHALLENGE_PAGE))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/2fa"))
        .and(valid_totp)
        .respond_with(redirect(server, "/investor/dashboard"))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/investor/dashboard"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html><body><p>Kontonummer: 44012233</p></body></html>"),
        )
        .mount(server)
        .await;
}

fn listing(id: u32, amount: u32) -> Value {
    json!({
        "id": id,
        "title": format!("Fastighetslån {id}"),
        "amount": amount,
        "interest_rate": "7,5 %",
        "status": "open",
        "close_date": "2026-12-01 12:00:00",
    })
}

async fn mount_listing(server: &MockServer, page: u32, body: Value) {
    Mock::given(method("GET"))
        .and(path(LISTING))
        .and(query_param("page", page.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

struct Harness {
    service: LendingService,
    marketplace: Marketplace,
    store: Arc<JsonLoanStore>,
    snapshot: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.snapshot);
    }
}

fn harness(server: &MockServer) -> Harness {
    let mut config = AppConfig::from_toml("[marketplace]\n").unwrap();
    config.marketplace = MarketplaceConfig::for_origin(&server.uri());

    let snapshot =
        std::env::temp_dir().join(format!("lendbot_pipeline_{}.json", uuid::Uuid::new_v4()));
    let store = Arc::new(JsonLoanStore::open(&snapshot).unwrap());

    let creds = Credentials::new("investor@example.se", "hunter2", Some(SECRET.into())).unwrap();
    let marketplace = Marketplace::new(&config, creds).unwrap();
    let service = LendingService::new(
        marketplace.clone(),
        store.clone(),
        JobRegistry::new(&config.jobs),
        config.harvest.default_max_pages,
    );

    Harness {
        service,
        marketplace,
        store,
        snapshot,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn harvest_logs_in_with_two_factor_and_persists() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_listing(&server, 1, json!({"data": [listing(1, 100_000), listing(2, 50_000)]})).await;
    mount_listing(
        &server,
        2,
        json!({"data": {"investment_options": [listing(3, 75_000), {"id": 4, "title": ""}]}}),
    )
    .await;
    mount_listing(&server, 3, json!({"data": []})).await;

    let h = harness(&server);
    let job = h.service.submit_harvest_job(5).unwrap();
    let done = h.service.registry().wait_for(job, WAIT).await.unwrap();

    assert_eq!(done.status, JobStatus::Success, "job error: {:?}", done.error);
    assert_eq!(h.marketplace.session.state(), AuthState::Authenticated);

    let data = done.data.unwrap();
    assert_eq!(data["count"], 4);
    assert_eq!(data["valid"], 3);
    assert_eq!(data["rejected"], 1);
    assert_eq!(data["pages_fetched"], 2);
    assert_eq!(data["saved"]["created"], 3);
    assert_eq!(data["stopped_by"]["reason"], "empty_page");

    assert_eq!(h.store.count().await.unwrap(), 3);
    let stored = h.store.get("3").unwrap();
    assert_eq!(stored.title, "Fastighetslån 3");

    // The snapshot on disk reloads to the same set.
    let reopened = JsonLoanStore::open(&h.snapshot).unwrap();
    assert_eq!(reopened.count().await.unwrap(), 3);
}

#[tokio::test]
async fn second_harvest_updates_instead_of_duplicating() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_listing(&server, 1, json!({"data": [listing(1, 100_000), listing(2, 50_000)]})).await;
    mount_listing(&server, 2, json!({"data": []})).await;

    // mount_auth expects exactly one login for both jobs.
    let h = harness(&server);
    for expected_created in [2, 0] {
        let job = h.service.submit_harvest_job(3).unwrap();
        let done = h.service.registry().wait_for(job, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.data.unwrap()["saved"]["created"], expected_created);
    }
    assert_eq!(h.store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn analysis_then_bid_on_a_listed_loan() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_listing(&server, 1, json!({"data": [listing(42, 250_000)]})).await;
    Mock::given(method("GET"))
        .and(path("/bidding/42/load"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"sequence_hash": "seq-1"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bidding/42/load"))
        .and(body_partial_json(json!({
            "amount": "1000",
            "intention": "add",
            "sequence_hash": "seq-1",
            "payment_options": ["ip"],
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-remaining", "9")
                .set_body_json(json!({"sequence_hash": "seq-2"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server);

    let job = h.service.submit_analysis_job(42).unwrap();
    let analysis = h.service.registry().wait_for(job, WAIT).await.unwrap();
    assert_eq!(analysis.status, JobStatus::Success, "job error: {:?}", analysis.error);
    let analysis = analysis.data.unwrap();
    assert_eq!(analysis["viable"], true);
    assert_eq!(analysis["recommended_bid_amount"], 25_000);
    assert_eq!(analysis["sequence_hash"], "seq-1");

    let job = h.service.submit_bid_job(42, 1000, "ip").unwrap();
    let bid = h.service.registry().wait_for(job, WAIT).await.unwrap();
    assert_eq!(bid.status, JobStatus::Success, "job error: {:?}", bid.error);
    let bid = bid.data.unwrap();
    assert_eq!(bid["success"], true);
    assert_eq!(bid["sequence_hash"], "seq-2");
    assert_eq!(bid["rate_limit_remaining"], 9);
}

#[tokio::test]
async fn account_number_falls_back_to_page_text() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    Mock::given(method("GET"))
        .and(path("/ezjscore/call/kameo_transfer::init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": {}})))
        .mount(&server)
        .await;

    let h = harness(&server);
    let account = h.marketplace.session.account_number().await.unwrap();
    assert_eq!(account, "44012233");
}

#[tokio::test]
async fn rejected_password_fails_the_job_as_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/user/login"))
        .respond_with(redirect(&server, "/user/login?error=1"))
        .mount(&server)
        .await;
    Mock::given(path(LISTING))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server);
    let job = h.service.submit_harvest_job(1).unwrap();
    let done = h.service.registry().wait_for(job, WAIT).await.unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error_kind, Some(ErrorKind::Authentication));
    assert_eq!(h.marketplace.session.state(), AuthState::Failed);
    assert_eq!(h.store.count().await.unwrap(), 0);
}
