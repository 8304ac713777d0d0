//! Marketplace integration.
//!
//! One authenticated [`SessionClient`] is shared by:
//! - [`ListingHarvester`]: paginated listing retrieval and loan details
//! - [`BiddingEngine`]: bidding context, bid placement and loan analysis
//! - account number lookup (`SessionClient::account_number`)

pub mod account;
pub mod bidding;
pub mod harvester;
pub mod listing;
pub mod session;

use std::sync::Arc;

pub use bidding::{BiddingContext, BiddingEngine};
pub use harvester::{HarvestOutcome, ListingHarvester};
pub use session::SessionClient;

use crate::config::AppConfig;
use crate::types::{Credentials, LendError};

/// The marketplace clients wired to one session.
#[derive(Clone)]
pub struct Marketplace {
    pub session: Arc<SessionClient>,
    pub harvester: Arc<ListingHarvester>,
    pub bidding: Arc<BiddingEngine>,
}

impl Marketplace {
    /// Build every client from configuration. No network traffic happens
    /// until the first operation.
    pub fn new(config: &AppConfig, credentials: Credentials) -> Result<Self, LendError> {
        let session = Arc::new(SessionClient::new(config.marketplace.clone(), credentials)?);
        let harvester = Arc::new(ListingHarvester::new(
            session.clone(),
            config.harvest.page_size,
        ));
        let bidding = Arc::new(BiddingEngine::new(
            session.clone(),
            harvester.clone(),
            config.bidding.min_bid_floor,
        ));
        Ok(Self {
            session,
            harvester,
            bidding,
        })
    }
}
