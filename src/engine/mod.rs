//! Background job engine: the registry that runs work off the request path,
//! and the service that turns marketplace operations into jobs.

pub mod jobs;
pub mod service;

pub use jobs::{JobFuture, JobRegistry};
pub use service::LendingService;
