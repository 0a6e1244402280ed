// Sylva - forest inventory scenarios on a remote batch cluster
//
// Scenarios are compiled into job configurations, staged and submitted over
// SSH, then tracked through the scheduler's queue until their results land.

pub mod api;
pub mod catalog;
pub mod config;
pub mod output;
pub mod remote;
pub mod scenario;
pub mod store;

pub use catalog::{Inventory, Model};
pub use config::AppConfig;
pub use output::SylvaError;
pub use remote::{QueueEntry, SessionManager};
pub use scenario::{Scenario, ScenarioService, ScenarioStatus, StatusPoller, Step};
pub use store::{DocumentStore, JsonStore, LocalStorage};

/// Version of Sylva
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
