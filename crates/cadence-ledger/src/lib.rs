pub mod budget;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod store;

pub use budget::{BudgetConfigPatch, BudgetManager};
pub use config::budget_config_from_env;
pub use errors::{BudgetError, LedgerError};
pub use ledger::CostLedger;
pub use store::{DurableStore, FileDurableStore, InMemoryDurableStore};
