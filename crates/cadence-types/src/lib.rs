pub mod cost;
pub mod plan;
pub mod pricing;
pub mod run;
pub mod usage;

pub use cost::*;
pub use plan::*;
pub use pricing::*;
pub use run::*;
pub use usage::*;
