pub mod errors;
pub mod gateway;

pub use errors::GatewayError;
pub use gateway::LLMGateway;
