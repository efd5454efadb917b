//! Shared domain model for wallet aggregation: chains, integration providers,
//! the normalized holdings model and the messages exchanged over the bus.

pub mod amount;
pub mod chain;
pub mod messages;
pub mod provider;
pub mod routing;
pub mod wallet;

pub use amount::{format_amount, pow10, MAX_DECIMAL_EXPONENT};
pub use chain::Chain;
pub use messages::{
    AggregationStatusResponse, IntegrationRequest, IntegrationResult, IntegrationStatus,
    JobStatus, ProviderProgress, WalletAggregationCompleted, WalletAggregationRequested,
    COMPLETED_EVENT_VERSION,
};
pub use provider::IntegrationProvider;
pub use wallet::{
    AdditionalData, Position, PositionRange, Protocol, Token, TokenType, WalletItem,
    WalletItemType, WalletResponse,
};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unsupported chain: '{0}'")]
    UnsupportedChain(String),
    #[error("Unknown integration provider: '{0}'")]
    UnknownProvider(String),
    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Encode a bus message as JSON bytes
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a bus message from JSON bytes
pub fn decode_message<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}
