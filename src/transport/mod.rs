//! Transport side: rustls material, the MQTT connection and its manager.

pub mod acks;
pub mod connection;
pub mod manager;
pub mod settings;
pub mod state;
pub mod tls;
pub mod verifier;

pub use manager::{TransportManager, ValidatorFactory};
pub use settings::{BrokerAddress, TransportSettings};
pub use state::ConnectionState;
pub use verifier::{PeerValidator, TrustDomainValidator};
