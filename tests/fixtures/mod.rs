//! Test fixtures

pub mod counting_discovery;
pub mod relay_network;

pub use counting_discovery::CountingDiscovery;
pub use relay_network::{RelayFixture, eventually, fast_client_config};
