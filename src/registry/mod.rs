//! Node presence and discovery.
//!
//! Each node advertises itself with a presence record that expires unless
//! renewed. Discovery is a listing of the unexpired records; there is no
//! gossip, leader election or explicit failure detection.

mod node;
mod node_registry;

pub use node::NodeRecord;
pub use node_registry::{HeartbeatHandle, NodeRegistry, RegistrationState, RegistryConfig};
