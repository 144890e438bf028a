pub mod channel;

// Re-export common types
pub use channel::{handle_delivery, DeliveryAck, TransportChannel, TransportError};
