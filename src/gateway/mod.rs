pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{ClientIdentity, EventSink, GatewayClient};
pub use protocol::{ChatEvent, ChatEventState, HelloOk};
