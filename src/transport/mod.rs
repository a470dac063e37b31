pub mod client;
pub mod messages;

pub use client::{TransportEvent, WsTransport, API_KEY_HEADER};
pub use messages::{AgentStatus, ConfigMessage, InboundUnit, Role, ServerMessage, SynthesisRequest};
