//! Frame encoding boundary. The manager only sees [`WireMessage`]s.

use crate::error::Result;
use crate::types::{Outbound, WireMessage};

pub trait Codec: Send + Sync + 'static {
    fn encode(&self, message: &WireMessage) -> Result<String>;
    fn decode(&self, frame: &str) -> Result<WireMessage>;

    /// Text frame for an outbound item; raw text passes through untouched.
    fn encode_outbound(&self, outbound: &Outbound) -> Result<String> {
        match outbound {
            Outbound::Message(message) => self.encode(message),
            Outbound::Text(text) => Ok(text.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &WireMessage) -> Result<String> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode(&self, frame: &str) -> Result<WireMessage> {
        Ok(serde_json::from_str(frame)?)
    }
}
