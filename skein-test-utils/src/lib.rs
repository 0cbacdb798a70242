//! Test doubles for the venue: a scripted private websocket endpoint and a
//! recording REST client.

mod exchange;
mod websocket;

pub use exchange::RecordingExchangeClient;
pub use websocket::{MockPrivateExchange, MockPrivateExchangeConfig};
