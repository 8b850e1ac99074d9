use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::marketdata::{Candle, Pair, PairEntry};

pub const PING: &str = "Ping";
pub const PONG: &str = "Pong";
pub const INVALID_REQUEST: &str = "Invalid Request";

/// Ticker for one pair plus its open candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceMessage {
    pub pair: Pair,
    pub price: Decimal,
    pub volume: Decimal,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candle: Option<Candle>,
}

impl PriceMessage {
    /// `None` until the pair has been priced at least once.
    pub fn from_entry(pair: &Pair, entry: &PairEntry) -> Option<Self> {
        let ticker = entry.ticker.as_ref()?;
        Some(Self {
            pair: pair.clone(),
            price: ticker.price,
            volume: ticker.volume,
            time: ticker.time,
            candle: entry.candle.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Snapshot { data: Vec<PriceMessage> },
    Price(PriceMessage),
    Subscribed { pairs: Vec<Pair> },
}

impl ServerMessage {
    pub fn encode(&self) -> Arc<str> {
        // the message types only hold strings, decimals and timestamps
        match serde_json::to_string(self) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode server message");
                Arc::from(INVALID_REQUEST)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Subscribe {
        #[serde(default)]
        pairs: Vec<Pair>,
    },
}

/// What a subscriber asked for in one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Ping,
    Pong,
    /// Replace the pair filter; an empty list means every pair.
    Subscribe(Vec<Pair>),
    Invalid,
}

impl ClientRequest {
    pub fn parse(payload: &str) -> Self {
        match payload {
            PING => return ClientRequest::Ping,
            PONG => return ClientRequest::Pong,
            _ => {}
        }
        match serde_json::from_str::<ControlMessage>(payload) {
            Ok(ControlMessage::Subscribe { pairs }) => ClientRequest::Subscribe(pairs),
            Err(_) => ClientRequest::Invalid,
        }
    }
}
