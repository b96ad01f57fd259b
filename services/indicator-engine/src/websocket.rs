//! WebSocket session protocol
//!
//! JSON text frames in both directions. Requests are tagged by `action`,
//! server messages by `type`:
//!
//! ```text
//! → {"action":"subscribe","session_id":"s1","symbol":"SYM","timeframe":"5m",
//!    "indicators":[{"name":"RSI","params":{"length":14}}]}
//! ← {"type":"subscribed","session_id":"s1","keys":["SYM@5m:RSI_14"]}
//! ← {"type":"market_update","symbol":"SYM","timeframe":"5m","timestamp":"...",
//!    "ohlcv":{...},"indicators":{"RSI_14":52.3}}
//! ```

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::{SessionId, Symbol, UserId};
use types::time::to_rfc3339;

use crate::backpressure::BackpressureReason;
use crate::candles::{Bar, Timeframe};
use crate::error::EngineError;
use crate::indicators::Payload;
use crate::key::{IndicatorKey, IndicatorSpec};

/// Client → engine request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        session_id: SessionId,
        #[serde(default)]
        user_id: Option<UserId>,
        symbol: Symbol,
        timeframe: Timeframe,
        indicators: Vec<IndicatorSpec>,
    },
    /// Omitted `indicators` means every key, on the given series if
    /// `symbol`/`timeframe` are present, otherwise the whole session.
    Unsubscribe {
        session_id: SessionId,
        #[serde(default)]
        symbol: Option<Symbol>,
        #[serde(default)]
        timeframe: Option<Timeframe>,
        #[serde(default)]
        indicators: Option<Vec<IndicatorSpec>>,
    },
    Heartbeat {
        session_id: SessionId,
    },
}

impl ClientRequest {
    pub fn session_id(&self) -> &SessionId {
        match self {
            ClientRequest::Subscribe { session_id, .. }
            | ClientRequest::Unsubscribe { session_id, .. }
            | ClientRequest::Heartbeat { session_id } => session_id,
        }
    }
}

/// Parse a raw JSON frame into a request.
pub fn parse_request(json: &str) -> Result<ClientRequest, serde_json::Error> {
    serde_json::from_str(json)
}

/// OHLCV block of a market update. Decimals serialize as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl From<&Bar> for Ohlcv {
    fn from(bar: &Bar) -> Self {
        Self {
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

/// One indicator's entry in a market update.
///
/// Never omitted: a session always sees every key it subscribes to, with an
/// explicit marker when no fresh value exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndicatorField {
    /// `{"value": <payload>, "stale": true}`
    Stale { value: Payload, stale: bool },
    /// `{"status": "unavailable"}`
    Unavailable { status: String },
    /// Raw payload.
    Fresh(Payload),
}

impl IndicatorField {
    pub fn stale(value: Payload) -> Self {
        IndicatorField::Stale { value, stale: true }
    }

    pub fn unavailable() -> Self {
        IndicatorField::Unavailable {
            status: "unavailable".to_string(),
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, IndicatorField::Fresh(_))
    }
}

/// Consolidated per-session update for one bar close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// RFC 3339 start of the closed bar.
    pub timestamp: String,
    pub ohlcv: Ohlcv,
    /// Keyed by indicator label, e.g. `RSI_14`.
    pub indicators: BTreeMap<String, IndicatorField>,
}

impl MarketUpdate {
    pub fn new(bar: &Bar, indicators: BTreeMap<String, IndicatorField>) -> Self {
        Self {
            symbol: bar.symbol.clone(),
            timeframe: bar.timeframe,
            timestamp: to_rfc3339(bar.bucket_start),
            ohlcv: Ohlcv::from(bar),
            indicators,
        }
    }
}

/// Engine → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    MarketUpdate(MarketUpdate),
    Backpressure {
        reason: BackpressureReason,
        /// Seconds.
        suggested_cadence: u64,
    },
    Subscribed {
        session_id: SessionId,
        keys: Vec<String>,
    },
    Unsubscribed {
        session_id: SessionId,
        keys: Vec<String>,
    },
    HeartbeatAck {
        session_id: SessionId,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn subscribed(session_id: SessionId, keys: &[IndicatorKey]) -> Self {
        ServerMessage::Subscribed {
            session_id,
            keys: keys.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn unsubscribed(session_id: SessionId, keys: &[IndicatorKey]) -> Self {
        ServerMessage::Unsubscribed {
            session_id,
            keys: keys.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn error(err: &EngineError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
