//! Indicator Engine
//!
//! Lets many client sessions subscribe to technical indicators over a live
//! tick stream while computing each distinct
//! (symbol, timeframe, indicator, parameters) series at most once:
//! - Per-symbol OHLCV aggregation from one base timeframe, with derived
//!   higher timeframes
//! - Reference-counted subscriptions with a reverse index per indicator key
//! - Lease-guarded computation shared by every subscriber of a key
//! - Timeframe-proportional result cache
//! - Per-session consolidated delivery with bounded queues and backpressure
//! - Heartbeat expiry of silent sessions
//!
//! # Architecture
//!
//! ```text
//!     Raw ticks
//!        │
//!  ┌─────▼──────┐  demanded timeframes  ┌──────────────┐
//!  │ Aggregator │◄──────────────────────│   Registry   │◄── subscribe /
//!  └─────┬──────┘                       └──┬────────▲──┘    unsubscribe /
//!        │ bar closed          start/stop │        │       heartbeat
//!  ┌─────▼─────────────────────────────────▼┐       │
//!  │        Scheduler  (lease per key)      │       │ expire
//!  └─────┬──────────────────────────┬───────┘  ┌────┴────┐
//!        │ put                      │ event    │ Sweeper │
//!  ┌─────▼──────┐  get        ┌─────▼──────┐   └─────────┘
//!  │   Cache    │◄────────────│   Router   │──► per-session outboxes
//!  └────────────┘             └────────────┘
//! ```

pub mod backpressure;
pub mod cache;
pub mod candles;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod events;
pub mod indicators;
pub mod key;
pub mod lease;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod websocket;

pub use engine::{Collaborators, Engine};
pub use error::EngineError;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
