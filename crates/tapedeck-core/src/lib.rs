//! Tapedeck Core Library
//!
//! A record/replay HTTP proxy for deterministic end-to-end tests of an agent
//! CLI. The CLI under test is pointed at the proxy; on the first run every
//! exchange with the real model API is recorded into a YAML snapshot, and
//! later runs are answered from that snapshot without touching the network.
//!
//! # Modules
//!
//! - [`exchange`] - Request/response pairs and their payload encodings
//! - [`normalize`] - Volatile-field stripping and working-directory rewriting
//! - [`snapshot`] - Snapshot files on disk
//! - [`matcher`] - In-order matching of live requests against a snapshot
//! - [`recorder`] - The captured exchange log
//! - [`engine`] - The proxy server itself
//! - [`control`] - HTTP control API for out-of-process harnesses
//! - [`session`] - Start/configure/stop lifecycle
//! - [`settings`] - Environment-derived settings
//! - [`error`] - Error types

pub mod control;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod matcher;
pub mod normalize;
pub mod recorder;
pub mod session;
pub mod settings;
pub mod snapshot;

// Re-export commonly used types
pub use engine::{Engine, FlushOutcome, ProxyMode, ProxyOptions};
pub use error::{Error, Result, SnapshotError};
pub use exchange::{Exchange, ExchangeRequest, ExchangeResponse, Payload, ResponseBody};
pub use matcher::{MatchFailure, Matcher, OrderPolicy};
pub use normalize::{NormalizationRules, Normalizer};
pub use recorder::{ExchangeLog, LogStats};
pub use session::ProxySession;
pub use settings::{ModePolicy, Settings};
pub use snapshot::{Snapshot, SnapshotContext, SnapshotId};
