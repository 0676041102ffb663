//! Network hashrate statistics service.
//!
//! Polls the network API and the mining pools on a schedule, turns their readings into
//! comparable hashrates, and serves current and weekly average figures over HTTP.

pub mod api;
pub mod args;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod scheduler;
pub mod sources;

pub use engine::{
    AggregationEngine, CycleError, CycleOutcome, CycleResult, EngineSettings, SampleStatus,
};
