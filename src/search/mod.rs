//! Distributed file search
//!
//! Query strategy building, per-token response accumulation, and the
//! ranking heuristics that order raw hits into download candidates.

pub mod ranker;
pub mod session;
pub mod strategy;

pub use ranker::{rank, RankedHit, RankerWeights};
pub use session::{SearchHit, SearchOptions};
pub use strategy::{build_queries, is_audio_file, run_strategies, TrackQuery};
