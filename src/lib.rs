//! Live motorsport timing feed ingestion, decoding, and state tracking.
//!
//! Paddock attaches to the official live timing push feed (or replays a
//! recorded feed file) and folds its stream updates into a queryable
//! per-session state: driver timing, session benchmarks, the qualifying
//! segment clock, pit stops, flags, weather, and message logs.
//!
//! # Architecture
//!
//! Each session pairs exactly one producer with one consumer over a bounded
//! queue. The producer is either a [`connect::LiveConnector`] reading the
//! websocket feed or a [`replay::ReplayEngine`] pacing through a recording;
//! the consumer is the state processor, the sole writer of session state.
//! Sessions are created through a [`SessionRegistry`] and are fully isolated
//! from one another.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use paddock::{FeedConfig, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = SessionRegistry::new(FeedConfig::default());
//!     let session = registry.get_or_create("alice");
//!
//!     session.start_replay("session.txt".into())?;
//!     session.set_replay_speed(2.0)?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     {
//!         let state = session.state();
//!         for (number, driver) in &state.drivers {
//!             println!("{number}: {:?}", driver.position);
//!         }
//!     }
//!
//!     session.stop().await;
//!     Ok(())
//! }
//! ```

// Feed plumbing
pub mod codec;
pub mod config;
pub mod connect;
pub mod replay;
pub mod wire;

// Session state and processing
pub mod processor;
pub mod registry;
pub mod session;
pub mod state;

mod error;
mod time_utils;

pub use config::FeedConfig;
pub use error::{FeedError, Result};
pub use registry::SessionRegistry;
pub use replay::ReplayOutcome;
pub use session::{Session, ShutdownReport};
pub use state::{Lifecycle, SessionMode, SessionState};
pub use wire::NormalizedMessage;
