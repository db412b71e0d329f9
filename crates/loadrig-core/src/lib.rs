pub mod api;
pub mod collector;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod ramp;
pub mod report;
pub mod retry;
pub mod stats;
pub mod unit;
pub mod worker;

pub use api::*;
pub use collector::*;
pub use config::*;
pub use error::*;
pub use orchestrator::*;
pub use ramp::*;
pub use report::*;
pub use retry::*;
pub use stats::*;
pub use unit::*;
pub use worker::*;
