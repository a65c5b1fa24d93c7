mod config;
mod error;
mod types;
mod units;

pub use config::*;
pub use error::*;
pub use types::*;
pub use units::*;

#[macro_use]
extern crate log;
