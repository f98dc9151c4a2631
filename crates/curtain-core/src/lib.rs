pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod error;
pub mod graph;
pub mod handoff;
pub mod io;
pub mod migration;
pub mod paths;
pub mod probe;
pub mod schema;
pub mod waiter;

pub use error::{CurtainError, Result};
