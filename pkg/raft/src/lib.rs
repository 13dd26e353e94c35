#[macro_use]
extern crate error_chain;

pub mod errors;

pub mod client;
pub mod consensus;
pub mod constraint;
pub mod log;
pub mod metrics;
pub mod node;
pub mod protos;
pub mod state;
pub mod state_machine;
pub mod transport;
