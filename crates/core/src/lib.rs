//! Core crate for the vidgen text-to-video job service.

pub mod backend;
pub mod client;
pub mod config;
pub mod jobs;
pub mod logging;
pub mod model;
pub mod params;
pub mod relay;
pub mod runtime;
pub mod server;

#[cfg(test)]
mod test_support;
