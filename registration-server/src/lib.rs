pub mod clock;
pub mod config;
pub mod encoding;
pub mod error;
pub mod geo;
pub mod models;
pub mod remote;
pub mod routes;
pub mod services;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;
