pub mod api;
pub mod artifact;
pub mod config;
pub mod device;
pub mod error;
pub mod inference;
pub mod prompt;
pub mod state;
pub mod train;

#[cfg(test)]
pub(crate) mod testing;
