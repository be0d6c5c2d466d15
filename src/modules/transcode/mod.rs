pub mod dto;
pub mod encoder;
pub mod events;
pub mod manifest;
pub mod memory_store;
pub mod model;
pub mod orchestrator;
pub mod presets;
pub mod repository;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;
