pub mod config;
pub mod geometry;
pub mod map;
pub mod mapping;
pub mod matching;
pub mod optimizer;
pub mod system;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::MapConfig;
pub use system::MappingSystem;
