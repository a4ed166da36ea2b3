//! System orchestration and thread management.
//!
//! This module contains the `MappingSystem` facade that owns and controls
//! the map worker thread, and the state shared with it.

mod mapping_system;
pub mod shared_state;

pub use mapping_system::MappingSystem;
pub use shared_state::SharedState;
