// Core modules: platform selection, embedded resources, materialization, and the native bridge.
pub mod cleanup;
pub mod error;
pub mod materialize;
pub mod native;
pub mod platform;
pub mod resources;
