//! Mapping: keyframe processing between tracking and global optimization.

pub mod cleaner;
mod mapper;
pub mod triangulator;

pub use mapper::MappingModule;
