//! Layouts, device meshes and per-tensor sharding specifications.

mod layout;
mod mesh;
mod spec;

pub use layout::*;
pub use mesh::*;
pub use spec::*;
