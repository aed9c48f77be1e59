//! GPU buffer models
//!
//! Element buffers for per-instance data and geometry buffer models that
//! mirror a [`Geometry`](crate::geometry::Geometry) into vertex and index
//! buffers.

mod elements;
mod layouts;
mod model;
mod proxy;

pub use elements::*;
pub use layouts::*;
pub use model::*;
pub use proxy::*;
