//! Plain geometry types shared by the mirror, the back-ends and plugins.

pub mod geometry;

pub use geometry::{Geometry, Rect};
