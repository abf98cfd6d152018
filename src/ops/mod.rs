pub mod compositor;
pub mod geometry;
pub mod selection;
pub mod tools;
