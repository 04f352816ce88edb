//! Operators built on top of [`loom`](crate::loom) and the kernels that run their tiles.
pub mod conv;
pub mod cpu;
