//! The `loom` module provides the data model and the dispatch machinery for running tiled tensor
//! operators on a fixed-capacity accelerator.
//!
//! ## Key Components
//! 1. **Layouts and Tensors**:
//!    - Shapes with a data layout and per-dimension padding (`Shape`, `DataLayout`).
//!    - Tensors that own a buffer sized to the physical extents (`Tensor`).
//!
//! 2. **Tiling**:
//!    - A tensor split into a grid of owned tiles with halos (`TiledTensor`).
//!
//! 3. **Dispatch**:
//!    - A pluggable tile kernel (`TileKernel`) and the accelerator that runs it.
//!    - Sessions that queue kernel calls and release outputs at a barrier (`Session`).
//!
//! 4. **Numerical System**:
//!    - Scalar types (`f32`, `f16`, `u8`, etc.) and their `DataType` metadata.
pub mod device;
pub mod layout;
pub mod num;
pub mod platform;
pub mod tensor;
pub mod tiled;
