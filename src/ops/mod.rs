//! # Operations
//!
//! Everything between a tensor method call and the kernel that computes it.
//!
//! ## Submodules
//!
//! - [`table`]: the operator table (host math and WGSL snippets per op)
//! - [`dispatch`]: the tensor op surface generated from the table
//! - [`functions`]: autograd functions recording each operation
//! - [`cpu`]: host kernel runner (default backend)
//! - [`wgpu`] *(opt-in)*: GPU kernel runner using compute shaders
//!
//! ## Adding an operator
//!
//! 1. Add an entry to [`table`] with its host closures and WGSL snippets;
//!    the registry then builds `<op>`, `<op>_` and `<op>Grad` kernels.
//! 2. Add it to the matching method macro in [`dispatch`].
//!
//! ## Feature Flags
//!
//! - `wgpu`: enables the `wgpu` (WebGPU) backend

pub mod cpu;
pub mod dispatch;
pub mod functions;
pub mod table;
#[cfg(feature = "wgpu")]
pub mod wgpu;
