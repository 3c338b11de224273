//! torchlet: tensors with reverse-mode autograd over CPU and `wgpu` kernels.
//!
//! Every tensor operation passes through three layers:
//!
//! 1. the view model ([`tensors`], [`shape`]) validates shapes and strides
//!    over shared [`storage`];
//! 2. the dispatch layer ([`device`], [`kernel`]) resolves a compiled kernel
//!    for `(name, config)` on the tensor's device, compiling it once per key,
//!    and runs it over the storage buffers;
//! 3. when an input requires a gradient, the autograd engine ([`backprop`],
//!    [`ops::functions`]) records how to compute the backward step.
//!
//! # Modules
//!
//! - [`tensors`]: tensor views, construction, readback, the [`tensor!`] macro.
//! - [`backprop`]: gradient contexts, the [`Function`] trait, `backward`.
//! - [`ops`]: the operator table, op surface, autograd functions and the
//!   CPU / `wgpu` kernel runners.
//! - [`kernel`]: kernel specifications, registry, cache and WGSL generation.
//! - [`device`] and [`backend`]: where tensors live and how that is chosen.
//!
//! # Example
//!
//! ```rust
//! use torchlet::tensor;
//!
//! let x = tensor!([2.0]).unwrap();
//! x.set_requires_grad(true).unwrap();
//! x.sigmoid().unwrap().backward(None).unwrap();
//! let grad = x.grad().unwrap().item().unwrap();
//! assert!((grad - 0.104_993_6).abs() < 1e-6);
//! ```

pub mod approx;
pub mod backend;
pub mod backprop;
pub mod device;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod ops;
pub mod shape;
pub mod storage;
pub mod tensors;

pub use backend::{get_backend, set_backend, Backend};
pub use backprop::{Function, GradientContext, SavedState};
pub use device::Device;
pub use dtype::DType;
pub use error::{Error, Result};
pub use ops::functions::linear;
pub use tensors::{Tensor, TensorData, TensorSource, TensorSpec};
