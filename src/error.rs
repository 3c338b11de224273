//! Error type shared by every layer of the engine.
//!
//! All failures are local and synchronous: an operation either completes or
//! returns one of these variants before touching shared state. The kernel
//! cache and the autograd graph remain usable after any error.

use crate::dtype::DType;

/// Errors raised by tensor construction, kernel dispatch and autograd.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Tensor data or a storage-backed tensor description is unusable.
    #[error("invalid tensor spec: {0}")]
    InvalidSpec(String),

    /// Two shapes that must agree do not.
    #[error("shape mismatch: cannot view {from:?} as {to:?}")]
    ShapeMismatch { from: Vec<usize>, to: Vec<usize> },

    /// An operation that walks memory linearly got a strided view.
    #[error("{op} requires a contiguous input, got shape {shape:?} with strides {strides:?}")]
    NonContiguous {
        op: &'static str,
        shape: Vec<usize>,
        strides: Vec<usize>,
    },

    #[error("unknown kernel \"{0}\"")]
    UnknownKernel(String),

    /// The configuration passed for a kernel does not match its declared options.
    #[error("invalid config for kernel \"{kernel}\": {reason}")]
    InvalidKernelConfig { kernel: String, reason: String },

    /// An expression referenced a parameter that was not supplied.
    #[error("kernel \"{kernel}\" needs parameter \"{name}\"")]
    MissingParameter { kernel: String, name: String },

    #[error(
        "missing input buffer #{index} (out of {arity}) named \"{name}\" in kernel \"{kernel}\""
    )]
    MissingInputBuffer {
        index: usize,
        arity: usize,
        name: String,
        kernel: String,
    },

    #[error("output buffer #{index} for kernel \"{kernel}\" is unusable: {reason}")]
    InvalidOutputBuffer {
        index: usize,
        kernel: String,
        reason: String,
    },

    #[error(
        "expected {expected} output buffers (given the provided output shapes), but kernel \"{kernel}\" produced {actual}"
    )]
    OutputArityMismatch {
        kernel: String,
        expected: usize,
        actual: usize,
    },

    #[error("a tensor that requires a gradient cannot be used in an in-place operation")]
    GradientConflict,

    #[error(
        "only leaf tensors may change requires_grad; use detach() to get a value without history"
    )]
    ImmutableGradFlag,

    #[error("cannot call backward on a tensor that does not require gradients")]
    NotDifferentiable,

    #[error("gradient can only be implicitly created for scalar outputs, got shape {0:?}")]
    ImplicitGradRankError(Vec<usize>),

    #[error(
        "gradient function did not return a gradient for input #{index} (out of {count}); {returned} gradients were returned"
    )]
    MissingInputGradient {
        index: usize,
        count: usize,
        returned: usize,
    },

    /// A buffer or tensor lives on a different device than the kernel runs on.
    #[error("device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("dtype {dtype} is not supported by the {backend} backend")]
    UnsupportedDtype { dtype: DType, backend: &'static str },

    /// A size or workgroup expression in a kernel spec failed to parse.
    #[error("bad expression \"{source_text}\": {reason}")]
    Expr { source_text: String, reason: String },

    /// The requested backend was not compiled in or could not be initialised.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[cfg(feature = "wgpu")]
    #[error(transparent)]
    Gpu(#[from] crate::ops::wgpu::GpuError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn shape_mismatch(from: &[usize], to: &[usize]) -> Error {
    Error::ShapeMismatch {
        from: from.to_vec(),
        to: to.to_vec(),
    }
}
