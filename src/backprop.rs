//! Reverse-mode automatic differentiation.
//!
//! # Autograd
//!
//! Every differentiable operation is a [`Function`]. When at least one input
//! requires a gradient the operation runs through [`Function::apply`], which
//! records a [`GradientContext`] and the function's backward routine on the
//! output. The recorded nodes form a graph from each output back to its
//! inputs, replayed by [`Tensor::backward`].
//!
//! ## Tensor states
//!
//! - **leaf, untracked**: no gradient is ever computed.
//! - **leaf, tracked**: `requires_grad` is set and no node is attached;
//!   gradients accumulate in [`Tensor::grad`].
//! - **interior**: produced by a recorded operation. Its tracking flag is
//!   fixed.
//!
//! ## Replay
//!
//! `backward` accumulates the incoming gradient into the tensor, then runs
//! the node's backward routine and recurses into each tracked input with its
//! gradient, depth first. A tensor reached along several edges is visited
//! once per edge and sums what arrives.
//!
//! ## Example
//!
//! ```rust
//! use torchlet::tensor;
//! let a = tensor!([1.0, 2.0, 3.0]).unwrap();
//! a.set_requires_grad(true).unwrap();
//! let b = a.sub(&a.mul(&a).unwrap()).unwrap();
//! b.sum().unwrap().backward(None).unwrap();
//! assert_eq!(a.grad().unwrap().to_vec().unwrap(), vec![-1.0, -3.0, -5.0]);
//! ```

use std::sync::Arc;

use log::trace;

use crate::error::{shape_mismatch, Error, Result};
use crate::ops::table::{BinaryOp, ReductionOp, UnaryOp};
use crate::tensors::Tensor;

/// Backward routine of a recorded operation: maps the gradient of the output
/// to one optional gradient per input.
pub type BackwardFn = fn(&GradientContext, &Tensor) -> Result<Vec<Option<Tensor>>>;

/// Scalars an operation's backward routine needs besides saved tensors.
#[derive(Clone, Default)]
pub enum SavedState {
    #[default]
    None,
    Unary(&'static UnaryOp),
    Binary {
        op: &'static BinaryOp,
        alpha: f32,
    },
    Reduction(&'static ReductionOp),
    /// Shape of the input, for view-changing operations.
    Shape(Vec<usize>),
}

/// State recorded by one forward invocation.
pub struct GradientContext {
    /// Whether each input required a gradient when the operation ran.
    pub needs_input_gradient: Vec<bool>,
    /// The inputs that need gradients, by position.
    pub inputs_with_gradient: Vec<Option<Tensor>>,
    pub saved_tensors: Vec<Tensor>,
    pub state: SavedState,
}

impl GradientContext {
    pub fn new(inputs: &[Tensor]) -> Self {
        let needs_input_gradient: Vec<bool> = inputs.iter().map(Tensor::requires_grad).collect();
        let inputs_with_gradient = inputs
            .iter()
            .zip(&needs_input_gradient)
            .map(|(t, &needs)| needs.then(|| t.clone()))
            .collect();
        Self {
            needs_input_gradient,
            inputs_with_gradient,
            saved_tensors: Vec::new(),
            state: SavedState::None,
        }
    }

    pub fn save_for_backward(&mut self, tensors: &[Tensor]) {
        self.saved_tensors = tensors.to_vec();
    }

    /// Whether input `index` needs a gradient.
    pub fn needs(&self, index: usize) -> bool {
        self.needs_input_gradient.get(index).copied().unwrap_or(false)
    }

    /// The saved tensor at `index`.
    pub fn saved(&self, index: usize) -> Result<&Tensor> {
        self.saved_tensors.get(index).ok_or_else(|| {
            Error::InvalidSpec(format!(
                "backward needs saved tensor #{index}, {} were saved",
                self.saved_tensors.len()
            ))
        })
    }
}

/// A recorded operation attached to its output.
pub(crate) struct GradNode {
    pub(crate) ctx: GradientContext,
    pub(crate) backward: BackwardFn,
}

/// Whether an operation over `inputs` must be recorded.
pub fn should_create_gradient(inputs: &[&Tensor]) -> bool {
    inputs.iter().any(|t| t.requires_grad())
}

/// A differentiable operation.
pub trait Function {
    /// Computes the output from untracked inputs.
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor>;

    /// Saves what `backward` needs. `inputs` are detached and `output` is an
    /// untracked alias of the result.
    fn setup_context(&self, ctx: &mut GradientContext, inputs: &[Tensor], output: &Tensor);

    fn backward(ctx: &GradientContext, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>>
    where
        Self: Sized;

    /// Runs `forward` on detached inputs and records the operation on the
    /// output.
    fn apply(&self, inputs: &[Tensor]) -> Result<Tensor>
    where
        Self: Sized,
    {
        let mut ctx = GradientContext::new(inputs);
        let detached: Vec<Tensor> = inputs.iter().map(Tensor::detach).collect();
        let output = self.forward(&detached)?;
        self.setup_context(&mut ctx, &detached, &output.alias());
        output.attach(ctx, Self::backward);
        Ok(output)
    }

    /// Records the operation on an output that was computed separately,
    /// such as a view of an input.
    fn apply_grad(&self, inputs: &[Tensor], output: &Tensor) -> Tensor
    where
        Self: Sized,
    {
        let mut ctx = GradientContext::new(inputs);
        let detached: Vec<Tensor> = inputs.iter().map(Tensor::detach).collect();
        self.setup_context(&mut ctx, &detached, &output.alias());
        output.attach(ctx, Self::backward);
        output.clone()
    }
}

impl Tensor {
    pub(crate) fn attach(&self, ctx: GradientContext, backward: BackwardFn) {
        let mut meta = self.meta();
        meta.requires_grad = true;
        meta.grad_fn = Some(Arc::new(GradNode { ctx, backward }));
    }

    fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let current = self.meta().grad.clone();
        let next = match current {
            Some(existing) => existing.contiguous()?.add(&grad.contiguous()?)?,
            None => grad.clone(),
        };
        self.meta().grad = Some(next);
        Ok(())
    }

    /// Checks that `gradient` can stand for the gradient of this tensor.
    fn check_gradient(&self, gradient: &Tensor) -> Result<()> {
        if gradient.shape() != self.shape() {
            return Err(shape_mismatch(gradient.shape(), self.shape()));
        }
        if gradient.dtype() != self.dtype() {
            return Err(Error::InvalidSpec(format!(
                "gradient of dtype {} for a tensor of dtype {}",
                gradient.dtype(),
                self.dtype()
            )));
        }
        if !gradient.device().same_device(self.device()) {
            return Err(Error::DeviceMismatch {
                expected: self.device().name(),
                actual: gradient.device().name(),
            });
        }
        Ok(())
    }

    /// Backpropagates `gradient` (the gradient of some scalar with respect
    /// to this tensor) through the recorded graph.
    ///
    /// Without an explicit gradient the tensor must hold a single value,
    /// of shape `[]` or `[1]`, and is seeded with one. An explicit gradient
    /// must match the tensor's shape, dtype and device. Gradients of a node
    /// are stored only once its backward routine has succeeded.
    pub fn backward(&self, gradient: Option<&Tensor>) -> Result<()> {
        if !self.requires_grad() {
            return Err(Error::NotDifferentiable);
        }
        let grad = match gradient {
            Some(g) => {
                self.check_gradient(g)?;
                g.detach()
            }
            None => {
                let shape = self.shape();
                if !(shape.is_empty() || shape == [1]) {
                    return Err(Error::ImplicitGradRankError(shape.to_vec()));
                }
                Tensor::full_on(shape, 1.0, self.dtype(), self.device())?
            }
        };

        let Some(node) = self.meta().grad_fn.clone() else {
            return self.accumulate_grad(&grad);
        };
        let grads = (node.backward)(&node.ctx, &grad)?;
        let count = node.ctx.inputs_with_gradient.len();
        let mut edges = Vec::new();
        for (index, input) in node.ctx.inputs_with_gradient.iter().enumerate() {
            let Some(input) = input else {
                continue;
            };
            match grads.get(index) {
                Some(Some(g)) => {
                    input.check_gradient(g)?;
                    edges.push((input, g));
                }
                _ => {
                    return Err(Error::MissingInputGradient {
                        index,
                        count,
                        returned: grads.len(),
                    });
                }
            }
        }
        self.accumulate_grad(&grad)?;
        trace!("backward through {self}: {} gradient(s)", grads.len());
        for (input, g) in edges {
            input.backward(Some(g))?;
        }
        Ok(())
    }
}
