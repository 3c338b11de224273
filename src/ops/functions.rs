//! Differentiable operations.
//!
//! Each operation is a [`Function`]: its forward pass runs a kernel through
//! [`Tensor::run_kernel`], its backward pass runs the matching gradient
//! kernel (`<op>Grad`) or composes other tensor operations.

use crate::backprop::{should_create_gradient, Function, GradientContext, SavedState};
use crate::error::{shape_mismatch, Error, Result};
use crate::kernel::{KernelConfig, KernelParams};
use crate::ops::table::{BinaryOp, ReductionOp, UnaryOp};
use crate::shape::default_strides;
use crate::tensors::Tensor;

pub(crate) fn check_devices(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.device().same_device(b.device()) {
        Ok(())
    } else {
        Err(Error::DeviceMismatch {
            expected: a.device().name(),
            actual: b.device().name(),
        })
    }
}

pub(crate) fn kernel_config(t: &Tensor) -> KernelConfig {
    KernelConfig::for_dtype(t.dtype())
}

pub(crate) fn size_params(t: &Tensor) -> KernelParams {
    KernelParams::new().size(t.numel())
}

fn operand<'a>(inputs: &'a [Tensor], index: usize, op: &str) -> Result<&'a Tensor> {
    inputs.get(index).ok_or_else(|| {
        Error::InvalidSpec(format!(
            "{op} needs operand #{index}, {} given",
            inputs.len()
        ))
    })
}

fn unexpected_state(op: &str) -> Error {
    Error::InvalidSpec(format!("{op} backward found another operation's saved state"))
}

/// An elementwise operator of one tensor.
pub struct UnaryFunction(pub &'static UnaryOp);

impl Function for UnaryFunction {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let x = operand(inputs, 0, self.0.name)?;
        x.run_single(
            self.0.name,
            &kernel_config(x),
            &size_params(x),
            x.shape().to_vec(),
            &[],
        )
    }

    fn setup_context(&self, ctx: &mut GradientContext, inputs: &[Tensor], _output: &Tensor) {
        ctx.save_for_backward(inputs);
        ctx.state = SavedState::Unary(self.0);
    }

    fn backward(ctx: &GradientContext, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let SavedState::Unary(op) = ctx.state else {
            return Err(unexpected_state("unary"));
        };
        let x = ctx.saved(0)?;
        let g = grad_output.contiguous()?;
        let dx = x.run_single(
            &format!("{}Grad", op.name),
            &kernel_config(x),
            &size_params(x),
            x.shape().to_vec(),
            &[&g],
        )?;
        Ok(vec![Some(dx)])
    }
}

/// An elementwise operator of two equally shaped tensors, computing
/// `op(input, alpha * other)`.
pub struct BinaryFunction {
    pub op: &'static BinaryOp,
    pub alpha: f32,
}

impl BinaryFunction {
    fn params(x: &Tensor, alpha: f32) -> KernelParams {
        size_params(x).set("alpha", f64::from(alpha))
    }
}

impl Function for BinaryFunction {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let x = operand(inputs, 0, self.op.name)?;
        let y = operand(inputs, 1, self.op.name)?;
        x.run_single(
            self.op.name,
            &kernel_config(x),
            &Self::params(x, self.alpha),
            x.shape().to_vec(),
            &[y],
        )
    }

    fn setup_context(&self, ctx: &mut GradientContext, inputs: &[Tensor], _output: &Tensor) {
        ctx.save_for_backward(inputs);
        ctx.state = SavedState::Binary {
            op: self.op,
            alpha: self.alpha,
        };
    }

    fn backward(ctx: &GradientContext, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let SavedState::Binary { op, alpha } = ctx.state else {
            return Err(unexpected_state("binary"));
        };
        let (x, y) = (ctx.saved(0)?, ctx.saved(1)?);
        let g = grad_output.contiguous()?;
        let shape = x.shape().to_vec();
        let mut grads = x
            .run_kernel(
                &format!("{}Grad", op.name),
                &kernel_config(x),
                &Self::params(x, alpha),
                &[shape.clone(), shape],
                &[y, &g],
            )?
            .into_iter();
        let (dx, dy) = (grads.next(), grads.next());
        Ok(vec![
            dx.filter(|_| ctx.needs(0)),
            dy.filter(|_| ctx.needs(1)),
        ])
    }
}

/// A reduction of the whole tensor to a scalar.
pub struct ReductionFunction(pub &'static ReductionOp);

impl Function for ReductionFunction {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let x = operand(inputs, 0, self.0.name)?;
        x.run_single(
            self.0.name,
            &kernel_config(x),
            &size_params(x),
            Vec::new(),
            &[],
        )
    }

    fn setup_context(&self, ctx: &mut GradientContext, inputs: &[Tensor], output: &Tensor) {
        let mut saved = inputs.to_vec();
        saved.push(output.clone());
        ctx.save_for_backward(&saved);
        ctx.state = SavedState::Reduction(self.0);
    }

    fn backward(ctx: &GradientContext, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let SavedState::Reduction(op) = ctx.state else {
            return Err(unexpected_state("reduction"));
        };
        if op.grad.is_none() {
            return Err(Error::NotDifferentiable);
        }
        let (x, out) = (ctx.saved(0)?, ctx.saved(1)?);
        let g = grad_output.contiguous()?;
        let dx = x.run_single(
            &format!("{}Grad", op.name),
            &kernel_config(x),
            &size_params(x),
            x.shape().to_vec(),
            &[out, &g],
        )?;
        Ok(vec![Some(dx)])
    }
}

/// `input [m, k] x other [k, n] -> [m, n]` over any strides.
pub(crate) fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (&[rows, inner], &[inner_b, cols]) = (a.shape(), b.shape()) else {
        return Err(shape_mismatch(a.shape(), b.shape()));
    };
    if inner != inner_b {
        return Err(shape_mismatch(a.shape(), b.shape()));
    }
    check_devices(a, b)?;
    let (sa, sb) = (a.strides(), b.strides());
    #[allow(clippy::cast_precision_loss)]
    let params = KernelParams::new()
        .set("resultRows", rows as f64)
        .set("resultCols", cols as f64)
        .set("innerDim", inner as f64)
        .set("alpha", 1.0)
        .set("aRowStride", sa[0] as f64)
        .set("aColStride", sa[1] as f64)
        .set("bRowStride", sb[0] as f64)
        .set("bColStride", sb[1] as f64);
    a.run_single("mm", &kernel_config(a), &params, vec![rows, cols], &[b])
}

/// Matrix product.
pub struct MmFunction;

impl Function for MmFunction {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        matmul(operand(inputs, 0, "mm")?, operand(inputs, 1, "mm")?)
    }

    fn setup_context(&self, ctx: &mut GradientContext, inputs: &[Tensor], _output: &Tensor) {
        ctx.save_for_backward(inputs);
    }

    fn backward(ctx: &GradientContext, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let (a, b) = (ctx.saved(0)?, ctx.saved(1)?);
        let da = if ctx.needs(0) {
            Some(matmul(grad_output, &b.t()?)?)
        } else {
            None
        };
        let db = if ctx.needs(1) {
            Some(matmul(&a.t()?, grad_output)?)
        } else {
            None
        };
        Ok(vec![da, db])
    }
}

/// Reverses the axes of a view of rank two or less.
pub struct TransposeFunction;

impl Function for TransposeFunction {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let x = operand(inputs, 0, "t")?;
        if x.shape().len() > 2 {
            return Err(Error::InvalidSpec(format!(
                "t expects a tensor of rank 2 or less, got shape {:?}",
                x.shape()
            )));
        }
        let shape: Vec<usize> = x.shape().iter().rev().copied().collect();
        let strides: Vec<usize> = x.strides().iter().rev().copied().collect();
        x.with_shape(&shape, &strides)
    }

    fn setup_context(&self, _ctx: &mut GradientContext, _inputs: &[Tensor], _output: &Tensor) {}

    fn backward(_ctx: &GradientContext, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.t()?.deep_copy()?)])
    }
}

/// Reinterprets a contiguous tensor with another shape of the same size.
pub struct ReshapeFunction(pub Vec<usize>);

impl Function for ReshapeFunction {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let x = operand(inputs, 0, "reshape")?;
        x.with_shape(&self.0, &default_strides(&self.0))
    }

    fn setup_context(&self, ctx: &mut GradientContext, inputs: &[Tensor], _output: &Tensor) {
        if let Some(x) = inputs.first() {
            ctx.state = SavedState::Shape(x.shape().to_vec());
        }
    }

    fn backward(ctx: &GradientContext, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let SavedState::Shape(shape) = &ctx.state else {
            return Err(unexpected_state("reshape"));
        };
        let g = grad_output.deep_copy()?;
        Ok(vec![Some(g.with_shape(shape, &default_strides(shape))?)])
    }
}

/// Materialises a strided view; the gradient passes through as a copy.
pub struct ContiguousFunction;

impl Function for ContiguousFunction {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        operand(inputs, 0, "contiguous")?.copy_contiguous()
    }

    fn setup_context(&self, _ctx: &mut GradientContext, _inputs: &[Tensor], _output: &Tensor) {}

    fn backward(_ctx: &GradientContext, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_output.deep_copy()?)])
    }
}

/// Affine layer `input · weightᵀ + bias` over a batch of rows.
///
/// `input` is `[batch, in]`, `weight` is `[out, in]` and the optional
/// `bias` is `[out]`.
pub struct LinearFunction;

impl Function for LinearFunction {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let input = operand(inputs, 0, "linear")?;
        let weight = operand(inputs, 1, "linear")?;
        let out = matmul(input, &weight.t()?)?;
        if let Some(bias) = inputs.get(2) {
            #[allow(clippy::cast_possible_wrap)]
            let rows = out.shape()[0] as isize;
            let bias = bias.expand(&[rows, -1])?.contiguous()?;
            out.add_(&bias)?;
        }
        Ok(out)
    }

    fn setup_context(&self, ctx: &mut GradientContext, inputs: &[Tensor], _output: &Tensor) {
        ctx.save_for_backward(inputs);
    }

    fn backward(ctx: &GradientContext, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let (input, weight) = (ctx.saved(0)?, ctx.saved(1)?);
        let g = grad_output.contiguous()?;
        let mut grads = vec![
            if ctx.needs(0) {
                Some(matmul(&g, weight)?)
            } else {
                None
            },
            if ctx.needs(1) {
                Some(matmul(&g.t()?, input)?)
            } else {
                None
            },
        ];
        if let Ok(bias) = ctx.saved(2) {
            let bias_grad = if ctx.needs(2) {
                let ones = Tensor::full_on(&[1, g.shape()[0]], 1.0, g.dtype(), g.device())?;
                let summed = matmul(&ones, &g)?;
                Some(summed.with_shape(bias.shape(), &default_strides(bias.shape()))?)
            } else {
                None
            };
            grads.push(bias_grad);
        }
        Ok(grads)
    }
}

/// Applies a linear layer, recording it when any operand requires a
/// gradient.
pub fn linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let mut inputs = vec![input.clone(), weight.clone()];
    inputs.extend(bias.cloned());
    let refs: Vec<&Tensor> = inputs.iter().collect();
    if should_create_gradient(&refs) {
        LinearFunction.apply(&inputs)
    } else {
        LinearFunction.forward(&inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::approx_eq;

    fn tracked(values: Vec<f32>, shape: &[usize]) -> Tensor {
        let t = Tensor::from_vec(values, shape).unwrap();
        t.set_requires_grad(true).unwrap();
        t
    }

    #[test]
    fn mm_gradients_match_the_product_rule() {
        let a = tracked(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = tracked(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]);
        let c = a.mm(&b).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![4.0, 5.0, 10.0, 11.0]);
        c.backward(Some(&Tensor::ones(&[2, 2]).unwrap())).unwrap();
        // dA = 1 · bᵀ, dB = aᵀ · 1
        assert_eq!(
            a.grad().unwrap().to_vec().unwrap(),
            vec![1.0, 1.0, 2.0, 1.0, 1.0, 2.0]
        );
        assert_eq!(
            b.grad().unwrap().to_vec().unwrap(),
            vec![5.0, 5.0, 7.0, 7.0, 9.0, 9.0]
        );
    }

    #[test]
    fn transpose_gradient_is_transposed_back() {
        let a = tracked(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let w = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]).unwrap();
        let y = a.t().unwrap().contiguous().unwrap().mul(&w).unwrap();
        y.sum().unwrap().backward(None).unwrap();
        let grad = a.grad().unwrap();
        assert_eq!(grad.shape(), &[2, 3]);
        assert_eq!(grad.to_vec().unwrap(), vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn reshape_gradient_takes_the_input_shape() {
        let a = tracked(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let r = a.reshape(&[4]).unwrap();
        assert!(r.shares_storage(&a));
        r.square().unwrap().sum().unwrap().backward(None).unwrap();
        let grad = a.grad().unwrap();
        assert_eq!(grad.shape(), &[2, 2]);
        assert_eq!(grad.to_vec().unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn view_gradients_get_their_own_storage() {
        let a = tracked(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let v = a.t().unwrap();
        let c = v.contiguous().unwrap();
        let r = c.reshape(&[6]).unwrap();
        r.sum().unwrap().backward(None).unwrap();

        let (ga, gv, gc, gr) = (
            a.grad().unwrap(),
            v.grad().unwrap(),
            c.grad().unwrap(),
            r.grad().unwrap(),
        );
        assert!(!gc.shares_storage(&gr));
        assert!(!gv.shares_storage(&gc));
        assert!(!ga.shares_storage(&gv));
        assert_eq!(gc.shape(), &[3, 2]);

        gc.add_(&Tensor::ones(&[3, 2]).unwrap()).unwrap();
        assert_eq!(gv.to_vec().unwrap(), vec![1.0; 6]);
        assert_eq!(gr.to_vec().unwrap(), vec![1.0; 6]);
    }

    #[test]
    fn linear_forward_and_gradients() {
        let input = tracked(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let weight = tracked(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]);
        let bias = tracked(vec![0.5, -0.5, 1.0], &[3]);
        let out = linear(&input, &weight, Some(&bias)).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(
            out.to_vec().unwrap(),
            vec![1.5, 1.5, 4.0, 3.5, 3.5, 8.0]
        );

        out.sum().unwrap().backward(None).unwrap();
        assert_eq!(input.grad().unwrap().to_vec().unwrap(), vec![2.0, 2.0, 2.0, 2.0]);
        assert_eq!(
            weight.grad().unwrap().to_vec().unwrap(),
            vec![4.0, 6.0, 4.0, 6.0, 4.0, 6.0]
        );
        let bias_grad = bias.grad().unwrap();
        assert_eq!(bias_grad.shape(), &[3]);
        assert_eq!(bias_grad.to_vec().unwrap(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn linear_without_tracking_records_nothing() {
        let input = Tensor::from_vec(vec![1.0, 2.0], &[1, 2]).unwrap();
        let weight = Tensor::from_vec(vec![3.0, 4.0], &[1, 2]).unwrap();
        let out = linear(&input, &weight, None).unwrap();
        assert!(out.is_leaf());
        assert!(!out.requires_grad());
        assert!(approx_eq(&out.item().unwrap(), &11.0));
    }

    #[test]
    fn binary_alpha_scales_the_other_gradient() {
        let a = tracked(vec![1.0, 2.0], &[2]);
        let b = tracked(vec![3.0, 4.0], &[2]);
        let c = a.sub_with_alpha(&b, 2.0).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![-5.0, -6.0]);
        c.sum().unwrap().backward(None).unwrap();
        assert_eq!(a.grad().unwrap().to_vec().unwrap(), vec![1.0, 1.0]);
        assert_eq!(b.grad().unwrap().to_vec().unwrap(), vec![-2.0, -2.0]);
    }
}
