//! Operation dispatch layer.
//!
//! The tensor op surface. Every method validates its operands against the
//! view model, then either runs the operation's [`Function::forward`]
//! directly or, when an operand requires a gradient, records it through
//! [`Function::apply`]. The kernel itself is resolved on the operands' device
//! by [`Tensor::run_kernel`].
//!
//! Elementwise methods are generated from the operator table:
//! - `op()` returns a new tensor, `op_()` overwrites the receiver in place;
//! - binary ops take an equally shaped `other` and the `*_with_alpha`
//!   variants scale it first;
//! - reductions return a tensor of shape `[]`.
//!
//! # Example
//! ```rust
//! use torchlet::tensor;
//! let x = tensor!([1.0, 4.0, 9.0]).unwrap();
//! assert_eq!(x.sqrt().unwrap().to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
//! assert_eq!(x.sum().unwrap().item().unwrap(), 14.0);
//! ```

use crate::backprop::{should_create_gradient, Function};
use crate::error::{shape_mismatch, Error, Result};
use crate::ops::functions::{
    check_devices, kernel_config, matmul, size_params, BinaryFunction, ContiguousFunction,
    MmFunction, ReductionFunction, ReshapeFunction, TransposeFunction, UnaryFunction,
};
use crate::ops::table::{self, BinaryOp, ReductionOp, UnaryOp};
use crate::tensors::Tensor;

fn require_contiguous(t: &Tensor, op: &'static str) -> Result<()> {
    if t.is_contiguous() {
        Ok(())
    } else {
        Err(Error::NonContiguous {
            op,
            shape: t.shape().to_vec(),
            strides: t.strides().to_vec(),
        })
    }
}

fn check_pair(a: &Tensor, b: &Tensor, op: &'static str) -> Result<()> {
    check_devices(a, b)?;
    if a.shape() != b.shape() {
        return Err(shape_mismatch(b.shape(), a.shape()));
    }
    require_contiguous(a, op)?;
    require_contiguous(b, op)
}

fn run<F: Function>(f: F, inputs: &[&Tensor]) -> Result<Tensor> {
    let owned: Vec<Tensor> = inputs.iter().map(|&t| t.clone()).collect();
    if should_create_gradient(inputs) {
        f.apply(&owned)
    } else {
        f.forward(&owned)
    }
}

impl Tensor {
    /// Applies a unary operator from the table.
    pub fn unary(&self, op: &'static UnaryOp) -> Result<Tensor> {
        require_contiguous(self, op.name)?;
        run(UnaryFunction(op), &[self])
    }

    /// Applies a unary operator from the table in place.
    pub fn unary_(&self, op: &'static UnaryOp) -> Result<Tensor> {
        require_contiguous(self, op.name)?;
        self.run_kernel_inplace(
            &format!("{}_", op.name),
            &kernel_config(self),
            &size_params(self),
            &[],
        )
    }

    /// Computes `op(self, alpha * other)`.
    pub fn binary(&self, op: &'static BinaryOp, other: &Tensor, alpha: f32) -> Result<Tensor> {
        check_pair(self, other, op.name)?;
        run(BinaryFunction { op, alpha }, &[self, other])
    }

    /// Overwrites `self` with `op(self, alpha * other)`.
    pub fn binary_(&self, op: &'static BinaryOp, other: &Tensor, alpha: f32) -> Result<Tensor> {
        check_pair(self, other, op.name)?;
        self.run_kernel_inplace(
            &format!("{}_", op.name),
            &kernel_config(self),
            &size_params(self).set("alpha", f64::from(alpha)),
            &[other],
        )
    }

    /// Reduces the whole tensor with a reduction from the table.
    ///
    /// Reductions without a gradient, such as `count_nonzero`, are never
    /// recorded.
    pub fn reduce(&self, op: &'static ReductionOp) -> Result<Tensor> {
        require_contiguous(self, op.name)?;
        if op.grad.is_none() {
            return ReductionFunction(op).forward(&[self.clone()]);
        }
        run(ReductionFunction(op), &[self])
    }

    pub fn add_with_alpha(&self, other: &Tensor, alpha: f32) -> Result<Tensor> {
        self.binary(&table::ADD, other, alpha)
    }

    pub fn sub_with_alpha(&self, other: &Tensor, alpha: f32) -> Result<Tensor> {
        self.binary(&table::SUB, other, alpha)
    }

    pub fn add_with_alpha_(&self, other: &Tensor, alpha: f32) -> Result<Tensor> {
        self.binary_(&table::ADD, other, alpha)
    }

    pub fn sub_with_alpha_(&self, other: &Tensor, alpha: f32) -> Result<Tensor> {
        self.binary_(&table::SUB, other, alpha)
    }

    /// Matrix product of `[m, k]` and `[k, n]` tensors. Either operand may be
    /// a strided view such as a transpose.
    pub fn mm(&self, other: &Tensor) -> Result<Tensor> {
        if should_create_gradient(&[self, other]) {
            MmFunction.apply(&[self.clone(), other.clone()])
        } else {
            matmul(self, other)
        }
    }

    /// Transposed view of a tensor of rank two or less. Never copies.
    pub fn t(&self) -> Result<Tensor> {
        let view = TransposeFunction.forward(&[self.clone()])?;
        if should_create_gradient(&[self]) {
            Ok(TransposeFunction.apply_grad(&[self.clone()], &view))
        } else {
            Ok(view)
        }
    }

    /// View with another shape of the same size. Strided views are made
    /// contiguous first.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let src = self.contiguous()?;
        let reshape = ReshapeFunction(shape.to_vec());
        let view = reshape.forward(&[src.clone()])?;
        if should_create_gradient(&[&src]) {
            Ok(reshape.apply_grad(&[src], &view))
        } else {
            Ok(view)
        }
    }

    /// The same values in row-major storage. Contiguous tensors are returned
    /// as-is; strided views of rank up to four are copied.
    pub fn contiguous(&self) -> Result<Tensor> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        run(ContiguousFunction, &[self])
    }
}

macro_rules! unary_methods {
    ($($name:ident, $inplace:ident => $op:ident $(| $alias:ident)*;)*) => {
        impl Tensor {
            $(
                #[doc = concat!("Elementwise `", stringify!($name), "`.")]
                pub fn $name(&self) -> Result<Tensor> {
                    self.unary(&table::$op)
                }

                #[doc = concat!("In-place `", stringify!($name), "`.")]
                pub fn $inplace(&self) -> Result<Tensor> {
                    self.unary_(&table::$op)
                }

                $(
                    #[doc = concat!("Alias of [`Tensor::", stringify!($name), "`].")]
                    pub fn $alias(&self) -> Result<Tensor> {
                        self.unary(&table::$op)
                    }
                )*
            )*
        }
    };
}

macro_rules! binary_methods {
    ($($name:ident, $inplace:ident => $op:ident $(| $alias:ident)*;)*) => {
        impl Tensor {
            $(
                #[doc = concat!("Elementwise `", stringify!($name), "` of equally shaped tensors.")]
                pub fn $name(&self, other: &Tensor) -> Result<Tensor> {
                    self.binary(&table::$op, other, 1.0)
                }

                #[doc = concat!("In-place `", stringify!($name), "`.")]
                pub fn $inplace(&self, other: &Tensor) -> Result<Tensor> {
                    self.binary_(&table::$op, other, 1.0)
                }

                $(
                    #[doc = concat!("Alias of [`Tensor::", stringify!($name), "`].")]
                    pub fn $alias(&self, other: &Tensor) -> Result<Tensor> {
                        self.binary(&table::$op, other, 1.0)
                    }
                )*
            )*
        }
    };
}

macro_rules! reduction_methods {
    ($($name:ident => $op:ident;)*) => {
        impl Tensor {
            $(
                #[doc = concat!("`", stringify!($name), "` over every element, as a tensor of shape `[]`.")]
                pub fn $name(&self) -> Result<Tensor> {
                    self.reduce(&table::$op)
                }
            )*
        }
    };
}

unary_methods! {
    abs, abs_ => ABS | absolute;
    acos, acos_ => ACOS | arccos;
    acosh, acosh_ => ACOSH | arccosh;
    asin, asin_ => ASIN | arcsin;
    asinh, asinh_ => ASINH | arcsinh;
    atan, atan_ => ATAN | arctan;
    ceil, ceil_ => CEIL;
    cos, cos_ => COS;
    cosh, cosh_ => COSH;
    deg2rad, deg2rad_ => DEG2RAD;
    exp, exp_ => EXP;
    exp2, exp2_ => EXP2;
    expm1, expm1_ => EXPM1;
    floor, floor_ => FLOOR;
    frac, frac_ => FRAC;
    log, log_ => LOG;
    log10, log10_ => LOG10;
    log1p, log1p_ => LOG1P;
    log2, log2_ => LOG2;
    neg, neg_ => NEG | negative;
    positive, positive_ => POSITIVE;
    rad2deg, rad2deg_ => RAD2DEG;
    reciprocal, reciprocal_ => RECIPROCAL;
    relu, relu_ => RELU;
    round, round_ => ROUND;
    rsqrt, rsqrt_ => RSQRT;
    sigmoid, sigmoid_ => SIGMOID;
    sign, sign_ => SIGN;
    silu, silu_ => SILU;
    sin, sin_ => SIN;
    sinc, sinc_ => SINC;
    sinh, sinh_ => SINH;
    sqrt, sqrt_ => SQRT;
    square, square_ => SQUARE;
    tan, tan_ => TAN;
    tanh, tanh_ => TANH;
    trunc, trunc_ => TRUNC | fix;
}

binary_methods! {
    add, add_ => ADD;
    sub, sub_ => SUB | subtract;
    mul, mul_ => MUL | multiply;
    div, div_ => DIV | divide;
    pow, pow_ => POW;
    atan2, atan2_ => ATAN2 | arctan2;
    copysign, copysign_ => COPYSIGN;
    hypot, hypot_ => HYPOT;
    ldexp, ldexp_ => LDEXP;
    logaddexp, logaddexp_ => LOGADDEXP;
    logaddexp2, logaddexp2_ => LOGADDEXP2;
    xlogy, xlogy_ => XLOGY;
}

reduction_methods! {
    sum => SUM;
    mean => MEAN;
    prod => PROD;
    norm => NORM;
    all => ALL;
    any => ANY;
    count_nonzero => COUNT_NONZERO;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::approx_eq;

    fn vector(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), &[values.len()]).unwrap()
    }

    #[test]
    fn aliases_share_the_operator() {
        let x = vector(&[-1.5, 2.0]);
        assert_eq!(x.abs().unwrap().to_vec().unwrap(), vec![1.5, 2.0]);
        assert_eq!(x.absolute().unwrap().to_vec().unwrap(), vec![1.5, 2.0]);
        assert_eq!(x.fix().unwrap().to_vec().unwrap(), vec![-1.0, 2.0]);
    }

    #[test]
    fn in_place_ops_overwrite_the_receiver() {
        let x = vector(&[1.0, -2.0]);
        let same = x.neg_().unwrap();
        assert!(same.same_handle(&x));
        assert_eq!(x.to_vec().unwrap(), vec![-1.0, 2.0]);
        x.mul_(&vector(&[3.0, 3.0])).unwrap();
        assert_eq!(x.to_vec().unwrap(), vec![-3.0, 6.0]);
    }

    #[test]
    fn binary_ops_need_equal_shapes() {
        let err = vector(&[1.0, 2.0]).add(&vector(&[1.0])).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn strided_operands_are_rejected() {
        let m = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let err = m.t().unwrap().exp().unwrap_err();
        assert!(matches!(err, Error::NonContiguous { op: "exp", .. }));
        let c = m.t().unwrap().contiguous().unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn reductions_yield_scalars() {
        let x = vector(&[1.0, 2.0, 3.0, 4.0]);
        let mean = x.mean().unwrap();
        assert!(mean.shape().is_empty());
        assert!(approx_eq(&mean.item().unwrap(), &2.5));
        assert!(approx_eq(&x.prod().unwrap().item().unwrap(), &24.0));
        assert!(approx_eq(&x.norm().unwrap().item().unwrap(), &30.0_f32.sqrt()));
        assert_eq!(vector(&[0.0, 2.0, 0.0]).count_nonzero().unwrap().item().unwrap(), 1.0);
        assert_eq!(vector(&[0.0, 1.0]).all().unwrap().item().unwrap(), 0.0);
        assert_eq!(vector(&[0.0, 1.0]).any().unwrap().item().unwrap(), 1.0);
    }

    #[test]
    fn non_differentiable_reductions_are_not_recorded() {
        let x = vector(&[1.0, 2.0]);
        x.set_requires_grad(true).unwrap();
        let count = x.count_nonzero().unwrap();
        assert!(!count.requires_grad());
        assert!(!x.sum().unwrap().is_leaf());
    }

    #[test]
    fn mm_follows_transposed_strides() {
        let m = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let mt = m.t().unwrap();
        assert!(mt.shares_storage(&m));
        let p = m.mm(&mt).unwrap();
        assert_eq!(p.to_vec().unwrap(), vec![5.0, 11.0, 11.0, 25.0]);
        assert!(m.mm(&vector(&[1.0, 2.0])).is_err());
    }

    #[test]
    fn reshape_shares_contiguous_storage() {
        let m = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let r = m.reshape(&[3, 2]).unwrap();
        assert!(r.shares_storage(&m));
        assert!(matches!(
            m.reshape(&[4]).unwrap_err(),
            Error::ShapeMismatch { .. }
        ));
        let rt = m.t().unwrap().reshape(&[6]).unwrap();
        assert!(!rt.shares_storage(&m));
        assert_eq!(rt.to_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }
}
