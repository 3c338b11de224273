//! Parallel CPU backend
//!
//! # CPU Backend
//!
//! Runs compiled kernels directly in host memory. A CPU kernel shares the
//! launch bookkeeping of every backend ([`KernelBase`]) and executes the
//! spec's [`HostBody`] instead of its WGSL.
//!
//! ## Execution
//!
//! - Buffers are decoded into `f32` according to the kernel's dtype, the
//!   host body runs over them and the results are encoded back.
//! - Loops are parallelised with [`rayon`](https://docs.rs/rayon).
//! - Execution is synchronous: outputs are ready when [`CpuKernel::run`]
//!   returns.

use std::sync::Arc;

use log::trace;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::kernel::{HostBody, KernelBase, KernelConfig, KernelParams, KernelSpec};
use crate::shape;
use crate::storage::HostBuffer;

/// A kernel compiled for the host.
#[derive(Debug)]
pub struct CpuKernel {
    base: KernelBase,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn int_param(params: &KernelParams, name: &str) -> usize {
    params.get(name).unwrap_or_default().max(0.0) as usize
}

#[allow(clippy::cast_possible_truncation)]
fn float_param(params: &KernelParams, name: &str) -> f32 {
    params.get(name).unwrap_or_default() as f32
}

impl CpuKernel {
    pub fn new(spec: Arc<KernelSpec>, config: &KernelConfig) -> Result<Self> {
        Ok(Self {
            base: KernelBase::new(spec, config)?,
        })
    }

    pub fn base(&self) -> &KernelBase {
        &self.base
    }

    /// Runs the kernel.
    ///
    /// `outputs` may supply a buffer per declared output; missing or `None`
    /// entries are allocated from the output size expressions. Returns one
    /// buffer per declared output.
    pub fn run(
        &self,
        inputs: &[HostBuffer],
        params: &KernelParams,
        outputs: Vec<Option<HostBuffer>>,
    ) -> Result<Vec<HostBuffer>> {
        let base = &self.base;
        base.check_inputs(inputs)?;
        base.check_parameters(params)?;
        let counts = base.output_element_counts(params)?;
        let elem = base.dtype.byte_size();

        if outputs.len() > counts.len() {
            return Err(Error::InvalidOutputBuffer {
                index: counts.len(),
                kernel: base.name().to_owned(),
                reason: format!("the kernel declares {} output(s)", counts.len()),
            });
        }
        let mut supplied = outputs.into_iter();
        let buffers = counts
            .iter()
            .enumerate()
            .map(|(index, &count)| match supplied.next().flatten() {
                Some(buffer) if buffer.byte_len() >= count * elem => Ok(buffer),
                Some(buffer) => Err(Error::InvalidOutputBuffer {
                    index,
                    kernel: base.name().to_owned(),
                    reason: format!(
                        "{} bytes supplied, {} needed",
                        buffer.byte_len(),
                        count * elem
                    ),
                }),
                None => {
                    trace!("allocating {} bytes for {}", count * elem, base.key);
                    Ok(HostBuffer::zeroed(count * elem))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let decode = |buffer: &HostBuffer| {
            buffer.with_bytes(|bytes| base.dtype.decode(bytes, bytes.len() / elem))
        };
        let values: Vec<Vec<f32>> = inputs.iter().map(decode).collect();
        let target = if base.spec.inplace {
            buffers.first().map(decode)
        } else {
            None
        };

        trace!("cpu dispatch {}", base.key);
        let results = self.execute(&values, target.as_deref(), params, &counts)?;
        for (buffer, result) in buffers.iter().zip(&results) {
            buffer.with_bytes_mut(|dst| base.dtype.encode_into(result, dst));
        }
        Ok(buffers)
    }

    fn execute(
        &self,
        inputs: &[Vec<f32>],
        target: Option<&[f32]>,
        params: &KernelParams,
        counts: &[usize],
    ) -> Result<Vec<Vec<f32>>> {
        let n = counts.first().copied().unwrap_or_default();
        let operand = |index: usize, len: usize| -> Result<&[f32]> {
            let src: &[f32] = if self.base.spec.inplace {
                if index == 0 {
                    target.unwrap_or_default()
                } else {
                    &inputs[index - 1]
                }
            } else {
                &inputs[index]
            };
            src.get(..len).ok_or_else(|| {
                Error::InvalidSpec(format!(
                    "operand #{index} of kernel \"{}\" holds {} elements, {len} needed",
                    self.base.name(),
                    src.len()
                ))
            })
        };
        let alpha = || float_param(params, "alpha");

        Ok(match self.base.spec.host {
            HostBody::Unary(op) => {
                vec![operand(0, n)?.par_iter().map(|&x| (op.forward)(x)).collect()]
            }
            HostBody::UnaryGrad(op) => {
                let (x, g) = (operand(0, n)?, operand(1, n)?);
                vec![
                    x.par_iter()
                        .zip(g)
                        .map(|(&x, &g)| (op.grad)(x, g))
                        .collect(),
                ]
            }
            HostBody::Binary(op) => {
                let (x, y, alpha) = (operand(0, n)?, operand(1, n)?, alpha());
                vec![
                    x.par_iter()
                        .zip(y)
                        .map(|(&x, &y)| (op.forward)(x, alpha * y))
                        .collect(),
                ]
            }
            HostBody::BinaryGrad(op) => {
                let (x, y, g, alpha) = (operand(0, n)?, operand(1, n)?, operand(2, n)?, alpha());
                let (dx, dy): (Vec<f32>, Vec<f32>) = x
                    .par_iter()
                    .zip(y)
                    .zip(g)
                    .map(|((&x, &y), &g)| {
                        let (dx, dy) = (op.grad)(x, alpha * y, g);
                        (dx, alpha * dy)
                    })
                    .unzip();
                vec![dx, dy]
            }
            HostBody::Reduce(op) => {
                let size = int_param(params, "size");
                let total = operand(0, size)?
                    .par_iter()
                    .fold(|| op.init, |acc, &x| (op.step)(acc, x))
                    .reduce(|| op.init, op.combine);
                #[allow(clippy::cast_precision_loss)]
                let out = (op.finish)(total, size as f32);
                vec![vec![out]]
            }
            HostBody::ReduceGrad(op) => {
                let grad = op.grad.ok_or_else(|| {
                    Error::InvalidSpec(format!("reduction \"{}\" has no gradient", op.name))
                })?;
                let x = operand(0, n)?;
                let (out, g) = (operand(1, 1)?[0], operand(2, 1)?[0]);
                #[allow(clippy::cast_precision_loss)]
                let count = n as f32;
                vec![x.par_iter().map(|&x| grad(x, out, g, count)).collect()]
            }
            HostBody::Matmul => {
                let [rows, cols, inner, ars, acs, brs, bcs] = [
                    "resultRows",
                    "resultCols",
                    "innerDim",
                    "aRowStride",
                    "aColStride",
                    "bRowStride",
                    "bColStride",
                ]
                .map(|name| int_param(params, name));
                let alpha = alpha();
                let a = operand(0, shape::storage_span(&[rows, inner], &[ars, acs]))?;
                let b = operand(1, shape::storage_span(&[inner, cols], &[brs, bcs]))?;
                vec![
                    (0..rows * cols)
                        .into_par_iter()
                        .map(|idx| {
                            let (row, col) = (idx / cols, idx % cols);
                            let acc: f32 = (0..inner)
                                .map(|k| a[row * ars + k * acs] * b[k * brs + col * bcs])
                                .sum();
                            acc * alpha
                        })
                        .collect(),
                ]
            }
            HostBody::Copy => {
                let dims = ["shape0", "shape1", "shape2", "shape3"].map(|p| int_param(params, p));
                let strides =
                    ["stride0", "stride1", "stride2", "stride3"].map(|p| int_param(params, p));
                let src = operand(0, shape::storage_span(&dims, &strides))?;
                vec![
                    (0..n)
                        .into_par_iter()
                        .map(|i| {
                            let mut rem = i;
                            let mut offset = 0;
                            for axis in (1..4).rev() {
                                offset += (rem % dims[axis]) * strides[axis];
                                rem /= dims[axis];
                            }
                            src[offset + rem * strides[0]]
                        })
                        .collect(),
                ]
            }
            HostBody::Fill => vec![vec![float_param(params, "value"); n]],
        })
    }
}
