//! Tensor views.
//!
//! # Tensors
//!
//! A [`Tensor`] is a view over a [`Storage`]: a dtype, a shape and per-axis
//! strides interpreting the storage's bytes, plus the autograd state of the
//! view (tracking flag, accumulated gradient, backward node).
//!
//! - `Tensor` is a cheap-clone handle. Cloning it shares the view, including
//!   its gradient.
//! - Views may alias storage: [`Tensor::with_shape`], [`Tensor::expand`],
//!   [`Tensor::t`] and [`Tensor::detach`] never copy.
//! - Contiguity is derived from shape and strides, never stored.
//!
//! ## Construction
//!
//! From literal data with the [`tensor!`](crate::tensor) macro,
//! [`Tensor::parse`] (a JSON-style nested array) or [`Tensor::from_vec`];
//! from a full [`TensorSpec`] when the dtype, device or an existing storage
//! matter; or through the [`Tensor::zeros`] / [`Tensor::ones`] /
//! [`Tensor::full`] factories.
//!
//! ## Example
//!
//! ```rust
//! use torchlet::tensor;
//! let t = tensor!([[1.0, 2.0], [3.0, 4.0]]).unwrap();
//! assert_eq!(t.shape(), &[2, 2]);
//! assert_eq!(t.t().unwrap().to_vec().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

use crate::backprop::GradNode;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::{shape_mismatch, Error, Result};
use crate::kernel::{KernelConfig, KernelParams};
use crate::shape::{self, default_strides, element_count};
use crate::storage::Storage;

/// Nested literal numeric data.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Scalar(f32),
    List(Vec<TensorData>),
}

impl TensorData {
    /// Shape and row-major values of the data.
    ///
    /// Sibling lists must share one shape. An empty list has shape `[0]`.
    pub fn flatten(&self) -> Result<(Vec<usize>, Vec<f32>)> {
        let mut values = Vec::new();
        let shape = self.walk(&mut values)?;
        Ok((shape, values))
    }

    fn walk(&self, values: &mut Vec<f32>) -> Result<Vec<usize>> {
        match self {
            Self::Scalar(v) => {
                values.push(*v);
                Ok(Vec::new())
            }
            Self::List(items) => {
                let mut inner: Option<Vec<usize>> = None;
                for item in items {
                    let shape = item.walk(values)?;
                    match &inner {
                        Some(first) if *first != shape => {
                            return Err(Error::InvalidSpec(format!(
                                "ragged tensor data: rows of shape {first:?} and {shape:?}"
                            )));
                        }
                        Some(_) => {}
                        None => inner = Some(shape),
                    }
                }
                let mut shape = vec![items.len()];
                shape.extend(inner.unwrap_or_default());
                Ok(shape)
            }
        }
    }
}

impl From<f32> for TensorData {
    fn from(value: f32) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<f32>> for TensorData {
    fn from(values: Vec<f32>) -> Self {
        Self::List(values.into_iter().map(Self::Scalar).collect())
    }
}

impl From<Vec<Vec<f32>>> for TensorData {
    fn from(rows: Vec<Vec<f32>>) -> Self {
        Self::List(rows.into_iter().map(Self::from).collect())
    }
}

struct LiteralParser<'a> {
    src: &'a str,
    pos: usize,
}

impl LiteralParser<'_> {
    fn error(&self, reason: &str) -> Error {
        Error::InvalidSpec(format!("malformed tensor literal at byte {}: {reason}", self.pos))
    }

    fn peek(&mut self) -> Option<u8> {
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        bytes.get(self.pos).copied()
    }

    fn value(&mut self) -> Result<TensorData> {
        match self.peek() {
            Some(b'[') => self.list(),
            Some(b'-' | b'+' | b'.' | b'0'..=b'9') => self.number(),
            Some(_) => Err(self.error("expected a number or '['")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn list(&mut self) -> Result<TensorData> {
        self.pos += 1;
        let mut items = Vec::new();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(TensorData::List(items));
        }
        loop {
            items.push(self.value()?);
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(TensorData::List(items));
                }
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn number(&mut self) -> Result<TensorData> {
        let start = self.pos;
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len()
            && matches!(bytes[self.pos], b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')
        {
            self.pos += 1;
        }
        self.src[start..self.pos]
            .parse::<f32>()
            .map(TensorData::Scalar)
            .map_err(|e| self.error(&e.to_string()))
    }
}

impl FromStr for TensorData {
    type Err = Error;

    /// Parses a JSON-style number or nested array, e.g. `[[1, 2], [3, 4.5]]`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parser = LiteralParser { src: s, pos: 0 };
        let data = parser.value()?;
        match parser.peek() {
            None => Ok(data),
            Some(_) => Err(parser.error("trailing characters")),
        }
    }
}

/// Defines a tensor from nested literal arrays, returning
/// `Result<Tensor>`.
///
/// Ragged rows are reported as [`Error::InvalidSpec`].
///
/// # Example
/// ```
/// use torchlet::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]).unwrap();
/// assert_eq!(t.shape(), &[2, 2]);
/// assert!(tensor!([[1.0, 2.0], [3.0]]).is_err());
/// ```
#[macro_export]
macro_rules! tensor {
    (@data [ $( [ $($inner:tt)* ] ),+ $(,)? ]) => {
        $crate::tensors::TensorData::List(vec![ $( $crate::tensor!(@data [ $($inner)* ]) ),+ ])
    };
    (@data [ $( $x:expr ),* $(,)? ]) => {
        $crate::tensors::TensorData::List(vec![
            $( $crate::tensors::TensorData::Scalar(($x) as f32) ),*
        ])
    };
    (@data $x:expr) => {
        $crate::tensors::TensorData::Scalar(($x) as f32)
    };
    ($($t:tt)+) => {
        $crate::tensors::Tensor::from_data($crate::tensor!(@data $($t)+))
    };
}

/// Where a tensor's values come from.
#[derive(Debug, Clone)]
pub enum TensorSource {
    Data(TensorData),
    /// An existing storage, viewed without copying.
    Storage(Storage),
}

/// Everything needed to build a tensor.
#[derive(Debug, Clone, Default)]
pub struct TensorSpec {
    pub source: Option<TensorSource>,
    pub dtype: DType,
    /// `None` selects [`Device::default`], or the storage's device.
    pub device: Option<Device>,
    pub shape: Option<Vec<usize>>,
    pub strides: Option<Vec<usize>>,
    pub requires_grad: bool,
}

impl TensorSpec {
    pub fn from_data(data: TensorData) -> Self {
        Self {
            source: Some(TensorSource::Data(data)),
            ..Self::default()
        }
    }

    pub fn from_storage(storage: Storage) -> Self {
        Self {
            source: Some(TensorSource::Storage(storage)),
            ..Self::default()
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn on(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    pub fn with_strides(mut self, strides: impl Into<Vec<usize>>) -> Self {
        self.strides = Some(strides.into());
        self
    }

    pub fn requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }
}

/// Mutable autograd state of a view.
#[derive(Default)]
pub(crate) struct AutogradMeta {
    pub(crate) requires_grad: bool,
    pub(crate) grad: Option<Tensor>,
    pub(crate) grad_fn: Option<Arc<GradNode>>,
}

struct TensorInner {
    storage: Storage,
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    device: Device,
    meta: Mutex<AutogradMeta>,
}

/// A strided view over device storage with autograd state.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

fn storage_device(storage: &Storage) -> Result<Device> {
    match storage {
        Storage::Host(_) => Ok(Device::cpu()),
        #[cfg(feature = "wgpu")]
        Storage::Gpu(_) => Device::wgpu(),
    }
}

impl Tensor {
    /// Wraps `storage` in a view after checking that the view fits it.
    fn build(
        storage: Storage,
        dtype: DType,
        shape: Vec<usize>,
        strides: Vec<usize>,
        device: Device,
        requires_grad: bool,
    ) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(Error::InvalidSpec(format!(
                "shape {shape:?} and strides {strides:?} differ in rank"
            )));
        }
        let needed = shape::storage_span(&shape, &strides) * dtype.byte_size();
        if needed > storage.byte_len() {
            return Err(Error::InvalidSpec(format!(
                "view {shape:?} with strides {strides:?} needs {needed} bytes, storage holds {}",
                storage.byte_len()
            )));
        }
        Ok(Self {
            inner: Arc::new(TensorInner {
                storage,
                dtype,
                shape,
                strides,
                device,
                meta: Mutex::new(AutogradMeta {
                    requires_grad,
                    ..AutogradMeta::default()
                }),
            }),
        })
    }

    /// Builds a tensor from a full specification.
    ///
    /// A storage-backed spec needs a shape or strides: a missing shape is the
    /// scalar shape `[]`, missing strides are the row-major default.
    pub fn from_spec(spec: TensorSpec) -> Result<Self> {
        let TensorSpec {
            source,
            dtype,
            device,
            shape,
            strides,
            requires_grad,
        } = spec;
        match source {
            None => Err(Error::InvalidSpec("no data or storage given".into())),
            Some(TensorSource::Data(data)) => {
                let (data_shape, values) = data.flatten()?;
                let shape = match shape {
                    Some(shape) if element_count(&shape) != values.len() => {
                        return Err(shape_mismatch(&data_shape, &shape));
                    }
                    Some(shape) => shape,
                    None => data_shape,
                };
                let strides = strides.unwrap_or_else(|| default_strides(&shape));
                let device = device.unwrap_or_default();
                let storage = device.upload(&dtype.encode(&values))?;
                Self::build(storage, dtype, shape, strides, device, requires_grad)
            }
            Some(TensorSource::Storage(storage)) => {
                if shape.is_none() && strides.is_none() {
                    return Err(Error::InvalidSpec(
                        "a storage-backed tensor needs a shape or strides".into(),
                    ));
                }
                let owner = storage_device(&storage)?;
                if let Some(device) = device {
                    if !device.same_device(&owner) {
                        return Err(Error::DeviceMismatch {
                            expected: device.name(),
                            actual: storage.location(),
                        });
                    }
                }
                let shape = shape.unwrap_or_default();
                let strides = strides.unwrap_or_else(|| default_strides(&shape));
                Self::build(storage, dtype, shape, strides, owner, requires_grad)
            }
        }
    }

    /// A `float32` tensor on the default device.
    pub fn from_data(data: TensorData) -> Result<Self> {
        Self::from_spec(TensorSpec::from_data(data))
    }

    /// Parses a JSON-style nested array into a `float32` tensor.
    pub fn parse(src: &str) -> Result<Self> {
        Self::from_data(src.parse()?)
    }

    /// A `float32` tensor of `shape` over row-major `values`.
    pub fn from_vec(values: Vec<f32>, shape: &[usize]) -> Result<Self> {
        if element_count(shape) != values.len() {
            return Err(shape_mismatch(&[values.len()], shape));
        }
        let device = Device::default();
        let storage = device.upload(&DType::Float32.encode(&values))?;
        Self::build(
            storage,
            DType::Float32,
            shape.to_vec(),
            default_strides(shape),
            device,
            false,
        )
    }

    pub fn zeros(shape: &[usize]) -> Result<Self> {
        Self::zeros_on(shape, DType::default(), &Device::default())
    }

    pub fn zeros_on(shape: &[usize], dtype: DType, device: &Device) -> Result<Self> {
        let storage = device.alloc(element_count(shape) * dtype.byte_size())?;
        Self::build(
            storage,
            dtype,
            shape.to_vec(),
            default_strides(shape),
            device.clone(),
            false,
        )
    }

    pub fn ones(shape: &[usize]) -> Result<Self> {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Result<Self> {
        Self::full_on(shape, value, DType::default(), &Device::default())
    }

    /// A tensor of `shape` with every element set to `value`, written by the
    /// `fill` kernel on `device`.
    pub fn full_on(shape: &[usize], value: f32, dtype: DType, device: &Device) -> Result<Self> {
        let size = element_count(shape);
        if size == 0 {
            return Self::zeros_on(shape, dtype, device);
        }
        let params = KernelParams::new()
            .size(size)
            .set("value", f64::from(value));
        let storage = device
            .run_kernel("fill", &KernelConfig::for_dtype(dtype), &params, &[], vec![])?
            .pop()
            .ok_or_else(|| Error::OutputArityMismatch {
                kernel: "fill".into(),
                expected: 1,
                actual: 0,
            })?;
        Self::build(
            storage,
            dtype,
            shape.to_vec(),
            default_strides(shape),
            device.clone(),
            false,
        )
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.inner.strides
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn numel(&self) -> usize {
        element_count(self.shape())
    }

    pub fn is_contiguous(&self) -> bool {
        shape::is_contiguous(self.shape(), self.strides())
    }

    /// Whether both handles are the same view.
    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether both views read the same storage.
    pub fn shares_storage(&self, other: &Self) -> bool {
        self.storage().same_storage(other.storage())
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, AutogradMeta> {
        self.inner.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn requires_grad(&self) -> bool {
        self.meta().requires_grad
    }

    /// Turns gradient tracking on or off. Only leaves may change the flag.
    pub fn set_requires_grad(&self, requires_grad: bool) -> Result<()> {
        let mut meta = self.meta();
        if meta.grad_fn.is_some() {
            return Err(Error::ImmutableGradFlag);
        }
        meta.requires_grad = requires_grad;
        Ok(())
    }

    /// Gradient accumulated by [`Tensor::backward`].
    pub fn grad(&self) -> Option<Tensor> {
        self.meta().grad.clone()
    }

    pub fn zero_grad(&self) {
        self.meta().grad = None;
    }

    /// A view without a backward node.
    pub fn is_leaf(&self) -> bool {
        self.meta().grad_fn.is_none()
    }

    /// A view of `shape` and `strides` over this view's storage, carrying
    /// its `requires_grad` flag but not its history.
    fn view(&self, shape: Vec<usize>, strides: Vec<usize>) -> Result<Self> {
        Self::build(
            self.storage().clone(),
            self.dtype(),
            shape,
            strides,
            self.device().clone(),
            self.requires_grad(),
        )
    }

    /// Reinterprets the storage with a new shape and strides holding the same
    /// number of elements.
    pub fn with_shape(&self, shape: &[usize], strides: &[usize]) -> Result<Self> {
        if element_count(shape) != self.numel() {
            return Err(shape_mismatch(self.shape(), shape));
        }
        self.view(shape.to_vec(), strides.to_vec())
    }

    /// Broadcast view of `target`.
    ///
    /// Dimensions align from the right. A size-1 dimension or a new leading
    /// dimension is repeated through stride 0; `-1` keeps a dimension's
    /// current size.
    pub fn expand(&self, target: &[isize]) -> Result<Self> {
        let target_shape = || {
            target
                .iter()
                .map(|&d| usize::try_from(d).unwrap_or_default())
                .collect::<Vec<_>>()
        };
        let rank = self.shape().len();
        if target.len() < rank {
            return Err(shape_mismatch(self.shape(), &target_shape()));
        }
        let lead = target.len() - rank;
        let mut shape = Vec::with_capacity(target.len());
        let mut strides = Vec::with_capacity(target.len());
        for (axis, &want) in target.iter().enumerate() {
            let (dim, stride) = match axis.checked_sub(lead) {
                None => match usize::try_from(want) {
                    Ok(want) => (want, 0),
                    Err(_) => return Err(shape_mismatch(self.shape(), &target_shape())),
                },
                Some(src) => {
                    let (cur, stride) = (self.shape()[src], self.strides()[src]);
                    match usize::try_from(want) {
                        Err(_) if want == -1 => (cur, stride),
                        Ok(want) if want == cur => (cur, stride),
                        Ok(want) if cur == 1 => (want, 0),
                        _ => return Err(shape_mismatch(self.shape(), &target_shape())),
                    }
                }
            };
            shape.push(dim);
            strides.push(stride);
        }
        self.view(shape, strides)
    }

    /// The same values without autograd history. Untracked leaves are
    /// returned as-is.
    pub fn detach(&self) -> Self {
        {
            let meta = self.meta();
            if !meta.requires_grad && meta.grad_fn.is_none() {
                return self.clone();
            }
        }
        self.alias()
    }

    /// A new untracked handle on the same view.
    pub(crate) fn alias(&self) -> Self {
        Self {
            inner: Arc::new(TensorInner {
                storage: self.storage().clone(),
                dtype: self.dtype(),
                shape: self.shape().to_vec(),
                strides: self.strides().to_vec(),
                device: self.device().clone(),
                meta: Mutex::new(AutogradMeta::default()),
            }),
        }
    }

    /// The same values in new row-major storage, even when the view is
    /// already contiguous.
    pub(crate) fn deep_copy(&self) -> Result<Self> {
        if !self.is_contiguous() {
            return self.copy_contiguous();
        }
        let flat = self.alias().with_shape(&[self.numel()], &[1])?;
        flat.copy_contiguous()?
            .with_shape(self.shape(), &default_strides(self.shape()))
    }

    /// Gathers a strided view into new row-major storage.
    pub(crate) fn copy_contiguous(&self) -> Result<Self> {
        let rank = self.shape().len();
        if rank > 4 {
            return Err(Error::InvalidSpec(format!(
                "cannot materialise a rank {rank} view, the copy kernel handles rank 4 or less"
            )));
        }
        if self.numel() == 0 {
            return Self::zeros_on(self.shape(), self.dtype(), self.device());
        }
        let pad = 4 - rank;
        let mut params = KernelParams::new().size(self.numel());
        for axis in 0..4_usize {
            #[allow(clippy::cast_precision_loss)]
            let (dim, stride) = match axis.checked_sub(pad) {
                Some(src) => (self.shape()[src] as f64, self.strides()[src] as f64),
                None => (1.0, 0.0),
            };
            params = params
                .set(&format!("shape{axis}"), dim)
                .set(&format!("stride{axis}"), stride);
        }
        self.run_single(
            "copy",
            &KernelConfig::for_dtype(self.dtype()),
            &params,
            self.shape().to_vec(),
            &[],
        )
    }

    /// Runs kernel `name` with this tensor as the first input, followed by
    /// `additional_inputs`.
    ///
    /// One tensor is returned per entry of `output_shapes`, with that shape,
    /// row-major strides and this tensor's dtype and device.
    pub fn run_kernel(
        &self,
        name: &str,
        config: &KernelConfig,
        params: &KernelParams,
        output_shapes: &[Vec<usize>],
        additional_inputs: &[&Tensor],
    ) -> Result<Vec<Tensor>> {
        let mut inputs = vec![(self.storage(), self.dtype())];
        inputs.extend(additional_inputs.iter().map(|t| (t.storage(), t.dtype())));
        trace!("{name} over {} input(s) on {}", inputs.len(), self.device().name());
        let outputs = self
            .device()
            .run_kernel(name, config, params, &inputs, vec![])?;
        if outputs.len() != output_shapes.len() {
            return Err(Error::OutputArityMismatch {
                kernel: name.to_owned(),
                expected: output_shapes.len(),
                actual: outputs.len(),
            });
        }
        outputs
            .into_iter()
            .zip(output_shapes)
            .map(|(storage, shape)| {
                Self::build(
                    storage,
                    self.dtype(),
                    shape.clone(),
                    default_strides(shape),
                    self.device().clone(),
                    false,
                )
            })
            .collect()
    }

    /// [`Tensor::run_kernel`] for kernels with exactly one output.
    pub(crate) fn run_single(
        &self,
        name: &str,
        config: &KernelConfig,
        params: &KernelParams,
        shape: Vec<usize>,
        additional_inputs: &[&Tensor],
    ) -> Result<Tensor> {
        self.run_kernel(name, config, params, &[shape], additional_inputs)?
            .pop()
            .ok_or_else(|| Error::OutputArityMismatch {
                kernel: name.to_owned(),
                expected: 1,
                actual: 0,
            })
    }

    /// Runs in-place kernel `name`, whose single output is this tensor's own
    /// storage. Inputs are `additional_inputs` only.
    ///
    /// Fails with [`Error::GradientConflict`] when this tensor requires a
    /// gradient: other views of the storage may be recorded in a graph.
    /// Inputs sharing this tensor's storage are copied first, as a buffer
    /// cannot be bound for reading and writing in one dispatch.
    pub fn run_kernel_inplace(
        &self,
        name: &str,
        config: &KernelConfig,
        params: &KernelParams,
        additional_inputs: &[&Tensor],
    ) -> Result<Tensor> {
        if self.requires_grad() {
            return Err(Error::GradientConflict);
        }
        let sources = additional_inputs
            .iter()
            .map(|&t| {
                if t.shares_storage(self) {
                    trace!("{name}: copying an input that aliases the output");
                    t.deep_copy()
                } else {
                    Ok(t.clone())
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let inputs: Vec<_> = sources.iter().map(|t| (t.storage(), t.dtype())).collect();
        let outputs = self.device().run_kernel(
            name,
            config,
            params,
            &inputs,
            vec![Some(self.storage().clone())],
        )?;
        if outputs.len() != 1 {
            return Err(Error::OutputArityMismatch {
                kernel: name.to_owned(),
                expected: 1,
                actual: outputs.len(),
            });
        }
        Ok(self.clone())
    }

    /// Reads the values back to the host in logical row-major order,
    /// following the strides.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let count = self.numel();
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.device().read(self.storage())?;
        let flat = self.dtype().decode(&bytes, bytes.len() / self.dtype().byte_size());
        if self.is_contiguous() {
            return Ok(flat[..count].to_vec());
        }
        let (shape, strides) = (self.shape(), self.strides());
        let mut out = Vec::with_capacity(count);
        let mut index = vec![0; shape.len()];
        loop {
            out.push(flat[shape::offset_of(&index, strides)]);
            if !shape::next_index(&mut index, shape) {
                break;
            }
        }
        Ok(out)
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.numel() != 1 {
            return Err(shape_mismatch(self.shape(), &[]));
        }
        Ok(self.to_vec()?[0])
    }

    /// Copies the values into a new tensor on `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        if device.same_device(self.device()) {
            return Ok(self.clone());
        }
        let values = self.to_vec()?;
        let storage = device.upload(&self.dtype().encode(&values))?;
        Self::build(
            storage,
            self.dtype(),
            self.shape().to_vec(),
            default_strides(self.shape()),
            device.clone(),
            self.requires_grad(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta();
        let flag = if meta.grad_fn.is_some() {
            ", grad_fn"
        } else if meta.requires_grad {
            ", requires_grad=true"
        } else {
            ""
        };
        write!(f, "tensor({:?}, {}{flag})", self.shape(), self.dtype())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("strides", &self.strides())
            .field("dtype", &self.dtype())
            .field("device", self.device())
            .field("requires_grad", &self.requires_grad())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_data_flattens_row_major() {
        let (shape, values) = tensor!(@data [[1, 2, 3], [4, 5, 6]]).flatten().unwrap();
        assert_eq!(shape, vec![2, 3]);
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(TensorData::List(vec![]).flatten().unwrap().0, vec![0]);
    }

    #[test]
    fn ragged_data_is_rejected() {
        let err = tensor!([[1.0, 2.0], [3.0]]).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn parses_nested_arrays() {
        let data: TensorData = " [[1, -2.5], [3e1, 4]] ".parse().unwrap();
        assert_eq!(
            data.flatten().unwrap(),
            (vec![2, 2], vec![1.0, -2.5, 30.0, 4.0])
        );
        assert!("[1, 2".parse::<TensorData>().is_err());
        assert!("[1, 2] x".parse::<TensorData>().is_err());
        assert!("[1,, 2]".parse::<TensorData>().is_err());
    }

    #[test]
    fn storage_spec_needs_shape_or_strides() {
        let storage = Device::cpu().alloc(16).unwrap();
        let err = Tensor::from_spec(TensorSpec::from_storage(storage.clone())).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));

        let t = Tensor::from_spec(TensorSpec::from_storage(storage.clone()).with_shape([2, 2]))
            .unwrap();
        assert_eq!(t.strides(), &[2, 1]);

        let scalar = Tensor::from_spec(TensorSpec::from_storage(storage).with_strides(Vec::new()))
            .unwrap();
        assert!(scalar.shape().is_empty());
    }

    #[test]
    fn view_must_fit_storage() {
        let storage = Device::cpu().alloc(12).unwrap();
        let err = Tensor::from_spec(TensorSpec::from_storage(storage).with_shape([2, 2]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn detach_of_untracked_leaf_is_the_same_handle() {
        let t = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        assert!(t.detach().same_handle(&t));
        t.set_requires_grad(true).unwrap();
        let d = t.detach();
        assert!(!d.same_handle(&t));
        assert!(d.shares_storage(&t));
        assert!(!d.requires_grad());
    }

    #[test]
    fn expand_keeps_and_broadcasts_dims() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[1, 3]).unwrap();
        let e = t.expand(&[2, -1]).unwrap();
        assert_eq!(e.shape(), &[2, 3]);
        assert_eq!(e.strides(), &[0, 1]);
        let lead = t.expand(&[4, 1, 3]).unwrap();
        assert_eq!(lead.strides(), &[0, 3, 1]);
        assert!(matches!(
            t.expand(&[2, 4]).unwrap_err(),
            Error::ShapeMismatch { .. }
        ));
        assert!(t.expand(&[3]).is_err());
    }

    #[test]
    fn display_reports_autograd_state() {
        let t = Tensor::zeros(&[2, 3]).unwrap();
        assert_eq!(t.to_string(), "tensor([2, 3], float32)");
        t.set_requires_grad(true).unwrap();
        assert_eq!(t.to_string(), "tensor([2, 3], float32, requires_grad=true)");
    }

    #[test]
    fn item_requires_one_element() {
        assert_eq!(Tensor::full(&[1], 4.5).unwrap().item().unwrap(), 4.5);
        assert!(Tensor::zeros(&[2]).unwrap().item().is_err());
    }
}
