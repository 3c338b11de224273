//! Kernel specifications and the backend-independent half of a compiled kernel.
//!
//! A [`KernelSpec`] is immutable metadata describing one compute kernel: its
//! configuration options, call parameters, buffers, launch geometry, a WGSL
//! body template and the host routine the CPU backend runs instead. Backends
//! compile a spec together with a resolved [`KernelConfig`] into an executable
//! kernel; [`KernelBase`] holds everything both backends share.
//!
//! ## Launch geometry
//!
//! - `workgroup_size` is an expression over numeric config values, evaluated
//!   once at compile time.
//! - `workgroup_count` holds one to three expressions over config values and
//!   call parameters, evaluated on every run.
//! - Every output declares its element count as an expression as well.

pub mod cache;
pub mod expr;
pub mod registry;
pub mod shader;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ops::table::{BinaryOp, ReductionOp, UnaryOp};
use expr::Expr;

/// A value a configuration option can take.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
}

impl ConfigValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            Self::Str(_) => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<DType> for ConfigValue {
    fn from(value: DType) -> Self {
        Self::Str(value.as_str().to_owned())
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Compile-time options passed when requesting a kernel.
///
/// Keys are kept sorted so the canonical cache key does not depend on
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelConfig(BTreeMap<String, ConfigValue>);

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config carrying only a dtype, the common case for tensor ops.
    pub fn for_dtype(dtype: DType) -> Self {
        Self::new().with("dtype", dtype)
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<ConfigValue>) -> Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.0.iter()
    }

    /// Cache key of the form `name(k1=v1,k2=v2)`.
    pub fn canonical_key(&self, name: &str) -> String {
        let body: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{name}({})", body.join(","))
    }
}

/// Runtime parameters of one kernel invocation.
#[derive(Debug, Clone, Default)]
pub struct KernelParams(HashMap<String, f64>);

impl KernelParams {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn size(self, size: usize) -> Self {
        self.set("size", size as f64)
    }

    #[must_use]
    pub fn set(mut self, name: &str, value: f64) -> Self {
        self.0.insert(name.to_owned(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }
}

/// A configuration option: its default and, when non-empty, the allowed set.
#[derive(Debug, Clone)]
pub struct ConfigSpec {
    pub name: String,
    pub default: ConfigValue,
    pub allowed: Vec<ConfigValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Packed as `u32`.
    Int,
    /// Packed as `f32`.
    Float,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone)]
pub struct BufferSpec {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    /// Element count expression.
    pub size: String,
}

/// Host routine executed by the CPU backend.
#[derive(Clone, Copy)]
pub enum HostBody {
    Unary(&'static UnaryOp),
    UnaryGrad(&'static UnaryOp),
    Binary(&'static BinaryOp),
    BinaryGrad(&'static BinaryOp),
    Reduce(&'static ReductionOp),
    ReduceGrad(&'static ReductionOp),
    Matmul,
    /// Gathers a strided view of rank four or less into contiguous order.
    Copy,
    Fill,
}

impl fmt::Debug for HostBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary(op) => write!(f, "Unary({})", op.name),
            Self::UnaryGrad(op) => write!(f, "UnaryGrad({})", op.name),
            Self::Binary(op) => write!(f, "Binary({})", op.name),
            Self::BinaryGrad(op) => write!(f, "BinaryGrad({})", op.name),
            Self::Reduce(op) => write!(f, "Reduce({})", op.name),
            Self::ReduceGrad(op) => write!(f, "ReduceGrad({})", op.name),
            Self::Matmul => f.write_str("Matmul"),
            Self::Copy => f.write_str("Copy"),
            Self::Fill => f.write_str("Fill"),
        }
    }
}

/// Immutable description of one compute kernel.
#[derive(Debug, Clone)]
pub struct KernelSpec {
    pub name: String,
    pub config: Vec<ConfigSpec>,
    pub parameters: Vec<ParamSpec>,
    pub inputs: Vec<BufferSpec>,
    pub outputs: Vec<OutputSpec>,
    pub workgroup_size: String,
    pub workgroup_count: Vec<String>,
    /// Module-scope WGSL declarations emitted ahead of the entry point.
    pub shader_prelude: String,
    /// WGSL statements forming the entry point body. `{{key}}` placeholders
    /// are replaced with resolved config values.
    pub shader: String,
    pub host: HostBody,
    /// The first output is also read: it is the tensor being updated in place.
    pub inplace: bool,
}

impl KernelSpec {
    /// Resolves `config` against the declared options.
    ///
    /// Missing options take their defaults; undeclared keys and values outside
    /// an option's allowed set are rejected.
    pub fn resolve_config(&self, config: &KernelConfig) -> Result<KernelConfig> {
        let invalid = |reason: String| Error::InvalidKernelConfig {
            kernel: self.name.clone(),
            reason,
        };
        if let Some((key, _)) = config
            .iter()
            .find(|(key, _)| !self.config.iter().any(|c| &c.name == *key))
        {
            return Err(invalid(format!("undeclared option \"{key}\"")));
        }
        let mut resolved = KernelConfig::new();
        for option in &self.config {
            let value = config.get(&option.name).unwrap_or(&option.default);
            if !option.allowed.is_empty() && !option.allowed.contains(value) {
                return Err(invalid(format!(
                    "\"{value}\" is not an allowed value for \"{}\"",
                    option.name
                )));
            }
            resolved = resolved.with(&option.name, value.clone());
        }
        Ok(resolved)
    }
}

/// Workgroups a single dispatch may launch along one dimension (the WebGPU
/// default limit).
pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;

/// State shared by the CPU and GPU compiled kernels.
#[derive(Debug)]
pub struct KernelBase {
    pub spec: Arc<KernelSpec>,
    pub config: KernelConfig,
    pub key: String,
    pub dtype: DType,
    pub workgroup_size: u32,
    output_sizes: Vec<Expr>,
    workgroup_count: Vec<Expr>,
}

impl KernelBase {
    /// Resolves the config and parses every launch expression of `spec`.
    pub fn new(spec: Arc<KernelSpec>, config: &KernelConfig) -> Result<Self> {
        let config = spec.resolve_config(config)?;
        let key = config.canonical_key(&spec.name);
        let dtype = match config.get("dtype") {
            Some(ConfigValue::Str(name)) => name.parse()?,
            Some(other) => {
                return Err(Error::InvalidKernelConfig {
                    kernel: spec.name.clone(),
                    reason: format!("dtype must be a name, got {other}"),
                });
            }
            None => DType::default(),
        };
        let output_sizes = spec
            .outputs
            .iter()
            .map(|o| Expr::parse(&o.size))
            .collect::<Result<Vec<_>>>()?;
        if spec.workgroup_count.is_empty() || spec.workgroup_count.len() > 3 {
            return Err(Error::InvalidSpec(format!(
                "kernel \"{}\" needs 1 to 3 workgroup count expressions",
                spec.name
            )));
        }
        let workgroup_count = spec
            .workgroup_count
            .iter()
            .map(|e| Expr::parse(e))
            .collect::<Result<Vec<_>>>()?;
        let numeric_config = |name: &str| config.get(name).and_then(ConfigValue::as_number);
        let workgroup_size = Expr::parse(&spec.workgroup_size)?
            .eval(&numeric_config)
            .map_err(|name| Error::MissingParameter {
                kernel: spec.name.clone(),
                name,
            })?;
        Ok(Self {
            workgroup_size: to_count(workgroup_size),
            spec,
            config,
            key,
            dtype,
            output_sizes,
            workgroup_count,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Checks that every declared call parameter was supplied.
    pub fn check_parameters(&self, params: &KernelParams) -> Result<()> {
        match self
            .spec
            .parameters
            .iter()
            .find(|p| params.get(&p.name).is_none())
        {
            Some(missing) => Err(Error::MissingParameter {
                kernel: self.spec.name.clone(),
                name: missing.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Checks that a buffer was supplied for every declared input.
    pub fn check_inputs<B>(&self, inputs: &[B]) -> Result<()> {
        let arity = self.spec.inputs.len();
        match self.spec.inputs.get(inputs.len()) {
            Some(missing) => Err(Error::MissingInputBuffer {
                index: inputs.len(),
                arity,
                name: missing.name.clone(),
                kernel: self.spec.name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn eval(&self, expr: &Expr, params: &KernelParams) -> Result<f64> {
        let lookup = |name: &str| {
            params
                .get(name)
                .or_else(|| self.config.get(name).and_then(ConfigValue::as_number))
        };
        expr.eval(&lookup).map_err(|name| Error::MissingParameter {
            kernel: self.spec.name.clone(),
            name,
        })
    }

    /// Element count of every output for this invocation.
    pub fn output_element_counts(&self, params: &KernelParams) -> Result<Vec<usize>> {
        self.output_sizes
            .iter()
            .map(|e| self.eval(e, params).map(|v| to_count(v) as usize))
            .collect()
    }

    /// Workgroup counts in x, y and z; undeclared dimensions are 1.
    ///
    /// A one-dimensional count above [`MAX_WORKGROUPS_PER_DIMENSION`] is
    /// folded into y and then z. Generated shaders recover the linear
    /// invocation index as `global_index`.
    pub fn workgroup_counts(&self, params: &KernelParams) -> Result<[u32; 3]> {
        let mut counts = [1; 3];
        for (slot, expr) in counts.iter_mut().zip(&self.workgroup_count) {
            *slot = to_count(self.eval(expr, params)?);
        }
        let [x, y, z] = counts;
        if x <= MAX_WORKGROUPS_PER_DIMENSION || y != 1 || z != 1 {
            return Ok(counts);
        }
        let y = x.div_ceil(MAX_WORKGROUPS_PER_DIMENSION);
        if y <= MAX_WORKGROUPS_PER_DIMENSION {
            return Ok([MAX_WORKGROUPS_PER_DIMENSION, y, 1]);
        }
        let z = y.div_ceil(MAX_WORKGROUPS_PER_DIMENSION);
        if z > MAX_WORKGROUPS_PER_DIMENSION {
            return Err(Error::InvalidSpec(format!(
                "kernel \"{}\" needs {x} workgroups, more than one dispatch allows",
                self.spec.name
            )));
        }
        Ok([MAX_WORKGROUPS_PER_DIMENSION, MAX_WORKGROUPS_PER_DIMENSION, z])
    }

    /// Parameter words in binding order: integers as `u32` first, then floats
    /// as `f32`, each group in declaration order.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn pack_parameters(&self, params: &KernelParams) -> Result<Vec<u32>> {
        self.check_parameters(params)?;
        let value = |p: &ParamSpec| params.get(&p.name).unwrap_or_default();
        let mut words: Vec<u32> = self
            .ordered_parameters()
            .map(|p| match p.kind {
                ParamKind::Int => value(p) as u32,
                ParamKind::Float => (value(p) as f32).to_bits(),
            })
            .collect();
        if words.is_empty() {
            words.push(0);
        }
        Ok(words)
    }

    /// Parameters in packing order.
    pub fn ordered_parameters(&self) -> impl Iterator<Item = &ParamSpec> {
        let params = &self.spec.parameters;
        params
            .iter()
            .filter(|p| p.kind == ParamKind::Int)
            .chain(params.iter().filter(|p| p.kind == ParamKind::Float))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_count(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.ceil() as u32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> Arc<KernelSpec> {
        registry::lookup("mm").unwrap()
    }

    #[test]
    fn config_defaults_fill_gaps() {
        let resolved = spec().resolve_config(&KernelConfig::new()).unwrap();
        assert_eq!(resolved.get("dtype"), Some(&ConfigValue::from("float32")));
        assert!(resolved.get("workgroupSize").is_some());
    }

    #[test]
    fn undeclared_and_disallowed_options_are_rejected() {
        let bad_key = KernelConfig::new().with("colour", "red");
        assert!(matches!(
            spec().resolve_config(&bad_key),
            Err(Error::InvalidKernelConfig { .. })
        ));
        let bad_value = KernelConfig::for_dtype(DType::Float32).with("workgroupSize", 7_i64);
        assert!(matches!(
            spec().resolve_config(&bad_value),
            Err(Error::InvalidKernelConfig { .. })
        ));
    }

    #[test]
    fn canonical_key_is_order_independent() {
        let a = KernelConfig::new().with("dtype", "int32").with("workgroupSize", 64_i64);
        let b = KernelConfig::new().with("workgroupSize", 64_i64).with("dtype", "int32");
        assert_eq!(a.canonical_key("add"), "add(dtype=int32,workgroupSize=64)");
        assert_eq!(a.canonical_key("add"), b.canonical_key("add"));
    }

    #[test]
    fn parameters_pack_ints_before_floats() {
        let base = KernelBase::new(spec(), &KernelConfig::new()).unwrap();
        let params = KernelParams::new()
            .set("alpha", 2.0)
            .set("resultRows", 3.0)
            .set("resultCols", 4.0)
            .set("innerDim", 5.0)
            .set("aRowStride", 5.0)
            .set("aColStride", 1.0)
            .set("bRowStride", 4.0)
            .set("bColStride", 1.0);
        let words = base.pack_parameters(&params).unwrap();
        assert_eq!(&words[..3], &[3, 4, 5]);
        assert_eq!(words.last().copied(), Some(2.0_f32.to_bits()));
        assert_eq!(base.output_element_counts(&params).unwrap(), vec![12]);
    }

    #[test]
    fn missing_parameter_is_named() {
        let base = KernelBase::new(spec(), &KernelConfig::new()).unwrap();
        let err = base
            .pack_parameters(&KernelParams::new().set("alpha", 1.0))
            .unwrap_err();
        assert!(matches!(err, Error::MissingParameter { .. }));
    }

    #[test]
    fn missing_inputs_report_slot_and_arity() {
        let base = KernelBase::new(spec(), &KernelConfig::new()).unwrap();
        match base.check_inputs(&[()]) {
            Err(Error::MissingInputBuffer { index, arity, name, .. }) => {
                assert_eq!((index, arity, name.as_str()), (1, 2, "b"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(base.check_inputs(&[(), ()]).is_ok());
    }
}
