//! Kernel specification registry.
//!
//! Built lazily from the operator table: every unary and binary operator gets
//! an out-of-place kernel `<op>`, an in-place kernel `<op>_` and a gradient
//! kernel `<op>Grad`; every reduction gets `<op>` and, when differentiable,
//! `<op>Grad`. The artisanal kernels `mm`, `copy` and `fill` complete the set.
//! Further specs can be added at runtime with [`register_kernel`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use lazy_static::lazy_static;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernel::{
    BufferSpec, ConfigSpec, ConfigValue, HostBody, KernelSpec, OutputSpec, ParamKind, ParamSpec,
};
use crate::ops::table::{self, BinaryOp, ReductionOp, UnaryOp};

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, Arc<KernelSpec>>> = RwLock::new(builtin_specs());
}

/// Looks up the spec registered under `name`.
pub fn lookup(name: &str) -> Result<Arc<KernelSpec>> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
        .ok_or_else(|| Error::UnknownKernel(name.to_owned()))
}

/// Adds an externally supplied spec. Names must be unique.
pub fn register_kernel(spec: KernelSpec) -> Result<()> {
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    if registry.contains_key(&spec.name) {
        return Err(Error::InvalidSpec(format!(
            "a kernel named \"{}\" is already registered",
            spec.name
        )));
    }
    registry.insert(spec.name.clone(), Arc::new(spec));
    Ok(())
}

/// Names of every registered kernel, sorted.
pub fn kernel_names() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    names.sort_unstable();
    names
}

fn dtype_option() -> ConfigSpec {
    ConfigSpec {
        name: "dtype".into(),
        default: DType::Float32.into(),
        allowed: [DType::Float32, DType::Int32, DType::Uint8]
            .into_iter()
            .map(ConfigValue::from)
            .collect(),
    }
}

fn workgroup_option(default: i64) -> ConfigSpec {
    ConfigSpec {
        name: "workgroupSize".into(),
        default: ConfigValue::Int(default),
        allowed: [32, 64, 128, 256].into_iter().map(ConfigValue::Int).collect(),
    }
}

fn int(name: &str) -> ParamSpec {
    ParamSpec {
        name: name.into(),
        kind: ParamKind::Int,
    }
}

fn float(name: &str) -> ParamSpec {
    ParamSpec {
        name: name.into(),
        kind: ParamKind::Float,
    }
}

fn buffers(names: &[&str]) -> Vec<BufferSpec> {
    names
        .iter()
        .map(|n| BufferSpec { name: (*n).into() })
        .collect()
}

fn outputs(names: &[&str], size: &str) -> Vec<OutputSpec> {
    names
        .iter()
        .map(|n| OutputSpec {
            name: (*n).into(),
            size: size.into(),
        })
        .collect()
}

const GUARD: &str = "let i = global_index;\nif (i >= parameters.size) {\n    return;\n}\n";

/// Spec skeleton shared by every one-thread-per-element kernel.
fn elementwise(
    name: String,
    parameters: Vec<ParamSpec>,
    inputs: &[&str],
    output_names: &[&str],
    body: String,
    host: HostBody,
    inplace: bool,
) -> KernelSpec {
    KernelSpec {
        name,
        config: vec![dtype_option(), workgroup_option(256)],
        parameters,
        inputs: buffers(inputs),
        outputs: outputs(output_names, "size"),
        workgroup_size: "workgroupSize".into(),
        workgroup_count: vec!["ceil(size / workgroupSize)".into()],
        shader_prelude: String::new(),
        shader: format!("{GUARD}{body}"),
        host,
        inplace,
    }
}

fn unary_specs(op: &'static UnaryOp) -> [KernelSpec; 3] {
    let forward = |src: &str| {
        format!(
            "let x = f32({src}[i]);\noutput[i] = {{{{shaderType}}}}({});\n",
            op.shader
        )
    };
    [
        elementwise(
            op.name.into(),
            vec![int("size")],
            &["input"],
            &["output"],
            forward("input"),
            HostBody::Unary(op),
            false,
        ),
        elementwise(
            format!("{}_", op.name),
            vec![int("size")],
            &[],
            &["output"],
            forward("output"),
            HostBody::Unary(op),
            true,
        ),
        elementwise(
            format!("{}Grad", op.name),
            vec![int("size")],
            &["input", "outputGrad"],
            &["inputGrad"],
            format!(
                "let x = f32(input[i]);\nlet g = f32(outputGrad[i]);\ninputGrad[i] = {{{{shaderType}}}}({});\n",
                op.grad_shader
            ),
            HostBody::UnaryGrad(op),
            false,
        ),
    ]
}

fn binary_specs(op: &'static BinaryOp) -> [KernelSpec; 3] {
    let forward = |src: &str| {
        format!(
            "let x = f32({src}[i]);\nlet y = f32(other[i]) * parameters.alpha;\noutput[i] = {{{{shaderType}}}}({});\n",
            op.shader
        )
    };
    let params = || vec![int("size"), float("alpha")];
    [
        elementwise(
            op.name.into(),
            params(),
            &["input", "other"],
            &["output"],
            forward("input"),
            HostBody::Binary(op),
            false,
        ),
        elementwise(
            format!("{}_", op.name),
            params(),
            &["other"],
            &["output"],
            forward("output"),
            HostBody::Binary(op),
            true,
        ),
        elementwise(
            format!("{}Grad", op.name),
            params(),
            &["input", "other", "outputGrad"],
            &["inputGrad", "otherGrad"],
            format!(
                "let x = f32(input[i]);\nlet y = f32(other[i]) * parameters.alpha;\nlet g = f32(outputGrad[i]);\n\
                 inputGrad[i] = {{{{shaderType}}}}({});\n\
                 otherGrad[i] = {{{{shaderType}}}}(parameters.alpha * ({}));\n",
                op.input_grad_shader, op.other_grad_shader
            ),
            HostBody::BinaryGrad(op),
            false,
        ),
    ]
}

fn reduction_specs(op: &'static ReductionOp) -> Vec<KernelSpec> {
    let body = format!(
        "let tid = local_id.x;\n\
         var acc: f32 = {init};\n\
         var i = tid;\n\
         loop {{\n    if (i >= parameters.size) {{\n        break;\n    }}\n    let x = f32(input[i]);\n    acc = {step};\n    i = i + {{{{workgroupSize}}}}u;\n}}\n\
         partials[tid] = acc;\n\
         workgroupBarrier();\n\
         var stride = {{{{workgroupSize}}}}u / 2u;\n\
         loop {{\n    if (stride == 0u) {{\n        break;\n    }}\n    if (tid < stride) {{\n        let lhs = partials[tid];\n        let rhs = partials[tid + stride];\n        partials[tid] = {combine};\n    }}\n    workgroupBarrier();\n    stride = stride / 2u;\n}}\n\
         if (tid == 0u) {{\n    let total = partials[0];\n    let n = f32(parameters.size);\n    output[0] = {{{{shaderType}}}}({finish});\n}}\n",
        init = op.shader_init,
        step = op.shader_step,
        combine = op.shader_combine,
        finish = op.shader_finish,
    );
    let mut specs = vec![KernelSpec {
        name: op.name.into(),
        config: vec![dtype_option(), workgroup_option(64)],
        parameters: vec![int("size")],
        inputs: buffers(&["input"]),
        outputs: outputs(&["output"], "1"),
        workgroup_size: "workgroupSize".into(),
        workgroup_count: vec!["1".into()],
        shader_prelude: "var<workgroup> partials: array<f32, {{workgroupSize}}>;\n".into(),
        shader: body,
        host: HostBody::Reduce(op),
        inplace: false,
    }];
    if let Some(grad) = op.grad_shader {
        specs.push(elementwise(
            format!("{}Grad", op.name),
            vec![int("size")],
            &["input", "output", "outputGrad"],
            &["inputGrad"],
            format!(
                "let x = f32(input[i]);\nlet out = f32(output[0]);\nlet g = f32(outputGrad[0]);\nlet n = f32(parameters.size);\n\
                 inputGrad[i] = {{{{shaderType}}}}({grad});\n"
            ),
            HostBody::ReduceGrad(op),
            false,
        ));
    }
    specs
}

fn mm_spec() -> KernelSpec {
    KernelSpec {
        name: "mm".into(),
        config: vec![dtype_option(), workgroup_option(64)],
        parameters: vec![
            int("resultRows"),
            int("resultCols"),
            int("innerDim"),
            float("alpha"),
            int("aRowStride"),
            int("aColStride"),
            int("bRowStride"),
            int("bColStride"),
        ],
        inputs: buffers(&["a", "b"]),
        outputs: outputs(&["output"], "resultRows * resultCols"),
        workgroup_size: "workgroupSize".into(),
        workgroup_count: vec!["ceil(resultRows * resultCols / workgroupSize)".into()],
        shader: "let idx = global_index;\n\
                 if (idx >= parameters.resultRows * parameters.resultCols) {\n    return;\n}\n\
                 let row = idx / parameters.resultCols;\n\
                 let col = idx % parameters.resultCols;\n\
                 var acc: f32 = 0.0;\n\
                 for (var k = 0u; k < parameters.innerDim; k = k + 1u) {\n    \
                     let lhs = f32(a[row * parameters.aRowStride + k * parameters.aColStride]);\n    \
                     let rhs = f32(b[k * parameters.bRowStride + col * parameters.bColStride]);\n    \
                     acc = acc + lhs * rhs;\n}\n\
                 output[idx] = {{shaderType}}(acc * parameters.alpha);\n"
            .into(),
        shader_prelude: String::new(),
        host: HostBody::Matmul,
        inplace: false,
    }
}

fn copy_spec() -> KernelSpec {
    let mut parameters = vec![int("size")];
    parameters.extend((0..4).map(|d| int(&format!("shape{d}"))));
    parameters.extend((0..4).map(|d| int(&format!("stride{d}"))));
    elementwise(
        "copy".into(),
        parameters,
        &["input"],
        &["output"],
        "var rem = i;\n\
         let i3 = rem % parameters.shape3;\nrem = rem / parameters.shape3;\n\
         let i2 = rem % parameters.shape2;\nrem = rem / parameters.shape2;\n\
         let i1 = rem % parameters.shape1;\nrem = rem / parameters.shape1;\n\
         let src = rem * parameters.stride0 + i1 * parameters.stride1 + i2 * parameters.stride2 + i3 * parameters.stride3;\n\
         output[i] = input[src];\n"
            .into(),
        HostBody::Copy,
        false,
    )
}

fn fill_spec() -> KernelSpec {
    elementwise(
        "fill".into(),
        vec![int("size"), float("value")],
        &[],
        &["output"],
        "output[i] = {{shaderType}}(parameters.value);\n".into(),
        HostBody::Fill,
        false,
    )
}

/// Every kernel spec derived from the operator table plus the artisanal ones.
pub fn builtin_specs() -> HashMap<String, Arc<KernelSpec>> {
    let mut specs: Vec<KernelSpec> = Vec::new();
    for &op in table::UNARY_OPS {
        specs.extend(unary_specs(op));
    }
    for &op in table::BINARY_OPS {
        specs.extend(binary_specs(op));
    }
    for &op in table::REDUCTION_OPS {
        specs.extend(reduction_specs(op));
    }
    specs.extend([mm_spec(), copy_spec(), fill_spec()]);
    specs
        .into_iter()
        .map(|spec| (spec.name.clone(), Arc::new(spec)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operator_has_its_kernels() {
        for name in ["abs", "abs_", "absGrad", "add", "add_", "addGrad", "sum", "sumGrad", "mm"] {
            assert!(lookup(name).is_ok(), "{name}");
        }
        assert!(lookup("count_nonzero").is_ok());
        assert!(lookup("count_nonzeroGrad").is_err());
    }

    #[test]
    fn unknown_kernel_is_an_error() {
        assert!(matches!(lookup("conv2d"), Err(Error::UnknownKernel(name)) if name == "conv2d"));
    }

    #[test]
    fn inplace_kernels_read_their_output() {
        let spec = lookup("sub_").unwrap();
        assert!(spec.inplace);
        assert_eq!(spec.inputs.len(), 1);
        assert_eq!(spec.inputs[0].name, "other");
        assert!(matches!(spec.host, HostBody::Binary(op) if op.name == "sub"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut spec = (*lookup("fill").unwrap()).clone();
        spec.name = "registry_test_fill".into();
        register_kernel(spec.clone()).unwrap();
        assert!(kernel_names().contains(&"registry_test_fill".to_owned()));
        assert!(matches!(register_kernel(spec), Err(Error::InvalidSpec(_))));
    }
}
