//! WGSL generation for compiled kernels.

use crate::error::{Error, Result};
use crate::kernel::{KernelBase, ParamKind};

/// Builds the complete WGSL module for a kernel: the `Parameters` struct in
/// packing order, one binding per input (read), per output (read-write) and
/// a trailing parameter binding, then the entry point around the spec body.
pub fn generate(base: &KernelBase) -> Result<String> {
    let spec = &base.spec;
    let elem = base
        .dtype
        .shader_type()
        .ok_or(Error::UnsupportedDtype {
            dtype: base.dtype,
            backend: "wgpu",
        })?;

    let mut src = String::from("struct Parameters {\n");
    let mut any_param = false;
    for param in base.ordered_parameters() {
        let ty = match param.kind {
            ParamKind::Int => "u32",
            ParamKind::Float => "f32",
        };
        src.push_str(&format!("    {}: {ty},\n", param.name));
        any_param = true;
    }
    if !any_param {
        src.push_str("    unused: u32,\n");
    }
    src.push_str("}\n\n");

    let storage = spec
        .inputs
        .iter()
        .map(|input| ("read", &input.name))
        .chain(spec.outputs.iter().map(|output| ("read_write", &output.name)));
    let mut binding = 0;
    for (access, name) in storage {
        src.push_str(&format!(
            "@group(0) @binding({binding}) var<storage, {access}> {name}: array<{elem}>;\n"
        ));
        binding += 1;
    }
    src.push_str(&format!(
        "@group(0) @binding({binding}) var<storage, read> parameters: Parameters;\n\n"
    ));

    src.push_str(&spec.shader_prelude);
    src.push_str(&format!(
        "@compute @workgroup_size({size}, 1, 1)\n\
         fn main(\n    \
         @builtin(global_invocation_id) global_id: vec3<u32>,\n    \
         @builtin(local_invocation_id) local_id: vec3<u32>,\n    \
         @builtin(num_workgroups) num_workgroups: vec3<u32>,\n\
         ) {{\n    \
         let global_index = global_id.x\n        \
         + (global_id.y + global_id.z * num_workgroups.y) * num_workgroups.x * {size}u;\n",
        size = base.workgroup_size
    ));
    for line in spec.shader.lines() {
        src.push_str("    ");
        src.push_str(line);
        src.push('\n');
    }
    src.push_str("}\n");

    let mut src = src.replace("{{shaderType}}", elem);
    for (key, value) in base.config.iter() {
        src = src.replace(&format!("{{{{{key}}}}}"), &value.to_string());
    }
    if let Some(start) = src.find("{{") {
        let rest = &src[start..];
        let end = rest.find("}}").map_or(rest.len(), |e| e + 2);
        return Err(Error::InvalidSpec(format!(
            "kernel \"{}\" has an unresolved placeholder {}",
            spec.name,
            &rest[..end]
        )));
    }
    Ok(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::kernel::{registry, KernelConfig};

    fn wgsl(name: &str, config: &KernelConfig) -> Result<String> {
        let base = KernelBase::new(registry::lookup(name)?, config)?;
        generate(&base)
    }

    #[test]
    fn bindings_follow_inputs_outputs_parameters() {
        let src = wgsl("addGrad", &KernelConfig::new()).unwrap();
        let input = src.find("@binding(0) var<storage, read> input").unwrap();
        let other = src.find("@binding(1) var<storage, read> other").unwrap();
        let grad = src.find("@binding(3) var<storage, read_write> inputGrad").unwrap();
        let params = src.find("@binding(5) var<storage, read> parameters").unwrap();
        assert!(input < other && other < grad && grad < params);
        assert!(src.contains("@workgroup_size(256, 1, 1)"));
        assert!(!src.contains("{{"));
    }

    #[test]
    fn int_parameters_precede_floats() {
        let src = wgsl("mm", &KernelConfig::new()).unwrap();
        let inner = src.find("innerDim: u32").unwrap();
        let stride = src.find("bColStride: u32").unwrap();
        let alpha = src.find("alpha: f32").unwrap();
        assert!(inner < alpha && stride < alpha);
    }

    #[test]
    fn entry_point_linearises_folded_dispatches() {
        let src = wgsl("exp", &KernelConfig::new()).unwrap();
        assert!(src.contains("@builtin(num_workgroups) num_workgroups: vec3<u32>"));
        assert!(src.contains("num_workgroups.x * 256u;"));
        assert!(src.contains("let i = global_index;"));
    }

    #[test]
    fn dtype_selects_storage_type() {
        let src = wgsl("neg", &KernelConfig::for_dtype(DType::Int32)).unwrap();
        assert!(src.contains("array<i32>"));
        assert!(src.contains("output[i] = i32(-x);"));
    }

    #[test]
    fn reductions_size_shared_memory_from_config() {
        let config = KernelConfig::new().with("workgroupSize", 128_i64);
        let src = wgsl("sum", &config).unwrap();
        assert!(src.contains("array<f32, 128>"));
        assert!(src.contains("i = i + 128u;"));
    }

    #[test]
    fn uint8_has_no_wgsl_type() {
        let err = wgsl("abs", &KernelConfig::for_dtype(DType::Uint8)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDtype { .. }));
    }
}
