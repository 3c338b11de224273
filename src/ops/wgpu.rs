//! GPU-accelerated kernels using WGPU.
//!
//! This module turns kernel specs into WGSL compute pipelines and runs them
//! on the adapter picked when the global [`GpuContext`] is first touched.
//!
//! - Each compiled kernel owns its bind group layout and pipeline; the
//!   per-device kernel cache makes sure a `(name, config)` pair is only
//!   compiled once.
//! - The bind group layout has one read-only storage slot per input, one
//!   read-write slot per output and a trailing read-only slot holding the
//!   packed parameters.
//! - Dispatch records a single compute pass and submits it without waiting.
//!   Only [`WgpuDevice::read`] blocks, polling the device until the staging
//!   copy has been mapped.

use std::sync::{Arc, mpsc};

use lazy_static::lazy_static;
use log::{info, trace};
use wgpu::util::DeviceExt;

use crate::device::BackendDevice;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernel::cache::KernelCache;
use crate::kernel::{KernelBase, KernelConfig, KernelParams, KernelSpec, registry, shader};
use crate::storage::{GpuBuffer, Storage};

/// Failures reported by `wgpu` itself.
#[derive(thiserror::Error, Debug)]
pub enum GpuError {
    #[error("adapter error: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("device error: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),
    #[error("buffer mapping failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("buffer mapping callback was dropped")]
    MapCallbackDropped,
    /// Shader or pipeline validation failed while compiling a kernel.
    #[error("validation failed for {kernel}: {message}")]
    Validation { kernel: String, message: String },
}

/// Holds the WGPU device and queue used for executing compute pipelines.
///
/// Initialized once globally via `lazy_static` and shared by every kernel.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device and queue.
    ///
    /// Uses `pollster::block_on` to wait for the asynchronous `wgpu` calls.
    pub fn new() -> std::result::Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let adapter_info = adapter.get_info();
        info!(
            "using wgpu adapter {} ({:?})",
            adapter_info.name, adapter_info.backend
        );
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("torchlet"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;
        Ok(Self { device, queue })
    }
}

lazy_static! {
    static ref GPU_CONTEXT: std::result::Result<GpuContext, GpuError> = GpuContext::new();
}

/// The global GPU context, or why it could not be created.
pub fn context() -> Result<&'static GpuContext> {
    GPU_CONTEXT
        .as_ref()
        .map_err(|e| Error::BackendUnavailable(e.to_string()))
}

/// Storage buffers are sized in whole words and never empty, since a
/// zero-sized binding is invalid.
fn padded_size(byte_len: usize) -> u64 {
    byte_len.div_ceil(4).max(1) as u64 * 4
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// A kernel compiled into a compute pipeline.
pub struct WgpuKernel {
    base: KernelBase,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl WgpuKernel {
    pub fn new(ctx: &GpuContext, spec: Arc<KernelSpec>, config: &KernelConfig) -> Result<Self> {
        let base = KernelBase::new(spec, config)?;
        let source = shader::generate(&base)?;
        let label = Some(base.key.as_str());
        let device = &ctx.device;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label,
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let inputs = base.spec.inputs.len() as u32;
        let outputs = base.spec.outputs.len() as u32;
        let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..inputs)
            .map(|b| storage_entry(b, true))
            .chain((inputs..inputs + outputs).map(|b| storage_entry(b, false)))
            .chain(std::iter::once(storage_entry(inputs + outputs, true)))
            .collect();
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label,
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label,
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label,
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(GpuError::Validation {
                kernel: base.key.clone(),
                message: err.to_string(),
            }
            .into());
        }

        Ok(Self {
            base,
            bind_group_layout,
            pipeline,
        })
    }

    pub fn base(&self) -> &KernelBase {
        &self.base
    }

    /// Binds the buffers, records one compute pass and submits it.
    pub fn run(
        &self,
        ctx: &GpuContext,
        inputs: &[GpuBuffer],
        params: &KernelParams,
        outputs: Vec<Option<GpuBuffer>>,
    ) -> Result<Vec<GpuBuffer>> {
        let base = &self.base;
        base.check_inputs(inputs)?;
        let words = base.pack_parameters(params)?;
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
        let out_buffers = counts
            .iter()
            .enumerate()
            .map(|(index, &count)| {
                let needed = count * elem;
                match supplied.next().flatten() {
                    Some(buffer) => {
                        let reason = if !buffer.raw().usage().contains(wgpu::BufferUsages::STORAGE) {
                            Some("buffer lacks STORAGE usage".to_owned())
                        } else if buffer.byte_len() < needed {
                            Some(format!("{} bytes supplied, {needed} needed", buffer.byte_len()))
                        } else {
                            None
                        };
                        match reason {
                            Some(reason) => Err(Error::InvalidOutputBuffer {
                                index,
                                kernel: base.name().to_owned(),
                                reason,
                            }),
                            None => Ok(buffer),
                        }
                    }
                    None => Ok(alloc_buffer(ctx, needed, &base.spec.outputs[index].name)),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let param_buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("parameters"),
                contents: bytemuck::cast_slice(&words),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let entries: Vec<wgpu::BindGroupEntry> = inputs
            .iter()
            .chain(&out_buffers)
            .map(GpuBuffer::raw)
            .chain(std::iter::once(&param_buffer))
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(base.key.as_str()),
            layout: &self.bind_group_layout,
            entries: &entries,
        });

        let [x, y, z] = base.workgroup_counts(params)?;
        trace!("wgpu dispatch {} workgroups=({x}, {y}, {z})", base.key);
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(base.key.as_str()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(base.key.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        ctx.queue.submit(Some(encoder.finish()));
        Ok(out_buffers)
    }
}

fn alloc_buffer(ctx: &GpuContext, byte_len: usize, label: &str) -> GpuBuffer {
    trace!("allocating {byte_len} bytes of gpu storage for {label}");
    let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: padded_size(byte_len),
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    GpuBuffer::new(buffer, byte_len)
}

/// The GPU device: the global context plus its kernel cache.
pub struct WgpuDevice {
    ctx: &'static GpuContext,
    kernels: KernelCache<WgpuKernel>,
}

impl WgpuDevice {
    pub fn new() -> Result<Self> {
        Ok(Self {
            ctx: context()?,
            kernels: KernelCache::new(),
        })
    }

    pub fn compiled_kernels(&self) -> usize {
        self.kernels.len()
    }

    fn upload_buffer(&self, bytes: &[u8]) -> GpuBuffer {
        let mut contents = bytes.to_vec();
        contents.resize(padded_size(bytes.len()) as usize, 0);
        let buffer = self
            .ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("upload"),
                contents: &contents,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            });
        GpuBuffer::new(buffer, bytes.len())
    }

    fn read_buffer(&self, source: &GpuBuffer) -> Result<Vec<u8>> {
        let device = &self.ctx.device;
        let size = source.raw().size();
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_buffer_to_buffer(source.raw(), 0, &staging, 0, size);
        self.ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(GpuError::from)?;
        rx.recv()
            .map_err(|_| GpuError::MapCallbackDropped)?
            .map_err(GpuError::from)?;

        let bytes = {
            let data = slice.get_mapped_range();
            data[..source.byte_len()].to_vec()
        };
        staging.unmap();
        Ok(bytes)
    }
}

impl BackendDevice for WgpuDevice {
    type Buffer = GpuBuffer;
    type Kernel = WgpuKernel;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn alloc(&self, byte_size: usize) -> Result<Storage> {
        Ok(Storage::Gpu(alloc_buffer(self.ctx, byte_size, "tensor")))
    }

    fn upload(&self, bytes: &[u8]) -> Result<Storage> {
        Ok(Storage::Gpu(self.upload_buffer(bytes)))
    }

    fn get_kernel(&self, name: &str, config: &KernelConfig) -> Result<Arc<WgpuKernel>> {
        let spec = registry::lookup(name)?;
        let key = spec.resolve_config(config)?.canonical_key(name);
        self.kernels
            .get_or_compile(&key, || self.create_kernel(spec.clone(), config))
    }

    fn create_kernel(&self, spec: Arc<KernelSpec>, config: &KernelConfig) -> Result<WgpuKernel> {
        WgpuKernel::new(self.ctx, spec, config)
    }

    fn buffer_for_kernel(&self, storage: &Storage, dtype: DType) -> Result<GpuBuffer> {
        if dtype.shader_type().is_none() {
            return Err(Error::UnsupportedDtype {
                dtype,
                backend: "wgpu",
            });
        }
        match storage {
            Storage::Gpu(buffer) => Ok(buffer.clone()),
            Storage::Host(host) => Ok(host.with_bytes(|bytes| self.upload_buffer(bytes))),
        }
    }

    fn storage_from_kernel(&self, buffer: GpuBuffer) -> Storage {
        Storage::Gpu(buffer)
    }

    fn run(
        &self,
        kernel: &WgpuKernel,
        inputs: &[GpuBuffer],
        params: &KernelParams,
        outputs: Vec<Option<GpuBuffer>>,
    ) -> Result<Vec<GpuBuffer>> {
        kernel.run(self.ctx, inputs, params, outputs)
    }

    fn read(&self, storage: &Storage) -> Result<Vec<u8>> {
        match storage {
            Storage::Gpu(buffer) => self.read_buffer(buffer),
            Storage::Host(host) => Ok(host.to_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizes_are_padded_to_words() {
        assert_eq!(padded_size(0), 4);
        assert_eq!(padded_size(5), 8);
        assert_eq!(padded_size(16), 16);
    }

    #[test]
    fn kernels_round_trip_through_the_gpu() {
        let Ok(device) = WgpuDevice::new() else {
            return;
        };
        let input = device.upload(&DType::Float32.encode(&[-1.0, 2.0, -3.0])).unwrap();
        let kernel = device
            .get_kernel("abs", &KernelConfig::for_dtype(DType::Float32))
            .unwrap();
        let buffer = device.buffer_for_kernel(&input, DType::Float32).unwrap();
        let out = device
            .run(&kernel, &[buffer], &KernelParams::new().size(3), vec![])
            .unwrap();
        let bytes = device.read(&Storage::Gpu(out[0].clone())).unwrap();
        assert_eq!(DType::Float32.decode(&bytes, 3), vec![1.0, 2.0, 3.0]);
    }
}
