//! Compute devices.
//!
//! [`BackendDevice`] is the capability interface every backend implements:
//! memory allocation and transfer, kernel lookup and compilation, and kernel
//! execution over backend-native buffers. [`Device`] is the cheap-clone handle
//! tensors carry; it dispatches to the process-wide CPU device or, with the
//! `wgpu` feature, the process-wide GPU device.

use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use log::warn;

use crate::backend::{Backend, get_backend};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernel::cache::KernelCache;
use crate::kernel::{KernelConfig, KernelParams, KernelSpec, registry};
use crate::ops::cpu::CpuKernel;
use crate::storage::{HostBuffer, Storage};

#[cfg(feature = "wgpu")]
use crate::ops::wgpu::{WgpuDevice, WgpuKernel};

/// What a compute backend must provide.
pub trait BackendDevice: Send + Sync {
    /// Backend-native buffer handed to kernels.
    type Buffer;
    /// Compiled kernel type.
    type Kernel;

    fn name(&self) -> &'static str;

    /// Allocates zeroed storage of `byte_size` bytes.
    fn alloc(&self, byte_size: usize) -> Result<Storage>;

    /// Allocates storage initialised with `bytes`.
    fn upload(&self, bytes: &[u8]) -> Result<Storage>;

    /// Returns the cached kernel for `(name, config)`, compiling it on a miss.
    fn get_kernel(&self, name: &str, config: &KernelConfig) -> Result<Arc<Self::Kernel>>;

    /// Compiles `spec` with `config`, bypassing the cache.
    fn create_kernel(&self, spec: Arc<KernelSpec>, config: &KernelConfig) -> Result<Self::Kernel>;

    /// The native buffer backing `storage`, viewed as `dtype`.
    fn buffer_for_kernel(&self, storage: &Storage, dtype: DType) -> Result<Self::Buffer>;

    /// Wraps a kernel output buffer as storage.
    fn storage_from_kernel(&self, buffer: Self::Buffer) -> Storage;

    fn run(
        &self,
        kernel: &Self::Kernel,
        inputs: &[Self::Buffer],
        params: &KernelParams,
        outputs: Vec<Option<Self::Buffer>>,
    ) -> Result<Vec<Self::Buffer>>;

    /// Copies the whole storage back to host memory.
    fn read(&self, storage: &Storage) -> Result<Vec<u8>>;
}

/// The host device.
#[derive(Default)]
pub struct CpuDevice {
    kernels: KernelCache<CpuKernel>,
}

impl CpuDevice {
    pub fn compiled_kernels(&self) -> usize {
        self.kernels.len()
    }
}

impl BackendDevice for CpuDevice {
    type Buffer = HostBuffer;
    type Kernel = CpuKernel;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn alloc(&self, byte_size: usize) -> Result<Storage> {
        Ok(Storage::Host(HostBuffer::zeroed(byte_size)))
    }

    fn upload(&self, bytes: &[u8]) -> Result<Storage> {
        Ok(Storage::Host(HostBuffer::from_bytes(bytes)))
    }

    fn get_kernel(&self, name: &str, config: &KernelConfig) -> Result<Arc<CpuKernel>> {
        let spec = registry::lookup(name)?;
        let key = spec.resolve_config(config)?.canonical_key(name);
        self.kernels
            .get_or_compile(&key, || self.create_kernel(spec.clone(), config))
    }

    fn create_kernel(&self, spec: Arc<KernelSpec>, config: &KernelConfig) -> Result<CpuKernel> {
        CpuKernel::new(spec, config)
    }

    fn buffer_for_kernel(&self, storage: &Storage, _dtype: DType) -> Result<HostBuffer> {
        match storage {
            Storage::Host(buffer) => Ok(buffer.clone()),
            #[cfg(feature = "wgpu")]
            other => Err(Error::DeviceMismatch {
                expected: "cpu",
                actual: other.location(),
            }),
        }
    }

    fn storage_from_kernel(&self, buffer: HostBuffer) -> Storage {
        Storage::Host(buffer)
    }

    fn run(
        &self,
        kernel: &CpuKernel,
        inputs: &[HostBuffer],
        params: &KernelParams,
        outputs: Vec<Option<HostBuffer>>,
    ) -> Result<Vec<HostBuffer>> {
        kernel.run(inputs, params, outputs)
    }

    fn read(&self, storage: &Storage) -> Result<Vec<u8>> {
        match storage {
            Storage::Host(buffer) => Ok(buffer.to_bytes()),
            #[cfg(feature = "wgpu")]
            other => Err(Error::DeviceMismatch {
                expected: "cpu",
                actual: other.location(),
            }),
        }
    }
}

lazy_static! {
    static ref CPU_DEVICE: Arc<CpuDevice> = Arc::new(CpuDevice::default());
}

#[cfg(feature = "wgpu")]
lazy_static! {
    static ref WGPU_DEVICE: std::result::Result<Arc<WgpuDevice>, String> =
        WgpuDevice::new().map(Arc::new).map_err(|e| e.to_string());
}

/// A compiled kernel from either backend.
#[derive(Clone)]
pub enum Kernel {
    Cpu(Arc<CpuKernel>),
    #[cfg(feature = "wgpu")]
    Wgpu(Arc<WgpuKernel>),
}

impl Kernel {
    /// Whether both handles refer to the same compiled instance.
    pub fn same_instance(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cpu(a), Self::Cpu(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "wgpu")]
            (Self::Wgpu(a), Self::Wgpu(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "wgpu")]
            _ => false,
        }
    }

    /// Canonical `name(config)` key the kernel is cached under.
    pub fn key(&self) -> &str {
        match self {
            Self::Cpu(k) => &k.base().key,
            #[cfg(feature = "wgpu")]
            Self::Wgpu(k) => &k.base().key,
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Kernel").field(&self.key()).finish()
    }
}

/// A handle to one of the process-wide devices.
#[derive(Clone)]
pub enum Device {
    Cpu(Arc<CpuDevice>),
    #[cfg(feature = "wgpu")]
    Wgpu(Arc<WgpuDevice>),
}

/// Runs `name` on a concrete backend, translating storages to and from
/// backend buffers.
fn dispatch<D: BackendDevice>(
    device: &D,
    name: &str,
    config: &KernelConfig,
    params: &KernelParams,
    inputs: &[(&Storage, DType)],
    outputs: Vec<Option<Storage>>,
) -> Result<Vec<Storage>> {
    let kernel = device.get_kernel(name, config)?;
    let dtype = config
        .get("dtype")
        .map(|v| v.to_string().parse())
        .transpose()?
        .unwrap_or_default();
    let inputs = inputs
        .iter()
        .map(|(storage, dtype)| device.buffer_for_kernel(storage, *dtype))
        .collect::<Result<Vec<_>>>()?;
    let outputs = outputs
        .iter()
        .map(|out| {
            out.as_ref()
                .map(|storage| device.buffer_for_kernel(storage, dtype))
                .transpose()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(device
        .run(&kernel, &inputs, params, outputs)?
        .into_iter()
        .map(|buffer| device.storage_from_kernel(buffer))
        .collect())
}

impl Device {
    /// The process-wide CPU device.
    pub fn cpu() -> Self {
        Self::Cpu(Arc::clone(&CPU_DEVICE))
    }

    /// The process-wide GPU device, if an adapter could be acquired.
    #[cfg(feature = "wgpu")]
    pub fn wgpu() -> Result<Self> {
        WGPU_DEVICE
            .as_ref()
            .map(|d| Self::Wgpu(Arc::clone(d)))
            .map_err(|e| Error::BackendUnavailable(e.clone()))
    }

    /// The device for `backend`.
    pub fn for_backend(backend: Backend) -> Result<Self> {
        match backend {
            Backend::Cpu => Ok(Self::cpu()),
            #[cfg(feature = "wgpu")]
            Backend::Wgpu => Self::wgpu(),
            #[cfg(not(feature = "wgpu"))]
            Backend::Wgpu => Err(Error::BackendUnavailable(
                "built without the `wgpu` feature".into(),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu(d) => d.name(),
            #[cfg(feature = "wgpu")]
            Self::Wgpu(d) => d.name(),
        }
    }

    /// Whether both handles refer to the same device.
    pub fn same_device(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cpu(a), Self::Cpu(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "wgpu")]
            (Self::Wgpu(a), Self::Wgpu(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "wgpu")]
            _ => false,
        }
    }

    pub fn alloc(&self, byte_size: usize) -> Result<Storage> {
        match self {
            Self::Cpu(d) => d.alloc(byte_size),
            #[cfg(feature = "wgpu")]
            Self::Wgpu(d) => d.alloc(byte_size),
        }
    }

    pub fn upload(&self, bytes: &[u8]) -> Result<Storage> {
        match self {
            Self::Cpu(d) => d.upload(bytes),
            #[cfg(feature = "wgpu")]
            Self::Wgpu(d) => d.upload(bytes),
        }
    }

    pub fn read(&self, storage: &Storage) -> Result<Vec<u8>> {
        match self {
            Self::Cpu(d) => d.read(storage),
            #[cfg(feature = "wgpu")]
            Self::Wgpu(d) => d.read(storage),
        }
    }

    /// Looks up (compiling on first use) the kernel for `(name, config)`.
    pub fn get_kernel(&self, name: &str, config: &KernelConfig) -> Result<Kernel> {
        match self {
            Self::Cpu(d) => d.get_kernel(name, config).map(Kernel::Cpu),
            #[cfg(feature = "wgpu")]
            Self::Wgpu(d) => d.get_kernel(name, config).map(Kernel::Wgpu),
        }
    }

    /// Number of kernels compiled on this device so far.
    pub fn compiled_kernels(&self) -> usize {
        match self {
            Self::Cpu(d) => d.compiled_kernels(),
            #[cfg(feature = "wgpu")]
            Self::Wgpu(d) => d.compiled_kernels(),
        }
    }

    /// Runs kernel `name` over `inputs` (storage plus the dtype it is viewed
    /// as). `outputs` may pre-supply output storages, as in-place kernels do.
    pub fn run_kernel(
        &self,
        name: &str,
        config: &KernelConfig,
        params: &KernelParams,
        inputs: &[(&Storage, DType)],
        outputs: Vec<Option<Storage>>,
    ) -> Result<Vec<Storage>> {
        match self {
            Self::Cpu(d) => dispatch(d.as_ref(), name, config, params, inputs, outputs),
            #[cfg(feature = "wgpu")]
            Self::Wgpu(d) => dispatch(d.as_ref(), name, config, params, inputs, outputs),
        }
    }
}

impl Default for Device {
    /// The device selected by [`crate::backend::get_backend`], falling back to
    /// the CPU when that backend is unavailable.
    fn default() -> Self {
        let backend = get_backend();
        Self::for_backend(backend).unwrap_or_else(|err| {
            warn!("{backend:?} backend unavailable ({err}), falling back to cpu");
            Self::cpu()
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.same_device(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_device_is_a_singleton() {
        assert!(Device::cpu().same_device(&Device::cpu()));
        assert_eq!(Device::cpu().name(), "cpu");
    }

    #[test]
    fn same_key_same_instance() {
        let device = Device::cpu();
        let config = KernelConfig::for_dtype(DType::Float32);
        let a = device.get_kernel("exp", &config).unwrap();
        let b = device.get_kernel("exp", &config).unwrap();
        assert!(a.same_instance(&b));
        let c = device
            .get_kernel("exp", &KernelConfig::for_dtype(DType::Int32))
            .unwrap();
        assert!(!a.same_instance(&c));
        assert_eq!(c.key(), "exp(dtype=int32,workgroupSize=256)");
    }

    #[test]
    fn unknown_kernel_is_reported() {
        let err = Device::cpu()
            .get_kernel("no_such_kernel", &KernelConfig::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKernel(_)));
    }
}
