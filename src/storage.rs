//! Raw tensor memory.
//!
//! A [`Storage`] is an untyped run of bytes living on exactly one device.
//! Views interpret it through their own dtype, shape and strides; the storage
//! itself never changes representation. Cloning a storage clones the handle,
//! so several views can alias the same memory and the bytes are released when
//! the last handle drops.

use std::sync::{Arc, PoisonError, RwLock};

/// Host memory, kept as 32-bit words so `f32`/`i32` views stay aligned.
#[derive(Clone, Debug)]
pub struct HostBuffer {
    words: Arc<RwLock<Vec<u32>>>,
    byte_len: usize,
}

impl HostBuffer {
    /// Allocates `byte_len` zeroed bytes.
    pub fn zeroed(byte_len: usize) -> Self {
        Self {
            words: Arc::new(RwLock::new(vec![0; byte_len.div_ceil(4)])),
            byte_len,
        }
    }

    /// Copies `bytes` into a new host buffer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let buffer = Self::zeroed(bytes.len());
        buffer.write_bytes(bytes);
        buffer
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Runs `f` over the buffer contents under a shared lock.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let words = self.words.read().unwrap_or_else(PoisonError::into_inner);
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        f(&bytes[..self.byte_len])
    }

    /// Runs `f` over the buffer contents under an exclusive lock.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut words = self.words.write().unwrap_or_else(PoisonError::into_inner);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
        f(&mut bytes[..self.byte_len])
    }

    /// Overwrites the leading bytes of the buffer with `bytes`.
    pub fn write_bytes(&self, bytes: &[u8]) {
        self.with_bytes_mut(|dst| {
            let n = bytes.len().min(dst.len());
            dst[..n].copy_from_slice(&bytes[..n]);
        });
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }

    pub(crate) fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }
}

/// A GPU buffer shared between views.
#[cfg(feature = "wgpu")]
#[derive(Clone, Debug)]
pub struct GpuBuffer {
    pub(crate) buffer: Arc<wgpu::Buffer>,
    byte_len: usize,
}

#[cfg(feature = "wgpu")]
impl GpuBuffer {
    pub(crate) fn new(buffer: wgpu::Buffer, byte_len: usize) -> Self {
        Self {
            buffer: Arc::new(buffer),
            byte_len,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub(crate) fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

/// Device memory backing one or more tensor views.
#[derive(Clone, Debug)]
pub enum Storage {
    Host(HostBuffer),
    #[cfg(feature = "wgpu")]
    Gpu(GpuBuffer),
}

impl Storage {
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Host(buffer) => buffer.byte_len(),
            #[cfg(feature = "wgpu")]
            Self::Gpu(buffer) => buffer.byte_len(),
        }
    }

    /// Name of the device kind this storage lives on.
    pub fn location(&self) -> &'static str {
        match self {
            Self::Host(_) => "cpu",
            #[cfg(feature = "wgpu")]
            Self::Gpu(_) => "wgpu",
        }
    }

    /// Whether both handles refer to the same memory.
    pub fn same_storage(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Host(a), Self::Host(b)) => a.same_buffer(b),
            #[cfg(feature = "wgpu")]
            (Self::Gpu(a), Self::Gpu(b)) => a.same_buffer(b),
            #[cfg(feature = "wgpu")]
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_alias_the_same_bytes() {
        let a = Storage::Host(HostBuffer::from_bytes(&[1, 2, 3, 4, 5]));
        let b = a.clone();
        assert!(a.same_storage(&b));
        assert_eq!(a.byte_len(), 5);

        if let Storage::Host(buf) = &b {
            buf.write_bytes(&[9, 9]);
        }
        if let Storage::Host(buf) = &a {
            assert_eq!(buf.to_bytes(), vec![9, 9, 3, 4, 5]);
        }
    }

    #[test]
    fn distinct_allocations_do_not_alias() {
        let a = Storage::Host(HostBuffer::zeroed(8));
        let b = Storage::Host(HostBuffer::zeroed(8));
        assert!(!a.same_storage(&b));
    }
}
