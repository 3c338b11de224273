//! Backend selection module.
//!
//! Picks which device [`Device::default`](crate::device::Device) hands out,
//! and therefore where tensors built without an explicit device live.
//!
//! # Supported Backends
//!
//! - `Cpu`: host memory and `rayon` parallel kernels (default).
//! - `Wgpu`: GPU compute through `wgpu` (requires the `wgpu` feature).
//!
//! The choice is stored globally in an `AtomicU8`, so it can be switched at
//! runtime. Tensors already created keep their device.

use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Host backend (default).
    #[default]
    Cpu = 0,
    /// GPU backend using `wgpu`.
    Wgpu = 1,
}

impl TryFrom<u8> for Backend {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            other => Err(other),
        }
    }
}

static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the backend used for tensors created from now on.
///
/// # Example
///
/// ```
/// use torchlet::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the currently selected backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_values_round_trip() {
        for b in [Backend::Cpu, Backend::Wgpu] {
            assert_eq!(Backend::try_from(b as u8), Ok(b));
        }
        assert_eq!(Backend::try_from(7), Err(7));
    }
}
