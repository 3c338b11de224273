//! Element types a tensor view can interpret its storage as.

use core::fmt;
use core::str::FromStr;

use crate::error::{Error, Result};

/// Element type of a tensor view.
///
/// The dtype belongs to the view; the same storage may be viewed under
/// different dtypes without being rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    #[default]
    Float32,
    Int32,
    Uint8,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Uint8 => 1,
        }
    }

    /// Canonical name, as used in kernel configurations.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Int32 => "int32",
            Self::Uint8 => "uint8",
        }
    }

    /// WGSL scalar type for storage arrays of this dtype, if WGSL has one.
    pub const fn shader_type(self) -> Option<&'static str> {
        match self {
            Self::Float32 => Some("f32"),
            Self::Int32 => Some("i32"),
            Self::Uint8 => None,
        }
    }

    /// Decodes `count` elements from little-endian storage bytes into `f32`s.
    pub(crate) fn decode(self, bytes: &[u8], count: usize) -> Vec<f32> {
        match self {
            Self::Float32 => bytes
                .chunks_exact(4)
                .take(count)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            #[allow(clippy::cast_precision_loss)]
            Self::Int32 => bytes
                .chunks_exact(4)
                .take(count)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
            Self::Uint8 => bytes.iter().take(count).map(|&b| f32::from(b)).collect(),
        }
    }

    /// Encodes `values` as storage bytes of this dtype, writing into `out`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub(crate) fn encode_into(self, values: &[f32], out: &mut [u8]) {
        match self {
            Self::Float32 => {
                for (dst, v) in out.chunks_exact_mut(4).zip(values) {
                    dst.copy_from_slice(&v.to_le_bytes());
                }
            }
            Self::Int32 => {
                for (dst, v) in out.chunks_exact_mut(4).zip(values) {
                    dst.copy_from_slice(&(*v as i32).to_le_bytes());
                }
            }
            Self::Uint8 => {
                for (dst, v) in out.iter_mut().zip(values) {
                    *dst = v.clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    /// Encodes `values` into a freshly allocated byte vector.
    pub(crate) fn encode(self, values: &[f32]) -> Vec<u8> {
        let mut out = vec![0u8; values.len() * self.byte_size()];
        self.encode_into(values, &mut out);
        out
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float32" | "f32" => Ok(Self::Float32),
            "int32" | "i32" => Ok(Self::Int32),
            "uint8" | "u8" => Ok(Self::Uint8),
            other => Err(Error::InvalidSpec(format!("unsupported dtype: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_values_truncate_on_encode() {
        let bytes = DType::Int32.encode(&[1.7, -2.2, 3.0]);
        assert_eq!(DType::Int32.decode(&bytes, 3), vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn uint8_saturates() {
        let bytes = DType::Uint8.encode(&[-4.0, 300.0, 7.0]);
        assert_eq!(bytes, vec![0, 255, 7]);
    }

    #[test]
    fn names_round_trip() {
        for dt in [DType::Float32, DType::Int32, DType::Uint8] {
            assert_eq!(dt.as_str().parse::<DType>().unwrap(), dt);
        }
        assert!("float64".parse::<DType>().is_err());
    }
}
