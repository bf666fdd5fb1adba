//! Decoding raw vector blobs into f32

use half::{bf16, f16};

use crate::types::VectorType;
use crate::{Error, Result};

/// Decode a little-endian blob of `dim` elements.
pub fn decode(blob: &[u8], elem_type: VectorType, dim: usize) -> Result<Vec<f32>> {
    let expected = dim * elem_type.size();
    if blob.len() != expected {
        return Err(Error::BadVectorSize {
            expected,
            actual: blob.len(),
        });
    }
    let out = match elem_type {
        VectorType::Float32 => blob
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        VectorType::Float64 => blob
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b) as f32
            })
            .collect(),
        VectorType::Float16 => blob
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        VectorType::BFloat16 => blob
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        VectorType::Int8 => blob.iter().map(|b| *b as i8 as f32).collect(),
        VectorType::Uint8 => blob.iter().map(|b| *b as f32).collect(),
    };
    Ok(out)
}

/// Encode f32 values as a blob of the given element type.
pub fn encode(values: &[f32], elem_type: VectorType) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * elem_type.size());
    for &v in values {
        match elem_type {
            VectorType::Float32 => out.extend_from_slice(&v.to_le_bytes()),
            VectorType::Float64 => out.extend_from_slice(&(v as f64).to_le_bytes()),
            VectorType::Float16 => out.extend_from_slice(&f16::from_f32(v).to_le_bytes()),
            VectorType::BFloat16 => out.extend_from_slice(&bf16::from_f32(v).to_le_bytes()),
            VectorType::Int8 => out.push(v.clamp(-128.0, 127.0) as i8 as u8),
            VectorType::Uint8 => out.push(v.clamp(0.0, 255.0) as u8),
        }
    }
    out
}

/// Vector given as a list of numbers (JSON documents).
pub fn from_numbers(values: &[f64], elem_type: VectorType, dim: usize) -> Result<Vec<f32>> {
    if values.len() != dim {
        return Err(Error::BadVectorSize {
            expected: dim * elem_type.size(),
            actual: values.len() * elem_type.size(),
        });
    }
    let out = values
        .iter()
        .map(|v| match elem_type {
            VectorType::Float16 => f16::from_f64(*v).to_f32(),
            VectorType::BFloat16 => bf16::from_f64(*v).to_f32(),
            VectorType::Int8 => v.clamp(-128.0, 127.0).trunc() as f32,
            VectorType::Uint8 => v.clamp(0.0, 255.0).trunc() as f32,
            VectorType::Float32 | VectorType::Float64 => *v as f32,
        })
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_mismatch() {
        let err = decode(&[0u8; 7], VectorType::Float32, 2).unwrap_err();
        assert!(matches!(err, Error::BadVectorSize { expected: 8, actual: 7 }));
    }

    #[test]
    fn test_half_precision() {
        let blob = encode(&[0.5, -2.0], VectorType::Float16);
        assert_eq!(blob.len(), 4);
        assert_eq!(decode(&blob, VectorType::Float16, 2).unwrap(), vec![0.5, -2.0]);
    }

    #[test]
    fn test_int8_is_signed() {
        assert_eq!(decode(&[0xff, 0x01], VectorType::Int8, 2).unwrap(), vec![-1.0, 1.0]);
        assert_eq!(decode(&[0xff, 0x01], VectorType::Uint8, 2).unwrap(), vec![255.0, 1.0]);
    }
}
