//! Vector storage with optional scalar quantization
//!
//! Storage keeps full precision until `training_threshold` vectors have
//! been added. At that point a per-dimension min/max quantizer is fit on
//! everything stored so far, all vectors are re-encoded and the full
//! precision copy is dropped. Later inserts are encoded on arrival.

use crate::schema::Compression;

use super::distance::distance;
use crate::types::DistanceMetric;

#[derive(Debug, Clone)]
pub struct ScalarQuantizer {
    bits: u32,
    min: Vec<f32>,
    step: Vec<f32>,
}

impl ScalarQuantizer {
    /// Fit on row-major `samples` of `dim` values each.
    pub fn train(samples: &[f32], dim: usize, bits: u32) -> Self {
        let mut min = vec![f32::INFINITY; dim];
        let mut max = vec![f32::NEG_INFINITY; dim];
        for row in samples.chunks_exact(dim) {
            for (i, v) in row.iter().enumerate() {
                min[i] = min[i].min(*v);
                max[i] = max[i].max(*v);
            }
        }
        let levels = ((1u32 << bits) - 1) as f32;
        let step = min
            .iter_mut()
            .zip(&max)
            .map(|(lo, hi)| {
                if !lo.is_finite() {
                    *lo = 0.0;
                }
                let span = hi - *lo;
                if span.is_finite() && span > 0.0 {
                    span / levels
                } else {
                    1.0
                }
            })
            .collect();
        Self { bits, min, step }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn code_size(&self) -> usize {
        if self.bits == 8 {
            self.min.len()
        } else {
            self.min.len().div_ceil(2)
        }
    }

    fn level(&self, i: usize, v: f32) -> u8 {
        let max_level = ((1u32 << self.bits) - 1) as f32;
        ((v - self.min[i]) / self.step[i]).round().clamp(0.0, max_level) as u8
    }

    pub fn encode_into(&self, v: &[f32], out: &mut [u8]) {
        if self.bits == 8 {
            for (i, x) in v.iter().enumerate() {
                out[i] = self.level(i, *x);
            }
        } else {
            out.fill(0);
            for (i, x) in v.iter().enumerate() {
                out[i / 2] |= self.level(i, *x) << ((i % 2) * 4);
            }
        }
    }

    pub fn decode_into(&self, code: &[u8], out: &mut Vec<f32>) {
        out.clear();
        for i in 0..self.min.len() {
            let level = if self.bits == 8 {
                code[i]
            } else {
                (code[i / 2] >> ((i % 2) * 4)) & 0x0f
            };
            out.push(self.min[i] + level as f32 * self.step[i]);
        }
    }
}

/// Slot-addressed vector storage used by the graph index
#[derive(Debug)]
pub struct VectorStorage {
    dim: usize,
    compression: Option<Compression>,
    training_threshold: usize,
    full: Vec<f32>,
    quantizer: Option<ScalarQuantizer>,
    codes: Vec<u8>,
    len: usize,
}

impl VectorStorage {
    pub fn new(dim: usize, compression: Option<Compression>, training_threshold: usize) -> Self {
        Self {
            dim,
            compression,
            training_threshold: training_threshold.max(1),
            full: Vec::new(),
            quantizer: None,
            codes: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_quantized(&self) -> bool {
        self.quantizer.is_some()
    }

    pub fn push(&mut self, v: &[f32]) -> usize {
        let slot = self.len;
        match &self.quantizer {
            Some(q) => {
                let start = self.codes.len();
                self.codes.resize(start + q.code_size(), 0);
                q.encode_into(v, &mut self.codes[start..]);
            }
            None => self.full.extend_from_slice(v),
        }
        self.len += 1;
        self.maybe_train();
        slot
    }

    pub fn set(&mut self, slot: usize, v: &[f32]) {
        match &self.quantizer {
            Some(q) => {
                let size = q.code_size();
                q.encode_into(v, &mut self.codes[slot * size..(slot + 1) * size]);
            }
            None => self.full[slot * self.dim..(slot + 1) * self.dim].copy_from_slice(v),
        }
    }

    pub fn get(&self, slot: usize) -> Vec<f32> {
        match &self.quantizer {
            Some(q) => {
                let size = q.code_size();
                let mut out = Vec::with_capacity(self.dim);
                q.decode_into(&self.codes[slot * size..(slot + 1) * size], &mut out);
                out
            }
            None => self.full[slot * self.dim..(slot + 1) * self.dim].to_vec(),
        }
    }

    pub fn distance(&self, metric: DistanceMetric, query: &[f32], slot: usize) -> f32 {
        match &self.quantizer {
            Some(_) => distance(metric, query, &self.get(slot)),
            None => distance(metric, query, &self.full[slot * self.dim..(slot + 1) * self.dim]),
        }
    }

    fn maybe_train(&mut self) {
        let Some(compression) = self.compression else {
            return;
        };
        if self.quantizer.is_some() || self.len < self.training_threshold {
            return;
        }
        let q = ScalarQuantizer::train(&self.full, self.dim, compression.bits());
        let size = q.code_size();
        let mut codes = vec![0u8; self.len * size];
        for (slot, row) in self.full.chunks_exact(self.dim).enumerate() {
            q.encode_into(row, &mut codes[slot * size..(slot + 1) * size]);
        }
        tracing::debug!(vectors = self.len, bits = compression.bits(), "trained vector quantizer");
        self.codes = codes;
        self.full = Vec::new();
        self.quantizer = Some(q);
    }

    pub fn memory(&self) -> usize {
        self.full.capacity() * std::mem::size_of::<f32>()
            + self.codes.capacity()
            + self
                .quantizer
                .as_ref()
                .map(|q| q.min.len() * 8)
                .unwrap_or(0)
    }

    /// Bytes one stored vector occupies.
    pub fn slot_bytes(&self) -> usize {
        match &self.quantizer {
            Some(q) => q.code_size(),
            None => self.dim * std::mem::size_of::<f32>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sq8_round_trip_error_is_small() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 10.0).collect();
        let q = ScalarQuantizer::train(&samples, 2, 8);
        let mut code = vec![0u8; q.code_size()];
        q.encode_into(&[3.3, 7.1], &mut code);
        let mut out = Vec::new();
        q.decode_into(&code, &mut out);
        assert!((out[0] - 3.3).abs() < 0.05);
        assert!((out[1] - 7.1).abs() < 0.05);
    }

    #[test]
    fn test_sq4_packs_two_per_byte() {
        let q = ScalarQuantizer::train(&[0.0, 0.0, 0.0, 15.0, 15.0, 15.0], 3, 4);
        assert_eq!(q.code_size(), 2);
        let mut code = vec![0u8; 2];
        q.encode_into(&[15.0, 0.0, 15.0], &mut code);
        let mut out = Vec::new();
        q.decode_into(&code, &mut out);
        assert_eq!(out, vec![15.0, 0.0, 15.0]);
    }

    #[test]
    fn test_storage_trains_at_threshold() {
        let mut storage = VectorStorage::new(2, Some(Compression::Lvq8), 3);
        storage.push(&[0.0, 0.0]);
        storage.push(&[1.0, 1.0]);
        assert!(!storage.is_quantized());
        assert_eq!(storage.get(1), vec![1.0, 1.0]);
        storage.push(&[2.0, 2.0]);
        assert!(storage.is_quantized());
        let v = storage.get(2);
        assert!((v[0] - 2.0).abs() < 0.01);
        assert_eq!(storage.slot_bytes(), 2);
    }

    #[test]
    fn test_uncompressed_storage_never_trains() {
        let mut storage = VectorStorage::new(1, None, 1);
        storage.push(&[1.0]);
        assert!(!storage.is_quantized());
    }
}
