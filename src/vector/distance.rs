//! Distance kernels
//!
//! All metrics are "smaller is closer". L2 is reported squared; IP and
//! COSINE report `1 - dot`, with cosine vectors normalized at insert and
//! query time.

use crate::types::DistanceMetric;

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::L2 => l2_squared(a, b),
        DistanceMetric::Ip | DistanceMetric::Cosine => 1.0 - dot(a, b),
    }
}

/// Scale to unit length in place; zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_is_squared() {
        let d = distance(DistanceMetric::L2, &[0.1, 0.1], &[0.1, 0.4]);
        assert!((d - 0.09).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_after_normalize() {
        let mut a = vec![3.0, 0.0];
        let mut b = vec![0.0, 5.0];
        normalize(&mut a);
        normalize(&mut b);
        assert!((distance(DistanceMetric::Cosine, &a, &a)).abs() < 1e-6);
        assert!((distance(DistanceMetric::Cosine, &a, &b) - 1.0).abs() < 1e-6);
    }
}
