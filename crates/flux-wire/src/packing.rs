//! Fixed-size packing of vectors and rotations into a single `u32`.
//!
//! Rotations use smallest-three compression: the largest-magnitude component
//! of a unit quaternion is dropped and rebuilt on decode from the unit-norm
//! constraint, so the remaining three only need to cover
//! `[-1/sqrt(2), 1/sqrt(2)]`.
//!
//! ```text
//!  31        22 21        12 11         2 1  0
//! +------------+------------+------------+----+
//! |  A (10b)   |  B (10b)   |  C (10b)   | ix |
//! +------------+------------+------------+----+
//! ```
//!
//! Vectors are stored as signed fixed-point integers, `x` and `y` in 11 bits
//! and `z` in 10 bits:
//!
//! ```text
//!  31         21 20         10 9          0
//! +-------------+-------------+------------+
//! |   x (11b)   |   y (11b)   |  z (10b)   |
//! +-------------+-------------+------------+
//! ```

use glam::{Quat, Vec3};

// ---------------------------------------------------------------------------
// Quaternion
// ---------------------------------------------------------------------------

/// Bits per stored quaternion component.
const QUAT_COMPONENT_BITS: u32 = 10;

/// Largest quantized value of a stored component.
const QUAT_COMPONENT_MAX: u32 = (1 << QUAT_COMPONENT_BITS) - 1;

/// Magnitude bound of any non-largest component of a unit quaternion.
const QUAT_COMPONENT_RANGE: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Distance between two adjacent quantized component values.
pub const QUATERNION_STEP: f32 = 2.0 * QUAT_COMPONENT_RANGE / QUAT_COMPONENT_MAX as f32;

/// Position of `value` on the quantization grid, in steps from the bottom.
fn quantized_position(value: f32) -> f32 {
    let clamped = value.clamp(-QUAT_COMPONENT_RANGE, QUAT_COMPONENT_RANGE);
    let normalized = (clamped + QUAT_COMPONENT_RANGE) / (2.0 * QUAT_COMPONENT_RANGE);
    normalized * QUAT_COMPONENT_MAX as f32
}

fn dequantize_component(bits: u32) -> f32 {
    let normalized = (bits & QUAT_COMPONENT_MAX) as f32 / QUAT_COMPONENT_MAX as f32;
    normalized * 2.0 * QUAT_COMPONENT_RANGE - QUAT_COMPONENT_RANGE
}

/// Packs a unit quaternion into one word with smallest-three encoding.
///
/// The input is normalized first. `q` and `-q` describe the same rotation;
/// the sign is chosen so the dropped component is positive.
///
/// Each stored component is rounded down or up, whichever of the eight
/// combinations decodes closest to `q`. The rebuilt component absorbs the
/// error of the other three, and picking the rounding directions keeps every
/// decoded component within [`QUATERNION_STEP`] of the input.
pub fn pack_quaternion(rotation: Quat) -> u32 {
    let q = rotation.normalize();
    let mut components = q.to_array();

    let mut largest = 0;
    for i in 1..4 {
        if components[i].abs() > components[largest].abs() {
            largest = i;
        }
    }
    if components[largest] < 0.0 {
        for c in &mut components {
            *c = -*c;
        }
    }

    let mut floors = [0u32; 3];
    let mut slot = 0;
    for (i, c) in components.iter().enumerate() {
        if i == largest {
            continue;
        }
        floors[slot] = (quantized_position(*c).floor() as u32).min(QUAT_COMPONENT_MAX);
        slot += 1;
    }

    let mut best_word = 0;
    let mut best_error = f32::INFINITY;
    for rounding in 0..8u32 {
        let mut word = 0u32;
        for (bit, floor) in floors.iter().enumerate() {
            let up = (rounding >> bit) & 1;
            word = (word << QUAT_COMPONENT_BITS) | (floor + up).min(QUAT_COMPONENT_MAX);
        }
        word = (word << 2) | largest as u32;

        let decoded = unpack_quaternion(word).to_array();
        let error = components
            .iter()
            .zip(decoded)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        if error < best_error {
            best_error = error;
            best_word = word;
        }
    }
    best_word
}

/// Unpacks a word produced by [`pack_quaternion`].
pub fn unpack_quaternion(word: u32) -> Quat {
    let largest = (word & 0b11) as usize;
    let stored = [
        dequantize_component(word >> 22),
        dequantize_component(word >> 12),
        dequantize_component(word >> 2),
    ];

    let sum_sq: f32 = stored.iter().map(|c| c * c).sum();
    let rebuilt = (1.0 - sum_sq).max(0.0).sqrt();

    let mut components = [0.0f32; 4];
    let mut next = stored.iter();
    for (i, slot) in components.iter_mut().enumerate() {
        *slot = if i == largest {
            rebuilt
        } else {
            next.next().copied().unwrap_or(0.0)
        };
    }
    Quat::from_array(components).normalize()
}

// ---------------------------------------------------------------------------
// Vector3
// ---------------------------------------------------------------------------

const VEC_X_BITS: u32 = 11;
const VEC_Y_BITS: u32 = 11;
const VEC_Z_BITS: u32 = 10;

/// Fixed-point packing parameters for a [`Vec3`].
///
/// Each axis is multiplied by `precision` and rounded, so one quantization
/// step is `1 / precision`. Values are clamped to the range the narrowest
/// (`z`) slot can represent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorPacking {
    precision: f32,
}

impl VectorPacking {
    /// Packing that multiplies each axis by `precision` (must be positive).
    pub fn with_precision(precision: f32) -> Self {
        Self {
            precision: precision.max(f32::EPSILON),
        }
    }

    /// Packing that covers `[-max_range, max_range]` on every axis with the
    /// finest precision the 10-bit `z` slot allows.
    pub fn for_range(max_range: f32) -> Self {
        let z_max = ((1 << (VEC_Z_BITS - 1)) - 1) as f32;
        Self::with_precision(z_max / max_range.abs().max(f32::EPSILON))
    }

    /// Precision multiplier.
    pub fn precision(&self) -> f32 {
        self.precision
    }

    /// Size of one quantization step.
    pub fn step(&self) -> f32 {
        1.0 / self.precision
    }

    /// Largest magnitude representable on every axis.
    pub fn max_range(&self) -> f32 {
        ((1 << (VEC_Z_BITS - 1)) - 1) as f32 / self.precision
    }

    fn quantize(&self, value: f32, bits: u32) -> u32 {
        let max = (1i32 << (bits - 1)) - 1;
        let limit = self.max_range();
        let scaled = (value.clamp(-limit, limit) * self.precision).round() as i32;
        (scaled.clamp(-max - 1, max) as u32) & ((1 << bits) - 1)
    }

    fn dequantize(&self, raw: u32, bits: u32) -> f32 {
        let shift = 32 - bits;
        // Sign-extend the slot.
        let signed = ((raw << shift) as i32) >> shift;
        signed as f32 / self.precision
    }

    /// Packs a vector into one word.
    pub fn pack(&self, v: Vec3) -> u32 {
        (self.quantize(v.x, VEC_X_BITS) << (VEC_Y_BITS + VEC_Z_BITS))
            | (self.quantize(v.y, VEC_Y_BITS) << VEC_Z_BITS)
            | self.quantize(v.z, VEC_Z_BITS)
    }

    /// Unpacks a word produced by [`VectorPacking::pack`].
    pub fn unpack(&self, word: u32) -> Vec3 {
        let x = (word >> (VEC_Y_BITS + VEC_Z_BITS)) & ((1 << VEC_X_BITS) - 1);
        let y = (word >> VEC_Z_BITS) & ((1 << VEC_Y_BITS) - 1);
        let z = word & ((1 << VEC_Z_BITS) - 1);
        Vec3::new(
            self.dequantize(x, VEC_X_BITS),
            self.dequantize(y, VEC_Y_BITS),
            self.dequantize(z, VEC_Z_BITS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rotations() -> Vec<Quat> {
        let mut out = vec![
            Quat::IDENTITY,
            Quat::from_rotation_x(1.0),
            Quat::from_rotation_y(-2.5),
            Quat::from_rotation_z(3.1),
            Quat::from_xyzw(0.5, 0.5, 0.5, 0.5),
            Quat::from_xyzw(-0.5, 0.5, -0.5, 0.5),
        ];
        for i in 0..24 {
            let t = i as f32 * 0.37;
            out.push(Quat::from_euler(glam::EulerRot::YXZ, t, t * 0.5 - 1.0, 2.0 - t));
        }
        out
    }

    /// Deterministic spread of unit quaternions over the whole sphere.
    fn swept_rotations(count: u32) -> Vec<Quat> {
        let mut state = 0x2545_f491_u32;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as f32 / u32::MAX as f32 * 2.0 - 1.0
        };
        (0..count)
            .filter_map(|_| {
                let q = Quat::from_xyzw(next(), next(), next(), next());
                (q.length() > 0.1).then(|| q.normalize())
            })
            .collect()
    }

    fn max_component_error(q: Quat, decoded: Quat) -> f32 {
        // q and -q are the same rotation; compare in the same hemisphere.
        let aligned = if q.dot(decoded) < 0.0 { -decoded } else { decoded };
        q.to_array()
            .iter()
            .zip(aligned.to_array())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_quaternion_roundtrip_within_one_step() {
        let mut rotations = sample_rotations();
        rotations.extend(swept_rotations(20_000));
        rotations.push(Quat::from_xyzw(0.4838, 0.4810, -0.5142, 0.5198).normalize());
        for q in rotations {
            let decoded = unpack_quaternion(pack_quaternion(q));
            let error = max_component_error(q, decoded);
            assert!(error <= QUATERNION_STEP, "{q:?} decoded as {decoded:?} ({error})");
            assert!((decoded.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_quaternion_nearly_equal_components() {
        // All four components close to 0.5 make the rebuilt one most sensitive.
        let q = Quat::from_xyzw(0.4838, 0.4810, -0.5142, 0.5198).normalize();
        let decoded = unpack_quaternion(pack_quaternion(q));
        assert!(max_component_error(q, decoded) <= QUATERNION_STEP);
    }

    #[test]
    fn test_quaternion_index_bits_name_largest_component() {
        let q = Quat::from_xyzw(0.1, 0.9, 0.2, 0.3).normalize();
        assert_eq!(pack_quaternion(q) & 0b11, 1);

        let identity = pack_quaternion(Quat::IDENTITY);
        assert_eq!(identity & 0b11, 3);
        // Zero sits halfway between two grid values; either neighbour is fine.
        let mid = quantized_position(0.0);
        for stored in [identity >> 22, identity >> 12, identity >> 2] {
            let stored = (stored & QUAT_COMPONENT_MAX) as f32;
            assert!((stored - mid).abs() <= 0.5 + 1e-3, "{stored} vs {mid}");
        }
    }

    #[test]
    fn test_negative_largest_component_flips_sign() {
        let q = Quat::from_xyzw(0.0, 0.0, 0.0, -1.0);
        let decoded = unpack_quaternion(pack_quaternion(q));
        assert!((decoded.w - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_vector_roundtrip_within_one_step() {
        let packing = VectorPacking::for_range(64.0);
        let step = packing.step();
        let samples = [
            Vec3::ZERO,
            Vec3::new(1.0, -2.0, 3.0),
            Vec3::new(63.9, -63.9, 0.01),
            Vec3::new(-64.0, 64.0, -64.0),
            Vec3::new(12.345, 0.5, -7.75),
        ];
        for v in samples {
            let decoded = packing.unpack(packing.pack(v));
            assert!((decoded - v).abs().max_element() <= step, "{v:?} -> {decoded:?}");
        }
    }

    #[test]
    fn test_vector_out_of_range_is_clamped() {
        let packing = VectorPacking::for_range(10.0);
        let decoded = packing.unpack(packing.pack(Vec3::new(500.0, -500.0, 500.0)));
        let limit = packing.max_range() + packing.step();
        assert!(decoded.abs().max_element() <= limit);
        assert!(decoded.x > 9.0 && decoded.y < -9.0 && decoded.z > 9.0);
    }

    #[test]
    fn test_vector_precision_multiplier() {
        let packing = VectorPacking::with_precision(10.0);
        assert!((packing.step() - 0.1).abs() < 1e-6);
        assert!((packing.max_range() - 51.1).abs() < 1e-3);
        let word = packing.pack(Vec3::new(0.1, -0.1, 0.0));
        let decoded = packing.unpack(word);
        assert!((decoded.x - 0.1).abs() < 1e-6);
        assert!((decoded.y + 0.1).abs() < 1e-6);
    }
}
