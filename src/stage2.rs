/*
 Copyright (c) 2025 clone206

 This file is part of pdmdecim

 pdmdecim is free software: you can redistribute it and/or modify it
 under the terms of the GNU General Public License as published by the
 Free Software Foundation, either version 3 of the License, or
 (at your option) any later version.

 pdmdecim is distributed in the hope that it will be useful, but
 WITHOUT ANY WARRANTY; without even the implied warranty of
 MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 GNU General Public License for more details.
 You should have received a copy of the GNU General Public License
 along with pdmdecim. If not, see <https://www.gnu.org/licenses/>.
*/


// Fixed-point FIR decimator used for stage 2 and stage 3.
// 32-bit coefficients, 128-bit accumulation, one output per Q inputs.
// The multiply step carries a built-in 30-bit right shift; `shr` is the
// extra shift that keeps the worst-case sum inside 32 bits.

use log::debug;

use crate::model::{DecimError, DecimResult, invalid};
use crate::stage1::{MAX_STAGE1_OUTPUT, window_count};

pub const INT32_MAX_COEFFICIENT: i64 = i32::MAX as i64;
/// Right shift built into the 32-bit vector multiply.
pub const VPU_SHR: i32 = 30;
/// Most negative extra shift the rounding step can express.
pub const MIN_SHR: i32 = -VPU_SHR;

#[derive(Debug, Clone, PartialEq)]
pub struct Stage2Filter {
    coefs: Vec<i32>,
    q: usize,
    shr: i32,
}

/// Stage 3 runs the same arithmetic at the stage 2 output rate.
pub type Stage3Filter = Stage2Filter;

/// floor(log2(sum |c| * 0x7FFFFF00 >> 30) - 30), computed exactly.
pub fn compute_shr(coefs: &[i32]) -> DecimResult<i32> {
    let acc: u128 = coefs
        .iter()
        .map(|&c| (MAX_STAGE1_OUTPUT as u128 * c.unsigned_abs() as u128) >> VPU_SHR)
        .sum();
    if acc == 0 {
        return Err(DecimError::Overflow(
            "coefficients have no magnitude; output shift is undefined".into(),
        ));
    }
    let shr = (127 - acc.leading_zeros() as i32) - VPU_SHR;
    if shr < MIN_SHR {
        return Err(DecimError::Overflow(format!(
            "derived shift {} is below the representable minimum {}",
            shr, MIN_SHR
        )));
    }
    Ok(shr)
}

/// Round-half-to-even of `acc / 2^shift`.
pub(crate) fn round_shift(acc: i128, shift: u32) -> i128 {
    if shift == 0 {
        return acc;
    }
    let q = acc >> shift;
    let rem = acc - (q << shift);
    let half = 1i128 << (shift - 1);
    if rem > half || (rem == half && q & 1 == 1) {
        q + 1
    } else {
        q
    }
}

impl Stage2Filter {
    pub fn new(coefs: Vec<i32>, q: usize) -> DecimResult<Self> {
        if coefs.is_empty() {
            return invalid("FIR stage needs at least one coefficient");
        }
        if q == 0 {
            return invalid("FIR stage decimation factor must be non-zero");
        }
        let shr = compute_shr(&coefs)?;
        debug!("FIR stage: {} taps, decimation {}, shr {}", coefs.len(), q, shr);
        Ok(Self { coefs, q, shr })
    }

    /// Scale real coefficients so the largest magnitude becomes 2^31 - 1.
    pub fn from_real(coefs: &[f64], q: usize) -> DecimResult<Self> {
        if let Some(c) = coefs.iter().find(|c| !c.is_finite()) {
            return invalid(format!("FIR stage coefficient {} is not finite", c));
        }
        let max = coefs.iter().fold(0.0f64, |m, c| m.max(c.abs()));
        if max == 0.0 {
            return invalid("FIR stage coefficients are all zero");
        }
        let scale = INT32_MAX_COEFFICIENT as f64 / max;
        let ints = coefs
            .iter()
            .map(|&c| (c * scale).round_ties_even() as i32)
            .collect();
        Self::new(ints, q)
    }

    pub fn decimation_factor(&self) -> usize {
        self.q
    }

    pub fn tap_count(&self) -> usize {
        self.coefs.len()
    }

    pub fn coefs(&self) -> &[i32] {
        &self.coefs
    }

    pub fn shr(&self) -> i32 {
        self.shr
    }

    pub fn output_len(&self, n: usize) -> usize {
        window_count(n, self.tap_count(), self.q)
    }

    #[inline]
    fn accumulate(&self, window: &[i32]) -> i128 {
        window
            .iter()
            .zip(&self.coefs)
            .map(|(&x, &c)| x as i64 as i128 * c as i128)
            .sum()
    }

    /// Bit-exact device output.
    pub fn filter(&self, x: &[i32]) -> Vec<i32> {
        let (t, q) = (self.tap_count(), self.q);
        let shift = (VPU_SHR + self.shr) as u32;
        (0..self.output_len(x.len()))
            .map(|k| {
                let y = round_shift(self.accumulate(&x[q * k..q * k + t]), shift);
                y.clamp(i32::MIN as i128, i32::MAX as i128) as i32
            })
            .collect()
    }

    /// Real-valued reference using the same scaling as [`Self::filter`].
    pub fn filter_float(&self, x: &[f64]) -> Vec<f64> {
        let (t, q) = (self.tap_count(), self.q);
        let gain = (-(VPU_SHR + self.shr) as f64).exp2();
        (0..self.output_len(x.len()))
            .map(|k| {
                x[q * k..q * k + t]
                    .iter()
                    .zip(&self.coefs)
                    .map(|(&v, &c)| v * c as f64)
                    .sum::<f64>()
                    * gain
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn pass_through_tap_has_zero_shift() {
        let f = Stage2Filter::new(vec![0x4000_0000], 1).unwrap();
        assert_eq!(f.shr(), 0);
        let x = vec![5, -7, 0x7FFF_FF00, i32::MIN + 256];
        assert_eq!(f.filter(&x), x);
    }

    #[test]
    fn rejects_degenerate_coefficients() {
        assert!(matches!(Stage2Filter::new(vec![0, 0, 0], 2), Err(DecimError::Overflow(_))));
        assert!(Stage2Filter::new(vec![], 2).is_err());
        assert!(Stage2Filter::new(vec![1], 0).is_err());
        // |c| = 1: sum = 0x7FFFFF00 >> 30 = 1 -> shr = -30, still allowed
        assert_eq!(Stage2Filter::new(vec![1], 1).unwrap().shr(), -30);
        assert!(matches!(
            Stage2Filter::from_real(&[0.5, f64::NAN, 0.25], 2),
            Err(DecimError::Validation(_))
        ));
        assert!(Stage2Filter::from_real(&[f64::INFINITY], 2).is_err());
    }

    #[test]
    fn round_half_even() {
        assert_eq!(round_shift(5, 1), 2); // 2.5
        assert_eq!(round_shift(7, 1), 4); // 3.5
        assert_eq!(round_shift(-5, 1), -2); // -2.5
        assert_eq!(round_shift(-7, 1), -4);
        assert_eq!(round_shift(13, 2), 3); // 3.25
        assert_eq!(round_shift(15, 2), 4); // 3.75
        assert_eq!(round_shift(9, 0), 9);
    }

    #[test]
    fn length_law_with_and_without_divisible_taps() {
        let f = Stage2Filter::new(vec![1 << 20; 64], 6).unwrap();
        for n in [0, 63, 64, 65, 96, 97, 600, 601] {
            let x = vec![1; n];
            let y = f.filter(&x);
            assert_eq!(y.len(), (n / 6).saturating_sub(10), "n = {}", n);
        }
        let g = Stage2Filter::new(vec![1 << 20; 96], 6).unwrap();
        assert_eq!(g.filter(&vec![1; 600]).len(), 100 - (96 - 6) / 6);
    }

    #[test]
    fn worst_case_input_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(11);
        for taps in [3, 19, 64, 256] {
            let coefs: Vec<i32> = (0..taps).map(|_| rng.gen_range(i32::MIN..=i32::MAX)).collect();
            let f = Stage2Filter::new(coefs.clone(), 2).unwrap();
            let x: Vec<i32> = coefs
                .iter()
                .map(|&c| if c < 0 { -(MAX_STAGE1_OUTPUT as i32) } else { MAX_STAGE1_OUTPUT as i32 })
                .collect();
            let wide = round_shift(f.accumulate(&x), (VPU_SHR + f.shr()) as u32);
            assert!(wide <= i32::MAX as i128, "taps {} -> {}", taps, wide);
            assert!(wide > (i32::MAX as i128) / 4, "shift too large for taps {}", taps);
        }
    }

    #[test]
    fn fixed_point_tracks_float_reference() {
        let mut rng = StdRng::seed_from_u64(5);
        let real: Vec<f64> = (0..48).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let f = Stage2Filter::from_real(&real, 3).unwrap();
        let x: Vec<i32> = (0..600).map(|_| rng.gen_range(-(1 << 28)..(1 << 28))).collect();
        let xf: Vec<f64> = x.iter().map(|&v| v as f64).collect();
        for (a, b) in f.filter(&x).iter().zip(f.filter_float(&xf)) {
            assert!((*a as f64 - b).abs() <= 0.5 + 1e-6 * b.abs(), "{} vs {}", a, b);
        }
    }
}
