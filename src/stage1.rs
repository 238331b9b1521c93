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


// ============================================================================
// Stage1Filter
// One-bit correlator stage that also decimates. The 16-bit coefficients are
// held four ways:
//   - real values (float reference)
//   - quantized int16
//   - T x 16 sign matrix against the dual weights W = [1, 2, 4, .., 2^14, 32767]
//   - 16 bit-planes packed into the word layout the correlate instruction reads
// Each representation has its own filtering routine and all of them agree.
//
// Windows are T samples long and advance by Q samples per output; only full
// windows are produced. The quantized path uses 256-entry tables per 8-tap
// segment (one table lookup per input byte instead of 8 multiply-adds).
// ============================================================================

use log::debug;

use crate::model::{DecimError, DecimResult, invalid};
use crate::signal::PdmSignal;

pub const BLOCK_SIZE: usize = 256;
pub const PLANES: usize = 16;
pub const INT16_MAX_COEFFICIENT: i32 = 32766;
/// Stage 1 output is left-shifted by this much before stage 2.
pub const OUTPUT_SHL: u32 = 8;
/// Largest magnitude stage 1 may hand to stage 2. Construction rejects
/// coefficient sets whose sum of magnitudes could exceed it.
pub const MAX_STAGE1_OUTPUT: i64 = 0x7FFF_FF00;

const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 32;

/// Dual weight vector. The top weight is 32767, not 2^15.
pub const INT16_DUAL: [i32; PLANES] = [
    0x0001, 0x0002, 0x0004, 0x0008, 0x0010, 0x0020, 0x0040, 0x0080, 0x0100, 0x0200,
    0x0400, 0x0800, 0x1000, 0x2000, 0x4000, 0x7FFF,
];

/// Sign decomposition of `c` against [`INT16_DUAL`]; entry `k` pairs with
/// weight `k`. Greedy from the top weight down.
pub fn dual_decompose(c: i16) -> [i8; PLANES] {
    let mut res = [0i8; PLANES];
    let mut y = 2 * c as i32;
    for k in (0..PLANES).rev() {
        let p: i32 = if y >= 0 { 1 } else { -1 };
        res[k] = p as i8;
        y -= p * INT16_DUAL[k];
    }
    res
}

/// dot(signs, W) / 2
pub fn dual_recombine(signs: &[i8; PLANES]) -> i32 {
    let dot: i32 = signs
        .iter()
        .zip(INT16_DUAL.iter())
        .map(|(&s, &w)| s as i32 * w)
        .sum();
    dot / 2
}

/// Number of full windows available in `n` input samples.
pub(crate) fn window_count(n: usize, taps: usize, q: usize) -> usize {
    let w = taps.saturating_sub(q).div_ceil(q);
    (n / q).saturating_sub(w)
}

#[inline]
fn is_negative_bit(sample: i32) -> u32 {
    (sample < 0) as u32
}

// Word w of a 256-sample block: samples 32*(7 - w) .. +32, first sample
// on bit 0. Built MSB-first and then bit reversed, which is how the
// instruction's operand is laid out.
fn pack_block(bits: impl Fn(usize) -> u32, words: &mut [u32; WORDS_PER_BLOCK]) {
    for (w, slot) in words.iter_mut().enumerate() {
        let base = 32 * (WORDS_PER_BLOCK - 1 - w);
        let msb_first = (0..32).fold(0u32, |acc, i| acc | (bits(base + i) << (31 - i)));
        *slot = msb_first.reverse_bits();
    }
}

pub struct Stage1Filter {
    q: usize,
    coef_real: Vec<f64>,
    scale: f64,
    coef_i16: Vec<i16>,
    coef_bipolar: Vec<[i8; PLANES]>,
    coef_binary: Vec<Vec<u8>>,
    packed: Vec<u32>,
    // tables[s][byte]: contribution of taps 8s..8s+7 for that byte of
    // input bits (bit i set -> sample 8s+i is -1)
    tables: Vec<Box<[i32; 256]>>,
}

impl Stage1Filter {
    /// Build from quantized coefficients.
    pub fn new(coef_i16: Vec<i16>, q: usize) -> DecimResult<Self> {
        let coef_real = coef_i16.iter().map(|&c| c as f64).collect();
        Self::build(coef_i16, coef_real, 1.0, q)
    }

    /// Quantize real coefficients in [-1, 1]; the largest magnitude maps
    /// to 32766.
    pub fn from_real(coefs: &[f64], q: usize) -> DecimResult<Self> {
        if let Some(c) = coefs.iter().find(|c| !c.is_finite()) {
            return invalid(format!("stage 1 coefficient {} is not finite", c));
        }
        let max = coefs.iter().fold(0.0f64, |m, c| m.max(c.abs()));
        if max > 1.0 {
            return invalid(format!(
                "stage 1 coefficients must lie in [-1.0, 1.0] (max |c| = {})",
                max
            ));
        }
        if max == 0.0 {
            return invalid("stage 1 coefficients are all zero");
        }
        let scale = INT16_MAX_COEFFICIENT as f64 / max;
        let coef_i16 = coefs
            .iter()
            .map(|&c| (c * scale).round_ties_even() as i16)
            .collect();
        Self::build(coef_i16, coefs.to_vec(), scale, q)
    }

    fn build(coef_i16: Vec<i16>, coef_real: Vec<f64>, scale: f64, q: usize) -> DecimResult<Self> {
        let taps = coef_i16.len();
        if taps == 0 || taps % BLOCK_SIZE != 0 {
            return invalid(format!(
                "stage 1 tap count {} is not a non-zero multiple of {}",
                taps, BLOCK_SIZE
            ));
        }
        if q == 0 {
            return invalid("stage 1 decimation factor must be non-zero");
        }
        if let Some(c) = coef_i16
            .iter()
            .find(|&&c| (c as i32).abs() > INT16_MAX_COEFFICIENT)
        {
            return invalid(format!(
                "stage 1 coefficient {} exceeds +/-{}",
                c, INT16_MAX_COEFFICIENT
            ));
        }
        let sum_abs: i64 = coef_i16.iter().map(|&c| (c as i64).abs()).sum();
        if sum_abs << OUTPUT_SHL > MAX_STAGE1_OUTPUT {
            return Err(DecimError::Overflow(format!(
                "stage 1 magnitudes sum to {}; aligned output could reach {:#X} > {:#X}",
                sum_abs,
                sum_abs << OUTPUT_SHL,
                MAX_STAGE1_OUTPUT
            )));
        }

        let coef_bipolar: Vec<[i8; PLANES]> = coef_i16.iter().map(|&c| dual_decompose(c)).collect();
        let coef_binary: Vec<Vec<u8>> = (0..PLANES)
            .map(|k| {
                coef_bipolar
                    .iter()
                    .map(|row| ((1 - row[k] as i32) / 2) as u8)
                    .collect()
            })
            .collect();

        let blocks = taps / BLOCK_SIZE;
        let mut packed = Vec::with_capacity(PLANES * blocks * WORDS_PER_BLOCK);
        for plane in &coef_binary {
            for b in 0..blocks {
                let mut words = [0u32; WORDS_PER_BLOCK];
                pack_block(|i| plane[b * BLOCK_SIZE + i] as u32, &mut words);
                packed.extend_from_slice(&words);
            }
        }

        let tables = coef_i16
            .chunks(8)
            .map(|seg| {
                let mut tbl = Box::new([0i32; 256]);
                for (byte, slot) in tbl.iter_mut().enumerate() {
                    *slot = seg
                        .iter()
                        .enumerate()
                        .map(|(bit, &c)| {
                            if (byte >> bit) & 1 != 0 { -(c as i32) } else { c as i32 }
                        })
                        .sum();
                }
                tbl
            })
            .collect();

        debug!(
            "stage 1: {} taps ({} blocks), decimation {}, scale {}",
            taps, blocks, q, scale
        );
        Ok(Self {
            q,
            coef_real,
            scale,
            coef_i16,
            coef_bipolar,
            coef_binary,
            packed,
            tables,
        })
    }

    pub fn decimation_factor(&self) -> usize {
        self.q
    }

    pub fn tap_count(&self) -> usize {
        self.coef_i16.len()
    }

    pub fn block_count(&self) -> usize {
        self.tap_count() / BLOCK_SIZE
    }

    pub fn coef_i16(&self) -> &[i16] {
        &self.coef_i16
    }

    pub fn coef_real(&self) -> &[f64] {
        &self.coef_real
    }

    /// Factor taking the real coefficients to the int16 ones.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn coef_bipolar(&self) -> &[[i8; PLANES]] {
        &self.coef_bipolar
    }

    /// 16 bit-planes of T bits, {+1 -> 0, -1 -> 1}.
    pub fn coef_binary(&self) -> &[Vec<u8>] {
        &self.coef_binary
    }

    /// Packed coefficient words as consumed by the embedded decimator,
    /// T*16/32 words.
    pub fn to_packed_array(&self) -> &[u32] {
        &self.packed
    }

    pub fn output_len(&self, n: usize) -> usize {
        window_count(n, self.tap_count(), self.q)
    }

    fn windows<'a>(&self, x: &'a [i32]) -> impl Iterator<Item = &'a [i32]> + use<'a> {
        let (t, q) = (self.tap_count(), self.q);
        (0..window_count(x.len(), t, q)).map(move |k| &x[q * k..q * k + t])
    }

    /// Real-valued reference.
    pub fn filter_float(&self, x: &[i32]) -> Vec<f64> {
        self.windows(x)
            .map(|w| w.iter().zip(&self.coef_real).map(|(&s, &c)| s as f64 * c).sum())
            .collect()
    }

    /// Exact integer inner product with the int16 coefficients.
    pub fn filter_int16(&self, x: &[i32]) -> Vec<i32> {
        if self.q % 8 != 0 {
            return self
                .windows(x)
                .map(|w| w.iter().zip(&self.coef_i16).map(|(&s, &c)| s * c as i32).sum())
                .collect();
        }
        let bytes: Vec<u8> = x
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, &s)| acc | ((is_negative_bit(s) as u8) << i))
            })
            .collect();
        let step = self.q / 8;
        (0..self.output_len(x.len()))
            .map(|k| {
                let start = k * step;
                self.tables
                    .iter()
                    .enumerate()
                    .map(|(s, tbl)| tbl[bytes[start + s] as usize])
                    .sum()
            })
            .collect()
    }

    /// Per-plane correlation with the sign matrix, halved, then combined
    /// with the dual weights.
    pub fn filter_bipolar(&self, x: &[i32]) -> Vec<i32> {
        self.windows(x)
            .map(|w| {
                let mut d = [0i32; PLANES];
                for (&s, row) in w.iter().zip(&self.coef_bipolar) {
                    for (dk, &b) in d.iter_mut().zip(row.iter()) {
                        *dk += s * b as i32;
                    }
                }
                d.iter().zip(INT16_DUAL.iter()).map(|(&dk, &wk)| wk * (dk / 2)).sum()
            })
            .collect()
    }

    /// Emulates the correlate-and-reduce instruction: per bit-plane and
    /// 256-sample block, accumulate 128 - popcount(x ^ coef) over the
    /// packed words, then weight the planes with the dual vector.
    pub fn filter_hardware(&self, x: &[i32]) -> Vec<i32> {
        let blocks = self.block_count();
        self.windows(x)
            .map(|w| {
                let mut d = [0i32; PLANES];
                for b in 0..blocks {
                    let mut xw = [0u32; WORDS_PER_BLOCK];
                    let block = &w[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE];
                    pack_block(|i| is_negative_bit(block[i]), &mut xw);
                    for (plane, dk) in d.iter_mut().enumerate() {
                        let off = (plane * blocks + b) * WORDS_PER_BLOCK;
                        let coef = &self.packed[off..off + WORDS_PER_BLOCK];
                        let popcount: u32 =
                            xw.iter().zip(coef).map(|(a, c)| (a ^ c).count_ones()).sum();
                        *dk += 128 - popcount as i32;
                    }
                }
                d.iter().zip(INT16_DUAL.iter()).map(|(&dk, &wk)| wk * dk).sum()
            })
            .collect()
    }

    /// Device output: quantized inner product aligned up by 8 bits. Never
    /// leaves [-MAX_STAGE1_OUTPUT, MAX_STAGE1_OUTPUT].
    pub fn filter(&self, x: &[i32]) -> Vec<i32> {
        self.filter_int16(x)
            .into_iter()
            .map(|v| v << OUTPUT_SHL)
            .collect()
    }

    pub fn filter_signal(&self, signal: &PdmSignal) -> Vec<Vec<i32>> {
        signal.rows().iter().map(|row| self.filter(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_pdm(rng: &mut StdRng, n: usize) -> Vec<i32> {
        (0..n).map(|_| if rng.gen_bool(0.5) { 1 } else { -1 }).collect()
    }

    #[test]
    fn dual_round_trip_for_every_representable_value() {
        for c in -INT16_MAX_COEFFICIENT..=INT16_MAX_COEFFICIENT {
            let signs = dual_decompose(c as i16);
            assert!(signs.iter().all(|&s| s == 1 || s == -1));
            assert_eq!(dual_recombine(&signs), c, "c = {}", c);
        }
    }

    #[test]
    fn rejects_bad_tap_counts_and_ranges() {
        assert!(Stage1Filter::new(vec![1; 255], 32).is_err());
        assert!(Stage1Filter::new(vec![], 32).is_err());
        assert!(Stage1Filter::new(vec![1; 256], 0).is_err());
        let mut c = vec![0i16; 256];
        c[0] = 32767;
        assert!(Stage1Filter::new(c, 32).is_err());
        let mut r = vec![0.0; 256];
        r[3] = 1.5;
        assert!(Stage1Filter::from_real(&r, 32).is_err());
        assert!(Stage1Filter::from_real(&[0.0; 256], 32).is_err());
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut r = vec![0.5; 256];
            r[10] = bad;
            assert!(matches!(Stage1Filter::from_real(&r, 32), Err(DecimError::Validation(_))));
        }
    }

    #[test]
    fn binary_planes_match_bipolar_transpose() {
        let coefs: Vec<i16> = (0..256).map(|i| (i * 97 % 511 - 255) as i16 * 64).collect();
        let f = Stage1Filter::new(coefs, 32).unwrap();
        for (t, row) in f.coef_bipolar().iter().enumerate() {
            for k in 0..PLANES {
                let expect = if row[k] == 1 { 0 } else { 1 };
                assert_eq!(f.coef_binary()[k][t], expect);
            }
        }
    }

    #[test]
    fn packed_words_layout() {
        // Only tap 0 is negative: every plane whose sign is -1 for that tap
        // gets bit 0 of the last word of its chunk.
        let mut coefs = vec![0i16; 512];
        coefs[0] = -1;
        let f = Stage1Filter::new(coefs, 32).unwrap();
        let words = f.to_packed_array();
        assert_eq!(words.len(), 512 * 16 / 32);

        let zero = dual_decompose(0);
        let minus_one = dual_decompose(-1);
        for plane in 0..PLANES {
            let chunk = &words[plane * 2 * 8..plane * 2 * 8 + 8];
            let bg = if zero[plane] == -1 { u32::MAX } else { 0 };
            let tap0 = (minus_one[plane] == -1) as u32;
            assert_eq!(chunk[7], (bg & !1) | tap0, "plane {}", plane);
            assert!(chunk[..7].iter().all(|&w| w == bg));
        }
    }

    #[test]
    fn four_algorithms_agree() {
        let mut rng = StdRng::seed_from_u64(42);
        for taps in [256, 512] {
            // second block at a quarter level keeps the aligned output in range
            let real: Vec<f64> = (0..taps)
                .map(|i| rng.gen_range(-1.0..1.0) * if i < 256 { 1.0 } else { 0.25 })
                .collect();
            let f = Stage1Filter::from_real(&real, 32).unwrap();
            let x = random_pdm(&mut rng, taps + 32 * 20);

            let int16 = f.filter_int16(&x);
            assert_eq!(int16.len(), f.output_len(x.len()));
            assert_eq!(f.filter_bipolar(&x), int16);
            assert_eq!(f.filter_hardware(&x), int16);

            let float = f.filter_float(&x);
            let bound = 0.5 * taps as f64;
            for (a, &b) in float.iter().zip(&int16) {
                assert!((a * f.scale() - b as f64).abs() <= bound);
            }
        }
    }

    #[test]
    fn table_path_matches_direct_dot_for_unaligned_factor() {
        let mut rng = StdRng::seed_from_u64(7);
        let coefs: Vec<i16> = (0..256).map(|_| rng.gen_range(-32766..=32766)).collect();
        let aligned = Stage1Filter::new(coefs.clone(), 32).unwrap();
        let unaligned = Stage1Filter::new(coefs.clone(), 12).unwrap();
        let x = random_pdm(&mut rng, 256 + 32 * 12);
        let direct = |k: usize, q: usize| -> i32 {
            x[q * k..q * k + 256].iter().zip(&coefs).map(|(&s, &c)| s * c as i32).sum()
        };
        for (k, v) in aligned.filter_int16(&x).iter().enumerate() {
            assert_eq!(*v, direct(k, 32));
        }
        for (k, v) in unaligned.filter_int16(&x).iter().enumerate() {
            assert_eq!(*v, direct(k, 12));
        }
        assert_eq!(unaligned.filter_hardware(&x), unaligned.filter_int16(&x));
    }

    #[test]
    fn decimation_length_law() {
        let f = Stage1Filter::new(vec![1; 256], 32).unwrap();
        for n in [0, 255, 256, 287, 288, 1024, 4096 + 31] {
            let x = vec![1; n];
            let expect = (n / 32).saturating_sub((256 - 32) / 32);
            assert_eq!(f.filter_int16(&x).len(), expect, "n = {}", n);
            assert_eq!(f.filter_hardware(&x).len(), expect);
        }
    }

    #[test]
    fn pure_delay_outputs_last_sample() {
        let mut real = vec![0.0; 256];
        real[255] = 1.0;
        let f = Stage1Filter::from_real(&real, 32).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..4 {
            let x = random_pdm(&mut rng, 256);
            let y = f.filter_int16(&x);
            assert_eq!(y, vec![x[255] * INT16_MAX_COEFFICIENT]);
            assert_eq!(f.filter_hardware(&x), y);
            assert_eq!(f.filter(&x), vec![(x[255] * INT16_MAX_COEFFICIENT) << 8]);
        }
    }

    #[test]
    fn oversized_multi_block_sum_is_rejected() {
        let full = Stage1Filter::new(vec![INT16_MAX_COEFFICIENT as i16; 512], 32);
        assert!(matches!(full, Err(DecimError::Overflow(_))));

        // exactly at the limit: 0x7FFFFF = 256 * 32766 + 511
        let mut c = vec![0i16; 512];
        c[..256].fill(INT16_MAX_COEFFICIENT as i16);
        c[256] = 511;
        let f = Stage1Filter::new(c.clone(), 32).unwrap();
        assert_eq!(f.filter(&vec![1; 512]), vec![MAX_STAGE1_OUTPUT as i32]);
        assert_eq!(f.filter(&vec![-1; 512]), vec![-(MAX_STAGE1_OUTPUT as i32)]);
        c[257] = 1;
        assert!(matches!(Stage1Filter::new(c, 32), Err(DecimError::Overflow(_))));
    }

    #[test]
    fn full_scale_single_block_fits_stage2_input_range() {
        let f = Stage1Filter::new(vec![INT16_MAX_COEFFICIENT as i16; 256], 32).unwrap();
        let y = f.filter(&vec![1; 256]);
        assert!(y[0] as i64 <= MAX_STAGE1_OUTPUT);
        assert!(y[0] > 0);
    }
}
