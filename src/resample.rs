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


// ====================================================================================
// Polyphase L/M resampler used to lift synthesized PCM tones to the PDM rate
// before delta-sigma modulation.
//   - prototype low-pass: windowed sinc, cutoff 1/max(L, M), Kaiser(5.0)
//   - half length 10 * max(L, M) taps either side of the centre
//   - sub-filter r holds the prototype taps whose index m satisfies m % L == r
// Whole-buffer only; the zero-stuffed samples are never materialised.
// ====================================================================================

use crate::model::{DecimResult, invalid};
use crate::window::Window;

const RESAMPLE_KAISER_BETA: f64 = 5.0;
const HALF_LEN_PER_RATE: usize = 10;

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Reduced (up, down) ratio taking `input_rate` to `output_rate`.
pub fn up_down_ratio(input_rate: u32, output_rate: u32) -> DecimResult<(usize, usize)> {
    if input_rate == 0 || output_rate == 0 {
        return invalid("sample rates must be non-zero");
    }
    let d = gcd(input_rate as u64, output_rate as u64);
    Ok(((output_rate as u64 / d) as usize, (input_rate as u64 / d) as usize))
}

#[inline]
fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Windowed-sinc low-pass with `cutoff` relative to Nyquist, scaled to
/// unit gain at DC.
pub fn firwin(numtaps: usize, cutoff: f64, window: &Window) -> DecimResult<Vec<f64>> {
    if numtaps == 0 {
        return invalid("firwin needs at least one tap");
    }
    if !(cutoff > 0.0 && cutoff < 1.0) {
        return invalid(format!("firwin cutoff {} outside (0, 1)", cutoff));
    }
    let alpha = 0.5 * (numtaps as f64 - 1.0);
    let win = window.generate(numtaps);
    let mut h: Vec<f64> = (0..numtaps)
        .map(|i| cutoff * sinc(cutoff * (i as f64 - alpha)) * win[i])
        .collect();
    let sum: f64 = h.iter().sum();
    h.iter_mut().for_each(|v| *v /= sum);
    Ok(h)
}

pub struct PolyphaseResampler {
    // sub[r] = prototype taps at indices r, r + L, r + 2L, ...
    sub: Vec<Vec<f64>>,
    up: usize,
    down: usize,
    half_len: usize,
}

impl PolyphaseResampler {
    pub fn new(up: usize, down: usize) -> DecimResult<Self> {
        if up == 0 || down == 0 {
            return invalid("resampling factors must be non-zero");
        }
        let max_rate = up.max(down);
        let half_len = HALF_LEN_PER_RATE * max_rate;
        let proto = firwin(
            2 * half_len + 1,
            1.0 / max_rate as f64,
            &Window::Kaiser(RESAMPLE_KAISER_BETA),
        )?;

        // Split the (gain-compensated) prototype into L branches
        let mut sub = vec![Vec::new(); up];
        for (i, &c) in proto.iter().enumerate() {
            sub[i % up].push(c * up as f64);
        }
        Ok(Self {
            sub,
            up,
            down,
            half_len,
        })
    }

    pub fn output_len(&self, input_len: usize) -> usize {
        (input_len * self.up).div_ceil(self.down)
    }

    /// y[m] = sum_k x[k] * h[m*M + half_len - k*L]
    pub fn process(&self, x: &[f64]) -> Vec<f64> {
        if x.is_empty() {
            return Vec::new();
        }
        let n_out = self.output_len(x.len());
        let mut out = Vec::with_capacity(n_out);
        for m in 0..n_out {
            // Position of output m on the zero-stuffed, filter-delayed grid
            let j = m * self.down + self.half_len;
            let phase = j % self.up;
            let base = j / self.up;
            let taps = &self.sub[phase];
            let mut acc = 0.0;
            // taps[i] pairs with x[base - i]
            let first = base.saturating_sub(x.len() - 1);
            let last = base.min(taps.len().saturating_sub(1));
            if first > last {
                out.push(0.0);
                continue;
            }
            for i in first..=last {
                acc += taps[i] * x[base - i];
            }
            out.push(acc);
        }
        out
    }
}

/// One-shot rational resampling by `up / down`.
pub fn resample_poly(x: &[f64], up: usize, down: usize) -> DecimResult<Vec<f64>> {
    let d = gcd(up as u64, down as u64).max(1) as usize;
    let resampler = PolyphaseResampler::new(up / d, down / d)?;
    Ok(resampler.process(x))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_is_reduced() {
        assert_eq!(up_down_ratio(16_000, 3_072_000).unwrap(), (192, 1));
        assert_eq!(up_down_ratio(48_000, 3_072_000).unwrap(), (64, 1));
        assert_eq!(up_down_ratio(44_100, 48_000).unwrap(), (160, 147));
        assert!(up_down_ratio(0, 48_000).is_err());
    }

    #[test]
    fn firwin_has_unit_dc_gain_and_symmetry() {
        let h = firwin(41, 0.25, &Window::Kaiser(5.0)).unwrap();
        let dc: f64 = h.iter().sum();
        assert!((dc - 1.0).abs() < 1e-12);
        for i in 0..h.len() / 2 {
            assert!((h[i] - h[h.len() - 1 - i]).abs() < 1e-15);
        }
    }

    #[test]
    fn polyphase_matches_direct_zero_stuffed_convolution() {
        let up = 3;
        let down = 2;
        let x: Vec<f64> = (0..40).map(|n| ((n * 7 % 11) as f64 - 5.0) / 5.0).collect();
        let y = resample_poly(&x, up, down).unwrap();
        assert_eq!(y.len(), (x.len() * up).div_ceil(down));

        // Reference: explicit zero stuffing then filtering
        let half_len = 10 * up.max(down);
        let h: Vec<f64> = firwin(2 * half_len + 1, 1.0 / up.max(down) as f64, &Window::Kaiser(5.0))
            .unwrap()
            .iter()
            .map(|v| v * up as f64)
            .collect();
        for (m, &ym) in y.iter().enumerate() {
            let mut acc = 0.0;
            for (k, &xk) in x.iter().enumerate() {
                let idx = (m * down + half_len) as isize - (k * up) as isize;
                if idx >= 0 && (idx as usize) < h.len() {
                    acc += xk * h[idx as usize];
                }
            }
            assert!((acc - ym).abs() < 1e-12, "m={} {} vs {}", m, acc, ym);
        }
    }

    #[test]
    fn upsampled_tone_keeps_its_amplitude() {
        let fs = 16_000.0;
        let x: Vec<f64> = (0..400)
            .map(|n| 0.5 * (2.0 * std::f64::consts::PI * 1000.0 * n as f64 / fs).sin())
            .collect();
        let y = resample_poly(&x, 8, 1).unwrap();
        // Away from the edges the interpolated tone tracks the analytic one
        for m in 800..2400 {
            let t = m as f64 / (8.0 * fs);
            let expect = 0.5 * (2.0 * std::f64::consts::PI * 1000.0 * t).sin();
            assert!((y[m] - expect).abs() < 5e-3, "m={}", m);
        }
    }
}
