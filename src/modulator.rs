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


/// Fifth-order noise-shaping delta-sigma modulator turning an oversampled
/// real-valued signal into a +1/-1 bit-stream.
///
/// Five cascaded integrators with two resonator feedback taps and a
/// feed-forward weighted sum feeding a one-bit quantizer.
#[derive(Clone, Debug)]
pub struct DeltaSigmaModulator {
    state: [f64; 5],
    last: i32,
}

// Feed-forward weights applied to the integrator states
const FEED_FORWARD: [f64; 5] = [0.791882, 0.304545, 0.069930, 0.009496, 0.000607];
// Resonator feedback (g0 around integrators 1/2, g1 around 3/4)
const RESONATOR: [f64; 2] = [0.000496, 0.001789];

impl Default for DeltaSigmaModulator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaSigmaModulator {
    pub fn new() -> Self {
        Self {
            state: [0.0; 5],
            // The stream is seeded with a +1 before the first update
            last: 1,
        }
    }

    /// Advance the loop by one input sample and return the quantized bit.
    #[inline]
    pub fn process_samp(&mut self, x: f64) -> i32 {
        let s = &mut self.state;
        s[4] += s[3];
        s[3] += s[2] - RESONATOR[1] * s[4];
        s[2] += s[1];
        s[1] += s[0] - RESONATOR[0] * s[2];
        s[0] += x - self.last as f64;

        let v: f64 = FEED_FORWARD.iter().zip(s.iter()).map(|(c, v)| c * v).sum();
        self.last = if v < 0.0 { -1 } else { 1 };
        self.last
    }

    /// Modulate a whole buffer. Output sample 0 is always +1; sample `i`
    /// reflects inputs `1..=i`.
    pub fn modulate(&mut self, x: &[f64]) -> Vec<i32> {
        let mut out = Vec::with_capacity(x.len());
        if x.is_empty() {
            return out;
        }
        out.push(self.last);
        for &xi in &x[1..] {
            out.push(self.process_samp(xi));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_bipolar_and_starts_high() {
        let x: Vec<f64> = (0..4096).map(|n| 0.5 * (n as f64 * 0.01).sin()).collect();
        let y = DeltaSigmaModulator::new().modulate(&x);
        assert_eq!(y.len(), x.len());
        assert_eq!(y[0], 1);
        assert!(y.iter().all(|&v| v == 1 || v == -1));
    }

    #[test]
    fn density_tracks_a_constant_input() {
        let x = vec![0.25; 64 * 1024];
        let y = DeltaSigmaModulator::new().modulate(&x);
        let tail = &y[1024..];
        let mean = tail.iter().map(|&v| v as f64).sum::<f64>() / tail.len() as f64;
        assert!((mean - 0.25).abs() < 0.01, "mean {}", mean);
    }

    #[test]
    fn zero_input_balances() {
        let y = DeltaSigmaModulator::new().modulate(&vec![0.0; 32 * 1024]);
        let sum: i64 = y.iter().map(|&v| v as i64).sum();
        assert!(sum.abs() < 64, "sum {}", sum);
    }
}
