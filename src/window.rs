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


//! Symmetric window functions for FIR synthesis and spectral analysis.

use std::f64::consts::PI;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    Rectangular,
    Hamming,
    Hann,
    Blackman,
    /// 4-term, -92 dB sidelobes; used by the THD+N measurement.
    BlackmanHarris,
    /// Kaiser window with shape parameter beta.
    Kaiser(f64),
}

impl Default for Window {
    fn default() -> Self {
        Window::Kaiser(5.0)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::Rectangular => write!(f, "rectangular"),
            Window::Hamming => write!(f, "hamming"),
            Window::Hann => write!(f, "hann"),
            Window::Blackman => write!(f, "blackman"),
            Window::BlackmanHarris => write!(f, "blackman-harris"),
            Window::Kaiser(beta) => write!(f, "kaiser({})", beta),
        }
    }
}

impl Window {
    /// Symmetric window of `length` samples (first and last sample equal).
    pub fn generate(&self, length: usize) -> Vec<f64> {
        match length {
            0 => return vec![],
            1 => return vec![1.0],
            _ => {}
        }
        let m = (length - 1) as f64;
        match *self {
            Window::Rectangular => vec![1.0; length],
            Window::Hamming => cosine_sum(length, &[0.54, 0.46]),
            Window::Hann => cosine_sum(length, &[0.5, 0.5]),
            Window::Blackman => cosine_sum(length, &[0.42, 0.5, 0.08]),
            Window::BlackmanHarris => {
                cosine_sum(length, &[0.35875, 0.48829, 0.14128, 0.01168])
            }
            Window::Kaiser(beta) => {
                let i0_beta = bessel_i0(beta);
                (0..length)
                    .map(|n| {
                        let x = 2.0 * n as f64 / m - 1.0;
                        bessel_i0(beta * (1.0 - x * x).max(0.0).sqrt()) / i0_beta
                    })
                    .collect()
            }
        }
    }
}

// a0 - a1 cos(x) + a2 cos(2x) - a3 cos(3x) ...
fn cosine_sum(length: usize, a: &[f64]) -> Vec<f64> {
    let m = (length - 1) as f64;
    (0..length)
        .map(|n| {
            let x = 2.0 * PI * n as f64 / m;
            a.iter()
                .enumerate()
                .map(|(k, &ak)| {
                    let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                    sign * ak * (k as f64 * x).cos()
                })
                .sum()
        })
        .collect()
}

/// Modified Bessel function of the first kind, order 0 (power series).
pub fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let x_sq_over_4 = x * x / 4.0;
    for k in 1..=200 {
        term *= x_sq_over_4 / (k * k) as f64;
        sum += term;
        if term < sum * 1e-17 {
            break;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bessel_reference_values() {
        assert_eq!(bessel_i0(0.0), 1.0);
        assert!((bessel_i0(1.0) - 1.266_065_877_752_008_4).abs() < 1e-14);
        assert!((bessel_i0(5.0) - 27.239_871_823_604_45).abs() < 1e-10);
    }

    #[test]
    fn kaiser_zero_beta_is_rectangular() {
        let w = Window::Kaiser(0.0).generate(9);
        assert!(w.iter().all(|&v| (v - 1.0).abs() < 1e-15));
    }

    #[test]
    fn windows_are_symmetric_and_peak_at_centre() {
        for win in [
            Window::Hamming,
            Window::Hann,
            Window::Blackman,
            Window::BlackmanHarris,
            Window::Kaiser(8.0),
        ] {
            let w = win.generate(33);
            for i in 0..16 {
                assert!((w[i] - w[32 - i]).abs() < 1e-12, "{}", win);
            }
            assert!((w[16] - 1.0).abs() < 1e-9, "{} centre {}", win, w[16]);
        }
    }

    #[test]
    fn hann_endpoints_are_zero() {
        let w = Window::Hann.generate(16);
        assert!(w[0].abs() < 1e-15 && w[15].abs() < 1e-15);
    }

    #[test]
    fn degenerate_lengths() {
        assert!(Window::Hamming.generate(0).is_empty());
        assert_eq!(Window::Kaiser(3.0).generate(1), vec![1.0]);
    }
}
