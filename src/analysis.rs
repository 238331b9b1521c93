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


//! THD+N of a decimated tone.
//!
//! The fundamental is the peak of a Blackman-Harris windowed spectrum,
//! widened out to the nearest local minimum on each side. Everything else
//! counts as distortion plus noise.

use std::ops::Range;

use log::debug;
use rustfft::FftPlanner;
use num_complex::Complex64;

use crate::model::{DecimResult, invalid};
use crate::window::Window;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThdnReport {
    pub fundamental_hz: f64,
    pub thdn_db: f64,
}

/// Measure THD+N of `samples` captured at `fs`.
pub fn thdn(samples: &[f64], fs: f64) -> DecimResult<ThdnReport> {
    let n = samples.len();
    if n < 8 {
        return invalid(format!("THD+N needs at least 8 samples, got {}", n));
    }
    let mean = samples.iter().sum::<f64>() / n as f64;
    let window = Window::BlackmanHarris.generate(n);
    let mut spectrum: Vec<Complex64> = samples
        .iter()
        .zip(&window)
        .map(|(&s, &w)| Complex64::new((s - mean) * w, 0.0))
        .collect();
    FftPlanner::<f64>::new()
        .plan_fft_forward(n)
        .process(&mut spectrum);

    let bins = n / 2 + 1;
    let mag: Vec<f64> = spectrum[..bins].iter().map(|c| c.norm()).collect();
    // single-sided energy: DC and Nyquist appear once, every other bin twice
    let weight = |k: usize| {
        if k == 0 || (n % 2 == 0 && k == n / 2) {
            1.0
        } else {
            2.0
        }
    };
    let total: f64 = (0..bins).map(|k| weight(k) * mag[k] * mag[k]).sum();
    if total == 0.0 {
        return invalid("THD+N of a silent signal is undefined");
    }

    let peak = (0..bins).fold(0, |best, k| if mag[k] > mag[best] { k } else { best });
    let notch = fundamental_bins(&mag, peak);

    let noise: f64 = (0..bins)
        .filter(|k| !notch.contains(k))
        .map(|k| weight(k) * mag[k] * mag[k])
        .sum();
    let report = ThdnReport {
        fundamental_hz: peak as f64 * fs / n as f64,
        thdn_db: 10.0 * (noise / total).log10(),
    };
    debug!(
        "THD+N: peak bin {} ({:.1} Hz), fundamental bins {}..{}, {:.1} dB",
        peak, report.fundamental_hz, notch.start, notch.end, report.thdn_db
    );
    Ok(report)
}

// Bins strictly between the nearest local minima on either side of `peak`.
// Both minima count as noise.
fn fundamental_bins(mag: &[f64], peak: usize) -> Range<usize> {
    let mut upper = peak + 1;
    while upper + 1 < mag.len() && mag[upper + 1] < mag[upper] {
        upper += 1;
    }
    let mut lower = peak.saturating_sub(1);
    while lower > 0 && mag[lower - 1] < mag[lower] {
        lower -= 1;
    }
    (lower + 1).min(peak)..upper
}

/// THD+N of full-scale 32-bit PCM.
pub fn thdn_i32(samples: &[i32], fs: f64) -> DecimResult<ThdnReport> {
    let scaled: Vec<f64> = samples.iter().map(|&s| s as f64 / i32::MAX as f64).collect();
    thdn(&scaled, fs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Preset;
    use crate::signal::{DEFAULT_PDM_RATE, PdmSignal, SineSpec};
    use std::f64::consts::PI;

    fn tone(n: usize, f: f64, fs: f64) -> Vec<f64> {
        (0..n).map(|i| 0.5 * (2.0 * PI * f * i as f64 / fs).sin()).collect()
    }

    #[test]
    fn notch_stops_short_of_the_minima() {
        let mag = [5.0, 3.0, 1.0, 2.0, 6.0, 9.0, 4.0, 2.0, 3.0, 1.0];
        assert_eq!(fundamental_bins(&mag, 5), 3..7);
        // peak next to a minimum on the low side, or at DC
        assert_eq!(fundamental_bins(&[1.0, 4.0, 2.0, 3.0], 1), 1..2);
        assert_eq!(fundamental_bins(&[4.0, 2.0, 1.0, 3.0], 0), 0..2);
    }

    #[test]
    fn pure_tone_is_clean() {
        let report = thdn(&tone(4096, 1000.0, 16000.0), 16000.0).unwrap();
        assert!((report.fundamental_hz - 1000.0).abs() < 16000.0 / 4096.0);
        assert!(report.thdn_db < -120.0, "{}", report.thdn_db);
    }

    #[test]
    fn harmonic_sets_the_level() {
        // third harmonic at -60 dB relative to the fundamental
        let fs = 16000.0;
        let x: Vec<f64> = tone(4096, 1000.0, fs)
            .iter()
            .zip(tone(4096, 3000.0, fs))
            .map(|(a, b)| a + b * 1e-3)
            .collect();
        let report = thdn(&x, fs).unwrap();
        assert!((report.thdn_db + 60.0).abs() < 0.5, "{}", report.thdn_db);
    }

    #[test]
    fn rejects_short_or_silent_input() {
        assert!(thdn(&[0.0; 4], 16000.0).is_err());
        assert!(thdn(&[0.25; 64], 16000.0).is_err());
    }

    #[test]
    fn small_2_stage_chain_decimates_a_clean_tone() {
        let chain = Preset::Small2Stage
            .design()
            .unwrap()
            .coefficients
            .into_chain()
            .unwrap();
        let spec = SineSpec {
            frequencies: vec![1000.0],
            amplitudes: vec![0.5],
            pcm_rate: 16_000,
            duration: 0.15,
            pdm_rate: DEFAULT_PDM_RATE,
        };
        let signal = PdmSignal::sine(&spec).unwrap();
        let out = chain.filter(&signal);
        assert_eq!(out[0].len(), chain.output_len(signal.len()));
        assert_eq!(out[0].len(), 2388);

        let report = thdn_i32(&out[0][256..256 + 2048], 16000.0).unwrap();
        assert!((report.fundamental_hz - 1000.0).abs() < 10.0);
        assert!(report.thdn_db < -100.0, "THD+N {:.1} dB", report.thdn_db);
    }
}
