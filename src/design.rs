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


//! Filter designer for the decimation chain.
//!
//! Stage 1 is a cascade of moving averages quantized to 16 bits. Stage 2
//! (and stage 3) are windowed frequency-sampling FIRs whose pass band
//! inverts the droop of every stage before them. Designs are plain
//! functions of a [`DesignSpec`]; nothing is cached between calls.

use std::f64::consts::PI;
use std::fmt;

use clap::ValueEnum;
use log::{debug, info, trace};
use num_complex::Complex64;
use pm_remez::{BandSetting, PMDesign, constant, linear, pm_parameters, pm_remez};
use rustfft::FftPlanner;

use crate::coefficients::{CoefficientSet, StageCoefficients};
use crate::model::{DecimError, DecimResult, QuantizationWarning, invalid};
use crate::stage1::INT16_MAX_COEFFICIENT;
use crate::window::Window;

/// Default PDM input rate of the presets.
pub const PRESET_PDM_RATE: f64 = 3_072_000.0;
/// Frequency points per unit decimation used for compensation curves.
pub const FREQZ_POINTS_PER_DECIMATION: usize = 1024;
/// Largest coefficient sum a stage 1 filter may have.
pub const STAGE1_SUM_LIMIT: f64 = 2_147_483_648.0;
/// Largest absolute coefficient sum a stage 2/3 filter may have.
pub const INT32_SUM_LIMIT: f64 = 1_099_511_627_776.0;

const STOPBAND_GRID_POINTS: usize = 1024;
const KAISER_BETA_STEP: f64 = 0.5;
const KAISER_BETA_MAX: f64 = 14.0;
const SCALE_SEARCH_STEPS: usize = 32;
const ALIAS_BAND_POINTS: usize = 16;
const REMEZ_WEIGHT_MAX: f64 = 1024.0;
const REMEZ_BISECTIONS: usize = 40;
/// Stop-band target of an equiripple stage that sets none.
pub const DEFAULT_EQUIRIPPLE_ATTEN_DB: f64 = 65.0;
/// Largest pass-band deviation an equiripple design may trade for stop
/// band.
pub const MAX_PASSBAND_DEVIATION: f64 = 0.1;

/// How a FIR stage's coefficients are synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FirMethod {
    /// Frequency sampling through [`firwin2`] with the stage window.
    #[default]
    Windowed,
    /// Parks-McClellan with a bisected pass-band weight.
    Equiripple,
}

/// Cutoff, transition width, tap budget and window for one FIR stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub cutoff: f64,
    /// The transition runs from `cutoff - bw/2` to `cutoff + bw/2`.
    pub transition_bw: f64,
    pub taps: usize,
    pub window: Window,
    /// When set, the stage must reach this stop-band attenuation.
    pub min_stopband_atten_db: Option<f64>,
    pub method: FirMethod,
}

impl StageSpec {
    pub fn new(cutoff: f64, transition_bw: f64, taps: usize, window: Window) -> Self {
        Self {
            cutoff,
            transition_bw,
            taps,
            window,
            min_stopband_atten_db: None,
            method: FirMethod::Windowed,
        }
    }

    pub fn with_min_attenuation(mut self, db: f64) -> Self {
        self.min_stopband_atten_db = Some(db);
        self
    }

    pub fn with_method(mut self, method: FirMethod) -> Self {
        self.method = method;
        self
    }

    fn validate(&self, fs: f64) -> DecimResult<()> {
        if self.taps == 0 {
            return invalid("FIR stage needs at least one tap");
        }
        if !(self.cutoff > 0.0) || self.transition_bw < 0.0 {
            return invalid(format!("bad cutoff/transition in stage [{}]", self));
        }
        if self.cutoff - self.transition_bw / 2.0 <= 0.0
            || self.cutoff + self.transition_bw / 2.0 >= fs / 2.0
        {
            return invalid(format!(
                "transition band of stage [{}] does not fit below {} Hz",
                self,
                fs / 2.0
            ));
        }
        if self.method == FirMethod::Equiripple && (self.transition_bw == 0.0 || self.taps < 3) {
            return invalid(format!(
                "equiripple stage [{}] needs a transition band and at least 3 taps",
                self
            ));
        }
        Ok(())
    }
}

impl fmt::Display for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} taps, cutoff {} Hz, transition {} Hz, ",
            self.taps, self.cutoff, self.transition_bw
        )?;
        match self.method {
            FirMethod::Windowed => write!(f, "{} window", self.window)?,
            FirMethod::Equiripple => write!(f, "equiripple")?,
        }
        if let Some(db) = self.min_stopband_atten_db {
            write!(f, ", stop band >= {} dB", db)?;
        }
        Ok(())
    }
}

/// How the moving-average stage is brought into 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MaScaling {
    /// Staged scale-and-round between the cascaded convolutions.
    #[default]
    Heuristic,
    /// Global scale and rounding mode chosen by [`search_ma_scaling`].
    Search,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesignSpec {
    pub fs0: f64,
    pub decimations: Vec<u32>,
    pub ma_stages: u32,
    pub stage2: StageSpec,
    pub stage3: Option<StageSpec>,
    /// Emit 16-bit stage 1 and 32-bit stage 2/3 values instead of reals.
    pub int_coeffs: bool,
    pub ma_scaling: MaScaling,
    /// Flatten the stage 1 droop in the stage 2 pass band (2-stage only).
    pub compensate_stage1: bool,
}

impl DesignSpec {
    pub fn two_stage(fs0: f64, decimations: [u32; 2], ma_stages: u32, stage2: StageSpec) -> Self {
        Self {
            fs0,
            decimations: decimations.to_vec(),
            ma_stages,
            stage2,
            stage3: None,
            int_coeffs: true,
            ma_scaling: MaScaling::default(),
            compensate_stage1: true,
        }
    }

    pub fn three_stage(
        fs0: f64,
        decimations: [u32; 3],
        ma_stages: u32,
        stage2: StageSpec,
        stage3: StageSpec,
    ) -> Self {
        Self {
            fs0,
            decimations: decimations.to_vec(),
            ma_stages,
            stage2,
            stage3: Some(stage3),
            int_coeffs: true,
            ma_scaling: MaScaling::default(),
            compensate_stage1: true,
        }
    }

    /// Sample rate at the input of every stage, plus the final output rate.
    pub fn stage_rates(&self) -> Vec<f64> {
        let mut rates = vec![self.fs0];
        for &q in &self.decimations {
            let last = rates[rates.len() - 1];
            rates.push(last / q as f64);
        }
        rates
    }

    fn validate(&self, stages: usize) -> DecimResult<()> {
        if self.decimations.len() != stages {
            return invalid(format!(
                "{}-stage design needs {} decimation factors, got {}",
                stages,
                stages,
                self.decimations.len()
            ));
        }
        if self.decimations.contains(&0) {
            return invalid("decimation factors must be non-zero");
        }
        if !(self.fs0 > 0.0) {
            return invalid("input sample rate must be positive");
        }
        if self.ma_stages == 0 {
            return invalid("stage 1 needs at least one moving-average section");
        }
        Ok(())
    }
}

/// Which way a scaled coefficient is taken to an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Ceil,
    Floor,
    Round,
}

impl Rounding {
    pub const ALL: [Rounding; 3] = [Rounding::Ceil, Rounding::Floor, Rounding::Round];

    fn apply(self, v: f64) -> f64 {
        match self {
            Rounding::Ceil => v.ceil(),
            Rounding::Floor => v.floor(),
            Rounding::Round => v.round_ties_even(),
        }
    }
}

/// One point of the moving-average scaling search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleCandidate {
    pub coefs: Vec<i64>,
    pub scale: f64,
    pub rounding: Rounding,
    pub alias_energy: f64,
}

/// What actually produced a FIR stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Synthesis {
    Windowed(Window),
    Equiripple { passband_weight: f64 },
}

impl fmt::Display for Synthesis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Synthesis::Windowed(window) => write!(f, "{} window", window),
            Synthesis::Equiripple { passband_weight } => {
                write!(f, "equiripple, pass-band weight {:.4}", passband_weight)
            }
        }
    }
}

/// Stop-band outcome of one FIR stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub synthesis: Synthesis,
    pub stopband_atten_db: f64,
}

/// Output of the designer: the persisted coefficient set plus what was
/// learned on the way.
#[derive(Debug, Clone)]
pub struct Design {
    pub coefficients: CoefficientSet,
    pub warnings: Vec<QuantizationWarning>,
    /// One entry per FIR stage (stage 2, then stage 3).
    pub reports: Vec<StageReport>,
}

// full convolution of two vectors
pub fn convolve(x: &[f64], y: &[f64]) -> Vec<f64> {
    if x.is_empty() || y.is_empty() {
        return vec![];
    }
    let n = x.len();
    let m = y.len();
    (0..n + m - 1)
        .map(|j| {
            let a = if j >= m { j - m + 1 } else { 0 };
            let b = j.min(n - 1);
            let c = if j >= n { j - n + 1 } else { 0 };
            let d = j.min(m - 1);
            x[a..=b]
                .iter()
                .zip(y[c..=d].iter().rev())
                .map(|(&u, &v)| u * v)
                .sum::<f64>()
        })
        .collect()
}

fn zero_pack(x: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![0.0; x.len() * n];
    for (dst, &src) in out.iter_mut().step_by(n).zip(x) {
        *dst = src;
    }
    out
}

fn box_cascade(len: usize, value: f64, n_stages: u32) -> Vec<f64> {
    let kernel = vec![value; len];
    let mut b = kernel.clone();
    for _ in 1..n_stages {
        b = convolve(&b, &kernel);
    }
    b
}

/// `n_stages` cascaded length-`q` moving averages, unit gain at DC.
pub fn moving_average_filter(q: usize, n_stages: u32) -> DecimResult<Vec<f64>> {
    if q == 0 || n_stages == 0 {
        return invalid("moving average needs a non-zero length and stage count");
    }
    Ok(box_cascade(q, 1.0 / q as f64, n_stages))
}

// Raw integer cascade, exact in f64 as long as q^n stays below 2^53.
fn raw_ma(q: usize, n_stages: u32) -> DecimResult<Vec<f64>> {
    if q == 0 || n_stages == 0 {
        return invalid("moving average needs a non-zero length and stage count");
    }
    if (q as f64).powi(n_stages as i32) >= 9_007_199_254_740_992.0 {
        return invalid(format!(
            "{} cascaded moving averages of length {} overflow the coefficient range",
            n_stages, q
        ));
    }
    Ok(box_cascade(q, 1.0, n_stages))
}

fn round_scaled(b: &[f64], divisor: f64) -> Vec<f64> {
    b.iter().map(|v| (v / divisor).round_ties_even()).collect()
}

// Scale and round between the cascaded convolutions, starting and ending
// with a double moving average. The headroom left below 32767 covers the
// growth that rounding adds; the n = 7, 8 values are tuned by hand.
fn heuristic_ma_scaling(q: usize, n_stages: u32, raw: &[f64]) -> Option<Vec<f64>> {
    let rounding_stages = n_stages as i32 - 3;
    if rounding_stages < 1 {
        return None;
    }
    let len = raw.len() as f64;
    let max_value = match n_stages {
        0..=5 => 32767.0,
        7 | 8 => 32767.0 - 7.0 * len,
        n => 32767.0 - len * n as f64,
    };
    let max = raw.iter().cloned().fold(0.0, f64::max);
    let stage_scaling = (max / max_value).powf(1.0 / rounding_stages as f64);
    trace!(
        "moving average: {} rounding stages, per-stage scale {}",
        rounding_stages, stage_scaling
    );

    let kernel = vec![1.0; q];
    let kernel_kernel = convolve(&kernel, &kernel);
    let mut b = kernel_kernel.clone();
    for _ in 0..rounding_stages - 1 {
        b = convolve(&round_scaled(&b, stage_scaling), &kernel);
    }
    Some(convolve(&round_scaled(&b, stage_scaling), &kernel_kernel))
}

// H(e^{jw}) by Horner's rule in z^-1.
fn response_at(b: &[f64], w: f64) -> Complex64 {
    let z_inv = Complex64::from_polar(1.0, -w);
    b.iter()
        .rev()
        .fold(Complex64::new(0.0, 0.0), |acc, &c| acc * z_inv + c)
}

// Frequencies, in cycles per input sample, that land inside the lower
// quarter of the output band after decimating by q.
fn alias_grid(q: usize) -> Vec<f64> {
    let half_width = 1.0 / (4.0 * q as f64);
    (1..=q / 2)
        .flat_map(|k| {
            let centre = k as f64 / q as f64;
            (0..ALIAS_BAND_POINTS).map(move |i| {
                let t = i as f64 / (ALIAS_BAND_POINTS - 1) as f64;
                (centre - half_width + 2.0 * half_width * t).min(0.5)
            })
        })
        .collect()
}

/// Error energy of the normalised `quantized` response against the
/// normalised `exact` response over the bands that fold onto the pass band
/// after decimation by `q`.
pub fn alias_energy(exact: &[f64], quantized: &[f64], q: usize) -> f64 {
    let exact_sum: f64 = exact.iter().sum();
    let quant_sum: f64 = quantized.iter().sum();
    if exact_sum == 0.0 || quant_sum == 0.0 {
        return f64::INFINITY;
    }
    alias_grid(q)
        .into_iter()
        .map(|f| {
            let w = 2.0 * PI * f;
            let he = response_at(exact, w) / exact_sum;
            let hq = response_at(quantized, w) / quant_sum;
            (hq - he).norm_sqr()
        })
        .sum()
}

/// Search global scales and rounding modes for the 16-bit moving average
/// that leaks the least aliasing error into the pass band.
///
/// Scales run from `32766 / max` down to half of that. The plain
/// truncation at full scale is one of the candidates, so the result is
/// never worse than truncating.
pub fn search_ma_scaling(q: usize, n_stages: u32) -> DecimResult<ScaleCandidate> {
    let raw = raw_ma(q, n_stages)?;
    let max = raw.iter().cloned().fold(0.0, f64::max);
    let base = INT16_MAX_COEFFICIENT as f64 / max;

    let mut best: Option<ScaleCandidate> = None;
    for step in 0..=SCALE_SEARCH_STEPS {
        let scale = base * (1.0 - 0.5 * step as f64 / SCALE_SEARCH_STEPS as f64);
        for rounding in Rounding::ALL {
            let quantized: Vec<f64> = raw.iter().map(|&v| rounding.apply(v * scale)).collect();
            let q_max = quantized.iter().cloned().fold(0.0, f64::max);
            if q_max > INT16_MAX_COEFFICIENT as f64 || q_max <= 0.0 {
                continue;
            }
            let energy = alias_energy(&raw, &quantized, q);
            if best.as_ref().is_none_or(|b| energy < b.alias_energy) {
                best = Some(ScaleCandidate {
                    coefs: quantized.iter().map(|&v| v as i64).collect(),
                    scale,
                    rounding,
                    alias_energy: energy,
                });
            }
        }
    }
    let best = best.ok_or_else(|| DecimError::Design {
        spec: format!("{} x {}-sample moving average", n_stages, q),
        reason: "no scale fits the 16-bit range".into(),
    })?;
    debug!(
        "moving average search: scale {:.6}, {:?}, alias energy {:.3e}",
        best.scale, best.rounding, best.alias_energy
    );
    Ok(best)
}

/// `n_stages` cascaded length-`q` moving averages as 16-bit integers.
///
/// Coefficients that overflow 16 bits are rescaled with `scaling`; a sum
/// above 2^31 is halved until it fits. Both rescales are reported.
/// Zero coefficients are dropped.
pub fn moving_average_filter_int16(
    q: usize,
    n_stages: u32,
    scaling: MaScaling,
) -> DecimResult<(Vec<i16>, Vec<QuantizationWarning>)> {
    let raw = raw_ma(q, n_stages)?;
    let mut warnings = vec![];
    let max = raw.iter().cloned().fold(0.0, f64::max);

    let mut b = if max > INT16_MAX_COEFFICIENT as f64 {
        warnings.push(QuantizationWarning::new(format!(
            "max moving-average coefficient {} exceeds 16 bits, scaling coefficients, some may be lost",
            max
        )));
        let heuristic = match scaling {
            MaScaling::Heuristic => heuristic_ma_scaling(q, n_stages, &raw),
            MaScaling::Search => None,
        };
        match heuristic {
            Some(b) => b,
            None => search_ma_scaling(q, n_stages)?
                .coefs
                .into_iter()
                .map(|v| v as f64)
                .collect(),
        }
    } else {
        raw
    };

    let scaled_max = b.iter().cloned().fold(0.0, f64::max);
    if scaled_max > INT16_MAX_COEFFICIENT as f64 {
        return Err(DecimError::Design {
            spec: format!("{} x {}-sample moving average", n_stages, q),
            reason: format!("rescaled maximum {} still exceeds 16 bits", scaled_max),
        });
    }

    if b.iter().sum::<f64>() > STAGE1_SUM_LIMIT {
        warnings.push(QuantizationWarning::new(
            "moving-average coefficient sum exceeds 2^31, scaling coefficients, some may be lost",
        ));
        while b.iter().sum::<f64>() > STAGE1_SUM_LIMIT {
            b.iter_mut().for_each(|v| *v = (*v / 2.0).floor());
        }
    }

    let coefs: Vec<i16> = b.into_iter().filter(|&v| v > 0.0).map(|v| v as i16).collect();
    debug!(
        "moving average {} x {}: {} taps, max {}",
        n_stages,
        q,
        coefs.len(),
        coefs.iter().max().copied().unwrap_or(0)
    );
    Ok((coefs, warnings))
}

/// Divide by the coefficient sum for unity gain at DC.
pub fn normalise(coefs: &[f64]) -> DecimResult<Vec<f64>> {
    let sum: f64 = coefs.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return invalid("cannot normalise coefficients with a zero or non-finite sum");
    }
    Ok(coefs.iter().map(|c| c / sum).collect())
}

/// Response of `c2` running after `c1` and a decimation by `q1`, expressed
/// at the stage 1 input rate.
pub fn combined_filter(c1: &[f64], c2: &[f64], q1: usize) -> Vec<f64> {
    let mut combo = convolve(&zero_pack(c2, q1.max(1)), c1);
    combo.truncate(combo.len().saturating_sub(q1.saturating_sub(1)));
    combo
}

/// Scale so `max(b)` becomes 2^31 - 1, keep `sum |b|` under 2^40, round
/// half to even and trim zeros at both ends.
pub fn float_coeffs_to_int32(b: &[f64]) -> DecimResult<(Vec<i32>, Vec<QuantizationWarning>)> {
    let max = b.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(max > 0.0) || !max.is_finite() {
        return invalid("FIR coefficients need a positive, finite maximum");
    }
    let mut warnings = vec![];
    let mut scaled: Vec<f64> = b.iter().map(|v| v / max * i32::MAX as f64).collect();

    let abs_sum: f64 = scaled.iter().map(|v| v.abs()).sum();
    let mut truncate = false;
    if abs_sum > INT32_SUM_LIMIT {
        warnings.push(QuantizationWarning::new(format!(
            "sum of FIR coefficients {:.4e} exceeds 2^40, scaling coefficients, some may be lost",
            abs_sum
        )));
        let k = (INT32_SUM_LIMIT - 1.0) / abs_sum;
        scaled.iter_mut().for_each(|v| *v *= k);
        // rounding up every tap can push the sum back over the limit
        let rounded: f64 = scaled.iter().map(|v| v.round_ties_even().abs()).sum();
        truncate = rounded >= INT32_SUM_LIMIT;
    }

    let mut ints = Vec::with_capacity(scaled.len());
    for v in scaled {
        let r = if truncate { v.trunc() } else { v.round_ties_even() };
        if r.abs() > i32::MAX as f64 {
            return invalid(format!(
                "coefficient {} does not fit 32 bits after scaling",
                r
            ));
        }
        ints.push(r as i32);
    }

    let start = ints.iter().position(|&c| c != 0).unwrap_or(ints.len());
    let end = ints.iter().rposition(|&c| c != 0).map_or(start, |e| e + 1);
    Ok((ints[start..end].to_vec(), warnings))
}

/// Magnitude response on the grid `f_k = k * fs / (2 * wor_n)`, for every
/// grid point up to and including `f_max`.
pub fn freqz(b: &[f64], fs: f64, wor_n: usize, f_max: f64) -> Vec<(f64, f64)> {
    let step = PI / wor_n as f64;
    (0..wor_n)
        .map(|k| {
            let w = k as f64 * step;
            (w, w * (fs / (2.0 * PI)))
        })
        .take_while(|&(_, f)| f <= f_max)
        .map(|(w, f)| (f, response_at(b, w).norm()))
        .collect()
}

// Piecewise-linear interpolation, clamped to the end values outside `xp`.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let idx = xp.partition_point(|&v| v <= x);
    if idx == 0 {
        return fp[0];
    }
    if idx == xp.len() {
        return fp[fp.len() - 1];
    }
    let j = idx - 1;
    let slope = (fp[j + 1] - fp[j]) / (xp[j + 1] - xp[j]);
    slope * (x - xp[j]) + fp[j]
}

/// Frequency-sampling FIR design.
///
/// `freq` runs from 0 to `fs / 2` and may repeat a value once to mark a
/// step in `gain`. The gain curve is sampled on `1 + 2^ceil(log2 numtaps)`
/// points, given linear phase, inverse transformed and windowed.
pub fn firwin2(
    numtaps: usize,
    freq: &[f64],
    gain: &[f64],
    window: &Window,
    fs: f64,
) -> DecimResult<Vec<f64>> {
    let nyq = fs / 2.0;
    if numtaps == 0 {
        return invalid("firwin2 needs at least one tap");
    }
    if freq.len() != gain.len() || freq.len() < 2 {
        return invalid("firwin2 needs matching freq and gain tables of two or more points");
    }
    if freq[0] != 0.0 || freq[freq.len() - 1] != nyq {
        return invalid(format!("firwin2 frequencies must start at 0 and end at {}", nyq));
    }
    if freq.windows(2).any(|w| w[1] < w[0]) {
        return invalid("firwin2 frequencies must be non-decreasing");
    }
    if freq.windows(3).any(|w| w[0] == w[2]) {
        return invalid("a firwin2 frequency must not occur more than twice");
    }
    if freq[1] == 0.0 || freq[freq.len() - 2] == nyq {
        return invalid("firwin2 must not repeat 0 or the Nyquist frequency");
    }
    if numtaps % 2 == 0 && gain[gain.len() - 1] != 0.0 {
        return invalid("an even-length firwin2 filter must have zero gain at Nyquist");
    }

    let nfreqs = 1 + numtaps.next_power_of_two();
    let mut freq = freq.to_vec();
    let eps = f64::EPSILON * nyq;
    for k in 0..freq.len() - 1 {
        if freq[k] == freq[k + 1] {
            freq[k] -= eps;
            freq[k + 1] += eps;
        }
    }

    let step = nyq / (nfreqs - 1) as f64;
    let n_fft = 2 * (nfreqs - 1);
    let mut spectrum = vec![Complex64::new(0.0, 0.0); n_fft];
    let delay = (numtaps as f64 - 1.0) / 2.0;
    for (k, bin) in spectrum.iter_mut().take(nfreqs).enumerate() {
        let x = if k == nfreqs - 1 { nyq } else { k as f64 * step };
        *bin = Complex64::from_polar(interp(x, &freq, gain), -delay * PI * x / nyq);
    }
    // Hermitian extension for a real inverse transform
    spectrum[0].im = 0.0;
    spectrum[nfreqs - 1].im = 0.0;
    for k in 1..nfreqs - 1 {
        spectrum[n_fft - k] = spectrum[k].conj();
    }
    FftPlanner::<f64>::new()
        .plan_fft_inverse(n_fft)
        .process(&mut spectrum);

    let win = window.generate(numtaps);
    Ok(spectrum
        .iter()
        .zip(&win)
        .map(|(s, w)| s.re / n_fft as f64 * w)
        .collect())
}

/// Worst stop-band level from `f_start` to `fs / 2`, in dB below the DC
/// gain.
pub fn stopband_attenuation_db(b: &[f64], fs: f64, f_start: f64) -> f64 {
    let dc = b.iter().sum::<f64>().abs();
    if dc == 0.0 {
        return 0.0;
    }
    let nyq = fs / 2.0;
    let worst = (0..=STOPBAND_GRID_POINTS)
        .map(|i| {
            let f = f_start + (nyq - f_start) * i as f64 / STOPBAND_GRID_POINTS as f64;
            response_at(b, 2.0 * PI * f / fs).norm()
        })
        .fold(0.0, f64::max);
    if worst == 0.0 {
        f64::INFINITY
    } else {
        -20.0 * (worst / dc).log10()
    }
}

// Build a FIR stage with its requested window. If that misses the stop-band
// target, try the Kaiser family and keep the best; fail when nothing
// reaches the target.
fn design_checked<F>(
    stage: &StageSpec,
    fs: f64,
    stop_start: f64,
    build: F,
) -> DecimResult<(Vec<f64>, StageReport)>
where
    F: Fn(&Window) -> DecimResult<Vec<f64>>,
{
    let coefs = build(&stage.window)?;
    let atten = stopband_attenuation_db(&coefs, fs, stop_start);
    debug!("stage [{}]: {:.1} dB stop band", stage, atten);
    let Some(target) = stage.min_stopband_atten_db else {
        return Ok((
            coefs,
            StageReport {
                synthesis: Synthesis::Windowed(stage.window),
                stopband_atten_db: atten,
            },
        ));
    };
    if atten >= target {
        return Ok((
            coefs,
            StageReport {
                synthesis: Synthesis::Windowed(stage.window),
                stopband_atten_db: atten,
            },
        ));
    }

    let mut best = (coefs, stage.window, atten);
    let steps = (KAISER_BETA_MAX / KAISER_BETA_STEP) as usize;
    for i in 0..=steps {
        let window = Window::Kaiser(i as f64 * KAISER_BETA_STEP);
        if window == stage.window {
            continue;
        }
        let coefs = build(&window)?;
        let atten = stopband_attenuation_db(&coefs, fs, stop_start);
        trace!("  {} window: {:.1} dB", window, atten);
        if atten > best.2 {
            best = (coefs, window, atten);
        }
    }

    let (coefs, window, atten) = best;
    if atten < target {
        return Err(DecimError::Design {
            spec: stage.to_string(),
            reason: format!(
                "best stop-band attenuation is {:.1} dB ({} window), short of {:.1} dB",
                atten, window, target
            ),
        });
    }
    info!(
        "stage [{}]: {} window misses {:.1} dB, using {} ({:.1} dB)",
        stage, stage.window, target, window, atten
    );
    Ok((
        coefs,
        StageReport {
            synthesis: Synthesis::Windowed(window),
            stopband_atten_db: atten,
        },
    ))
}

fn remez_error(e: impl fmt::Display) -> DecimError {
    DecimError::Message(format!("remez: {}", e))
}

// Low-pass with a linear pass-band gain from `pass_gain.0` at DC to
// `pass_gain.1` at `pass_edge`. Edges are in Hz at rate `fs`.
fn remez_lowpass(
    taps: usize,
    fs: f64,
    pass_edge: f64,
    stop_start: f64,
    pass_gain: (f64, f64),
    weight: f64,
) -> DecimResult<PMDesign<f64>> {
    let bands = [
        BandSetting::with_weight(
            0.0,
            pass_edge / fs,
            linear(pass_gain.0, pass_gain.1),
            constant(weight),
        )
        .map_err(remez_error)?,
        BandSetting::new(stop_start / fs, 0.5, constant(0.0)).map_err(remez_error)?,
    ];
    let parameters = pm_parameters(taps, &bands).map_err(remez_error)?;
    pm_remez(&parameters).map_err(remez_error)
}

// Bisect the pass-band weight over (0, 1024]: a heavier pass band costs
// stop band. Keep the heaviest weight whose design reaches the target
// while its pass band stays within MAX_PASSBAND_DEVIATION.
fn design_equiripple(
    stage: &StageSpec,
    fs: f64,
    stop_start: f64,
    pass_gain: (f64, f64),
) -> DecimResult<(Vec<f64>, StageReport)> {
    let target = stage
        .min_stopband_atten_db
        .unwrap_or(DEFAULT_EQUIRIPPLE_ATTEN_DB);
    let pass_edge = stage.cutoff - stage.transition_bw / 2.0;

    let (mut lo, mut hi) = (0.0, REMEZ_WEIGHT_MAX);
    let mut best: Option<(Vec<f64>, f64, f64)> = None;
    let mut closest = f64::NEG_INFINITY;
    for _ in 0..REMEZ_BISECTIONS {
        let weight = (lo + hi) / 2.0;
        let attempt = remez_lowpass(stage.taps, fs, pass_edge, stop_start, pass_gain, weight);
        let design = match attempt {
            Ok(design) => design,
            Err(e) => {
                trace!("  weight {:.6}: {}", weight, e);
                lo = weight;
                continue;
            }
        };
        let deviation = design.weighted_error / weight;
        let atten = stopband_attenuation_db(&design.impulse_response, fs, stop_start);
        trace!(
            "  weight {:.6}: {:.1} dB stop band, pass-band deviation {:.4}",
            weight, atten, deviation
        );
        if deviation >= MAX_PASSBAND_DEVIATION {
            lo = weight;
            continue;
        }
        closest = closest.max(atten);
        if atten < target {
            hi = weight;
        } else {
            lo = weight;
            best = Some((design.impulse_response, weight, atten));
        }
    }

    let Some((coefs, passband_weight, atten)) = best else {
        let reason = if closest.is_finite() {
            format!(
                "failed to converge: best stop-band attenuation is {:.1} dB, short of {:.1} dB",
                closest, target
            )
        } else {
            format!(
                "failed to converge: no pass-band weight keeps the deviation below {}",
                MAX_PASSBAND_DEVIATION
            )
        };
        return Err(DecimError::Design {
            spec: stage.to_string(),
            reason,
        });
    };
    debug!(
        "stage [{}]: {:.1} dB stop band at pass-band weight {:.4}",
        stage, atten, passband_weight
    );
    Ok((
        coefs,
        StageReport {
            synthesis: Synthesis::Equiripple { passband_weight },
            stopband_atten_db: atten,
        },
    ))
}

// Route a stage to its synthesis method. `freqs`/`gains` is the firwin2
// table; an equiripple pass band runs linearly from its DC gain to its last
// gain at or below the pass edge.
fn design_stage(
    stage: &StageSpec,
    fs: f64,
    stop_start: f64,
    freqs: &[f64],
    gains: &[f64],
) -> DecimResult<(Vec<f64>, StageReport)> {
    match stage.method {
        FirMethod::Windowed => design_checked(stage, fs, stop_start, |w| {
            firwin2(stage.taps, freqs, gains, w, fs)
        }),
        FirMethod::Equiripple => {
            let pass_edge = stage.cutoff - stage.transition_bw / 2.0;
            let last = freqs.partition_point(|&f| f <= pass_edge).saturating_sub(1);
            design_equiripple(stage, fs, stop_start, (gains[0], gains[last]))
        }
    }
}

fn stage1_coefficients(
    spec: &DesignSpec,
    warnings: &mut Vec<QuantizationWarning>,
) -> DecimResult<Vec<f64>> {
    let q1 = spec.decimations[0] as usize;
    if spec.int_coeffs {
        let (c1, w) = moving_average_filter_int16(q1, spec.ma_stages, spec.ma_scaling)?;
        warnings.extend(w);
        Ok(c1.into_iter().map(f64::from).collect())
    } else {
        moving_average_filter(q1, spec.ma_stages)
    }
}

// Inverse of the normalised `prior` response on the grid below
// `cutoff - bw/2`.
fn compensation_table(prior: &[f64], fs0: f64, wor_n: usize, stage: &StageSpec) -> (Vec<f64>, Vec<f64>) {
    freqz(prior, fs0, wor_n, stage.cutoff - stage.transition_bw / 2.0)
        .into_iter()
        .map(|(f, mag)| (f, 1.0 / mag))
        .unzip()
}

fn fir_output(
    coefs: Vec<f64>,
    int_coeffs: bool,
    warnings: &mut Vec<QuantizationWarning>,
) -> DecimResult<Vec<f64>> {
    if !int_coeffs {
        return Ok(coefs);
    }
    let (ints, w) = float_coeffs_to_int32(&coefs)?;
    warnings.extend(w);
    Ok(ints.into_iter().map(f64::from).collect())
}

/// Moving-average stage 1 followed by a compensated low-pass stage 2.
pub fn design_2_stage(spec: &DesignSpec) -> DecimResult<Design> {
    spec.validate(2)?;
    let rates = spec.stage_rates();
    let (q1, q2) = (spec.decimations[0], spec.decimations[1]);
    let stage = &spec.stage2;
    stage.validate(rates[1])?;

    let mut warnings = vec![];
    let c1 = stage1_coefficients(spec, &mut warnings)?;

    let (mut freqs, mut gains) = if spec.compensate_stage1 {
        let wor_n = FREQZ_POINTS_PER_DECIMATION * q1 as usize;
        compensation_table(&normalise(&c1)?, rates[0], wor_n, stage)
    } else {
        (vec![0.0, stage.cutoff - stage.transition_bw / 2.0], vec![1.0, 1.0])
    };
    freqs.extend([stage.cutoff + stage.transition_bw / 2.0, rates[1] / 2.0]);
    gains.extend([0.0, 0.0]);
    debug!("stage 2 gain table: {} points", freqs.len());

    let stop_start = stage.cutoff + stage.transition_bw / 2.0;
    let (c2, report) = design_stage(stage, rates[1], stop_start, &freqs, &gains)?;
    let c2 = fir_output(c2, spec.int_coeffs, &mut warnings)?;

    info!(
        "designed 2-stage filter: {} -> {} Hz",
        rates[0],
        rates[rates.len() - 1]
    );
    Ok(Design {
        coefficients: CoefficientSet::new(vec![
            StageCoefficients::new(c1, q1),
            StageCoefficients::new(c2, q2),
        ]),
        warnings,
        reports: vec![report],
    })
}

/// Half-band stage 2 applies when stage 2 halves the rate and
/// `(taps - 3) / 2` is even.
pub fn uses_half_band(q2: u32, taps: usize) -> bool {
    q2 == 2 && taps >= 3 && taps % 2 == 1 && ((taps - 3) / 2) % 2 == 0
}

/// Moving-average stage 1, a half-band or plain low-pass stage 2, and a
/// stage 3 that compensates the combined response of stages 1 and 2.
pub fn design_3_stage(spec: &DesignSpec) -> DecimResult<Design> {
    spec.validate(3)?;
    let Some(stage3) = spec.stage3.as_ref() else {
        return invalid("3-stage design needs a stage 3 specification");
    };
    let rates = spec.stage_rates();
    let (q1, q2, q3) = (spec.decimations[0], spec.decimations[1], spec.decimations[2]);
    let stage2 = &spec.stage2;
    stage3.validate(rates[2])?;

    let mut warnings = vec![];
    let c1 = stage1_coefficients(spec, &mut warnings)?;

    let (c2, report2) = if uses_half_band(q2, stage2.taps) {
        // zeros at every other tap except the centre; always windowed
        debug!("stage 2: half-band design from {} taps", (stage2.taps + 1) / 2);
        if !(stage2.cutoff > 0.0 && stage2.cutoff < rates[2] / 2.0) {
            return invalid(format!(
                "half-band cutoff of stage [{}] must lie below {} Hz",
                stage2,
                rates[2] / 2.0
            ));
        }
        let freqs = [0.0, stage2.cutoff, rates[2] / 2.0];
        let gains = [1.0, 1.0, 0.0];
        let taps = stage2.taps;
        design_checked(stage2, rates[1], rates[1] / 2.0 - stage2.cutoff, |w| {
            let half = firwin2((taps + 1) / 2, &freqs, &gains, w, rates[2])?;
            let mut c2 = vec![0.0; taps];
            for (dst, h) in c2.iter_mut().step_by(2).zip(&half) {
                *dst = h / 2.0;
            }
            c2[taps / 2] = 0.5;
            Ok(c2)
        })?
    } else {
        stage2.validate(rates[1])?;
        let edge = stage2.cutoff - stage2.transition_bw / 2.0;
        let stop = rates[1] / 2.0 - stage2.cutoff - stage2.transition_bw / 2.0;
        let freqs = [0.0, edge, stop, rates[1] / 2.0];
        let gains = [1.0, 1.0, 0.0, 0.0];
        design_stage(stage2, rates[1], stop, &freqs, &gains)?
    };

    let combo = combined_filter(&normalise(&c1)?, &normalise(&c2)?, q1 as usize);
    let wor_n = FREQZ_POINTS_PER_DECIMATION * (q1 * q2) as usize;
    let (mut freqs, mut gains) = compensation_table(&combo, rates[0], wor_n, stage3);
    freqs.extend([stage3.cutoff + stage3.transition_bw / 2.0, rates[2] / 2.0]);
    gains.extend([0.0, 0.0]);

    let stop_start = stage3.cutoff + stage3.transition_bw / 2.0;
    let (c3, report3) = design_stage(stage3, rates[2], stop_start, &freqs, &gains)?;

    let c2 = fir_output(c2, spec.int_coeffs, &mut warnings)?;
    let c3 = fir_output(c3, spec.int_coeffs, &mut warnings)?;

    info!(
        "designed 3-stage filter: {} -> {} Hz",
        rates[0],
        rates[rates.len() - 1]
    );
    Ok(Design {
        coefficients: CoefficientSet::new(vec![
            StageCoefficients::new(c1, q1),
            StageCoefficients::new(c2, q2),
            StageCoefficients::new(c3, q3),
        ]),
        warnings,
        reports: vec![report2, report3],
    })
}

/// Dispatch on the presence of a stage 3 specification.
pub fn design(spec: &DesignSpec) -> DecimResult<Design> {
    match spec.stage3 {
        Some(_) => design_3_stage(spec),
        None => design_2_stage(spec),
    }
}

/// Ready-made designs for a 3.072 MHz PDM input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// 16 kHz output, 64-tap stage 2
    #[value(name = "small_2_stage")]
    Small2Stage,
    /// 16 kHz output, 256-tap stage 2
    #[value(name = "good_2_stage")]
    Good2Stage,
    /// 16 kHz output via a half-band stage 2
    #[value(name = "good_3_stage")]
    Good3Stage,
    /// 32 kHz output
    #[value(name = "good_32k")]
    Good32k,
    /// 48 kHz output, 96-tap stage 2
    #[value(name = "good_48k")]
    Good48k,
    /// 48 kHz output, 64-tap stage 2
    #[value(name = "small_48k")]
    Small48k,
}

impl Preset {
    pub fn spec(&self) -> DesignSpec {
        let fs0 = PRESET_PDM_RATE;
        match self {
            Preset::Small2Stage => DesignSpec::two_stage(
                fs0,
                [32, 6],
                4,
                StageSpec::new(7500.0, 0.0, 64, Window::Kaiser(5.0)),
            ),
            Preset::Good2Stage => DesignSpec::two_stage(
                fs0,
                [32, 6],
                4,
                StageSpec::new(7800.0, 0.0, 256, Window::Kaiser(8.0)),
            ),
            Preset::Good3Stage => DesignSpec::three_stage(
                fs0,
                [32, 2, 3],
                4,
                StageSpec::new(16000.0, 0.0, 19, Window::Kaiser(5.0)),
                StageSpec::new(7750.0, 500.0, 96, Window::Kaiser(7.0)),
            ),
            Preset::Good32k => DesignSpec::two_stage(
                fs0,
                [32, 3],
                5,
                StageSpec::new(14500.0, 1000.0, 96, Window::Kaiser(6.5)),
            ),
            Preset::Good48k => DesignSpec::two_stage(
                fs0,
                [32, 2],
                5,
                StageSpec::new(20000.0, 1000.0, 96, Window::Kaiser(6.5)),
            ),
            Preset::Small48k => DesignSpec::two_stage(
                fs0,
                [32, 2],
                5,
                StageSpec::new(20000.0, 1000.0, 64, Window::Kaiser(8.0)),
            ),
        }
    }

    pub fn design(&self) -> DecimResult<Design> {
        design(&self.spec())
    }
}
