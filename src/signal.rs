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


//! N-channel bipolar PDM signal and the word layouts consumed by the
//! decimator hardware.
//!
//! Bit value convention for every packed layout: 0 is +1, 1 is -1.

use log::debug;
use rand::Rng;

use crate::model::{DecimResult, invalid};
use crate::modulator::DeltaSigmaModulator;
use crate::resample::{resample_poly, up_down_ratio};

pub const SUPPORTED_CHANNELS: [usize; 5] = [1, 2, 4, 8, 16];
pub const WORD_BITS: usize = 32;
pub const DEFAULT_PDM_RATE: u32 = 3_072_000;

/// Immutable C x N matrix of +1/-1 samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdmSignal {
    rows: Vec<Vec<i32>>,
}

/// One synthesized tone per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SineSpec {
    pub frequencies: Vec<f64>,
    pub amplitudes: Vec<f64>,
    pub pcm_rate: u32,
    pub duration: f64,
    pub pdm_rate: u32,
}

fn check_channels(channels: usize) -> DecimResult<()> {
    if SUPPORTED_CHANNELS.contains(&channels) {
        Ok(())
    } else {
        invalid(format!(
            "unsupported channel count {}; must be one of {:?}",
            channels, SUPPORTED_CHANNELS
        ))
    }
}

#[inline]
fn to_bit(sample: i32) -> u32 {
    ((1 - sample) / 2) as u32
}

#[inline]
fn from_bit(bit: u32) -> i32 {
    1 - 2 * (bit & 1) as i32
}

impl PdmSignal {
    pub fn new(rows: Vec<Vec<i32>>) -> DecimResult<Self> {
        check_channels(rows.len())?;
        let len = rows[0].len();
        if rows.iter().any(|r| r.len() != len) {
            return invalid("all channels must have the same length");
        }
        if len % WORD_BITS != 0 {
            return invalid(format!(
                "signal length {} is not a multiple of {} samples",
                len, WORD_BITS
            ));
        }
        for (c, row) in rows.iter().enumerate() {
            if let Some(pos) = row.iter().position(|&v| v != 1 && v != -1) {
                return invalid(format!(
                    "channel {} sample {} is {}; PDM samples must be +1 or -1",
                    c, pos, row[pos]
                ));
            }
        }
        Ok(Self { rows })
    }

    /// Uniformly random bit-stream, `len` samples per channel.
    pub fn random<R: Rng + ?Sized>(
        channels: usize,
        len: usize,
        rng: &mut R,
    ) -> DecimResult<Self> {
        check_channels(channels)?;
        if len % WORD_BITS != 0 {
            return invalid(format!(
                "signal length {} is not a multiple of {} samples",
                len, WORD_BITS
            ));
        }
        let rows = (0..channels)
            .map(|_| {
                (0..len)
                    .map(|_| if rng.gen_bool(0.5) { -1 } else { 1 })
                    .collect()
            })
            .collect();
        Ok(Self { rows })
    }

    /// Synthesize each tone at `pcm_rate`, resample to `pdm_rate`, then
    /// delta-sigma modulate. The result is truncated to whole 32-sample
    /// words.
    pub fn sine(spec: &SineSpec) -> DecimResult<Self> {
        if spec.frequencies.is_empty() {
            return invalid("at least one tone frequency is required");
        }
        if spec.frequencies.len() != spec.amplitudes.len() {
            return invalid("frequencies and amplitudes must have the same length");
        }
        check_channels(spec.frequencies.len())?;
        if !(spec.duration > 0.0) {
            return invalid("duration must be positive");
        }
        let (up, down) = up_down_ratio(spec.pcm_rate, spec.pdm_rate)?;
        let pcm_len = (spec.duration * spec.pcm_rate as f64).round() as usize;
        let pdm_len = pcm_len * up / down;
        let len = pdm_len - pdm_len % WORD_BITS;
        debug!(
            "sine synthesis: {} PCM samples, x{}/{} -> {} PDM samples",
            pcm_len, up, down, len
        );

        let mut rows = Vec::with_capacity(spec.frequencies.len());
        for (&f, &a) in spec.frequencies.iter().zip(&spec.amplitudes) {
            let w = 2.0 * std::f64::consts::PI * f / spec.pcm_rate as f64;
            let pcm: Vec<f64> = (0..pcm_len).map(|n| a * (w * n as f64).sin()).collect();
            let upsampled = resample_poly(&pcm, up, down)?;
            let mut bits = DeltaSigmaModulator::new().modulate(&upsampled[..pdm_len]);
            bits.truncate(len);
            rows.push(bits);
        }
        Self::new(rows)
    }

    pub fn channels(&self) -> usize {
        self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self, c: usize) -> &[i32] {
        &self.rows[c]
    }

    pub fn rows(&self) -> &[Vec<i32>] {
        &self.rows
    }

    /// {+1 -> 0, -1 -> 1}
    pub fn to_binary(&self) -> Vec<Vec<u8>> {
        self.rows
            .iter()
            .map(|r| r.iter().map(|&v| to_bit(v) as u8).collect())
            .collect()
    }

    /// One word per 32/C sample instants; channel `c` of sample `s` within
    /// the word lands on bit `c + C*s`.
    pub fn encode_interleaved(&self) -> Vec<u32> {
        let chans = self.channels();
        let spw = WORD_BITS / chans;
        let mut words = Vec::with_capacity(self.len() / spw);
        for start in (0..self.len()).step_by(spw) {
            let mut word = 0u32;
            for s in 0..spw {
                for c in 0..chans {
                    word |= to_bit(self.rows[c][start + s]) << (c + chans * s);
                }
            }
            words.push(word);
        }
        words
    }

    pub fn decode_interleaved(words: &[u32], channels: usize) -> DecimResult<Self> {
        check_channels(channels)?;
        let spw = WORD_BITS / channels;
        let mut rows = vec![Vec::with_capacity(words.len() * spw); channels];
        for &word in words {
            for s in 0..spw {
                for (c, row) in rows.iter_mut().enumerate() {
                    row.push(from_bit(word >> (c + channels * s)));
                }
            }
        }
        Self::new(rows)
    }

    // Channel c's n-th word: samples 32n..32n+31, sample i on bit i.
    fn channel_word(&self, c: usize, n: usize) -> u32 {
        self.rows[c][n * WORD_BITS..(n + 1) * WORD_BITS]
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, &v)| acc | (to_bit(v) << i))
    }

    /// Blocks of C*Q words laid out as `block[C][Q]`: channels in order,
    /// each channel's words in order of occurrence.
    pub fn encode_blocked(&self, q: usize) -> DecimResult<Vec<u32>> {
        if q == 0 {
            return invalid("decimation factor must be non-zero");
        }
        let block_samples = WORD_BITS * q;
        if self.len() % block_samples != 0 {
            return invalid(format!(
                "signal length {} is not a whole number of {}-sample blocks",
                self.len(),
                block_samples
            ));
        }
        let blocks = self.len() / block_samples;
        let mut words = Vec::with_capacity(blocks * q * self.channels());
        for b in 0..blocks {
            for c in 0..self.channels() {
                for k in 0..q {
                    words.push(self.channel_word(c, b * q + k));
                }
            }
        }
        Ok(words)
    }

    pub fn decode_blocked(words: &[u32], channels: usize, q: usize) -> DecimResult<Self> {
        check_channels(channels)?;
        if q == 0 {
            return invalid("decimation factor must be non-zero");
        }
        let block_words = channels * q;
        if words.len() % block_words != 0 {
            return invalid(format!(
                "{} words is not a whole number of {}-word blocks",
                words.len(),
                block_words
            ));
        }
        let mut rows = vec![Vec::with_capacity(words.len() / channels * WORD_BITS); channels];
        for block in words.chunks_exact(block_words) {
            for (c, row) in rows.iter_mut().enumerate() {
                for &word in &block[c * q..(c + 1) * q] {
                    row.extend((0..WORD_BITS).map(|i| from_bit(word >> i)));
                }
            }
        }
        Self::new(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn rejects_bad_values_channels_and_lengths() {
        assert!(PdmSignal::new(vec![vec![1; 32]; 3]).is_err());
        assert!(PdmSignal::new(vec![vec![1; 31]]).is_err());
        let mut row = vec![1; 64];
        row[17] = 0;
        assert!(PdmSignal::new(vec![row]).is_err());
        assert!(PdmSignal::new(vec![vec![1; 32], vec![-1; 64]]).is_err());
        let mut rng = StdRng::seed_from_u64(1);
        assert!(PdmSignal::random(2, 33, &mut rng).is_err());
        assert!(PdmSignal::random(32, 32, &mut rng).is_err());
    }

    #[test]
    fn binary_mapping() {
        let sig = PdmSignal::new(vec![[1, -1].repeat(16)]).unwrap();
        assert_eq!(&sig.to_binary()[0][..4], &[0, 1, 0, 1]);
    }

    #[test]
    fn interleaved_bit_positions() {
        // Two channels: ch0 always -1, ch1 always +1 -> bits 0,2,4,... set
        let sig = PdmSignal::new(vec![vec![-1; 32], vec![1; 32]]).unwrap();
        let words = sig.encode_interleaved();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], 0x5555_5555);

        // One channel: sample s on bit s
        let mut row = vec![1; 32];
        row[3] = -1;
        let sig = PdmSignal::new(vec![row]).unwrap();
        assert_eq!(sig.encode_interleaved(), vec![1 << 3]);
    }

    #[test]
    fn blocked_layout_is_channel_major() {
        // Channel c's k-th word is all ones only when k == c
        let q = 2;
        let mut rows = vec![vec![1; 32 * q]; 2];
        rows[0][..32].fill(-1);
        rows[1][32..].fill(-1);
        let sig = PdmSignal::new(rows).unwrap();
        let words = sig.encode_blocked(q).unwrap();
        assert_eq!(words, vec![u32::MAX, 0, 0, u32::MAX]);
        assert!(sig.encode_blocked(3).is_err());
    }

    #[test]
    fn layouts_round_trip_for_all_channel_counts() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for &chans in &SUPPORTED_CHANNELS {
            for q in [1, 3, 6] {
                let sig = PdmSignal::random(chans, 32 * q * 4, &mut rng).unwrap();
                let inter = sig.encode_interleaved();
                assert_eq!(inter.len(), chans * sig.len() / 32);
                assert_eq!(PdmSignal::decode_interleaved(&inter, chans).unwrap(), sig);
                let blocked = sig.encode_blocked(q).unwrap();
                assert_eq!(PdmSignal::decode_blocked(&blocked, chans, q).unwrap(), sig);
            }
        }
    }

    #[test]
    fn sine_has_expected_shape() {
        let spec = SineSpec {
            frequencies: vec![1000.0, 2000.0],
            amplitudes: vec![0.5, 0.25],
            pcm_rate: 16_000,
            duration: 0.01,
            pdm_rate: DEFAULT_PDM_RATE,
        };
        let sig = PdmSignal::sine(&spec).unwrap();
        assert_eq!(sig.channels(), 2);
        assert_eq!(sig.len(), 160 * 192);
        assert_eq!(sig.channel(0)[0], 1);
    }

    #[test]
    fn sine_rejects_mismatched_tones() {
        let spec = SineSpec {
            frequencies: vec![1000.0],
            amplitudes: vec![],
            pcm_rate: 16_000,
            duration: 0.01,
            pdm_rate: DEFAULT_PDM_RATE,
        };
        assert!(PdmSignal::sine(&spec).is_err());
    }
}
