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


// Persisted coefficient sets. On disk a set is a JSON list of
// [coefficients, decimation_factor] pairs: entry 0 is the moving-average
// stage, entries 1 and 2 are 32-bit FIR stages.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::chain::FilterChain;
use crate::model::{DecimResult, invalid};
use crate::stage1::{BLOCK_SIZE, INT16_MAX_COEFFICIENT, Stage1Filter};
use crate::stage2::Stage2Filter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(Vec<f64>, u32)", into = "(Vec<f64>, u32)")]
pub struct StageCoefficients {
    pub coefficients: Vec<f64>,
    pub decimation_factor: u32,
}

impl StageCoefficients {
    pub fn new(coefficients: Vec<f64>, decimation_factor: u32) -> Self {
        Self {
            coefficients,
            decimation_factor,
        }
    }
}

impl From<(Vec<f64>, u32)> for StageCoefficients {
    fn from((coefficients, decimation_factor): (Vec<f64>, u32)) -> Self {
        Self::new(coefficients, decimation_factor)
    }
}

impl From<StageCoefficients> for (Vec<f64>, u32) {
    fn from(stage: StageCoefficients) -> Self {
        (stage.coefficients, stage.decimation_factor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoefficientSet {
    stages: Vec<StageCoefficients>,
}

fn integral(values: &[f64], stage: usize, min: f64, max: f64) -> DecimResult<()> {
    match values
        .iter()
        .find(|v| v.fract() != 0.0 || !v.is_finite() || **v < min || **v > max)
    {
        Some(v) => invalid(format!(
            "stage {} coefficient {} is not an integer in [{}, {}]",
            stage, v, min, max
        )),
        None => Ok(()),
    }
}

impl CoefficientSet {
    pub fn new(stages: Vec<StageCoefficients>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[StageCoefficients] {
        &self.stages
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> DecimResult<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(writer, self)?;
        debug!("wrote {} stages to {}", self.stages.len(), path.as_ref().display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> DecimResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let set: Self = serde_json::from_reader(reader)?;
        debug!("read {} stages from {}", set.stages.len(), path.as_ref().display());
        Ok(set)
    }

    /// Stage 1 as the decimator consumes it. A stage of whole numbers is
    /// taken as 16-bit integers; any fractional value marks the stage as
    /// real, to be quantized from [-1, 1]. Both are zero-padded up to a
    /// whole number of 256-tap blocks.
    pub fn stage1(&self) -> DecimResult<Stage1Filter> {
        let Some(first) = self.stages.first() else {
            return invalid("coefficient set is empty");
        };
        let q = first.decimation_factor as usize;
        let mut coefs = first.coefficients.clone();
        if coefs.is_empty() {
            return invalid("stage 1 has no coefficients");
        }
        coefs.resize(coefs.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0.0);

        if coefs.iter().any(|c| c.fract() != 0.0) {
            Stage1Filter::from_real(&coefs, q)
        } else {
            let limit = INT16_MAX_COEFFICIENT as f64;
            integral(&coefs, 1, -limit, limit)?;
            Stage1Filter::new(coefs.iter().map(|&c| c as i16).collect(), q)
        }
    }

    fn fir_stage(&self, index: usize) -> DecimResult<Stage2Filter> {
        let stage = &self.stages[index];
        integral(
            &stage.coefficients,
            index + 1,
            i32::MIN as f64,
            i32::MAX as f64,
        )?;
        Stage2Filter::new(
            stage.coefficients.iter().map(|&c| c as i32).collect(),
            stage.decimation_factor as usize,
        )
    }

    /// Build the matching chain for a 2- or 3-stage set.
    pub fn into_chain(self) -> DecimResult<FilterChain> {
        let chain = match self.stages.len() {
            2 => FilterChain::two_stage(self.stage1()?, self.fir_stage(1)?),
            3 => FilterChain::three_stage(self.stage1()?, self.fir_stage(1)?, self.fir_stage(2)?),
            n => {
                return invalid(format!(
                    "coefficient set has {} stages; expected 2 or 3",
                    n
                ));
            }
        };
        for (i, stage) in self.stages.iter().enumerate() {
            info!(
                "stage {}: decimation {}, {} taps",
                i + 1,
                stage.decimation_factor,
                stage.coefficients.len()
            );
        }
        Ok(chain)
    }
}
