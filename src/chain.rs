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


use log::debug;

use crate::model::{DecimResult, invalid};
use crate::signal::PdmSignal;
use crate::stage1::Stage1Filter;
use crate::stage2::{Stage2Filter, Stage3Filter};

/// The complete decimation pipeline. Stage 1 output (already shifted up
/// by 8 bits) feeds stage 2, whose output feeds stage 3 when present.
pub enum FilterChain {
    TwoStage {
        s1: Stage1Filter,
        s2: Stage2Filter,
    },
    ThreeStage {
        s1: Stage1Filter,
        s2: Stage2Filter,
        s3: Stage3Filter,
    },
}

impl FilterChain {
    pub fn two_stage(s1: Stage1Filter, s2: Stage2Filter) -> Self {
        debug!(
            "two-stage chain: /{} -> /{}",
            s1.decimation_factor(),
            s2.decimation_factor()
        );
        FilterChain::TwoStage { s1, s2 }
    }

    pub fn three_stage(s1: Stage1Filter, s2: Stage2Filter, s3: Stage3Filter) -> Self {
        debug!(
            "three-stage chain: /{} -> /{} -> /{}",
            s1.decimation_factor(),
            s2.decimation_factor(),
            s3.decimation_factor()
        );
        FilterChain::ThreeStage { s1, s2, s3 }
    }

    pub fn stage1(&self) -> &Stage1Filter {
        match self {
            FilterChain::TwoStage { s1, .. } | FilterChain::ThreeStage { s1, .. } => s1,
        }
    }

    pub fn stage2(&self) -> &Stage2Filter {
        match self {
            FilterChain::TwoStage { s2, .. } | FilterChain::ThreeStage { s2, .. } => s2,
        }
    }

    pub fn stage3(&self) -> Option<&Stage3Filter> {
        match self {
            FilterChain::TwoStage { .. } => None,
            FilterChain::ThreeStage { s3, .. } => Some(s3),
        }
    }

    pub fn stage_count(&self) -> usize {
        match self {
            FilterChain::TwoStage { .. } => 2,
            FilterChain::ThreeStage { .. } => 3,
        }
    }

    pub fn decimation_factor(&self) -> usize {
        let base = self.stage1().decimation_factor() * self.stage2().decimation_factor();
        base * self.stage3().map_or(1, |s3| s3.decimation_factor())
    }

    /// Output samples produced from `n` PDM samples per channel.
    pub fn output_len(&self, n: usize) -> usize {
        let n1 = self.stage1().output_len(n);
        let n2 = self.stage2().output_len(n1);
        self.stage3().map_or(n2, |s3| s3.output_len(n2))
    }

    /// Run one channel of +1/-1 samples through every stage.
    pub fn filter_channel(&self, pdm: &[i32]) -> Vec<i32> {
        let y1 = self.stage1().filter(pdm);
        let y2 = self.stage2().filter(&y1);
        match self.stage3() {
            Some(s3) => s3.filter(&y2),
            None => y2,
        }
    }

    pub fn filter(&self, signal: &PdmSignal) -> Vec<Vec<i32>> {
        signal.rows().iter().map(|row| self.filter_channel(row)).collect()
    }

    /// Same as [`Self::filter`] for callers holding raw channel rows.
    pub fn filter_rows(&self, rows: &[Vec<i32>]) -> DecimResult<Vec<Vec<i32>>> {
        if rows.is_empty() {
            return invalid("no channels to filter");
        }
        let signal = PdmSignal::new(rows.to_vec())?;
        Ok(self.filter(&signal))
    }
}
