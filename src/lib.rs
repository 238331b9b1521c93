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


//! Bit-exact model of a fixed-point PDM to PCM decimator.
//!
//! A [`FilterChain`] runs a 1-bit moving-average stage ([`Stage1Filter`])
//! followed by one or two 32-bit FIR stages ([`Stage2Filter`]). The
//! [`design`] module produces coefficient sets for it, and
//! [`CoefficientSet`] persists them and rebuilds the chain.

pub mod analysis;
pub mod chain;
pub mod coefficients;
mod color_logger;
pub mod design;
pub mod header;
mod model;
pub mod modulator;
pub mod resample;
pub mod signal;
pub mod stage1;
pub mod stage2;
pub mod window;

pub use analysis::{ThdnReport, thdn, thdn_i32};
pub use chain::FilterChain;
pub use coefficients::{CoefficientSet, StageCoefficients};
pub use color_logger::ColorLogger;
pub use design::{Design, DesignSpec, FirMethod, MaScaling, Preset, StageSpec, Synthesis};
pub use header::write_header;
pub use model::{DecimError, DecimResult, QuantizationWarning, TermResult};
pub use signal::{PdmSignal, SineSpec};
pub use stage1::Stage1Filter;
pub use stage2::{Stage2Filter, Stage3Filter};
pub use window::Window;
