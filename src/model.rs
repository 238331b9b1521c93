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


use core::fmt;
use std::process::{ExitCode, Termination};

use log::error;

#[derive(Debug)]
pub enum DecimError {
    /// Malformed input shape or range; raised before any computation.
    Validation(String),
    /// A filter design could not meet its stop-band target.
    Design { spec: String, reason: String },
    /// A stage's derived shift does not bound its accumulator.
    Overflow(String),
    Message(String),
}

impl std::fmt::Display for DecimError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecimError::Validation(msg) => write!(f, "invalid input: {}", msg),
            DecimError::Design { spec, reason } => {
                write!(f, "filter design failed for {}: {}", spec, reason)
            }
            DecimError::Overflow(msg) => {
                write!(f, "accumulator overflow invariant violated: {}", msg)
            }
            DecimError::Message(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for DecimError {}

pub type DecimResult<T> = Result<T, DecimError>;

/// Shorthand for the validation variant, used at every input check.
pub(crate) fn invalid<T>(msg: impl Into<String>) -> DecimResult<T> {
    Err(DecimError::Validation(msg.into()))
}

/// Non-fatal notice that coefficients were rescaled to fit their
/// integer width. Returned next to the rescaled result.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationWarning {
    pub message: String,
}

impl QuantizationWarning {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        log::warn!("{}", message);
        Self { message }
    }
}

impl fmt::Display for QuantizationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub struct TermResult(pub DecimResult<()>);

impl Termination for TermResult {
    fn report(self) -> ExitCode {
        match self.0 {
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{}", err);
                ExitCode::FAILURE
            }
        }
    }
}

// Convert boxed dynamic errors into DecimError
impl From<Box<dyn std::error::Error>> for DecimError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        DecimError::Message(err.to_string())
    }
}

impl From<std::io::Error> for DecimError {
    fn from(err: std::io::Error) -> Self {
        DecimError::Message(err.to_string())
    }
}

impl From<serde_json::Error> for DecimError {
    fn from(err: serde_json::Error) -> Self {
        DecimError::Message(format!("coefficient file: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn design_error_names_the_spec() {
        let err = DecimError::Design {
            spec: "16 taps, cutoff 7000 Hz".into(),
            reason: "best stop-band attenuation 8.4 dB < 100 dB".into(),
        };
        let text = err.to_string();
        assert!(text.contains("16 taps"));
        assert!(text.contains("100 dB"));
    }

    #[test]
    fn boxed_errors_become_messages() {
        let boxed: Box<dyn std::error::Error> = "bad preset".into();
        match DecimError::from(boxed) {
            DecimError::Message(m) => assert_eq!(m, "bad preset"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
