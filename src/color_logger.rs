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


use std::io::{self, Write};

use colored::Colorize;
use log::{Level, LevelFilter, Metadata, Record};

/// Stderr logger for the command-line tools. Warnings and errors are
/// colored; debug and trace lines carry the emitting module so designer
/// and chain diagnostics can be told apart.
#[derive(Clone)]
pub struct ColorLogger {
    max_level: LevelFilter,
}

impl ColorLogger {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        let max_level = if quiet {
            LevelFilter::Off
        } else if verbose {
            LevelFilter::Trace
        } else {
            LevelFilter::Info
        };
        Self { max_level }
    }

    pub fn max_level(&self) -> LevelFilter {
        self.max_level
    }
}

impl log::Log for ColorLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error => eprintln!(
                "{} {}",
                "[ERROR]".red().bold(),
                format!("{}", record.args()).red().bold()
            ),
            Level::Warn => eprintln!(
                "{} {}",
                "[WARN]".yellow().bold(),
                format!("{}", record.args()).yellow().bold()
            ),
            Level::Info => eprintln!(
                "[{}] {}",
                record.level().to_string().blue(),
                record.args()
            ),
            _ => eprintln!(
                "[{}] {} {}",
                record.level().to_string().blue(),
                record.target().dimmed(),
                record.args()
            ),
        }
        self.flush();
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    fn meta(level: Level) -> Metadata<'static> {
        Metadata::builder().level(level).target("pdmdecim").build()
    }

    #[test]
    fn quiet_wins_over_verbose() {
        let logger = ColorLogger::new(true, true);
        assert_eq!(logger.max_level(), LevelFilter::Off);
        assert!(!logger.enabled(&meta(Level::Error)));
    }

    #[test]
    fn default_level_hides_debug() {
        let logger = ColorLogger::new(false, false);
        assert!(logger.enabled(&meta(Level::Info)));
        assert!(logger.enabled(&meta(Level::Warn)));
        assert!(!logger.enabled(&meta(Level::Debug)));
    }

    #[test]
    fn verbose_shows_trace() {
        let logger = ColorLogger::new(false, true);
        assert!(logger.enabled(&meta(Level::Trace)));
    }
}
