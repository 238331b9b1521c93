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


use clap::Parser;
use colored::Colorize;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::{debug, info};
use pdmdecim::{ColorLogger, TermResult, thdn_i32};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pdm_thdn",
    about = "Report THD+N of decimated output written by `pdmdecim simulate`",
    version
)]
struct Cli {
    /// JSON file holding one array of samples per channel
    #[arg(short = 'i', long = "input", default_value = "y.json")]
    input: PathBuf,

    /// Sample rate of the decimated output in Hz
    #[arg(short = 'r', long = "rate", default_value = "16000")]
    rate: f64,

    /// Samples to skip while the filters settle
    #[arg(short = 's', long = "skip", default_value = "256")]
    skip: usize,

    /// Samples to analyse after the skipped ones [default: the rest]
    #[arg(short = 'l', long = "len")]
    len: Option<usize>,

    /// Print diagnostic messages
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() -> TermResult {
    match run() {
        Ok(()) => TermResult(Ok(())),
        Err(e) => TermResult(Err(e.into())),
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let logger = ColorLogger::new(false, cli.verbose);
    let level = logger.max_level();
    let multi = MultiProgress::new();
    LogWrapper::new(multi.clone(), logger).try_init()?;
    log::set_max_level(level);

    let channels: Vec<Vec<i32>> = serde_json::from_reader(BufReader::new(File::open(&cli.input)?))?;
    debug!("read {} channel(s) from {}", channels.len(), cli.input.display());

    for (c, samples) in channels.iter().enumerate() {
        let end = match cli.len {
            Some(len) => cli.skip + len,
            None => samples.len(),
        };
        if end > samples.len() || cli.skip >= end {
            return Err(format!(
                "channel {} has {} samples; cannot analyse {}..{}",
                c,
                samples.len(),
                cli.skip,
                end
            )
            .into());
        }
        let report = thdn_i32(&samples[cli.skip..end], cli.rate)?;
        info!(
            "{} {:.1} Hz, THD+N {}",
            format!("[channel {}]", c).bold(),
            report.fundamental_hz,
            format!("{:.1} dB", report.thdn_db).bold()
        );
    }
    Ok(())
}
