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


use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use log::{debug, info, trace, warn};
use pdmdecim::signal::DEFAULT_PDM_RATE;
use pdmdecim::{
    CoefficientSet, ColorLogger, FilterChain, FirMethod, MaScaling, PdmSignal, Preset, SineSpec,
    TermResult, write_header,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::available_parallelism;
use std::{error::Error, time::Instant};

#[derive(Parser)]
#[command(name = "pdmdecim", version)]
struct Cli {
    /// Print diagnostic messages
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Quiet mode: suppress all log output
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Design a coefficient set from a preset and save it as JSON
    Design {
        /// Design preset
        #[arg(short = 'p', long = "preset", value_enum, default_value = "good_2_stage")]
        preset: Preset,

        /// How the moving-average stage is fitted into 16 bits
        #[arg(short = 'm', long = "ma-scaling", value_enum, default_value = "heuristic")]
        ma_scaling: MaScaling,

        /// Fail unless every FIR stage reaches this stop-band attenuation (dB)
        #[arg(short = 'a', long = "min-atten")]
        min_atten: Option<f64>,

        /// Override how the FIR stages are synthesized
        #[arg(long = "method", value_enum)]
        method: Option<FirMethod>,

        /// Output coefficient file
        #[arg(short = 'o', long = "out", default_value = "coefs.json")]
        out: PathBuf,
    },

    /// Emit a C header for a coefficient set
    Header {
        /// Coefficient file written by `design`
        #[arg(short = 'c', long = "coefs")]
        coefs: PathBuf,

        /// Prefix for every generated name
        #[arg(short = 'p', long = "prefix", default_value = "custom_filt")]
        prefix: String,

        /// Output header [default: stdout]
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,
    },

    /// Decimate synthesized tones through a coefficient set
    Simulate {
        /// Coefficient file written by `design`
        #[arg(short = 'c', long = "coefs")]
        coefs: PathBuf,

        /// Tone frequency in Hz, one per channel
        #[arg(short = 'f', long = "freq", default_value = "1000")]
        freq: Vec<f64>,

        /// Tone amplitude, one per channel or one for all
        #[arg(short = 'a', long = "amp", default_value = "0.5")]
        amp: Vec<f64>,

        /// Signal length in seconds
        #[arg(short = 'd', long = "duration", default_value = "0.15")]
        duration: f64,

        /// Rate the tone is synthesized at, in Hz
        #[arg(long = "pcm-rate", default_value = "16000")]
        pcm_rate: u32,

        /// PDM bit rate in Hz
        #[arg(long = "pdm-rate", default_value_t = DEFAULT_PDM_RATE)]
        pdm_rate: u32,

        /// Output JSON, one array of samples per channel
        #[arg(short = 'o', long = "out", default_value = "y.json")]
        out: PathBuf,
    },

    /// Generate random PDM test vectors with their expected output
    Vectors {
        /// Coefficient file written by `design`
        #[arg(short = 'c', long = "coefs")]
        coefs: PathBuf,

        /// Number of vectors
        #[arg(short = 'n', long = "count", default_value = "8")]
        count: usize,

        /// PDM samples per channel (multiple of 32)
        #[arg(short = 'l', long = "len", default_value = "65536")]
        len: usize,

        /// Channels: 1, 2, 4, 8 or 16
        #[arg(long = "channels", default_value = "2")]
        channels: usize,

        /// Base seed; vector i uses seed + i
        #[arg(short = 's', long = "seed", default_value = "0")]
        seed: u64,

        /// Directory for vector_<i>.json files; must already exist
        #[arg(short = 'o', long = "out-dir", default_value = ".")]
        out_dir: PathBuf,
    },
}

#[derive(Serialize)]
struct TestVector {
    seed: u64,
    channels: usize,
    samples: usize,
    input_words: Vec<u32>,
    expected: Vec<Vec<i32>>,
}

fn main() -> TermResult {
    match run() {
        Ok(()) => TermResult(Ok(())),
        Err(e) => TermResult(Err(e.into())),
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let logger = ColorLogger::new(cli.quiet, cli.verbose);
    let level = logger.max_level();
    let multi = MultiProgress::new();
    LogWrapper::new(multi.clone(), logger).try_init()?;
    log::set_max_level(level);

    let wall_start = Instant::now();
    match cli.command {
        Command::Design {
            preset,
            ma_scaling,
            min_atten,
            method,
            out,
        } => design(preset, ma_scaling, min_atten, method, &out)?,
        Command::Header { coefs, prefix, out } => header(&coefs, &prefix, out.as_deref())?,
        Command::Simulate {
            coefs,
            freq,
            amp,
            duration,
            pcm_rate,
            pdm_rate,
            out,
        } => {
            let amplitudes = if amp.len() == 1 {
                vec![amp[0]; freq.len()]
            } else {
                amp
            };
            let spec = SineSpec {
                frequencies: freq,
                amplitudes,
                pcm_rate,
                duration,
                pdm_rate,
            };
            simulate(&coefs, &spec, &out)?
        }
        Command::Vectors {
            coefs,
            count,
            len,
            channels,
            seed,
            out_dir,
        } => vectors(&coefs, count, len, channels, seed, &out_dir, &multi)?,
    }
    info!("Done in {:.2}s", wall_start.elapsed().as_secs_f64());
    Ok(())
}

fn load_chain(path: &Path) -> Result<FilterChain, Box<dyn Error>> {
    let chain = CoefficientSet::load(path)?.into_chain()?;
    debug!(
        "{}-stage chain, total decimation {}",
        chain.stage_count(),
        chain.decimation_factor()
    );
    Ok(chain)
}

fn design(
    preset: Preset,
    ma_scaling: MaScaling,
    min_atten: Option<f64>,
    method: Option<FirMethod>,
    out: &Path,
) -> Result<(), Box<dyn Error>> {
    let mut spec = preset.spec();
    spec.ma_scaling = ma_scaling;
    if let Some(db) = min_atten {
        spec.stage2 = spec.stage2.with_min_attenuation(db);
        spec.stage3 = spec.stage3.map(|s| s.with_min_attenuation(db));
    }
    if let Some(method) = method {
        spec.stage2 = spec.stage2.with_method(method);
        spec.stage3 = spec.stage3.map(|s| s.with_method(method));
    }
    let design = pdmdecim::design::design(&spec)?;
    for (i, report) in design.reports.iter().enumerate() {
        info!(
            "stage {}: {}, {:.1} dB stop band",
            i + 2,
            report.synthesis,
            report.stopband_atten_db
        );
    }
    if !design.warnings.is_empty() {
        warn!(
            "{} coefficient rescale(s) during design",
            design.warnings.len()
        );
    }
    design.coefficients.save(out)?;
    info!("Wrote {}", out.display());
    Ok(())
}

fn header(coefs: &Path, prefix: &str, out: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let chain = load_chain(coefs)?;
    match out {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            write_header(&chain, prefix, &mut writer)?;
            writer.flush()?;
            info!("Wrote {}", path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            write_header(&chain, prefix, &mut lock)?;
        }
    }
    Ok(())
}

fn simulate(coefs: &Path, spec: &SineSpec, out: &Path) -> Result<(), Box<dyn Error>> {
    let chain = load_chain(coefs)?;
    let signal = PdmSignal::sine(spec)?;
    info!(
        "Decimating {} channel(s) of {} PDM samples by {}",
        signal.channels(),
        signal.len(),
        chain.decimation_factor()
    );
    let output = chain.filter(&signal);
    serde_json::to_writer(BufWriter::new(File::create(out)?), &output)?;
    info!(
        "Wrote {} samples per channel to {}",
        output.first().map_or(0, |c| c.len()),
        out.display()
    );
    Ok(())
}

fn vectors(
    coefs: &Path,
    count: usize,
    len: usize,
    channels: usize,
    seed: u64,
    out_dir: &Path,
    multi: &MultiProgress,
) -> Result<(), Box<dyn Error>> {
    let chain = load_chain(coefs)?;
    if !out_dir.is_dir() {
        return Err(format!("output directory {} does not exist", out_dir.display()).into());
    }

    let avail_par = available_parallelism().map(|n| n.get()).unwrap_or(1);
    // build_global can only be called once; ignore error if already set.
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(avail_par)
        .build_global()
    {
        warn!(
            "Rayon pool initialization error ({} threads). Details: {:?}",
            avail_par, e
        );
    } else {
        trace!("Configured Rayon pool with {} threads", avail_par);
    }

    let style = ProgressStyle::with_template("{prefix} {bar:20.cyan/blue} {pos}/{len}")?;
    let pg = multi
        .add(ProgressBar::new(count as u64))
        .with_style(style)
        .with_prefix(format!("{}", "[Vectors]".bold()));

    // Each vector owns its RNG, so the output does not depend on scheduling.
    (0..count).into_par_iter().try_for_each(|i| {
        let vector_seed = seed.wrapping_add(i as u64);
        let mut rng = StdRng::seed_from_u64(vector_seed);
        let signal = PdmSignal::random(channels, len, &mut rng).map_err(|e| e.to_string())?;
        let vector = TestVector {
            seed: vector_seed,
            channels,
            samples: len,
            input_words: signal.encode_interleaved(),
            expected: chain.filter(&signal),
        };
        let path = out_dir.join(format!("vector_{}.json", i));
        let file = File::create(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
        serde_json::to_writer(BufWriter::new(file), &vector).map_err(|e| e.to_string())?;
        trace!("wrote {}", path.display());
        pg.inc(1);
        Ok::<(), String>(())
    })?;

    pg.finish();
    info!("Wrote {} vectors to {}", count, out_dir.display());
    Ok(())
}
