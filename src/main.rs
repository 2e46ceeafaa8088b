// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use cacheleak::{config::SimConfig, itc, scheme::IndexScheme, SimulationResult};
use clap::{Parser, ValueEnum};
use log::{info, warn, LevelFilter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Preset {
    /// Single core with private L2 and shared L3
    Default,
    /// Four core Ivy Bridge like hierarchy
    Ivybridge,
}

#[derive(Parser, Debug)]
#[command(version)]
struct CmdlineArgs {
    /// Trace files, one reference stream each
    #[arg(required = true, value_parser = file_exists)]
    traces: Vec<String>,
    /// JSON hierarchy configuration. Overrides `--preset`.
    #[arg(short, long, value_parser = file_exists)]
    config: Option<String>,
    /// Built-in hierarchy
    #[arg(long, value_enum, default_value = "default")]
    preset: Preset,
    /// Index scheme (0-9) of the instrumented caches. Repeat to compare schemes.
    #[arg(short, long = "scheme", value_parser = clap::value_parser!(u8).range(0..10))]
    schemes: Vec<u8>,
    /// Cache level observed by the leakage analysis
    #[arg(short, long)]
    level: Option<u8>,
    /// Flush and re-key the instrumented caches every N of their references
    #[arg(long)]
    flush: Option<u64>,
    /// Step the active associativity every N references
    #[arg(long)]
    dynamic: Option<u64>,
    /// Seed of the key generator
    #[arg(long)]
    seed: Option<u64>,
    /// Trace records carry no data values
    #[arg(long)]
    no_data: bool,
    /// Issue references of the trace files in turn instead of by clock
    #[arg(long)]
    strict_order: bool,
    /// Per set leakage summary
    #[arg(long, default_value = "leakage_summary.csv")]
    summary: PathBuf,
    /// Per set and bit leakage detail
    #[arg(long, default_value = "leakage_detail.csv")]
    detail: PathBuf,
    /// Also write the leakage report as JSON
    #[arg(long)]
    json: Option<PathBuf>,
    /// Print cache statistics
    #[arg(long)]
    stats: bool,
    /// Worker threads
    #[arg(short, long, default_value_t = num_cpus::get())]
    jobs: usize,
    /// Verbosity: `-v`: Info, `-vv`: Debug, `-vvv`: Trace
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn file_exists(s: &str) -> Result<String, String> {
    if Path::new(s).exists() {
        Ok(s.into())
    } else {
        Err(format!("File `{s}` does not exist."))
    }
}

impl CmdlineArgs {
    fn config(&self) -> Result<SimConfig> {
        let mut config = match (&self.config, self.preset) {
            (Some(path), _) => SimConfig::from_file(path)?,
            (None, Preset::Default) => SimConfig::default(),
            (None, Preset::Ivybridge) => SimConfig::ivybridge(),
        };
        if let Some(level) = self.level {
            config.instrumented_level = level;
        }
        if let Some(flush) = self.flush {
            config.flush_threshold = flush;
        }
        if let Some(dynamic) = self.dynamic {
            config.dynamic_threshold = dynamic;
        }
        if let Some(seed) = self.seed {
            config.key_seed = seed;
        }
        config.strict_order |= self.strict_order;
        Ok(config)
    }

    fn schemes(&self, config: &SimConfig) -> Result<Vec<IndexScheme>> {
        if self.schemes.is_empty() {
            return Ok(vec![config.scheme]);
        }
        Ok(self
            .schemes
            .iter()
            .map(|&id| IndexScheme::try_from(id))
            .collect::<Result<_, _>>()?)
    }
}

/// `leakage_summary.csv` becomes `leakage_summary_8.csv` for scheme 8.
fn output_path(path: &Path, scheme: Option<IndexScheme>) -> PathBuf {
    let Some(scheme) = scheme else {
        return path.to_path_buf();
    };
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path.extension() {
        Some(ext) => path.with_file_name(format!("{stem}_{}.{}", scheme.id(), ext.to_string_lossy())),
        None => path.with_file_name(format!("{stem}_{}", scheme.id())),
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path).with_context(|| {
        format!("Could not create {}", path.display())
    })?))
}

fn write_reports(args: &CmdlineArgs, result: &SimulationResult, suffix: Option<IndexScheme>) -> Result<()> {
    let path = output_path(&args.summary, suffix);
    let mut writer = create(&path)?;
    result.leakage.write_summary(&mut writer)?;
    writer.flush()?;
    info!("Wrote {}", path.display());

    let path = output_path(&args.detail, suffix);
    let mut writer = create(&path)?;
    result.leakage.write_detail(&mut writer)?;
    writer.flush()?;
    info!("Wrote {}", path.display());

    if let Some(json) = &args.json {
        let path = output_path(json, suffix);
        let mut writer = create(&path)?;
        serde_json::to_writer_pretty(&mut writer, &result.leakage)?;
        writer.flush()?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CmdlineArgs::parse();
    simple_logger::SimpleLogger::new()
        .with_level(match args.verbose {
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            3 => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        })
        .init()?;

    let config = args.config()?;
    let schemes = args.schemes(&config)?;
    if config.instrumented_level == 0 {
        warn!("No instrumented level, only cache statistics are collected");
    }

    let results = itc::sweep(&config, &args.traces, !args.no_data, &schemes, args.jobs)?;
    let several = results.len() > 1;
    for result in &results {
        info!(
            "Scheme {}: {} references, weighted leakage {:.4}, weighted correlation leakage {:.4}",
            result.scheme,
            result.summary.references,
            result.leakage.weighted_leakage(),
            result.leakage.weighted_correlation_leakage()
        );
        if config.instrumented_level > 0 {
            write_reports(&args, result, several.then_some(result.scheme))?;
        }
        if args.stats {
            if several {
                println!("== scheme {} ==", result.scheme);
            }
            print!("{}", result.stats);
        }
    }
    Ok(())
}
