//! # Segclock CLI
//!
//! Command-line driver for the zebrafish segmentation-clock simulators.
//!
//! ## Quick start
//!
//! ```bash
//! # Screen 500 random parameter sets deterministically
//! segclock det -p 500 -s 1 -o results
//!
//! # Re-run an accepted set on a 4x4 tissue with trace output
//! segclock det -i results/det-passed.csv -x 4 -y 4 -w -o tissue
//!
//! # Stochastic two-cell run with tau-leaping
//! segclock sto -i set.csv -m 600 -a -o traces
//! ```

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use segclock_core::{
    generate_set, level_index, parse_parameter_line, run_battery, BatteryVerdict, ClockError,
    Mutant, OscillationFeatures, RateSet, RejectCause, RunContext, MUTANT_SEQUENCE,
};
use segclock_det::{DetConfig, DetSimulator};
use segclock_sto::{StoConfig, StoSimulator};

const MAX_INPUT_BYTES: u64 = 400 * 1024 * 1024;

/// Segclock - zebrafish segmentation clock simulators
#[derive(Parser)]
#[command(name = "segclock")]
#[command(version)]
#[command(about = "Simulate the zebrafish segmentation clock", long_about = LONG_ABOUT)]
#[command(after_help = AFTER_HELP)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Disable coloring the terminal output
    #[arg(short = 'c', long = "no-color", global = true)]
    no_color: bool,

    /// Hide progress output
    #[arg(short, long, global = true)]
    quiet: bool,
}

const LONG_ABOUT: &str = r#"
Segclock simulates the her1/her7/her13/delta gene network that drives
somite segmentation in zebrafish, on two-cell, chain, or hexagonal
tissues.

The deterministic core integrates the delay differential equations with
Euler's method and screens parameter sets against wild-type and mutant
oscillation conditions. The stochastic core runs the same network with
a hybrid of the next-reaction method and adaptive delay-aware
tau-leaping.
"#;

const AFTER_HELP: &str = r#"EXAMPLES:
    segclock det -p 100 -s 1 -o screen      Screen 100 random sets
    segclock det -i sets.csv -w -o out      Screen sets from a file, write traces
    segclock sto -i set.csv -m 1200 -o out  Exact stochastic run
    segclock sto -i set.csv -a -x 10 -y 6   Tau-leaping on a 10x6 tissue

TISSUE SIZES:
    two-cell  x=2, y=1
    chain     x>=3, y=1 (wraps horizontally)
    tissue    x>=4 and even, y>=4 and even (hexagonal, wraps both ways)
"#;

#[derive(Subcommand)]
enum Commands {
    /// Deterministic DDE screen over parameter sets
    Det(DetArgs),

    /// Stochastic simulation writing concentration traces
    Sto(StoArgs),
}

#[derive(Args)]
struct DetArgs {
    /// Tissue width in cells
    #[arg(short = 'x', long = "width", default_value_t = 2)]
    width: usize,

    /// Tissue height in cells
    #[arg(short = 'y', long = "height", default_value_t = 1)]
    height: usize,

    /// Minutes to simulate per run
    #[arg(short, long, default_value_t = 1200.0)]
    minutes: f64,

    /// Euler step in minutes
    #[arg(short, long, default_value_t = 0.01)]
    epsilon: f64,

    /// Number of parameter sets to simulate
    #[arg(short = 'p', long = "parameters", default_value_t = 1)]
    parameters: usize,

    /// Seed for the random generator (default: time and pid)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Parameter file; omit to draw random sets
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Abort threshold for the stochastic propensity forms
    #[arg(short = 'a', long = "propensities")]
    propensities: Option<f64>,

    /// Write oscillation features of accepted sets to this file
    #[arg(short = 'f', long = "ofeatures")]
    ofeatures: Option<PathBuf>,

    /// Spatial gradients file
    #[arg(long)]
    gradients: Option<PathBuf>,

    /// Windows over which gradient positions advance
    #[arg(long, default_value_t = 50)]
    gradient_windows: usize,

    /// Write her1 traces of each simulated mutant
    #[arg(short = 'w', long = "write")]
    write: bool,
}

#[derive(Args)]
struct StoArgs {
    /// Tissue width in cells
    #[arg(short = 'x', long = "width", default_value_t = 2)]
    width: usize,

    /// Tissue height in cells
    #[arg(short = 'y', long = "height", default_value_t = 1)]
    height: usize,

    /// Minutes to simulate per run
    #[arg(short, long, default_value_t = 1200.0)]
    minutes: f64,

    /// Maximum number of scheduler steps per run
    #[arg(short = 't', long = "time-steps", default_value_t = 1_000_000_000_000)]
    time_steps: u64,

    /// Number of runs
    #[arg(short, long, default_value_t = 1)]
    runs: usize,

    /// Seed for the random generator (default: time and pid)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Parameter file (first line is used)
    #[arg(short, long, default_value = "input.txt")]
    input: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Concentration level to print (her1, Her1, Delta, Her7Her13, ...)
    #[arg(short = 'l', long = "con-level", default_value = "her1")]
    con_level: String,

    /// Minutes of simulated time between output lines
    #[arg(short, long, default_value_t = 0.1)]
    granularity: f64,

    /// Minutes between output file flushes
    #[arg(short = 'p', long = "print", default_value_t = 1200.0)]
    print_interval: f64,

    /// File name for the persisted seed, relative to the output directory
    #[arg(short = 'k', long = "keep-seed", default_value = "seed.txt")]
    seed_file: String,

    /// Approximate the simulation with tau-leaping for faster results
    #[arg(short = 'a', long = "approximate")]
    approximate: bool,

    /// Spatial gradients file
    #[arg(long)]
    gradients: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let usage_error = err.use_stderr();
            let _ = err.print();
            return if usage_error {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    if cli.no_color {
        colored::control::set_override(false);
    }
    let quiet = cli.quiet;

    let outcome = match cli.command {
        Commands::Det(args) => run_det(args, quiet),
        Commands::Sto(args) => run_sto(args, quiet),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", format!("{err:#}").red());
            let code = err
                .downcast_ref::<ClockError>()
                .map(exit_code_for)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn exit_code_for(err: &ClockError) -> u8 {
    match err {
        ClockError::Config(_) | ClockError::Parse(_) | ClockError::Io(_) => 1,
        ClockError::Resource(_) => 2,
        ClockError::Read(_) => 3,
    }
}

/// Read a whole input file, enforcing the size cap the parsers assume.
fn read_input(path: &Path) -> std::result::Result<String, ClockError> {
    let mut file = fs::File::open(path)
        .map_err(|e| ClockError::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))))?;
    let size = file.metadata()?.len();
    if size > MAX_INPUT_BYTES {
        return Err(ClockError::Resource(format!(
            "{} is too large (400 MB limit)",
            path.display()
        )));
    }
    let mut buffer = String::with_capacity(size as usize);
    file.read_to_string(&mut buffer)
        .map_err(|e| ClockError::Read(format!("{}: {e}", path.display())))?;
    Ok(buffer)
}

fn note(quiet: bool, action: &str, subject: &str) {
    if !quiet {
        println!("{} {}", action.blue(), subject);
    }
}

fn make_context(seed: Option<u64>) -> RunContext {
    match seed {
        Some(s) => RunContext::from_seed(s),
        None => RunContext::from_entropy(),
    }
}

fn persist_seed(dir: &Path, name: &str, ctx: &RunContext) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, format!("{}\n", ctx.seed))
        .with_context(|| format!("couldn't write {}", path.display()))?;
    Ok(())
}

fn progress_bar(quiet: bool, len: u64) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    bar
}

// =============================================================================
// DETERMINISTIC SCREEN
// =============================================================================

fn run_det(args: DetArgs, quiet: bool) -> Result<()> {
    let cfg = DetConfig {
        width: args.width,
        height: args.height,
        minutes: args.minutes,
        epsilon: args.epsilon,
        max_propensity: args.propensities,
        gradient_windows: args.gradient_windows,
    };
    let mut sim = DetSimulator::new(cfg)?;
    let mut ctx = make_context(args.seed);

    fs::create_dir_all(&args.output)
        .with_context(|| format!("couldn't create {} directory", args.output.display()))?;
    persist_seed(&args.output, "seed.txt", &ctx)?;

    let input_text = match &args.input {
        Some(path) => {
            note(quiet, "Reading", &path.display().to_string());
            Some(read_input(path)?)
        }
        None => None,
    };
    let mut input_lines = input_text.as_deref().map(|t| t.lines());

    let gradient_text = match &args.gradients {
        Some(path) => {
            note(quiet, "Reading", &path.display().to_string());
            Some(read_input(path)?)
        }
        None => None,
    };

    let passed_path = args.output.join("det-passed.csv");
    note(quiet, "Creating", &passed_path.display().to_string());
    let mut passed = fs::File::create(&passed_path)
        .with_context(|| format!("couldn't create {}", passed_path.display()))?;

    let mut features_file = match &args.ofeatures {
        Some(path) => {
            let mut file = fs::File::create(path)
                .with_context(|| format!("couldn't create {}", path.display()))?;
            writeln!(file, "{}", features_header())?;
            Some(file)
        }
        None => None,
    };

    if args.write {
        for mutant in MUTANT_SEQUENCE {
            let dir = args.output.join(mutant.label());
            fs::create_dir_all(&dir)
                .with_context(|| format!("couldn't create {} directory", dir.display()))?;
        }
    }

    let bar = progress_bar(quiet, args.parameters as u64);
    let mut accepted = 0usize;

    for set_index in 0..args.parameters {
        let values = match input_lines.as_mut() {
            Some(lines) => {
                let line = lines.next().ok_or_else(|| {
                    ClockError::Parse(format!(
                        "parameter file ended before set {set_index}"
                    ))
                })?;
                parse_parameter_line(line)?
            }
            None => generate_set(&mut ctx),
        };
        let mut rates = RateSet::new(&values, args.width)?;
        if let Some(text) = &gradient_text {
            rates.apply_gradient_text(text)?;
        }

        let mut trace_error: Option<std::io::Error> = None;
        let verdict = run_battery(&mut sim, &mut rates, &mut ctx, |mutant, sim| {
            if args.write && trace_error.is_none() {
                let path = args.output.join(mutant.label()).join("run0.txt");
                if let Err(e) = write_plot(&path, sim) {
                    trace_error = Some(e);
                }
            }
        });
        if let Some(e) = trace_error {
            return Err(ClockError::Io(e).into());
        }

        match verdict {
            BatteryVerdict::Accepted(features) => {
                accepted += 1;
                write_rate_line(&mut passed, &rates)?;
                if let Some(file) = features_file.as_mut() {
                    write_features_line(file, set_index, &features)?;
                }
                bar.println(format!("Parameter set {set_index} passed").blue().to_string());
            }
            BatteryVerdict::Rejected { stage, cause } => {
                if !quiet {
                    let reason = match cause {
                        RejectCause::Aborted(failure) => failure.to_string(),
                        RejectCause::Predicate => {
                            format!("{} condition failed", stage.label())
                        }
                    };
                    bar.println(format!("Parameter set {set_index} skipped: {reason}"));
                }
            }
        }
        bar.inc(1);
    }

    bar.finish_and_clear();
    if !quiet {
        println!(
            "{} {accepted} of {} parameter sets passed",
            "Done:".blue(),
            args.parameters
        );
    }
    Ok(())
}

fn features_header() -> String {
    let mut header = String::from("set");
    for label in ["wt", "delta", "her1", "her7", "her13", "her713"] {
        header.push_str(&format!(
            ",per {label},amp {label},peak to trough {label}"
        ));
    }
    header
}

fn write_features_line(
    file: &mut fs::File,
    set_index: usize,
    features: &[OscillationFeatures],
) -> Result<()> {
    // battery order is wt, delta, her13, her1, her7, her713; the features
    // file lists her1 and her7 before her13
    let order = [
        Mutant::Wild,
        Mutant::Delta,
        Mutant::Her1,
        Mutant::Her7,
        Mutant::Her13,
        Mutant::Her713,
    ];
    write!(file, "{set_index}")?;
    for mutant in order {
        let i = MUTANT_SEQUENCE.iter().position(|&m| m == mutant).unwrap();
        let f = &features[i];
        write!(file, ",{},{},{}", f.period, f.amplitude, f.peak_to_trough)?;
    }
    writeln!(file)?;
    Ok(())
}

fn write_rate_line(file: &mut fs::File, rates: &RateSet) -> Result<()> {
    let line = rates
        .base_values()
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    writeln!(file, "{line}")?;
    Ok(())
}

fn write_plot(path: &Path, sim: &DetSimulator) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    for (n, value) in sim.plot_samples(0.1) {
        writeln!(file, "{n} {value}")?;
    }
    Ok(())
}

// =============================================================================
// STOCHASTIC RUNS
// =============================================================================

fn run_sto(args: StoArgs, quiet: bool) -> Result<()> {
    let level = level_index(&args.con_level).ok_or_else(|| {
        ClockError::Config(format!(
            "unknown concentration level `{}`; use an mRNA (her1), protein (Her1), \
             or dimer (Her1Her13) name",
            args.con_level
        ))
    })?;

    let cfg = StoConfig {
        width: args.width,
        height: args.height,
        minutes: args.minutes,
        max_steps: args.time_steps,
        granularity: args.granularity,
        print_interval: args.print_interval,
        approximate: args.approximate,
    };
    let mut sim = StoSimulator::new(cfg)?;
    let mut ctx = make_context(args.seed);

    fs::create_dir_all(&args.output)
        .with_context(|| format!("couldn't create {} directory", args.output.display()))?;
    persist_seed(&args.output, &args.seed_file, &ctx)?;

    note(quiet, "Reading", &args.input.display().to_string());
    let input_text = read_input(&args.input)?;
    let first_line = input_text.lines().next().ok_or_else(|| {
        ClockError::Parse(format!("{} holds no parameter set", args.input.display()))
    })?;
    let values = parse_parameter_line(first_line)?;
    let mut rates = RateSet::new(&values, args.width)?;
    if let Some(path) = &args.gradients {
        note(quiet, "Reading", &path.display().to_string());
        rates.apply_gradient_text(&read_input(path)?)?;
    }

    for run in 0..args.runs {
        let path = args.output.join(format!("run{run}.txt"));
        note(quiet, "Creating", &path.display().to_string());
        let mut file = std::io::BufWriter::new(
            fs::File::create(&path)
                .with_context(|| format!("couldn't create {}", path.display()))?,
        );
        writeln!(file, "{} {}", args.width, args.height)?;

        if !quiet {
            print!("{} run #{run} ... ", "Simulating".blue());
            std::io::stdout().flush().ok();
        }
        let stats = sim.run(&rates, &mut ctx, level, Some(&mut file as &mut dyn Write))?;
        if !quiet {
            println!(
                "{} ({:.1} min, {} exact steps, {} leaps, {} merges)",
                "Done".blue(),
                stats.simulated_minutes,
                stats.exact_steps,
                stats.leaps,
                stats.merged_nodes
            );
        }
    }
    Ok(())
}
