//! Tolk compiler CLI
//!
//! Command-line access to the pieces of the compiler core that work on
//! their own: the peephole optimizer over assembly listings, and shell
//! completion generation. The full source-to-assembly path needs a
//! front-end, which links against the library instead.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

use tolkc::{optimize_listing, OptimizationLevel, TOLK_VERSION};

#[derive(Parser)]
#[command(name = "tolkc")]
#[command(version = TOLK_VERSION)]
#[command(about = "Tolk compiler core - optimize TVM assembly", long_about = None)]
struct Cli {
    /// Log progress (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the peephole optimizer over an assembly listing
    Opt {
        /// Input file with one instruction per line (- for stdin)
        input: PathBuf,

        /// Output path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Optimization level (0 disables, 1 stack ops only, 2 full)
        #[arg(short = 'O', long = "opt-level", default_value = "2")]
        opt_level: u8,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Opt {
            input,
            output,
            opt_level,
        } => {
            run_opt(&input, output.as_deref(), opt_level);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "tolkc", &mut io::stdout());
        }
    }
}

fn run_opt(input: &std::path::Path, output: Option<&std::path::Path>, opt_level: u8) {
    let source = if input.as_os_str() == "-" {
        let mut buf = String::new();
        if let Err(e) = io::Read::read_to_string(&mut io::stdin(), &mut buf) {
            eprintln!("error: cannot read stdin: {}", e);
            process::exit(1);
        }
        buf
    } else {
        match fs::read_to_string(input) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error: cannot read {}: {}", input.display(), e);
                process::exit(1);
            }
        }
    };

    let level = match opt_level {
        0 => OptimizationLevel::O0,
        1 => OptimizationLevel::O1,
        _ => OptimizationLevel::O2,
    };
    let result = optimize_listing(&source, level);

    match output {
        Some(path) => {
            if let Err(e) = fs::write(path, result) {
                eprintln!("error: cannot write {}: {}", path.display(), e);
                process::exit(1);
            }
        }
        None => {
            if let Err(e) = io::stdout().write_all(result.as_bytes()) {
                eprintln!("error: {}", e);
                process::exit(1);
            }
        }
    }
}
