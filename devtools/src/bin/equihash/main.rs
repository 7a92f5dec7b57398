use std::env;
use std::io;
use std::process;

use equihash_gpu::{ParameterSet, Seed, SEED_LENGTH};
use gumdrop::{Options, ParsingStyle};
use tracing_subscriber::EnvFilter;

mod solve;
mod verify;

const MAX_N: u32 = 255;
const MAX_K: u32 = 20;
const MAX_SEED_VALUE: u32 = 0xFF_FFFF;

#[derive(Debug, Options)]
struct CliOptions {
    #[options(help = "Print this help output")]
    help: bool,

    #[options(command)]
    command: Option<Command>,
}

#[derive(Debug, Options)]
enum Command {
    #[options(help = "Search for Equihash solutions on the host backend")]
    Solve(solve::SolveOptions),

    #[options(help = "Check an Equihash solution")]
    Verify(verify::VerifyOptions),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = env::args().collect::<Vec<_>>();
    let opts = CliOptions::parse_args(&args[1..], ParsingStyle::default()).unwrap_or_else(|e| {
        eprintln!("{}: {}", args[0], e);
        process::exit(2);
    });

    if opts.help_requested() {
        match &opts.command {
            Some(command) => println!("{}", command.self_usage()),
            None => print_usage(&args[0]),
        }
        return;
    }

    match opts.command {
        Some(Command::Solve(opts)) => solve::run(opts),
        Some(Command::Verify(opts)) => verify::run(opts),
        None => {
            print_usage(&args[0]);
            process::exit(2);
        }
    }
}

fn print_usage(bin: &str) {
    println!("Usage: {} <command> [options]", bin);
    println!();
    println!("{}", CliOptions::usage());
    println!();
    println!("Commands:");
    println!("{}", Command::command_list().unwrap_or_default());
}

/// Prints `msg` and exits with the status for invalid arguments.
fn usage_error(msg: impl std::fmt::Display) -> ! {
    eprintln!("{}", msg);
    process::exit(2);
}

/// Checks the `(n, k)` ranges accepted on the command line and derives the parameters.
fn parameters(n: u32, k: u32) -> ParameterSet {
    if !(1..=MAX_N).contains(&n) {
        usage_error(format!("N must be between 1 and {}", MAX_N));
    }
    if !(1..=MAX_K).contains(&k) {
        usage_error(format!("K must be between 1 and {}", MAX_K));
    }
    ParameterSet::derive(n, k).unwrap_or_else(|e| usage_error(e))
}

/// Builds the seed from exactly one of a replicated value or its hex encoding.
fn seed(value: Option<u32>, seed_hex: Option<&str>) -> Seed {
    match (value, seed_hex) {
        (Some(value), None) => {
            if !(1..=MAX_SEED_VALUE).contains(&value) {
                usage_error(format!(
                    "Seed value must be between 1 and {:#x}",
                    MAX_SEED_VALUE
                ));
            }
            Seed::repeated(value)
        }
        (None, Some(encoded)) => {
            let bytes = hex::decode(encoded)
                .ok()
                .and_then(|bytes| <[u8; SEED_LENGTH]>::try_from(bytes).ok())
                .unwrap_or_else(|| {
                    usage_error(format!(
                        "Seed must be {} hex-encoded bytes",
                        SEED_LENGTH
                    ))
                });
            Seed::from_bytes(bytes)
        }
        (Some(_), Some(_)) => usage_error("Give either --seed or --seed-hex, not both"),
        (None, None) => usage_error("A seed is required (--seed or --seed-hex)"),
    }
}
