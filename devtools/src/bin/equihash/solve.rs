use std::process;

use equihash_gpu::{
    backend::host::{HostBackend, HostConfig},
    Solver, SolverConfig,
};
use gumdrop::Options;
use tracing::info;

#[derive(Debug, Options)]
pub(crate) struct SolveOptions {
    #[options(help = "Print this help output")]
    help: bool,

    #[options(short = "n", required, help = "Equihash parameter N (1 to 255)")]
    n: u32,

    #[options(short = "k", required, help = "Equihash parameter K (1 to 20)")]
    k: u32,

    #[options(
        short = "s",
        meta = "VALUE",
        help = "Seed value written into each seed word (1 to 0xFFFFFF)"
    )]
    seed: Option<u32>,

    #[options(no_short, meta = "HEX", help = "Seed as 16 hex-encoded bytes")]
    seed_hex: Option<String>,

    #[options(no_short, default = "1", help = "Number of host devices to emulate")]
    devices: usize,

    #[options(no_short, meta = "START", default = "0", help = "First nonce to try")]
    nonce: u32,

    #[options(
        no_short,
        meta = "COUNT",
        default = "256",
        help = "Number of nonces to try"
    )]
    attempts: u32,
}

pub(crate) fn run(opts: SolveOptions) {
    let params = super::parameters(opts.n, opts.k);
    let seed = super::seed(opts.seed, opts.seed_hex.as_deref());
    if opts.devices == 0 {
        super::usage_error("At least one device is required");
    }

    let backend = HostBackend::new(HostConfig::default().with_devices(opts.devices))
        .unwrap_or_else(|e| fail(e));
    let config = SolverConfig::default()
        .with_initial_nonce(opts.nonce)
        .with_max_attempts(opts.attempts);
    let mut solver = Solver::new(&backend, params, config).unwrap_or_else(|e| fail(e));

    let proofs = solver.find_proof(&seed).unwrap_or_else(|e| fail(e));
    if proofs.is_empty() {
        println!("no proof found");
        process::exit(1);
    }

    info!(
        allocated = backend.allocated_bytes(),
        "Search finished"
    );
    for proof in proofs {
        println!(
            "nonce {}: {}",
            proof.nonce(),
            hex::encode(proof.solution())
        );
    }
}

fn fail(e: equihash_gpu::Error) -> ! {
    eprintln!("Error: {}", e);
    process::exit(1);
}
