use std::process;

use equihash_gpu::is_valid_solution;
use gumdrop::Options;

#[derive(Debug, Options)]
pub(crate) struct VerifyOptions {
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

    #[options(no_short, required, help = "The nonce the solution was found at")]
    nonce: u32,

    #[options(no_short, required, meta = "HEX", help = "Hex-encoded minimal solution")]
    solution: String,
}

pub(crate) fn run(opts: VerifyOptions) {
    let params = super::parameters(opts.n, opts.k);
    let seed = super::seed(opts.seed, opts.seed_hex.as_deref());
    let solution = hex::decode(&opts.solution)
        .unwrap_or_else(|_| super::usage_error("Solution is not valid hex"));

    match is_valid_solution(
        params.n(),
        params.k(),
        seed.as_bytes(),
        &opts.nonce.to_le_bytes(),
        &solution,
    ) {
        Ok(()) => println!("valid"),
        Err(e) => {
            println!("{}", e);
            process::exit(1);
        }
    }
}
