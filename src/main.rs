//! blockgemm CLI - blocked matrix multiplication driver
//!
//! Generates two random `N x N` integer matrices, computes their product once
//! with a naive loop and once as a blocked task graph, and reports how many
//! elements disagree. Exits with status 1 on invalid arguments, a failed run,
//! or any mismatch.

use std::process::ExitCode;
use std::time::Instant;

use blockgemm::{
    block_matmul, error::validation_error, utils, BlockStore, Config, DeviceTarget,
    ExecutionTarget, HostTarget, KernelMode, StagingStrategy,
};
use clap::{Parser, ValueEnum};
use rand::{rngs::StdRng, SeedableRng};

/// Where the block products run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TargetKind {
    /// Compute directly on host memory
    Host,
    /// Compute on a simulated accelerator with staged copies
    Device,
}

/// Blocked matrix multiplication over a dependency-ordered task graph
#[derive(Parser, Debug)]
#[command(name = "blockgemm")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Matrix edge length
    #[arg(value_name = "N")]
    n: usize,

    /// Block edge length, must divide N
    #[arg(value_name = "BS")]
    block_size: usize,

    /// Staging strategy: inline or bulk (default from BLOCKGEMM_STRATEGY, else bulk)
    #[arg(short, long)]
    strategy: Option<StagingStrategy>,

    /// Execution target
    #[arg(short, long, value_enum, default_value_t = TargetKind::Host)]
    target: TargetKind,

    /// Block kernel: serial or parallel (default from BLOCKGEMM_KERNEL, else serial)
    #[arg(short, long)]
    kernel: Option<KernelMode>,

    /// Worker threads, 0 for one per core (default from BLOCKGEMM_THREADS)
    #[arg(long)]
    threads: Option<usize>,

    /// Seed for the input matrices (random if omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Print the inputs and the blocked result
    #[arg(long)]
    print: bool,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::from_env();
        if let Some(threads) = self.threads {
            config = config.with_threads(threads);
        }
        if let Some(strategy) = self.strategy {
            config = config.with_strategy(strategy);
        }
        if let Some(kernel) = self.kernel {
            config = config.with_kernel(kernel);
        }
        config
    }

    /// The `--seed` value, or a fresh random one.
    fn input_seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }

    fn validate(&self) -> blockgemm::Result<()> {
        if self.n == 0 {
            return Err(validation_error(format!(
                "invalid matrix size {}, N must be positive",
                self.n
            )));
        }
        if self.block_size == 0 || self.n % self.block_size != 0 {
            return Err(validation_error(format!(
                "invalid block size {} for N={}, it must divide N",
                self.block_size, self.n
            )));
        }
        Ok(())
    }
}

fn run(cli: &Cli) -> blockgemm::Result<usize> {
    cli.validate()?;
    let config = cli.config();
    let (n, bs) = (cli.n, cli.block_size);

    let seed = cli.input_seed();
    println!("Input seed: {}", seed);
    let mut rng = StdRng::seed_from_u64(seed);
    let a: Vec<i64> = utils::random_matrix(n, &mut rng);
    let b: Vec<i64> = utils::random_matrix(n, &mut rng);

    let start = Instant::now();
    let expected = utils::reference_matmul(&a, &b, n);
    println!(
        "Local MatMul Computation done in {:.6}s",
        start.elapsed().as_secs_f64()
    );

    let block_a = BlockStore::from_flat(bs, bs, n, n, &a)?;
    let block_b = BlockStore::from_flat(bs, bs, n, n, &b)?;
    let mut block_c = BlockStore::square(bs, n)?;

    let device = DeviceTarget::<i64>::new();
    let target: &dyn ExecutionTarget<i64> = match cli.target {
        TargetKind::Host => &HostTarget,
        TargetKind::Device => &device,
    };

    let start = Instant::now();
    let stats = block_matmul(&block_a, &block_b, &mut block_c, target, &config)?;
    println!(
        "Offloaded MatMul Computation done in {:.6}s ({} tasks, {} staging, {} target)",
        start.elapsed().as_secs_f64(),
        stats.tasks_executed,
        config.strategy,
        target.name()
    );
    if cli.target == TargetKind::Device {
        let transfers = device.stats();
        println!(
            "Transfers: {} in ({} bytes), {} out ({} bytes), {} releases",
            transfers.copies_in,
            transfers.bytes_in,
            transfers.copies_out,
            transfers.bytes_out,
            transfers.releases
        );
    }

    if cli.print {
        println!("A:\n{}", utils::format_matrix(&a, n, n));
        println!("B:\n{}", utils::format_matrix(&b, n, n));
        println!("Blocked C:\n{}", block_c);
    }

    block_c.compare(&expected)
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(mismatches) => {
            println!("Non-Matching Block Outputs: {}", mismatches);
            if mismatches == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("blockgemm").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_explicit_seed_is_reused() {
        let cli = parse(&["8", "2", "--seed", "7"]);
        assert_eq!(cli.input_seed(), 7);
        assert_eq!(cli.input_seed(), 7);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let cli = parse(&["8", "4", "--seed", "1234", "--target", "device"]);
        assert_eq!(run(&cli).unwrap(), 0);

        let mut first = StdRng::seed_from_u64(cli.input_seed());
        let mut second = StdRng::seed_from_u64(cli.input_seed());
        let a: Vec<i64> = utils::random_matrix(8, &mut first);
        let b: Vec<i64> = utils::random_matrix(8, &mut second);
        assert_eq!(a, b);
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse(&["4", "2", "--strategy", "inline", "--kernel", "parallel", "--threads", "2"]);
        let config = cli.config();
        assert_eq!(config.strategy, StagingStrategy::Inline);
        assert_eq!(config.kernel, KernelMode::Parallel);
        assert_eq!(config.num_threads, 2);
    }

    #[test]
    fn test_rejects_non_dividing_block_size() {
        assert!(parse(&["6", "4"]).validate().is_err());
        assert!(parse(&["0", "1"]).validate().is_err());
        assert!(parse(&["6", "3"]).validate().is_ok());
    }
}
