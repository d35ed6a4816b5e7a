//! Run configuration.
//!
//! A [`Config`] is plain data passed to [`crate::matmul::block_matmul`]; there
//! is no process-wide state. [`Config::from_env`] starts from the defaults and
//! applies these overrides when they are set:
//!
//! | variable              | values                     |
//! |-----------------------|----------------------------|
//! | `BLOCKGEMM_THREADS`   | worker count, `0` = Rayon default |
//! | `BLOCKGEMM_STRATEGY`  | `inline` or `bulk`         |
//! | `BLOCKGEMM_KERNEL`    | `serial` or `parallel`     |
//!
//! Values that fail to parse are logged and ignored.

use std::fmt::Display;
use std::str::FromStr;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{thread_pool_error, Result};
use crate::kernel::KernelMode;
use crate::matmul::StagingStrategy;

pub const THREADS_ENV: &str = "BLOCKGEMM_THREADS";
pub const STRATEGY_ENV: &str = "BLOCKGEMM_STRATEGY";
pub const KERNEL_ENV: &str = "BLOCKGEMM_KERNEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config {
    /// Worker threads for the task pool. `0` lets Rayon pick.
    pub num_threads: usize,
    /// How block data moves to and from the target.
    pub strategy: StagingStrategy,
    /// Kernel body run by each multiply task.
    pub kernel: KernelMode,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_strategy(mut self, strategy: StagingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_kernel(mut self, kernel: KernelMode) -> Self {
        self.kernel = kernel;
        self
    }

    /// Defaults overridden by the `BLOCKGEMM_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().override_with(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up by variable name.
    pub fn override_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(threads) = parse_override(&lookup, THREADS_ENV) {
            self.num_threads = threads;
        }
        if let Some(strategy) = parse_override(&lookup, STRATEGY_ENV) {
            self.strategy = strategy;
        }
        if let Some(kernel) = parse_override(&lookup, KERNEL_ENV) {
            self.kernel = kernel;
        }
        self
    }

    /// Builds the worker pool this configuration asks for.
    pub fn build_pool(&self) -> Result<ThreadPool> {
        ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .thread_name(|index| format!("blockgemm-worker-{}", index))
            .build()
            .map_err(|e| thread_pool_error(e.to_string()))
    }
}

fn parse_override<V, F>(lookup: &F, name: &str) -> Option<V>
where
    V: FromStr,
    V::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}
