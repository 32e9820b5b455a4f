//! Application dedicated to ElGamal throughput measurement
//!
//! Runs the batched ElGamal pipeline over a random benchmark group and optionally checks it
//! against the host reference. Falls back to the host path when no accelerator is usable.

use std::time::{Duration, Instant};

use anyhow::Context;
use gpumaths::pipeline::elgamal_chunk;
use gpumaths::{
    cryptops, Accelerator, BackendMode, CyclicGroup, GpuMathsConfig, Kernel, PoolMemory,
    StreamPool, Variant,
};
use num_bigint::{BigUint, RandBigInt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

/// Define CLI arguments
pub use clap::Parser;
#[derive(clap::Parser, Debug, Clone)]
#[clap(long_about = "gpumaths bench application: Run batched ElGamal on the selected backend.")]
pub struct Args {
    // Device configuration ------------------------------------------------------
    /// Toml configuration file
    #[clap(long, value_parser)]
    pub config: Option<String>,

    /// Override the configured backend
    #[clap(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Override the configured number of streams
    #[clap(long, value_parser)]
    pub streams: Option<usize>,

    /// Size every stream for this many items instead of the configured memory
    #[clap(long, value_parser)]
    pub slots: Option<usize>,

    // Exec configuration ----------------------------------------------------
    /// Modulus width of the random benchmark group
    #[clap(long, value_parser, default_value_t = 4096)]
    pub bits: u64,

    /// Number of ElGamal items per iteration
    #[clap(long, value_parser, default_value_t = 1024)]
    pub items: usize,

    /// Width of the private keys in bits
    #[clap(long, value_parser, default_value_t = 256)]
    pub key_bits: u64,

    /// Number of iterations
    #[clap(long, value_parser, default_value_t = 1)]
    pub iter: usize,

    /// Seed used for input generation
    #[clap(long, value_parser)]
    pub seed: Option<u64>,

    /// Also run the host reference and compare outputs
    #[clap(long, value_parser)]
    pub check: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
pub enum BackendArg {
    Auto,
    Cuda,
    Sim,
    Unsupported,
}

impl From<BackendArg> for BackendMode {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendMode::Auto,
            BackendArg::Cuda => BackendMode::Cuda,
            BackendArg::Sim => BackendMode::Sim(Default::default()),
            BackendArg::Unsupported => BackendMode::Unsupported,
        }
    }
}

struct Workload {
    group: CyclicGroup,
    private_keys: Vec<BigUint>,
    keys: Vec<BigUint>,
    public_cypher_key: BigUint,
    ecr_keys: Vec<BigUint>,
    cyphers: Vec<BigUint>,
}

impl Workload {
    fn new(args: &Args, rng: &mut StdRng) -> Self {
        let group = CyclicGroup::benchmark_group(args.bits, rng);
        let mut keys = Vec::with_capacity(args.items);
        let mut ecr_keys = Vec::with_capacity(args.items);
        let mut cyphers = Vec::with_capacity(args.items);
        for _ in 0..args.items {
            let item = group.random_bytes_inside(rng, 3);
            keys.push(BigUint::from_bytes_be(&item[0]));
            ecr_keys.push(BigUint::from_bytes_be(&item[1]));
            cyphers.push(BigUint::from_bytes_be(&item[2]));
        }
        let public_cypher_key = BigUint::from_bytes_be(&group.random_bytes_inside(rng, 1)[0]);
        let private_keys = (0..args.items)
            .map(|_| rng.gen_biguint(args.key_bits))
            .collect();
        Self {
            group,
            private_keys,
            keys,
            public_cypher_key,
            ecr_keys,
            cyphers,
        }
    }

    /// Host reference, one item per rayon task
    fn run_host(&self) -> (Vec<BigUint>, Vec<BigUint>) {
        (0..self.keys.len())
            .into_par_iter()
            .map(|i| {
                let mut ecr_key = self.ecr_keys[i].clone();
                let mut cypher = self.cyphers[i].clone();
                cryptops::elgamal(
                    &self.group,
                    &self.keys[i],
                    &self.private_keys[i],
                    &self.public_cypher_key,
                    &mut ecr_key,
                    &mut cypher,
                );
                (ecr_key, cypher)
            })
            .unzip()
    }

    fn run_pool(&self, pool: &StreamPool) -> gpumaths::Result<(Vec<BigUint>, Vec<BigUint>)> {
        let mut ecr_keys = self.ecr_keys.clone();
        let mut cyphers = self.cyphers.clone();
        elgamal_chunk(
            pool,
            &self.group,
            &self.private_keys,
            &self.keys,
            &self.public_cypher_key,
            &mut ecr_keys,
            &mut cyphers,
        )?;
        Ok((ecr_keys, cyphers))
    }
}

fn per_iter(elapsed: Duration, iter: usize) -> Duration {
    elapsed.div_f64(iter as f64)
}

fn report(label: &str, items: usize, iter: usize, elapsed: Duration) {
    let per_iter = per_iter(elapsed, iter);
    let rate = (items * iter) as f64 / elapsed.as_secs_f64();
    println!(" {label} -> {per_iter:?}/iter, {rate:.1} items/s");
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    println!("User Options: {args:?}");
    anyhow::ensure!(args.iter > 0, "--iter must be at least 1");

    // Register tracing subscriber that use env-filter
    // Select verbosity with env_var: e.g. `RUST_LOG=gpumaths=trace`
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        // Display source code file paths
        .with_file(false)
        // Display source code line numbers
        .with_line_number(false)
        .without_time()
        // Build & register the subscriber
        .init();

    // Configuration -----------------------------------------------------------
    let mut config = match args.config.as_ref() {
        Some(file) => GpuMathsConfig::from_toml(file),
        None => GpuMathsConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    if let Some(streams) = args.streams {
        config.pool.stream_count = streams;
    }
    if let Some(slots) = args.slots {
        config.pool.memory = PoolMemory::Slots {
            kernel: Kernel::ElGamal,
            modulus_bits: args.bits,
            slots,
        };
    }
    tracing::debug!("Effective configuration: {config:?}");

    // Seeder for inputs randomization -----------------------------------------
    let mut rng: StdRng = if let Some(seed) = args.seed {
        SeedableRng::seed_from_u64(seed)
    } else {
        SeedableRng::from_entropy()
    };
    let workload = Workload::new(&args, &mut rng);
    let variant = Variant::for_bit_len(args.bits).context("benchmark modulus")?;
    println!("Running {} ElGamal items on {variant}", args.items);

    // Accelerator --------------------------------------------------------------
    let accelerator = Accelerator::from_mode(&config.backend);
    let pool = if accelerator.is_available() {
        let pool = accelerator
            .open_configured_pool(&config.pool)
            .context("opening stream pool")?;
        println!(
            "Backend {}: {} streams of {} B, {} items per batch",
            accelerator.name(),
            pool.stream_count(),
            pool.memory_per_stream(),
            pool.max_slots(variant, Kernel::ElGamal)
        );
        Some(pool)
    } else {
        tracing::warn!("No usable accelerator, running the host path only");
        None
    };

    let mut accel_out = None;
    if let Some(pool) = pool.as_ref() {
        let start = Instant::now();
        for _ in 0..args.iter {
            accel_out = Some(workload.run_pool(pool).context("accelerator ElGamal")?);
        }
        report(accelerator.name(), args.items, args.iter, start.elapsed());
    }

    let mut host_out = None;
    if args.check || pool.is_none() {
        let start = Instant::now();
        for _ in 0..args.iter {
            host_out = Some(workload.run_host());
        }
        report("host", args.items, args.iter, start.elapsed());
    }

    if let (Some((a_ecr, a_cypher)), Some((h_ecr, h_cypher))) = (&accel_out, &host_out) {
        let mismatch = (0..args.items)
            .find(|i| a_ecr[*i] != h_ecr[*i] || a_cypher[*i] != h_cypher[*i]);
        if let Some(i) = mismatch {
            anyhow::bail!("Output mismatch on item {i}");
        }
        println!("Accelerator outputs match the host reference");
    }

    if let Some(pool) = pool {
        pool.close().context("closing stream pool")?;
        accelerator.reset_device().context("resetting device")?;
    }
    Ok(())
}
