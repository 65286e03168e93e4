mod build;
mod lookup;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use rtcrack_core::{Backend, DEFAULT_ALPHA, DEFAULT_CHAIN_LENGTH};

/// Rainbow table builds and lookups for MD5, on the CPU or an OpenCL
/// device.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Build(Build),
    Lookup(Lookup),
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Cpu,
    Opencl,
}

/// Compute backend selection, shared by both subcommands.
#[derive(Args)]
#[cfg_attr(not(feature = "opencl"), allow(dead_code))]
struct DeviceArgs {
    /// The compute backend to run on.
    #[arg(long, value_enum, default_value = "cpu")]
    backend: BackendArg,

    /// Cross-check every device result against the CPU implementation.
    #[arg(long)]
    verify: bool,

    /// Device work-group size.
    #[arg(long, default_value_t = 1 << 8)]
    local_size: usize,

    /// Work items per device dispatch.
    #[arg(long, default_value_t = 1 << 17)]
    global_size: usize,

    /// Dispatches batched between host round-trips during a build.
    #[arg(long, default_value_t = 1)]
    block_size: usize,
}

impl DeviceArgs {
    fn to_backend(&self) -> Result<Backend> {
        match self.backend {
            BackendArg::Cpu => Ok(Backend::Cpu),
            #[cfg(feature = "opencl")]
            BackendArg::Opencl => Ok(Backend::OpenCl {
                config: rtcrack_core::GpuConfig {
                    local_size: self.local_size,
                    global_size: self.global_size,
                    block_size: self.block_size,
                },
                verify: self.verify,
            }),
            #[cfg(not(feature = "opencl"))]
            BackendArg::Opencl => {
                bail!("this binary was built without OpenCL support; rebuild with `--features opencl`")
            }
        }
    }
}

/// Generate a rainbow table.
#[derive(Args)]
pub struct Build {
    /// The maximum length of the strings covered by the table.
    max_len: u64,

    /// The alphabet the covered strings are built over.
    alphabet: String,

    /// Where to store the generated table. The parameters go to
    /// `<OUTFILE>.params`.
    outfile: PathBuf,

    /// The fraction of the string space used as start values, in (0, 1].
    #[arg(short, long, value_parser = check_alpha, default_value_t = DEFAULT_ALPHA)]
    alpha: f64,

    /// The chain length. Longer chains trade table size for lookup time.
    #[arg(short = 't', long, default_value_t = DEFAULT_CHAIN_LENGTH)]
    chain_len: u64,

    /// The table index, when multiple tables are generated over the same
    /// space.
    #[arg(short = 'i', long, default_value_t = 0)]
    table_index: u64,

    /// Estimate the coverage of the generated table with this many random
    /// samples. 0 disables the estimation.
    #[arg(short, long, default_value_t = 0)]
    samples: u64,

    /// The random seed for coverage sampling.
    #[arg(short = 'r', long, default_value_t = 0)]
    seed: u64,

    #[command(flatten)]
    device: DeviceArgs,
}

/// Look up hashes in a set of rainbow tables.
#[derive(Args)]
#[command(group = ArgGroup::new("mode").required(true))]
pub struct Lookup {
    /// The table file(s) to search, in order. All tables must share the
    /// alphabet and the space size.
    #[arg(required = true)]
    tables: Vec<PathBuf>,

    /// Read the hashes to look up from a file, one 32-hex-character hash
    /// per line.
    #[arg(short = 'f', long, group = "mode")]
    file: Option<PathBuf>,

    /// Look up a single hash given in hexadecimal.
    #[arg(short = 'H', long, value_parser = check_hex, group = "mode")]
    hash: Option<String>,

    /// Estimate the coverage of the tables by looking up this many random
    /// preimages.
    #[arg(short, long, group = "mode")]
    samples: Option<u64>,

    /// The random seed for coverage sampling.
    #[arg(short = 'r', long, default_value_t = 0)]
    seed: u64,

    #[command(flatten)]
    device: DeviceArgs,
}

/// Checks that the alpha coefficient is in (0, 1].
fn check_alpha(alpha: &str) -> Result<f64> {
    let alpha = alpha.parse::<f64>().context("alpha should be a number")?;

    if !(alpha > 0. && alpha <= 1.) {
        bail!("alpha should be in the range (0, 1]");
    }

    Ok(alpha)
}

/// Checks that the digest is 16 bytes of valid hexadecimal.
fn check_hex(hash: &str) -> Result<String> {
    let bytes = hex::decode(hash).context("the digest is not valid hexadecimal")?;

    if bytes.len() != 16 {
        bail!("an MD5 digest is 16 bytes, got {}", bytes.len());
    }

    Ok(hash.to_owned())
}

fn main() -> Result<()> {
    // logs go to stderr so lookup output stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Build(args) => build::build(args),
        Commands::Lookup(args) => lookup::lookup(args),
    }
}
