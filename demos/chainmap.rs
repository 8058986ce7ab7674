use std::path::PathBuf;
use std::time::Instant;

use chainmap::{ChainMap, ChainMapBuilder, Result};
use clap::{Parser, Subcommand};
use rand::Rng;

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Info(args) => run_info(args),
        Command::Get(args) => run_get(args),
        Command::Put(args) => run_put(args),
        Command::Bench(args) => run_bench(args),
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "chainmap utility for inspecting and exercising map directories",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print basic information about a map directory
    Info(DirArgs),
    /// Look up a key (interpreted as UTF-8 bytes)
    Get(KeyArgs),
    /// Store a key-value pair (both interpreted as UTF-8 bytes)
    Put(PutArgs),
    /// Load random entries and report the insertion rate
    Bench(BenchArgs),
}

#[derive(clap::Args)]
struct DirArgs {
    /// Path to the map directory
    #[arg(value_name = "DIR")]
    dir: PathBuf,
}

#[derive(clap::Args)]
struct KeyArgs {
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Key to look up
    #[arg(value_name = "KEY")]
    key: String,
}

#[derive(clap::Args)]
struct PutArgs {
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    #[arg(value_name = "KEY")]
    key: String,

    #[arg(value_name = "VALUE")]
    value: String,
}

#[derive(clap::Args)]
struct BenchArgs {
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Number of random entries to insert
    #[arg(short, long, default_value_t = 100_000)]
    entries: u64,

    /// Starting size of the bucket table file in bytes
    #[arg(long, default_value_t = 2048)]
    initial_primary_file_length: u64,
}

fn run_info(args: DirArgs) -> Result<()> {
    let map = ChainMap::open(&args.dir)?;
    let info = serde_json::json!({
        "entries": map.len(),
        "table_length": map.table_length(),
        "load_factor": map.len() as f64 / map.table_length() as f64,
    });
    println!("{}", serde_json::to_string_pretty(&info).expect("valid json"));
    map.close()
}

fn run_get(args: KeyArgs) -> Result<()> {
    let map = ChainMap::open(&args.dir)?;
    match map.get(args.key.as_bytes())? {
        Some(value) => println!("{}", String::from_utf8_lossy(&value)),
        None => println!("(absent)"),
    }
    map.close()
}

fn run_put(args: PutArgs) -> Result<()> {
    let map = ChainMap::open(&args.dir)?;
    match map.put(args.key.as_bytes(), args.value.as_bytes())? {
        Some(previous) => println!("replaced {}", String::from_utf8_lossy(&previous)),
        None => println!("inserted"),
    }
    map.close()
}

fn run_bench(args: BenchArgs) -> Result<()> {
    let map = ChainMapBuilder::default()
        .with_initial_primary_file_length(args.initial_primary_file_length)
        .open(&args.dir)?;
    let mut rng = rand::thread_rng();

    let start = Instant::now();
    for _ in 0..args.entries {
        let key: u64 = rng.gen();
        map.put(&key.to_le_bytes(), &key.to_be_bytes())?;
    }
    let elapsed = start.elapsed();

    println!(
        "inserted {} entries in {:.2?} ({:.0} ops/s), table length {}, total entries {}",
        args.entries,
        elapsed,
        args.entries as f64 / elapsed.as_secs_f64(),
        map.table_length(),
        map.len(),
    );
    map.close()
}
