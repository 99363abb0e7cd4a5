//! Demo CLI over a pair of file-backed partitions, in the spirit of the
//! workspace's small `anyhow` + `clap derive` conversion tools.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use nandkv::{Engine, EngineConfig, FilePartition, PartitionGeometry};

#[derive(Parser)]
#[command(
    name = "nandkv-cli",
    version,
    about = "Inspect and drive a nandkv store backed by two flat files"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// META partition file.
    #[arg(long, global = true, default_value = "nandkv.meta")]
    meta: PathBuf,

    /// DATA partition file.
    #[arg(long, global = true, default_value = "nandkv.data")]
    data: PathBuf,

    /// Page size in bytes, shared by both partitions.
    #[arg(long, global = true, default_value_t = 2048)]
    page_size: u32,

    /// Pages per block, shared by both partitions.
    #[arg(long, global = true, default_value_t = 64)]
    pages_per_block: u32,

    /// Number of blocks in the DATA partition.
    #[arg(long, global = true, default_value_t = 64)]
    data_blocks: u32,

    /// Number of blocks in the META partition.
    #[arg(long, global = true, default_value_t = 16)]
    meta_blocks: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Erase both partitions and initialize an empty store.
    Format,
    /// Insert or overwrite a key.
    Set { key: String, value: String },
    /// Fetch a key's value.
    Get { key: String },
    /// Remove a key.
    Delete { key: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let block_size = cli.page_size * cli.pages_per_block;
    let data_geom = PartitionGeometry::new(block_size, cli.page_size, cli.data_blocks)
        .context("invalid DATA geometry")?;
    let meta_geom = PartitionGeometry::new(block_size, cli.page_size, cli.meta_blocks)
        .context("invalid META geometry")?;

    match cli.command {
        Command::Format => {
            let meta = FilePartition::create(&cli.meta, meta_geom)
                .context("creating META partition file")?;
            let data = FilePartition::create(&cli.data, data_geom)
                .context("creating DATA partition file")?;
            let store = Engine::format(meta, data, EngineConfig::default())?;
            store.unmount()?;
            println!("formatted {} + {}", cli.meta.display(), cli.data.display());
        }
        Command::Set { key, value } => {
            let mut store = open(&cli)?;
            store.set(key.as_bytes(), value.as_bytes())?;
            store.unmount()?;
        }
        Command::Get { key } => {
            let mut store = open(&cli)?;
            let value = store.get(key.as_bytes())?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Command::Delete { key } => {
            let mut store = open(&cli)?;
            store.delete(key.as_bytes())?;
            store.unmount()?;
        }
    }
    Ok(())
}

fn open(cli: &Cli) -> Result<Engine<FilePartition, FilePartition>> {
    let block_size = cli.page_size * cli.pages_per_block;
    let data_geom = PartitionGeometry::new(block_size, cli.page_size, cli.data_blocks)?;
    let meta_geom = PartitionGeometry::new(block_size, cli.page_size, cli.meta_blocks)?;
    let meta =
        FilePartition::open(&cli.meta, meta_geom).context("opening META partition; run format first")?;
    let data =
        FilePartition::open(&cli.data, data_geom).context("opening DATA partition; run format first")?;
    Ok(Engine::mount(meta, data, EngineConfig::default())?)
}
