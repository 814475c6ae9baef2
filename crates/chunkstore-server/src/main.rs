mod config;
mod service;

use std::path::PathBuf;

use chunkstore_cache::dedup::{ChunkRecipient, PlayerId};
use clap::{Parser, Subcommand};
use config::ServerConfig;
use service::ChunkIoService;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "chunkstore", about = "Region file storage and chunk send dedup", version)]
pub struct Args {
    #[arg(short, long, default_value = "chunkstore.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the region files in the world directory
    Regions,
    /// Print the allocation table of one region
    Inspect { region_x: i32, region_z: i32 },
    /// Read back every stored chunk and report unreadable ones
    Verify,
    /// Write the decompressed payload of a chunk to a file
    Export { x: i32, z: i32, out: PathBuf },
    /// Store a file as the payload of a chunk
    Import { x: i32, z: i32, input: PathBuf },
    /// Prepare repeated sends of a chunk to one player and report sizes
    Send {
        x: i32,
        z: i32,
        #[arg(long, default_value_t = 1)]
        player: u64,
        #[arg(long, default_value_t = 2)]
        repeat: u32,
        /// Send as a client without partition cache support
        #[arg(long)]
        legacy: bool,
    },
}

struct ConsolePlayer {
    id: PlayerId,
    partition_cache: bool,
}

impl ChunkRecipient for ConsolePlayer {
    fn player_id(&self) -> PlayerId {
        self.id
    }

    fn supports_partition_cache(&self) -> bool {
        self.partition_cache
    }
}

fn main() {
    let args = Args::parse();

    let config = match ServerConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("chunkstore v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&config, args.command) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(config: &ServerConfig, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let mut service = ChunkIoService::new(config)?;

    match command {
        Command::Regions => {
            for (rx, rz) in service.regions().stored_regions()? {
                println!("r.{rx}.{rz}");
            }
        }
        Command::Inspect { region_x, region_z } => {
            let regions = service.regions();
            if !regions.region_path(region_x, region_z).exists() {
                return Err(format!("region ({region_x}, {region_z}) does not exist").into());
            }
            let region = regions.region(region_x, region_z)?;
            println!(
                "{}: {} bytes, {}-byte segments, {}/{} segments used, {} chunks",
                region.path().display(),
                region.file_len()?,
                region.segment_size(),
                region.used_segments(),
                region.segment_count(),
                region.live_slots()
            );
            for ((x, z), entry) in region.chunks() {
                println!(
                    "  ({x:>5}, {z:>5})  start {:>6}  segments {:>4}  length {:>8}",
                    entry.start, entry.segments, entry.length
                );
            }
        }
        Command::Verify => {
            let mut problems = 0;
            for ((rx, rz), outcome) in service.verify_all()? {
                let report = match outcome {
                    Ok(report) => report,
                    Err(e) => {
                        println!("r.{rx}.{rz}: unreadable ({e})");
                        problems += 1;
                        continue;
                    }
                };
                println!(
                    "r.{rx}.{rz}: {} chunks, {} stored bytes, {} raw bytes",
                    report.live_slots, report.stored_bytes, report.raw_bytes
                );
                for ((x, z), error) in &report.problems {
                    warn!("Chunk ({x}, {z}) in region ({rx}, {rz}): {error}");
                }
                problems += report.problems.len();
            }
            if problems > 0 {
                return Err(format!("{problems} unreadable chunk(s) or region(s)").into());
            }
        }
        Command::Export { x, z, out } => {
            let payload = service
                .load(x, z)?
                .ok_or_else(|| format!("chunk ({x}, {z}) is not stored"))?;
            std::fs::write(&out, &payload)?;
            info!("Exported chunk ({x}, {z}): {} bytes to {}", payload.len(), out.display());
        }
        Command::Import { x, z, input } => {
            let payload = std::fs::read(&input)?;
            service.save(x, z, &payload)?;
            info!("Imported {} bytes into chunk ({x}, {z})", payload.len());
        }
        Command::Send {
            x,
            z,
            player,
            repeat,
            legacy,
        } => {
            let quit = service.quit_handle();
            let recipient = [ConsolePlayer {
                id: PlayerId(player),
                partition_cache: !legacy,
            }];
            for round in 1..=repeat {
                match service.prepare_send(&recipient, x, z)? {
                    Some(packet) => println!("send {round}: {} bytes", packet.len()),
                    None => return Err(format!("chunk ({x}, {z}) is not stored").into()),
                }
            }
            let stats = service.dedup_stats();
            println!(
                "processed {}, bypassed {}, partitions sent {}, elided {}",
                stats.chunks_processed,
                stats.chunks_bypassed,
                stats.partitions_sent,
                stats.partitions_elided
            );
            quit.player_quit(PlayerId(player));
        }
    }

    service.tick()?;
    service.shutdown()?;
    Ok(())
}
