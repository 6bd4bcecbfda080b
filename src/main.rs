//! objdb - maintenance tool for an object store directory

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use objdb::config::StoreConfig;
use objdb::database::Database;
use objdb::storage::marker::Marker;
use objdb::storage::CheckpointStatus;
use std::path::PathBuf;

/// objdb - inspect and dump a persistent object store
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory
    #[arg(short = 'D', long, default_value = "./objdb_data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show marker state, record count and file size
    Info,
    /// Print one record
    Show {
        objnum: i64,
    },
    /// Write a consistent copy of the objects file (and its index)
    Dump {
        path: PathBuf,
        /// Blocks copied per step
        #[arg(long, default_value = "64")]
        step: usize,
    },
    /// List symbolic names
    Names,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if !args.data_dir.is_dir() {
        bail!("no store at {}", args.data_dir.display());
    }
    let config = StoreConfig::new(&args.data_dir);
    // read before open, which removes it
    let marker = Marker::read(&config.marker_path()).context("Failed to read marker")?;
    let mut db = Database::open(config).context("Failed to open store")?;

    match args.command {
        Command::Info => {
            match marker {
                Some(m) => println!(
                    "marker:   version {}.{}.{}, magic {:#x}, stamp {}, system {}{}",
                    m.version.0,
                    m.version.1,
                    m.version.2,
                    m.magic,
                    m.search_stamp,
                    m.system,
                    if m.is_compatible() { "" } else { " (incompatible)" }
                ),
                None => println!("marker:   missing (not shut down cleanly)"),
            }
            println!("records:  {}", db.record_count()?);
            let (len, blocks) = db
                .cache()
                .with_store(|s| s.file_len().map(|len| (len, s.bitmap().allocated_count())))?;
            println!("objects:  {} bytes, {} blocks in use", len, blocks);
        }
        Command::Show { objnum } => {
            let obj = db
                .retrieve(objnum)?
                .with_context(|| format!("no object #{}", objnum))?;
            println!("{:#?}", *obj.read());
            obj.discard()?;
        }
        Command::Dump { path, step } => {
            db.checkpoint_start(&path)
                .with_context(|| format!("Failed to start dump to {}", path.display()))?;
            let mut steps = 0;
            while db.checkpoint_step(step.max(1))? == CheckpointStatus::InProgress {
                steps += 1;
            }
            println!("dumped to {} in {} steps", path.display(), steps + 1);
        }
        Command::Names => {
            for (name, objnum) in db.names()? {
                println!("{:<24} #{}", name, objnum);
            }
        }
    }

    db.close().context("Failed to close store")?;
    Ok(())
}
