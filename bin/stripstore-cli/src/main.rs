//! Stripstore Admin CLI
//!
//! Offline administration of a store directory: initialization and
//! read-only inspection.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stripstore_engine::{Cid, Oid, StoreConfig, StripStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stripstore")]
#[command(about = "Stripstore admin CLI")]
#[command(version)]
struct Args {
    /// Store base directory
    #[arg(short, long)]
    basedir: PathBuf,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new store
    Mkfs {
        /// Stripe width in bytes for new objects
        #[arg(long, default_value_t = 4096)]
        strip_size: u64,
    },
    /// Show store identity and space usage
    Info,
    /// List all collections
    ListCollections,
    /// List objects of a collection
    ListObjects {
        /// Collection name
        collection: String,
    },
    /// Stat one object
    Stat {
        /// Collection name
        collection: String,
        /// Object name
        object: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    match args.command {
        Commands::Mkfs { strip_size } => {
            let store = StripStore::new(&args.basedir, StoreConfig::with_strip_size(strip_size));
            store.mkfs().context("mkfs failed")?;
            println!("created store at {}", args.basedir.display());
            println!("fsid: {}", store.fsid().expect("fsid set by mkfs"));
            Ok(())
        }
        Commands::Info => {
            let store = mounted(&args.basedir)?;
            let stats = store.stat_fs()?;
            println!("fsid:      {}", store.fsid().expect("fsid set by mount"));
            println!("total:     {} bytes", stats.total_bytes);
            println!("available: {} bytes", stats.available_bytes);
            println!(
                "collections: {}",
                store.list_collections()?.len()
            );
            store.umount()?;
            Ok(())
        }
        Commands::ListCollections => {
            let store = mounted(&args.basedir)?;
            for cid in store.list_collections()? {
                println!("{cid}");
            }
            store.umount()?;
            Ok(())
        }
        Commands::ListObjects { collection } => {
            let store = mounted(&args.basedir)?;
            let cid = Cid::new(collection).context("invalid collection name")?;
            for oid in store.collection_list(&cid)? {
                println!("{oid}");
            }
            store.umount()?;
            Ok(())
        }
        Commands::Stat { collection, object } => {
            let store = mounted(&args.basedir)?;
            let cid = Cid::new(collection).context("invalid collection name")?;
            let oid = Oid::new(object).context("invalid object name")?;
            let st = store.stat(&cid, &oid)?;
            println!(
                "{}",
                serde_json::json!({
                    "size": st.size,
                    "block_size": st.block_size,
                    "blocks": st.blocks,
                    "nlink": st.nlink,
                })
            );
            store.umount()?;
            Ok(())
        }
    }
}

fn mounted(basedir: &PathBuf) -> Result<StripStore> {
    let store = StripStore::new(basedir, StoreConfig::default());
    store.mount().context("mount failed")?;
    Ok(store)
}
