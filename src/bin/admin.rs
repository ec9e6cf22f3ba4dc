//! epkv Admin Tool
//!
//! Offline inspection and maintenance of an epkv data directory.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use epkv::kvstore::{
    CacheLookup, CacheLookupKey, CompactionCtx, DocumentFilter, FileKvStore, FileKvStoreConfig,
    GetValue, KvStore, ScanControl, ScanStatus, ValueFilter,
};
use epkv::{Config, EngineStatus, Item};
use tracing_subscriber::{fmt, EnvFilter};

/// epkv admin
#[derive(Parser, Debug)]
#[command(name = "epkv-admin")]
#[command(about = "Inspect and maintain epkv vbucket files")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./epkv_data")]
    data_dir: String,

    /// Number of shards the directory was written with
    #[arg(short, long, default_value = "4")]
    shards: u16,

    /// Maximum vbucket id + 1
    #[arg(long, default_value = "1024")]
    max_vbuckets: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show every persisted vbucket with its state and file size
    Info,

    /// Read one document
    Get {
        /// Vbucket holding the key
        vbucket: u16,

        /// The key to read
        key: String,
    },

    /// Rewrite a vbucket file, purging tombstones
    Compact {
        vbucket: u16,

        /// Purge every tombstone regardless of age
        #[arg(long)]
        drop_deletes: bool,

        /// Only purge tombstones at or below this seqno
        #[arg(long, default_value = "0")]
        purge_before_seq: u64,

        /// Only purge tombstones deleted before this time
        #[arg(long, default_value = "0")]
        purge_before_ts: u32,
    },

    /// Print every document of a vbucket in seqno order
    Dump {
        vbucket: u16,

        /// Include tombstones
        #[arg(long)]
        deleted: bool,

        /// Skip document bodies
        #[arg(long)]
        keys_only: bool,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .max_num_shards(args.shards)
        .max_vbuckets(args.max_vbuckets)
        .build();

    match run(&config, args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn open_store(config: &Config, vbid: u16) -> epkv::Result<FileKvStore> {
    if vbid >= config.max_vbuckets {
        return Err(epkv::EpError::NotMyVbucket(vbid));
    }
    FileKvStore::open(FileKvStoreConfig::from_config(config, config.shard_of(vbid)))
}

fn run(config: &Config, command: Commands) -> epkv::Result<()> {
    match command {
        Commands::Info => {
            println!(
                "{:>6}  {:<8}  {:>12}  {:>10}  {:>10}  {:>12}",
                "vbid", "state", "high_seqno", "docs", "deleted", "file_size"
            );
            for shard in 0..config.max_num_shards {
                let store = FileKvStore::open(FileKvStoreConfig::from_config(config, shard))?;
                for (vbid, state) in store.list_persisted_vbuckets().into_iter().enumerate() {
                    let Some(state) = state else {
                        continue;
                    };
                    let info = store.db_file_info(vbid as u16)?;
                    println!(
                        "{:>6}  {:<8}  {:>12}  {:>10}  {:>10}  {:>12}",
                        vbid,
                        state.state.as_str(),
                        state.high_seqno,
                        info.doc_count,
                        info.deleted_count,
                        info.file_size
                    );
                }
            }
        }

        Commands::Get { vbucket, key } => {
            let store = open_store(config, vbucket)?;
            let result = store.get(key.as_bytes(), vbucket);
            match (result.status, result.item) {
                (EngineStatus::Success, Some(item)) => print_item(&item, false),
                (EngineStatus::KeyNotFound, Some(item)) if item.deleted => {
                    println!("deleted at seqno {}", item.by_seqno)
                }
                (EngineStatus::KeyNotFound, _) => println!("not found"),
                (status, _) => println!("failed: {status:?}"),
            }
        }

        Commands::Compact {
            vbucket,
            drop_deletes,
            purge_before_seq,
            purge_before_ts,
        } => {
            let store = open_store(config, vbucket)?;
            let before = store.db_file_info(vbucket)?;
            let mut ctx = CompactionCtx {
                purge_before_ts,
                purge_before_seq,
                drop_deletes,
                ..Default::default()
            };
            if !store.compact_db(vbucket, &mut ctx) {
                return Err(epkv::EpError::Storage(format!(
                    "compaction of vbucket {vbucket} failed"
                )));
            }
            let after = store.db_file_info(vbucket)?;
            println!(
                "vbucket {vbucket}: {} -> {} bytes, revision {}, max purged seqno {}",
                before.file_size, after.file_size, after.revision, ctx.max_purged_seq
            );
        }

        Commands::Dump {
            vbucket,
            deleted,
            keys_only,
        } => {
            let store = open_store(config, vbucket)?;
            let document_filter = if deleted {
                DocumentFilter::AllItems
            } else {
                DocumentFilter::NoDeletes
            };
            let value_filter = if keys_only {
                ValueFilter::KeysOnly
            } else {
                ValueFilter::Values
            };
            let Some(mut ctx) = store.init_scan_context(
                Box::new(move |doc: GetValue| {
                    if let Some(item) = doc.item {
                        print_item(&item, keys_only);
                    }
                    ScanControl::Continue
                }),
                Box::new(|_: &CacheLookupKey| CacheLookup::Fetch),
                vbucket,
                0,
                document_filter,
                value_filter,
            ) else {
                return Err(epkv::EpError::NoSuchFile(vbucket));
            };
            let status = store.scan(&mut ctx);
            let count = ctx.document_count;
            store.destroy_scan_context(ctx);
            if status != ScanStatus::Success {
                return Err(epkv::EpError::Storage(format!(
                    "scan of vbucket {vbucket} ended with {status:?}"
                )));
            }
            println!("{count} documents");
        }
    }
    Ok(())
}

fn print_item(item: &Item, keys_only: bool) {
    let key = String::from_utf8_lossy(&item.key);
    let marker = if item.deleted { " (deleted)" } else { "" };
    println!(
        "seqno={} cas={} flags={:#x} exp={} key={key}{marker}",
        item.by_seqno, item.cas, item.flags, item.expiry
    );
    if !keys_only {
        if let Some(value) = &item.value {
            println!("    {}", String::from_utf8_lossy(value));
        }
    }
}
