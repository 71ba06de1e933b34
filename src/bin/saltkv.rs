//! SaltKV CLI
//!
//! Command-line tool for exercising and inspecting a keyed SaltKV store.
//! Keys are strings (routing key = SHA-256 of the string); values are
//! stored zero padded with their length in the block header.

use std::process;

use clap::{Parser, Subcommand};
use saltkv::{
    FetchOptions, KeyedBlock, KeyedBlockCallback, PutOptions, SaltedHashStore, StorableBlock,
    StoreConfig,
};
use tracing_subscriber::{fmt, EnvFilter};

/// Block header: value length (u32, big-endian) + reserved
const HEADER_LEN: usize = 8;

/// SaltKV CLI
#[derive(Parser, Debug)]
#[command(name = "saltkv")]
#[command(about = "Salted-hash encrypted block store")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./saltkv_data")]
    dir: String,

    /// Store name (file prefix)
    #[arg(short, long, default_value = "store")]
    name: String,

    /// Number of slots
    #[arg(short, long, default_value = "1024")]
    max_keys: u64,

    /// Payload size in bytes (fixed per store)
    #[arg(short, long, default_value = "1024")]
    payload_size: usize,

    /// Master key wrapping the store salt (64 hex characters)
    #[arg(long)]
    master_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a value
    Put {
        key: String,
        value: String,

        /// Replace a different value stored under the key
        #[arg(long)]
        overwrite: bool,
    },

    /// Fetch a value
    Get { key: String },

    /// Show where a key would live and what its slots hold
    Probe { key: String },

    /// Resize the table and wait for the migration
    Resize { slots: u64 },

    /// Run any pending resize or slot cache rebuild
    Maintain,

    /// Print store statistics
    Stats,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,saltkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = StoreConfig::builder()
        .dir(&args.dir)
        .name(&args.name)
        .max_keys(args.max_keys)
        .store_plain_keys(true)
        .start_cleaner(false);
    if let Some(hex_key) = &args.master_key {
        builder = builder.master_key(parse_master_key(hex_key)?);
    }

    let callback = KeyedBlockCallback::new(HEADER_LEN, args.payload_size);
    let store = SaltedHashStore::open(builder.build(), callback)?;

    let result = execute(&store, args.command, args.payload_size);
    store.close()?;
    result
}

fn execute(
    store: &SaltedHashStore<KeyedBlockCallback>,
    command: Commands,
    payload_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Put {
            key,
            value,
            overwrite,
        } => {
            let value = value.into_bytes();
            if value.len() > payload_size {
                return Err(format!("value is {} bytes, payload holds {}", value.len(), payload_size).into());
            }

            let mut header = vec![0u8; HEADER_LEN];
            header[..4].copy_from_slice(&(value.len() as u32).to_be_bytes());
            let mut payload = value;
            payload.resize(payload_size, 0);

            let block = KeyedBlock::with_full_key(key.into_bytes(), header.clone(), payload.clone());
            let outcome = store.put(
                &block,
                &payload,
                &header,
                PutOptions {
                    overwrite,
                    is_old_block: false,
                },
            )?;
            println!("{:?}", outcome);
        }

        Commands::Get { key } => {
            let full_key = key.into_bytes();
            let routing_key = KeyedBlock::with_full_key(full_key.clone(), Vec::new(), Vec::new())
                .routing_key()
                .to_owned();

            match store.fetch(&routing_key, Some(&full_key), FetchOptions::default())? {
                Some(block) => {
                    let mut len_bytes = [0u8; 4];
                    len_bytes.copy_from_slice(&block.header()[..4]);
                    let len = (u32::from_be_bytes(len_bytes) as usize).min(block.payload().len());
                    println!("{}", String::from_utf8_lossy(&block.payload()[..len]));
                }
                None => println!("(not found)"),
            }
        }

        Commands::Probe { key } => {
            let full_key = key.into_bytes();
            let routing_key = KeyedBlock::with_full_key(full_key, Vec::new(), Vec::new())
                .routing_key()
                .to_owned();

            println!("routing key:       {}", hex::encode(routing_key));
            println!("probably in store: {}", store.probably_in_store(&routing_key));
            println!("stored at:         {:?}", store.locate(&routing_key)?);
            for offset in store.candidate_slots(&routing_key) {
                let slot = store.inspect_slot(offset)?;
                println!(
                    "  slot {:>8}  word {:08x}  occupied={} new={} wrong_store={} size={} gen={}",
                    slot.offset,
                    slot.status_word,
                    slot.occupied,
                    slot.new_block,
                    slot.wrong_store,
                    slot.store_size,
                    slot.generation
                );
            }
        }

        Commands::Resize { slots } => {
            store.set_max_keys(slots, true)?;
            println!("resized to {} slots", store.max_keys());
        }

        Commands::Maintain => {
            store.run_maintenance()?;
            println!("sweep state: {:?}", store.sweep_state());
        }

        Commands::Stats => {
            let stats = store.stats();
            println!("slots:           {}", stats.store_size);
            println!("previous slots:  {}", stats.prev_store_size);
            println!("keys:            {}", stats.key_count);
            println!("generation:      {}", stats.generation);
            println!("writes:          {}", stats.writes);
            println!("hits / misses:   {} / {} ({:.1}%)", stats.hits, stats.misses, stats.hit_ratio() * 100.0);
            println!("false positives: {}", stats.false_positives);
            println!("rebuild pending: {}", stats.rebuild_pending);
        }
    }
    Ok(())
}

fn parse_master_key(hex_key: &str) -> Result<[u8; 32], Box<dyn std::error::Error>> {
    let bytes = hex::decode(hex_key)?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "master key must be 32 bytes (64 hex characters)")?;
    Ok(key)
}
