mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mycelium", version, about = "Mycelium content store and VM tooling")]
struct Cli {
    /// Path to an existing Mycelium store
    #[arg(short = 'd', long = "db", global = true, value_name = "PATH")]
    store: Option<PathBuf>,

    /// JSON file with compiler and VM options
    #[arg(long = "config", global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new on-disk store
    New {
        /// Project name or path for the store file
        name: String,
    },
    /// Post a bit-array value and print its reference
    PutBits {
        /// Width in bits (1..=64)
        #[arg(long = "width", default_value_t = 32)]
        width: u32,
        /// Decimal or 0x-prefixed hex integer
        value: String,
    },
    /// Print the size and bytes of a stored blob
    Show {
        /// Blob reference
        key: String,
    },
    /// Hash hex bytes without storing them
    Hash {
        /// Optional salt reference
        #[arg(long = "salt", value_name = "REF")]
        salt: Option<String>,
        hex: String,
    },
    /// List stored keys in order
    List {
        #[arg(long = "after", value_name = "REF")]
        after: Option<String>,
        #[arg(long = "limit", default_value_t = 100)]
        limit: usize,
    },
    /// List the built-in accelerators and their lambda fingerprints
    Accel,
    /// Write a root value and everything it reaches to a bundle file
    Export {
        /// Root AnyValue as 136 hex digits
        root: String,
        file: PathBuf,
    },
    /// Post every blob of a bundle file and print its root
    Import { file: PathBuf },
    /// Compile and run a stored program
    Run {
        /// Program reference
        program: String,
        /// Step budget for the run
        #[arg(long = "steps", value_name = "N")]
        steps: Option<u64>,
    },
}

pub(crate) fn run() -> Result<()> {
    let cli = Cli::parse();
    let options = commands::load_options(cli.config.as_deref())?;

    match cli.command {
        Command::New { name } => commands::cmd_new(&name),
        Command::PutBits { width, value } => {
            let store_path = commands::require_store_path(cli.store.as_deref())?;
            commands::cmd_put_bits(store_path, width, &value)
        }
        Command::Show { key } => {
            let store_path = commands::require_store_path(cli.store.as_deref())?;
            commands::cmd_show(store_path, &key)
        }
        Command::Hash { salt, hex } => commands::cmd_hash(salt.as_deref(), &hex),
        Command::List { after, limit } => {
            let store_path = commands::require_store_path(cli.store.as_deref())?;
            commands::cmd_list(store_path, after.as_deref(), limit)
        }
        Command::Accel => commands::cmd_accel(),
        Command::Export { root, file } => {
            let store_path = commands::require_store_path(cli.store.as_deref())?;
            commands::cmd_export(store_path, options, &root, &file)
        }
        Command::Import { file } => {
            let store_path = commands::require_store_path(cli.store.as_deref())?;
            commands::cmd_import(store_path, &file)
        }
        Command::Run { program, steps } => {
            let store_path = commands::require_store_path(cli.store.as_deref())?;
            commands::cmd_run(store_path, options, &program, steps)
        }
    }
}
