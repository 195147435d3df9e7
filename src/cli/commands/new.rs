use anyhow::Result;

use mycelium::{SqliteStore, derive_db_path};

pub(crate) fn cmd_new(name: &str) -> Result<()> {
    let path = derive_db_path(name);
    SqliteStore::create(&path)?;
    println!("created mycelium store at {}", path.display());
    Ok(())
}
