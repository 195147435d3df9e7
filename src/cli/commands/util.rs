use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use mycelium::{AnyValue, Digest, Options, SqliteStore, Store, cid};

pub(crate) fn require_store_path(path: Option<&Path>) -> Result<&Path> {
    match path {
        Some(p) => Ok(p),
        None => bail!("specify --db PATH for this command"),
    }
}

pub(crate) fn open_store(path: &Path) -> Result<Arc<dyn Store>> {
    let store = SqliteStore::open(path)
        .with_context(|| format!("opening store {}", path.display()))?;
    Ok(Arc::new(store))
}

pub(crate) fn load_options(path: Option<&Path>) -> Result<Options> {
    match path {
        Some(path) => {
            Options::load(path).with_context(|| format!("reading config {}", path.display()))
        }
        None => Ok(Options::default()),
    }
}

pub(crate) fn parse_ref(text: &str) -> Result<Digest> {
    cid::from_text(text.trim()).with_context(|| format!("invalid reference `{text}`"))
}

pub(crate) fn parse_any_value(text: &str) -> Result<AnyValue> {
    let bytes = cid::from_hex(text.trim())?;
    AnyValue::from_bytes(&bytes).with_context(|| format!("invalid AnyValue `{text}`"))
}

/// Decimal, or hex with a `0x` prefix.
pub(crate) fn parse_u64(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid integer `{text}`"))
}
