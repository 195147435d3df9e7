use std::path::Path;

use anyhow::{Result, bail};

use mycelium::{Span, Value, cid};

use super::util::{open_store, parse_ref, parse_u64};

pub(crate) fn cmd_put_bits(store: &Path, width: u32, value: &str) -> Result<()> {
    if !(1..=64).contains(&width) {
        bail!("width must be between 1 and 64, got {width}");
    }
    let v = parse_u64(value)?;
    if width < 64 && v >> width != 0 {
        bail!("{v} does not fit in {width} bits");
    }
    let store = open_store(store)?;
    let value = Value::bits(width, v);
    let any = value.to_any_value(&*store)?;
    println!("ref {}", cid::to_text(&any.digest));
    println!("any {}", cid::to_hex(&any.to_bytes()));
    Ok(())
}

pub(crate) fn cmd_show(store: &Path, key: &str) -> Result<()> {
    let store = open_store(store)?;
    let key = parse_ref(key)?;
    let data = store.read(&key, None)?;
    println!("{} bytes", data.len());
    println!("{}", cid::to_hex(&data));
    Ok(())
}

pub(crate) fn cmd_hash(salt: Option<&str>, hex: &str) -> Result<()> {
    let salt = salt.map(parse_ref).transpose()?;
    let bytes = cid::from_hex(hex.trim())?;
    println!("{}", cid::to_text(&cid::compute(salt.as_ref(), &bytes)));
    Ok(())
}

pub(crate) fn cmd_list(store: &Path, after: Option<&str>, limit: usize) -> Result<()> {
    let store = open_store(store)?;
    let span = Span {
        after: after.map(parse_ref).transpose()?,
        limit,
    };
    let mut keys = Vec::new();
    if store.list(&span, &mut keys)? == 0 {
        println!("no blobs stored");
        return Ok(());
    }
    for key in &keys {
        println!("{}", cid::to_text(key));
    }
    Ok(())
}
