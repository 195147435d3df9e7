use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use mycelium::{Bundle, Compiler, Env, Options, cid};

use super::util::{open_store, parse_any_value};

pub(crate) fn cmd_export(store: &Path, options: Options, root: &str, file: &Path) -> Result<()> {
    let store = open_store(store)?;
    let root = parse_any_value(root)?;
    let mut compiler = Compiler::new(Env::new(store.clone())?.with_options(options));
    let bundle = Bundle::export(&root, &*store, &mut compiler)?;
    fs::write(file, bundle.to_cbor()?)
        .with_context(|| format!("writing bundle {}", file.display()))?;
    println!("exported {} blobs to {}", bundle.len(), file.display());
    Ok(())
}

pub(crate) fn cmd_import(store: &Path, file: &Path) -> Result<()> {
    let store = open_store(store)?;
    let bytes = fs::read(file).with_context(|| format!("reading bundle {}", file.display()))?;
    let bundle = Bundle::from_cbor(&bytes)?;
    let root = bundle.import_into(&*store)?;
    println!("imported {} blobs", bundle.len());
    println!("root {}", cid::to_hex(&root.to_bytes()));
    Ok(())
}
