//! Portable bundles: a root AnyValue plus every blob it reaches.
//!
//! A bundle is itself a [`Store`], so exporting is just pulling the root's
//! closure into it. On disk it is canonical CBOR:
//! `["mycelium-bundle", 1, root, [[key, salt, data], ...]]` with blobs in
//! key order.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Deserialize;
use serde_bytes::ByteBuf;
use tracing::{debug, instrument};

use crate::cid::{self, Digest};
use crate::error::{Error, Result};
use crate::store::{Getter, Span, Store, verify};
use crate::types::Expand;
use crate::value::{AnyValue, Value};

const MAGIC: &str = "mycelium-bundle";
const VERSION: u32 = 1;

#[derive(Default)]
pub struct Bundle {
    root: Option<AnyValue>,
    /// key -> (salt, data)
    blobs: RwLock<BTreeMap<Digest, (Digest, Vec<u8>)>>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `root` and its closure from `src`.
    #[instrument(skip_all, fields(root = %root))]
    pub fn export<G: Getter + ?Sized>(root: &AnyValue, src: &G, ex: &mut dyn Expand) -> Result<Bundle> {
        let mut bundle = Bundle::new();
        Value::AnyValue(*root).pull_into_with(&bundle, src, ex)?;
        bundle.root = Some(*root);
        debug!(blobs = bundle.len(), "exported bundle");
        Ok(bundle)
    }

    pub fn root(&self) -> Option<&AnyValue> {
        self.root.as_ref()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Post every blob into `dst` and return the root.
    pub fn import_into<S: Store + ?Sized>(&self, dst: &S) -> Result<AnyValue> {
        let root = self
            .root
            .ok_or_else(|| Error::Malformed("bundle has no root".into()))?;
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        for (key, (salt, data)) in blobs.iter() {
            let digest = dst.post(Some(salt), data)?;
            if digest != *key {
                return Err(Error::BadData {
                    key: *key,
                    actual: digest,
                });
            }
        }
        debug!(blobs = blobs.len(), root = %root, "imported bundle");
        Ok(root)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let root = self
            .root
            .ok_or_else(|| Error::Malformed("bundle has no root".into()))?;
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        let mut buf = Vec::new();
        push_header(&mut buf, 4, 4);
        push_header(&mut buf, 3, MAGIC.len() as u64);
        buf.extend_from_slice(MAGIC.as_bytes());
        push_header(&mut buf, 0, u64::from(VERSION));
        push_bytes(&mut buf, &root.to_bytes());
        push_header(&mut buf, 4, blobs.len() as u64);
        for (key, (salt, data)) in blobs.iter() {
            push_header(&mut buf, 4, 3);
            push_bytes(&mut buf, key);
            push_bytes(&mut buf, salt);
            push_bytes(&mut buf, data);
        }
        Ok(buf)
    }

    /// Parse a bundle, checking every blob against its key.
    pub fn from_cbor(bytes: &[u8]) -> Result<Bundle> {
        let record: BundleRecord = serde_cbor::from_slice(bytes)
            .map_err(|err| Error::Malformed(format!("bundle: {err}")))?;
        if record.0 != MAGIC {
            return Err(Error::Malformed(format!("not a bundle: {:?}", record.0)));
        }
        if record.1 != VERSION {
            return Err(Error::Malformed(format!("unsupported bundle version {}", record.1)));
        }
        let root = AnyValue::from_bytes(&record.2)?;
        let mut blobs = BTreeMap::new();
        for BlobRecord(key, salt, data) in record.3 {
            let key = cid::from_slice(&key)?;
            let salt = cid::from_slice(&salt)?;
            verify(&key, &salt, &data)?;
            blobs.insert(key, (salt, data.into_vec()));
        }
        Ok(Bundle {
            root: Some(root),
            blobs: RwLock::new(blobs),
        })
    }
}

#[derive(Deserialize)]
struct BundleRecord(String, u32, ByteBuf, Vec<BlobRecord>);

#[derive(Deserialize)]
struct BlobRecord(ByteBuf, ByteBuf, ByteBuf);

impl Getter for Bundle {
    fn fetch(&self, key: &Digest) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.get(key).map(|(_, data)| data.clone()))
    }

    fn exists(&self, key: &Digest) -> Result<bool> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.contains_key(key))
    }
}

impl Store for Bundle {
    fn post(&self, salt: Option<&Digest>, data: &[u8]) -> Result<Digest> {
        let salt = salt.copied().unwrap_or(cid::NO_SALT);
        let key = cid::compute(Some(&salt), data);
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.entry(key).or_insert_with(|| (salt, data.to_vec()));
        Ok(key)
    }

    fn delete(&self, key: &Digest) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.remove(key);
        Ok(())
    }

    fn list(&self, span: &Span, out: &mut Vec<Digest>) -> Result<usize> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        let before = out.len();
        let keys = blobs.keys().filter(|k| span.after.is_none_or(|after| **k > after));
        out.extend(keys.take(span.limit).copied());
        Ok(out.len() - before)
    }
}

fn poisoned() -> Error {
    Error::Malformed("bundle lock poisoned".into())
}

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    push_header(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// A CBOR head with the shortest length encoding.
fn push_header(buf: &mut Vec<u8>, major: u8, len: u64) {
    let major = major << 5;
    match len {
        0..=23 => buf.push(major | len as u8),
        24..=0xff => buf.extend_from_slice(&[major | 24, len as u8]),
        0x100..=0xffff => {
            buf.push(major | 25);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(major | 26);
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
        _ => {
            buf.push(major | 27);
            buf.extend_from_slice(&len.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemStore;
    use crate::types::{NoExpand, Type};

    fn sample(store: &MemStore) -> Result<AnyValue> {
        let inner = Value::B32(77).post(store)?;
        let pair = Value::Product(vec![
            Value::Ref(Arc::new(Type::b32()), inner),
            Value::B8(3),
        ]);
        pair.to_any_value(store)
    }

    #[test]
    fn export_then_import() -> Result<()> {
        let src = MemStore::new();
        let root = sample(&src)?;
        let bundle = Bundle::export(&root, &src, &mut NoExpand)?;
        // The pair, its type, the B32 and the types those mention.
        assert!(bundle.len() >= 4);

        let bytes = bundle.to_cbor()?;
        let parsed = Bundle::from_cbor(&bytes)?;
        assert_eq!(parsed.to_cbor()?, bytes);

        let dst = MemStore::new();
        let back = parsed.import_into(&dst)?;
        assert_eq!(back, root);
        let value = root.load(&dst, &mut NoExpand)?;
        let Value::Product(fields) = value else {
            panic!("expected a product");
        };
        let Value::Ref(_, inner) = &fields[0] else {
            panic!("expected a reference");
        };
        assert_eq!(Value::load(&dst, &Type::b32(), inner)?, Value::B32(77));
        Ok(())
    }

    /// Flip the last byte of the only occurrence of `needle` in `bytes`.
    fn flip_within(bytes: &[u8], needle: &[u8]) -> Vec<u8> {
        let hits: Vec<usize> = bytes
            .windows(needle.len())
            .enumerate()
            .filter(|(_, w)| *w == needle)
            .map(|(at, _)| at)
            .collect();
        assert_eq!(hits.len(), 1, "needle should occur once");
        let mut out = bytes.to_vec();
        out[hits[0] + needle.len() - 1] ^= 1;
        out
    }

    #[test]
    fn tampered_payloads_are_rejected() -> Result<()> {
        let src = MemStore::new();
        let root = sample(&src)?;
        let bytes = Bundle::export(&root, &src, &mut NoExpand)?.to_cbor()?;
        assert!(Bundle::from_cbor(&bytes).is_ok());

        // The salted B32 blob: a four byte string holding 77.
        let data = flip_within(&bytes, &[0x44, 77, 0, 0, 0]);
        assert!(matches!(Bundle::from_cbor(&data), Err(Error::BadData { .. })));

        // Its salt; the same digest also keys the unsalted B32 type blob.
        let salt = Type::b32().fingerprint();
        let mut needle = vec![0x58, 0x20];
        needle.extend_from_slice(&salt);
        let ends: Vec<usize> = bytes
            .windows(needle.len())
            .enumerate()
            .filter(|(_, w)| *w == needle.as_slice())
            .map(|(at, _)| at + needle.len() - 1)
            .collect();
        assert!(!ends.is_empty());
        for at in ends {
            let mut salted = bytes.clone();
            salted[at] ^= 1;
            assert!(matches!(Bundle::from_cbor(&salted), Err(Error::BadData { .. })));
        }
        Ok(())
    }

    #[test]
    fn corrupt_headers_are_malformed() -> Result<()> {
        let src = MemStore::new();
        let root = sample(&src)?;
        let bytes = Bundle::export(&root, &src, &mut NoExpand)?.to_cbor()?;

        let mut arity = bytes.clone();
        arity[0] ^= 1;
        assert!(matches!(Bundle::from_cbor(&arity), Err(Error::Malformed(_))));

        let magic = flip_within(&bytes, MAGIC.as_bytes());
        assert!(matches!(Bundle::from_cbor(&magic), Err(Error::Malformed(_))));

        assert!(matches!(Bundle::from_cbor(&bytes[..bytes.len() - 1]), Err(Error::Malformed(_))));
        assert!(matches!(Bundle::from_cbor(b"\x80"), Err(Error::Malformed(_))));
        Ok(())
    }
}
