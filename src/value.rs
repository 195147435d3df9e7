//! In-memory values: decoding from and encoding to the bit-exact wire form,
//! posting into a store and replicating transitive closures.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::ast::Program;
use crate::bitbuf::{self, BitBuf, bytes_for};
use crate::cid::{self, Digest};
use crate::error::{Error, Result};
use crate::kind::{ANY_TYPE_BITS, ANY_VALUE_BITS, Kind};
use crate::store::{Getter, MAX_BLOB_BITS, Store};
use crate::types::{
    Expand, NoExpand, PortType, Type, get_any_type, load_type, put_any_type, resolve, sum_layout,
};

/// A stored type named by the digest of its encoding and its kind word.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnyType {
    pub digest: Digest,
    pub kind: Kind,
}

impl AnyType {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BitBuf::new(vec![0u8; bytes_for(ANY_TYPE_BITS)]);
        put_any_type(&mut buf, 0, self);
        buf.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<AnyType> {
        check_len(bytes, ANY_TYPE_BITS, "AnyType")?;
        get_any_type(&BitBuf::new(bytes), 0)
    }
}

impl fmt::Display for AnyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", cid::to_text(&self.digest), self.kind)
    }
}

/// The universal container: a stored value together with its stored type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnyValue {
    pub digest: Digest,
    pub ty: AnyType,
}

impl AnyValue {
    /// Write the 544-bit encoding into `buf`.
    pub fn encode_into<B: AsRef<[u8]> + AsMut<[u8]>>(&self, buf: &mut BitBuf<B>) {
        buf.put_bytes(0, &self.digest);
        put_any_type(buf, 256, &self.ty);
    }

    pub fn decode<B: AsRef<[u8]>>(buf: &BitBuf<B>) -> Result<AnyValue> {
        if buf.len() < ANY_VALUE_BITS as usize {
            return Err(Error::Size(format!(
                "AnyValue needs {ANY_VALUE_BITS} bits, buffer holds {}",
                buf.len()
            )));
        }
        Ok(AnyValue {
            digest: digest_at(buf, 0),
            ty: get_any_type(buf, 256)?,
        })
    }

    /// The 68-byte form used for saved roots.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BitBuf::new(vec![0u8; bytes_for(ANY_VALUE_BITS)]);
        self.encode_into(&mut buf);
        buf.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<AnyValue> {
        check_len(bytes, ANY_VALUE_BITS, "AnyValue")?;
        AnyValue::decode(&BitBuf::new(bytes))
    }

    /// Load the stored type and then the value it describes.
    pub fn load<G: Getter + ?Sized>(&self, loader: &G, ex: &mut dyn Expand) -> Result<Value> {
        let ty = load_type(loader, &self.ty)?;
        resolve(&ty, ex)?;
        Value::load(loader, &ty, &self.digest)
    }
}

impl fmt::Display for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", cid::to_text(&self.digest), self.ty)
    }
}

/// A stored program and its length in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AnyProg {
    pub digest: Digest,
    pub bytes: u32,
}

impl AnyProg {
    fn encode_into<B: AsRef<[u8]> + AsMut<[u8]>>(&self, buf: &mut BitBuf<B>) {
        buf.put_bytes(0, &self.digest);
        buf.put32(256, self.bytes);
    }

    fn decode<B: AsRef<[u8]>>(buf: &BitBuf<B>) -> AnyProg {
        AnyProg {
            digest: digest_at(buf, 0),
            bytes: buf.get32(256),
        }
    }
}

/// A decoded value. Bit arrays of the common widths use the packed
/// variants; other arrays keep their element type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Bit(bool),
    B8(u8),
    B16(u16),
    B32(u32),
    B64(u64),
    Array(Arc<Type>, Vec<Value>),
    Ref(Arc<Type>, Digest),
    /// Variants, tag, content.
    Sum(Arc<[Type]>, u32, Box<Value>),
    Product(Vec<Value>),
    /// Element type, digest of the stored `Array[elem, len]`, len.
    List(Arc<Type>, Digest, u32),
    Lazy(Arc<Type>, AnyProg),
    Lambda(Arc<Type>, Arc<Type>, AnyProg),
    Port(Arc<PortType>, Digest),
    /// The full `Distinct` type and the underlying value.
    Distinct(Type, Box<Value>),
    Type(Type),
    Prog(Program),
    AnyProg(AnyProg),
    AnyType(AnyType),
    AnyValue(AnyValue),
}

/// Something a value points at in the store.
#[derive(Clone, Debug)]
enum Edge {
    Value(Digest, Type),
    Type(AnyType),
    Prog(AnyProg),
    Any(AnyValue),
}

impl Value {
    pub fn unit() -> Value {
        Value::Product(Vec::new())
    }

    /// A bit array of `width` bits holding the low bits of `v`.
    pub fn bits(width: u32, v: u64) -> Value {
        match width {
            8 => Value::B8(v as u8),
            16 => Value::B16(v as u16),
            32 => Value::B32(v as u32),
            64 => Value::B64(v),
            _ => Value::Array(
                Arc::new(Type::Bit),
                (0..width)
                    .map(|i| Value::Bit(i < 64 && (v >> i) & 1 == 1))
                    .collect(),
            ),
        }
    }

    /// The integer held by a bit or a bit array of at most 64 bits.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Bit(b) => Some(u64::from(*b)),
            Value::B8(v) => Some(u64::from(*v)),
            Value::B16(v) => Some(u64::from(*v)),
            Value::B32(v) => Some(u64::from(*v)),
            Value::B64(v) => Some(*v),
            Value::Array(elem, items) if **elem == Type::Bit && items.len() <= 64 => {
                let mut out = 0u64;
                for (i, item) in items.iter().enumerate() {
                    if *item == Value::Bit(true) {
                        out |= 1 << i;
                    }
                }
                Some(out)
            }
            _ => None,
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            Value::Bit(_) => Type::Bit,
            Value::B8(_) => Type::b8(),
            Value::B16(_) => Type::b16(),
            Value::B32(_) => Type::b32(),
            Value::B64(_) => Type::b64(),
            Value::Array(elem, items) => Type::Array(elem.clone(), items.len() as u32),
            Value::Ref(elem, _) => Type::Ref(elem.clone()),
            Value::Sum(variants, ..) => Type::Sum(variants.clone()),
            Value::Product(fields) => Type::Product(fields.iter().map(Value::ty).collect()),
            Value::List(elem, ..) => Type::List(elem.clone()),
            Value::Lazy(out, _) => Type::Lazy(out.clone()),
            Value::Lambda(input, output, _) => Type::Lambda(input.clone(), output.clone()),
            Value::Port(p, _) => Type::Port(p.clone()),
            Value::Distinct(ty, _) => ty.clone(),
            Value::Type(t) => Type::Kind(t.kind()),
            Value::Prog(p) => Type::Prog(p.byte_len()),
            Value::AnyProg(_) => Type::AnyProg,
            Value::AnyType(_) => Type::AnyType,
            Value::AnyValue(_) => Type::AnyValue,
        }
    }

    pub fn size_of(&self) -> Result<u32> {
        self.ty().size_of()
    }

    /// Composite sub-parts: array items, product fields, sum content and
    /// the value under a distinct type.
    pub fn components(&self) -> std::slice::Iter<'_, Value> {
        match self {
            Value::Array(_, items) | Value::Product(items) => items.iter(),
            Value::Sum(_, _, content) | Value::Distinct(_, content) => {
                std::slice::from_ref(&**content).iter()
            }
            _ => [].iter(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bits = self.size_of()?;
        let mut buf = BitBuf::with_len(vec![0u8; bytes_for(bits)], bits as usize);
        self.encode_into(&mut buf)?;
        Ok(buf.into_inner())
    }

    /// The value as stack words, low bits first.
    pub fn to_words(&self) -> Result<Vec<u32>> {
        let bits = self.size_of()?;
        Ok(bitbuf::to_words(&self.encode()?, bits))
    }

    /// Write exactly `size_of()` bits into `buf`.
    pub fn encode_into<B: AsRef<[u8]> + AsMut<[u8]>>(&self, buf: &mut BitBuf<B>) -> Result<()> {
        match self {
            Value::Bit(b) => buf.put(0, *b),
            Value::B8(v) => buf.put8(0, *v),
            Value::B16(v) => buf.put16(0, *v),
            Value::B32(v) => buf.put32(0, *v),
            Value::B64(v) => buf.put64(0, *v),
            Value::Array(elem, items) => {
                let w = elem.size_of()? as usize;
                for (i, item) in items.iter().enumerate() {
                    item.encode_into(&mut buf.slice_mut(i * w, (i + 1) * w))?;
                }
            }
            Value::Ref(_, d) | Value::Port(_, d) => buf.put_bytes(0, d),
            Value::Sum(variants, tag, content) => {
                let variant = variants.get(*tag as usize).ok_or_else(|| {
                    Error::type_error(format!("tag {tag} out of range for {}", self.ty()))
                })?;
                let (content_bits, tag_bits) = sum_layout(variants)?;
                let size = variant.size_of()? as usize;
                content.encode_into(&mut buf.slice_mut(0, size))?;
                buf.zero(size, content_bits as usize);
                buf.put_bits(content_bits as usize, tag_bits as usize, u64::from(*tag));
            }
            Value::Product(fields) => {
                let mut at = 0usize;
                for field in fields {
                    let w = field.size_of()? as usize;
                    field.encode_into(&mut buf.slice_mut(at, at + w))?;
                    at += w;
                }
            }
            Value::List(_, d, len) => {
                buf.put_bytes(0, d);
                buf.put32(256, *len);
            }
            Value::Lazy(_, p) | Value::Lambda(_, _, p) | Value::AnyProg(p) => p.encode_into(buf),
            Value::Distinct(_, inner) => inner.encode_into(buf)?,
            Value::Type(t) => t.encode_into(buf),
            Value::Prog(p) => buf.put_bytes(0, &p.encode()),
            Value::AnyType(at) => put_any_type(buf, 0, at),
            Value::AnyValue(av) => av.encode_into(buf),
        }
        Ok(())
    }

    /// Decode a value of type `ty` from the low bits of `buf`. Child types
    /// of type values are fetched through `loader`; references are left as
    /// digests.
    pub fn decode<B, G>(ty: &Type, buf: &BitBuf<B>, loader: &G) -> Result<Value>
    where
        B: AsRef<[u8]>,
        G: Getter + ?Sized,
    {
        let size = ty.size_of()? as usize;
        if buf.len() < size {
            return Err(Error::Size(format!(
                "{ty} needs {size} bits, buffer holds {}",
                buf.len()
            )));
        }
        Ok(match ty {
            Type::Kind(k) => Value::Type(Type::decode(*k, buf, loader)?),
            Type::Bit => Value::Bit(buf.get(0)),
            Type::Array(elem, n) => match (&**elem, *n) {
                (Type::Bit, 8) => Value::B8(buf.get8(0)),
                (Type::Bit, 16) => Value::B16(buf.get16(0)),
                (Type::Bit, 32) => Value::B32(buf.get32(0)),
                (Type::Bit, 64) => Value::B64(buf.get64(0)),
                _ => {
                    let w = elem.size_of()? as usize;
                    // The buffer does not bound zero-size elements.
                    if w == 0 && *n > MAX_BLOB_BITS {
                        return Err(Error::Size(format!(
                            "{ty} holds more than {MAX_BLOB_BITS} empty elements"
                        )));
                    }
                    let mut items = Vec::with_capacity(*n as usize);
                    for i in 0..*n as usize {
                        items.push(Value::decode(elem, &buf.slice(i * w, (i + 1) * w), loader)?);
                    }
                    Value::Array(elem.clone(), items)
                }
            },
            Type::Prog(_) => Value::Prog(Program::decode(&buf.slice(0, size).to_bytes())?),
            Type::Ref(elem) => Value::Ref(elem.clone(), digest_at(buf, 0)),
            Type::Sum(variants) => {
                let (content_bits, tag_bits) = sum_layout(variants)?;
                let tag = buf.get_bits(content_bits as usize, tag_bits as usize);
                let variant = variants.get(tag as usize).ok_or_else(|| {
                    Error::Malformed(format!("tag {tag} out of range for {ty}"))
                })?;
                let vsize = variant.size_of()? as usize;
                if !buf.check_zero(vsize, content_bits as usize) {
                    return Err(Error::Malformed(format!("non-zero padding in {ty}")));
                }
                let content = Value::decode(variant, &buf.slice(0, vsize), loader)?;
                Value::Sum(variants.clone(), tag as u32, Box::new(content))
            }
            Type::Product(fields) => {
                let offsets = ty.field_offsets()?;
                let mut out = Vec::with_capacity(fields.len());
                for (i, field) in fields.iter().enumerate() {
                    let part = buf.slice(offsets[i] as usize, offsets[i + 1] as usize);
                    out.push(Value::decode(field, &part, loader)?);
                }
                Value::Product(out)
            }
            Type::List(elem) => Value::List(elem.clone(), digest_at(buf, 0), buf.get32(256)),
            Type::Lazy(out) => Value::Lazy(out.clone(), AnyProg::decode(buf)),
            Type::Lambda(input, output) => {
                Value::Lambda(input.clone(), output.clone(), AnyProg::decode(buf))
            }
            Type::Fractal(_) => Value::decode(ty.expanded()?, buf, loader)?,
            Type::Port(p) => Value::Port(p.clone(), digest_at(buf, 0)),
            Type::Distinct(base, _) => {
                Value::Distinct(ty.clone(), Box::new(Value::decode(base, buf, loader)?))
            }
            Type::AnyProg => Value::AnyProg(AnyProg::decode(buf)),
            Type::AnyType => Value::AnyType(get_any_type(buf, 0)?),
            Type::AnyValue => Value::AnyValue(AnyValue::decode(buf)?),
        })
    }

    /// Decode a whole blob, which must be exactly as long as `ty` requires.
    pub fn decode_blob<G: Getter + ?Sized>(ty: &Type, bytes: &[u8], loader: &G) -> Result<Value> {
        check_len(bytes, ty.size_of()?, "blob")?;
        Value::decode(ty, &BitBuf::new(bytes), loader)
    }

    /// Rebuild a value of `ty` from stack words.
    pub fn from_words<G: Getter + ?Sized>(ty: &Type, words: &[u32], loader: &G) -> Result<Value> {
        let bits = ty.size_of()?;
        if words.len() < bitbuf::words_for(bits) {
            return Err(Error::Size(format!(
                "{ty} needs {} words, got {}",
                bitbuf::words_for(bits),
                words.len()
            )));
        }
        Value::decode_blob(ty, &bitbuf::from_words(words, bits), loader)
    }

    /// The content digest this value would be posted under, computed
    /// without touching a store.
    pub fn fingerprint(&self) -> Result<Digest> {
        let salt = self.ty().salt()?;
        Ok(cid::compute(salt.as_ref(), &self.encode()?))
    }

    /// Post this value, refusing if anything it refers to is missing from
    /// `store`. Type values also post their child types.
    pub fn post<S: Store + ?Sized>(&self, store: &S) -> Result<Digest> {
        if let Value::Type(t) = self {
            return Ok(t.post(store)?.digest);
        }
        self.check_refs(store)?;
        let salt = self.ty().salt()?;
        store.post(salt.as_ref(), &self.encode()?)
    }

    /// Post the value and its type, yielding the universal handle.
    pub fn to_any_value<S: Store + ?Sized>(&self, store: &S) -> Result<AnyValue> {
        let ty = self.ty().post(store)?;
        let digest = self.post(store)?;
        Ok(AnyValue { digest, ty })
    }

    /// Fetch, verify and decode the value of type `ty` stored under `digest`.
    pub fn load<G: Getter + ?Sized>(loader: &G, ty: &Type, digest: &Digest) -> Result<Value> {
        let salt = ty.salt()?.unwrap_or(cid::NO_SALT);
        let bytes = loader.read(digest, Some(&salt))?;
        Value::decode_blob(ty, &bytes, loader)
    }

    /// Make sure every blob reachable from this value exists in `dst`,
    /// copying from `src` where missing.
    pub fn pull_into<D, S>(&self, dst: &D, src: &S) -> Result<()>
    where
        D: Store + ?Sized,
        S: Getter + ?Sized,
    {
        self.pull_into_with(dst, src, &mut NoExpand)
    }

    /// [`Value::pull_into`] for graphs that reach fractal types through
    /// references, whose expansions `ex` supplies.
    #[instrument(skip_all)]
    pub fn pull_into_with<D, S>(&self, dst: &D, src: &S, ex: &mut dyn Expand) -> Result<()>
    where
        D: Store + ?Sized,
        S: Getter + ?Sized,
    {
        for part in self.components() {
            part.pull_into_with(dst, src, ex)?;
        }
        for edge in self.edges() {
            pull_edge(edge, dst, src, ex)?;
        }
        Ok(())
    }

    fn check_refs<S: Store + ?Sized>(&self, store: &S) -> Result<()> {
        for part in self.components() {
            part.check_refs(store)?;
        }
        for edge in self.edges() {
            let keys = match &edge {
                Edge::Value(d, _) => vec![*d],
                Edge::Type(at) => vec![at.digest],
                Edge::Prog(p) => vec![p.digest],
                Edge::Any(av) => vec![av.ty.digest, av.digest],
            };
            for key in keys {
                if !store.exists(&key)? {
                    return Err(Error::NotFound(key));
                }
            }
        }
        Ok(())
    }

    /// Direct store references of this value, not counting components.
    fn edges(&self) -> Vec<Edge> {
        match self {
            Value::Ref(elem, d) => vec![Edge::Value(*d, (**elem).clone())],
            Value::List(elem, d, len) => vec![Edge::Value(*d, Type::Array(elem.clone(), *len))],
            Value::Lazy(_, p) | Value::Lambda(_, _, p) | Value::AnyProg(p) => vec![Edge::Prog(*p)],
            Value::AnyType(at) => vec![Edge::Type(*at)],
            Value::AnyValue(av) => vec![Edge::Any(*av)],
            Value::Type(t) => {
                let mut edges: Vec<Edge> =
                    t.children().into_iter().map(|c| Edge::Type(c.any_type())).collect();
                match t {
                    Type::Fractal(f) => edges.push(Edge::Prog(AnyProg {
                        digest: f.body,
                        bytes: f.bytes,
                    })),
                    Type::Distinct(_, mark) => edges.push(Edge::Any(*mark)),
                    _ => {}
                }
                edges
            }
            Value::Prog(p) => {
                let (types, values) = p.literal_refs();
                let mut edges: Vec<Edge> = types.into_iter().map(Edge::Type).collect();
                edges.extend(values.into_iter().map(Edge::Any));
                edges
            }
            _ => Vec::new(),
        }
    }
}

fn pull_edge<D, S>(edge: Edge, dst: &D, src: &S, ex: &mut dyn Expand) -> Result<()>
where
    D: Store + ?Sized,
    S: Getter + ?Sized,
{
    match edge {
        Edge::Value(digest, ty) => {
            if dst.exists(&digest)? {
                return Ok(());
            }
            resolve(&ty, ex)?;
            let salt = ty.salt()?;
            let bytes = src.read(&digest, Some(salt.as_ref().unwrap_or(&cid::NO_SALT)))?;
            Value::decode_blob(&ty, &bytes, src)?.pull_into_with(dst, src, ex)?;
            dst.post(salt.as_ref(), &bytes)?;
            debug!(key = %cid::to_text(&digest), %ty, "pulled value");
        }
        Edge::Type(at) => {
            if dst.exists(&at.digest)? {
                return Ok(());
            }
            let ty = load_type(src, &at)?;
            Value::Type(ty.clone()).pull_into_with(dst, src, ex)?;
            dst.post(None, &ty.encode())?;
        }
        Edge::Prog(p) => {
            if dst.exists(&p.digest)? {
                return Ok(());
            }
            let bytes = src.read(&p.digest, Some(&cid::NO_SALT))?;
            if bytes.len() != p.bytes as usize {
                return Err(Error::Size(format!(
                    "program {} has {} bytes, expected {}",
                    cid::to_text(&p.digest),
                    bytes.len(),
                    p.bytes
                )));
            }
            Value::Prog(Program::decode(&bytes)?).pull_into_with(dst, src, ex)?;
            dst.post(None, &bytes)?;
        }
        Edge::Any(av) => {
            pull_edge(Edge::Type(av.ty), dst, src, ex)?;
            if !dst.exists(&av.digest)? {
                let ty = load_type(dst, &av.ty)?;
                pull_edge(Edge::Value(av.digest, ty), dst, src, ex)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn digest_at<B: AsRef<[u8]>>(buf: &BitBuf<B>, at: usize) -> Digest {
    let mut digest = [0u8; 32];
    buf.get_bytes(at, &mut digest);
    digest
}

fn check_len(bytes: &[u8], bits: u32, what: &str) -> Result<()> {
    if bytes.len() != bytes_for(bits) {
        return Err(Error::Size(format!(
            "{what} of {bits} bits needs {} bytes, got {}",
            bytes_for(bits),
            bytes.len()
        )));
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bit(b) => write!(f, "{}", u8::from(*b)),
            Value::B8(v) => write!(f, "{v}"),
            Value::B16(v) => write!(f, "{v}"),
            Value::B32(v) => write!(f, "{v}"),
            Value::B64(v) => write!(f, "{v}"),
            Value::Array(_, items) | Value::Product(items) => {
                f.write_str(if matches!(self, Value::Array(..)) { "[" } else { "(" })?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(if matches!(self, Value::Array(..)) { "]" } else { ")" })
            }
            Value::Ref(_, d) | Value::Port(_, d) => f.write_str(&cid::to_text(d)),
            Value::Sum(_, tag, content) => write!(f, "#{tag} {content}"),
            Value::List(_, d, len) => write!(f, "list {} of {len}", cid::to_text(d)),
            Value::Lazy(_, p) | Value::Lambda(_, _, p) | Value::AnyProg(p) => {
                write!(f, "prog {} ({} bytes)", cid::to_text(&p.digest), p.bytes)
            }
            Value::Distinct(_, inner) => write!(f, "{inner}"),
            Value::Type(t) => write!(f, "{t}"),
            Value::Prog(p) => write!(f, "program of {} nodes", p.nodes().len()),
            Value::AnyType(at) => write!(f, "{at}"),
            Value::AnyValue(av) => write!(f, "{av}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, Span};

    fn sample(store: &MemStore) -> Result<Value> {
        let inner = Value::Product(vec![Value::B32(7), Value::Bit(true)]);
        let inner_ref = inner.post(store)?;
        let items = Value::Array(
            Arc::new(Type::b16()),
            vec![Value::B16(1), Value::B16(2), Value::B16(3)],
        );
        let list = items.post(store)?;
        let boxed = Value::B64(99).to_any_value(store)?;
        Ok(Value::Product(vec![
            Value::Ref(Arc::new(inner.ty()), inner_ref),
            Value::List(Arc::new(Type::b16()), list, 3),
            Value::Sum(
                Arc::from(vec![Type::unit(), Type::b8()]),
                1,
                Box::new(Value::B8(5)),
            ),
            Value::AnyValue(boxed),
        ]))
    }

    #[test]
    fn encode_then_decode() -> Result<()> {
        let store = MemStore::new();
        let value = sample(&store)?;
        let ty = value.ty();
        assert_eq!(ty.size_of()?, 256 + 288 + 9 + 544);
        let bytes = value.encode()?;
        assert_eq!(bytes.len(), bytes_for(ty.size_of()?));
        assert_eq!(Value::decode_blob(&ty, &bytes, &store)?, value);
        let words = value.to_words()?;
        assert_eq!(Value::from_words(&ty, &words, &store)?, value);
        Ok(())
    }

    #[test]
    fn empty_element_arrays_are_bounded() -> Result<()> {
        let store = MemStore::new();
        let units = Type::array(Type::unit(), 1000);
        let Value::Array(_, items) = Value::decode_blob(&units, &[], &store)? else {
            panic!("expected an array");
        };
        assert_eq!(items.len(), 1000);
        assert!(items.iter().all(|v| *v == Value::Product(Vec::new())));

        let huge = Type::array(Type::unit(), u32::MAX);
        assert_eq!(huge.size_of()?, 0);
        let err = Value::decode_blob(&huge, &[], &store).err();
        assert!(matches!(err, Some(Error::Size(_))));
        Ok(())
    }

    #[test]
    fn post_then_load() -> Result<()> {
        let store = MemStore::new();
        let value = sample(&store)?;
        let digest = value.post(&store)?;
        assert_eq!(digest, value.fingerprint()?);
        assert_eq!(Value::load(&store, &value.ty(), &digest)?, value);
        let any = value.to_any_value(&store)?;
        assert_eq!(any.load(&store, &mut NoExpand)?, value);
        assert_eq!(AnyValue::from_bytes(&any.to_bytes())?, any);
        Ok(())
    }

    #[test]
    fn bit_arrays_use_packed_variants() -> Result<()> {
        let store = MemStore::new();
        let value = Value::bits(32, 0xdead_beef);
        assert_eq!(value, Value::B32(0xdead_beef));
        let odd = Value::bits(3, 0b101);
        assert_eq!(odd.size_of()?, 3);
        assert_eq!(odd.as_u64(), Some(5));
        assert_eq!(odd.encode()?, vec![0b101]);
        assert_eq!(Value::decode_blob(&Type::b32(), &0xdead_beefu32.to_le_bytes(), &store)?, value);
        Ok(())
    }

    #[test]
    fn unsalted_types_hash_plainly() -> Result<()> {
        assert_eq!(Value::Bit(true).fingerprint()?, cid::compute(None, &[1]));
        let salted = Value::B8(1).fingerprint()?;
        assert_ne!(salted, cid::compute(None, &[1]));
        assert_eq!(salted, cid::compute(Some(&Type::b8().fingerprint()), &[1]));
        Ok(())
    }

    #[test]
    fn post_refuses_dangling_refs() {
        let store = MemStore::new();
        let dangling = Value::Ref(Arc::new(Type::b32()), [9u8; 32]);
        assert!(matches!(dangling.post(&store), Err(Error::NotFound(d)) if d == [9u8; 32]));
    }

    #[test]
    fn decode_rejects_bad_sums() -> Result<()> {
        let store = MemStore::new();
        let ty = Type::sum(vec![Type::Bit, Type::b8(), Type::unit()]);
        // tag 3 of 3 variants
        assert!(matches!(
            Value::decode_blob(&ty, &[0, 0b11], &store),
            Err(Error::Malformed(_))
        ));
        // variant 0 is one bit wide; bit 4 is padding
        assert!(matches!(
            Value::decode_blob(&ty, &[0b1_0000, 0], &store),
            Err(Error::Malformed(_))
        ));
        assert_eq!(
            Value::decode_blob(&ty, &[1, 0], &store)?,
            Value::Sum(ty_variants(&ty), 0, Box::new(Value::Bit(true)))
        );
        Ok(())
    }

    fn ty_variants(ty: &Type) -> Arc<[Type]> {
        match ty {
            Type::Sum(vs) => vs.clone(),
            _ => Arc::from(Vec::new()),
        }
    }

    #[test]
    fn pull_copies_the_closure() -> Result<()> {
        let src = MemStore::new();
        let value = sample(&src)?;
        let any = value.to_any_value(&src)?;
        let dst = MemStore::new();
        Value::AnyValue(any).pull_into(&dst, &src)?;

        let mut keys = Vec::new();
        src.list(&Span::first(usize::MAX), &mut keys)?;
        for key in &keys {
            assert!(dst.exists(key)?);
            assert_eq!(dst.fetch(key)?, src.fetch(key)?);
        }
        assert_eq!(dst.len(), src.len());
        assert_eq!(any.load(&dst, &mut NoExpand)?, value);

        // A second pull finds everything present.
        Value::AnyValue(any).pull_into(&dst, &src)?;
        assert_eq!(dst.len(), src.len());
        Ok(())
    }

    #[test]
    fn type_values_post_their_children() -> Result<()> {
        let store = MemStore::new();
        let ty = Type::list(Type::product(vec![Type::b8(), Type::AnyValue]));
        let value = Value::Type(ty.clone());
        assert_eq!(value.ty(), Type::Kind(Kind::LIST));
        let digest = value.post(&store)?;
        assert_eq!(digest, ty.fingerprint());
        assert_eq!(value.fingerprint()?, digest);
        assert_eq!(load_type(&store, &ty.any_type())?, ty);
        Ok(())
    }
}
