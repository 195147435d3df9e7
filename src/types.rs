//! Structural types, their bit-exact encodings, salts and the subtype relation.
//!
//! A type is itself a value whose type is a [`Kind`]. Child types are
//! referenced by [`AnyType`] (the unsalted digest of the child's encoding
//! plus its kind word), so a type value has a fixed size determined by its
//! kind alone. In memory the children are kept as shared trees; fractal
//! types are the one exception and carry their expansion lazily.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::bitbuf::{BitBuf, bytes_for};
use crate::cid::{self, Digest};
use crate::error::{Error, Result};
use crate::kind::{ANY_TYPE_BITS, ANY_VALUE_BITS, Kind, KindTag, REF_SIZE_BITS};
use crate::store::{Getter, Store};
use crate::value::{AnyType, AnyValue};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    /// The type of type values of the given kind. `Kind(Kind::KIND)` is the
    /// type of kind words.
    Kind(Kind),
    Bit,
    Array(Arc<Type>, u32),
    /// Encoded programs of the given byte length.
    Prog(u32),
    Ref(Arc<Type>),
    Sum(Arc<[Type]>),
    Product(Arc<[Type]>),
    List(Arc<Type>),
    Lazy(Arc<Type>),
    Lambda(Arc<Type>, Arc<Type>),
    Fractal(Arc<Fractal>),
    Port(Arc<PortType>),
    Distinct(Arc<Type>, AnyValue),
    AnyProg,
    AnyType,
    AnyValue,
}

/// The four declared types of a port: what it emits on output, what it
/// yields on input, and its request/response pair for interaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortType {
    pub output: Type,
    pub input: Type,
    pub request: Type,
    pub response: Type,
}

/// A recursive type defined by a stored program in which `Self` names the
/// fractal. The expansion is computed by the compiler and cached here.
pub struct Fractal {
    pub body: Digest,
    pub bytes: u32,
    expansion: OnceCell<Type>,
}

impl Fractal {
    pub fn new(body: Digest, bytes: u32) -> Self {
        Self {
            body,
            bytes,
            expansion: OnceCell::new(),
        }
    }

    pub fn expansion(&self) -> Option<&Type> {
        self.expansion.get()
    }

    /// Record the expansion. A second call keeps the first value.
    pub fn set_expansion(&self, ty: Type) {
        let _ = self.expansion.set(ty);
    }
}

impl fmt::Debug for Fractal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fractal")
            .field("body", &cid::to_text(&self.body))
            .field("bytes", &self.bytes)
            .field("expanded", &self.expansion.get().is_some())
            .finish()
    }
}

/// Two fractals are equal when they name the same body, or when both are
/// expanded and the expansions encode identically.
impl PartialEq for Fractal {
    fn eq(&self, other: &Self) -> bool {
        if self.body == other.body && self.bytes == other.bytes {
            return true;
        }
        match (self.expansion(), other.expansion()) {
            (Some(a), Some(b)) => a.fingerprint() == b.fingerprint(),
            _ => false,
        }
    }
}

impl Eq for Fractal {}

// Equal fractals may differ in body, so nothing beyond the variant is hashed.
impl Hash for Fractal {
    fn hash<H: Hasher>(&self, _state: &mut H) {}
}

impl Type {
    pub fn bits(n: u32) -> Type {
        Type::Array(Arc::new(Type::Bit), n)
    }

    pub fn b8() -> Type {
        Type::bits(8)
    }

    pub fn b16() -> Type {
        Type::bits(16)
    }

    pub fn b32() -> Type {
        Type::bits(32)
    }

    pub fn b64() -> Type {
        Type::bits(64)
    }

    pub fn array(elem: Type, n: u32) -> Type {
        Type::Array(Arc::new(elem), n)
    }

    pub fn reference(elem: Type) -> Type {
        Type::Ref(Arc::new(elem))
    }

    pub fn list(elem: Type) -> Type {
        Type::List(Arc::new(elem))
    }

    pub fn lazy(out: Type) -> Type {
        Type::Lazy(Arc::new(out))
    }

    pub fn lambda(input: Type, output: Type) -> Type {
        Type::Lambda(Arc::new(input), Arc::new(output))
    }

    pub fn product(fields: Vec<Type>) -> Type {
        Type::Product(fields.into())
    }

    pub fn sum(variants: Vec<Type>) -> Type {
        Type::Sum(variants.into())
    }

    pub fn unit() -> Type {
        Type::Product(Arc::from(Vec::new()))
    }

    /// The empty sum: uninhabited and a subtype of every type.
    pub fn bottom() -> Type {
        Type::Sum(Arc::from(Vec::new()))
    }

    pub fn port(output: Type, input: Type, request: Type, response: Type) -> Type {
        Type::Port(Arc::new(PortType {
            output,
            input,
            request,
            response,
        }))
    }

    pub fn is_bottom(&self) -> bool {
        matches!(self, Type::Sum(variants) if variants.is_empty())
    }

    /// Width of a bit array, when this is one.
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            Type::Array(elem, n) if **elem == Type::Bit => Some(*n),
            _ => None,
        }
    }

    /// The kind word of this type. Sums and products wider than
    /// [`Kind::MAX_ARITY`] have no kind; see [`Type::checked_kind`].
    pub fn kind(&self) -> Kind {
        match self {
            Type::Kind(_) => Kind::KIND,
            Type::Bit => Kind::BIT,
            Type::Array(..) => Kind::ARRAY,
            Type::Prog(_) => Kind::PROG,
            Type::Ref(_) => Kind::REF,
            Type::Sum(vs) => arity_kind(Kind::sum, vs.len()).unwrap_or(Kind::KIND),
            Type::Product(fs) => arity_kind(Kind::product, fs.len()).unwrap_or(Kind::KIND),
            Type::List(_) => Kind::LIST,
            Type::Lazy(_) => Kind::LAZY,
            Type::Lambda(..) => Kind::LAMBDA,
            Type::Fractal(_) => Kind::FRACTAL,
            Type::Port(_) => Kind::PORT,
            Type::Distinct(..) => Kind::DISTINCT,
            Type::AnyProg => Kind::ANY_PROG,
            Type::AnyType => Kind::ANY_TYPE,
            Type::AnyValue => Kind::ANY_VALUE,
        }
    }

    /// Like [`Type::kind`], but fails on sums and products whose arity does
    /// not fit a kind word.
    pub fn checked_kind(&self) -> Result<Kind> {
        match self {
            Type::Sum(vs) => arity_kind(Kind::sum, vs.len()),
            Type::Product(fs) => arity_kind(Kind::product, fs.len()),
            other => Ok(other.kind()),
        }
    }

    /// Follow a fractal to its expansion; other types are returned as is.
    pub fn expanded(&self) -> Result<&Type> {
        match self {
            Type::Fractal(f) => f.expansion().ok_or_else(|| {
                Error::type_error(format!(
                    "fractal {} has not been expanded",
                    cid::to_text(&f.body)
                ))
            }),
            other => Ok(other),
        }
    }

    /// Size in bits of every value of this type.
    pub fn size_of(&self) -> Result<u32> {
        let overflow = || Error::Size(format!("size of {self} overflows 32 bits"));
        Ok(match self {
            Type::Kind(k) => k.data_bits(),
            Type::Bit => 1,
            Type::Array(elem, n) => elem.size_of()?.checked_mul(*n).ok_or_else(overflow)?,
            Type::Prog(bytes) => bytes.checked_mul(8).ok_or_else(overflow)?,
            Type::Ref(_) | Type::Port(_) => 256,
            Type::List(_) | Type::Lazy(_) | Type::Lambda(..) | Type::AnyProg => REF_SIZE_BITS,
            Type::AnyType => ANY_TYPE_BITS,
            Type::AnyValue => ANY_VALUE_BITS,
            Type::Sum(vs) => {
                self.checked_kind()?;
                let (content, tag) = sum_layout(vs)?;
                content.checked_add(tag).ok_or_else(overflow)?
            }
            Type::Product(fs) => {
                self.checked_kind()?;
                let mut total = 0u32;
                for f in fs.iter() {
                    total = total.checked_add(f.size_of()?).ok_or_else(overflow)?;
                }
                total
            }
            Type::Fractal(_) => self.expanded()?.size_of()?,
            Type::Distinct(base, _) => base.size_of()?,
        })
    }

    /// Bit offsets of each product field (plus the total as the last entry).
    pub fn field_offsets(&self) -> Result<Vec<u32>> {
        match self.expanded()? {
            Type::Product(fs) => {
                let mut offsets = Vec::with_capacity(fs.len() + 1);
                let mut at = 0u32;
                offsets.push(0);
                for f in fs.iter() {
                    at = at
                        .checked_add(f.size_of()?)
                        .ok_or_else(|| Error::Size("product size overflows 32 bits".into()))?;
                    offsets.push(at);
                }
                Ok(offsets)
            }
            other => Err(Error::type_error(format!("{other} is not a product"))),
        }
    }

    /// Whether values of this type are posted under a type-derived salt.
    pub fn needs_salt(&self) -> bool {
        match self {
            Type::Kind(_)
            | Type::Bit
            | Type::Prog(_)
            | Type::AnyType
            | Type::AnyValue
            | Type::Port(_) => false,
            Type::Sum(ts) | Type::Product(ts) => !ts.is_empty(),
            Type::Distinct(base, _) => base.needs_salt(),
            Type::Fractal(f) => f.expansion().is_none_or(Type::needs_salt),
            Type::Array(..)
            | Type::Ref(_)
            | Type::List(_)
            | Type::Lazy(_)
            | Type::Lambda(..)
            | Type::AnyProg => true,
        }
    }

    /// The salt for posting values of this type, if any: the digest of the
    /// fully-expanded type.
    pub fn salt(&self) -> Result<Option<Digest>> {
        if !self.needs_salt() {
            return Ok(None);
        }
        Ok(Some(self.expanded()?.fingerprint()))
    }

    /// The digest of this type's encoding; what an AnyType refers to.
    pub fn fingerprint(&self) -> Digest {
        cid::compute(None, &self.encode())
    }

    pub fn any_type(&self) -> AnyType {
        AnyType {
            digest: self.fingerprint(),
            kind: self.kind(),
        }
    }

    /// The bit-exact encoding of this type as a value of its kind.
    pub fn encode(&self) -> Vec<u8> {
        let bits = self.kind().data_bits();
        let mut buf = BitBuf::with_len(vec![0u8; bytes_for(bits)], bits as usize);
        self.encode_into(&mut buf);
        buf.into_inner()
    }

    /// Write this type's encoding into `buf`, which must span exactly
    /// `kind().data_bits()` bits.
    pub fn encode_into<B: AsRef<[u8]> + AsMut<[u8]>>(&self, buf: &mut BitBuf<B>) {
        match self {
            Type::Kind(k) => buf.put32(0, k.word()),
            Type::Bit | Type::AnyProg | Type::AnyType | Type::AnyValue => {}
            Type::Array(elem, n) => {
                put_any_type(buf, 0, &elem.any_type());
                buf.put32(ANY_TYPE_BITS as usize, *n);
            }
            Type::Prog(bytes) => buf.put32(0, *bytes),
            Type::Ref(elem) | Type::List(elem) | Type::Lazy(elem) => {
                put_any_type(buf, 0, &elem.any_type());
            }
            Type::Sum(ts) | Type::Product(ts) => {
                for (i, t) in ts.iter().enumerate() {
                    put_any_type(buf, i * ANY_TYPE_BITS as usize, &t.any_type());
                }
            }
            Type::Lambda(input, output) => {
                put_any_type(buf, 0, &input.any_type());
                put_any_type(buf, ANY_TYPE_BITS as usize, &output.any_type());
            }
            Type::Fractal(f) => {
                buf.put_bytes(0, &f.body);
                buf.put32(256, f.bytes);
            }
            Type::Port(p) => {
                for (i, t) in [&p.output, &p.input, &p.request, &p.response]
                    .into_iter()
                    .enumerate()
                {
                    put_any_type(buf, i * ANY_TYPE_BITS as usize, &t.any_type());
                }
            }
            Type::Distinct(base, mark) => {
                put_any_type(buf, 0, &base.any_type());
                let end = (ANY_TYPE_BITS + ANY_VALUE_BITS) as usize;
                mark.encode_into(&mut buf.slice_mut(ANY_TYPE_BITS as usize, end));
            }
        }
    }

    /// Decode a type of kind `kind`, loading child types through `loader`.
    pub fn decode<B, G>(kind: Kind, buf: &BitBuf<B>, loader: &G) -> Result<Type>
    where
        B: AsRef<[u8]>,
        G: Getter + ?Sized,
    {
        let bits = kind.data_bits() as usize;
        if buf.len() < bits {
            return Err(Error::Size(format!(
                "type of kind {kind} needs {bits} bits, buffer holds {}",
                buf.len()
            )));
        }
        let child = |i: usize| -> Result<Arc<Type>> {
            let at = get_any_type(buf, i * ANY_TYPE_BITS as usize)?;
            Ok(Arc::new(load_type(loader, &at)?))
        };
        Ok(match kind.tag() {
            KindTag::Kind => Type::Kind(Kind::from_word(buf.get32(0))?),
            KindTag::Bit => Type::Bit,
            KindTag::AnyProg => Type::AnyProg,
            KindTag::AnyType => Type::AnyType,
            KindTag::AnyValue => Type::AnyValue,
            KindTag::Array => Type::Array(child(0)?, buf.get32(ANY_TYPE_BITS as usize)),
            KindTag::Prog => Type::Prog(buf.get32(0)),
            KindTag::Ref => Type::Ref(child(0)?),
            KindTag::List => Type::List(child(0)?),
            KindTag::Lazy => Type::Lazy(child(0)?),
            KindTag::Lambda => Type::Lambda(child(0)?, child(1)?),
            KindTag::Sum | KindTag::Product => {
                let mut items = Vec::with_capacity(kind.arity() as usize);
                for i in 0..kind.arity() as usize {
                    items.push((*child(i)?).clone());
                }
                if kind.tag() == KindTag::Sum {
                    Type::Sum(items.into())
                } else {
                    Type::Product(items.into())
                }
            }
            KindTag::Fractal => {
                let mut body = [0u8; 32];
                buf.get_bytes(0, &mut body);
                Type::Fractal(Arc::new(Fractal::new(body, buf.get32(256))))
            }
            KindTag::Port => Type::port(
                (*child(0)?).clone(),
                (*child(1)?).clone(),
                (*child(2)?).clone(),
                (*child(3)?).clone(),
            ),
            KindTag::Distinct => {
                let mark = AnyValue::decode(&buf.slice(
                    ANY_TYPE_BITS as usize,
                    (ANY_TYPE_BITS + ANY_VALUE_BITS) as usize,
                ))?;
                Type::Distinct(child(0)?, mark)
            }
        })
    }

    /// Post this type and every child type into `store`, returning its AnyType.
    pub fn post<S: Store + ?Sized>(&self, store: &S) -> Result<AnyType> {
        self.checked_kind()?;
        let at = self.any_type();
        if store.exists(&at.digest)? {
            return Ok(at);
        }
        for child in self.children() {
            child.post(store)?;
        }
        match self {
            Type::Fractal(f) => {
                if !store.exists(&f.body)? {
                    return Err(Error::NotFound(f.body));
                }
            }
            Type::Distinct(_, mark) => {
                if !store.exists(&mark.digest)? {
                    return Err(Error::NotFound(mark.digest));
                }
            }
            _ => {}
        }
        let digest = store.post(None, &self.encode())?;
        debug_assert_eq!(digest, at.digest);
        Ok(at)
    }

    /// Child types referenced from this type's encoding.
    pub fn children(&self) -> Vec<&Type> {
        match self {
            Type::Kind(_)
            | Type::Bit
            | Type::Prog(_)
            | Type::Fractal(_)
            | Type::AnyProg
            | Type::AnyType
            | Type::AnyValue => Vec::new(),
            Type::Array(elem, _)
            | Type::Ref(elem)
            | Type::List(elem)
            | Type::Lazy(elem)
            | Type::Distinct(elem, _) => vec![&**elem],
            Type::Lambda(i, o) => vec![&**i, &**o],
            Type::Sum(ts) | Type::Product(ts) => ts.iter().collect(),
            Type::Port(p) => vec![&p.output, &p.input, &p.request, &p.response],
        }
    }

    /// `self <: sup`. Bottom is below everything; otherwise types match
    /// structurally, expanding a fractal at most once per comparison.
    pub fn is_subtype(&self, sup: &Type) -> bool {
        subtype(self, sup, false)
    }
}

fn subtype(a: &Type, b: &Type, expanded: bool) -> bool {
    if a == b || a.is_bottom() {
        return true;
    }
    if !expanded && (matches!(a, Type::Fractal(_)) || matches!(b, Type::Fractal(_))) {
        return match (a.expanded(), b.expanded()) {
            (Ok(a), Ok(b)) => subtype(a, b, true),
            _ => false,
        };
    }
    match (a, b) {
        (Type::Array(x, n), Type::Array(y, m)) => n == m && subtype(x, y, expanded),
        (Type::Ref(x), Type::Ref(y))
        | (Type::List(x), Type::List(y))
        | (Type::Lazy(x), Type::Lazy(y)) => subtype(x, y, expanded),
        (Type::Lambda(i1, o1), Type::Lambda(i2, o2)) => {
            subtype(i2, i1, expanded) && subtype(o1, o2, expanded)
        }
        (Type::Sum(xs), Type::Sum(ys)) | (Type::Product(xs), Type::Product(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(x, y)| subtype(x, y, expanded))
        }
        _ => false,
    }
}

/// The sum or product kind for `len` items, if `len` fits a kind word.
fn arity_kind(make: fn(u32) -> Result<Kind>, len: usize) -> Result<Kind> {
    let arity = u32::try_from(len)
        .map_err(|_| Error::Size(format!("arity {len} does not fit a kind word")))?;
    make(arity)
}

/// Content bits and tag bits of a sum over `variants`.
pub fn sum_layout(variants: &[Type]) -> Result<(u32, u32)> {
    let mut content = 0u32;
    for v in variants {
        content = content.max(v.size_of()?);
    }
    Ok((content, tag_bits(variants.len() as u32)))
}

/// Supplies fractal expansions to code that sits below the compiler.
pub trait Expand {
    /// The expansion of `fractal`, itself already resolved.
    fn expand(&mut self, fractal: &Fractal) -> Result<Type>;
}

/// An expander for contexts where every fractal is already resolved.
pub struct NoExpand;

impl Expand for NoExpand {
    fn expand(&mut self, fractal: &Fractal) -> Result<Type> {
        Err(Error::type_error(format!(
            "fractal {} has not been expanded",
            cid::to_text(&fractal.body)
        )))
    }
}

/// Fill in the expansion of every fractal that determines the size of `ty`.
/// Fractals behind references are left alone.
pub fn resolve(ty: &Type, ex: &mut dyn Expand) -> Result<()> {
    match ty {
        Type::Fractal(f) => {
            if f.expansion().is_none() {
                let expansion = ex.expand(f)?;
                f.set_expansion(expansion);
            }
            Ok(())
        }
        Type::Array(elem, _) | Type::Distinct(elem, _) => resolve(elem, ex),
        Type::Sum(ts) | Type::Product(ts) => ts.iter().try_for_each(|t| resolve(t, ex)),
        _ => Ok(()),
    }
}

/// `⌈log₂ n⌉` for `n ≥ 2`, else zero.
pub fn tag_bits(n: u32) -> u32 {
    if n < 2 { 0 } else { 32 - (n - 1).leading_zeros() }
}

/// Fingerprint of `Array[elem, len]` from the element's AnyType alone: the
/// salt of the array blob behind a list.
pub fn array_fingerprint(elem: &AnyType, len: u32) -> Digest {
    let mut buf = BitBuf::new(vec![0u8; bytes_for(Kind::ARRAY.data_bits())]);
    put_any_type(&mut buf, 0, elem);
    buf.put32(ANY_TYPE_BITS as usize, len);
    cid::compute(None, &buf.into_inner())
}

/// Fetch and decode a stored type through `loader`, verifying its digest.
pub fn load_type<G: Getter + ?Sized>(loader: &G, at: &AnyType) -> Result<Type> {
    let bytes = loader.read(&at.digest, Some(&cid::NO_SALT))?;
    let bits = at.kind.data_bits();
    if bytes.len() != bytes_for(bits) {
        return Err(Error::Size(format!(
            "stored type {} has {} bytes, kind {} needs {}",
            cid::to_text(&at.digest),
            bytes.len(),
            at.kind,
            bytes_for(bits)
        )));
    }
    Type::decode(at.kind, &BitBuf::new(&bytes[..]), loader)
}

pub(crate) fn put_any_type<B: AsRef<[u8]> + AsMut<[u8]>>(buf: &mut BitBuf<B>, at: usize, t: &AnyType) {
    buf.put_bytes(at, &t.digest);
    buf.put32(at + 256, t.kind.word());
}

pub(crate) fn get_any_type<B: AsRef<[u8]>>(buf: &BitBuf<B>, at: usize) -> Result<AnyType> {
    let mut digest = [0u8; 32];
    buf.get_bytes(at, &mut digest);
    Ok(AnyType {
        digest,
        kind: Kind::from_word(buf.get32(at + 256))?,
    })
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |f: &mut fmt::Formatter<'_>, name: &str, ts: &[Type]| -> fmt::Result {
            write!(f, "{name}[")?;
            for (i, t) in ts.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{t}")?;
            }
            f.write_str("]")
        };
        match self {
            Type::Kind(k) => write!(f, "Kind[{k}]"),
            Type::Bit => f.write_str("Bit"),
            Type::Array(elem, n) if **elem == Type::Bit => write!(f, "B{n}"),
            Type::Array(elem, n) => write!(f, "Array[{elem}, {n}]"),
            Type::Prog(bytes) => write!(f, "Prog[{bytes}]"),
            Type::Ref(t) => write!(f, "Ref[{t}]"),
            Type::Sum(ts) if ts.is_empty() => f.write_str("Bottom"),
            Type::Sum(ts) => list(f, "Sum", ts),
            Type::Product(ts) => list(f, "Product", ts),
            Type::List(t) => write!(f, "List[{t}]"),
            Type::Lazy(t) => write!(f, "Lazy[{t}]"),
            Type::Lambda(i, o) => write!(f, "Lambda[{i}, {o}]"),
            Type::Fractal(fr) => write!(f, "Fractal[{}]", cid::to_text(&fr.body)),
            Type::Port(p) => write!(
                f,
                "Port[{}, {}, {}, {}]",
                p.output, p.input, p.request, p.response
            ),
            Type::Distinct(base, mark) => write!(f, "Distinct[{base}, {mark}]"),
            Type::AnyProg => f.write_str("AnyProg"),
            Type::AnyType => f.write_str("AnyType"),
            Type::AnyValue => f.write_str("AnyValue"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn sizes_follow_the_table() -> Result<()> {
        assert_eq!(Type::Bit.size_of()?, 1);
        assert_eq!(Type::b32().size_of()?, 32);
        assert_eq!(Type::reference(Type::b64()).size_of()?, 256);
        assert_eq!(Type::list(Type::Bit).size_of()?, 288);
        assert_eq!(Type::AnyType.size_of()?, 288);
        assert_eq!(Type::AnyValue.size_of()?, 544);
        let sum = Type::sum(vec![Type::b8(), Type::b32(), Type::Bit]);
        assert_eq!(sum.size_of()?, 32 + 2);
        assert_eq!(Type::sum(vec![Type::b16()]).size_of()?, 16);
        let product = Type::product(vec![Type::b8(), Type::Bit, Type::b32()]);
        assert_eq!(product.size_of()?, 41);
        assert_eq!(product.field_offsets()?, vec![0, 8, 9, 41]);
        assert_eq!(Type::Kind(Kind::ARRAY).size_of()?, 320);
        assert!(Type::array(Type::b64(), u32::MAX).size_of().is_err());
        Ok(())
    }

    #[test]
    fn array_fingerprint_matches_the_type() {
        let elem = Type::product(vec![Type::b8(), Type::Bit]);
        assert_eq!(
            array_fingerprint(&elem.any_type(), 7),
            Type::array(elem, 7).fingerprint()
        );
    }

    #[test]
    fn tag_widths() {
        assert_eq!(tag_bits(0), 0);
        assert_eq!(tag_bits(1), 0);
        assert_eq!(tag_bits(2), 1);
        assert_eq!(tag_bits(3), 2);
        assert_eq!(tag_bits(4), 2);
        assert_eq!(tag_bits(5), 3);
    }

    #[test]
    fn salting_rule() -> Result<()> {
        assert!(!Type::Bit.needs_salt());
        assert!(!Type::AnyValue.needs_salt());
        assert!(!Type::unit().needs_salt());
        assert!(!Type::bottom().needs_salt());
        assert!(!Type::port(Type::unit(), Type::unit(), Type::unit(), Type::unit()).needs_salt());
        assert!(Type::b32().needs_salt());
        assert!(Type::product(vec![Type::Bit]).needs_salt());
        assert_eq!(Type::b32().salt()?, Some(Type::b32().fingerprint()));
        assert_eq!(Type::Bit.salt()?, None);
        Ok(())
    }

    #[test]
    fn post_then_load_types() -> Result<()> {
        let store = MemStore::new();
        let ty = Type::lambda(
            Type::product(vec![Type::b32(), Type::list(Type::b8())]),
            Type::sum(vec![Type::unit(), Type::reference(Type::Bit)]),
        );
        let at = ty.post(&store)?;
        assert_eq!(at.kind, Kind::LAMBDA);
        assert_eq!(load_type(&store, &at)?, ty);
        Ok(())
    }

    #[test]
    fn load_type_reports_missing_children() -> Result<()> {
        let store = MemStore::new();
        let ty = Type::reference(Type::b32());
        store.post(None, &ty.encode())?;
        let err = load_type(&store, &ty.any_type()).err();
        assert!(matches!(err, Some(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn kind_types_encode_their_word() -> Result<()> {
        let store = MemStore::new();
        let ty = Type::Kind(Kind::sum(4)?);
        assert_eq!(ty.kind(), Kind::KIND);
        assert_eq!(ty.encode(), Kind::sum(4)?.word().to_le_bytes().to_vec());
        let at = ty.post(&store)?;
        assert_eq!(load_type(&store, &at)?, ty);
        Ok(())
    }

    #[test]
    fn subtype_relation() {
        let bottom = Type::bottom();
        let b32 = Type::b32();
        assert!(bottom.is_subtype(&b32));
        assert!(b32.is_subtype(&b32));
        assert!(!b32.is_subtype(&bottom));
        assert!(Type::array(bottom.clone(), 3).is_subtype(&Type::array(b32.clone(), 3)));
        assert!(!Type::array(bottom.clone(), 3).is_subtype(&Type::array(b32.clone(), 4)));
        let narrow = Type::sum(vec![bottom.clone(), b32.clone()]);
        let wide = Type::sum(vec![Type::b8(), b32.clone()]);
        assert!(narrow.is_subtype(&wide));
        assert!(!wide.is_subtype(&narrow));
        let f = Type::lambda(Type::b8(), bottom.clone());
        let g = Type::lambda(bottom, Type::b8());
        assert!(f.is_subtype(&g));
        assert!(!g.is_subtype(&f));
    }

    #[test]
    fn fractals_compare_through_their_expansion() {
        let expansion = Type::sum(vec![Type::unit(), Type::b32()]);
        let fractal = Fractal::new([3u8; 32], 40);
        let unexpanded = Type::Fractal(Arc::new(Fractal::new([3u8; 32], 40)));
        fractal.set_expansion(expansion.clone());
        let fractal = Type::Fractal(Arc::new(fractal));
        assert_eq!(fractal, unexpanded);
        assert!(fractal.is_subtype(&expansion));
        assert!(expansion.is_subtype(&fractal));
        assert!(!unexpanded.is_subtype(&expansion));
        assert!(unexpanded.size_of().is_err());
        assert_eq!(fractal.size_of().ok(), Some(33));
        assert_eq!(fractal.salt().ok().flatten(), Some(expansion.fingerprint()));
    }

    #[test]
    fn fractals_with_one_expansion_are_equal() {
        let expansion = Type::sum(vec![Type::unit(), Type::b32()]);
        let left = Fractal::new([3u8; 32], 40);
        let right = Fractal::new([4u8; 32], 40);
        assert_ne!(left, right);
        left.set_expansion(expansion.clone());
        right.set_expansion(expansion);
        let (left, right) = (Type::Fractal(Arc::new(left)), Type::Fractal(Arc::new(right)));
        assert_eq!(left, right);
        assert!(left.is_subtype(&right));
        assert!(right.is_subtype(&left));
    }

    #[test]
    fn fractal_subtyping_unwraps_both_sides() {
        let narrow = Fractal::new([5u8; 32], 40);
        narrow.set_expansion(Type::sum(vec![Type::bottom(), Type::b32()]));
        let wide = Fractal::new([6u8; 32], 40);
        wide.set_expansion(Type::sum(vec![Type::b8(), Type::b32()]));
        let (narrow, wide) = (Type::Fractal(Arc::new(narrow)), Type::Fractal(Arc::new(wide)));
        assert_ne!(narrow, wide);
        assert!(narrow.is_subtype(&wide));
        assert!(!wide.is_subtype(&narrow));
    }

    #[test]
    fn arity_beyond_the_kind_word_is_an_error() -> Result<()> {
        let too_wide = Kind::MAX_ARITY as usize + 1;
        assert!(matches!(arity_kind(Kind::sum, too_wide), Err(Error::Size(_))));
        assert!(matches!(arity_kind(Kind::product, usize::MAX), Err(Error::Size(_))));
        assert_eq!(arity_kind(Kind::product, 2)?, Kind::product(2)?);
        assert_eq!(Type::product(vec![Type::Bit; 2]).checked_kind()?, Kind::product(2)?);
        assert_eq!(Type::b32().checked_kind()?, Kind::ARRAY);
        Ok(())
    }
}
