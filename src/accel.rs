//! Native implementations standing in for specific lambdas.
//!
//! Each accelerator is named by a canonical lambda whose body merely panics
//! with the accelerator's name. Applying a constant lambda with that exact
//! fingerprint runs the native function instead of the body.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::ast::{Builder, Op, Program};
use crate::cid::Digest;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::Type;
use crate::value::{AnyValue, Value};

/// Operates in place on a buffer of `max(in, out)` words holding the
/// argument on entry and the result on exit.
pub type AccelFn = fn(&mut [u32]) -> Result<()>;

pub struct Accelerator {
    pub name: String,
    pub input: Type,
    pub output: Type,
    pub program: Program,
    pub lambda: Value,
    fingerprint: Digest,
    run: AccelFn,
}

impl Accelerator {
    fn new(name: &str, input: Type, output: Type, run: AccelFn) -> Result<Self> {
        let program = canonical_body(name)?;
        let lambda = Value::Lambda(Arc::new(input.clone()), Arc::new(output.clone()), program.any_prog());
        let fingerprint = lambda.fingerprint()?;
        Ok(Self {
            name: name.to_string(),
            input,
            output,
            program,
            lambda,
            fingerprint,
            run,
        })
    }

    pub fn fingerprint(&self) -> Digest {
        self.fingerprint
    }

    pub fn call(&self, buf: &mut [u32]) -> Result<()> {
        (self.run)(buf)
    }

    /// Post the canonical lambda so programs can refer to it.
    pub fn post<S: Store + ?Sized>(&self, store: &S) -> Result<AnyValue> {
        self.program.post(store)?;
        self.lambda.to_any_value(store)
    }
}

/// `[B256(blake3(name)), AnyValueFrom, Panic]`
fn canonical_body(name: &str) -> Result<Program> {
    let mut b = Builder::new();
    let tag = b.push(Op::B256(*blake3::hash(name.as_bytes()).as_bytes()), &[]);
    let any = b.push(Op::AnyValueFrom, &[tag]);
    b.push(Op::Panic, &[any]);
    b.finish()
}

#[derive(Default)]
pub struct Accelerators {
    entries: Vec<Accelerator>,
    by_fingerprint: HashMap<Digest, usize>,
}

impl Accelerators {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in bit, integer and float operations.
    pub fn defaults() -> Result<Self> {
        let bit = Type::Bit;
        let bits2 = Type::product(vec![Type::Bit, Type::Bit]);
        let w32 = Type::b32();
        let w32x2 = Type::product(vec![Type::b32(), Type::b32()]);
        let w64 = Type::b64();
        let w64x2 = Type::product(vec![Type::b64(), Type::b64()]);

        let mut accels = Accelerators::new();
        accels.register("bit.not", bit.clone(), bit.clone(), |b| {
            b[0] = !b[0] & 1;
            Ok(())
        })?;
        accels.register("bit.and", bits2.clone(), bit.clone(), |b| {
            b[0] = b[0] & (b[0] >> 1) & 1;
            Ok(())
        })?;
        accels.register("bit.or", bits2.clone(), bit.clone(), |b| {
            b[0] = (b[0] | (b[0] >> 1)) & 1;
            Ok(())
        })?;
        accels.register("bit.xor", bits2, bit, |b| {
            b[0] = (b[0] ^ (b[0] >> 1)) & 1;
            Ok(())
        })?;

        accels.register("u32.add", w32x2.clone(), w32.clone(), |b| u32_op(b, |x, y| Ok(x.wrapping_add(y))))?;
        accels.register("u32.sub", w32x2.clone(), w32.clone(), |b| u32_op(b, |x, y| Ok(x.wrapping_sub(y))))?;
        accels.register("u32.mul", w32x2.clone(), w32.clone(), |b| u32_op(b, |x, y| Ok(x.wrapping_mul(y))))?;
        accels.register("u32.div", w32x2.clone(), w32.clone(), |b| {
            u32_op(b, |x, y| x.checked_div(y).ok_or_else(division_by_zero))
        })?;
        accels.register("u32.popcount", w32.clone(), w32.clone(), |b| {
            b[0] = b[0].count_ones();
            Ok(())
        })?;

        accels.register("u64.add", w64x2.clone(), w64.clone(), |b| u64_op(b, |x, y| Ok(x.wrapping_add(y))))?;
        accels.register("u64.sub", w64x2.clone(), w64.clone(), |b| u64_op(b, |x, y| Ok(x.wrapping_sub(y))))?;
        accels.register("u64.mul", w64x2.clone(), w64.clone(), |b| u64_op(b, |x, y| Ok(x.wrapping_mul(y))))?;
        accels.register("u64.div", w64x2, w64.clone(), |b| {
            u64_op(b, |x, y| x.checked_div(y).ok_or_else(division_by_zero))
        })?;
        accels.register("u64.popcount", w64, w32.clone(), |b| {
            b[0] = b[0].count_ones() + b[1].count_ones();
            Ok(())
        })?;

        accels.register("f32.neg", w32.clone(), w32.clone(), |b| {
            b[0] = (-f32::from_bits(b[0])).to_bits();
            Ok(())
        })?;
        accels.register("f32.recip", w32.clone(), w32.clone(), |b| {
            b[0] = f32::from_bits(b[0]).recip().to_bits();
            Ok(())
        })?;
        accels.register("f32.add", w32x2.clone(), w32.clone(), |b| f32_op(b, |x, y| x + y))?;
        accels.register("f32.sub", w32x2.clone(), w32.clone(), |b| f32_op(b, |x, y| x - y))?;
        accels.register("f32.mul", w32x2.clone(), w32.clone(), |b| f32_op(b, |x, y| x * y))?;
        accels.register("f32.div", w32x2, w32, |b| f32_op(b, |x, y| x / y))?;
        Ok(accels)
    }

    /// Add an accelerator, returning its id. Registering a name twice is an
    /// error.
    pub fn register(&mut self, name: &str, input: Type, output: Type, run: AccelFn) -> Result<usize> {
        let accel = Accelerator::new(name, input, output, run)?;
        if self.by_fingerprint.contains_key(&accel.fingerprint) {
            return Err(Error::Malformed(format!("accelerator {name} registered twice")));
        }
        let id = self.entries.len();
        debug!(name, id, "registered accelerator");
        self.by_fingerprint.insert(accel.fingerprint, id);
        self.entries.push(accel);
        Ok(id)
    }

    pub fn lookup(&self, fingerprint: &Digest) -> Option<usize> {
        self.by_fingerprint.get(fingerprint).copied()
    }

    pub fn get(&self, id: usize) -> Option<&Accelerator> {
        self.entries.get(id)
    }

    pub fn find(&self, name: &str) -> Option<&Accelerator> {
        self.entries.iter().find(|a| a.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Accelerator> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn division_by_zero() -> Error {
    Error::Arithmetic("division by zero".into())
}

fn u32_op(b: &mut [u32], f: fn(u32, u32) -> Result<u32>) -> Result<()> {
    b[0] = f(b[0], b[1])?;
    Ok(())
}

fn u64_op(b: &mut [u32], f: fn(u64, u64) -> Result<u64>) -> Result<()> {
    let x = u64::from(b[0]) | u64::from(b[1]) << 32;
    let y = u64::from(b[2]) | u64::from(b[3]) << 32;
    let r = f(x, y)?;
    b[0] = r as u32;
    b[1] = (r >> 32) as u32;
    Ok(())
}

fn f32_op(b: &mut [u32], f: fn(f32, f32) -> f32) -> Result<()> {
    b[0] = f(f32::from_bits(b[0]), f32::from_bits(b[1])).to_bits();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn defaults_have_distinct_fingerprints() -> Result<()> {
        let accels = Accelerators::defaults()?;
        assert_eq!(accels.len(), 20);
        for (id, accel) in accels.iter().enumerate() {
            assert_eq!(accels.lookup(&accel.fingerprint()), Some(id));
        }
        Ok(())
    }

    #[test]
    fn integer_ops_wrap_and_check_division() -> Result<()> {
        let accels = Accelerators::defaults()?;
        let mut buf = [u32::MAX, 2];
        accels.find("u32.add").map(|a| a.call(&mut buf)).transpose()?;
        assert_eq!(buf[0], 1);

        let mut buf = [7, 0, 0, 0];
        let err = accels.find("u64.div").map(|a| a.call(&mut buf));
        assert!(matches!(err, Some(Err(Error::Arithmetic(_)))));

        let mut buf = [0b10];
        accels.find("bit.xor").map(|a| a.call(&mut buf)).transpose()?;
        assert_eq!(buf[0], 1);
        Ok(())
    }

    #[test]
    fn canonical_lambdas_post() -> Result<()> {
        let store = MemStore::new();
        let accels = Accelerators::defaults()?;
        let not = accels.find("bit.not").ok_or_else(|| Error::Malformed("missing".into()))?;
        let av = not.post(&store)?;
        assert_eq!(av.digest, not.fingerprint());
        assert_eq!(av.ty, Type::lambda(Type::Bit, Type::Bit).any_type());
        Ok(())
    }
}
