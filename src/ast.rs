//! Programs: DAGs of operator nodes in topological order.
//!
//! Every operand is a backward offset to an earlier node, so a program
//! encodes without names and any suffix-closed slice is itself a program.
//! The root is the last node.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::cid::{self, Digest};
use crate::error::{Error, Result};
use crate::kind::Kind;
use crate::store::{Getter, Store};
use crate::value::{AnyProg, AnyType, AnyValue};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Zero,
    One,
    /// A bit array of `len <= 4` bits packed into the opcode.
    Bits { len: u8, bits: u8 },
    B8(u8),
    B16(u16),
    B32(u32),
    B64(u64),
    B128([u8; 16]),
    B256([u8; 32]),
    LiteralKind(Kind),
    LiteralAnyType(AnyType),
    LiteralAnyValue(AnyValue),
    SelfRef,
    Param(u32),
    Craft,
    Uncraft,
    TypeOf,
    SizeOf,
    Equal,
    Encode,
    Decode,
    Pass,
    Root,
    ArrayEmpty,
    ArrayUnit,
    ProductEmpty,
    ProductUnit,
    Concat,
    MakeSum,
    Which,
    Field,
    Slot,
    Section,
    Slice,
    Len,
    Mux,
    Let,
    Branch,
    Try,
    Panic,
    Lazy,
    Lambda,
    Fractal,
    Eval,
    Apply,
    Post,
    Load,
    Input,
    Output,
    Interact,
    AnyTypeFrom,
    AnyTypeTo,
    AnyValueFrom,
    AnyValueTo,
    AnyTypeElemType,
    AnyValueElemType,
    ListFrom,
    ListTo,
}

const SMALL_BITS: u8 = 0x80;

impl Op {
    /// Number of operands.
    pub fn arity(&self) -> usize {
        match self {
            Op::Zero
            | Op::One
            | Op::Bits { .. }
            | Op::B8(_)
            | Op::B16(_)
            | Op::B32(_)
            | Op::B64(_)
            | Op::B128(_)
            | Op::B256(_)
            | Op::LiteralKind(_)
            | Op::LiteralAnyType(_)
            | Op::LiteralAnyValue(_)
            | Op::SelfRef
            | Op::Param(_)
            | Op::ProductEmpty => 0,
            Op::Craft
            | Op::Equal
            | Op::Decode
            | Op::Concat
            | Op::Field
            | Op::Slot
            | Op::Mux
            | Op::Let
            | Op::Apply
            | Op::Output
            | Op::Interact
            | Op::AnyTypeTo
            | Op::AnyValueTo
            | Op::ListTo => 2,
            Op::MakeSum | Op::Section | Op::Slice | Op::Branch | Op::Lambda => 3,
            _ => 1,
        }
    }

    /// Parameters bound around operand `slot`: the body of a `Let` and the
    /// body of a `Lambda` each see one more.
    pub fn binds(&self, slot: usize) -> u32 {
        match (self, slot) {
            (Op::Let, 1) | (Op::Lambda, 2) => 1,
            _ => 0,
        }
    }

    fn opcode(&self) -> u8 {
        match self {
            Op::Bits { len, bits } => SMALL_BITS | (len << 4) | bits,
            Op::Zero => 0x00,
            Op::One => 0x01,
            Op::B8(_) => 0x02,
            Op::B16(_) => 0x03,
            Op::B32(_) => 0x04,
            Op::B64(_) => 0x05,
            Op::B128(_) => 0x06,
            Op::B256(_) => 0x07,
            Op::LiteralKind(_) => 0x08,
            Op::LiteralAnyType(_) => 0x09,
            Op::LiteralAnyValue(_) => 0x0a,
            Op::SelfRef => 0x0b,
            Op::Param(_) => 0x0c,
            Op::ProductEmpty => 0x0d,
            Op::Craft => 0x10,
            Op::Uncraft => 0x11,
            Op::TypeOf => 0x12,
            Op::SizeOf => 0x13,
            Op::Equal => 0x14,
            Op::Encode => 0x15,
            Op::Decode => 0x16,
            Op::Pass => 0x17,
            Op::Root => 0x18,
            Op::ArrayEmpty => 0x20,
            Op::ArrayUnit => 0x21,
            Op::ProductUnit => 0x22,
            Op::Concat => 0x23,
            Op::MakeSum => 0x24,
            Op::Which => 0x25,
            Op::Field => 0x26,
            Op::Slot => 0x27,
            Op::Section => 0x28,
            Op::Slice => 0x29,
            Op::Len => 0x2a,
            Op::Mux => 0x2b,
            Op::Let => 0x30,
            Op::Branch => 0x31,
            Op::Try => 0x32,
            Op::Panic => 0x33,
            Op::Lazy => 0x34,
            Op::Lambda => 0x35,
            Op::Fractal => 0x36,
            Op::Eval => 0x37,
            Op::Apply => 0x38,
            Op::Post => 0x40,
            Op::Load => 0x41,
            Op::Input => 0x48,
            Op::Output => 0x49,
            Op::Interact => 0x4a,
            Op::AnyTypeFrom => 0x50,
            Op::AnyTypeTo => 0x51,
            Op::AnyValueFrom => 0x52,
            Op::AnyValueTo => 0x53,
            Op::AnyTypeElemType => 0x54,
            Op::AnyValueElemType => 0x55,
            Op::ListFrom => 0x56,
            Op::ListTo => 0x57,
        }
    }

    /// Operators without payload, by opcode.
    fn plain(code: u8) -> Option<Op> {
        Some(match code {
            0x00 => Op::Zero,
            0x01 => Op::One,
            0x0b => Op::SelfRef,
            0x0d => Op::ProductEmpty,
            0x10 => Op::Craft,
            0x11 => Op::Uncraft,
            0x12 => Op::TypeOf,
            0x13 => Op::SizeOf,
            0x14 => Op::Equal,
            0x15 => Op::Encode,
            0x16 => Op::Decode,
            0x17 => Op::Pass,
            0x18 => Op::Root,
            0x20 => Op::ArrayEmpty,
            0x21 => Op::ArrayUnit,
            0x22 => Op::ProductUnit,
            0x23 => Op::Concat,
            0x24 => Op::MakeSum,
            0x25 => Op::Which,
            0x26 => Op::Field,
            0x27 => Op::Slot,
            0x28 => Op::Section,
            0x29 => Op::Slice,
            0x2a => Op::Len,
            0x2b => Op::Mux,
            0x30 => Op::Let,
            0x31 => Op::Branch,
            0x32 => Op::Try,
            0x33 => Op::Panic,
            0x34 => Op::Lazy,
            0x35 => Op::Lambda,
            0x36 => Op::Fractal,
            0x37 => Op::Eval,
            0x38 => Op::Apply,
            0x40 => Op::Post,
            0x41 => Op::Load,
            0x48 => Op::Input,
            0x49 => Op::Output,
            0x4a => Op::Interact,
            0x50 => Op::AnyTypeFrom,
            0x51 => Op::AnyTypeTo,
            0x52 => Op::AnyValueFrom,
            0x53 => Op::AnyValueTo,
            0x54 => Op::AnyTypeElemType,
            0x55 => Op::AnyValueElemType,
            0x56 => Op::ListFrom,
            0x57 => Op::ListTo,
            _ => return None,
        })
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Op::B8(v) => out.push(*v),
            Op::B16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Op::B32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Op::B64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Op::B128(v) => out.extend_from_slice(v),
            Op::B256(v) => out.extend_from_slice(v),
            Op::LiteralKind(k) => out.extend_from_slice(&k.word().to_le_bytes()),
            Op::LiteralAnyType(at) => out.extend_from_slice(&at.to_bytes()),
            Op::LiteralAnyValue(av) => out.extend_from_slice(&av.to_bytes()),
            Op::Param(k) => out.extend_from_slice(&k.to_le_bytes()),
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub op: Op,
    /// Backward offsets to the operand nodes, each at least one.
    pub inputs: SmallVec<[u32; 3]>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Program {
    nodes: Vec<Node>,
}

impl Program {
    pub fn new(nodes: Vec<Node>) -> Result<Program> {
        if nodes.is_empty() {
            return Err(Error::Malformed("empty program".into()));
        }
        for (i, node) in nodes.iter().enumerate() {
            validate_node(i, node)?;
        }
        Ok(Program { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn root(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Absolute index of operand `slot` of node `node`.
    pub fn operand(&self, node: usize, slot: usize) -> usize {
        node - self.nodes[node].inputs[slot] as usize
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for node in &self.nodes {
            out.push(node.op.opcode());
            node.op.encode_payload(&mut out);
            for offset in &node.inputs {
                out.extend_from_slice(&offset.to_le_bytes());
            }
        }
        out
    }

    pub fn byte_len(&self) -> u32 {
        self.encode().len() as u32
    }

    pub fn decode(bytes: &[u8]) -> Result<Program> {
        let mut r = Reader { bytes, at: 0 };
        let mut nodes = Vec::new();
        while !r.done() {
            let code = r.u8()?;
            let op = match code {
                c if c >= SMALL_BITS => {
                    let len = (c >> 4) & 0x7;
                    let bits = c & 0xf;
                    if len > 4 || u32::from(bits) >> len != 0 {
                        return Err(Error::Malformed(format!("bad bit literal opcode {c:#04x}")));
                    }
                    Op::Bits { len, bits }
                }
                0x02 => Op::B8(r.u8()?),
                0x03 => Op::B16(u16::from_le_bytes(r.array()?)),
                0x04 => Op::B32(r.u32()?),
                0x05 => Op::B64(u64::from_le_bytes(r.array()?)),
                0x06 => Op::B128(r.array()?),
                0x07 => Op::B256(r.array()?),
                0x08 => Op::LiteralKind(Kind::from_word(r.u32()?)?),
                0x09 => Op::LiteralAnyType(AnyType::from_bytes(&r.array::<36>()?)?),
                0x0a => Op::LiteralAnyValue(AnyValue::from_bytes(&r.array::<68>()?)?),
                0x0c => Op::Param(r.u32()?),
                c => Op::plain(c)
                    .ok_or_else(|| Error::Malformed(format!("unknown opcode {c:#04x}")))?,
            };
            let mut inputs = SmallVec::new();
            for _ in 0..op.arity() {
                inputs.push(r.u32()?);
            }
            nodes.push(Node { op, inputs });
        }
        Program::new(nodes)
    }

    /// Unsalted digest of the encoding; what an [`AnyProg`] refers to.
    pub fn fingerprint(&self) -> Digest {
        cid::compute(None, &self.encode())
    }

    pub fn any_prog(&self) -> AnyProg {
        let bytes = self.encode();
        AnyProg {
            digest: cid::compute(None, &bytes),
            bytes: bytes.len() as u32,
        }
    }

    /// Post the encoding after checking that every literal it names exists.
    pub fn post<S: Store + ?Sized>(&self, store: &S) -> Result<AnyProg> {
        let (types, values) = self.literal_refs();
        let keys = types
            .iter()
            .map(|at| at.digest)
            .chain(values.iter().flat_map(|av| [av.ty.digest, av.digest]));
        for key in keys {
            if !store.exists(&key)? {
                return Err(Error::NotFound(key));
            }
        }
        let bytes = self.encode();
        let digest = store.post(None, &bytes)?;
        Ok(AnyProg {
            digest,
            bytes: bytes.len() as u32,
        })
    }

    pub fn load<G: Getter + ?Sized>(loader: &G, prog: &AnyProg) -> Result<Program> {
        let bytes = loader.read(&prog.digest, Some(&cid::NO_SALT))?;
        if bytes.len() != prog.bytes as usize {
            return Err(Error::Size(format!(
                "program {} has {} bytes, expected {}",
                cid::to_text(&prog.digest),
                bytes.len(),
                prog.bytes
            )));
        }
        Program::decode(&bytes)
    }

    /// Store references held by literal nodes.
    pub fn literal_refs(&self) -> (Vec<AnyType>, Vec<AnyValue>) {
        let mut types = Vec::new();
        let mut values = Vec::new();
        for node in &self.nodes {
            match &node.op {
                Op::LiteralAnyType(at) => types.push(*at),
                Op::LiteralAnyValue(av) => values.push(*av),
                _ => {}
            }
        }
        (types, values)
    }

    /// The sub-program rooted at `root`, renumbered.
    pub fn extract(&self, root: usize) -> Result<Program> {
        self.close(root, u32::MAX, &mut |k| {
            Err(Error::FreeVariable(format!("parameter {k}")))
        })
    }

    /// The sub-program rooted at `root` with every parameter that escapes
    /// the `binders` innermost binders replaced by the fragment `subst`
    /// yields for it. `subst` receives the escaping index relative to the
    /// surrounding scope.
    pub fn close(
        &self,
        root: usize,
        binders: u32,
        subst: &mut dyn FnMut(u32) -> Result<Program>,
    ) -> Result<Program> {
        let mut closer = Closer {
            prog: self,
            binders,
            out: Builder::new(),
            memo: HashMap::new(),
            free: HashMap::new(),
            subst,
        };
        closer.visit(root, 0)?;
        closer.out.finish()
    }

    /// Whether the sub-program at `root` mentions `Self` outside any nested
    /// `Lambda` or `Fractal`, which rebind it.
    pub fn mentions_self(&self, root: usize) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            let node = &self.nodes[i];
            match node.op {
                Op::SelfRef => return true,
                Op::Fractal => continue,
                Op::Lambda => {
                    stack.push(self.operand(i, 0));
                    stack.push(self.operand(i, 1));
                }
                _ => stack.extend((0..node.inputs.len()).map(|s| self.operand(i, s))),
            }
        }
        false
    }
}

fn validate_node(i: usize, node: &Node) -> Result<()> {
    if node.inputs.len() != node.op.arity() {
        return Err(Error::Malformed(format!(
            "node {i}: {:?} takes {} operands, got {}",
            node.op,
            node.op.arity(),
            node.inputs.len()
        )));
    }
    for &offset in &node.inputs {
        if offset == 0 || offset as usize > i {
            return Err(Error::Malformed(format!(
                "node {i}: operand offset {offset} out of range"
            )));
        }
    }
    if let Op::Bits { len, bits } = node.op {
        if len > 4 || u32::from(bits) >> len != 0 {
            return Err(Error::Malformed(format!("node {i}: bad bit literal")));
        }
    }
    Ok(())
}

struct Closer<'a> {
    prog: &'a Program,
    binders: u32,
    out: Builder,
    memo: HashMap<(usize, u32), usize>,
    free: HashMap<u32, usize>,
    subst: &'a mut dyn FnMut(u32) -> Result<Program>,
}

impl Closer<'_> {
    fn visit(&mut self, i: usize, depth: u32) -> Result<usize> {
        if let Some(&j) = self.memo.get(&(i, depth)) {
            return Ok(j);
        }
        let prog = self.prog;
        let node = &prog.nodes[i];
        let j = match node.op {
            Op::Param(k) if k >= depth.saturating_add(self.binders) => {
                let outer = k - depth - self.binders;
                match self.free.get(&outer) {
                    Some(&j) => j,
                    None => {
                        let fragment = (self.subst)(outer)?;
                        let j = self.out.splice(&fragment);
                        self.free.insert(outer, j);
                        j
                    }
                }
            }
            _ => {
                let mut inputs: SmallVec<[usize; 3]> = SmallVec::new();
                for slot in 0..node.inputs.len() {
                    let child = prog.operand(i, slot);
                    inputs.push(self.visit(child, depth + node.op.binds(slot))?);
                }
                self.out.push(node.op.clone(), &inputs)
            }
        };
        self.memo.insert((i, depth), j);
        Ok(j)
    }
}

/// Appends nodes by absolute index, translating operands into offsets.
#[derive(Debug, Default)]
pub struct Builder {
    nodes: Vec<Node>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append `op` over the nodes at `inputs`, returning its index.
    pub fn push(&mut self, op: Op, inputs: &[usize]) -> usize {
        let at = self.nodes.len();
        let inputs = inputs
            .iter()
            .map(|&i| at.saturating_sub(i) as u32)
            .collect();
        self.nodes.push(Node { op, inputs });
        at
    }

    /// Append a whole program; its root becomes the returned index.
    pub fn splice(&mut self, fragment: &Program) -> usize {
        self.nodes.extend(fragment.nodes.iter().cloned());
        self.nodes.len() - 1
    }

    pub fn b32(&mut self, v: u32) -> usize {
        self.push(Op::B32(v), &[])
    }

    pub fn param(&mut self, k: u32) -> usize {
        self.push(Op::Param(k), &[])
    }

    pub fn unit(&mut self) -> usize {
        self.push(Op::ProductEmpty, &[])
    }

    /// `Product(a, b)`, built from unit products and concatenation.
    pub fn pair(&mut self, a: usize, b: usize) -> usize {
        let a = self.push(Op::ProductUnit, &[a]);
        let b = self.push(Op::ProductUnit, &[b]);
        self.push(Op::Concat, &[a, b])
    }

    /// Validate; the last node pushed is the root.
    pub fn finish(self) -> Result<Program> {
        Program::new(self.nodes)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn done(&self) -> bool {
        self.at >= self.bytes.len()
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.at + N;
        let chunk = self.bytes.get(self.at..end).ok_or_else(|| {
            Error::Malformed(format!("program truncated at byte {}", self.bytes.len()))
        })?;
        self.at = end;
        let mut out = [0u8; N];
        out.copy_from_slice(chunk);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::types::Type;
    use crate::value::Value;

    #[test]
    fn encoding_layout() -> Result<()> {
        let mut b = Builder::new();
        let x = b.b32(0x0102_0304);
        let y = b.push(Op::Bits { len: 2, bits: 0b11 }, &[]);
        b.push(Op::Equal, &[x, y]);
        let prog = b.finish()?;
        assert_eq!(
            prog.encode(),
            vec![0x04, 4, 3, 2, 1, 0xa3, 0x14, 2, 0, 0, 0, 1, 0, 0, 0]
        );
        assert_eq!(prog.byte_len(), 15);
        assert_eq!(Program::decode(&prog.encode())?, prog);
        assert_eq!(prog.operand(2, 0), 0);
        assert_eq!(prog.operand(2, 1), 1);
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Program::decode(&[]), Err(Error::Malformed(_))));
        assert!(matches!(Program::decode(&[0x7f]), Err(Error::Malformed(_))));
        // Equal with an operand pointing before the start.
        assert!(matches!(
            Program::decode(&[0x00, 0x14, 1, 0, 0, 0, 2, 0, 0, 0]),
            Err(Error::Malformed(_))
        ));
        // B32 literal cut short.
        assert!(matches!(Program::decode(&[0x04, 1, 2]), Err(Error::Malformed(_))));
        // one bit literal claiming bit pattern 0b10
        assert!(matches!(Program::decode(&[0x92]), Err(Error::Malformed(_))));
    }

    #[test]
    fn literals_survive_a_store_trip() -> Result<()> {
        let store = MemStore::new();
        let av = Value::B32(5).to_any_value(&store)?;
        let at = Type::b8().post(&store)?;
        let mut b = Builder::new();
        let v = b.push(Op::LiteralAnyValue(av), &[]);
        let t = b.push(Op::LiteralAnyType(at), &[]);
        b.push(Op::Equal, &[v, t]);
        let prog = b.finish()?;
        let handle = prog.post(&store)?;
        assert_eq!(handle, prog.any_prog());
        assert_eq!(Program::load(&store, &handle)?, prog);
        assert_eq!(prog.literal_refs(), (vec![at], vec![av]));
        Ok(())
    }

    #[test]
    fn post_requires_literal_targets() -> Result<()> {
        let store = MemStore::new();
        let mut b = Builder::new();
        b.push(Op::LiteralAnyType(Type::b16().any_type()), &[]);
        let prog = b.finish()?;
        assert!(matches!(prog.post(&store), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn extract_keeps_only_reachable_nodes() -> Result<()> {
        let mut b = Builder::new();
        let unused = b.b32(1);
        let x = b.b32(2);
        let y = b.b32(3);
        let eq = b.push(Op::Equal, &[x, y]);
        b.push(Op::Concat, &[eq, unused]);
        let prog = b.finish()?;
        let sub = prog.extract(eq)?;
        let mut expect = Builder::new();
        let x = expect.b32(2);
        let y = expect.b32(3);
        expect.push(Op::Equal, &[x, y]);
        assert_eq!(sub, expect.finish()?);
        Ok(())
    }

    #[test]
    fn close_substitutes_escaping_params() -> Result<()> {
        // Lambda body: Let(Param(0), Concat(Param(0), Param(2)))
        // Param(2) under the let escapes the lambda's own binder as outer 0.
        let mut b = Builder::new();
        let arg = b.param(0);
        let inner = b.param(0);
        let free = b.param(2);
        let cat = b.push(Op::Concat, &[inner, free]);
        let body = b.push(Op::Let, &[arg, cat]);
        let prog = b.finish()?;

        let mut asked = Vec::new();
        let closed = prog.close(body, 1, &mut |k| {
            asked.push(k);
            let mut f = Builder::new();
            f.b32(42);
            f.finish()
        })?;
        assert_eq!(asked, vec![0]);

        let mut expect = Builder::new();
        let arg = expect.param(0);
        let inner = expect.param(0);
        let lit = expect.b32(42);
        let cat = expect.push(Op::Concat, &[inner, lit]);
        expect.push(Op::Let, &[arg, cat]);
        assert_eq!(closed, expect.finish()?);
        Ok(())
    }

    #[test]
    fn close_reports_unbound_params() -> Result<()> {
        let mut b = Builder::new();
        b.param(0);
        let prog = b.finish()?;
        let err = prog.extract(0).and_then(|p| {
            p.close(0, 0, &mut |k| Err(Error::FreeVariable(format!("parameter {k}"))))
        });
        assert!(matches!(err, Err(Error::FreeVariable(_))));
        Ok(())
    }

    #[test]
    fn self_mentions_stop_at_rebinders() -> Result<()> {
        let mut b = Builder::new();
        let s = b.push(Op::SelfRef, &[]);
        let fractal = b.push(Op::Fractal, &[s]);
        let unit = b.unit();
        let lam = b.push(Op::Lambda, &[unit, unit, s]);
        let both = b.pair(fractal, lam);
        let prog = b.finish()?;
        assert!(!prog.mentions_self(both));
        assert!(prog.mentions_self(s));
        Ok(())
    }
}
