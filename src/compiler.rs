//! Type-directed compilation of program DAGs into word-stack code.
//!
//! Compilation walks from the root, compiling operands before operators and
//! tracking how many words sit above each bound parameter so that `Param`
//! becomes a `Pick` at a fixed depth. Pure operators over constant operands
//! are folded by running their code on a private VM under a step budget.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::ast::{Builder, Op, Program};
use crate::bitbuf::{self, BitBuf, words_for};
use crate::cid::{self, Digest};
use crate::error::{Error, Result};
use crate::instr::{ClosureSite, Construct, FrameShape, Instr};
use crate::kind::{ANY_TYPE_BITS, ANY_VALUE_BITS, Kind, KindTag};
use crate::store::Store;
use crate::types::{Expand, Fractal, Type, resolve, sum_layout};
use crate::value::{AnyProg, AnyType, AnyValue, Value};
use crate::vm::{Env, State, Vm};

/// Words of a lambda, lazy or program handle on the stack.
pub const HANDLE_WORDS: u32 = 9;
/// Largest constant pushed inline; bigger ones are posted and loaded.
const INLINE_WORDS: usize = 8;

/// The result of compiling one node: its type, the code computing it and,
/// when it does not depend on anything at run time, its words.
#[derive(Clone, Debug)]
pub struct Compiled {
    pub ty: Type,
    pub code: Vec<Instr>,
    pub value: Option<Arc<[u32]>>,
}

impl Compiled {
    fn constant(ty: Type, words: impl Into<Arc<[u32]>>) -> Self {
        Self {
            ty,
            code: Vec::new(),
            value: Some(words.into()),
        }
    }

    fn retyped(self, ty: Type) -> Self {
        Self { ty, ..self }
    }
}

/// What `Self` denotes in the code being compiled.
#[derive(Clone, Debug, Default)]
pub enum SelfDesc {
    #[default]
    None,
    /// The executing lambda, of this signature.
    Lambda(Type),
    /// The fractal type whose body is being expanded.
    Fractal(Type),
}

#[derive(Clone, Debug)]
struct Frame {
    ty: Type,
    words: u32,
    /// Scratch words between this frame and the next one out.
    below: u32,
    value: Option<Arc<[u32]>>,
}

/// The parameters in scope (innermost last) and the meaning of `Self`.
#[derive(Clone, Debug, Default)]
pub struct Context {
    frames: Vec<Frame>,
    self_desc: SelfDesc,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_self(self_desc: SelfDesc) -> Self {
        Self {
            frames: Vec::new(),
            self_desc,
        }
    }

    /// Add a parameter of `ty` sitting `below` scratch words above the
    /// current innermost one.
    pub fn bind(&self, ty: Type, words: u32, below: u32, value: Option<Arc<[u32]>>) -> Context {
        let mut next = self.clone();
        next.frames.push(Frame {
            ty,
            words,
            below,
            value,
        });
        next
    }

    /// The frame for De Bruijn index `k` and its depth below the top.
    fn lookup(&self, k: u32, scratch: u32) -> Option<(u32, &Frame)> {
        let k = k as usize;
        if k >= self.frames.len() {
            return None;
        }
        let mut depth = scratch;
        for frame in self.frames.iter().rev().take(k) {
            depth += frame.words + frame.below;
        }
        let frame = &self.frames[self.frames.len() - 1 - k];
        Some((depth + frame.words, frame))
    }

    fn shapes(&self, scratch: u32) -> Vec<FrameShape> {
        (0..self.frames.len() as u32)
            .filter_map(|k| {
                self.lookup(k, scratch).map(|(depth, f)| FrameShape {
                    ty: f.ty.clone(),
                    words: f.words,
                    depth,
                })
            })
            .collect()
    }
}

pub struct Compiler {
    env: Env,
    fuel: u64,
    fractals: HashMap<Digest, Type>,
    expanding: HashSet<Digest>,
    offsets: HashMap<Type, Arc<[u32]>>,
}

impl Compiler {
    pub fn new(env: Env) -> Self {
        let fuel = env.options.compile_step_budget;
        Self {
            env,
            fuel,
            fractals: HashMap::new(),
            expanding: HashSet::new(),
            offsets: HashMap::new(),
        }
    }

    /// Compile a whole program with nothing in scope.
    pub fn compile(&mut self, program: &Program) -> Result<Compiled> {
        self.compile_in(program, program.root(), &Context::new())
    }

    /// Compile node `node` of `program` under `ctx`.
    #[instrument(skip_all, fields(nodes = program.nodes().len(), node))]
    pub fn compile_in(&mut self, program: &Program, node: usize, ctx: &Context) -> Result<Compiled> {
        self.fuel = self.env.options.compile_step_budget;
        self.node(program, node, ctx, 0)
    }

    /// Code for the body of a lambda of signature `sig`, ending in `Ret`.
    pub fn lambda_body(&mut self, program: &Program, sig: &Type) -> Result<Arc<[Instr]>> {
        let Type::Lambda(input, output) = sig else {
            return Err(Error::type_error(format!("{sig} is not a lambda type")));
        };
        let in_words = self.words(input)?;
        let ctx = Context::with_self(SelfDesc::Lambda(sig.clone())).bind(
            (**input).clone(),
            in_words,
            0,
            None,
        );
        let body = self.compile_in(program, program.root(), &ctx)?;
        self.coerce(&body.ty, output)?;
        let out_words = self.words(output)?;
        let mut code = self.emit(&body)?;
        code.push(Instr::Ret {
            in_words,
            out_words,
        });
        Ok(code.into())
    }

    /// Code for the body of a lazy producing `out`, ending in `Ret`.
    pub fn lazy_body(&mut self, program: &Program, out: &Type) -> Result<Arc<[Instr]>> {
        let body = self.compile_in(program, program.root(), &Context::new())?;
        self.coerce(&body.ty, out)?;
        let out_words = self.words(out)?;
        let mut code = self.emit(&body)?;
        code.push(Instr::Ret {
            in_words: 0,
            out_words,
        });
        Ok(code.into())
    }

    /// Close the body at `body` over concrete frame values, check it, post
    /// it and return the words of the resulting lambda or lazy.
    pub fn close_construct(
        &mut self,
        program: &Program,
        body: usize,
        construct: &Construct,
        frames: &[(Type, Arc<[u32]>)],
    ) -> Result<Arc<[u32]>> {
        let binders = match construct {
            Construct::Lazy { .. } => 0,
            Construct::Lambda { .. } => 1,
        };
        let closed = program.close(body, binders, &mut |k| {
            let (ty, words) = frames.get(k as usize).ok_or_else(|| {
                Error::FreeVariable(format!("parameter {k} is not bound"))
            })?;
            self.literal_fragment(ty, words)
        })?;
        let (_, words) = self.finish_construct(&closed, construct)?;
        Ok(words)
    }

    /// The size in bits of `ty`, expanding fractals as needed.
    pub fn size(&mut self, ty: &Type) -> Result<u32> {
        resolve(ty, self)?;
        ty.size_of()
    }

    fn words(&mut self, ty: &Type) -> Result<u32> {
        Ok(words_for(self.size(ty)?) as u32)
    }

    /// `actual` may stand where `expected` is required: a subtype with the
    /// same representation, or bottom.
    fn coerce(&mut self, actual: &Type, expected: &Type) -> Result<()> {
        resolve(actual, self)?;
        resolve(expected, self)?;
        if actual.is_bottom() {
            return Ok(());
        }
        if !actual.is_subtype(expected) {
            return Err(Error::type_error(format!("{actual} is not a subtype of {expected}")));
        }
        if actual.size_of()? != expected.size_of()? {
            return Err(Error::type_error(format!(
                "{actual} and {expected} have different representations"
            )));
        }
        Ok(())
    }

    fn node(&mut self, p: &Program, i: usize, ctx: &Context, scratch: u32) -> Result<Compiled> {
        self.node_inner(p, i, ctx, scratch)
            .map_err(|err| err.at_node(i))
    }

    fn node_inner(&mut self, p: &Program, i: usize, ctx: &Context, scratch: u32) -> Result<Compiled> {
        let store = self.env.store.clone();
        let op = &p.nodes()[i].op;
        trace!(node = i, ?op, scratch, "compile");
        Ok(match op {
            Op::Zero => Compiled::constant(Type::Bit, [0]),
            Op::One => Compiled::constant(Type::Bit, [1]),
            Op::Bits { len, bits } => {
                let words: Vec<u32> = if *len == 0 { Vec::new() } else { vec![u32::from(*bits)] };
                Compiled::constant(Type::bits(u32::from(*len)), words)
            }
            Op::B8(v) => Compiled::constant(Type::b8(), [u32::from(*v)]),
            Op::B16(v) => Compiled::constant(Type::b16(), [u32::from(*v)]),
            Op::B32(v) => Compiled::constant(Type::b32(), [*v]),
            Op::B64(v) => Compiled::constant(Type::b64(), [*v as u32, (*v >> 32) as u32]),
            Op::B128(bytes) => Compiled::constant(Type::bits(128), bitbuf::to_words(bytes, 128)),
            Op::B256(bytes) => Compiled::constant(Type::bits(256), bitbuf::to_words(bytes, 256)),
            Op::LiteralKind(k) => Compiled::constant(Type::Kind(Kind::KIND), [k.word()]),
            Op::LiteralAnyType(at) => {
                Compiled::constant(Type::AnyType, bitbuf::to_words(&at.to_bytes(), ANY_TYPE_BITS))
            }
            Op::LiteralAnyValue(av) => Compiled::constant(
                Type::AnyValue,
                bitbuf::to_words(&av.to_bytes(), ANY_VALUE_BITS),
            ),
            Op::ProductEmpty => Compiled::constant(Type::unit(), []),
            Op::SelfRef => match &ctx.self_desc {
                SelfDesc::Lambda(sig) => Compiled {
                    ty: sig.clone(),
                    code: vec![Instr::SelfValue],
                    value: None,
                },
                SelfDesc::Fractal(ft) => {
                    Compiled::constant(Type::Kind(Kind::FRACTAL), type_words(ft))
                }
                SelfDesc::None => {
                    return Err(Error::FreeVariable(
                        "Self outside a lambda or fractal".into(),
                    ));
                }
            },
            Op::Param(k) => {
                let (depth, frame) = ctx.lookup(*k, scratch).ok_or_else(|| {
                    Error::FreeVariable(format!(
                        "parameter {k} with {} in scope",
                        ctx.frames.len()
                    ))
                })?;
                match &frame.value {
                    Some(words) => Compiled::constant(frame.ty.clone(), words.clone()),
                    None => Compiled {
                        ty: frame.ty.clone(),
                        code: vec![Instr::Pick {
                            depth,
                            len: frame.words,
                        }],
                        value: None,
                    },
                }
            }

            Op::Craft => {
                let kind = self.const_kind(p, i, 0, ctx, scratch)?;
                let args = self.node(p, p.operand(i, 1), ctx, scratch)?;
                let bits = self.size(&args.ty)?;
                if bits != kind.data_bits() {
                    return Err(Error::type_error(format!(
                        "crafting a {kind} needs {} bits, {} has {bits}",
                        kind.data_bits(),
                        args.ty
                    )));
                }
                if let Some(words) = &args.value {
                    // Constant types must name stored children.
                    decode_type(&*store, kind, words)?;
                }
                args.retyped(Type::Kind(kind))
            }
            Op::Uncraft => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let Type::Kind(kind) = &x.ty else {
                    return Err(Error::type_error(format!("cannot uncraft a value of {}", x.ty)));
                };
                let ty = uncrafted(*kind);
                x.retyped(ty)
            }
            Op::TypeOf => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let kind = x.ty.checked_kind()?;
                // Type values name their children by digest.
                x.ty.post(&*store)?;
                let ty = Compiled::constant(Type::Kind(kind), type_words(&x.ty));
                if x.value.is_some() || x.code.iter().all(Instr::is_inert) {
                    ty
                } else {
                    let mut code = x.code;
                    code.push(Instr::Discard(self.words(&x.ty)?));
                    code.extend(self.emit(&ty)?);
                    Compiled {
                        ty: ty.ty,
                        code,
                        value: None,
                    }
                }
            }
            Op::SizeOf => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                match &x.ty {
                    Type::Kind(kind) => match &x.value {
                        Some(_) => {
                            let ty = self.const_type(&x)?;
                            Compiled::constant(Type::b32(), [self.size(&ty)?])
                        }
                        None => {
                            let kind = *kind;
                            self.finish(Type::b32(), vec![x], vec![Instr::SizeOf { kind }], true)?
                        }
                    },
                    ty => Compiled::constant(Type::b32(), [self.size(ty)?]),
                }
            }
            Op::Equal => {
                let args = self.operands(p, i, &[0, 1], ctx, scratch)?;
                let (a, b) = (self.size(&args[0].ty)?, self.size(&args[1].ty)?);
                if a != b {
                    return Err(Error::type_error(format!(
                        "cannot compare {} with {}",
                        args[0].ty, args[1].ty
                    )));
                }
                self.finish(Type::Bit, args, vec![Instr::Equal(words_for(a) as u32)], true)?
            }
            Op::Encode => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let bits = self.size(&x.ty)?;
                x.retyped(Type::bits(bits))
            }
            Op::Decode => {
                let ty = self.const_type_operand(p, i, 1, ctx, scratch)?;
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                if self.size(&x.ty)? != self.size(&ty)? {
                    return Err(Error::type_error(format!("cannot decode {} as {ty}", x.ty)));
                }
                x.retyped(ty)
            }
            Op::Pass => self.node(p, p.operand(i, 0), ctx, scratch)?,
            Op::Root => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let words = x.value.clone().ok_or_else(|| {
                    Error::type_error("Root needs a value known at compile time")
                })?;
                let value = Value::from_words(&x.ty, &words, &*store)?;
                let av = value.to_any_value(&*store)?;
                Compiled::constant(Type::AnyValue, bitbuf::to_words(&av.to_bytes(), ANY_VALUE_BITS))
            }

            Op::ArrayEmpty => {
                let elem = self.const_type_operand(p, i, 0, ctx, scratch)?;
                Compiled::constant(Type::array(elem, 0), [])
            }
            Op::ArrayUnit => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let ty = Type::array(x.ty.clone(), 1);
                x.retyped(ty)
            }
            Op::ProductUnit => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let ty = Type::product(vec![x.ty.clone()]);
                x.retyped(ty)
            }
            Op::Concat => {
                let args = self.operands(p, i, &[0, 1], ctx, scratch)?;
                let ty = concat_type(&args[0].ty, &args[1].ty)?;
                let left_bits = self.size(&args[0].ty)?;
                let right_bits = self.size(&args[1].ty)?;
                let op = vec![Instr::Concat {
                    left_bits,
                    right_bits,
                }];
                self.finish(ty, args, op, true)?
            }
            Op::MakeSum => {
                let ty = self.const_type_operand(p, i, 0, ctx, scratch)?;
                let tag = self.const_u32(p, i, 1, ctx, scratch)?;
                let Type::Sum(variants) = ty.expanded()?.clone() else {
                    return Err(Error::type_error(format!("{ty} is not a sum")));
                };
                let variant = variants.get(tag as usize).ok_or_else(|| {
                    Error::type_error(format!("tag {tag} out of range for {ty}"))
                })?;
                let content = self.node(p, p.operand(i, 2), ctx, scratch)?;
                self.coerce(&content.ty, variant)?;
                let (tag_offset, tag_bits) = sum_layout(&variants)?;
                let op = vec![Instr::MakeSum {
                    tag,
                    input_bits: self.size(&content.ty)?,
                    tag_offset,
                    tag_bits,
                }];
                self.finish(ty, vec![content], op, true)?
            }
            Op::Which => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let Type::Sum(variants) = self.expanded_type(&x.ty)? else {
                    return Err(Error::type_error(format!("Which needs a sum, got {}", x.ty)));
                };
                let (content, tag_bits) = sum_layout(&variants)?;
                let mut op = vec![Instr::Slice {
                    in_bits: content + tag_bits,
                    beg: content,
                    end: content + tag_bits,
                }];
                if tag_bits == 0 {
                    op.push(Instr::Push(0));
                }
                self.finish(Type::b32(), vec![x], op, true)?
            }
            Op::Field => {
                let index = self.const_u32(p, i, 1, ctx, scratch)?;
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let in_bits = self.size(&x.ty)?;
                let (ty, beg, end) = match self.expanded_type(&x.ty)? {
                    Type::Product(fields) => {
                        let field = fields.get(index as usize).ok_or_else(|| {
                            Error::type_error(format!("no field {index} in {}", x.ty))
                        })?;
                        let offsets = self.field_offsets(&x.ty)?;
                        (field.clone(), offsets[index as usize], offsets[index as usize + 1])
                    }
                    Type::Sum(variants) => {
                        let variant = variants.get(index as usize).ok_or_else(|| {
                            Error::type_error(format!("no variant {index} in {}", x.ty))
                        })?;
                        (variant.clone(), 0, self.size(variant)?)
                    }
                    other => {
                        return Err(Error::type_error(format!("{other} has no fields")));
                    }
                };
                self.finish(ty, vec![x], vec![Instr::Slice { in_bits, beg, end }], true)?
            }
            Op::Slot => {
                let args = self.operands(p, i, &[0, 1], ctx, scratch)?;
                self.expect_b32(&args[1].ty, "index")?;
                let (ty, op) = match self.expanded_type(&args[0].ty)? {
                    Type::Array(elem, len) => {
                        let elem_bits = self.size(&elem)?;
                        ((*elem).clone(), Instr::ArrayGet { elem_bits, len })
                    }
                    Type::List(elem) => {
                        let elem_bits = self.size(&elem)?;
                        let op = Instr::ListGet {
                            elem: elem.any_type(),
                            elem_bits,
                        };
                        ((*elem).clone(), op)
                    }
                    other => return Err(Error::type_error(format!("cannot index {other}"))),
                };
                self.finish(ty, args, vec![op], true)?
            }
            Op::Section => {
                let beg = self.const_u32(p, i, 1, ctx, scratch)?;
                let end = self.const_u32(p, i, 2, ctx, scratch)?;
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let Type::Array(elem, len) = self.expanded_type(&x.ty)? else {
                    return Err(Error::type_error(format!("cannot section {}", x.ty)));
                };
                if beg > end || end > len {
                    return Err(Error::OutOfBounds {
                        index: u64::from(end.max(beg)),
                        len: u64::from(len),
                    });
                }
                let w = self.size(&elem)?;
                let op = vec![Instr::Slice {
                    in_bits: w * len,
                    beg: w * beg,
                    end: w * end,
                }];
                self.finish(Type::Array(elem, end - beg), vec![x], op, true)?
            }
            Op::Slice => {
                let args = self.operands(p, i, &[0, 1, 2], ctx, scratch)?;
                self.expect_b32(&args[1].ty, "slice start")?;
                self.expect_b32(&args[2].ty, "slice end")?;
                let Type::List(elem) = self.expanded_type(&args[0].ty)? else {
                    return Err(Error::type_error(format!("cannot slice {}", args[0].ty)));
                };
                let elem_bits = self.size(&elem)?;
                let op = vec![Instr::ListSlice {
                    elem: elem.any_type(),
                    elem_bits,
                }];
                self.finish(Type::List(elem), args, op, false)?
            }
            Op::Len => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                match self.expanded_type(&x.ty)? {
                    Type::Array(_, len) => Compiled::constant(Type::b32(), [len]),
                    Type::List(_) => {
                        let op = vec![Instr::Slice {
                            in_bits: HANDLE_WORDS * 32,
                            beg: 256,
                            end: 288,
                        }];
                        self.finish(Type::b32(), vec![x], op, true)?
                    }
                    other => return Err(Error::type_error(format!("{other} has no length"))),
                }
            }
            Op::Mux => {
                let table = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let words = table.value.clone().ok_or_else(|| {
                    Error::type_error("Mux needs a table known at compile time")
                })?;
                let Type::Array(elem, len) = self.expanded_type(&table.ty)? else {
                    return Err(Error::type_error(format!("Mux table must be an array, got {}", table.ty)));
                };
                let index = self.node(p, p.operand(i, 1), ctx, scratch)?;
                self.expect_b32(&index.ty, "index")?;
                let op = vec![Instr::Mux {
                    table: words,
                    elem_bits: self.size(&elem)?,
                    len,
                }];
                self.finish((*elem).clone(), vec![index], op, true)?
            }

            Op::Let => {
                let bind = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let bind_words = self.words(&bind.ty)?;
                let inner = ctx.bind(bind.ty.clone(), bind_words, scratch, bind.value.clone());
                let body = self.node(p, p.operand(i, 1), &inner, 0)?;
                if bind.value.is_some() && body.value.is_some() {
                    body
                } else {
                    let body_words = self.words(&body.ty)?;
                    let mut code = self.emit(&bind)?;
                    code.extend(self.emit(&body)?);
                    if bind_words > 0 {
                        code.push(Instr::Cut {
                            depth: body_words + bind_words,
                            len: bind_words,
                        });
                    }
                    Compiled {
                        ty: body.ty,
                        code,
                        value: None,
                    }
                }
            }
            Op::Branch => {
                let cond = self.node(p, p.operand(i, 0), ctx, scratch)?;
                if cond.ty != Type::Bit {
                    return Err(Error::type_error(format!("branch condition is {}, not Bit", cond.ty)));
                }
                let zero = self.node(p, p.operand(i, 1), ctx, scratch)?;
                let one = self.node(p, p.operand(i, 2), ctx, scratch)?;
                let ty = join(&zero.ty, &one.ty)?;
                match &cond.value {
                    Some(words) => {
                        let arm = if words.first().is_some_and(|w| w & 1 == 1) { one } else { zero };
                        arm.retyped(ty)
                    }
                    None => {
                        let zero_code = self.emit(&zero)?;
                        let one_code = self.emit(&one)?;
                        let mut code = self.emit(&cond)?;
                        code.push(Instr::Branch(zero_code.len() as u32 + 1));
                        code.extend(zero_code);
                        code.push(Instr::Jump(one_code.len() as u32));
                        code.extend(one_code);
                        Compiled {
                            ty,
                            code,
                            value: None,
                        }
                    }
                }
            }
            Op::Try => {
                let body = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let variants = vec![body.ty.clone(), Type::AnyValue];
                let (tag_offset, tag_bits) = sum_layout(&variants)?;
                let ty = Type::sum(variants);
                let input_bits = self.size(&body.ty)?;
                let body_code = self.emit(&body)?;
                let mut code = vec![Instr::TryBegin(body_code.len() as u32 + 3)];
                code.extend(body_code);
                code.push(Instr::TryEnd);
                code.push(Instr::MakeSum {
                    tag: 0,
                    input_bits,
                    tag_offset,
                    tag_bits,
                });
                code.push(Instr::Jump(1));
                code.push(Instr::MakeSum {
                    tag: 1,
                    input_bits: ANY_VALUE_BITS,
                    tag_offset,
                    tag_bits,
                });
                Compiled {
                    ty,
                    code,
                    value: None,
                }
            }
            Op::Panic => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                if x.ty != Type::AnyValue {
                    return Err(Error::type_error(format!("Panic takes an AnyValue, got {}", x.ty)));
                }
                self.finish(Type::bottom(), vec![x], vec![Instr::Panic], false)?
            }
            Op::Lazy => {
                let body = p.operand(i, 0);
                if p.mentions_self(body) {
                    return Err(Error::FreeVariable("Self inside a lazy body".into()));
                }
                self.construct(p, body, Construct::Lazy { out: Type::bottom() }, ctx, scratch)?
            }
            Op::Lambda => {
                let input = self.const_type_operand(p, i, 0, ctx, scratch)?;
                let output = self.const_type_operand(p, i, 1, ctx, scratch)?;
                let construct = Construct::Lambda { input, output };
                self.construct(p, p.operand(i, 2), construct, ctx, scratch)?
            }
            Op::Fractal => {
                let body = p.operand(i, 0);
                let closed = p.close(body, 0, &mut |k| {
                    let (_, frame) = ctx.lookup(k, scratch).ok_or_else(|| {
                        Error::FreeVariable(format!("parameter {k} is not bound"))
                    })?;
                    let words = frame.value.clone().ok_or_else(|| {
                        Error::type_error("fractal body depends on a value only known at run time")
                    })?;
                    self.literal_fragment(&frame.ty, &words)
                })?;
                let handle = closed.post(&*store)?;
                let fractal = Type::Fractal(Arc::new(Fractal::new(handle.digest, handle.bytes)));
                resolve(&fractal, self)?;
                Compiled::constant(Type::Kind(Kind::FRACTAL), type_words(&fractal))
            }
            Op::Eval => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let Type::Lazy(out) = self.expanded_type(&x.ty)? else {
                    return Err(Error::type_error(format!("cannot evaluate {}", x.ty)));
                };
                resolve(&out, self)?;
                let op = vec![Instr::Eval {
                    out: (*out).clone(),
                }];
                self.finish((*out).clone(), vec![x], op, true)?
            }
            Op::Apply => {
                let args = self.operands(p, i, &[0, 1], ctx, scratch)?;
                let sig = self.expanded_type(&args[0].ty)?;
                let Type::Lambda(input, output) = &sig else {
                    return Err(Error::type_error(format!("cannot apply {}", args[0].ty)));
                };
                self.coerce(&args[1].ty, input)?;
                resolve(output, self)?;
                let in_words = self.words(&args[1].ty)?;
                let out_words = self.words(output)?;
                let swap = Instr::Swap {
                    lo: in_words,
                    hi: HANDLE_WORDS,
                };
                let accel = match &args[0].value {
                    Some(words) => self.accelerator(&sig, words)?,
                    None => None,
                };
                let op = match accel {
                    Some(id) => {
                        debug!(node = i, id, "applying accelerator");
                        vec![
                            swap,
                            Instr::Discard(HANDLE_WORDS),
                            Instr::Accel {
                                in_words,
                                out_words,
                                id,
                            },
                        ]
                    }
                    None => vec![swap, Instr::Apply { sig: sig.clone() }],
                };
                self.finish((**output).clone(), args, op, true)?
            }

            Op::Post => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let ty = x.ty.clone();
                self.size(&ty)?;
                let op = vec![Instr::Post { ty: ty.clone() }];
                self.finish(Type::reference(ty), vec![x], op, false)?
            }
            Op::Load => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let Type::Ref(elem) = self.expanded_type(&x.ty)? else {
                    return Err(Error::type_error(format!("cannot load through {}", x.ty)));
                };
                let bits = self.size(&elem)?;
                let op = vec![Instr::Load {
                    bits,
                    salt: elem.salt()?,
                }];
                self.finish((*elem).clone(), vec![x], op, true)?
            }
            Op::Input => {
                let port = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let pt = port_type(&port.ty)?;
                let words = self.words(&pt.input)?;
                self.finish(pt.input.clone(), vec![port], vec![Instr::PortInput { words }], false)?
            }
            Op::Output => {
                let args = self.operands(p, i, &[0, 1], ctx, scratch)?;
                let pt = port_type(&args[0].ty)?;
                self.coerce(&args[1].ty, &pt.output)?;
                let words = self.words(&args[1].ty)?;
                self.finish(Type::unit(), args, vec![Instr::PortOutput { words }], false)?
            }
            Op::Interact => {
                let args = self.operands(p, i, &[0, 1], ctx, scratch)?;
                let pt = port_type(&args[0].ty)?;
                self.coerce(&args[1].ty, &pt.request)?;
                let op = vec![Instr::PortInteract {
                    req_words: self.words(&args[1].ty)?,
                    resp_words: self.words(&pt.response)?,
                }];
                self.finish(pt.response.clone(), args, op, false)?
            }

            Op::AnyTypeFrom => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let Type::Kind(kind) = x.ty else {
                    return Err(Error::type_error(format!("{} is not a type", x.ty)));
                };
                self.finish(Type::AnyType, vec![x], vec![Instr::AnyTypeFrom { kind }], true)?
            }
            Op::AnyTypeTo => {
                let kind = self.const_kind(p, i, 1, ctx, scratch)?;
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                if x.ty != Type::AnyType {
                    return Err(Error::type_error(format!("expected an AnyType, got {}", x.ty)));
                }
                self.finish(Type::Kind(kind), vec![x], vec![Instr::AnyTypeTo { kind }], true)?
            }
            Op::AnyValueFrom => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let ty = x.ty.clone();
                let at = ty.post(&*store)?;
                self.finish(Type::AnyValue, vec![x], vec![Instr::AnyValueFrom { ty, at }], true)?
            }
            Op::AnyValueTo => {
                let ty = self.const_type_operand(p, i, 1, ctx, scratch)?;
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                if x.ty != Type::AnyValue {
                    return Err(Error::type_error(format!("expected an AnyValue, got {}", x.ty)));
                }
                let op = vec![Instr::AnyValueTo {
                    at: ty.any_type(),
                    bits: self.size(&ty)?,
                    salt: ty.salt()?,
                }];
                self.finish(ty, vec![x], op, true)?
            }
            Op::AnyTypeElemType => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                if x.ty != Type::AnyType {
                    return Err(Error::type_error(format!("expected an AnyType, got {}", x.ty)));
                }
                let op = vec![Instr::Slice {
                    in_bits: ANY_TYPE_BITS,
                    beg: 256,
                    end: ANY_TYPE_BITS,
                }];
                self.finish(Type::Kind(Kind::KIND), vec![x], op, true)?
            }
            Op::AnyValueElemType => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                if x.ty != Type::AnyValue {
                    return Err(Error::type_error(format!("expected an AnyValue, got {}", x.ty)));
                }
                let op = vec![Instr::Slice {
                    in_bits: ANY_VALUE_BITS,
                    beg: 256,
                    end: ANY_VALUE_BITS,
                }];
                self.finish(Type::AnyType, vec![x], op, true)?
            }
            Op::ListFrom => {
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let ty = self.expanded_type(&x.ty)?;
                let Type::Array(elem, _) = &ty else {
                    return Err(Error::type_error(format!("cannot make a list from {}", x.ty)));
                };
                let list = Type::List(elem.clone());
                self.finish(list, vec![x], vec![Instr::ListFrom { ty }], false)?
            }
            Op::ListTo => {
                let len = self.const_u32(p, i, 1, ctx, scratch)?;
                let x = self.node(p, p.operand(i, 0), ctx, scratch)?;
                let Type::List(elem) = self.expanded_type(&x.ty)? else {
                    return Err(Error::type_error(format!("expected a list, got {}", x.ty)));
                };
                let op = vec![Instr::ListTo {
                    elem: elem.any_type(),
                    elem_bits: self.size(&elem)?,
                    len,
                }];
                self.finish(Type::Array(elem, len), vec![x], op, true)?
            }
        })
    }

    /// Compile the run-time operands at `slots`, each above the previous.
    fn operands(
        &mut self,
        p: &Program,
        i: usize,
        slots: &[usize],
        ctx: &Context,
        scratch: u32,
    ) -> Result<Vec<Compiled>> {
        let mut out = Vec::with_capacity(slots.len());
        let mut above = scratch;
        for &slot in slots {
            let c = self.node(p, p.operand(i, slot), ctx, above)?;
            above += self.words(&c.ty)?;
            out.push(c);
        }
        Ok(out)
    }

    fn constant_operand(
        &mut self,
        p: &Program,
        i: usize,
        slot: usize,
        ctx: &Context,
        scratch: u32,
    ) -> Result<Compiled> {
        let c = self.node(p, p.operand(i, slot), ctx, scratch)?;
        if c.value.is_none() {
            return Err(Error::type_error(format!(
                "operand {slot} of {:?} must be known at compile time",
                p.nodes()[i].op
            )));
        }
        Ok(c)
    }

    fn const_type_operand(
        &mut self,
        p: &Program,
        i: usize,
        slot: usize,
        ctx: &Context,
        scratch: u32,
    ) -> Result<Type> {
        let c = self.constant_operand(p, i, slot, ctx, scratch)?;
        self.const_type(&c)
    }

    fn const_kind(&mut self, p: &Program, i: usize, slot: usize, ctx: &Context, scratch: u32) -> Result<Kind> {
        let c = self.constant_operand(p, i, slot, ctx, scratch)?;
        if c.ty != Type::Kind(Kind::KIND) {
            return Err(Error::type_error(format!("expected a kind, got {}", c.ty)));
        }
        let word = c.value.as_ref().and_then(|w| w.first().copied()).unwrap_or(0);
        Kind::from_word(word)
    }

    fn const_u32(&mut self, p: &Program, i: usize, slot: usize, ctx: &Context, scratch: u32) -> Result<u32> {
        let c = self.constant_operand(p, i, slot, ctx, scratch)?;
        self.expect_b32(&c.ty, "constant")?;
        Ok(c.value.as_ref().and_then(|w| w.first().copied()).unwrap_or(0))
    }

    fn expect_b32(&self, ty: &Type, what: &str) -> Result<()> {
        if ty.bit_width() != Some(32) {
            return Err(Error::type_error(format!("{what} must be B32, got {ty}")));
        }
        Ok(())
    }

    /// The type denoted by a constant type value.
    fn const_type(&mut self, c: &Compiled) -> Result<Type> {
        let Type::Kind(kind) = c.ty else {
            return Err(Error::type_error(format!("expected a type, got a value of {}", c.ty)));
        };
        let words = c
            .value
            .as_ref()
            .ok_or_else(|| Error::type_error("type must be known at compile time"))?;
        let store = self.env.store.clone();
        let ty = decode_type(&*store, kind, words)?;
        resolve(&ty, self)?;
        Ok(ty)
    }

    /// `ty` with a top-level fractal replaced by its expansion.
    fn expanded_type(&mut self, ty: &Type) -> Result<Type> {
        resolve(ty, self)?;
        Ok(ty.expanded()?.clone())
    }

    fn field_offsets(&mut self, ty: &Type) -> Result<Arc<[u32]>> {
        if let Some(offsets) = self.offsets.get(ty) {
            return Ok(offsets.clone());
        }
        let offsets: Arc<[u32]> = ty.field_offsets()?.into();
        self.offsets.insert(ty.clone(), offsets.clone());
        Ok(offsets)
    }

    fn accelerator(&mut self, sig: &Type, words: &[u32]) -> Result<Option<usize>> {
        let bits = self.size(sig)?;
        let salt = sig.salt()?;
        let fingerprint = cid::compute(salt.as_ref(), &bitbuf::from_words(words, bits));
        Ok(self.env.accels.lookup(&fingerprint))
    }

    /// Build a lambda or lazy. When every parameter the body mentions is
    /// known the construct becomes a constant; otherwise it is built at run
    /// time by [`Instr::Closure`].
    fn construct(
        &mut self,
        p: &Program,
        body: usize,
        construct: Construct,
        ctx: &Context,
        scratch: u32,
    ) -> Result<Compiled> {
        let binders = match &construct {
            Construct::Lazy { .. } => 0,
            Construct::Lambda { .. } => 1,
        };
        let mut deferred = false;
        let closed = p.close(body, binders, &mut |k| {
            let (_, frame) = ctx.lookup(k, scratch).ok_or_else(|| {
                Error::FreeVariable(format!("parameter {k} is not bound"))
            })?;
            match &frame.value {
                Some(words) => self.literal_fragment(&frame.ty, words),
                None => {
                    deferred = true;
                    let mut b = Builder::new();
                    b.unit();
                    b.finish()
                }
            }
        })?;
        if !deferred {
            let (ty, words) = self.finish_construct(&closed, &construct)?;
            return Ok(Compiled::constant(ty, words));
        }

        // Type the body against the frames as they stand.
        let (ty, construct) = match construct {
            Construct::Lazy { .. } => {
                let inner = Context {
                    frames: ctx.frames.clone(),
                    self_desc: SelfDesc::None,
                };
                let c = self.node(p, body, &inner, 0)?;
                (Type::lazy(c.ty.clone()), Construct::Lazy { out: c.ty })
            }
            Construct::Lambda { input, output } => {
                let sig = Type::lambda(input.clone(), output.clone());
                let in_words = self.words(&input)?;
                let inner = Context {
                    frames: ctx.frames.clone(),
                    self_desc: SelfDesc::Lambda(sig.clone()),
                }
                .bind(input.clone(), in_words, 0, None);
                let c = self.node(p, body, &inner, 0)?;
                self.coerce(&c.ty, &output)?;
                (sig, Construct::Lambda { input, output })
            }
        };
        let site = ClosureSite {
            program: Arc::new(p.clone()),
            body,
            construct,
            frames: ctx.shapes(scratch),
        };
        Ok(Compiled {
            ty,
            code: vec![Instr::Closure(Arc::new(site))],
            value: None,
        })
    }

    /// Check a closed body, post it and produce the construct's words.
    fn finish_construct(&mut self, closed: &Program, construct: &Construct) -> Result<(Type, Arc<[u32]>)> {
        let value = match construct {
            Construct::Lazy { .. } => {
                let c = self.node(closed, closed.root(), &Context::new(), 0)?;
                let handle = closed.post(&*self.env.store)?;
                Value::Lazy(Arc::new(c.ty), handle)
            }
            Construct::Lambda { input, output } => {
                let sig = Type::lambda(input.clone(), output.clone());
                let in_words = self.words(input)?;
                let ctx = Context::with_self(SelfDesc::Lambda(sig)).bind(input.clone(), in_words, 0, None);
                let c = self.node(closed, closed.root(), &ctx, 0)?;
                self.coerce(&c.ty, output)?;
                let handle = closed.post(&*self.env.store)?;
                Value::Lambda(Arc::new(input.clone()), Arc::new(output.clone()), handle)
            }
        };
        Ok((value.ty(), value.to_words()?.into()))
    }

    /// A program fragment that rebuilds the value `words` of type `ty`.
    fn literal_fragment(&mut self, ty: &Type, words: &[u32]) -> Result<Program> {
        let word = |k: usize| words.get(k).copied().unwrap_or(0);
        let mut b = Builder::new();
        let op = match (ty, ty.bit_width()) {
            (Type::Bit, _) => Some(if word(0) & 1 == 1 { Op::One } else { Op::Zero }),
            (_, Some(n)) if n <= 4 => Some(Op::Bits {
                len: n as u8,
                bits: word(0) as u8,
            }),
            (_, Some(8)) => Some(Op::B8(word(0) as u8)),
            (_, Some(16)) => Some(Op::B16(word(0) as u16)),
            (_, Some(32)) => Some(Op::B32(word(0))),
            (_, Some(64)) => Some(Op::B64(u64::from(word(0)) | u64::from(word(1)) << 32)),
            (_, Some(128)) => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&bitbuf::from_words(words, 128));
                Some(Op::B128(bytes))
            }
            (_, Some(256)) => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&bitbuf::from_words(words, 256));
                Some(Op::B256(bytes))
            }
            (Type::Product(fields), _) if fields.is_empty() => Some(Op::ProductEmpty),
            (Type::AnyType, _) => Some(Op::LiteralAnyType(AnyType::from_bytes(
                &bitbuf::from_words(words, ANY_TYPE_BITS),
            )?)),
            (Type::AnyValue, _) => Some(Op::LiteralAnyValue(AnyValue::from_bytes(
                &bitbuf::from_words(words, ANY_VALUE_BITS),
            )?)),
            _ => None,
        };
        match op {
            Some(op) => {
                b.push(op, &[]);
            }
            None => {
                let store = self.env.store.clone();
                let av = Value::from_words(ty, words, &*store)?.to_any_value(&*store)?;
                let v = b.push(Op::LiteralAnyValue(av), &[]);
                let t = b.push(Op::LiteralAnyType(av.ty), &[]);
                let k = b.push(Op::LiteralKind(av.ty.kind), &[]);
                let tv = b.push(Op::AnyTypeTo, &[t, k]);
                b.push(Op::AnyValueTo, &[v, tv]);
            }
        }
        b.finish()
    }

    /// Finish an operator: fold it when pure over constant operands,
    /// otherwise emit operand code followed by `op`.
    fn finish(&mut self, ty: Type, args: Vec<Compiled>, op: Vec<Instr>, pure: bool) -> Result<Compiled> {
        if pure && args.iter().all(|a| a.value.is_some()) {
            let mut stack = Vec::new();
            for a in &args {
                stack.extend_from_slice(a.value.as_deref().unwrap_or(&[]));
            }
            match self.fold(stack, &op, &ty) {
                Ok(words) => return Ok(Compiled::constant(ty, words)),
                // Missing or corrupt blobs are reported where first seen.
                Err(err)
                    if matches!(
                        err.root(),
                        Error::StepLimit(_) | Error::NotFound(_) | Error::BadData { .. }
                    ) =>
                {
                    return Err(err);
                }
                Err(err) => debug!(error = %err, "leaving constant expression to run time"),
            }
        }
        let mut code = Vec::new();
        for a in &args {
            code.extend(self.emit(a)?);
        }
        code.extend(op);
        Ok(Compiled {
            ty,
            code,
            value: None,
        })
    }

    /// Run `op` over `stack` on a private VM.
    fn fold(&mut self, stack: Vec<u32>, op: &[Instr], ty: &Type) -> Result<Vec<u32>> {
        let budget = self.env.options.compile_step_budget;
        if self.fuel == 0 {
            return Err(Error::StepLimit(budget));
        }
        let mut env = self.env.clone();
        env.options.compile_step_budget = self.fuel;
        let mut vm = Vm::with_code(env, op.to_vec().into(), stack);
        let used = vm.run(self.fuel);
        self.fuel = self.fuel.saturating_sub(used);
        match vm.state() {
            State::Halted => {
                let words = vm.into_stack();
                let expected = self.words(ty)? as usize;
                if words.len() != expected {
                    return Err(Error::Size(format!(
                        "folding produced {} words for {ty}, expected {expected}",
                        words.len()
                    )));
                }
                trace!(words = words.len(), steps = used, "folded");
                Ok(words)
            }
            State::Faulted => Err(vm
                .take_error()
                .unwrap_or_else(|| Error::Malformed("folding faulted without an error".into()))),
            State::Running => {
                debug!(budget, "compile-time evaluation ran out of steps");
                Err(Error::StepLimit(budget))
            }
        }
    }

    /// The code that leaves `c` on the stack.
    pub fn emit(&mut self, c: &Compiled) -> Result<Vec<Instr>> {
        let Some(words) = &c.value else {
            return Ok(c.code.clone());
        };
        if words.len() <= INLINE_WORDS {
            return Ok(words.iter().map(|&w| Instr::Push(w)).collect());
        }
        let bits = self.size(&c.ty)?;
        let salt = c.ty.salt()?;
        let digest = self
            .env
            .store
            .post(salt.as_ref(), &bitbuf::from_words(words, bits))?;
        Ok(vec![Instr::PushRef(digest), Instr::Load { bits, salt }])
    }
}

impl Expand for Compiler {
    fn expand(&mut self, fractal: &Fractal) -> Result<Type> {
        let me = Type::Fractal(Arc::new(Fractal::new(fractal.body, fractal.bytes)));
        let key = me.fingerprint();
        if let Some(ty) = self.fractals.get(&key) {
            return Ok(ty.clone());
        }
        if !self.expanding.insert(key) {
            return Err(Error::type_error(format!(
                "fractal {} refers to itself outside a reference",
                cid::to_text(&fractal.body)
            )));
        }
        let result = self.expand_body(fractal, me);
        self.expanding.remove(&key);
        let ty = result?;
        debug!(fractal = %cid::to_text(&fractal.body), expansion = %ty, "expanded fractal");
        self.fractals.insert(key, ty.clone());
        Ok(ty)
    }
}

impl Compiler {
    fn expand_body(&mut self, fractal: &Fractal, me: Type) -> Result<Type> {
        let store = self.env.store.clone();
        let program = Program::load(
            &*store,
            &AnyProg {
                digest: fractal.body,
                bytes: fractal.bytes,
            },
        )?;
        let c = self.node(&program, program.root(), &Context::with_self(SelfDesc::Fractal(me)), 0)?;
        let ty = self.const_type(&c)?;
        if matches!(ty, Type::Fractal(_)) {
            return Err(Error::type_error("a fractal cannot expand to a fractal"));
        }
        Ok(ty)
    }
}

/// Words of the type value encoding `ty`.
pub fn type_words(ty: &Type) -> Vec<u32> {
    bitbuf::to_words(&ty.encode(), ty.kind().data_bits())
}

pub(crate) fn decode_type(store: &dyn Store, kind: Kind, words: &[u32]) -> Result<Type> {
    let bits = kind.data_bits();
    let bytes = bitbuf::from_words(words, bits);
    Type::decode(kind, &BitBuf::with_len(&bytes[..], bits as usize), store)
}

/// The unmade form of a type value of `kind`.
fn uncrafted(kind: Kind) -> Type {
    match kind.tag() {
        KindTag::Kind | KindTag::Prog => Type::b32(),
        KindTag::Bit | KindTag::AnyProg | KindTag::AnyType | KindTag::AnyValue => Type::unit(),
        KindTag::Array => Type::product(vec![Type::AnyType, Type::b32()]),
        KindTag::Ref | KindTag::List | KindTag::Lazy => Type::AnyType,
        KindTag::Sum | KindTag::Product => Type::array(Type::AnyType, kind.arity()),
        KindTag::Lambda => Type::product(vec![Type::AnyType, Type::AnyType]),
        KindTag::Fractal => Type::AnyProg,
        KindTag::Port => Type::product(vec![Type::AnyType; 4]),
        KindTag::Distinct => Type::product(vec![Type::AnyType, Type::AnyValue]),
    }
}

fn concat_type(a: &Type, b: &Type) -> Result<Type> {
    match (a, b) {
        (Type::Array(x, n), Type::Array(y, m)) if x == y || *n == 0 || *m == 0 => {
            let elem = if *n == 0 { y.clone() } else { x.clone() };
            let len = n
                .checked_add(*m)
                .ok_or_else(|| Error::Size("array length overflows 32 bits".into()))?;
            Ok(Type::Array(elem, len))
        }
        (Type::Product(xs), Type::Product(ys)) => {
            Ok(Type::product(xs.iter().chain(ys.iter()).cloned().collect()))
        }
        _ => Err(Error::type_error(format!("cannot concatenate {a} and {b}"))),
    }
}

/// The type of a branch whose arms have types `a` and `b`.
fn join(a: &Type, b: &Type) -> Result<Type> {
    if a.is_bottom() {
        Ok(b.clone())
    } else if b.is_bottom() || a == b {
        Ok(a.clone())
    } else {
        Err(Error::type_error(format!("branch arms differ: {a} and {b}")))
    }
}

fn port_type(ty: &Type) -> Result<&crate::types::PortType> {
    match ty {
        Type::Port(pt) => Ok(pt),
        other => Err(Error::type_error(format!("{other} is not a port"))),
    }
}
