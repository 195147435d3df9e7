//! The word-stack instruction set the compiler targets.
//!
//! Instruction streams are private to a process: they carry resolved types
//! and registry indices and are never stored.

use std::sync::Arc;

use crate::ast::Program;
use crate::cid::Digest;
use crate::kind::Kind;
use crate::types::Type;
use crate::value::AnyType;

#[derive(Clone, Debug)]
pub enum Instr {
    Push(u32),
    /// Push a digest as eight words.
    PushRef(Digest),
    /// Push an AnyType as nine words.
    PushAnyType(AnyType),
    /// Copy `len` words starting `depth` words below the top.
    Pick { depth: u32, len: u32 },
    /// Remove `len` words starting `depth` words below the top.
    Cut { depth: u32, len: u32 },
    Discard(u32),
    /// Exchange the top `lo` words with the `hi` words beneath them.
    Swap { lo: u32, hi: u32 },
    Concat { left_bits: u32, right_bits: u32 },
    /// Replace a value of `in_bits` with its bits `beg..end`.
    Slice { in_bits: u32, beg: u32, end: u32 },
    /// Pad content of `input_bits` to `tag_offset` bits and append the tag.
    MakeSum {
        tag: u32,
        input_bits: u32,
        tag_offset: u32,
        tag_bits: u32,
    },
    /// Compare the top two values of `words` words each; push a bit.
    Equal(u32),
    /// Pop a bit; when set, skip `offset` instructions.
    Branch(u32),
    Jump(u32),
    /// Pop a lazy and call its body.
    Eval { out: Type },
    /// Pop a lambda (the argument stays as the callee's frame) and call it.
    Apply { sig: Type },
    Ret { in_words: u32, out_words: u32 },
    /// Push the lambda currently executing.
    SelfValue,
    Accel {
        in_words: u32,
        out_words: u32,
        id: usize,
    },
    /// Pop a value of type `ty`, post it, push its reference.
    Post { ty: Type },
    /// Pop a reference, push the `bits`-bit value it names.
    Load { bits: u32, salt: Option<Digest> },
    /// Build a lambda or lazy at run time from the enclosing frames.
    Closure(Arc<ClosureSite>),
    PortInput { words: u32 },
    PortOutput { words: u32 },
    PortInteract { req_words: u32, resp_words: u32 },
    /// Pop a type value of `kind`, post it, push its AnyType.
    AnyTypeFrom { kind: Kind },
    /// Pop an AnyType of `kind`, push the type value it names.
    AnyTypeTo { kind: Kind },
    /// Pop a value of `ty`, post it, push an AnyValue.
    AnyValueFrom { ty: Type, at: AnyType },
    /// Pop an AnyValue whose type must be `at`, push the value.
    AnyValueTo {
        at: AnyType,
        bits: u32,
        salt: Option<Digest>,
    },
    /// Pop a B32 index and an array of `len` elements.
    ArrayGet { elem_bits: u32, len: u32 },
    /// Pop a B32 index and a list, push the element.
    ListGet { elem: AnyType, elem_bits: u32 },
    /// Pop an array, post it, push a list.
    ListFrom { ty: Type },
    /// Pop a list which must hold `len` elements, push the array.
    ListTo {
        elem: AnyType,
        elem_bits: u32,
        len: u32,
    },
    /// Pop B32 `end`, B32 `beg` and a list, post and push the sub-list.
    ListSlice { elem: AnyType, elem_bits: u32 },
    /// Pop a B32 index into a constant table.
    Mux {
        table: Arc<[u32]>,
        elem_bits: u32,
        len: u32,
    },
    /// Pop a type value of `kind`, push the size of its values.
    SizeOf { kind: Kind },
    /// Pop an AnyValue and fault with it.
    Panic,
    /// Open a handler `offset` instructions ahead.
    TryBegin(u32),
    TryEnd,
}

impl Instr {
    /// True for instructions that only reshape the stack: they cannot fail
    /// on well-typed input and touch neither the store nor a port.
    pub fn is_inert(&self) -> bool {
        matches!(
            self,
            Instr::Push(_)
                | Instr::PushRef(_)
                | Instr::PushAnyType(_)
                | Instr::Pick { .. }
                | Instr::Cut { .. }
                | Instr::Discard(_)
                | Instr::Swap { .. }
                | Instr::Concat { .. }
                | Instr::Slice { .. }
                | Instr::MakeSum { .. }
                | Instr::Equal(_)
                | Instr::Branch(_)
                | Instr::Jump(_)
                | Instr::SelfValue
                | Instr::TryBegin(_)
                | Instr::TryEnd
        )
    }
}

/// What a run-time [`Instr::Closure`] needs: the enclosing program, the body
/// node, the construct and the shape of the frames in scope.
#[derive(Debug)]
pub struct ClosureSite {
    pub program: Arc<Program>,
    pub body: usize,
    pub construct: Construct,
    /// Innermost first: type, words and depth below the top at this point.
    pub frames: Vec<FrameShape>,
}

#[derive(Clone, Debug)]
pub enum Construct {
    Lazy { out: Type },
    Lambda { input: Type, output: Type },
}

#[derive(Clone, Debug)]
pub struct FrameShape {
    pub ty: Type,
    pub words: u32,
    pub depth: u32,
}
