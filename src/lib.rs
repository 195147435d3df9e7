//! Mycelium core: content-addressed values, programs and the stack VM that
//! evaluates them.

pub mod accel;
pub mod ast;
pub mod bitbuf;
pub mod bundle;
pub mod cid;
pub mod compiler;
pub mod error;
pub mod instr;
pub mod kind;
pub mod options;
pub mod port;
pub mod store;
pub mod types;
pub mod value;
pub mod vm;

pub use accel::{Accelerator, Accelerators};
pub use ast::{Builder, Node, Op, Program};
pub use bundle::Bundle;
pub use cid::Digest;
pub use compiler::{Compiled, Compiler, Context};
pub use error::{Error, Result};
pub use kind::Kind;
pub use options::Options;
pub use port::{PortBackend, Ports};
pub use store::{
    CowStore, Getter, MemStore, SqliteStore, Span, Store, UnionGetter, derive_db_path,
};
pub use types::{Expand, NoExpand, Type};
pub use value::{AnyProg, AnyType, AnyValue, Value};
pub use vm::{Env, State, Vm};
