//! Structured error kinds shared by the store, compiler and evaluator.

use crate::cid::{self, Digest};
use crate::value::AnyValue;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("blob {} not found", cid::to_text(.0))]
    NotFound(Digest),
    #[error("blob {} hashed to {}", cid::to_text(.key), cid::to_text(.actual))]
    BadData { key: Digest, actual: Digest },
    #[error("size error: {0}")]
    Size(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("free variable: {0}")]
    FreeVariable(String),
    #[error("arithmetic error: {0}")]
    Arithmetic(String),
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: u64, len: u64 },
    #[error("program panicked with value {0}")]
    Panic(AnyValue),
    #[error("evaluation exceeded its budget of {0} steps")]
    StepLimit(u64),
    #[error("malformed data: {0}")]
    Malformed(String),
    #[error("port {}: {reason}", cid::to_text(.port))]
    Port { port: Digest, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("at node {node}: {source}")]
    AtNode {
        node: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Strip node locations, yielding the underlying error kind.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::AtNode { source, .. } = err {
            err = source;
        }
        err
    }

    /// Attach a program node index unless one is already present.
    pub fn at_node(self, node: usize) -> Error {
        match self {
            Error::AtNode { .. } => self,
            other => Error::AtNode {
                node,
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn type_error(msg: impl Into<String>) -> Error {
        Error::Type(msg.into())
    }
}
