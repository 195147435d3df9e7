//! The word-stack virtual machine.
//!
//! A [`Vm`] owns its stack, call frames and caches; the store and the
//! accelerator table are shared through [`Env`]. Execution is driven by
//! [`Vm::run`], which executes at most the given number of instructions and
//! reports how many it did, leaving scheduling to the caller.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::accel::Accelerators;
use crate::ast::Program;
use crate::bitbuf::{self, BitBuf, bytes_for, words_for};
use crate::cid::{self, Digest};
use crate::compiler::{Compiler, HANDLE_WORDS, decode_type};
use crate::error::{Error, Result};
use crate::instr::Instr;
use crate::kind::{ANY_TYPE_BITS, ANY_VALUE_BITS};
use crate::options::Options;
use crate::port::Ports;
use crate::store::Store;
use crate::types::{Type, array_fingerprint};
use crate::value::{AnyProg, AnyType, AnyValue, Value};

/// What a VM shares with the rest of the process.
#[derive(Clone)]
pub struct Env {
    pub store: Arc<dyn Store>,
    pub accels: Arc<Accelerators>,
    pub options: Options,
}

impl Env {
    /// An environment with the default accelerators and options.
    pub fn new(store: Arc<dyn Store>) -> Result<Env> {
        Ok(Env {
            store,
            accels: Arc::new(Accelerators::defaults()?),
            options: Options::default(),
        })
    }

    pub fn with_options(self, options: Options) -> Env {
        Env { options, ..self }
    }

    pub fn with_accelerators(self, accels: Arc<Accelerators>) -> Env {
        Env { accels, ..self }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Running,
    Halted,
    Faulted,
}

/// A lambda as seen by its own body through `Self`.
#[derive(Clone, Debug)]
pub struct DynValue {
    pub ty: Type,
    pub words: Arc<[u32]>,
}

struct Call {
    code: Arc<[Instr]>,
    pc: usize,
    from: Option<DynValue>,
}

struct TryFrame {
    code: Arc<[Instr]>,
    handler: usize,
    stack_len: usize,
    calls_len: usize,
    from: Option<DynValue>,
}

type FuncKey = (Digest, Digest);

/// Compiled bodies keyed by (signature fingerprint, body digest), evicting
/// the least recently used.
struct FuncCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<FuncKey, (Arc<[Instr]>, u64)>,
    /// Last use tick -> key, oldest first.
    order: BTreeMap<u64, FuncKey>,
}

impl FuncCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn get(&mut self, key: &FuncKey) -> Option<Arc<[Instr]>> {
        let (code, used) = self.entries.get_mut(key)?;
        self.tick += 1;
        self.order.remove(used);
        *used = self.tick;
        self.order.insert(self.tick, *key);
        Some(code.clone())
    }

    fn insert(&mut self, key: FuncKey, code: Arc<[Instr]>) {
        if self.capacity == 0 {
            return;
        }
        if let Some((_, used)) = self.entries.get(&key) {
            self.order.remove(used);
        } else if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.order.pop_first() {
                self.entries.remove(&oldest);
            }
        }
        self.tick += 1;
        self.order.insert(self.tick, key);
        self.entries.insert(key, (code, self.tick));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct Vm {
    env: Env,
    code: Arc<[Instr]>,
    pc: usize,
    stack: Vec<u32>,
    calls: Vec<Call>,
    current: Option<DynValue>,
    tries: Vec<TryFrame>,
    err: Option<Error>,
    panic_value: Option<AnyValue>,
    ports: Ports,
    funcs: FuncCache,
    compiler: Compiler,
    steps: u64,
}

impl Vm {
    pub fn new(env: Env) -> Vm {
        Vm::with_code(env, Arc::from(Vec::new()), Vec::new())
    }

    pub(crate) fn with_code(env: Env, code: Arc<[Instr]>, stack: Vec<u32>) -> Vm {
        Vm {
            funcs: FuncCache::new(env.options.func_cache_capacity),
            compiler: Compiler::new(env.clone()),
            env,
            code,
            pc: 0,
            stack,
            calls: Vec::new(),
            current: None,
            tries: Vec::new(),
            err: None,
            panic_value: None,
            ports: Ports::new(),
            steps: 0,
        }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    /// Compile `program` and make it the code to run, returning the type of
    /// what it leaves on the stack.
    pub fn load(&mut self, program: &Program) -> Result<Type> {
        let compiled = self.compiler.compile(program)?;
        let code = self.compiler.emit(&compiled)?;
        debug!(instrs = code.len(), ty = %compiled.ty, "loaded program");
        self.reset(code.into(), Vec::new(), None);
        Ok(compiled.ty)
    }

    /// Prepare to apply `lambda` to `arg` as the outermost call.
    pub fn start_apply(&mut self, lambda: &Value, arg: &Value) -> Result<Type> {
        let Value::Lambda(input, output, body) = lambda else {
            return Err(Error::type_error(format!("{lambda} is not a lambda")));
        };
        let arg_ty = arg.ty();
        if !arg_ty.is_subtype(input) || arg_ty.size_of()? != input.size_of()? {
            return Err(Error::type_error(format!("cannot apply a lambda on {input} to {arg_ty}")));
        }
        let sig = lambda.ty();
        let code = self.function(&sig, body)?;
        let me = DynValue {
            ty: sig,
            words: lambda.to_words()?.into(),
        };
        self.reset(code, arg.to_words()?, Some(me));
        Ok((**output).clone())
    }

    /// Prepare to evaluate `lazy` as the outermost call.
    pub fn start_eval(&mut self, lazy: &Value) -> Result<Type> {
        let Value::Lazy(out, body) = lazy else {
            return Err(Error::type_error(format!("{lazy} is not a lazy")));
        };
        let code = self.function(&lazy.ty(), body)?;
        self.reset(code, Vec::new(), None);
        Ok((**out).clone())
    }

    fn reset(&mut self, code: Arc<[Instr]>, stack: Vec<u32>, current: Option<DynValue>) {
        self.code = code;
        self.pc = 0;
        self.stack = stack;
        self.calls.clear();
        self.current = current;
        self.tries.clear();
        self.err = None;
        self.panic_value = None;
    }

    pub fn state(&self) -> State {
        if self.err.is_some() {
            State::Faulted
        } else if self.pc >= self.code.len() && self.calls.is_empty() {
            State::Halted
        } else {
            State::Running
        }
    }

    pub fn stack(&self) -> &[u32] {
        &self.stack
    }

    pub fn into_stack(self) -> Vec<u32> {
        self.stack
    }

    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.err.take()
    }

    /// The value passed to the `Panic` that faulted the VM, if any.
    pub fn panic_value(&self) -> Option<&AnyValue> {
        self.panic_value.as_ref()
    }

    /// Instructions executed over the VM's lifetime.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Decode the whole stack as a value of `ty`.
    pub fn result(&self, ty: &Type) -> Result<Value> {
        let words = words_for(ty.size_of()?);
        if self.stack.len() != words {
            return Err(Error::Size(format!(
                "stack holds {} words, {ty} needs {words}",
                self.stack.len()
            )));
        }
        Value::from_words(ty, &self.stack, &*self.env.store)
    }

    /// Execute up to `max_steps` instructions, returning how many ran.
    #[instrument(skip_all, fields(max_steps))]
    pub fn run(&mut self, max_steps: u64) -> u64 {
        let mut executed = 0;
        while executed < max_steps && self.state() == State::Running {
            executed += 1;
            if let Err(err) = self.step() {
                self.fault(err);
            }
        }
        self.steps += executed;
        executed
    }

    fn fault(&mut self, err: Error) {
        if let Error::Panic(value) = &err {
            if let Some(frame) = self.tries.pop() {
                trace!(handler = frame.handler, "caught panic");
                self.stack.truncate(frame.stack_len);
                self.calls.truncate(frame.calls_len);
                self.code = frame.code;
                self.pc = frame.handler;
                self.current = frame.from;
                self.push_bytes(&value.to_bytes(), ANY_VALUE_BITS);
                return;
            }
            self.panic_value = Some(*value);
        }
        debug!(error = %err, pc = self.pc, depth = self.calls.len(), "vm faulted");
        self.err = Some(err);
    }

    fn step(&mut self) -> Result<()> {
        let code = self.code.clone();
        let instr = code
            .get(self.pc)
            .ok_or_else(|| Error::Malformed("program counter past the end".into()))?;
        trace!(pc = self.pc, ?instr, "step");
        self.pc += 1;
        let store = self.env.store.clone();
        match instr {
            Instr::Push(w) => self.stack.push(*w),
            Instr::PushRef(d) => self.push_bytes(d, 256),
            Instr::PushAnyType(at) => self.push_bytes(&at.to_bytes(), ANY_TYPE_BITS),
            Instr::Pick { depth, len } => {
                let start = self.below(*depth)?;
                let end = start + *len as usize;
                if end > self.stack.len() {
                    return Err(underflow());
                }
                self.stack.extend_from_within(start..end);
            }
            Instr::Cut { depth, len } => {
                let start = self.below(*depth)?;
                let end = start + *len as usize;
                if end > self.stack.len() {
                    return Err(underflow());
                }
                self.stack.drain(start..end);
            }
            Instr::Discard(n) => {
                self.pop(*n)?;
            }
            Instr::Swap { lo, hi } => {
                let start = self.below(lo + hi)?;
                self.stack[start..].rotate_left(*hi as usize);
            }
            Instr::Concat {
                left_bits,
                right_bits,
            } => {
                let right = self.pop(words_for(*right_bits) as u32)?;
                let left = self.pop(words_for(*left_bits) as u32)?;
                self.stack.extend(concat(&left, *left_bits, &right, *right_bits));
            }
            Instr::Slice { in_bits, beg, end } => {
                let data = self.pop_bytes(*in_bits)?;
                let part = BitBuf::with_len(&data[..], *in_bits as usize)
                    .slice(*beg as usize, *end as usize)
                    .to_bytes();
                self.push_bytes(&part, end - beg);
            }
            Instr::MakeSum {
                tag,
                input_bits,
                tag_offset,
                tag_bits,
            } => {
                let content = self.pop(words_for(*input_bits) as u32)?;
                let total = tag_offset + tag_bits;
                let mut data = bitbuf::from_words(&content, *input_bits);
                data.resize(bytes_for(total), 0);
                BitBuf::with_len(&mut data[..], total as usize).put_bits(
                    *tag_offset as usize,
                    *tag_bits as usize,
                    u64::from(*tag),
                );
                self.push_bytes(&data, total);
            }
            Instr::Equal(words) => {
                let b = self.pop(*words)?;
                let a = self.pop(*words)?;
                self.stack.push(u32::from(a == b));
            }
            Instr::Branch(offset) => {
                if self.pop_word()? & 1 == 1 {
                    self.pc += *offset as usize;
                }
            }
            Instr::Jump(offset) => self.pc += *offset as usize,
            Instr::Eval { out } => {
                let handle = self.pop(HANDLE_WORDS)?;
                let body = any_prog(&handle);
                let code = self.function(&Type::lazy(out.clone()), &body)?;
                self.enter(code, None);
            }
            Instr::Apply { sig } => {
                let handle = self.pop(HANDLE_WORDS)?;
                let body = any_prog(&handle);
                let code = self.function(sig, &body)?;
                let me = DynValue {
                    ty: sig.clone(),
                    words: handle.into(),
                };
                self.enter(code, Some(me));
            }
            Instr::Ret {
                in_words,
                out_words,
            } => {
                let start = self.below(in_words + out_words)?;
                self.stack.drain(start..start + *in_words as usize);
                match self.calls.pop() {
                    Some(call) => {
                        self.code = call.code;
                        self.pc = call.pc;
                        self.current = call.from;
                    }
                    None => self.pc = self.code.len(),
                }
            }
            Instr::SelfValue => {
                let me = self
                    .current
                    .as_ref()
                    .ok_or_else(|| Error::FreeVariable("Self outside a lambda".into()))?;
                let words = me.words.clone();
                self.stack.extend_from_slice(&words);
            }
            Instr::Accel {
                in_words,
                out_words,
                id,
            } => {
                let accels = self.env.accels.clone();
                let accel = accels
                    .get(*id)
                    .ok_or_else(|| Error::Malformed(format!("no accelerator {id}")))?;
                let mut buf = self.pop(*in_words)?;
                buf.resize((*in_words).max(*out_words) as usize, 0);
                accel.call(&mut buf)?;
                buf.truncate(*out_words as usize);
                self.stack.extend(buf);
            }
            Instr::Post { ty } => {
                let bits = ty.size_of()?;
                if u64::from(bits) > self.env.options.max_blob_bits {
                    return Err(Error::Size(format!(
                        "cannot post {bits} bits, the limit is {}",
                        self.env.options.max_blob_bits
                    )));
                }
                let words = self.pop(words_for(bits) as u32)?;
                let value = Value::from_words(ty, &words, &*store)?;
                let digest = value.post(&*store)?;
                self.push_bytes(&digest, 256);
            }
            Instr::Load { bits, salt } => {
                let digest = self.pop_digest()?;
                let data = store.read(&digest, Some(salt.as_ref().unwrap_or(&cid::NO_SALT)))?;
                self.push_blob(&digest, &data, *bits)?;
            }
            Instr::Closure(site) => {
                let top = self.stack.len();
                let mut frames = Vec::with_capacity(site.frames.len());
                for shape in &site.frames {
                    let start = top.checked_sub(shape.depth as usize).ok_or_else(underflow)?;
                    let words = self
                        .stack
                        .get(start..start + shape.words as usize)
                        .ok_or_else(underflow)?;
                    frames.push((shape.ty.clone(), Arc::from(words)));
                }
                let words =
                    self.compiler
                        .close_construct(&site.program, site.body, &site.construct, &frames)?;
                self.stack.extend_from_slice(&words);
            }
            Instr::PortInput { words } => {
                let port = self.pop_digest()?;
                let mut buf = vec![0u32; *words as usize];
                self.ports.input(&port, &mut buf)?;
                self.stack.extend(buf);
            }
            Instr::PortOutput { words } => {
                let data = self.pop(*words)?;
                let port = self.pop_digest()?;
                self.ports.output(&port, &data)?;
            }
            Instr::PortInteract {
                req_words,
                resp_words,
            } => {
                let mut buf = self.pop(*req_words)?;
                let port = self.pop_digest()?;
                buf.resize((*req_words).max(*resp_words) as usize, 0);
                self.ports.interact(&port, &mut buf)?;
                buf.truncate(*resp_words as usize);
                self.stack.extend(buf);
            }
            Instr::AnyTypeFrom { kind } => {
                let words = self.pop(words_for(kind.data_bits()) as u32)?;
                let ty = decode_type(&*store, *kind, &words)?;
                let at = ty.post(&*store)?;
                self.push_bytes(&at.to_bytes(), ANY_TYPE_BITS);
            }
            Instr::AnyTypeTo { kind } => {
                let at = AnyType::from_bytes(&self.pop_bytes(ANY_TYPE_BITS)?)?;
                if at.kind != *kind {
                    return Err(Error::type_error(format!("{at} is not of kind {kind}")));
                }
                let data = store.read(&at.digest, Some(&cid::NO_SALT))?;
                self.push_blob(&at.digest, &data, kind.data_bits())?;
            }
            Instr::AnyValueFrom { ty, at } => {
                let words = self.pop(words_for(ty.size_of()?) as u32)?;
                let value = Value::from_words(ty, &words, &*store)?;
                let av = AnyValue {
                    digest: value.post(&*store)?,
                    ty: *at,
                };
                self.push_bytes(&av.to_bytes(), ANY_VALUE_BITS);
            }
            Instr::AnyValueTo { at, bits, salt } => {
                let av = AnyValue::from_bytes(&self.pop_bytes(ANY_VALUE_BITS)?)?;
                if av.ty != *at {
                    return Err(Error::type_error(format!(
                        "AnyValue holds {}, expected {at}",
                        av.ty
                    )));
                }
                let data = store.read(&av.digest, Some(salt.as_ref().unwrap_or(&cid::NO_SALT)))?;
                self.push_blob(&av.digest, &data, *bits)?;
            }
            Instr::ArrayGet { elem_bits, len } => {
                let index = self.pop_word()?;
                let data = self.pop_bytes(elem_bits * len)?;
                check_index(index, *len)?;
                self.push_element(&data, index, *elem_bits);
            }
            Instr::ListGet { elem, elem_bits } => {
                let index = self.pop_word()?;
                let (digest, len) = self.pop_list()?;
                check_index(index, len)?;
                let data = store.read(&digest, Some(&array_fingerprint(elem, len)))?;
                check_blob_len(&digest, &data, elem_bits * len)?;
                self.push_element(&data, index, *elem_bits);
            }
            Instr::ListFrom { ty } => {
                let Type::Array(_, len) = ty else {
                    return Err(Error::type_error(format!("cannot make a list from {ty}")));
                };
                let words = self.pop(words_for(ty.size_of()?) as u32)?;
                let digest = Value::from_words(ty, &words, &*store)?.post(&*store)?;
                self.push_bytes(&digest, 256);
                self.stack.push(*len);
            }
            Instr::ListTo {
                elem,
                elem_bits,
                len,
            } => {
                let (digest, actual) = self.pop_list()?;
                if actual != *len {
                    return Err(Error::type_error(format!(
                        "list holds {actual} elements, expected {len}"
                    )));
                }
                let data = store.read(&digest, Some(&array_fingerprint(elem, *len)))?;
                self.push_blob(&digest, &data, elem_bits * len)?;
            }
            Instr::ListSlice { elem, elem_bits } => {
                let end = self.pop_word()?;
                let beg = self.pop_word()?;
                let (digest, len) = self.pop_list()?;
                if beg > end || end > len {
                    return Err(Error::OutOfBounds {
                        index: u64::from(end.max(beg)),
                        len: u64::from(len),
                    });
                }
                let data = store.read(&digest, Some(&array_fingerprint(elem, len)))?;
                check_blob_len(&digest, &data, elem_bits * len)?;
                let part = BitBuf::with_len(&data[..], (elem_bits * len) as usize)
                    .slice((elem_bits * beg) as usize, (elem_bits * end) as usize)
                    .to_bytes();
                let sub = store.post(Some(&array_fingerprint(elem, end - beg)), &part)?;
                self.push_bytes(&sub, 256);
                self.stack.push(end - beg);
            }
            Instr::Mux {
                table,
                elem_bits,
                len,
            } => {
                let index = self.pop_word()?;
                check_index(index, *len)?;
                let data = bitbuf::from_words(table, elem_bits * len);
                self.push_element(&data, index, *elem_bits);
            }
            Instr::SizeOf { kind } => {
                let words = self.pop(words_for(kind.data_bits()) as u32)?;
                let ty = decode_type(&*store, *kind, &words)?;
                let bits = self.compiler.size(&ty)?;
                self.stack.push(bits);
            }
            Instr::Panic => {
                let av = AnyValue::from_bytes(&self.pop_bytes(ANY_VALUE_BITS)?)?;
                return Err(Error::Panic(av));
            }
            Instr::TryBegin(offset) => self.tries.push(TryFrame {
                code: self.code.clone(),
                handler: self.pc + *offset as usize,
                stack_len: self.stack.len(),
                calls_len: self.calls.len(),
                from: self.current.clone(),
            }),
            Instr::TryEnd => {
                self.tries.pop();
            }
        }
        Ok(())
    }

    /// Compiled code for the body of a lambda or lazy of type `sig`.
    fn function(&mut self, sig: &Type, body: &AnyProg) -> Result<Arc<[Instr]>> {
        let key = (sig.fingerprint(), body.digest);
        if let Some(code) = self.funcs.get(&key) {
            return Ok(code);
        }
        let program = Program::load(&*self.env.store, body)?;
        let code = match sig {
            Type::Lazy(out) => self.compiler.lazy_body(&program, out)?,
            _ => self.compiler.lambda_body(&program, sig)?,
        };
        debug!(
            body = %cid::to_text(&body.digest),
            instrs = code.len(),
            cached = self.funcs.len(),
            "compiled function body"
        );
        self.funcs.insert(key, code.clone());
        Ok(code)
    }

    fn enter(&mut self, code: Arc<[Instr]>, from: Option<DynValue>) {
        let caller = Call {
            code: mem::replace(&mut self.code, code),
            pc: mem::replace(&mut self.pc, 0),
            from: mem::replace(&mut self.current, from),
        };
        self.calls.push(caller);
    }

    /// Stack index `depth` words below the top.
    fn below(&self, depth: u32) -> Result<usize> {
        self.stack
            .len()
            .checked_sub(depth as usize)
            .ok_or_else(underflow)
    }

    fn pop(&mut self, n: u32) -> Result<Vec<u32>> {
        let start = self.below(n)?;
        Ok(self.stack.split_off(start))
    }

    fn pop_word(&mut self) -> Result<u32> {
        self.stack.pop().ok_or_else(underflow)
    }

    fn pop_bytes(&mut self, bits: u32) -> Result<Vec<u8>> {
        let words = self.pop(words_for(bits) as u32)?;
        Ok(bitbuf::from_words(&words, bits))
    }

    fn pop_digest(&mut self) -> Result<Digest> {
        cid::from_slice(&self.pop_bytes(256)?)
    }

    fn pop_list(&mut self) -> Result<(Digest, u32)> {
        let len = self.pop_word()?;
        Ok((self.pop_digest()?, len))
    }

    fn push_bytes(&mut self, bytes: &[u8], bits: u32) {
        self.stack.extend(bitbuf::to_words(bytes, bits));
    }

    fn push_blob(&mut self, digest: &Digest, data: &[u8], bits: u32) -> Result<()> {
        check_blob_len(digest, data, bits)?;
        self.push_bytes(data, bits);
        Ok(())
    }

    fn push_element(&mut self, data: &[u8], index: u32, elem_bits: u32) {
        let beg = (index * elem_bits) as usize;
        let part = BitBuf::new(data)
            .slice(beg, beg + elem_bits as usize)
            .to_bytes();
        self.push_bytes(&part, elem_bits);
    }
}

fn underflow() -> Error {
    Error::Malformed("stack underflow".into())
}

fn any_prog(words: &[u32]) -> AnyProg {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&bitbuf::from_words(&words[..8], 256));
    AnyProg {
        digest,
        bytes: words[8],
    }
}

fn check_index(index: u32, len: u32) -> Result<()> {
    if index >= len {
        return Err(Error::OutOfBounds {
            index: u64::from(index),
            len: u64::from(len),
        });
    }
    Ok(())
}

fn check_blob_len(digest: &Digest, data: &[u8], bits: u32) -> Result<()> {
    if data.len() != bytes_for(bits) {
        return Err(Error::Size(format!(
            "blob {} has {} bytes, expected {}",
            cid::to_text(digest),
            data.len(),
            bytes_for(bits)
        )));
    }
    Ok(())
}

fn concat(left: &[u32], left_bits: u32, right: &[u32], right_bits: u32) -> Vec<u32> {
    if left_bits % 32 == 0 {
        return left.iter().chain(right).copied().collect();
    }
    let total = left_bits + right_bits;
    let mut out = vec![0u8; bytes_for(total)];
    {
        let mut buf = BitBuf::with_len(&mut out[..], total as usize);
        let l = bitbuf::from_words(left, left_bits);
        let r = bitbuf::from_words(right, right_bits);
        buf.put_buf(0, &BitBuf::with_len(&l[..], left_bits as usize));
        buf.put_buf(left_bits as usize, &BitBuf::with_len(&r[..], right_bits as usize));
    }
    bitbuf::to_words(&out, total)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::ast::{Builder, Op};
    use crate::kind::Kind;
    use crate::port::PortBackend;
    use crate::store::{Getter, MemStore};

    fn env() -> Result<(Env, Arc<MemStore>)> {
        let store = Arc::new(MemStore::new());
        Ok((Env::new(store.clone())?, store))
    }

    /// Compile and run `b` to completion.
    fn run(b: Builder) -> Result<(Vm, Type)> {
        let (env, _) = env()?;
        let mut vm = Vm::new(env);
        let ty = vm.load(&b.finish()?)?;
        vm.run(100_000);
        Ok((vm, ty))
    }

    /// The type value of `B32`, as a node.
    fn b32_type(b: &mut Builder) -> usize {
        let zero = b.b32(0);
        b.push(Op::TypeOf, &[zero])
    }

    /// Run a program that builds a constant lambda and return it.
    fn lambda(vm: &mut Vm, b: Builder) -> Result<Value> {
        let program = b.finish()?;
        let ty = vm.load(&program)?;
        vm.run(100_000);
        assert_eq!(vm.state(), State::Halted);
        vm.result(&ty)
    }

    /// `accel` as a constant lambda node.
    fn accel_node(b: &mut Builder, store: &MemStore, name: &str) -> Result<usize> {
        let accels = Accelerators::defaults()?;
        let accel = accels
            .find(name)
            .ok_or_else(|| Error::Malformed(format!("no {name}")))?;
        let av = accel.post(store)?;
        let v = b.push(Op::LiteralAnyValue(av), &[]);
        let t = b.push(Op::LiteralAnyType(av.ty), &[]);
        let k = b.push(Op::LiteralKind(av.ty.kind), &[]);
        let tv = b.push(Op::AnyTypeTo, &[t, k]);
        Ok(b.push(Op::AnyValueTo, &[v, tv]))
    }

    #[test]
    fn post_then_load() -> Result<()> {
        let mut b = Builder::new();
        let x = b.b32(123);
        let r = b.push(Op::Post, &[x]);
        b.push(Op::Load, &[r]);
        let (vm, ty) = run(b)?;
        assert_eq!(vm.state(), State::Halted);
        assert_eq!(ty, Type::b32());
        assert_eq!(vm.stack(), &[123]);
        Ok(())
    }

    #[test]
    fn equal_compares_words() -> Result<()> {
        for (y, expected) in [(123, 1), (124, 0)] {
            let mut b = Builder::new();
            let x = b.b32(123);
            let y = b.b32(y);
            b.push(Op::Equal, &[x, y]);
            let (vm, _) = run(b)?;
            assert_eq!(vm.stack(), &[expected]);
        }
        Ok(())
    }

    #[test]
    fn constant_branches_pick_an_arm() -> Result<()> {
        for (cond, expected) in [(Op::One, 333), (Op::Zero, 777)] {
            let mut b = Builder::new();
            let c = b.push(cond, &[]);
            let zero = b.b32(777);
            let one = b.b32(333);
            b.push(Op::Branch, &[c, zero, one]);
            let (vm, _) = run(b)?;
            assert_eq!(vm.stack(), &[expected]);
        }
        Ok(())
    }

    #[test]
    fn let_binds_a_parameter() -> Result<()> {
        let mut b = Builder::new();
        let x = b.b32(123);
        let p = b.param(0);
        b.push(Op::Let, &[x, p]);
        let (vm, _) = run(b)?;
        assert_eq!(vm.stack(), &[123]);
        Ok(())
    }

    #[test]
    fn unit_lambda_applies_to_nothing() -> Result<()> {
        let mut b = Builder::new();
        let u = b.unit();
        let ut = b.push(Op::TypeOf, &[u]);
        let body = b.unit();
        let f = b.push(Op::Lambda, &[ut, ut, body]);
        let arg = b.unit();
        b.push(Op::Apply, &[f, arg]);
        let (vm, ty) = run(b)?;
        assert_eq!(vm.state(), State::Halted);
        assert_eq!(ty, Type::unit());
        assert!(vm.stack().is_empty());
        Ok(())
    }

    #[test]
    fn accelerated_add() -> Result<()> {
        let (env, store) = env()?;
        let mut b = Builder::new();
        let add = accel_node(&mut b, &store, "u32.add")?;
        let x = b.b32(6);
        let y = b.b32(5);
        let arg = b.pair(x, y);
        b.push(Op::Apply, &[add, arg]);
        let mut vm = Vm::new(env);
        vm.load(&b.finish()?)?;
        let steps = vm.run(100);
        assert!(steps <= 15);
        assert_eq!(vm.stack(), &[11]);

        // The same call with a run-time argument goes through `Accel`.
        let mut b = Builder::new();
        let pair_t = {
            let x = b.b32(0);
            let y = b.b32(0);
            let p = b.pair(x, y);
            b.push(Op::TypeOf, &[p])
        };
        let out_t = b32_type(&mut b);
        let add = accel_node(&mut b, &store, "u32.add")?;
        let arg = b.param(0);
        let body = b.push(Op::Apply, &[add, arg]);
        b.push(Op::Lambda, &[pair_t, out_t, body]);
        let f = lambda(&mut vm, b)?;
        let arg = Value::Product(vec![Value::B32(u32::MAX), Value::B32(3)]);
        vm.start_apply(&f, &arg)?;
        let steps = vm.run(100);
        assert!(steps <= 15);
        assert_eq!(vm.state(), State::Halted);
        assert_eq!(vm.stack(), &[2]);
        Ok(())
    }

    #[test]
    fn bit_arrays_concatenate() -> Result<()> {
        let mut b = Builder::new();
        let x = b.push(Op::Bits { len: 2, bits: 0b11 }, &[]);
        let y = b.push(Op::Bits { len: 1, bits: 1 }, &[]);
        b.push(Op::Concat, &[x, y]);
        let (vm, ty) = run(b)?;
        assert_eq!(ty, Type::bits(3));
        assert_eq!(vm.stack(), &[7]);
        assert_eq!(concat(&[0b1], 1, &[0xffff_ffff, 1], 33), vec![0xffff_ffff, 0b11]);
        Ok(())
    }

    #[test]
    fn fingerprints_match_posted_digests() -> Result<()> {
        let store = MemStore::new();
        let pair = Type::product(vec![Type::b8(), Type::Bit]);
        let values = [
            Value::B32(5),
            Value::Product(vec![Value::B8(1), Value::Bit(true)]),
            Value::Array(Arc::new(pair.clone()), vec![Value::Product(vec![Value::B8(2), Value::Bit(false)])]),
            Value::Sum(Arc::from(vec![Type::b8(), Type::b32()]), 1, Box::new(Value::B32(9))),
            Value::Type(pair),
        ];
        for v in values {
            assert_eq!(v.fingerprint()?, v.post(&store)?, "{v}");
        }
        Ok(())
    }

    #[test]
    fn runtime_branch_and_closure() -> Result<()> {
        let (env, _) = env()?;
        let mut vm = Vm::new(env);

        // λx:B32. Eval(Lazy(Branch(x == 5, 777, 333)))
        let mut b = Builder::new();
        let in_t = b32_type(&mut b);
        let out_t = b32_type(&mut b);
        let x = b.param(0);
        let five = b.b32(5);
        let cond = b.push(Op::Equal, &[x, five]);
        let zero = b.b32(777);
        let one = b.b32(333);
        let pick = b.push(Op::Branch, &[cond, zero, one]);
        let lazy = b.push(Op::Lazy, &[pick]);
        let body = b.push(Op::Eval, &[lazy]);
        b.push(Op::Lambda, &[in_t, out_t, body]);
        let f = lambda(&mut vm, b)?;

        for (arg, expected) in [(5, 333), (6, 777)] {
            vm.start_apply(&f, &Value::B32(arg))?;
            vm.run(1000);
            assert_eq!(vm.state(), State::Halted);
            assert_eq!(vm.stack(), &[expected]);
        }
        Ok(())
    }

    #[test]
    fn self_recursion_counts_down() -> Result<()> {
        let (env, store) = env()?;
        let mut vm = Vm::new(env);

        // f(n) = if n == 0 { 42 } else { f(n - 1) }
        let mut b = Builder::new();
        let in_t = b32_type(&mut b);
        let out_t = b32_type(&mut b);
        let sub = accel_node(&mut b, &store, "u32.sub")?;
        let n = b.param(0);
        let zero = b.b32(0);
        let done = b.push(Op::Equal, &[n, zero]);
        let one = b.b32(1);
        let args = b.pair(n, one);
        let pred = b.push(Op::Apply, &[sub, args]);
        let me = b.push(Op::SelfRef, &[]);
        let again = b.push(Op::Apply, &[me, pred]);
        let answer = b.b32(42);
        let body = b.push(Op::Branch, &[done, again, answer]);
        b.push(Op::Lambda, &[in_t, out_t, body]);
        let f = lambda(&mut vm, b)?;

        vm.start_apply(&f, &Value::B32(10))?;
        vm.run(10_000);
        assert_eq!(vm.state(), State::Halted);
        assert_eq!(vm.stack(), &[42]);

        // Without a base case the budget runs out and the VM stays resumable.
        let mut b = Builder::new();
        let in_t = b32_type(&mut b);
        let out_t = b32_type(&mut b);
        let me = b.push(Op::SelfRef, &[]);
        let n = b.param(0);
        let body = b.push(Op::Apply, &[me, n]);
        b.push(Op::Lambda, &[in_t, out_t, body]);
        let forever = lambda(&mut vm, b)?;
        vm.start_apply(&forever, &Value::B32(1))?;
        assert_eq!(vm.run(500), 500);
        assert_eq!(vm.state(), State::Running);
        assert_eq!(vm.run(500), 500);
        Ok(())
    }

    #[test]
    fn compile_time_loops_hit_the_step_limit() -> Result<()> {
        let (env, _) = env()?;
        let env = env.with_options(Options {
            compile_step_budget: 5_000,
            ..Options::default()
        });
        let mut b = Builder::new();
        let u = b.unit();
        let ut = b.push(Op::TypeOf, &[u]);
        let me = b.push(Op::SelfRef, &[]);
        let arg = b.unit();
        let body = b.push(Op::Apply, &[me, arg]);
        let f = b.push(Op::Lambda, &[ut, ut, body]);
        let arg = b.unit();
        b.push(Op::Apply, &[f, arg]);
        let mut vm = Vm::new(env);
        let err = vm.load(&b.finish()?).err();
        assert!(matches!(err.as_ref().map(Error::root), Some(Error::StepLimit(5_000))));
        Ok(())
    }

    #[test]
    fn panics_fault_with_their_value() -> Result<()> {
        let mut b = Builder::new();
        let x = b.b32(9);
        let av = b.push(Op::AnyValueFrom, &[x]);
        b.push(Op::Panic, &[av]);
        let (vm, ty) = run(b)?;
        assert!(ty.is_bottom());
        assert_eq!(vm.state(), State::Faulted);
        assert!(matches!(vm.error(), Some(Error::Panic(_))));
        let value = vm.panic_value().copied();
        assert_eq!(value.map(|v| v.ty), Some(Type::b32().any_type()));
        Ok(())
    }

    #[test]
    fn try_catches_panics() -> Result<()> {
        let mut b = Builder::new();
        let x = b.b32(9);
        let av = b.push(Op::AnyValueFrom, &[x]);
        let boom = b.push(Op::Panic, &[av]);
        b.push(Op::Try, &[boom]);
        let (vm, ty) = run(b)?;
        assert_eq!(vm.state(), State::Halted);
        let Value::Sum(_, tag, caught) = vm.result(&ty)? else {
            panic!("expected a sum");
        };
        assert_eq!(tag, 1);
        let Value::AnyValue(caught) = *caught else {
            panic!("expected an AnyValue");
        };
        assert_eq!(Value::load(&*vm.env().store, &Type::b32(), &caught.digest)?, Value::B32(9));

        let mut b = Builder::new();
        let x = b.b32(5);
        b.push(Op::Try, &[x]);
        let (vm, ty) = run(b)?;
        assert_eq!(vm.result(&ty)?, Value::Sum(Arc::from(vec![Type::b32(), Type::AnyValue]), 0, Box::new(Value::B32(5))));
        Ok(())
    }

    #[test]
    fn caught_panics_restore_the_stack_depth() -> Result<()> {
        let (env, _) = env()?;
        let mut vm = Vm::new(env);

        // λx:B32. (x, Try(Branch(x == 7, x, Panic(AnyValueFrom(x)))))
        let mut b = Builder::new();
        let in_t = b32_type(&mut b);
        let out_t = {
            let zero = b.b32(0);
            let caught = b.push(Op::Try, &[zero]);
            let pair = b.pair(zero, caught);
            b.push(Op::TypeOf, &[pair])
        };
        let x = b.param(0);
        let seven = b.b32(7);
        let hit = b.push(Op::Equal, &[x, seven]);
        let av = b.push(Op::AnyValueFrom, &[x]);
        let boom = b.push(Op::Panic, &[av]);
        let pick = b.push(Op::Branch, &[hit, x, boom]);
        let caught = b.push(Op::Try, &[pick]);
        let body = b.pair(x, caught);
        b.push(Op::Lambda, &[in_t, out_t, body]);
        let f = lambda(&mut vm, b)?;
        let Value::Lambda(_, output, _) = &f else {
            panic!("expected a lambda");
        };
        let out = (**output).clone();
        // 32 bits of x, then 544 of AnyValue content and a tag bit.
        assert_eq!(words_for(out.size_of()?), 19);

        for arg in [3, 7] {
            vm.start_apply(&f, &Value::B32(arg))?;
            vm.run(10_000);
            assert_eq!(vm.state(), State::Halted);
            assert_eq!(vm.stack().len(), 19);
            assert!(vm.tries.is_empty());
            let Value::Product(fields) = vm.result(&out)? else {
                panic!("expected a product");
            };
            assert_eq!(fields[0], Value::B32(arg));
            let Value::Sum(_, tag, inner) = &fields[1] else {
                panic!("expected a sum");
            };
            if arg == 7 {
                assert_eq!(*tag, 1);
                assert!(matches!(**inner, Value::AnyValue(_)));
            } else {
                assert_eq!(*tag, 0);
                assert_eq!(**inner, Value::B32(3));
            }
        }
        Ok(())
    }

    /// f(n) = if n == 0 { 42 } else { f(n - 1) }
    fn countdown(vm: &mut Vm, store: &MemStore) -> Result<Value> {
        let mut b = Builder::new();
        let in_t = b32_type(&mut b);
        let out_t = b32_type(&mut b);
        let sub = accel_node(&mut b, store, "u32.sub")?;
        let n = b.param(0);
        let zero = b.b32(0);
        let done = b.push(Op::Equal, &[n, zero]);
        let one = b.b32(1);
        let args = b.pair(n, one);
        let pred = b.push(Op::Apply, &[sub, args]);
        let me = b.push(Op::SelfRef, &[]);
        let again = b.push(Op::Apply, &[me, pred]);
        let answer = b.b32(42);
        let body = b.push(Op::Branch, &[done, again, answer]);
        b.push(Op::Lambda, &[in_t, out_t, body]);
        lambda(vm, b)
    }

    #[test]
    fn runs_are_deterministic() -> Result<()> {
        let mut runs = Vec::new();
        for _ in 0..2 {
            let (env, store) = env()?;
            let mut vm = Vm::new(env);
            let f = countdown(&mut vm, &store)?;
            // The second apply on one VM hits the function cache.
            for _ in 0..2 {
                vm.start_apply(&f, &Value::B32(25))?;
                let steps = vm.run(100_000);
                assert_eq!(vm.state(), State::Halted);
                runs.push((vm.stack().to_vec(), steps));
            }
        }
        assert_eq!(runs[0].0, vec![42]);
        assert!(runs.windows(2).all(|w| w[0] == w[1]), "{runs:?}");
        Ok(())
    }

    #[test]
    fn type_of_keeps_its_operand_effects() -> Result<()> {
        let (env, store) = env()?;
        let mut b = Builder::new();
        let x = b.b32(5);
        let r = b.push(Op::Post, &[x]);
        b.push(Op::TypeOf, &[r]);
        let mut vm = Vm::new(env);
        let ty = vm.load(&b.finish()?)?;
        let digest = Value::B32(5).fingerprint()?;
        assert!(!store.exists(&digest)?);
        vm.run(1000);
        assert_eq!(vm.state(), State::Halted);
        assert!(store.exists(&digest)?);
        assert_eq!(vm.result(&ty)?, Value::Type(Type::reference(Type::b32())));

        let mut b = Builder::new();
        let x = b.b32(1);
        let av = b.push(Op::AnyValueFrom, &[x]);
        let boom = b.push(Op::Panic, &[av]);
        b.push(Op::TypeOf, &[boom]);
        let (vm, ty) = run(b)?;
        assert_eq!(ty, Type::Kind(Kind::sum(0)?));
        assert_eq!(vm.state(), State::Faulted);
        assert!(matches!(vm.error(), Some(Error::Panic(_))));
        Ok(())
    }

    #[test]
    fn mismatched_any_values_fail_at_run_time() -> Result<()> {
        let mut b = Builder::new();
        let x = b.b32(1);
        let av = b.push(Op::AnyValueFrom, &[x]);
        let byte = b.push(Op::B8(0), &[]);
        let t = b.push(Op::TypeOf, &[byte]);
        b.push(Op::AnyValueTo, &[av, t]);
        let (vm, ty) = run(b)?;
        assert_eq!(ty, Type::b8());
        assert_eq!(vm.state(), State::Faulted);
        assert!(matches!(vm.error(), Some(Error::Type(_))));
        Ok(())
    }

    #[test]
    fn lists_index_and_slice() -> Result<()> {
        // Let(ListFrom([10, 20, 30]), (list[1], Len(list), Len(list[1..3])))
        let mut b = Builder::new();
        let items: Vec<usize> = [10, 20, 30]
            .into_iter()
            .map(|v| {
                let x = b.b32(v);
                b.push(Op::ArrayUnit, &[x])
            })
            .collect();
        let first = b.push(Op::Concat, &[items[0], items[1]]);
        let arr = b.push(Op::Concat, &[first, items[2]]);
        let list = b.push(Op::ListFrom, &[arr]);
        let p = b.param(0);
        let one = b.b32(1);
        let item = b.push(Op::Slot, &[p, one]);
        let len = b.push(Op::Len, &[p]);
        let three = b.b32(3);
        let tail = b.push(Op::Slice, &[p, one, three]);
        let tail_len = b.push(Op::Len, &[tail]);
        let ab = b.pair(item, len);
        let last = b.push(Op::ProductUnit, &[tail_len]);
        let all = b.push(Op::Concat, &[ab, last]);
        b.push(Op::Let, &[list, all]);
        let (vm, _) = run(b)?;
        assert_eq!(vm.state(), State::Halted);
        assert_eq!(vm.stack(), &[20, 3, 2]);

        let mut b = Builder::new();
        let x = b.b32(1);
        let arr = b.push(Op::ArrayUnit, &[x]);
        let list = b.push(Op::ListFrom, &[arr]);
        let four = b.b32(4);
        b.push(Op::Slot, &[list, four]);
        let (vm, _) = run(b)?;
        assert!(matches!(vm.error(), Some(Error::OutOfBounds { index: 4, len: 1 })));
        Ok(())
    }

    struct Recorder(Arc<Mutex<Vec<Vec<u32>>>>);

    impl PortBackend for Recorder {
        fn output(&mut self, data: &[u32]) -> std::result::Result<(), String> {
            self.0.lock().map_err(|e| e.to_string())?.push(data.to_vec());
            Ok(())
        }

        fn interact(&mut self, buf: &mut [u32]) -> std::result::Result<(), String> {
            buf[0] *= 2;
            Ok(())
        }
    }

    #[test]
    fn ports_reach_host_backends() -> Result<()> {
        let (env, _) = env()?;
        let id = cid::compute(None, b"test port");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut vm = Vm::new(env);
        vm.ports_mut().register(id, Box::new(Recorder(log.clone())));

        // Port[B32, B32, B32, B32] crafted from four AnyTypes.
        let port = |b: &mut Builder| {
            let t = b32_type(b);
            let at = b.push(Op::AnyTypeFrom, &[t]);
            let two = b.pair(at, at);
            let four = b.push(Op::Concat, &[two, two]);
            let k = b.push(Op::LiteralKind(Kind::PORT), &[]);
            let pt = b.push(Op::Craft, &[k, four]);
            let bits = b.push(Op::B256(id), &[]);
            b.push(Op::Decode, &[bits, pt])
        };

        let mut b = Builder::new();
        let p = port(&mut b);
        let req = b.b32(21);
        b.push(Op::Interact, &[p, req]);
        vm.load(&b.finish()?)?;
        vm.run(1000);
        assert_eq!(vm.stack(), &[42]);

        let mut b = Builder::new();
        let p = port(&mut b);
        let msg = b.b32(7);
        b.push(Op::Output, &[p, msg]);
        vm.load(&b.finish()?)?;
        vm.run(1000);
        assert_eq!(vm.state(), State::Halted);
        let seen = log.lock().map(|l| l.clone()).unwrap_or_default();
        assert_eq!(seen, vec![vec![7]]);

        let mut b = Builder::new();
        let p = port(&mut b);
        b.push(Op::Input, &[p]);
        vm.load(&b.finish()?)?;
        vm.run(1000);
        assert!(matches!(vm.error(), Some(Error::Port { port, .. }) if *port == id));
        Ok(())
    }

    #[test]
    fn func_cache_evicts_least_recent() {
        let mut cache = FuncCache::new(2);
        let key = |n: u8| ([n; 32], [0; 32]);
        let code: Arc<[Instr]> = Arc::from(vec![Instr::Push(0)]);
        cache.insert(key(1), code.clone());
        cache.insert(key(2), code.clone());
        assert!(cache.get(&key(1)).is_some());
        cache.insert(key(3), code);
        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(1)).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn func_cache_order_follows_repeated_use() {
        let mut cache = FuncCache::new(3);
        let key = |n: u8| ([n; 32], [n; 32]);
        let code: Arc<[Instr]> = Arc::from(vec![Instr::Push(0)]);
        for n in 1..=3 {
            cache.insert(key(n), code.clone());
        }
        for _ in 0..5 {
            assert!(cache.get(&key(1)).is_some());
        }
        assert!(cache.get(&key(2)).is_some());
        // Reinserting refreshes rather than duplicates.
        cache.insert(key(3), code.clone());
        assert_eq!(cache.order.len(), 3);
        cache.insert(key(4), code.clone());
        assert!(cache.get(&key(1)).is_none());
        cache.insert(key(5), code);
        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(3)).is_some());
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.order.len(), 3);
    }
}
