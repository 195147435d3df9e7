//! Host-side port backends.
//!
//! A port value is a 256-bit identifier. The VM looks the identifier up in
//! its [`Ports`] table and hands the backend the value's words.

use std::collections::HashMap;

use crate::cid::{self, Digest};
use crate::error::{Error, Result};

/// A host effect reachable from programs. Operations a backend does not
/// support fail with a port error naming the operation.
pub trait PortBackend: Send {
    /// Fill `out` with the next input value.
    fn input(&mut self, _out: &mut [u32]) -> Result<(), String> {
        Err("input is not supported".into())
    }

    fn output(&mut self, _data: &[u32]) -> Result<(), String> {
        Err("output is not supported".into())
    }

    /// `buf` holds the request on entry and must hold the response on exit.
    fn interact(&mut self, _buf: &mut [u32]) -> Result<(), String> {
        Err("interaction is not supported".into())
    }
}

#[derive(Default)]
pub struct Ports {
    backends: HashMap<Digest, Box<dyn PortBackend>>,
}

impl Ports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `backend` to port `id`, returning whatever was attached before.
    pub fn register(&mut self, id: Digest, backend: Box<dyn PortBackend>) -> Option<Box<dyn PortBackend>> {
        self.backends.insert(id, backend)
    }

    pub fn remove(&mut self, id: &Digest) -> Option<Box<dyn PortBackend>> {
        self.backends.remove(id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub(crate) fn input(&mut self, id: &Digest, out: &mut [u32]) -> Result<()> {
        let backend = self.backend(id)?;
        backend.input(out).map_err(|reason| port_error(id, reason))
    }

    pub(crate) fn output(&mut self, id: &Digest, data: &[u32]) -> Result<()> {
        let backend = self.backend(id)?;
        backend.output(data).map_err(|reason| port_error(id, reason))
    }

    pub(crate) fn interact(&mut self, id: &Digest, buf: &mut [u32]) -> Result<()> {
        let backend = self.backend(id)?;
        backend.interact(buf).map_err(|reason| port_error(id, reason))
    }

    fn backend(&mut self, id: &Digest) -> Result<&mut Box<dyn PortBackend>> {
        self.backends
            .get_mut(id)
            .ok_or_else(|| port_error(id, "no backend registered".into()))
    }
}

fn port_error(id: &Digest, reason: String) -> Error {
    tracing::debug!(port = %cid::to_text(id), %reason, "port operation failed");
    Error::Port { port: *id, reason }
}
