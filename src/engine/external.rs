//! The bridge from symbolic states into concrete host functions.
//!
//! The engine owns the policy and the marshalling (concretize arguments,
//! copy object bytes out into host buffers, copy them back in, mirror
//! errno); the host supplies the actual functions through
//! [`HostFunction`].

use crate::address_space::HostMemory;
use std::collections::HashMap;
use strum::{Display, EnumString};

/// How calls to functions without a body are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExternalCallPolicy {
    /// Refuse all external calls.
    None,
    /// Never call out; undefined functions yield fresh symbolic returns.
    Pure,
    /// Call out, but only with fully concrete arguments.
    Concrete,
    /// Call out, concretizing symbolic arguments with added constraints.
    All,
}

/// One concrete function the host exposes to executed programs. Pointer
/// arguments arrive as addresses of buffers in the [`HostMemory`].
pub trait HostFunction {
    fn call(&mut self, host: &mut HostMemory, args: &[u64]) -> Result<u64, String>;
}

impl<F> HostFunction for F
where
    F: FnMut(&mut HostMemory, &[u64]) -> Result<u64, String>,
{
    fn call(&mut self, host: &mut HostMemory, args: &[u64]) -> Result<u64, String> {
        self(host, args)
    }
}

/// The registry of host functions plus the buffer arena they operate on.
pub struct ExternalDispatcher {
    registry: HashMap<String, Box<dyn HostFunction>>,
    pub host: HostMemory,
    errno_address: u64,
}

impl std::fmt::Debug for ExternalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ExternalDispatcher")
            .field("registered", &self.registry.len())
            .field("errno_address", &self.errno_address)
            .finish()
    }
}

impl Default for ExternalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalDispatcher {
    pub fn new() -> Self {
        let mut host = HostMemory::new();
        let errno_address = host.allocate(4);
        Self {
            registry: HashMap::new(),
            host,
            errno_address,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, function: Box<dyn HostFunction>) {
        self.registry.insert(name.into(), function);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    /// Address of the host-side errno cell mirrored into the dedicated
    /// errno memory object around each call.
    pub fn errno_address(&self) -> u64 {
        self.errno_address
    }

    pub fn call(&mut self, name: &str, args: &[u64]) -> Result<u64, String> {
        let function = self
            .registry
            .get_mut(name)
            .ok_or_else(|| format!("no host function registered for {}", name))?;
        function.call(&mut self.host, args)
    }
}
