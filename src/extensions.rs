// src/extensions.rs
//
// Handlers run by the stepping loop after the force stage, the kick and the
// drift.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::particles::ParticleStore;
use crate::power::PowerSpectrum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtensionPoint {
    AfterForce,
    AfterKick,
    AfterDrift,
}

/// What a handler sees. `power` is only set after a force evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionContext<'a> {
    pub point: ExtensionPoint,
    pub step: usize,
    pub a_x: f64,
    pub a_v: f64,
    pub store: &'a ParticleStore,
    pub power: Option<&'a PowerSpectrum>,
}

pub trait Extension: Send {
    fn invoke(&mut self, ctx: &ExtensionContext<'_>) -> Result<()>;
}

impl<F> Extension for F
where
    F: FnMut(&ExtensionContext<'_>) -> Result<()> + Send,
{
    fn invoke(&mut self, ctx: &ExtensionContext<'_>) -> Result<()> {
        self(ctx)
    }
}

#[derive(Default)]
pub struct Extensions {
    handlers: BTreeMap<ExtensionPoint, Vec<Box<dyn Extension>>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Extension + 'static>(&mut self, point: ExtensionPoint, ext: E) {
        self.handlers.entry(point).or_default().push(Box::new(ext));
    }

    /// `register` for closures; the signature is taken from the bound.
    pub fn register_fn<F>(&mut self, point: ExtensionPoint, f: F)
    where
        F: FnMut(&ExtensionContext<'_>) -> Result<()> + Send + 'static,
    {
        self.register(point, f);
    }

    pub fn len(&self, point: ExtensionPoint) -> usize {
        self.handlers.get(&point).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.values().all(Vec::is_empty)
    }

    /// Runs the handlers for `ctx.point` in registration order; the first
    /// error stops the chain.
    pub fn invoke(&mut self, ctx: &ExtensionContext<'_>) -> Result<()> {
        if let Some(list) = self.handlers.get_mut(&ctx.point) {
            for h in list.iter_mut() {
                h.invoke(ctx)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<_, _> = self.handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("Extensions").field("handlers", &counts).finish()
    }
}
