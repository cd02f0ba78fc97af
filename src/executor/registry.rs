use std::collections::HashMap;

use crate::config::ExecutorConfig;
use crate::error::{DispatchError, Result};
use crate::executor::{jsonl, local, noop, remote, slurm, Executor, ExecutorKind};

/// Builds an executor from its configuration variant.
pub type ExecutorFactory = fn(ExecutorConfig) -> Result<Box<dyn Executor>>;

/// Table from backend tag to factory.
///
/// Built once at startup and passed to whoever needs to create executors.
/// New backends are added with [`register`](Self::register) without touching
/// the dispatch in [`create`](Self::create).
#[derive(Clone)]
pub struct ExecutorRegistry {
    factories: HashMap<ExecutorKind, ExecutorFactory>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry covering every built-in backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry
            .register(ExecutorKind::Local, local::factory)
            .register(ExecutorKind::Slurm, slurm::factory)
            .register(ExecutorKind::PreallocatedSlurm, slurm::preallocated_factory)
            .register(ExecutorKind::Remote, remote::factory)
            .register(ExecutorKind::Noop, noop::factory)
            .register(ExecutorKind::JsonLines, jsonl::factory);
        registry
    }

    /// Add or replace the factory for `kind`.
    pub fn register(&mut self, kind: ExecutorKind, factory: ExecutorFactory) -> &mut Self {
        if self.factories.insert(kind, factory).is_some() {
            tracing::debug!(kind = %kind, "Replaced executor factory");
        }
        self
    }

    pub fn is_registered(&self, kind: ExecutorKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn create(&self, config: ExecutorConfig) -> Result<Box<dyn Executor>> {
        let kind = config.kind();
        let factory = self
            .factories
            .get(&kind)
            .ok_or(DispatchError::Unregistered(kind))?;
        tracing::debug!(kind = %kind, "Creating executor");
        factory(config)
    }
}
