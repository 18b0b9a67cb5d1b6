//! Query service: compile, cache and execute.

use std::sync::Arc;

use arbor_broker::Broker;
use arbor_common::config::QueryConfig;
use tracing::{debug, warn};

use crate::cache::PlanCache;
use crate::checkout::ConflictPolicy;
use crate::error::{XQueryError, XQueryResult};
use crate::eval::DynamicContext;
use crate::parser::XQueryCompiler;
use crate::plan::CompiledPlan;
use crate::value::Sequence;

/// Turns query source into plans.
pub trait QueryCompiler: Send + Sync {
    /// Compiles a main module.
    fn compile(&self, source: &str) -> XQueryResult<CompiledPlan>;

    /// Makes a library module importable. Returns its namespace.
    fn register_module(&self, _source: &str) -> XQueryResult<String> {
        Err(XQueryError::Static(
            "this compiler does not accept library modules".to_string(),
        ))
    }
}

/// Compiles queries through a [`PlanCache`] and runs them on a broker.
pub struct XQueryService {
    compiler: Arc<dyn QueryCompiler>,
    cache: PlanCache,
}

impl XQueryService {
    /// Creates a service using [`XQueryCompiler`].
    pub fn new(config: QueryConfig) -> Self {
        Self::with_compiler(Arc::new(XQueryCompiler::new()), config)
    }

    /// Creates a service with a custom compiler.
    pub fn with_compiler(compiler: Arc<dyn QueryCompiler>, config: QueryConfig) -> Self {
        Self {
            compiler,
            cache: PlanCache::new(config),
        }
    }

    /// Returns the plan cache.
    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// Registers a library module.
    ///
    /// Cached queries compiled against the module, directly or through
    /// another import, are dropped so the next execution compiles against
    /// the new source.
    pub fn register_module(&self, source: &str) -> XQueryResult<String> {
        let namespace = self.compiler.register_module(source)?;
        let dropped = self.cache.invalidate_plans(|plan| plan.uses_module(&namespace));
        if dropped > 0 {
            debug!(namespace = %namespace, dropped, "invalidated cached queries");
        }
        Ok(namespace)
    }

    /// Compiles `source` without caching it.
    pub fn compile(&self, source: &str) -> XQueryResult<Arc<CompiledPlan>> {
        self.compiler.compile(source).map(Arc::new)
    }

    /// Executes `source` on `broker`.
    ///
    /// The plan comes from the cache and is checked in before this returns,
    /// whether the execution succeeded or not.
    pub fn execute(&self, broker: &Broker, source: &str, context: &DynamicContext) -> XQueryResult<Sequence> {
        let mut ticket = self.cache.checkout(source, self.compiler.as_ref())?;
        let result = ticket.execute(broker, context);
        ticket.checkin();
        if let Err(e) = &result {
            warn!(broker = %broker.id(), error = %e, "query failed");
        }
        result
    }

    /// Executes an already compiled plan.
    pub fn execute_plan(
        &self,
        plan: &Arc<CompiledPlan>,
        policy: ConflictPolicy,
        broker: &Broker,
        context: &DynamicContext,
    ) -> XQueryResult<Sequence> {
        let mut ticket = plan.checkout(policy)?;
        let result = ticket.execute(broker, context);
        ticket.checkin();
        result
    }
}

impl std::fmt::Debug for XQueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XQueryService")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
