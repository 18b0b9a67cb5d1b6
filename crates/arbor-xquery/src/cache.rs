//! Compiled plan cache.
//!
//! Keeps compiled plans keyed by normalized query source so repeated
//! queries skip compilation. A source may have several compiled copies;
//! each copy serves one execution at a time, so concurrent executions of
//! the same query either find a free copy or fall back to the configured
//! [`PlanConflictMode`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_common::config::{PlanConflictMode, QueryConfig};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::checkout::{ConflictPolicy, ExecutionTicket};
use crate::error::{XQueryError, XQueryResult};
use crate::plan::CompiledPlan;
use crate::service::QueryCompiler;

/// Counters for plan cache activity.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
    conflicts: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Checkouts served by a cached copy.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Checkouts for a source with no cached entry.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Plans compiled by the cache.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Checkouts that found every cached copy busy.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Entries evicted to stay within the bound.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Returns the hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits() + self.misses() + self.conflicts();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    /// Resets all counters.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.compilations.store(0, Ordering::Relaxed);
        self.conflicts.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

impl Clone for CacheStats {
    fn clone(&self) -> Self {
        Self {
            hits: AtomicU64::new(self.hits()),
            misses: AtomicU64::new(self.misses()),
            compilations: AtomicU64::new(self.compilations()),
            conflicts: AtomicU64::new(self.conflicts()),
            evictions: AtomicU64::new(self.evictions()),
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, conflicts: {}, hit_ratio: {:.2}%, compilations: {}, evictions: {} }}",
            self.hits(),
            self.misses(),
            self.conflicts(),
            self.hit_ratio() * 100.0,
            self.compilations(),
            self.evictions()
        )
    }
}

/// The compiled copies of one query source.
#[derive(Debug)]
struct CacheEntry {
    copies: Vec<Arc<CompiledPlan>>,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl CacheEntry {
    fn new(plan: Arc<CompiledPlan>) -> Self {
        let now = Instant::now();
        Self {
            copies: vec![plan],
            created_at: now,
            last_used: now,
            use_count: 1,
        }
    }

    fn record_use(&mut self) {
        self.use_count += 1;
        self.last_used = Instant::now();
    }

    fn free_copy(&self) -> Option<ExecutionTicket> {
        self.copies.iter().find_map(CompiledPlan::try_checkout)
    }
}

/// Summary of one cached source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedQuery {
    /// Normalized source.
    pub key: String,
    /// Compiled copies held.
    pub copies: usize,
    /// Copies currently checked out.
    pub busy: usize,
    /// Checkouts served for this source.
    pub use_count: u64,
    /// Time since the first copy was cached.
    pub age: Duration,
}

/// Cache of compiled plans.
///
/// # Example
///
/// ```rust
/// use arbor_common::config::QueryConfig;
/// use arbor_xquery::cache::PlanCache;
/// use arbor_xquery::parser::XQueryCompiler;
///
/// let compiler = XQueryCompiler::new();
/// let cache = PlanCache::new(QueryConfig::default());
///
/// let ticket = cache.checkout("'a' || 'b'", &compiler).unwrap();
/// ticket.checkin();
///
/// // Whitespace outside string literals does not matter.
/// let ticket = cache.checkout("'a'   ||\n'b'", &compiler).unwrap();
/// ticket.checkin();
/// assert_eq!(cache.stats().hits(), 1);
/// ```
#[derive(Debug)]
pub struct PlanCache {
    config: QueryConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    stats: CacheStats,
}

impl PlanCache {
    /// Creates an empty cache.
    pub fn new(config: QueryConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            stats: CacheStats::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Checks out a plan for `source`, compiling it if needed.
    ///
    /// A free cached copy is preferred. When every copy is busy the
    /// configured [`PlanConflictMode`] decides between compiling another
    /// copy, waiting for one, or failing with
    /// [`XQueryError::PlanCheckoutConflict`].
    pub fn checkout(&self, source: &str, compiler: &dyn QueryCompiler) -> XQueryResult<ExecutionTicket> {
        let key = normalize_query(source);

        let busy = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.record_use();
                    if let Some(ticket) = entry.free_copy() {
                        CacheStats::record(&self.stats.hits);
                        trace!(plan = %ticket.plan().id(), "plan cache hit");
                        return Ok(ticket);
                    }
                    entry.copies.first().cloned()
                }
                None => None,
            }
        };

        let Some(busy) = busy else {
            CacheStats::record(&self.stats.misses);
            return self.compile_and_insert(key, source, compiler);
        };

        CacheStats::record(&self.stats.conflicts);
        match self.config.conflict_mode {
            PlanConflictMode::Recompile => {
                debug!(plan = %busy.id(), "cached plan busy, compiling another copy");
                self.compile_and_insert(key, source, compiler)
            }
            PlanConflictMode::Wait => {
                debug!(plan = %busy.id(), "cached plan busy, waiting");
                busy.checkout(ConflictPolicy::Wait(self.config.checkout_wait()))
            }
            PlanConflictMode::Reject => Err(XQueryError::PlanCheckoutConflict(busy.id())),
        }
    }

    /// Compiles `source`, checks the new plan out and caches it if the
    /// entry has room. Otherwise the plan serves this execution only.
    fn compile_and_insert(
        &self,
        key: String,
        source: &str,
        compiler: &dyn QueryCompiler,
    ) -> XQueryResult<ExecutionTicket> {
        let plan = Arc::new(compiler.compile(source)?);
        CacheStats::record(&self.stats.compilations);
        let ticket = plan.checkout(ConflictPolicy::Reject)?;

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            if entry.copies.len() < self.config.max_plan_copies {
                entry.copies.push(plan);
            } else {
                trace!(plan = %plan.id(), "plan copy limit reached, not caching");
            }
            return Ok(ticket);
        }

        if entries.len() >= self.config.max_cached_queries {
            Self::evict_lru(&mut entries);
            CacheStats::record(&self.stats.evictions);
        }
        entries.insert(key, CacheEntry::new(plan));
        Ok(ticket)
    }

    fn evict_lru(entries: &mut HashMap<String, CacheEntry>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            trace!(query = %key, "evicting cached query");
            entries.remove(&key);
        }
    }

    /// Removes the cached copies of `source`.
    ///
    /// Executions holding a copy finish normally.
    pub fn remove(&self, source: &str) -> bool {
        self.entries.lock().remove(&normalize_query(source)).is_some()
    }

    /// Removes every entry whose normalized source matches `predicate`.
    /// Returns the number of entries removed.
    pub fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        before - entries.len()
    }

    /// Removes every entry with a cached copy matching `predicate`.
    /// Returns the number of entries removed.
    pub fn invalidate_plans<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CompiledPlan) -> bool,
    {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.copies.iter().any(|plan| predicate(plan)));
        before - entries.len()
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Returns the number of cached sources.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns the number of cached copies of `source`.
    pub fn copies(&self, source: &str) -> usize {
        self.entries
            .lock()
            .get(&normalize_query(source))
            .map_or(0, |entry| entry.copies.len())
    }

    /// Returns the cached plans of `source`.
    pub fn plans(&self, source: &str) -> Vec<Arc<CompiledPlan>> {
        self.entries
            .lock()
            .get(&normalize_query(source))
            .map(|entry| entry.copies.clone())
            .unwrap_or_default()
    }

    /// Describes every cached source, most recently used first.
    pub fn entries(&self) -> Vec<CachedQuery> {
        let entries = self.entries.lock();
        let mut summary: Vec<_> = entries
            .iter()
            .map(|(key, entry)| {
                (
                    entry.last_used,
                    CachedQuery {
                        key: key.clone(),
                        copies: entry.copies.len(),
                        busy: entry.copies.iter().filter(|p| p.is_checked_out()).count(),
                        use_count: entry.use_count,
                        age: entry.created_at.elapsed(),
                    },
                )
            })
            .collect();
        summary.sort_by(|a, b| b.0.cmp(&a.0));
        summary.into_iter().map(|(_, query)| query).collect()
    }

    /// Returns the counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Collapses runs of whitespace outside string literals into one space and
/// trims the ends. String literal contents are kept verbatim.
pub fn normalize_query(source: &str) -> String {
    let mut normalized = String::with_capacity(source.len());
    let mut quote = None;
    let mut pending_space = false;

    for c in source.chars() {
        match quote {
            Some(q) => {
                normalized.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !normalized.is_empty() {
                    normalized.push(' ');
                }
                pending_space = false;
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
                normalized.push(c);
            }
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crate::parser::XQueryCompiler;

    fn config(mode: PlanConflictMode) -> QueryConfig {
        QueryConfig {
            conflict_mode: mode,
            checkout_wait_ms: 50,
            ..QueryConfig::default()
        }
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  1 ,\n\t2  "), "1 , 2");
        assert_eq!(normalize_query("'a   b'  || \"c  d\""), "'a   b' || \"c  d\"");
        // Case is significant.
        assert_ne!(normalize_query("$A"), normalize_query("$a"));
    }

    #[test]
    fn test_hit_after_checkin() {
        let compiler = XQueryCompiler::new();
        let cache = PlanCache::new(QueryConfig::default());

        let first = cache.checkout("1", &compiler).unwrap();
        let id = first.plan().id();
        first.checkin();

        let second = cache.checkout(" 1 ", &compiler).unwrap();
        assert_eq!(second.plan().id(), id);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().compilations(), 1);
    }

    #[test]
    fn test_recompile_on_conflict() {
        let compiler = XQueryCompiler::new();
        let cache = PlanCache::new(config(PlanConflictMode::Recompile));

        let a = cache.checkout("1", &compiler).unwrap();
        let b = cache.checkout("1", &compiler).unwrap();
        assert_ne!(a.plan().id(), b.plan().id());
        assert_eq!(cache.copies("1"), 2);
        assert_eq!(cache.stats().conflicts(), 1);

        a.checkin();
        b.checkin();
        let c = cache.checkout("1", &compiler).unwrap();
        assert!(cache.plans("1").iter().any(|p| p.id() == c.plan().id()));
    }

    #[test]
    fn test_copy_limit() {
        let compiler = XQueryCompiler::new();
        let cache = PlanCache::new(QueryConfig {
            max_plan_copies: 1,
            ..config(PlanConflictMode::Recompile)
        });

        let a = cache.checkout("1", &compiler).unwrap();
        let transient = cache.checkout("1", &compiler).unwrap();
        assert_eq!(cache.copies("1"), 1);
        assert_ne!(a.plan().id(), transient.plan().id());
    }

    #[test]
    fn test_reject_on_conflict() {
        let compiler = XQueryCompiler::new();
        let cache = PlanCache::new(config(PlanConflictMode::Reject));

        let held = cache.checkout("1", &compiler).unwrap();
        let err = cache.checkout("1", &compiler).unwrap_err();
        assert!(matches!(err, XQueryError::PlanCheckoutConflict(id) if id == held.plan().id()));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_wait_on_conflict() {
        let compiler = Arc::new(XQueryCompiler::new());
        let cache = Arc::new(PlanCache::new(QueryConfig {
            checkout_wait_ms: 5_000,
            ..config(PlanConflictMode::Wait)
        }));

        let held = cache.checkout("1", compiler.as_ref()).unwrap();
        let id = held.plan().id();

        let waiter = {
            let cache = Arc::clone(&cache);
            let compiler = Arc::clone(&compiler);
            thread::spawn(move || {
                let ticket = cache.checkout("1", compiler.as_ref()).unwrap();
                ticket.plan().id()
            })
        };

        thread::sleep(Duration::from_millis(50));
        held.checkin();
        assert_eq!(waiter.join().unwrap(), id);
        assert_eq!(cache.copies("1"), 1);
    }

    #[test]
    fn test_wait_times_out() {
        let compiler = XQueryCompiler::new();
        let cache = PlanCache::new(config(PlanConflictMode::Wait));

        let _held = cache.checkout("1", &compiler).unwrap();
        assert!(matches!(
            cache.checkout("1", &compiler),
            Err(XQueryError::CheckoutTimeout { timeout_ms: 50, .. })
        ));
    }

    #[test]
    fn test_lru_eviction() {
        let compiler = XQueryCompiler::new();
        let cache = PlanCache::new(QueryConfig {
            max_cached_queries: 2,
            ..QueryConfig::default()
        });

        cache.checkout("1", &compiler).unwrap().checkin();
        thread::sleep(Duration::from_millis(2));
        cache.checkout("2", &compiler).unwrap().checkin();
        thread::sleep(Duration::from_millis(2));
        // Touch "1" so "2" is the least recently used.
        cache.checkout("1", &compiler).unwrap().checkin();
        thread::sleep(Duration::from_millis(2));
        cache.checkout("3", &compiler).unwrap().checkin();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.copies("2"), 0);
        assert_eq!(cache.copies("1"), 1);
        assert_eq!(cache.stats().evictions(), 1);
        assert_eq!(cache.entries()[0].key, "3");
    }

    #[test]
    fn test_compile_errors_not_cached() {
        let compiler = XQueryCompiler::new();
        let cache = PlanCache::new(QueryConfig::default());

        assert!(cache.checkout("$undeclared", &compiler).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().compilations(), 0);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let compiler = XQueryCompiler::new();
        let cache = PlanCache::new(QueryConfig::default());

        cache.checkout("'a'", &compiler).unwrap().checkin();
        cache.checkout("'b'", &compiler).unwrap().checkin();
        assert_eq!(cache.invalidate_where(|q| q.contains('a')), 1);
        assert!(cache.remove("'b'"));
        assert!(!cache.remove("'b'"));

        cache.checkout("'c'", &compiler).unwrap().checkin();
        cache.clear();
        assert!(cache.is_empty());
    }
}
