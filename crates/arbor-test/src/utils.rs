use std::sync::{Arc, Once};
use std::time::Duration;

use arbor_broker::{BrokerPool, PooledBroker, ShutdownCoordinator};
use arbor_common::config::{DatabaseConfig, QueryConfig};
use arbor_common::types::{QName, Subject};
use arbor_index::NodeEvent;
use arbor_xquery::{CompiledPlan, DynamicContext, Sequence, XQueryResult, XQueryService};

/// Namespace of [`TEST_MODULE`].
pub const TEST_MODULE_NS: &str = "http://exist-db.org/test";

/// A library module with one function the test query calls, one it never
/// calls, a global variable and a function returning a closure.
pub const TEST_MODULE: &str = r#"
xquery version "3.1";

module namespace t="http://exist-db.org/test";

declare variable $t:VAR := 123;

declare function t:test($a) {
    $a
};

declare function t:unused($a) {
    $a
};

declare function t:inline($a) {
    function() {
        $a
    }
};
"#;

/// Calls only `t:test`.
pub const TEST_QUERY: &str = r#"
import module namespace t="http://exist-db.org/test" at "xmldb:exist:///db/test/test-module.xql";

t:test('Hello world')
"#;

/// Returns an inline function that closes over `$a` without calling it.
pub const TEST_INLINE: &str = r#"
let $a := "a"
let $func := function() {
    $a
}
return
    $func
"#;

/// Returns a name in the test module namespace.
pub fn test_qname(local: &str) -> QName {
    QName::new(TEST_MODULE_NS, local).with_prefix("t")
}

/// Installs a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One pool and one query service behind a coordinator.
pub struct TestDb {
    /// Owns the pool.
    pub coordinator: ShutdownCoordinator,
    /// The pool.
    pub pool: Arc<BrokerPool>,
    /// Query service with [`TEST_MODULE`] registered.
    pub service: XQueryService,
}

impl TestDb {
    /// Creates a pool with the given bounds and the default query settings.
    pub fn new(min: usize, max: usize) -> Self {
        Self::with_query_config(min, max, QueryConfig::default())
    }

    /// Creates a pool with the given bounds and query settings.
    pub fn with_query_config(min: usize, max: usize, query: QueryConfig) -> Self {
        init_tracing();
        let coordinator = ShutdownCoordinator::new();
        let config = DatabaseConfig {
            query: query.clone(),
            ..DatabaseConfig::for_testing()
        };
        let pool = coordinator
            .configure("test", min, max, config)
            .expect("pool configuration");
        let service = XQueryService::new(query);
        service.register_module(TEST_MODULE).expect("test module");
        Self {
            coordinator,
            pool,
            service,
        }
    }

    /// Acquires a broker acting as the system subject.
    pub fn broker(&self) -> PooledBroker {
        self.pool
            .acquire(Subject::system(), Duration::from_secs(5))
            .expect("broker")
    }

    /// Runs a query through the plan cache.
    pub fn run(&self, query: &str) -> XQueryResult<Sequence> {
        let broker = self.broker();
        let context = DynamicContext::for_broker(&broker);
        self.service.execute(&broker, query, &context)
    }

    /// Returns the single cached plan of `query`.
    pub fn cached_plan(&self, query: &str) -> Arc<CompiledPlan> {
        let plans = self.service.cache().plans(query);
        assert_eq!(plans.len(), 1, "expected one cached copy");
        Arc::clone(&plans[0])
    }

    /// Stores `count` small documents under `collection`.
    pub fn store_documents(&self, collection: &str, count: usize) {
        let broker = self.broker();
        for i in 0..count {
            let events = [
                NodeEvent::start("doc"),
                NodeEvent::text(&format!("document {i}")),
                NodeEvent::end("doc"),
            ];
            broker
                .store_document(&format!("{collection}/doc{i}.xml"), &events)
                .expect("store document");
        }
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        self.coordinator.stop_all(false);
    }
}
