//! Binding cleanup tests.
//!
//! Run real queries through the plan cache and check that nothing an
//! execution bound survives its check-in.

use std::thread;
use std::time::Duration;

use arbor_common::config::{PlanConflictMode, QueryConfig};
use arbor_common::types::{DocumentId, DocumentSet, QName};
use arbor_test::utils::{test_qname, TestDb, TEST_INLINE, TEST_QUERY};
use arbor_xquery::{
    CancellationToken, ConflictPolicy, DynamicContext, Item, Sequence, XQueryError,
};

#[test]
fn test_unused_declarations_reset() {
    let db = TestDb::new(1, 2);

    let result = db.run(TEST_QUERY).unwrap();
    assert_eq!(result.to_string(), "Hello world");

    let plan = db.cached_plan(TEST_QUERY);
    let test = plan.find_function(&test_qname("test"), 1).unwrap();
    let unused = plan.find_function(&test_qname("unused"), 1).unwrap();
    let inline = plan.find_function(&test_qname("inline"), 1).unwrap();
    let var = plan.find_variable(&test_qname("VAR")).unwrap();

    // Leave state on the declarations this query never touches, the way a
    // previous execution taking other paths would.
    let broker = db.broker();
    let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
    {
        let table = ticket.bindings_mut();
        table.function_mut(unused).unwrap().arguments = Some(vec![Sequence::one("stale")]);
        table.function_mut(inline).unwrap().context_docs = Some(DocumentSet::new());
        let body = plan.function(unused).unwrap().body;
        let mut docs = DocumentSet::new();
        docs.insert(DocumentId::new(7), "/db/test/stale.xml");
        table.set_expr_docs(body, docs);
        table.variable_mut(var).unwrap().value = Some(Sequence::one(123));
    }
    let result = ticket
        .execute(&broker, &DynamicContext::for_broker(&broker))
        .unwrap();
    assert_eq!(result.to_string(), "Hello world");
    assert!(ticket.bindings().function(test).unwrap().arguments.is_some());
    ticket.checkin();

    plan.inspect_bindings(|table| {
        for function in [test, unused, inline] {
            assert!(table.function(function).unwrap().is_unset());
        }
        assert!(table.variable(var).unwrap().is_unset());
        assert_eq!(table.bound_slots(), 0);
    })
    .unwrap();
    assert!(plan.bindings_pristine());
}

#[test]
fn test_global_variable_value_reset() {
    let db = TestDb::new(1, 2);
    let query = "import module namespace t=\"http://exist-db.org/test\"; $t:VAR, t:test($t:VAR)";

    let result = db.run(query).unwrap();
    assert_eq!(result.to_string(), "123 123");

    let plan = db.cached_plan(query);
    let var = plan.find_variable(&test_qname("VAR")).unwrap();
    assert!(plan.inspect_bindings(|t| t.variable(var).unwrap().value.is_none()).unwrap());
    assert!(plan.bindings_pristine());
}

#[test]
fn test_uninvoked_closure_reset() {
    let db = TestDb::new(1, 2);
    db.run(TEST_INLINE).unwrap();
    let plan = db.cached_plan(TEST_INLINE);
    let inline = plan.inline_functions()[0];

    let broker = db.broker();
    let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
    let result = ticket
        .execute(&broker, &DynamicContext::for_broker(&broker))
        .unwrap();

    let Some(Item::Function(value)) = result.single().unwrap() else {
        panic!("expected a function item, got {result}");
    };
    assert_eq!(value.function, inline);
    let captures = ticket
        .bindings()
        .function(inline)
        .unwrap()
        .closure(value.closure)
        .cloned()
        .unwrap();
    assert_eq!(captures, vec![("a".to_string(), Sequence::one("a"))]);
    ticket.checkin();

    plan.inspect_bindings(|table| {
        assert!(table.function(inline).unwrap().closure(value.closure).is_none());
        assert!(table.is_pristine());
    })
    .unwrap();
}

#[test]
fn test_closure_from_library_function_reset() {
    let db = TestDb::new(1, 2);
    let query = "import module namespace t=\"http://exist-db.org/test\"; \
                 let $f := t:inline('x') return $f()";

    assert_eq!(db.run(query).unwrap().to_string(), "x");
    assert!(db.cached_plan(query).bindings_pristine());
}

#[test]
fn test_collection_context_reset() {
    let db = TestDb::new(1, 2);
    db.store_documents("/db/test", 3);
    db.store_documents("/db/other", 2);

    let query = "declare variable $docs := collection('/db/test'); \
                 declare function local:docs($uri) { collection($uri) }; \
                 count($docs), count(local:docs('/db/other'))";
    let plan = db.service.compile(query).unwrap();

    let broker = db.broker();
    let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
    let result = ticket
        .execute(&broker, &DynamicContext::for_broker(&broker))
        .unwrap();
    assert_eq!(result.to_string(), "3 2");

    let docs = plan.find_variable(&QName::local("docs")).unwrap();
    let function = plan
        .find_function(&QName::new(arbor_xquery::parser::LOCAL_NAMESPACE, "docs"), 1)
        .unwrap();
    let table = ticket.bindings();
    assert_eq!(table.variable(docs).unwrap().context_docs.as_ref().unwrap().len(), 3);
    assert_eq!(table.function(function).unwrap().context_docs.as_ref().unwrap().len(), 2);
    assert!(table.bound_slots() > 0);

    ticket.checkin();
    assert!(plan.bindings_pristine());
}

#[test]
fn test_reuse_matches_fresh_plan() {
    let db = TestDb::new(1, 2);
    let query = "declare variable $who external; \
                 declare function local:greet($w) { 'Hello ' || $w }; \
                 local:greet($who)";
    let who = QName::local("who");
    let broker = db.broker();

    let mut results = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let context = DynamicContext::for_broker(&broker).bind(who.clone(), Sequence::one(name));
        results.push(db.service.execute(&broker, query, &context).unwrap().to_string());

        // A freshly compiled plan gives the same answer.
        let fresh = db.service.compile(query).unwrap();
        let expected = db
            .service
            .execute_plan(&fresh, ConflictPolicy::Reject, &broker, &context)
            .unwrap();
        assert_eq!(results.last().unwrap(), &expected.to_string());
    }

    assert_eq!(results, vec!["Hello alice", "Hello bob", "Hello carol"]);
    assert_eq!(db.service.cache().stats().compilations(), 1);
    assert!(db.cached_plan(query).bindings_pristine());
}

#[test]
fn test_failed_execution_resets() {
    let db = TestDb::new(1, 2);
    let query = "declare function local:f($a) { concat($a, function() { $a }) }; local:f('x')";

    assert!(matches!(db.run(query), Err(XQueryError::Type(_))));
    assert!(db.cached_plan(query).bindings_pristine());
}

#[test]
fn test_cancelled_execution_resets() {
    let db = TestDb::new(1, 2);
    let plan = db.service.compile(TEST_QUERY).unwrap();
    let broker = db.broker();

    let token = CancellationToken::new();
    token.cancel();
    let context = DynamicContext::for_broker(&broker).with_cancellation(token);
    let result = db
        .service
        .execute_plan(&plan, ConflictPolicy::Reject, &broker, &context);
    assert!(matches!(result, Err(XQueryError::Cancelled)));
    assert!(plan.bindings_pristine());
}

#[test]
fn test_panicking_execution_resets() {
    let db = TestDb::new(1, 2);
    let plan = db.service.compile(TEST_QUERY).unwrap();

    let worker = {
        let plan = plan.clone();
        let broker = db.broker().into_inner().unwrap();
        let pool = db.pool.clone();
        thread::spawn(move || {
            let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
            ticket
                .execute(&broker, &DynamicContext::for_broker(&broker))
                .unwrap();
            pool.release(broker).unwrap();
            panic!("execution aborted");
        })
    };
    assert!(worker.join().is_err());

    assert!(!plan.is_checked_out());
    assert!(plan.bindings_pristine());
}

#[test]
fn test_concurrent_cached_executions() {
    let db = TestDb::with_query_config(
        2,
        6,
        QueryConfig {
            conflict_mode: PlanConflictMode::Recompile,
            max_plan_copies: 3,
            ..QueryConfig::default()
        },
    );
    let query = "import module namespace t=\"http://exist-db.org/test\"; \
                 declare variable $n external; \
                 t:test($n)";

    thread::scope(|scope| {
        for worker in 0..6 {
            let db = &db;
            scope.spawn(move || {
                let broker = db.broker();
                for round in 0..25 {
                    let n = worker * 1000 + round;
                    let context =
                        DynamicContext::for_broker(&broker).bind(QName::local("n"), Sequence::one(n));
                    let result = db.service.execute(&broker, query, &context).unwrap();
                    assert_eq!(result, Sequence::one(n));
                }
            });
        }
    });

    let plans = db.service.cache().plans(query);
    assert!(!plans.is_empty() && plans.len() <= 3);
    for plan in plans {
        assert!(plan.bindings_pristine());
    }
}

#[test]
fn test_waiting_checkout_sees_clean_plan() {
    let db = TestDb::with_query_config(
        1,
        2,
        QueryConfig {
            conflict_mode: PlanConflictMode::Wait,
            checkout_wait_ms: 5_000,
            ..QueryConfig::default()
        },
    );
    db.run(TEST_QUERY).unwrap();
    let plan = db.cached_plan(TEST_QUERY);

    let held = plan.checkout(ConflictPolicy::Reject).unwrap();
    thread::scope(|scope| {
        let waiter = scope.spawn(|| db.run(TEST_QUERY));
        thread::sleep(Duration::from_millis(50));
        held.checkin();
        assert_eq!(waiter.join().unwrap().unwrap().to_string(), "Hello world");
    });
    assert_eq!(db.service.cache().copies(TEST_QUERY), 1);
    assert!(plan.bindings_pristine());
}
