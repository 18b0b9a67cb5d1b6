//! Plan evaluation.
//!
//! The evaluator walks a checked-out plan and writes its state into the
//! ticket's binding table as it goes:
//!
//! - function arguments at every call; a nested call of the same function
//!   restores the outer arguments when it returns
//! - the document set of every `collection()` expression, also merged into
//!   the enclosing function or variable declaration
//! - the captured variables of every function value it creates
//! - global variable values on first reference
//!
//! Cancellation and the deadline are checked at every expression node.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_broker::Broker;
use arbor_common::types::{QName, Subject};
use tracing::debug;

use crate::binding::{BindingTable, Captures, FunctionBinding};
use crate::checkout::ExecutionTicket;
use crate::error::{XQueryError, XQueryResult};
use crate::plan::{CompiledPlan, Expr, ExprId, FunctionId, VariableId};
use crate::value::{FunctionItem, Item, Sequence};

/// Deepest nesting of function calls an execution may reach.
pub const MAX_CALL_DEPTH: usize = 256;

/// Cooperative cancellation flag shared between an execution and whoever
/// may want to stop it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Caller-supplied context of one execution.
#[derive(Debug, Clone, Default)]
pub struct DynamicContext {
    subject: Subject,
    timeout: Option<Duration>,
    cancellation: CancellationToken,
    externals: HashMap<QName, Sequence>,
}

impl DynamicContext {
    /// Creates a context for `subject`.
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            ..Self::default()
        }
    }

    /// Creates a context acting as the broker's subject.
    pub fn for_broker(broker: &Broker) -> Self {
        Self::new(broker.subject().clone())
    }

    /// Limits the execution time.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Binds an external variable.
    #[must_use]
    pub fn bind(mut self, name: QName, value: impl Into<Sequence>) -> Self {
        self.externals.insert(name, value.into());
        self
    }

    /// Returns the acting subject.
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Returns the time limit.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl ExecutionTicket {
    /// Evaluates the plan's root expression.
    pub fn execute(&mut self, broker: &Broker, context: &DynamicContext) -> XQueryResult<Sequence> {
        let (plan, table) = self.parts();
        let started = Instant::now();
        let mut evaluator = Evaluator {
            plan,
            table,
            broker,
            context,
            deadline: context.timeout.and_then(|t| started.checked_add(t)),
            owners: Vec::new(),
            initializing: HashSet::new(),
            depth: 0,
        };

        let result = evaluator.eval(plan.root(), &mut Vec::new());
        debug!(
            plan = %plan.id(),
            subject = %context.subject,
            ok = result.is_ok(),
            elapsed = ?started.elapsed(),
            "plan executed"
        );
        result
    }
}

/// The declaration whose evaluation is in progress.
#[derive(Debug, Clone, Copy)]
enum Owner {
    Function(FunctionId),
    Variable(VariableId),
}

/// Local variables in scope, innermost last.
type Env = Vec<(String, Sequence)>;

struct Evaluator<'a> {
    plan: &'a CompiledPlan,
    table: &'a mut BindingTable,
    broker: &'a Broker,
    context: &'a DynamicContext,
    deadline: Option<Instant>,
    owners: Vec<Owner>,
    initializing: HashSet<VariableId>,
    depth: usize,
}

impl Evaluator<'_> {
    fn check_interrupt(&self) -> XQueryResult<()> {
        if self.context.cancellation.is_cancelled() {
            return Err(XQueryError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(XQueryError::Timeout {
                    timeout_ms: self
                        .context
                        .timeout
                        .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
                });
            }
        }
        Ok(())
    }

    fn eval(&mut self, id: ExprId, env: &mut Env) -> XQueryResult<Sequence> {
        self.check_interrupt()?;

        let plan = self.plan;
        let expr = plan
            .expr(id)
            .ok_or_else(|| XQueryError::Static(format!("no expression with index {}", id.index())))?;

        match expr {
            Expr::Literal(item) => Ok(Sequence::one(item.clone())),
            Expr::Sequence(items) => {
                let mut result = Sequence::empty();
                for &item in items {
                    result.extend(self.eval(item, env)?);
                }
                Ok(result)
            }
            Expr::Concat(args) => {
                let mut result = String::new();
                for &arg in args {
                    let value = self.eval(arg, env)?;
                    if let Some(item) = value.single()? {
                        result.push_str(&item.string_value()?);
                    }
                }
                Ok(Sequence::one(result))
            }
            Expr::LocalVar(name) => env
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| XQueryError::UnknownVariable(name.clone())),
            Expr::Let { var, value, body } => {
                let value = self.eval(*value, env)?;
                env.push((var.clone(), value));
                let result = self.eval(*body, env);
                env.pop();
                result
            }
            Expr::GlobalVar(variable) => self.global(*variable),
            Expr::Call { function, args } => {
                let args = self.eval_args(args, env)?;
                self.call(*function, args, Vec::new())
            }
            Expr::InlineFunction(function) => self.create_function(*function, env),
            Expr::DynamicCall { target, args } => {
                let target = self.eval(*target, env)?;
                let func = match target.single()? {
                    Some(Item::Function(func)) => *func,
                    _ => {
                        return Err(XQueryError::Type(
                            "dynamic call target is not a single function item".to_string(),
                        ))
                    }
                };
                if func.plan != plan.id() {
                    return Err(XQueryError::Type(
                        "function item belongs to another plan".to_string(),
                    ));
                }
                let args = self.eval_args(args, env)?;
                let captures = self
                    .function_binding(func.function)?
                    .closure(func.closure)
                    .cloned()
                    .ok_or_else(|| XQueryError::Type("function item is no longer bound".to_string()))?;
                self.call(func.function, args, captures)
            }
            Expr::Collection(uri) => {
                let uri = self.eval(*uri, env)?;
                let uri = match uri.single()? {
                    Some(item) => item.string_value()?,
                    None => return Err(XQueryError::Type("collection() needs a URI".to_string())),
                };
                self.collection(id, &uri)
            }
            Expr::Count(arg) => {
                let value = self.eval(*arg, env)?;
                Ok(Sequence::one(value.len() as i64))
            }
        }
    }

    fn eval_args(&mut self, args: &[ExprId], env: &mut Env) -> XQueryResult<Vec<Sequence>> {
        args.iter().map(|&arg| self.eval(arg, env)).collect()
    }

    fn function_binding(&mut self, function: FunctionId) -> XQueryResult<&mut FunctionBinding> {
        self.table
            .function_mut(function)
            .ok_or_else(|| XQueryError::Static(format!("no function with index {}", function.index())))
    }

    fn call(&mut self, function: FunctionId, args: Vec<Sequence>, captures: Captures) -> XQueryResult<Sequence> {
        let plan = self.plan;
        let decl = plan
            .function(function)
            .ok_or_else(|| XQueryError::Static(format!("no function with index {}", function.index())))?;

        if decl.arity() != args.len() {
            return Err(XQueryError::ArityMismatch {
                function: decl.display_name(),
                expected: decl.arity(),
                found: args.len(),
            });
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(XQueryError::RecursionLimit(MAX_CALL_DEPTH));
        }

        let mut env: Env = captures;
        env.extend(decl.params.iter().cloned().zip(args.iter().cloned()));
        let outer = self.function_binding(function)?.arguments.replace(args);

        self.owners.push(Owner::Function(function));
        self.depth += 1;
        let result = self.eval(decl.body, &mut env);
        self.depth -= 1;
        self.owners.pop();

        // The outermost call's arguments stay bound until check-in.
        if outer.is_some() {
            self.function_binding(function)?.arguments = outer;
        }
        result
    }

    fn create_function(&mut self, function: FunctionId, env: &Env) -> XQueryResult<Sequence> {
        let plan = self.plan;
        let decl = plan
            .function(function)
            .ok_or_else(|| XQueryError::Static(format!("no function with index {}", function.index())))?;

        let mut captures = Vec::with_capacity(decl.captures.len());
        for name in &decl.captures {
            let value = env
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| XQueryError::UnknownVariable(name.clone()))?;
            captures.push((name.clone(), value));
        }

        let closures = &mut self.function_binding(function)?.closures;
        closures.push(captures);
        Ok(Sequence::one(Item::Function(FunctionItem {
            plan: plan.id(),
            function,
            closure: closures.len() - 1,
        })))
    }

    fn global(&mut self, variable: VariableId) -> XQueryResult<Sequence> {
        let plan = self.plan;
        let decl = plan
            .variable(variable)
            .ok_or_else(|| XQueryError::Static(format!("no variable with index {}", variable.index())))?;

        if let Some(value) = self.table.variable(variable).and_then(|v| v.value.clone()) {
            return Ok(value);
        }

        let value = match decl.init {
            None => self
                .context
                .externals
                .get(&decl.name)
                .cloned()
                .ok_or_else(|| XQueryError::UnknownVariable(decl.name.to_string()))?,
            Some(init) => {
                if !self.initializing.insert(variable) {
                    return Err(XQueryError::Static(format!(
                        "variable ${} depends on itself",
                        decl.name
                    )));
                }
                self.owners.push(Owner::Variable(variable));
                let value = self.eval(init, &mut Vec::new());
                self.owners.pop();
                self.initializing.remove(&variable);
                value?
            }
        };

        if let Some(slot) = self.table.variable_mut(variable) {
            slot.value = Some(value.clone());
        }
        Ok(value)
    }

    fn collection(&mut self, id: ExprId, uri: &str) -> XQueryResult<Sequence> {
        let docs = self.broker.collection(uri)?;
        let result = docs.paths().into_iter().map(Item::String).collect();

        match self.owners.last().copied() {
            Some(Owner::Function(function)) => {
                let slot = &mut self.function_binding(function)?.context_docs;
                slot.get_or_insert_with(Default::default).merge(&docs);
            }
            Some(Owner::Variable(variable)) => {
                if let Some(slot) = self.table.variable_mut(variable) {
                    slot.context_docs.get_or_insert_with(Default::default).merge(&docs);
                }
            }
            None => {}
        }
        self.table.set_expr_docs(id, docs);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::ConflictPolicy;
    use crate::plan::PlanBuilder;
    use arbor_broker::ShutdownCoordinator;
    use arbor_common::config::DatabaseConfig;
    use arbor_index::NodeEvent;

    fn with_broker<R>(f: impl FnOnce(&Broker) -> R) -> R {
        let coordinator = ShutdownCoordinator::new();
        let pool = coordinator
            .configure("eval", 1, 2, DatabaseConfig::for_testing())
            .unwrap();
        let broker = pool.acquire(Subject::system(), Duration::from_secs(1)).unwrap();
        let result = f(&broker);
        drop(broker);
        coordinator.stop_all(false);
        result
    }

    fn run(plan: &Arc<CompiledPlan>, broker: &Broker, ctx: &DynamicContext) -> XQueryResult<Sequence> {
        let mut ticket = plan.checkout(ConflictPolicy::Reject)?;
        ticket.execute(broker, ctx)
    }

    #[test]
    fn test_let_and_concat() {
        let mut b = PlanBuilder::new();
        let a = b.literal("a");
        let x = b.local("x");
        let sep = b.literal("-");
        let concat = b.concat(vec![x, sep, x]);
        let root = b.let_binding("x", a, concat);
        let plan = Arc::new(b.build(root).unwrap());

        with_broker(|broker| {
            let result = run(&plan, broker, &DynamicContext::for_broker(broker)).unwrap();
            assert_eq!(result.to_string(), "a-a");
        });
    }

    #[test]
    fn test_unbound_local_is_an_error() {
        let mut b = PlanBuilder::new();
        let root = b.local("missing");
        let plan = Arc::new(b.build(root).unwrap());

        with_broker(|broker| {
            let result = run(&plan, broker, &DynamicContext::default());
            assert!(matches!(result, Err(XQueryError::UnknownVariable(name)) if name == "missing"));
            assert!(plan.bindings_pristine());
        });
    }

    #[test]
    fn test_nested_call_restores_arguments() {
        // declare function f($g, $v) { $g($v) };
        // f(function($x) { f(function($y) { $y }, concat($x, "!")) }, "a")
        let mut b = PlanBuilder::new();
        let main = b.main_module();
        let f = b
            .declare_function(main, QName::local("f"), vec!["g".to_string(), "v".to_string()])
            .unwrap();
        let g = b.local("g");
        let v = b.local("v");
        let body = b.dynamic_call(g, vec![v]);
        b.define_function(f, body).unwrap();

        let y = b.local("y");
        let identity = b.inline_function(main, vec!["y".to_string()], y);
        let x = b.local("x");
        let bang = b.literal("!");
        let exclaim = b.concat(vec![x, bang]);
        let inner_call = b.call(f, vec![identity, exclaim]).unwrap();
        let outer_fn = b.inline_function(main, vec!["x".to_string()], inner_call);
        let a = b.literal("a");
        let root = b.call(f, vec![outer_fn, a]).unwrap();
        let plan = Arc::new(b.build(root).unwrap());

        with_broker(|broker| {
            let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
            let result = ticket.execute(broker, &DynamicContext::default()).unwrap();
            assert_eq!(result.to_string(), "a!");

            // The outer call's arguments, not the inner one's.
            let args = ticket.bindings().function(f).unwrap().arguments.clone().unwrap();
            assert_eq!(args[1], Sequence::one("a"));
            ticket.checkin();
            assert!(plan.bindings_pristine());
        });
    }

    #[test]
    fn test_collection_records_documents() {
        let mut b = PlanBuilder::new();
        let main = b.main_module();
        let f = b.declare_function(main, QName::local("docs"), Vec::new()).unwrap();
        let uri = b.literal("/db/books");
        let collection = b.collection(uri);
        b.define_function(f, collection).unwrap();
        let call = b.call(f, Vec::new()).unwrap();
        let root = b.count(call);
        let plan = Arc::new(b.build(root).unwrap());

        with_broker(|broker| {
            let events = [NodeEvent::start("book"), NodeEvent::text("t"), NodeEvent::end("book")];
            broker.store_document("/db/books/a.xml", &events).unwrap();
            broker.store_document("/db/books/b.xml", &events).unwrap();
            broker.store_document("/db/other/c.xml", &events).unwrap();

            let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
            let result = ticket.execute(broker, &DynamicContext::default()).unwrap();
            assert_eq!(result, Sequence::one(2));

            let table = ticket.bindings();
            assert_eq!(table.expr_docs(collection).unwrap().len(), 2);
            assert_eq!(table.function(f).unwrap().context_docs.as_ref().unwrap().len(), 2);
        });
    }

    #[test]
    fn test_external_variable() {
        let mut b = PlanBuilder::new();
        let main = b.main_module();
        let name = QName::local("name");
        let var = b.declare_variable(main, name.clone(), None).unwrap();
        let root = b.global(var);
        let plan = Arc::new(b.build(root).unwrap());

        with_broker(|broker| {
            let result = run(&plan, broker, &DynamicContext::default());
            assert!(matches!(result, Err(XQueryError::UnknownVariable(_))));

            let ctx = DynamicContext::default().bind(name, Sequence::one("bound"));
            assert_eq!(run(&plan, broker, &ctx).unwrap(), Sequence::one("bound"));
        });
    }

    #[test]
    fn test_self_referencing_variable() {
        // declare variable $v := $v; $v
        let mut b = PlanBuilder::new();
        let main = b.main_module();
        let self_ref = b.global(VariableId::from_index(0));
        let var = b.declare_variable(main, QName::local("v"), Some(self_ref)).unwrap();
        assert_eq!(var.index(), 0);
        let root = b.global(var);
        let plan = Arc::new(b.build(root).unwrap());

        with_broker(|broker| {
            let result = run(&plan, broker, &DynamicContext::default());
            assert!(matches!(result, Err(XQueryError::Static(_))));
            assert!(plan.bindings_pristine());
        });
    }

    #[test]
    fn test_runaway_recursion_stops() {
        // declare function loop($f) { $f($f) }; loop(function($g) { loop($g) })
        let mut b = PlanBuilder::new();
        let main = b.main_module();
        let looping = b
            .declare_function(main, QName::local("loop"), vec!["f".to_string()])
            .unwrap();
        let f = b.local("f");
        let f2 = b.local("f");
        let body = b.dynamic_call(f, vec![f2]);
        b.define_function(looping, body).unwrap();
        let g = b.local("g");
        let again = b.call(looping, vec![g]).unwrap();
        let func = b.inline_function(main, vec!["g".to_string()], again);
        let root = b.call(looping, vec![func]).unwrap();
        let plan = Arc::new(b.build(root).unwrap());

        let handle = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(move || {
                with_broker(|broker| {
                    let result = run(&plan, broker, &DynamicContext::default());
                    assert!(matches!(result, Err(XQueryError::RecursionLimit(MAX_CALL_DEPTH))));
                    assert!(plan.bindings_pristine());
                })
            })
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut b = PlanBuilder::new();
        let root = b.literal(1);
        let plan = Arc::new(b.build(root).unwrap());
        let token = CancellationToken::new();
        token.cancel();

        with_broker(|broker| {
            let ctx = DynamicContext::default().with_cancellation(token);
            assert!(matches!(run(&plan, broker, &ctx), Err(XQueryError::Cancelled)));
            assert!(plan.bindings_pristine());
        });
    }

    #[test]
    fn test_timeout() {
        let mut b = PlanBuilder::new();
        let root = b.literal(1);
        let plan = Arc::new(b.build(root).unwrap());

        with_broker(|broker| {
            let ctx = DynamicContext::default().with_timeout(Duration::ZERO);
            assert!(matches!(
                run(&plan, broker, &ctx),
                Err(XQueryError::Timeout { timeout_ms: 0 })
            ));
        });
    }
}
