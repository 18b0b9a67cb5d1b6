//! Plan checkout and check-in.
//!
//! A plan's [`BindingTable`] is lent to one execution at a time. Checking
//! out takes the table out of the plan; the [`ExecutionTicket`] owns it for
//! the duration of the execution and puts it back on check-in, after the
//! reset traversal has cleared every slot. Check-in also runs when the ticket
//! is dropped, so an execution that fails, panics or is abandoned mid-way
//! still leaves the plan clean.
//!
//! The reset walks the plan's static declarations, not the path the
//! execution took: every module, starting at the main module and following
//! imports, with all its functions (bodies included) and variables, then the
//! root expression. A function that was never called still gets its slots
//! cleared, and so does an inline function whose values were created but
//! never invoked.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::binding::BindingTable;
use crate::error::{XQueryError, XQueryResult};
use crate::plan::{CompiledPlan, Expr, ExprId, FunctionId, ModuleId, VariableId};

/// What to do when the plan is already checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Block until the plan is checked in or the timeout elapses.
    Wait(Duration),
    /// Fail immediately with [`XQueryError::PlanCheckoutConflict`].
    Reject,
}

impl CompiledPlan {
    /// Checks the plan out for one execution.
    pub fn checkout(self: &Arc<Self>, policy: ConflictPolicy) -> XQueryResult<ExecutionTicket> {
        let mut slot = self.bindings.lock();
        if slot.is_none() {
            match policy {
                ConflictPolicy::Reject => {
                    debug!(plan = %self.id(), "plan busy, rejecting checkout");
                    return Err(XQueryError::PlanCheckoutConflict(self.id()));
                }
                ConflictPolicy::Wait(timeout) => {
                    let deadline = Instant::now().checked_add(timeout);
                    while slot.is_none() {
                        let Some(deadline) = deadline else {
                            self.checked_in.wait(&mut slot);
                            continue;
                        };
                        if self.checked_in.wait_until(&mut slot, deadline).timed_out() && slot.is_none() {
                            debug!(plan = %self.id(), ?timeout, "plan checkout timed out");
                            return Err(XQueryError::CheckoutTimeout {
                                plan: self.id(),
                                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                            });
                        }
                    }
                }
            }
        }

        match slot.take() {
            Some(table) => {
                drop(slot);
                trace!(plan = %self.id(), "plan checked out");
                Ok(ExecutionTicket {
                    plan: Arc::clone(self),
                    table: Some(table),
                    checked_out_at: Instant::now(),
                })
            }
            None => Err(XQueryError::PlanCheckoutConflict(self.id())),
        }
    }

    /// Checks the plan out if it is free.
    pub fn try_checkout(self: &Arc<Self>) -> Option<ExecutionTicket> {
        self.checkout(ConflictPolicy::Reject).ok()
    }

    /// Returns true while an execution holds the plan.
    pub fn is_checked_out(&self) -> bool {
        self.bindings.lock().is_none()
    }

    /// Runs `f` on the binding table of a checked-in plan.
    ///
    /// Returns `None` while the plan is checked out.
    pub fn inspect_bindings<R>(&self, f: impl FnOnce(&BindingTable) -> R) -> Option<R> {
        self.bindings.lock().as_ref().map(f)
    }

    /// Returns true if the plan is checked in and every slot is unset.
    pub fn bindings_pristine(&self) -> bool {
        self.inspect_bindings(BindingTable::is_pristine).unwrap_or(false)
    }

    fn checkin_table(&self, mut table: BindingTable, held_for: Duration) {
        let cleared = self.reset(&mut table);

        // Expressions attached to no declaration are not walked.
        if !table.is_pristine() {
            let leaked = table.clear_all();
            error!(
                plan = %self.id(),
                leaked,
                "bindings survived the reset traversal; cleared"
            );
        }

        let mut slot = self.bindings.lock();
        *slot = Some(table);
        self.checked_in.notify_one();
        drop(slot);

        debug!(plan = %self.id(), cleared, ?held_for, "plan checked in");
    }

    /// Clears every slot reachable from the plan's declarations. Returns the
    /// number of slots that were set.
    fn reset(&self, table: &mut BindingTable) -> usize {
        let mut reset = Reset {
            plan: self,
            table,
            seen_modules: HashSet::new(),
            seen_functions: HashSet::new(),
            seen_exprs: HashSet::new(),
            cleared: 0,
        };
        reset.module(self.main_module());
        for (id, _) in self.modules() {
            reset.module(id);
        }
        reset.expr(self.root());
        reset.cleared
    }
}

struct Reset<'a> {
    plan: &'a CompiledPlan,
    table: &'a mut BindingTable,
    seen_modules: HashSet<ModuleId>,
    seen_functions: HashSet<FunctionId>,
    seen_exprs: HashSet<ExprId>,
    cleared: usize,
}

impl Reset<'_> {
    fn module(&mut self, id: ModuleId) {
        if !self.seen_modules.insert(id) {
            return;
        }
        let Some(module) = self.plan.module(id) else {
            return;
        };
        for &variable in &module.variables {
            self.variable(variable);
        }
        for &function in &module.functions {
            self.function(function);
        }
        for &import in &module.imports {
            self.module(import);
        }
    }

    fn variable(&mut self, id: VariableId) {
        self.cleared += usize::from(self.table.clear_variable(id));
        if let Some(init) = self.plan.variable(id).and_then(|v| v.init) {
            self.expr(init);
        }
    }

    fn function(&mut self, id: FunctionId) {
        if !self.seen_functions.insert(id) {
            return;
        }
        self.cleared += usize::from(self.table.clear_function(id));
        if let Some(decl) = self.plan.function(id) {
            self.expr(decl.body);
        }
    }

    fn expr(&mut self, id: ExprId) {
        // Bodies and initializers may share subtrees.
        if !self.seen_exprs.insert(id) {
            return;
        }
        self.cleared += usize::from(self.table.clear_expr(id));
        let Some(expr) = self.plan.expr(id) else {
            return;
        };
        match expr {
            Expr::InlineFunction(function) => self.function(*function),
            Expr::Call { function, args } => {
                self.function(*function);
                for &arg in args {
                    self.expr(arg);
                }
            }
            Expr::GlobalVar(variable) => self.variable(*variable),
            other => {
                for child in other.children() {
                    self.expr(child);
                }
            }
        }
    }
}

/// Exclusive right to bind execution state on a plan.
///
/// Dropping the ticket checks the plan back in.
pub struct ExecutionTicket {
    plan: Arc<CompiledPlan>,
    table: Option<BindingTable>,
    checked_out_at: Instant,
}

impl ExecutionTicket {
    /// Returns the plan.
    pub fn plan(&self) -> &Arc<CompiledPlan> {
        &self.plan
    }

    /// Returns the execution's bindings.
    pub fn bindings(&self) -> &BindingTable {
        match &self.table {
            Some(table) => table,
            None => unreachable!("execution ticket used after check-in"),
        }
    }

    /// Returns the execution's bindings for writing.
    pub fn bindings_mut(&mut self) -> &mut BindingTable {
        match &mut self.table {
            Some(table) => table,
            None => unreachable!("execution ticket used after check-in"),
        }
    }

    /// Splits the ticket into the plan and its bindings for evaluation.
    pub(crate) fn parts(&mut self) -> (&CompiledPlan, &mut BindingTable) {
        match &mut self.table {
            Some(table) => (self.plan.as_ref(), table),
            None => unreachable!("execution ticket used after check-in"),
        }
    }

    /// Resets the bindings and returns the plan.
    pub fn checkin(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(table) = self.table.take() {
            self.plan.checkin_table(table, self.checked_out_at.elapsed());
        }
    }
}

impl Drop for ExecutionTicket {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ExecutionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionTicket")
            .field("plan", &self.plan.id())
            .field("held_for", &self.checked_out_at.elapsed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanBuilder;
    use crate::value::Sequence;
    use arbor_common::types::{DocumentId, DocumentSet, QName};
    use std::thread;

    fn docs() -> DocumentSet {
        let mut docs = DocumentSet::new();
        docs.insert(DocumentId::new(1), "/db/test/a.xml");
        docs
    }

    /// A library module with `t:test($a)`, `t:unused($a)` and `$t:VAR`, and a
    /// main module calling only `t:test`.
    fn module_plan() -> Arc<CompiledPlan> {
        let ns = "http://exist-db.org/test";
        let mut b = PlanBuilder::new();
        let main = b.main_module();
        let lib = b.library_module(ns, "t");
        b.import(main, lib);

        let init = b.literal(123);
        b.declare_variable(lib, QName::new(ns, "VAR"), Some(init)).unwrap();
        for name in ["test", "unused"] {
            let f = b
                .declare_function(lib, QName::new(ns, name), vec!["a".to_string()])
                .unwrap();
            let body = b.local("a");
            b.define_function(f, body).unwrap();
        }

        let test = b.find_function(&QName::new(ns, "test"), 1).unwrap();
        let arg = b.literal("Hello world");
        let root = b.call(test, vec![arg]).unwrap();
        Arc::new(b.build(root).unwrap())
    }

    #[test]
    fn test_checkout_is_exclusive() {
        let plan = module_plan();
        let ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
        assert!(plan.is_checked_out());

        let second = plan.checkout(ConflictPolicy::Reject);
        assert!(matches!(second, Err(XQueryError::PlanCheckoutConflict(id)) if id == plan.id()));
        assert!(plan.try_checkout().is_none());
        assert!(plan.inspect_bindings(|_| ()).is_none());

        ticket.checkin();
        assert!(!plan.is_checked_out());
        assert!(plan.try_checkout().is_some());
    }

    #[test]
    fn test_wait_times_out() {
        let plan = module_plan();
        let _ticket = plan.checkout(ConflictPolicy::Reject).unwrap();

        let start = Instant::now();
        let result = plan.checkout(ConflictPolicy::Wait(Duration::from_millis(50)));
        assert!(matches!(result, Err(XQueryError::CheckoutTimeout { timeout_ms: 50, .. })));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_succeeds_after_checkin() {
        let plan = module_plan();
        let ticket = plan.checkout(ConflictPolicy::Reject).unwrap();

        let waiter = {
            let plan = Arc::clone(&plan);
            thread::spawn(move || {
                plan.checkout(ConflictPolicy::Wait(Duration::from_secs(5)))
                    .map(|t| t.bindings().is_pristine())
            })
        };

        thread::sleep(Duration::from_millis(30));
        drop(ticket);
        assert!(waiter.join().unwrap().unwrap());
    }

    #[test]
    fn test_unbounded_wait_succeeds_after_checkin() {
        let plan = module_plan();
        let ticket = plan.checkout(ConflictPolicy::Wait(Duration::MAX)).unwrap();

        let waiter = {
            let plan = Arc::clone(&plan);
            thread::spawn(move || {
                plan.checkout(ConflictPolicy::Wait(Duration::MAX))
                    .map(|t| t.bindings().is_pristine())
            })
        };

        thread::sleep(Duration::from_millis(30));
        ticket.checkin();
        assert!(waiter.join().unwrap().unwrap());
    }

    #[test]
    fn test_checkin_clears_uncalled_declarations() {
        let plan = module_plan();
        let ns = "http://exist-db.org/test";
        let test = plan.find_function(&QName::new(ns, "test"), 1).unwrap();
        let unused = plan.find_function(&QName::new(ns, "unused"), 1).unwrap();
        let var = plan.find_variable(&QName::new(ns, "VAR")).unwrap();
        let unused_body = plan.function(unused).unwrap().body;

        let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
        {
            let table = ticket.bindings_mut();
            table.function_mut(test).unwrap().arguments = Some(vec![Sequence::one("x")]);
            table.function_mut(unused).unwrap().context_docs = Some(docs());
            table.set_expr_docs(unused_body, docs());
            table.variable_mut(var).unwrap().context_docs = Some(docs());
        }
        assert_eq!(ticket.bindings().bound_slots(), 4);
        ticket.checkin();

        assert!(plan.bindings_pristine());
        plan.inspect_bindings(|table| {
            assert!(table.function(unused).unwrap().is_unset());
            assert!(table.expr_docs(unused_body).is_none());
            assert!(table.variable(var).unwrap().is_unset());
        })
        .unwrap();
    }

    #[test]
    fn test_drop_during_panic_checks_in() {
        let plan = module_plan();

        let panicking = {
            let plan = Arc::clone(&plan);
            thread::spawn(move || {
                let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
                let root = ticket.plan().root();
                ticket.bindings_mut().set_expr_docs(root, docs());
                panic!("execution failed");
            })
        };
        assert!(panicking.join().is_err());

        assert!(!plan.is_checked_out());
        assert!(plan.bindings_pristine());
    }

    #[test]
    fn test_unimported_module_is_reset() {
        let mut b = PlanBuilder::new();
        let orphan = b.library_module("http://example.com/orphan", "o");
        let f = b
            .declare_function(orphan, QName::new("http://example.com/orphan", "f"), Vec::new())
            .unwrap();
        let body = b.literal(1);
        b.define_function(f, body).unwrap();
        let root = b.sequence(Vec::new());
        let plan = Arc::new(b.build(root).unwrap());

        let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
        ticket.bindings_mut().function_mut(f).unwrap().arguments = Some(Vec::new());
        drop(ticket);
        assert!(plan.bindings_pristine());
    }

    #[test]
    fn test_detached_expression_cleared() {
        let mut b = PlanBuilder::new();
        let detached = b.literal("never used");
        let root = b.literal(1);
        let plan = Arc::new(b.build(root).unwrap());

        let mut ticket = plan.checkout(ConflictPolicy::Reject).unwrap();
        ticket.bindings_mut().set_expr_docs(detached, docs());
        ticket.checkin();
        assert!(plan.bindings_pristine());
    }
}
