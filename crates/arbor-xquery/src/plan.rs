//! Compiled query plans.
//!
//! A [`CompiledPlan`] is an index-addressed arena: expression nodes,
//! function declarations, variable declarations and modules refer to each
//! other by id. The arena never changes after [`PlanBuilder::build`]. All
//! per-execution state (arguments, context document sets, closure captures,
//! variable values) lives in a separate
//! [`BindingTable`](crate::binding::BindingTable) that the plan lends to one
//! execution at a time; see [`checkout`](crate::checkout).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arbor_common::types::{PlanId, QName};
use parking_lot::{Condvar, Mutex};

use crate::binding::BindingTable;
use crate::error::{XQueryError, XQueryResult};
use crate::value::Item;

static NEXT_PLAN_ID: AtomicU64 = AtomicU64::new(1);

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            /// Returns the arena index.
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub(crate) fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }
    };
}

arena_id!(
    /// Index of an expression node.
    ExprId
);
arena_id!(
    /// Index of a function declaration.
    FunctionId
);
arena_id!(
    /// Index of a global variable declaration.
    VariableId
);
arena_id!(
    /// Index of a module.
    ModuleId
);

/// An expression node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// An atomic literal.
    Literal(Item),
    /// Comma operator.
    Sequence(Vec<ExprId>),
    /// String concatenation of single items.
    Concat(Vec<ExprId>),
    /// Reference to a parameter or `let` binding.
    LocalVar(String),
    /// `let $var := value return body`.
    Let {
        /// Bound name.
        var: String,
        /// Bound value.
        value: ExprId,
        /// Scope of the binding.
        body: ExprId,
    },
    /// Reference to a declared global variable.
    GlobalVar(VariableId),
    /// Static call of a declared function.
    Call {
        /// Callee.
        function: FunctionId,
        /// Arguments.
        args: Vec<ExprId>,
    },
    /// Creation of a function value.
    InlineFunction(FunctionId),
    /// Call of a function value.
    DynamicCall {
        /// Expression producing the function value.
        target: ExprId,
        /// Arguments.
        args: Vec<ExprId>,
    },
    /// `collection(uri)`: the paths of the documents in a collection.
    Collection(ExprId),
    /// `count(arg)`.
    Count(ExprId),
}

impl Expr {
    /// Returns the direct child expressions.
    ///
    /// The body of an inline function is not a child of the
    /// [`Expr::InlineFunction`] node; it belongs to the function declaration.
    pub fn children(&self) -> Vec<ExprId> {
        match self {
            Expr::Literal(_) | Expr::LocalVar(_) | Expr::GlobalVar(_) | Expr::InlineFunction(_) => {
                Vec::new()
            }
            Expr::Sequence(items) | Expr::Concat(items) => items.clone(),
            Expr::Let { value, body, .. } => vec![*value, *body],
            Expr::Call { args, .. } => args.clone(),
            Expr::DynamicCall { target, args } => {
                let mut children = Vec::with_capacity(args.len() + 1);
                children.push(*target);
                children.extend(args.iter().copied());
                children
            }
            Expr::Collection(arg) | Expr::Count(arg) => vec![*arg],
        }
    }
}

/// A function declaration, named or inline.
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    /// Declared name; `None` for inline functions.
    pub name: Option<QName>,
    /// Parameter names.
    pub params: Vec<String>,
    /// Body expression.
    pub body: ExprId,
    /// Variables of the enclosing scope an inline function closes over.
    pub captures: Vec<String>,
    /// Declaring module.
    pub module: ModuleId,
}

impl FunctionDecl {
    /// Returns the declared arity.
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Returns true for inline functions.
    pub fn is_inline(&self) -> bool {
        self.name.is_none()
    }

    /// Returns a printable name.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{}#{}", name, self.params.len()),
            None => format!("function#{}", self.params.len()),
        }
    }
}

/// A global variable declaration.
#[derive(Debug, Clone)]
pub struct VariableDecl {
    /// Declared name.
    pub name: QName,
    /// Initializer; `None` for external variables.
    pub init: Option<ExprId>,
    /// Declaring module.
    pub module: ModuleId,
}

/// A main or library module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Target namespace; `None` for the main module.
    pub namespace: Option<String>,
    /// Prefix bound to the namespace.
    pub prefix: Option<String>,
    /// Declared functions.
    pub functions: Vec<FunctionId>,
    /// Declared variables.
    pub variables: Vec<VariableId>,
    /// Imported modules.
    pub imports: Vec<ModuleId>,
}

/// A compiled query.
///
/// Shared between executions through `Arc`. The execution state is handed
/// out by [`CompiledPlan::checkout`](crate::checkout), one execution at a
/// time.
pub struct CompiledPlan {
    id: PlanId,
    source: Option<String>,
    modules: Vec<Module>,
    functions: Vec<FunctionDecl>,
    variables: Vec<VariableDecl>,
    exprs: Vec<Expr>,
    root: ExprId,
    created_at: Instant,
    /// `None` while checked out.
    pub(crate) bindings: Mutex<Option<BindingTable>>,
    /// Signalled on check-in.
    pub(crate) checked_in: Condvar,
}

impl CompiledPlan {
    /// Returns the plan id.
    pub fn id(&self) -> PlanId {
        self.id
    }

    /// Returns the source text, if the plan was compiled from one.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Attaches the source text.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Returns the root expression.
    pub fn root(&self) -> ExprId {
        self.root
    }

    /// Returns the main module.
    pub fn main_module(&self) -> ModuleId {
        ModuleId(0)
    }

    /// Returns an expression node.
    pub fn expr(&self, id: ExprId) -> Option<&Expr> {
        self.exprs.get(id.index())
    }

    /// Returns a function declaration.
    pub fn function(&self, id: FunctionId) -> Option<&FunctionDecl> {
        self.functions.get(id.index())
    }

    /// Returns a variable declaration.
    pub fn variable(&self, id: VariableId) -> Option<&VariableDecl> {
        self.variables.get(id.index())
    }

    /// Returns a module.
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id.index())
    }

    /// Returns true if the plan was compiled against the library module of
    /// `namespace`, imported directly or through another module.
    pub fn uses_module(&self, namespace: &str) -> bool {
        self.modules
            .iter()
            .any(|m| m.namespace.as_deref() == Some(namespace))
    }

    /// Returns every module.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &Module)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, m)| (ModuleId::from_index(i), m))
    }

    /// Returns the number of expression nodes.
    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }

    /// Returns the number of function declarations, inline ones included.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Returns the number of variable declarations.
    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    /// Looks up a named function by name and arity.
    pub fn find_function(&self, name: &QName, arity: usize) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name.as_ref() == Some(name) && f.arity() == arity)
            .map(FunctionId::from_index)
    }

    /// Looks up a global variable by name.
    pub fn find_variable(&self, name: &QName) -> Option<VariableId> {
        self.variables
            .iter()
            .position(|v| &v.name == name)
            .map(VariableId::from_index)
    }

    /// Returns the inline function declarations.
    pub fn inline_functions(&self) -> Vec<FunctionId> {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_inline())
            .map(|(i, _)| FunctionId::from_index(i))
            .collect()
    }

    /// Returns how long ago the plan was built.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn new_bindings(&self) -> BindingTable {
        BindingTable::new(self.functions.len(), self.variables.len(), self.exprs.len())
    }
}

impl fmt::Debug for CompiledPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPlan")
            .field("id", &self.id)
            .field("modules", &self.modules.len())
            .field("functions", &self.functions.len())
            .field("variables", &self.variables.len())
            .field("exprs", &self.exprs.len())
            .field("checked_out", &self.is_checked_out())
            .finish()
    }
}

/// Builds a [`CompiledPlan`].
///
/// Functions are declared first and given a body later, so bodies may call
/// functions declared after them.
///
/// ```rust
/// use arbor_common::types::QName;
/// use arbor_xquery::PlanBuilder;
///
/// let mut builder = PlanBuilder::new();
/// let main = builder.main_module();
/// let echo = builder
///     .declare_function(main, QName::local("echo"), vec!["a".to_string()])
///     .unwrap();
/// let body = builder.local("a");
/// builder.define_function(echo, body).unwrap();
///
/// let arg = builder.literal("hello");
/// let root = builder.call(echo, vec![arg]).unwrap();
/// let plan = builder.build(root).unwrap();
/// assert_eq!(plan.function_count(), 1);
/// ```
#[derive(Debug)]
pub struct PlanBuilder {
    modules: Vec<Module>,
    functions: Vec<PendingFunction>,
    variables: Vec<VariableDecl>,
    exprs: Vec<Expr>,
    signatures: HashMap<(QName, usize), FunctionId>,
}

#[derive(Debug)]
struct PendingFunction {
    name: Option<QName>,
    params: Vec<String>,
    body: Option<ExprId>,
    captures: Vec<String>,
    module: ModuleId,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanBuilder {
    /// Creates a builder with an empty main module.
    pub fn new() -> Self {
        Self {
            modules: vec![Module::default()],
            functions: Vec::new(),
            variables: Vec::new(),
            exprs: Vec::new(),
            signatures: HashMap::new(),
        }
    }

    /// Returns the main module.
    pub fn main_module(&self) -> ModuleId {
        ModuleId(0)
    }

    /// Adds a library module.
    pub fn library_module(&mut self, namespace: impl Into<String>, prefix: impl Into<String>) -> ModuleId {
        let id = ModuleId::from_index(self.modules.len());
        self.modules.push(Module {
            namespace: Some(namespace.into()),
            prefix: Some(prefix.into()),
            ..Module::default()
        });
        id
    }

    /// Records that `into` imports `module`.
    pub fn import(&mut self, into: ModuleId, module: ModuleId) {
        let imports = &mut self.modules[into.index()].imports;
        if !imports.contains(&module) {
            imports.push(module);
        }
    }

    /// Finds the library module with the given namespace.
    pub fn module_by_namespace(&self, namespace: &str) -> Option<ModuleId> {
        self.modules
            .iter()
            .position(|m| m.namespace.as_deref() == Some(namespace))
            .map(ModuleId::from_index)
    }

    /// Declares a named function. Its body is supplied with
    /// [`define_function`](Self::define_function).
    pub fn declare_function(
        &mut self,
        module: ModuleId,
        name: QName,
        params: Vec<String>,
    ) -> XQueryResult<FunctionId> {
        let key = (name.clone(), params.len());
        if self.signatures.contains_key(&key) {
            return Err(XQueryError::Static(format!(
                "function {}#{} is declared more than once",
                name,
                params.len()
            )));
        }

        let id = FunctionId::from_index(self.functions.len());
        self.functions.push(PendingFunction {
            name: Some(name),
            params,
            body: None,
            captures: Vec::new(),
            module,
        });
        self.modules[module.index()].functions.push(id);
        self.signatures.insert(key, id);
        Ok(id)
    }

    /// Supplies the body of a declared function.
    pub fn define_function(&mut self, function: FunctionId, body: ExprId) -> XQueryResult<()> {
        let pending = self
            .functions
            .get_mut(function.index())
            .ok_or_else(|| XQueryError::Static(format!("no function with index {}", function.index())))?;
        pending.body = Some(body);
        Ok(())
    }

    /// Looks up a declared function by name and arity.
    pub fn find_function(&self, name: &QName, arity: usize) -> Option<FunctionId> {
        self.signatures.get(&(name.clone(), arity)).copied()
    }

    /// Declares a global variable. `init` is `None` for external variables.
    pub fn declare_variable(
        &mut self,
        module: ModuleId,
        name: QName,
        init: Option<ExprId>,
    ) -> XQueryResult<VariableId> {
        if self.find_variable(&name).is_some() {
            return Err(XQueryError::Static(format!(
                "variable ${name} is declared more than once"
            )));
        }
        let id = VariableId::from_index(self.variables.len());
        self.variables.push(VariableDecl { name, init, module });
        self.modules[module.index()].variables.push(id);
        Ok(id)
    }

    /// Looks up a declared variable by name.
    pub fn find_variable(&self, name: &QName) -> Option<VariableId> {
        self.variables
            .iter()
            .position(|v| &v.name == name)
            .map(VariableId::from_index)
    }

    fn push(&mut self, expr: Expr) -> ExprId {
        let id = ExprId::from_index(self.exprs.len());
        self.exprs.push(expr);
        id
    }

    /// Adds a literal.
    pub fn literal(&mut self, item: impl Into<Item>) -> ExprId {
        self.push(Expr::Literal(item.into()))
    }

    /// Adds a sequence constructor. An empty list is the empty sequence.
    pub fn sequence(&mut self, items: Vec<ExprId>) -> ExprId {
        self.push(Expr::Sequence(items))
    }

    /// Adds a string concatenation.
    pub fn concat(&mut self, args: Vec<ExprId>) -> ExprId {
        self.push(Expr::Concat(args))
    }

    /// Adds a local variable reference.
    pub fn local(&mut self, name: impl Into<String>) -> ExprId {
        self.push(Expr::LocalVar(name.into()))
    }

    /// Adds a `let` binding.
    pub fn let_binding(&mut self, var: impl Into<String>, value: ExprId, body: ExprId) -> ExprId {
        self.push(Expr::Let {
            var: var.into(),
            value,
            body,
        })
    }

    /// Adds a global variable reference.
    pub fn global(&mut self, variable: VariableId) -> ExprId {
        self.push(Expr::GlobalVar(variable))
    }

    /// Adds a static function call, checking the arity.
    pub fn call(&mut self, function: FunctionId, args: Vec<ExprId>) -> XQueryResult<ExprId> {
        let pending = self
            .functions
            .get(function.index())
            .ok_or_else(|| XQueryError::Static(format!("no function with index {}", function.index())))?;
        if pending.params.len() != args.len() {
            return Err(XQueryError::ArityMismatch {
                function: pending
                    .name
                    .as_ref()
                    .map_or_else(|| "function".to_string(), |n| n.to_string()),
                expected: pending.params.len(),
                found: args.len(),
            });
        }
        Ok(self.push(Expr::Call { function, args }))
    }

    /// Adds an inline function. The variables it closes over are the free
    /// local variables of `body`.
    pub fn inline_function(&mut self, module: ModuleId, params: Vec<String>, body: ExprId) -> ExprId {
        let mut bound = params.clone();
        let mut captures = Vec::new();
        self.free_variables(body, &mut bound, &mut captures);

        let function = FunctionId::from_index(self.functions.len());
        self.functions.push(PendingFunction {
            name: None,
            params,
            body: Some(body),
            captures,
            module,
        });
        self.push(Expr::InlineFunction(function))
    }

    fn free_variables(&self, expr: ExprId, bound: &mut Vec<String>, free: &mut Vec<String>) {
        match &self.exprs[expr.index()] {
            Expr::LocalVar(name) => {
                if !bound.contains(name) && !free.contains(name) {
                    free.push(name.clone());
                }
            }
            Expr::Let { var, value, body } => {
                self.free_variables(*value, bound, free);
                bound.push(var.clone());
                self.free_variables(*body, bound, free);
                bound.pop();
            }
            Expr::InlineFunction(function) => {
                for name in &self.functions[function.index()].captures {
                    if !bound.contains(name) && !free.contains(name) {
                        free.push(name.clone());
                    }
                }
            }
            other => {
                for child in other.children() {
                    self.free_variables(child, bound, free);
                }
            }
        }
    }

    /// Adds a dynamic function call.
    pub fn dynamic_call(&mut self, target: ExprId, args: Vec<ExprId>) -> ExprId {
        self.push(Expr::DynamicCall { target, args })
    }

    /// Adds `collection(uri)`.
    pub fn collection(&mut self, uri: ExprId) -> ExprId {
        self.push(Expr::Collection(uri))
    }

    /// Adds `count(arg)`.
    pub fn count(&mut self, arg: ExprId) -> ExprId {
        self.push(Expr::Count(arg))
    }

    /// Finishes the plan.
    ///
    /// Fails if a declared function never received a body.
    pub fn build(self, root: ExprId) -> XQueryResult<CompiledPlan> {
        if root.index() >= self.exprs.len() {
            return Err(XQueryError::Static("root expression is not part of the plan".to_string()));
        }

        let mut functions = Vec::with_capacity(self.functions.len());
        for pending in self.functions {
            let body = pending.body.ok_or_else(|| {
                XQueryError::Static(format!(
                    "function {} has no body",
                    pending
                        .name
                        .as_ref()
                        .map_or_else(|| "function".to_string(), |n| n.to_string())
                ))
            })?;
            functions.push(FunctionDecl {
                name: pending.name,
                params: pending.params,
                body,
                captures: pending.captures,
                module: pending.module,
            });
        }

        let mut plan = CompiledPlan {
            id: PlanId::new(NEXT_PLAN_ID.fetch_add(1, Ordering::Relaxed)),
            source: None,
            modules: self.modules,
            functions,
            variables: self.variables,
            exprs: self.exprs,
            root,
            created_at: Instant::now(),
            bindings: Mutex::new(None),
            checked_in: Condvar::new(),
        };
        let table = plan.new_bindings();
        *plan.bindings.get_mut() = Some(table);
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_function_captures_free_variables() {
        let mut b = PlanBuilder::new();
        let main = b.main_module();

        // function($x) { let $y := $a return concat($x, $y, $b) }
        let a = b.local("a");
        let x = b.local("x");
        let y = b.local("y");
        let bb = b.local("b");
        let concat = b.concat(vec![x, y, bb]);
        let body = b.let_binding("y", a, concat);
        let func = b.inline_function(main, vec!["x".to_string()], body);

        let plan = b.build(func).unwrap();
        let inline = plan.inline_functions();
        assert_eq!(inline.len(), 1);
        let decl = plan.function(inline[0]).unwrap();
        assert_eq!(decl.captures, vec!["a".to_string(), "b".to_string()]);
        assert!(decl.is_inline());
    }

    #[test]
    fn test_nested_inline_captures_propagate() {
        let mut b = PlanBuilder::new();
        let main = b.main_module();

        // function() { function() { $a } }
        let a = b.local("a");
        let inner = b.inline_function(main, Vec::new(), a);
        let outer = b.inline_function(main, Vec::new(), inner);

        let plan = b.build(outer).unwrap();
        for id in plan.inline_functions() {
            assert_eq!(plan.function(id).unwrap().captures, vec!["a".to_string()]);
        }
    }

    #[test]
    fn test_arity_checked() {
        let mut b = PlanBuilder::new();
        let main = b.main_module();
        let f = b
            .declare_function(main, QName::local("f"), vec!["a".to_string()])
            .unwrap();
        let result = b.call(f, Vec::new());
        assert!(matches!(
            result,
            Err(XQueryError::ArityMismatch { expected: 1, found: 0, .. })
        ));
    }

    #[test]
    fn test_duplicate_declarations() {
        let mut b = PlanBuilder::new();
        let main = b.main_module();
        b.declare_function(main, QName::local("f"), Vec::new()).unwrap();
        assert!(b.declare_function(main, QName::local("f"), Vec::new()).is_err());
        // Same name, other arity.
        assert!(b
            .declare_function(main, QName::local("f"), vec!["a".to_string()])
            .is_ok());

        b.declare_variable(main, QName::local("v"), None).unwrap();
        assert!(matches!(
            b.declare_variable(main, QName::local("v"), None),
            Err(XQueryError::Static(_))
        ));
    }

    #[test]
    fn test_missing_body_rejected() {
        let mut b = PlanBuilder::new();
        let main = b.main_module();
        b.declare_function(main, QName::local("f"), Vec::new()).unwrap();
        let root = b.sequence(Vec::new());
        assert!(matches!(b.build(root), Err(XQueryError::Static(_))));
    }

    #[test]
    fn test_lookups() {
        let mut b = PlanBuilder::new();
        let lib = b.library_module("http://example.com/t", "t");
        let main = b.main_module();
        b.import(main, lib);
        b.import(main, lib);

        let name = QName::new("http://example.com/t", "f").with_prefix("t");
        let f = b.declare_function(lib, name.clone(), Vec::new()).unwrap();
        let body = b.literal(1);
        b.define_function(f, body).unwrap();
        let var = QName::new("http://example.com/t", "VAR");
        b.declare_variable(lib, var.clone(), Some(body)).unwrap();
        let root = b.call(f, Vec::new()).unwrap();

        let plan = b.build(root).unwrap();
        assert_eq!(plan.find_function(&name, 0), Some(f));
        assert_eq!(plan.find_function(&name, 1), None);
        assert!(plan.find_variable(&var).is_some());
        assert_eq!(plan.module(plan.main_module()).unwrap().imports.len(), 1);
        assert_eq!(plan.modules().count(), 2);
    }
}
