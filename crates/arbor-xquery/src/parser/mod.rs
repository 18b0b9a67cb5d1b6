//! XQuery compiler.
//!
//! Compiles the subset of XQuery the evaluator understands into a
//! [`CompiledPlan`]:
//!
//! - string and integer literals, `()`, the comma operator, `||`
//! - `let ... return`
//! - global variables, including `external` ones
//! - user functions in the main module and in imported library modules
//! - inline functions and dynamic calls
//! - `concat`, `count`, `collection`, `true` and `false`
//!
//! Library modules are registered with the compiler by their source text
//! and resolved by namespace when a query imports them. The `at` location
//! hint is accepted and ignored.
//!
//! # Example
//!
//! ```
//! use arbor_xquery::parser::XQueryCompiler;
//!
//! let compiler = XQueryCompiler::new();
//! compiler
//!     .register_module(
//!         "module namespace t = \"http://example.com/t\";
//!          declare function t:greet($who) { 'Hello ' || $who };",
//!     )
//!     .unwrap();
//!
//! let plan = compiler
//!     .compile("import module namespace t = \"http://example.com/t\"; t:greet('world')")
//!     .unwrap();
//! assert_eq!(plan.modules().count(), 2);
//! ```

mod grammar;
mod lexer;

use std::collections::HashMap;

use arbor_common::types::QName;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{XQueryError, XQueryResult};
use crate::plan::{CompiledPlan, ExprId, FunctionId, ModuleId, PlanBuilder};
use crate::service::QueryCompiler;
use grammar::{parse_module, Ast, ModuleAst};
use lexer::Pos;

/// Namespace of the built-in functions.
pub const FN_NAMESPACE: &str = "http://www.w3.org/2005/xpath-functions";

/// Namespace bound to the `local` prefix.
pub const LOCAL_NAMESPACE: &str = "http://www.w3.org/2005/xquery-local-functions";

/// Compiles XQuery source into plans.
#[derive(Debug, Default)]
pub struct XQueryCompiler {
    /// Library module sources by target namespace.
    modules: RwLock<HashMap<String, String>>,
}

impl XQueryCompiler {
    /// Creates a compiler without library modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a library module and returns its target namespace.
    ///
    /// The module is parsed to find its namespace; it is compiled as part
    /// of every query that imports it. Registering a namespace again
    /// replaces the previous source.
    pub fn register_module(&self, source: &str) -> XQueryResult<String> {
        let module = parse_module(source)?;
        let Some((_, namespace)) = module.target else {
            return Err(XQueryError::Static("not a library module".to_string()));
        };
        debug!(namespace = %namespace, "registered library module");
        self.modules.write().insert(namespace.clone(), source.to_string());
        Ok(namespace)
    }

    /// Returns true if a library module is registered for `namespace`.
    pub fn has_module(&self, namespace: &str) -> bool {
        self.modules.read().contains_key(namespace)
    }

    /// Compiles a main module.
    pub fn compile(&self, source: &str) -> XQueryResult<CompiledPlan> {
        let main = parse_module(source)?;
        if main.target.is_some() {
            return Err(XQueryError::Static(
                "a library module cannot be executed".to_string(),
            ));
        }

        let mut lowering = Lowering {
            builder: PlanBuilder::new(),
            modules: Vec::new(),
            loading: Vec::new(),
            sources: &self.modules,
        };
        let main_id = lowering.builder.main_module();
        lowering.load(main_id, main)?;
        let plan = lowering.finish()?;
        Ok(plan.with_source(source))
    }
}

impl QueryCompiler for XQueryCompiler {
    fn compile(&self, source: &str) -> XQueryResult<CompiledPlan> {
        XQueryCompiler::compile(self, source)
    }

    fn register_module(&self, source: &str) -> XQueryResult<String> {
        XQueryCompiler::register_module(self, source)
    }
}

/// A parsed module awaiting lowering.
struct Loaded {
    id: ModuleId,
    ast: ModuleAst,
    prefixes: HashMap<String, String>,
    /// Declared functions, parallel to `ast.functions`.
    functions: Vec<FunctionId>,
}

struct Lowering<'c> {
    builder: PlanBuilder,
    /// Modules in dependency order: imports before importers.
    modules: Vec<Loaded>,
    /// Namespaces being loaded, for cycle detection.
    loading: Vec<String>,
    sources: &'c RwLock<HashMap<String, String>>,
}

fn compile_error(pos: Pos, message: impl Into<String>) -> XQueryError {
    XQueryError::compile(pos.line, pos.column, message)
}

impl Lowering<'_> {
    /// Loads a module and, first, everything it imports.
    fn load(&mut self, id: ModuleId, ast: ModuleAst) -> XQueryResult<()> {
        let mut prefixes = HashMap::from([
            ("fn".to_string(), FN_NAMESPACE.to_string()),
            ("local".to_string(), LOCAL_NAMESPACE.to_string()),
        ]);
        if let Some((prefix, namespace)) = &ast.target {
            prefixes.insert(prefix.clone(), namespace.clone());
        }
        for (prefix, namespace) in &ast.namespaces {
            prefixes.insert(prefix.clone(), namespace.clone());
        }

        for import in &ast.imports {
            prefixes.insert(import.prefix.clone(), import.namespace.clone());

            if self.loading.contains(&import.namespace) {
                return Err(compile_error(
                    import.pos,
                    format!("circular import of module \"{}\"", import.namespace),
                ));
            }
            let imported = match self.builder.module_by_namespace(&import.namespace) {
                Some(existing) => existing,
                None => {
                    let source = self.sources.read().get(&import.namespace).cloned().ok_or_else(|| {
                        compile_error(import.pos, format!("no module registered for \"{}\"", import.namespace))
                    })?;
                    let library = parse_module(&source)?;
                    let prefix = library
                        .target
                        .as_ref()
                        .map(|(prefix, _)| prefix.clone())
                        .unwrap_or_default();
                    let library_id = self.builder.library_module(&import.namespace, prefix);
                    self.loading.push(import.namespace.clone());
                    self.load(library_id, library)?;
                    self.loading.pop();
                    library_id
                }
            };
            self.builder.import(id, imported);
        }

        // Signatures first so bodies anywhere can call them.
        let mut functions = Vec::with_capacity(ast.functions.len());
        for function in &ast.functions {
            let name = resolve(&prefixes, &function.name, function.pos, None)?;
            if let Some((_, namespace)) = &ast.target {
                if name.namespace() != namespace.as_str() {
                    return Err(compile_error(
                        function.pos,
                        format!("function {} is not in the module namespace", function.name),
                    ));
                }
            }
            functions.push(
                self.builder
                    .declare_function(id, name, function.params.clone())?,
            );
        }

        self.modules.push(Loaded {
            id,
            ast,
            prefixes,
            functions,
        });
        Ok(())
    }

    fn finish(mut self) -> XQueryResult<CompiledPlan> {
        let modules = std::mem::take(&mut self.modules);

        // Variables in declaration order; an initializer sees the variables
        // declared before it.
        for module in &modules {
            for variable in &module.ast.variables {
                let name = resolve(&module.prefixes, &variable.name, variable.pos, None)?;
                let init = match &variable.init {
                    Some(init) => Some(self.expr(module, init, &mut Vec::new())?),
                    None => None,
                };
                self.builder.declare_variable(module.id, name, init)?;
            }
        }

        for module in &modules {
            for (function, &id) in module.ast.functions.iter().zip(&module.functions) {
                let mut scope = function.params.clone();
                let body = self.expr(module, &function.body, &mut scope)?;
                self.builder.define_function(id, body)?;
            }
        }

        let main = modules
            .iter()
            .find(|m| m.ast.target.is_none())
            .ok_or_else(|| XQueryError::Static("no main module".to_string()))?;
        let body = main
            .ast
            .body
            .as_ref()
            .ok_or_else(|| XQueryError::Static("main module has no body".to_string()))?;
        let root = self.expr(main, body, &mut Vec::new())?;
        self.builder.build(root)
    }

    /// Lowers an expression. `scope` lists the local variables in scope.
    fn expr(&mut self, module: &Loaded, ast: &Ast, scope: &mut Vec<String>) -> XQueryResult<ExprId> {
        match ast {
            Ast::Str(s) => Ok(self.builder.literal(s.as_str())),
            Ast::Int(i) => Ok(self.builder.literal(*i)),
            Ast::Empty => Ok(self.builder.sequence(Vec::new())),
            Ast::Seq(items) => {
                let items = self.exprs(module, items, scope)?;
                Ok(self.builder.sequence(items))
            }
            Ast::Concat(operands) => {
                let operands = self.exprs(module, operands, scope)?;
                Ok(self.builder.concat(operands))
            }
            Ast::Var { name, pos } => {
                if scope.contains(name) {
                    return Ok(self.builder.local(name.as_str()));
                }
                let qname = resolve(&module.prefixes, name, *pos, None)?;
                match self.builder.find_variable(&qname) {
                    Some(variable) => Ok(self.builder.global(variable)),
                    None => Err(compile_error(*pos, format!("undeclared variable ${name}"))),
                }
            }
            Ast::Let { bindings, body } => {
                let depth = scope.len();
                let mut lowered = Vec::with_capacity(bindings.len());
                for (var, value) in bindings {
                    let value = self.expr(module, value, scope)?;
                    lowered.push((var.clone(), value));
                    scope.push(var.clone());
                }
                let mut result = self.expr(module, body, scope);
                scope.truncate(depth);
                for (var, value) in lowered.into_iter().rev() {
                    result = result.map(|body| self.builder.let_binding(var, value, body));
                }
                result
            }
            Ast::Call { name, args, pos } => self.call(module, name, args, *pos, scope),
            Ast::Inline { params, body } => {
                let depth = scope.len();
                scope.extend(params.iter().cloned());
                let body = self.expr(module, body, scope);
                scope.truncate(depth);
                Ok(self.builder.inline_function(module.id, params.clone(), body?))
            }
            Ast::Dynamic { target, args } => {
                let target = self.expr(module, target, scope)?;
                let args = self.exprs(module, args, scope)?;
                Ok(self.builder.dynamic_call(target, args))
            }
        }
    }

    fn exprs(&mut self, module: &Loaded, asts: &[Ast], scope: &mut Vec<String>) -> XQueryResult<Vec<ExprId>> {
        asts.iter().map(|ast| self.expr(module, ast, scope)).collect()
    }

    fn call(
        &mut self,
        module: &Loaded,
        name: &str,
        args: &[Ast],
        pos: Pos,
        scope: &mut Vec<String>,
    ) -> XQueryResult<ExprId> {
        let qname = resolve(&module.prefixes, name, pos, Some(FN_NAMESPACE))?;
        let args = self.exprs(module, args, scope)?;
        let found = args.len();
        let unknown = || XQueryError::UnknownFunction {
            name: name.to_string(),
            arity: found,
        };

        if qname.namespace() == FN_NAMESPACE {
            let arity_error = |expected: usize| XQueryError::ArityMismatch {
                function: name.to_string(),
                expected,
                found,
            };
            return match (qname.local_name(), found) {
                ("concat", _) => Ok(self.builder.concat(args)),
                ("count", 1) => Ok(self.builder.count(args[0])),
                ("collection", 1) => Ok(self.builder.collection(args[0])),
                ("count" | "collection", _) => Err(arity_error(1)),
                ("true", 0) => Ok(self.builder.literal(true)),
                ("false", 0) => Ok(self.builder.literal(false)),
                ("true" | "false", _) => Err(arity_error(0)),
                _ => Err(unknown()),
            };
        }

        match self.builder.find_function(&qname, found) {
            Some(function) => self.builder.call(function, args),
            None => Err(unknown()),
        }
    }
}

/// Resolves a lexical QName against the in-scope prefixes. Unprefixed names
/// take `default_namespace`, or no namespace.
fn resolve(
    prefixes: &HashMap<String, String>,
    name: &str,
    pos: Pos,
    default_namespace: Option<&str>,
) -> XQueryResult<QName> {
    match name.split_once(':') {
        Some((prefix, local)) => {
            let namespace = prefixes
                .get(prefix)
                .ok_or_else(|| compile_error(pos, format!("undeclared namespace prefix '{prefix}'")))?;
            Ok(QName::new(namespace.as_str(), local).with_prefix(prefix))
        }
        None => Ok(match default_namespace {
            Some(namespace) => QName::new(namespace, name),
            None => QName::local(name),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Expr;

    const MODULE_NS: &str = "http://exist-db.org/test";

    fn compiler() -> XQueryCompiler {
        let compiler = XQueryCompiler::new();
        compiler
            .register_module(
                "module namespace t=\"http://exist-db.org/test\";\
                 declare variable $t:VAR := 123;\
                 declare function t:test($a) { $a };\
                 declare function t:unused($a) { $a };\
                 declare function t:inline($a) { function() { $a } };",
            )
            .unwrap();
        compiler
    }

    #[test]
    fn test_imported_module_is_compiled_in() {
        let plan = compiler()
            .compile(
                "import module namespace t=\"http://exist-db.org/test\" at \
                 \"xmldb:exist:///db/test/test-module.xql\";\
                 t:test('Hello world')",
            )
            .unwrap();

        assert_eq!(plan.modules().count(), 2);
        let test = plan.find_function(&QName::new(MODULE_NS, "test"), 1).unwrap();
        assert!(plan.find_function(&QName::new(MODULE_NS, "unused"), 1).is_some());
        assert!(plan.find_variable(&QName::new(MODULE_NS, "VAR")).is_some());
        assert_eq!(plan.inline_functions().len(), 1);
        assert!(matches!(plan.expr(plan.root()), Some(Expr::Call { function, .. }) if *function == test));
        assert!(plan.source().is_some());
    }

    #[test]
    fn test_forward_references_and_globals() {
        let plan = XQueryCompiler::new()
            .compile(
                "declare variable $greeting := local:greet('x');\
                 declare function local:greet($who) { local:prefix() || $who };\
                 declare function local:prefix() { 'Hello ' };\
                 $greeting",
            )
            .unwrap();
        assert_eq!(plan.function_count(), 2);
        assert_eq!(plan.variable_count(), 1);
    }

    #[test]
    fn test_inline_function_captures() {
        let plan = XQueryCompiler::new()
            .compile("let $a := \"a\"\nlet $func := function() { $a }\nreturn\n   $func")
            .unwrap();
        let inline = plan.inline_functions();
        assert_eq!(inline.len(), 1);
        assert_eq!(plan.function(inline[0]).unwrap().captures, vec!["a".to_string()]);
    }

    #[test]
    fn test_resolution_errors() {
        let compiler = compiler();

        let err = compiler.compile("$nope").unwrap_err();
        assert!(matches!(err, XQueryError::Compile { line: 1, column: 1, .. }));

        let err = compiler.compile("x:f()").unwrap_err();
        assert!(matches!(err, XQueryError::Compile { .. }));

        let err = compiler
            .compile("import module namespace t=\"http://exist-db.org/test\"; t:test()")
            .unwrap_err();
        assert!(matches!(err, XQueryError::UnknownFunction { arity: 0, .. }));

        let err = compiler
            .compile("import module namespace m=\"urn:missing\"; 1")
            .unwrap_err();
        assert!(matches!(err, XQueryError::Compile { .. }));

        assert!(matches!(
            compiler.compile("count(1, 2)"),
            Err(XQueryError::ArityMismatch { expected: 1, found: 2, .. })
        ));
        assert!(matches!(
            compiler.compile("fn:nope()"),
            Err(XQueryError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_library_modules_rejected_as_queries() {
        let compiler = XQueryCompiler::new();
        assert!(compiler.compile("module namespace t=\"urn:t\";").is_err());
        assert!(compiler.register_module("1").is_err());
    }

    #[test]
    fn test_function_outside_module_namespace() {
        let compiler = XQueryCompiler::new();
        compiler
            .register_module(
                "module namespace t=\"urn:t\";\
                 declare function local:f() { 1 };",
            )
            .unwrap();
        let err = compiler
            .compile("import module namespace t=\"urn:t\"; 1")
            .unwrap_err();
        assert!(matches!(err, XQueryError::Compile { .. }));
    }

    #[test]
    fn test_circular_import() {
        let compiler = XQueryCompiler::new();
        compiler
            .register_module(
                "module namespace a=\"urn:a\";\
                 import module namespace b=\"urn:b\";\
                 declare function a:f() { 1 };",
            )
            .unwrap();
        compiler
            .register_module(
                "module namespace b=\"urn:b\";\
                 import module namespace a=\"urn:a\";\
                 declare function b:f() { 2 };",
            )
            .unwrap();

        let err = compiler
            .compile("import module namespace a=\"urn:a\"; a:f()")
            .unwrap_err();
        assert!(matches!(err, XQueryError::Compile { ref message, .. } if message.contains("circular")));
    }

    #[test]
    fn test_nesting_limit() {
        let compiler = compiler();
        let deep = format!("{}'x'{}", "concat(".repeat(20_000), ")".repeat(20_000));
        assert!(matches!(
            compiler.compile(&deep),
            Err(XQueryError::Compile { ref message, .. }) if message.contains("nested too deeply")
        ));
        let err = compiler
            .register_module(&format!(
                "module namespace d=\"urn:d\"; declare function d:f() {{ {}1{} }};",
                "(".repeat(10_000),
                ")".repeat(10_000)
            ))
            .unwrap_err();
        assert!(matches!(err, XQueryError::Compile { .. }));

        let depth = grammar::MAX_NESTING_DEPTH - 1;
        let plan = compiler
            .compile(&format!("{}'x'{}", "concat(".repeat(depth), ")".repeat(depth)))
            .unwrap();
        assert!(plan.expr_count() > depth);
    }
}
