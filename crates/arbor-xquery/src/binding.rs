//! Execution bindings.
//!
//! A [`BindingTable`] holds everything one execution writes while it runs a
//! plan, in slots parallel to the plan's arena. An unset slot reads as
//! `None`.

use arbor_common::types::DocumentSet;

use crate::plan::{ExprId, FunctionId, VariableId};
use crate::value::Sequence;

/// Variables captured by one function value, in declaration order.
pub type Captures = Vec<(String, Sequence)>;

/// Slots of a function declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionBinding {
    /// Arguments of the current call.
    pub arguments: Option<Vec<Sequence>>,
    /// Documents the function's evaluation touched.
    pub context_docs: Option<DocumentSet>,
    /// Captures of every function value created from this declaration,
    /// called or not.
    pub closures: Vec<Captures>,
}

impl FunctionBinding {
    /// Returns true if no slot is set.
    pub fn is_unset(&self) -> bool {
        self.arguments.is_none() && self.context_docs.is_none() && self.closures.is_empty()
    }

    /// Returns the captures of the `index`th function value.
    pub fn closure(&self, index: usize) -> Option<&Captures> {
        self.closures.get(index)
    }

    fn clear(&mut self) -> bool {
        let was_set = !self.is_unset();
        *self = Self::default();
        was_set
    }
}

/// Slots of a global variable declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableBinding {
    /// Documents the initializer touched.
    pub context_docs: Option<DocumentSet>,
    /// Value, computed on first reference.
    pub value: Option<Sequence>,
}

impl VariableBinding {
    /// Returns true if no slot is set.
    pub fn is_unset(&self) -> bool {
        self.context_docs.is_none() && self.value.is_none()
    }

    fn clear(&mut self) -> bool {
        let was_set = !self.is_unset();
        *self = Self::default();
        was_set
    }
}

/// Per-execution state of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTable {
    functions: Vec<FunctionBinding>,
    variables: Vec<VariableBinding>,
    exprs: Vec<Option<DocumentSet>>,
}

impl BindingTable {
    pub(crate) fn new(functions: usize, variables: usize, exprs: usize) -> Self {
        Self {
            functions: vec![FunctionBinding::default(); functions],
            variables: vec![VariableBinding::default(); variables],
            exprs: vec![None; exprs],
        }
    }

    /// Returns the slots of a function.
    pub fn function(&self, id: FunctionId) -> Option<&FunctionBinding> {
        self.functions.get(id.index())
    }

    /// Returns the slots of a function for writing.
    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut FunctionBinding> {
        self.functions.get_mut(id.index())
    }

    /// Returns the slots of a variable.
    pub fn variable(&self, id: VariableId) -> Option<&VariableBinding> {
        self.variables.get(id.index())
    }

    /// Returns the slots of a variable for writing.
    pub fn variable_mut(&mut self, id: VariableId) -> Option<&mut VariableBinding> {
        self.variables.get_mut(id.index())
    }

    /// Returns the context document set of an expression.
    pub fn expr_docs(&self, id: ExprId) -> Option<&DocumentSet> {
        self.exprs.get(id.index()).and_then(Option::as_ref)
    }

    /// Sets the context document set of an expression.
    pub fn set_expr_docs(&mut self, id: ExprId, docs: DocumentSet) {
        if let Some(slot) = self.exprs.get_mut(id.index()) {
            *slot = Some(docs);
        }
    }

    /// Returns true if every slot is unset.
    pub fn is_pristine(&self) -> bool {
        self.functions.iter().all(FunctionBinding::is_unset)
            && self.variables.iter().all(VariableBinding::is_unset)
            && self.exprs.iter().all(Option::is_none)
    }

    /// Returns the number of set slots.
    pub fn bound_slots(&self) -> usize {
        self.functions.iter().filter(|f| !f.is_unset()).count()
            + self.variables.iter().filter(|v| !v.is_unset()).count()
            + self.exprs.iter().filter(|e| e.is_some()).count()
    }

    pub(crate) fn clear_function(&mut self, id: FunctionId) -> bool {
        self.functions.get_mut(id.index()).is_some_and(FunctionBinding::clear)
    }

    pub(crate) fn clear_variable(&mut self, id: VariableId) -> bool {
        self.variables.get_mut(id.index()).is_some_and(VariableBinding::clear)
    }

    pub(crate) fn clear_expr(&mut self, id: ExprId) -> bool {
        self.exprs
            .get_mut(id.index())
            .is_some_and(|slot| slot.take().is_some())
    }

    /// Clears every slot. Returns how many were set.
    pub(crate) fn clear_all(&mut self) -> usize {
        let mut cleared = 0;
        for f in &mut self.functions {
            cleared += usize::from(f.clear());
        }
        for v in &mut self.variables {
            cleared += usize::from(v.clear());
        }
        for e in &mut self.exprs {
            cleared += usize::from(e.take().is_some());
        }
        cleared
    }
}
