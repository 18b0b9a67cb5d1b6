//! Runtime values.

use std::fmt;

use arbor_common::types::PlanId;

use crate::error::{XQueryError, XQueryResult};
use crate::plan::FunctionId;

/// A function value created during an execution.
///
/// The captured variables live in the execution's binding table, addressed
/// by `closure`. They are gone once the plan is checked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionItem {
    /// Plan the function belongs to.
    pub plan: PlanId,
    /// The inline function declaration.
    pub function: FunctionId,
    /// Index of this value's captures among those of `function`.
    pub closure: usize,
}

/// A single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// `xs:string`.
    String(String),
    /// `xs:integer`.
    Integer(i64),
    /// `xs:boolean`.
    Boolean(bool),
    /// A function value.
    Function(FunctionItem),
}

impl Item {
    /// Returns the string value of an atomic item.
    pub fn string_value(&self) -> XQueryResult<String> {
        match self {
            Item::String(s) => Ok(s.clone()),
            Item::Integer(i) => Ok(i.to_string()),
            Item::Boolean(b) => Ok(b.to_string()),
            Item::Function(_) => Err(XQueryError::Type(
                "function items have no string value".to_string(),
            )),
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::String(s) => f.write_str(s),
            Item::Integer(i) => write!(f, "{i}"),
            Item::Boolean(b) => write!(f, "{b}"),
            Item::Function(func) => write!(f, "function#{}", func.function.index()),
        }
    }
}

impl From<&str> for Item {
    fn from(s: &str) -> Self {
        Item::String(s.to_string())
    }
}

impl From<String> for Item {
    fn from(s: String) -> Self {
        Item::String(s)
    }
}

impl From<i64> for Item {
    fn from(i: i64) -> Self {
        Item::Integer(i)
    }
}

impl From<i32> for Item {
    fn from(i: i32) -> Self {
        Item::Integer(i64::from(i))
    }
}

impl From<bool> for Item {
    fn from(b: bool) -> Self {
        Item::Boolean(b)
    }
}

/// An ordered sequence of items. Sequences never nest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    items: Vec<Item>,
}

impl Sequence {
    /// The empty sequence.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A sequence of one item.
    pub fn one(item: impl Into<Item>) -> Self {
        Self {
            items: vec![item.into()],
        }
    }

    /// Appends every item of `other`.
    pub fn extend(&mut self, other: Sequence) {
        self.items.extend(other.items);
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true for the empty sequence.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the items.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Returns the item at `index`.
    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    /// Returns the only item, or `None` for the empty sequence.
    ///
    /// Fails for sequences of more than one item.
    pub fn single(&self) -> XQueryResult<Option<&Item>> {
        match self.items.as_slice() {
            [] => Ok(None),
            [item] => Ok(Some(item)),
            _ => Err(XQueryError::Type(format!(
                "expected at most one item, got {}",
                self.items.len()
            ))),
        }
    }

    /// Returns the string values of every item.
    pub fn strings(&self) -> XQueryResult<Vec<String>> {
        self.items.iter().map(Item::string_value).collect()
    }
}

impl From<Vec<Item>> for Sequence {
    fn from(items: Vec<Item>) -> Self {
        Self { items }
    }
}

impl From<Item> for Sequence {
    fn from(item: Item) -> Self {
        Sequence::one(item)
    }
}

impl FromIterator<Item> for Sequence {
    fn from_iter<T: IntoIterator<Item = Item>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Sequence {
    type Item = Item;
    type IntoIter = std::vec::IntoIter<Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}
