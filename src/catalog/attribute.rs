//! Attribute entities: immutable named values attached to an IO namespace.

use crate::catalog::arena::SlotKey;
use crate::types::{DataType, DataTypeTag, Params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Copyable reference to an attribute of element type `T`
pub struct AttrHandle<T> {
    key: SlotKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttrHandle<T> {
    pub(crate) fn new(key: SlotKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn key(self) -> SlotKey {
        self.key
    }
}

impl<T> Clone for AttrHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttrHandle<T> {}

impl<T> PartialEq for AttrHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for AttrHandle<T> {}

impl<T> fmt::Debug for AttrHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttrHandle({:?})", self.key)
    }
}

/// Either one value or an owned array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue<T> {
    Single(T),
    Array(Vec<T>),
}

/// A named, typed, immutable piece of metadata
#[derive(Debug, Clone)]
pub struct Attribute<T: DataType> {
    name: String,
    value: AttributeValue<T>,
}

impl<T: DataType> Attribute<T> {
    pub(crate) fn new(name: &str, value: AttributeValue<T>) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> DataTypeTag {
        T::TAG
    }

    pub fn value(&self) -> &AttributeValue<T> {
        &self.value
    }

    pub fn is_single_value(&self) -> bool {
        matches!(self.value, AttributeValue::Single(_))
    }

    /// Values as a slice (length one for single values)
    pub fn as_slice(&self) -> &[T] {
        match &self.value {
            AttributeValue::Single(v) => std::slice::from_ref(v),
            AttributeValue::Array(values) => values,
        }
    }

    pub fn elements(&self) -> usize {
        self.as_slice().len()
    }

    /// Introspection record used by `available_attributes`
    pub fn info(&self) -> Params {
        let render = |v: &T| match T::TAG {
            DataTypeTag::String => format!("\"{}\"", v),
            _ => v.to_string(),
        };
        let value = match &self.value {
            AttributeValue::Single(v) => render(v),
            AttributeValue::Array(values) => format!(
                "{{ {} }}",
                values.iter().map(render).collect::<Vec<_>>().join(", ")
            ),
        };

        let mut params = Params::new();
        params.insert("Type".into(), T::TAG.as_str().into());
        params.insert("Elements".into(), self.elements().to_string());
        params.insert("Value".into(), value);
        params
    }
}
