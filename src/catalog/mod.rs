//! Variable and attribute catalog of one IO namespace
//!
//! The catalog owns every declared [`Variable`] and [`Attribute`]. Entities
//! are stored in one typed [`Bucket`] per element type, and a name-keyed
//! [`DataMap`] per entity kind records which bucket (type tag) and which slot
//! holds each name. Typed access goes straight to the right bucket through
//! [`DataType`]; code that only knows the runtime tag dispatches through
//! [`DataTypeTag::visit`].
//!
//! # Handles
//!
//! Definitions return copyable handles ([`VarHandle`], [`AttrHandle`]) rather
//! than references. Removing an entity retires its slot generation, so a
//! handle kept past `remove_*` resolves to `None` instead of dangling.
//!
//! # Duplicate names
//!
//! With debug checks enabled, defining an existing name fails with
//! [`AdaptioError::DuplicateName`] and dimensions are validated. With checks
//! disabled the new definition silently replaces the old one.

pub mod arena;
pub mod attribute;
pub mod variable;

pub use arena::{Bucket, SlotKey};
pub use attribute::{AttrHandle, Attribute, AttributeValue};
pub use variable::{
    Compound, CompoundField, CompoundLayout, Selection, VarHandle, Variable, VariableCompound,
};

use crate::engine::payload::{self, AttributeRecord};
use crate::error::{AdaptioError, Result};
use crate::types::{ordered_min_max, Complex32, Complex64, DataType, DataTypeTag, Params, TypeVisitor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Location of a named entity: its element type and its slot in that type's bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataMapEntry {
    pub type_tag: DataTypeTag,
    pub key: SlotKey,
}

impl DataMapEntry {
    /// Type name as reported by introspection
    pub fn type_name(&self) -> &'static str {
        self.type_tag.as_str()
    }
}

/// Name → (type, slot) map used for both variables and attributes
pub type DataMap = HashMap<String, DataMapEntry>;

macro_rules! typed_buckets {
    ($( $vars:ident, $attrs:ident : $ty:ty; )*) => {
        /// One bucket per element type, for variables and for attributes
        #[doc(hidden)]
        #[derive(Debug, Default)]
        pub struct TypedBuckets {
            $(
                $vars: Bucket<Variable<$ty>>,
                $attrs: Bucket<Attribute<$ty>>,
            )*
            compound: Bucket<VariableCompound>,
        }

        impl TypedBuckets {
            fn clear_variables(&mut self) {
                $( self.$vars.clear(); )*
                self.compound.clear();
            }

            fn clear_attributes(&mut self) {
                $( self.$attrs.clear(); )*
            }
        }
    };
}

typed_buckets! {
    int8, int8_attrs: i8;
    int16, int16_attrs: i16;
    int32, int32_attrs: i32;
    int64, int64_attrs: i64;
    uint8, uint8_attrs: u8;
    uint16, uint16_attrs: u16;
    uint32, uint32_attrs: u32;
    uint64, uint64_attrs: u64;
    float, float_attrs: f32;
    double, double_attrs: f64;
    cfloat, cfloat_attrs: Complex32;
    cdouble, cdouble_attrs: Complex64;
    string, string_attrs: String;
}

macro_rules! impl_data_type {
    (@accessors $tag:ident, $vars:ident, $attrs:ident) => {
        const TAG: DataTypeTag = DataTypeTag::$tag;

        fn variables(buckets: &TypedBuckets) -> &Bucket<Variable<Self>> {
            &buckets.$vars
        }

        fn variables_mut(buckets: &mut TypedBuckets) -> &mut Bucket<Variable<Self>> {
            &mut buckets.$vars
        }

        fn attributes(buckets: &TypedBuckets) -> &Bucket<Attribute<Self>> {
            &buckets.$attrs
        }

        fn attributes_mut(buckets: &mut TypedBuckets) -> &mut Bucket<Attribute<Self>> {
            &mut buckets.$attrs
        }
    };
    (ordered $( $ty:ty => $tag:ident, $vars:ident, $attrs:ident; )*) => {
        $(
            impl DataType for $ty {
                impl_data_type!(@accessors $tag, $vars, $attrs);

                fn min_max(values: &[Self]) -> Option<(Self, Self)> {
                    ordered_min_max(values)
                }
            }
        )*
    };
    (unordered $( $ty:ty => $tag:ident, $vars:ident, $attrs:ident; )*) => {
        $(
            impl DataType for $ty {
                impl_data_type!(@accessors $tag, $vars, $attrs);
            }
        )*
    };
}

impl_data_type! { ordered
    i8 => Int8, int8, int8_attrs;
    i16 => Int16, int16, int16_attrs;
    i32 => Int32, int32, int32_attrs;
    i64 => Int64, int64, int64_attrs;
    u8 => UInt8, uint8, uint8_attrs;
    u16 => UInt16, uint16, uint16_attrs;
    u32 => UInt32, uint32, uint32_attrs;
    u64 => UInt64, uint64, uint64_attrs;
    f32 => Float, float, float_attrs;
    f64 => Double, double, double_attrs;
}

impl_data_type! { unordered
    Complex32 => ComplexFloat, cfloat, cfloat_attrs;
    Complex64 => ComplexDouble, cdouble, cdouble_attrs;
    String => String, string, string_attrs;
}

/// Schema of one variable as exchanged between producer and consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub name: String,
    pub type_tag: DataTypeTag,
    pub selection: Selection,
    pub constant_dims: bool,
    pub layout: Option<CompoundLayout>,
}

/// Owns the variables and attributes of one IO namespace
#[derive(Debug, Default)]
pub struct VariableCatalog {
    debug_mode: bool,
    definition_final: bool,
    variables: DataMap,
    attributes: DataMap,
    buckets: TypedBuckets,
}

impl VariableCatalog {
    pub fn new(debug_mode: bool) -> Self {
        Self {
            debug_mode,
            ..Self::default()
        }
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Latch that the variable and attribute set will not change anymore.
    ///
    /// Advisory: later definitions still succeed, but engines may stop
    /// re-sending schema and attributes with every step.
    pub fn set_definition_final(&mut self) {
        self.definition_final = true;
    }

    pub fn is_definition_final(&self) -> bool {
        self.definition_final
    }

    // ==================== Definitions ====================

    /// Define a variable of element type `T`.
    ///
    /// An empty `shape` declares a local variable; empty `shape` and `count`
    /// declare a single value per step.
    pub fn define_variable<T: DataType>(
        &mut self,
        name: &str,
        shape: &[usize],
        start: &[usize],
        count: &[usize],
        constant_dims: bool,
    ) -> Result<VarHandle<T>> {
        let selection = Selection::new(shape, start, count);
        selection.check_extent(name, std::mem::size_of::<T>())?;
        self.prepare_variable_name(name)?;
        if self.debug_mode {
            selection.validate(name)?;
        }
        Ok(self.insert_variable(name, selection, constant_dims))
    }

    /// Define a single-value variable (no shape, no count)
    pub fn define_value<T: DataType>(&mut self, name: &str) -> Result<VarHandle<T>> {
        self.define_variable(name, &[], &[], &[], true)
    }

    /// Define a variable of structured records described by `layout`
    pub fn define_compound_variable(
        &mut self,
        name: &str,
        layout: CompoundLayout,
        shape: &[usize],
        start: &[usize],
        count: &[usize],
        constant_dims: bool,
    ) -> Result<VarHandle<variable::Compound>> {
        let selection = Selection::new(shape, start, count);
        selection.check_extent(name, layout.element_size())?;
        self.prepare_variable_name(name)?;
        if self.debug_mode {
            selection.validate(name)?;
        }
        Ok(self.insert_compound(name, layout, selection, constant_dims))
    }

    /// Define an attribute holding one value
    pub fn define_attribute<T: DataType>(&mut self, name: &str, value: T) -> Result<AttrHandle<T>> {
        self.prepare_attribute_name(name)?;
        Ok(self.insert_attribute(name, AttributeValue::Single(value)))
    }

    /// Define an attribute holding a copy of `values`
    pub fn define_attribute_array<T: DataType>(
        &mut self,
        name: &str,
        values: &[T],
    ) -> Result<AttrHandle<T>> {
        self.prepare_attribute_name(name)?;
        Ok(self.insert_attribute(name, AttributeValue::Array(values.to_vec())))
    }

    // ==================== Removal ====================

    /// Remove a variable; returns whether it existed. Its handles go stale.
    pub fn remove_variable(&mut self, name: &str) -> bool {
        let Some(entry) = self.variables.remove(name) else {
            return false;
        };
        match entry.type_tag {
            DataTypeTag::Compound => self.buckets.compound.remove(entry.key).is_some(),
            tag => tag
                .visit(RemoveVariable {
                    buckets: &mut self.buckets,
                    key: entry.key,
                })
                .unwrap_or(false),
        }
    }

    /// Remove an attribute; returns whether it existed. Its handles go stale.
    pub fn remove_attribute(&mut self, name: &str) -> bool {
        let Some(entry) = self.attributes.remove(name) else {
            return false;
        };
        entry
            .type_tag
            .visit(RemoveAttribute {
                buckets: &mut self.buckets,
                key: entry.key,
            })
            .unwrap_or(false)
    }

    pub fn remove_all_variables(&mut self) {
        self.variables.clear();
        self.buckets.clear_variables();
    }

    pub fn remove_all_attributes(&mut self) {
        self.attributes.clear();
        self.buckets.clear_attributes();
    }

    // ==================== Inquiry ====================

    /// Handle to variable `name` if it exists with element type `T`
    pub fn inquire_variable<T: DataType>(&self, name: &str) -> Option<VarHandle<T>> {
        self.variables
            .get(name)
            .filter(|entry| entry.type_tag == T::TAG)
            .map(|entry| VarHandle::new(entry.key))
    }

    pub fn inquire_compound_variable(&self, name: &str) -> Option<VarHandle<variable::Compound>> {
        self.variables
            .get(name)
            .filter(|entry| entry.type_tag == DataTypeTag::Compound)
            .map(|entry| VarHandle::new(entry.key))
    }

    /// Handle to attribute `name` if it exists with element type `T`
    pub fn inquire_attribute<T: DataType>(&self, name: &str) -> Option<AttrHandle<T>> {
        self.attributes
            .get(name)
            .filter(|entry| entry.type_tag == T::TAG)
            .map(|entry| AttrHandle::new(entry.key))
    }

    pub fn inquire_variable_type(&self, name: &str) -> Option<DataTypeTag> {
        self.variables.get(name).map(|entry| entry.type_tag)
    }

    pub fn inquire_attribute_type(&self, name: &str) -> Option<DataTypeTag> {
        self.attributes.get(name).map(|entry| entry.type_tag)
    }

    pub fn variable<T: DataType>(&self, handle: VarHandle<T>) -> Option<&Variable<T>> {
        T::variables(&self.buckets).get(handle.key())
    }

    pub fn variable_mut<T: DataType>(&mut self, handle: VarHandle<T>) -> Option<&mut Variable<T>> {
        T::variables_mut(&mut self.buckets).get_mut(handle.key())
    }

    /// Typed lookup by name in one call
    pub fn variable_by_name<T: DataType>(&self, name: &str) -> Option<&Variable<T>> {
        self.inquire_variable::<T>(name)
            .and_then(|handle| self.variable(handle))
    }

    pub fn compound_variable(
        &self,
        handle: VarHandle<variable::Compound>,
    ) -> Option<&VariableCompound> {
        self.buckets.compound.get(handle.key())
    }

    pub fn compound_variable_mut(
        &mut self,
        handle: VarHandle<variable::Compound>,
    ) -> Option<&mut VariableCompound> {
        self.buckets.compound.get_mut(handle.key())
    }

    pub fn attribute<T: DataType>(&self, handle: AttrHandle<T>) -> Option<&Attribute<T>> {
        T::attributes(&self.buckets).get(handle.key())
    }

    pub fn attribute_by_name<T: DataType>(&self, name: &str) -> Option<&Attribute<T>> {
        self.inquire_attribute::<T>(name)
            .and_then(|handle| self.attribute(handle))
    }

    pub fn variables_data_map(&self) -> &DataMap {
        &self.variables
    }

    pub fn attributes_data_map(&self) -> &DataMap {
        &self.attributes
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Snapshot of every variable's metadata, keyed by name.
    ///
    /// Keys per variable: Type, Shape, Start, Count, SingleValue, and when
    /// known Min, Max, Value, AvailableStepsStart, AvailableStepsCount.
    pub fn available_variables(&self) -> BTreeMap<String, Params> {
        self.variables
            .iter()
            .filter_map(|(name, entry)| {
                let info = match entry.type_tag {
                    DataTypeTag::Compound => {
                        self.buckets.compound.get(entry.key).map(|v| v.info())
                    }
                    tag => tag
                        .visit(VariableInfo {
                            buckets: &self.buckets,
                            key: entry.key,
                        })
                        .flatten(),
                };
                info.map(|params| (name.clone(), params))
            })
            .collect()
    }

    /// Snapshot of every attribute's metadata (Type, Elements, Value)
    pub fn available_attributes(&self) -> BTreeMap<String, Params> {
        self.attributes
            .iter()
            .filter_map(|(name, entry)| {
                entry
                    .type_tag
                    .visit(AttributeInfo {
                        buckets: &self.buckets,
                        key: entry.key,
                    })
                    .flatten()
                    .map(|params| (name.clone(), params))
            })
            .collect()
    }

    // ==================== Engine support ====================

    /// Schema of every variable, sorted by name
    pub(crate) fn descriptors(&self) -> Vec<VariableDescriptor> {
        let mut descriptors: Vec<_> = self
            .variables
            .iter()
            .filter_map(|(name, entry)| self.descriptor_of(name, *entry))
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    fn descriptor_of(&self, name: &str, entry: DataMapEntry) -> Option<VariableDescriptor> {
        match entry.type_tag {
            DataTypeTag::Compound => {
                self.buckets
                    .compound
                    .get(entry.key)
                    .map(|v| VariableDescriptor {
                        name: name.to_string(),
                        type_tag: DataTypeTag::Compound,
                        selection: v.selection().clone(),
                        constant_dims: v.constant_dims(),
                        layout: Some(v.layout().clone()),
                    })
            }
            tag => tag
                .visit(DescribeVariable {
                    buckets: &self.buckets,
                    key: entry.key,
                })
                .flatten(),
        }
    }

    /// Encoded copy of every attribute, sorted by name
    pub(crate) fn attribute_records(&self) -> Result<Vec<AttributeRecord>> {
        let mut records = Vec::with_capacity(self.attributes.len());
        for entry in self.attributes.values() {
            let encoded = entry.type_tag.visit(EncodeAttribute {
                buckets: &self.buckets,
                key: entry.key,
            });
            if let Some(Some(record)) = encoded {
                records.push(record?);
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Define or update a variable from a schema received from a producer
    pub(crate) fn adopt_descriptor(&mut self, descriptor: &VariableDescriptor) {
        if let Some(entry) = self.variables.get(&descriptor.name).copied() {
            if entry.type_tag == descriptor.type_tag {
                self.adopt_existing(entry, descriptor);
                return;
            }
            self.remove_variable(&descriptor.name);
        }

        match (&descriptor.layout, descriptor.type_tag) {
            (Some(layout), DataTypeTag::Compound) => {
                self.insert_compound(
                    &descriptor.name,
                    layout.clone(),
                    descriptor.selection.clone(),
                    descriptor.constant_dims,
                );
            }
            (_, tag) => {
                tag.visit(InsertVariable {
                    catalog: self,
                    descriptor,
                });
            }
        }
    }

    /// Define or replace an attribute received from a producer
    pub(crate) fn adopt_attribute(&mut self, record: &AttributeRecord) -> Result<()> {
        self.remove_attribute(&record.name);
        match record.type_tag.visit(InsertAttribute {
            catalog: self,
            record,
        }) {
            Some(result) => result,
            None => Err(AdaptioError::Serialization(format!(
                "attribute '{}' has unsupported type {}",
                record.name, record.type_tag
            ))),
        }
    }

    fn adopt_existing(&mut self, entry: DataMapEntry, descriptor: &VariableDescriptor) {
        match entry.type_tag {
            DataTypeTag::Compound => {
                if let Some(var) = self.buckets.compound.get_mut(entry.key) {
                    var.adopt_selection(descriptor.selection.clone());
                }
            }
            tag => {
                tag.visit(AdoptSelection {
                    buckets: &mut self.buckets,
                    key: entry.key,
                    selection: &descriptor.selection,
                });
            }
        }
    }

    // ==================== Internals ====================

    fn prepare_variable_name(&mut self, name: &str) -> Result<()> {
        if self.variables.contains_key(name) {
            if self.debug_mode {
                return Err(AdaptioError::DuplicateName {
                    kind: "variable",
                    name: name.to_string(),
                });
            }
            tracing::debug!("Redefining variable '{}'", name);
            self.remove_variable(name);
        }
        Ok(())
    }

    fn prepare_attribute_name(&mut self, name: &str) -> Result<()> {
        if self.attributes.contains_key(name) {
            if self.debug_mode {
                return Err(AdaptioError::DuplicateName {
                    kind: "attribute",
                    name: name.to_string(),
                });
            }
            tracing::debug!("Redefining attribute '{}'", name);
            self.remove_attribute(name);
        }
        Ok(())
    }

    fn insert_variable<T: DataType>(
        &mut self,
        name: &str,
        selection: Selection,
        constant_dims: bool,
    ) -> VarHandle<T> {
        let variable = Variable::<T>::new(name, selection, constant_dims, self.debug_mode);
        let key = T::variables_mut(&mut self.buckets).insert(variable);
        self.variables.insert(
            name.to_string(),
            DataMapEntry {
                type_tag: T::TAG,
                key,
            },
        );
        VarHandle::new(key)
    }

    fn insert_compound(
        &mut self,
        name: &str,
        layout: CompoundLayout,
        selection: Selection,
        constant_dims: bool,
    ) -> VarHandle<variable::Compound> {
        let key = self
            .buckets
            .compound
            .insert(VariableCompound::new(name, layout, selection, constant_dims));
        self.variables.insert(
            name.to_string(),
            DataMapEntry {
                type_tag: DataTypeTag::Compound,
                key,
            },
        );
        VarHandle::new(key)
    }

    fn insert_attribute<T: DataType>(&mut self, name: &str, value: AttributeValue<T>) -> AttrHandle<T> {
        let key = T::attributes_mut(&mut self.buckets).insert(Attribute::new(name, value));
        self.attributes.insert(
            name.to_string(),
            DataMapEntry {
                type_tag: T::TAG,
                key,
            },
        );
        AttrHandle::new(key)
    }
}

// ==================== Tag dispatch ====================

struct RemoveVariable<'a> {
    buckets: &'a mut TypedBuckets,
    key: SlotKey,
}

impl TypeVisitor for RemoveVariable<'_> {
    type Output = bool;

    fn visit<T: DataType>(self) -> bool {
        T::variables_mut(self.buckets).remove(self.key).is_some()
    }
}

struct RemoveAttribute<'a> {
    buckets: &'a mut TypedBuckets,
    key: SlotKey,
}

impl TypeVisitor for RemoveAttribute<'_> {
    type Output = bool;

    fn visit<T: DataType>(self) -> bool {
        T::attributes_mut(self.buckets).remove(self.key).is_some()
    }
}

struct VariableInfo<'a> {
    buckets: &'a TypedBuckets,
    key: SlotKey,
}

impl TypeVisitor for VariableInfo<'_> {
    type Output = Option<Params>;

    fn visit<T: DataType>(self) -> Option<Params> {
        T::variables(self.buckets).get(self.key).map(|v| v.info())
    }
}

struct AttributeInfo<'a> {
    buckets: &'a TypedBuckets,
    key: SlotKey,
}

impl TypeVisitor for AttributeInfo<'_> {
    type Output = Option<Params>;

    fn visit<T: DataType>(self) -> Option<Params> {
        T::attributes(self.buckets).get(self.key).map(|a| a.info())
    }
}

struct DescribeVariable<'a> {
    buckets: &'a TypedBuckets,
    key: SlotKey,
}

impl TypeVisitor for DescribeVariable<'_> {
    type Output = Option<VariableDescriptor>;

    fn visit<T: DataType>(self) -> Option<VariableDescriptor> {
        T::variables(self.buckets)
            .get(self.key)
            .map(|v| VariableDescriptor {
                name: v.name().to_string(),
                type_tag: T::TAG,
                selection: v.selection().clone(),
                constant_dims: v.constant_dims(),
                layout: None,
            })
    }
}

struct AdoptSelection<'a> {
    buckets: &'a mut TypedBuckets,
    key: SlotKey,
    selection: &'a Selection,
}

impl TypeVisitor for AdoptSelection<'_> {
    type Output = ();

    fn visit<T: DataType>(self) {
        if let Some(var) = T::variables_mut(self.buckets).get_mut(self.key) {
            var.adopt_selection(self.selection.clone());
        }
    }
}

struct InsertVariable<'a> {
    catalog: &'a mut VariableCatalog,
    descriptor: &'a VariableDescriptor,
}

impl TypeVisitor for InsertVariable<'_> {
    type Output = ();

    fn visit<T: DataType>(self) {
        self.catalog.insert_variable::<T>(
            &self.descriptor.name,
            self.descriptor.selection.clone(),
            self.descriptor.constant_dims,
        );
    }
}

struct EncodeAttribute<'a> {
    buckets: &'a TypedBuckets,
    key: SlotKey,
}

impl TypeVisitor for EncodeAttribute<'_> {
    type Output = Option<Result<AttributeRecord>>;

    fn visit<T: DataType>(self) -> Option<Result<AttributeRecord>> {
        T::attributes(self.buckets)
            .get(self.key)
            .map(payload::encode_attribute)
    }
}

struct InsertAttribute<'a> {
    catalog: &'a mut VariableCatalog,
    record: &'a AttributeRecord,
}

impl TypeVisitor for InsertAttribute<'_> {
    type Output = Result<()>;

    fn visit<T: DataType>(self) -> Result<()> {
        let value = payload::decode_attribute::<T>(self.record)?;
        self.catalog.insert_attribute(&self.record.name, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debug_catalog() -> VariableCatalog {
        VariableCatalog::new(true)
    }

    #[test]
    fn test_define_and_inquire() {
        let mut catalog = debug_catalog();
        let handle = catalog
            .define_variable::<f64>("temperature", &[100], &[0], &[100], true)
            .unwrap();
        let found = catalog.inquire_variable::<f64>("temperature").unwrap();
        assert_eq!(found, handle);

        let var = catalog.variable(found).unwrap();
        assert_eq!(var.shape(), &[100]);
        assert_eq!(var.start(), &[0]);
        assert_eq!(var.count(), &[100]);
        assert!(var.constant_dims());
        assert_eq!(
            catalog.inquire_variable_type("temperature"),
            Some(DataTypeTag::Double)
        );
    }

    #[test]
    fn test_inquire_wrong_type_is_absent() {
        let mut catalog = debug_catalog();
        catalog
            .define_variable::<f32>("pressure", &[4], &[0], &[4], false)
            .unwrap();
        assert!(catalog.inquire_variable::<f64>("pressure").is_none());
        assert!(catalog.inquire_variable::<i32>("pressure").is_none());
        assert!(catalog.inquire_variable::<f32>("missing").is_none());
    }

    #[test]
    fn test_duplicate_name_in_debug_mode() {
        let mut catalog = debug_catalog();
        catalog.define_value::<i32>("step").unwrap();
        let err = catalog.define_value::<i64>("step").unwrap_err();
        assert!(matches!(err, AdaptioError::DuplicateName { kind: "variable", .. }));
    }

    #[test]
    fn test_duplicate_name_without_checks_replaces() {
        let mut catalog = VariableCatalog::new(false);
        let old = catalog.define_value::<i32>("step").unwrap();
        let new = catalog.define_value::<i64>("step").unwrap();
        assert!(catalog.variable(old).is_none());
        assert!(catalog.variable(new).is_some());
        assert_eq!(catalog.variable_count(), 1);
        assert_eq!(catalog.inquire_variable_type("step"), Some(DataTypeTag::Int64));
    }

    #[test]
    fn test_invalid_dimensions_rejected_in_debug_mode() {
        let mut catalog = debug_catalog();
        let err = catalog
            .define_variable::<u8>("bad", &[10], &[5], &[6], true)
            .unwrap_err();
        assert!(matches!(err, AdaptioError::InvalidDimensions { .. }));
        assert_eq!(catalog.variable_count(), 0);
    }

    #[test]
    fn test_remove_invalidates_handle() {
        let mut catalog = debug_catalog();
        let handle = catalog
            .define_variable::<u16>("mask", &[8], &[0], &[8], true)
            .unwrap();
        assert!(catalog.remove_variable("mask"));
        assert!(!catalog.remove_variable("mask"));
        assert!(catalog.variable(handle).is_none());
        assert!(catalog.inquire_variable::<u16>("mask").is_none());

        let again = catalog
            .define_variable::<u16>("mask", &[8], &[0], &[8], true)
            .unwrap();
        assert_ne!(again, handle);
        assert!(catalog.variable(handle).is_none());
    }

    #[test]
    fn test_remove_all() {
        let mut catalog = debug_catalog();
        let a = catalog.define_value::<f32>("a").unwrap();
        catalog.define_value::<String>("b").unwrap();
        catalog.define_attribute("units", "m/s".to_string()).unwrap();
        catalog.remove_all_variables();
        assert_eq!(catalog.variable_count(), 0);
        assert!(catalog.variable(a).is_none());
        assert_eq!(catalog.attribute_count(), 1);
        catalog.remove_all_attributes();
        assert_eq!(catalog.attribute_count(), 0);
    }

    #[test]
    fn test_attributes() {
        let mut catalog = debug_catalog();
        let source = vec![1i32, 2, 3];
        let handle = catalog.define_attribute_array("levels", &source).unwrap();
        drop(source);
        let attr = catalog.attribute(handle).unwrap();
        assert_eq!(attr.as_slice(), &[1, 2, 3]);
        assert!(catalog.inquire_attribute::<f64>("levels").is_none());
        assert!(catalog.define_attribute("levels", 4i32).is_err());
        assert!(catalog.remove_attribute("levels"));
        assert!(catalog.attribute(handle).is_none());
    }

    #[test]
    fn test_variable_and_attribute_namespaces_are_disjoint() {
        let mut catalog = debug_catalog();
        catalog.define_value::<f64>("dt").unwrap();
        assert!(catalog.define_attribute("dt", 0.1f64).is_ok());
    }

    #[test]
    fn test_available_variables() {
        let mut catalog = debug_catalog();
        catalog
            .define_variable::<f64>("temperature", &[100], &[0], &[100], true)
            .unwrap();
        catalog.define_value::<u32>("iteration").unwrap();
        let layout = CompoundLayout::new(16)
            .with_field("x", DataTypeTag::Double, 0)
            .unwrap();
        catalog
            .define_compound_variable("particles", layout, &[], &[], &[10], false)
            .unwrap();

        let available = catalog.available_variables();
        assert_eq!(available.len(), 3);
        assert_eq!(available["temperature"]["Type"], "double");
        assert_eq!(available["temperature"]["Shape"], "100");
        assert_eq!(available["iteration"]["SingleValue"], "true");
        assert_eq!(available["particles"]["Type"], "compound");
        assert_eq!(available["particles"]["ElementSize"], "16");
    }

    #[test]
    fn test_available_attributes() {
        let mut catalog = debug_catalog();
        catalog.define_attribute("units", "K".to_string()).unwrap();
        catalog.define_attribute_array("origin", &[0.0f64, 1.0]).unwrap();
        let available = catalog.available_attributes();
        assert_eq!(available["units"]["Value"], "\"K\"");
        assert_eq!(available["origin"]["Elements"], "2");
    }

    #[test]
    fn test_descriptor_adoption_round_trip() {
        let mut writer = debug_catalog();
        writer
            .define_variable::<i64>("ids", &[20], &[10], &[10], false)
            .unwrap();
        writer.define_attribute("label", "run-7".to_string()).unwrap();

        let mut reader = VariableCatalog::new(true);
        for descriptor in writer.descriptors() {
            reader.adopt_descriptor(&descriptor);
        }
        for record in writer.attribute_records().unwrap() {
            reader.adopt_attribute(&record).unwrap();
        }

        let ids = reader.variable_by_name::<i64>("ids").unwrap();
        assert_eq!(ids.shape(), &[20]);
        assert_eq!(ids.start(), &[10]);
        assert_eq!(
            reader.attribute_by_name::<String>("label").unwrap().as_slice(),
            &["run-7".to_string()]
        );

        // Type change on the producer side replaces the consumer's entry
        let retyped = VariableDescriptor {
            name: "ids".into(),
            type_tag: DataTypeTag::Int32,
            selection: Selection::new(&[5], &[0], &[5]),
            constant_dims: true,
            layout: None,
        };
        reader.adopt_descriptor(&retyped);
        assert!(reader.inquire_variable::<i64>("ids").is_none());
        assert_eq!(reader.variable_by_name::<i32>("ids").unwrap().count(), &[5]);
    }
}
