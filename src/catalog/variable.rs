//! Variable entities and their handles.

use crate::catalog::arena::SlotKey;
use crate::error::{AdaptioError, Result};
use crate::types::{element_count, format_dims, DataType, DataTypeTag, Dims, Params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Copyable reference to a variable of element type `T` inside one catalog.
///
/// Handles stay cheap to hold; resolving one after the variable was removed
/// yields `None` (or [`AdaptioError::StaleHandle`] from engine calls).
pub struct VarHandle<T> {
    key: SlotKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> VarHandle<T> {
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

impl<T> Clone for VarHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for VarHandle<T> {}

impl<T> PartialEq for VarHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for VarHandle<T> {}

impl<T> Hash for VarHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T> fmt::Debug for VarHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarHandle({:?})", self.key)
    }
}

/// Marker type for handles to compound (structured) variables
#[derive(Debug)]
pub enum Compound {}

/// Shape, offset and extent of a variable's selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selection {
    pub shape: Dims,
    pub start: Dims,
    pub count: Dims,
}

impl Selection {
    pub fn new(shape: &[usize], start: &[usize], count: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            start: start.to_vec(),
            count: count.to_vec(),
        }
    }

    /// No shape and no count: one value per step
    pub fn is_single_value(&self) -> bool {
        self.shape.is_empty() && self.count.is_empty()
    }

    /// Elements in the local block, saturating at `usize::MAX`
    pub fn element_count(&self) -> usize {
        element_count(&self.count).unwrap_or(usize::MAX)
    }

    /// Reject a count whose block would not fit in memory at
    /// `element_size` bytes per element
    pub fn check_extent(&self, name: &str, element_size: usize) -> Result<()> {
        match element_count(&self.count).and_then(|n| n.checked_mul(element_size)) {
            Some(_) => Ok(()),
            None => Err(AdaptioError::InvalidDimensions {
                name: name.to_string(),
                reason: format!("count [{}] overflows the addressable size", format_dims(&self.count)),
            }),
        }
    }

    /// Check the dimension invariants for variable `name`
    pub fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason: String| AdaptioError::InvalidDimensions {
            name: name.to_string(),
            reason,
        };

        if self.shape.is_empty() {
            if !self.start.is_empty() {
                return Err(invalid("local variable cannot have a start offset".into()));
            }
            return Ok(());
        }

        if self.start.len() != self.shape.len() || self.count.len() != self.shape.len() {
            return Err(invalid(format!(
                "shape, start and count lengths differ ({}, {}, {})",
                self.shape.len(),
                self.start.len(),
                self.count.len()
            )));
        }

        for (i, ((&shape, &start), &count)) in self
            .shape
            .iter()
            .zip(&self.start)
            .zip(&self.count)
            .enumerate()
        {
            match start.checked_add(count) {
                Some(end) if end <= shape => {}
                _ => {
                    return Err(invalid(format!(
                        "dimension {}: start {} + count {} exceeds shape {}",
                        i, start, count, shape
                    )))
                }
            }
        }
        Ok(())
    }

    fn describe(&self, params: &mut Params) {
        if !self.shape.is_empty() {
            params.insert("Shape".into(), format_dims(&self.shape));
            params.insert("Start".into(), format_dims(&self.start));
        }
        if !self.count.is_empty() {
            params.insert("Count".into(), format_dims(&self.count));
        }
        params.insert("SingleValue".into(), self.is_single_value().to_string());
    }
}

/// Step bookkeeping shared by typed and compound variables
#[derive(Debug, Clone, Default)]
struct StepRange {
    first: Option<u64>,
    last: Option<u64>,
    count: u64,
}

impl StepRange {
    fn record(&mut self, step: u64) {
        if self.last == Some(step) {
            return;
        }
        self.first.get_or_insert(step);
        self.last = Some(step);
        self.count += 1;
    }

    fn describe(&self, params: &mut Params) {
        if let Some(first) = self.first {
            params.insert("AvailableStepsStart".into(), first.to_string());
            params.insert("AvailableStepsCount".into(), self.count.to_string());
        }
    }
}

/// A named, typed, multi-dimensional variable
#[derive(Debug, Clone)]
pub struct Variable<T: DataType> {
    name: String,
    selection: Selection,
    constant_dims: bool,
    checked: bool,
    data: Option<Vec<T>>,
    min_max: Option<(T, T)>,
    value: Option<T>,
    steps: StepRange,
}

impl<T: DataType> Variable<T> {
    pub(crate) fn new(
        name: &str,
        selection: Selection,
        constant_dims: bool,
        checked: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            selection,
            constant_dims,
            checked,
            data: None,
            min_max: None,
            value: None,
            steps: StepRange::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> DataTypeTag {
        T::TAG
    }

    pub fn shape(&self) -> &[usize] {
        &self.selection.shape
    }

    pub fn start(&self) -> &[usize] {
        &self.selection.start
    }

    pub fn count(&self) -> &[usize] {
        &self.selection.count
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn constant_dims(&self) -> bool {
        self.constant_dims
    }

    pub fn is_single_value(&self) -> bool {
        self.selection.is_single_value()
    }

    /// Elements expected by a put or get of this variable
    pub fn element_count(&self) -> usize {
        self.selection.element_count()
    }

    /// Change the global shape (not allowed for constant-dims variables)
    pub fn set_shape(&mut self, shape: &[usize]) -> Result<()> {
        self.ensure_mutable_dims()?;
        let selection = Selection {
            shape: shape.to_vec(),
            ..self.selection.clone()
        };
        self.apply(selection)
    }

    /// Change the local start/count (not allowed for constant-dims variables)
    pub fn set_selection(&mut self, start: &[usize], count: &[usize]) -> Result<()> {
        self.ensure_mutable_dims()?;
        let selection = Selection {
            shape: self.selection.shape.clone(),
            start: start.to_vec(),
            count: count.to_vec(),
        };
        self.apply(selection)
    }

    /// Attach owned data that [`crate::engine::EngineRef::put_attached`] sends
    pub fn attach_data(&mut self, data: Vec<T>) {
        self.data = Some(data);
    }

    pub fn attached_data(&self) -> Option<&[T]> {
        self.data.as_deref()
    }

    pub fn min(&self) -> Option<&T> {
        self.min_max.as_ref().map(|(lo, _)| lo)
    }

    pub fn max(&self) -> Option<&T> {
        self.min_max.as_ref().map(|(_, hi)| hi)
    }

    /// Most recent value of a single-value variable
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// (first step, number of steps) this variable appeared in
    pub fn available_steps(&self) -> Option<(u64, u64)> {
        self.steps.first.map(|first| (first, self.steps.count))
    }

    /// Introspection record used by `available_variables`
    pub fn info(&self) -> Params {
        let mut params = Params::new();
        params.insert("Type".into(), T::TAG.as_str().into());
        self.selection.describe(&mut params);
        if let Some((lo, hi)) = &self.min_max {
            params.insert("Min".into(), lo.to_string());
            params.insert("Max".into(), hi.to_string());
        }
        if let Some(value) = &self.value {
            params.insert("Value".into(), value.to_string());
        }
        self.steps.describe(&mut params);
        params
    }

    /// Update statistics after a block moved through an engine
    pub(crate) fn record_block(&mut self, step: u64, values: &[T]) {
        self.steps.record(step);
        if let Some((lo, hi)) = T::min_max(values) {
            self.min_max = match self.min_max.take() {
                Some((old_lo, old_hi)) => T::min_max(&[old_lo, old_hi, lo, hi]),
                None => Some((lo, hi)),
            };
        }
        if self.is_single_value() {
            self.value = values.first().cloned();
        }
    }

    /// Adopt dimensions learned from an incoming step
    pub(crate) fn adopt_selection(&mut self, selection: Selection) {
        self.selection = selection;
    }

    fn ensure_mutable_dims(&self) -> Result<()> {
        if self.constant_dims {
            return Err(AdaptioError::InvalidState(format!(
                "variable '{}' has constant dimensions",
                self.name
            )));
        }
        Ok(())
    }

    fn apply(&mut self, selection: Selection) -> Result<()> {
        selection.check_extent(&self.name, std::mem::size_of::<T>())?;
        if self.checked {
            selection.validate(&self.name)?;
        }
        self.selection = selection;
        Ok(())
    }
}

/// One named member of a compound record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundField {
    pub name: String,
    pub tag: DataTypeTag,
    pub offset: usize,
    pub count: usize,
}

/// Byte layout of a compound element
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompoundLayout {
    element_size: usize,
    fields: Vec<CompoundField>,
}

impl CompoundLayout {
    pub fn new(element_size: usize) -> Self {
        Self {
            element_size,
            fields: Vec::new(),
        }
    }

    /// Add a fixed-size member of `count` elements at byte `offset`
    pub fn add_field(
        &mut self,
        name: &str,
        tag: DataTypeTag,
        offset: usize,
        count: usize,
    ) -> Result<()> {
        let size = tag.size_bytes().ok_or_else(|| {
            AdaptioError::Config(format!("compound field '{}' must have a fixed-size type", name))
        })?;
        let end = size
            .checked_mul(count)
            .and_then(|bytes| bytes.checked_add(offset));
        match end {
            Some(end) if end <= self.element_size => {}
            _ => {
                return Err(AdaptioError::Config(format!(
                    "compound field '{}' does not fit in {} bytes",
                    name, self.element_size
                )))
            }
        }
        if self.fields.iter().any(|f| f.name == name) {
            return Err(AdaptioError::DuplicateName {
                kind: "compound field",
                name: name.to_string(),
            });
        }
        self.fields.push(CompoundField {
            name: name.to_string(),
            tag,
            offset,
            count,
        });
        Ok(())
    }

    /// Builder form of [`Self::add_field`]
    pub fn with_field(mut self, name: &str, tag: DataTypeTag, offset: usize) -> Result<Self> {
        self.add_field(name, tag, offset, 1)?;
        Ok(self)
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn fields(&self) -> &[CompoundField] {
        &self.fields
    }
}

/// A variable whose elements are raw structured records
#[derive(Debug, Clone)]
pub struct VariableCompound {
    name: String,
    selection: Selection,
    constant_dims: bool,
    layout: CompoundLayout,
    steps: StepRange,
}

impl VariableCompound {
    pub(crate) fn new(
        name: &str,
        layout: CompoundLayout,
        selection: Selection,
        constant_dims: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            selection,
            constant_dims,
            layout,
            steps: StepRange::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &CompoundLayout {
        &self.layout
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn constant_dims(&self) -> bool {
        self.constant_dims
    }

    /// Bytes expected by a put or get of this variable
    pub fn byte_count(&self) -> usize {
        self.selection
            .element_count()
            .saturating_mul(self.layout.element_size)
    }

    pub fn info(&self) -> Params {
        let mut params = Params::new();
        params.insert("Type".into(), DataTypeTag::Compound.as_str().into());
        self.selection.describe(&mut params);
        params.insert("ElementSize".into(), self.layout.element_size.to_string());
        let fields = self
            .layout
            .fields
            .iter()
            .map(|f| format!("{}:{}@{}", f.name, f.tag, f.offset))
            .collect::<Vec<_>>()
            .join(", ");
        params.insert("Fields".into(), fields);
        self.steps.describe(&mut params);
        params
    }

    pub(crate) fn record_step(&mut self, step: u64) {
        self.steps.record(step);
    }

    pub(crate) fn adopt_selection(&mut self, selection: Selection) {
        self.selection = selection;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(shape: &[usize], start: &[usize], count: &[usize]) -> Selection {
        Selection::new(shape, start, count)
    }

    #[test]
    fn test_selection_validation() {
        assert!(global(&[100], &[0], &[100]).validate("t").is_ok());
        assert!(global(&[100], &[50], &[60]).validate("t").is_err());
        assert!(global(&[10, 10], &[0], &[10, 10]).validate("t").is_err());
        assert!(global(&[], &[], &[4]).validate("local").is_ok());
        assert!(global(&[], &[1], &[4]).validate("local").is_err());
        assert!(global(&[usize::MAX], &[usize::MAX], &[2]).validate("t").is_err());
    }

    #[test]
    fn test_single_value_detection() {
        assert!(Selection::default().is_single_value());
        assert!(!global(&[], &[], &[3]).is_single_value());
        assert_eq!(Selection::default().element_count(), 1);
    }

    #[test]
    fn test_constant_dims_reject_changes() {
        let mut var: Variable<f64> =
            Variable::new("t", global(&[10], &[0], &[10]), true, true);
        assert!(matches!(
            var.set_selection(&[0], &[5]),
            Err(AdaptioError::InvalidState(_))
        ));
    }

    #[test]
    fn test_set_selection_validates_when_checked() {
        let mut var: Variable<i32> =
            Variable::new("t", global(&[10], &[0], &[10]), false, true);
        assert!(var.set_selection(&[5], &[5]).is_ok());
        assert_eq!(var.start(), &[5]);
        assert!(var.set_selection(&[8], &[5]).is_err());
        assert_eq!(var.count(), &[5]);

        let mut unchecked: Variable<i32> =
            Variable::new("u", global(&[10], &[0], &[10]), false, false);
        assert!(unchecked.set_selection(&[8], &[5]).is_ok());
    }

    #[test]
    fn test_record_block_statistics() {
        let mut var: Variable<f64> = Variable::new("t", global(&[3], &[0], &[3]), true, true);
        var.record_block(4, &[1.0, -2.0, 3.0]);
        var.record_block(4, &[0.0, 0.0, 0.0]);
        var.record_block(5, &[10.0, 0.0, 0.0]);
        assert_eq!(var.min(), Some(&-2.0));
        assert_eq!(var.max(), Some(&10.0));
        assert_eq!(var.available_steps(), Some((4, 2)));
        let info = var.info();
        assert_eq!(info["Type"], "double");
        assert_eq!(info["Shape"], "3");
        assert_eq!(info["AvailableStepsCount"], "2");
        assert!(!info.contains_key("Value"));
    }

    #[test]
    fn test_single_value_reports_value() {
        let mut var: Variable<String> = Variable::new("label", Selection::default(), true, true);
        var.record_block(0, &["hello".to_string()]);
        assert_eq!(var.info()["Value"], "hello");
        assert_eq!(var.info()["SingleValue"], "true");
    }

    #[test]
    fn test_compound_layout() {
        let layout = CompoundLayout::new(12)
            .with_field("id", DataTypeTag::Int32, 0)
            .unwrap()
            .with_field("x", DataTypeTag::Double, 4)
            .unwrap();
        assert_eq!(layout.fields().len(), 2);
        assert!(layout.clone().with_field("y", DataTypeTag::Double, 8).is_err());
        assert!(layout.clone().with_field("id", DataTypeTag::Int8, 0).is_err());
        assert!(CompoundLayout::new(8)
            .with_field("s", DataTypeTag::String, 0)
            .is_err());
    }

    #[test]
    fn test_handles_are_copy_and_compare_by_key() {
        let a: VarHandle<f32> = VarHandle::new(SlotKey::INVALID);
        let b = a;
        assert_eq!(a, b);
    }
}
