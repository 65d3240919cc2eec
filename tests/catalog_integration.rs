//! Integration tests for variable and attribute definitions
//!
//! These tests exercise the catalog through the IO namespace:
//! - Typed define / inquire / remove
//! - Dimension validation
//! - Introspection snapshots

mod common;

use adaptio::io::Io;
use adaptio::{AdaptioError, Complex64, CompoundLayout, DataTypeTag};
use proptest::prelude::*;
use std::collections::BTreeSet;

#[test]
fn test_define_every_element_type() {
    let mut io = Io::standalone("types", true);
    io.define_variable::<i8>("i8", &[2], &[0], &[2], true).unwrap();
    io.define_variable::<u16>("u16", &[2], &[0], &[2], true).unwrap();
    io.define_variable::<i64>("i64", &[2], &[0], &[2], true).unwrap();
    io.define_variable::<f32>("f32", &[2], &[0], &[2], true).unwrap();
    io.define_variable::<Complex64>("z", &[2], &[0], &[2], true).unwrap();
    io.define_value::<String>("label").unwrap();

    assert_eq!(io.inquire_variable_type("i8"), Some(DataTypeTag::Int8));
    assert_eq!(io.inquire_variable_type("u16"), Some(DataTypeTag::UInt16));
    assert_eq!(io.inquire_variable_type("z"), Some(DataTypeTag::ComplexDouble));
    assert_eq!(io.inquire_variable_type("label"), Some(DataTypeTag::String));
    assert!(io.inquire_variable::<f64>("f32").is_none());
    assert!(io.inquire_variable::<f32>("f32").is_some());

    let available = io.available_variables();
    assert_eq!(available.len(), 6);
    assert_eq!(available["z"]["Type"], "double complex");
    assert_eq!(available["label"]["SingleValue"], "true");
}

#[test]
fn test_compound_definition() {
    let layout = CompoundLayout::new(16)
        .with_field("id", DataTypeTag::Int64, 0)
        .unwrap()
        .with_field("energy", DataTypeTag::Double, 8)
        .unwrap();
    let mut io = Io::standalone("particles", true);
    io.define_compound_variable("particles", layout.clone(), &[10], &[0], &[10], true)
        .unwrap();

    assert_eq!(io.inquire_variable_type("particles"), Some(DataTypeTag::Compound));
    let handle = io.inquire_compound_variable("particles").unwrap();
    let compound = io.catalog().compound_variable(handle).unwrap();
    assert_eq!(compound.byte_count(), 160);
    assert_eq!(compound.layout(), &layout);
    assert_eq!(io.available_variables()["particles"]["Type"], "compound");
}

#[test]
fn test_overflowing_counts_rejected_without_debug() {
    for debug in [false, true] {
        let mut io = Io::standalone("huge", debug);
        let result = io.define_variable::<f64>("v", &[], &[], &[usize::MAX, 2], true);
        assert!(
            matches!(result, Err(AdaptioError::InvalidDimensions { ref name, .. }) if name == "v"),
            "debug {}: {:?}",
            debug,
            result
        );
        // Fits as elements, not as bytes
        let result = io.define_variable::<f64>("w", &[], &[], &[usize::MAX / 4], true);
        assert!(matches!(result, Err(AdaptioError::InvalidDimensions { .. })));
        assert!(io.inquire_variable::<f64>("v").is_none());

        let layout = CompoundLayout::new(16)
            .with_field("id", DataTypeTag::Int64, 0)
            .unwrap();
        let result = io.define_compound_variable("c", layout, &[], &[], &[usize::MAX / 8], true);
        assert!(matches!(result, Err(AdaptioError::InvalidDimensions { .. })));
    }
}

#[test]
fn test_overflowing_selection_keeps_previous_one() {
    let mut io = Io::standalone("huge", false);
    let v = io.define_variable::<u32>("v", &[], &[], &[4], false).unwrap();
    let variable = io.variable_mut(v).unwrap();
    let result = variable.set_selection(&[], &[usize::MAX, usize::MAX]);
    assert!(matches!(result, Err(AdaptioError::InvalidDimensions { .. })));
    assert_eq!(variable.selection().count, vec![4]);
}

#[test]
fn test_redefinition_rules_follow_debug_mode() {
    let mut checked = Io::standalone("checked", true);
    checked.define_value::<i32>("n").unwrap();
    assert!(matches!(
        checked.define_value::<i32>("n"),
        Err(AdaptioError::DuplicateName { kind: "variable", .. })
    ));

    let mut unchecked = Io::standalone("unchecked", false);
    let first = unchecked.define_value::<i32>("n").unwrap();
    let second = unchecked.define_variable::<f64>("n", &[3], &[0], &[3], true).unwrap();
    assert!(unchecked.variable(first).is_none());
    assert!(unchecked.variable(second).is_some());
    assert_eq!(unchecked.inquire_variable_type("n"), Some(DataTypeTag::Double));
}

#[test]
fn test_attributes_alongside_variables() {
    let mut io = Io::standalone("attrs", true);
    io.define_variable::<f64>("temperature", &[4], &[0], &[4], true).unwrap();
    io.define_attribute("units", String::from("K")).unwrap();
    let dims = io.define_attribute_array("dims", &[4u32, 1, 1]).unwrap();

    assert_eq!(io.attribute(dims).unwrap().as_slice(), &[4, 1, 1]);
    assert!(io.inquire_attribute::<String>("units").is_some());
    assert!(io.inquire_attribute::<String>("temperature").is_none());

    let attrs = io.available_attributes();
    assert_eq!(attrs.len(), 2);
    assert_eq!(attrs["units"]["Type"], "string");

    assert!(io.remove_attribute("units"));
    assert!(!io.remove_attribute("units"));
    assert!(io.inquire_variable::<f64>("temperature").is_some());
}

#[test]
fn test_handles_go_stale_after_remove_all() {
    let mut io = Io::standalone("stale", true);
    let handles: Vec<_> = (0..8)
        .map(|i| io.define_value::<u64>(&format!("v{}", i)).unwrap())
        .collect();
    io.remove_all_variables();
    assert!(io.available_variables().is_empty());
    for handle in handles {
        assert!(io.variable(handle).is_none());
    }
    let fresh = io.define_value::<u64>("v0").unwrap();
    assert!(io.variable(fresh).is_some());
}

proptest! {
    #[test]
    fn prop_every_defined_name_is_inquirable(names in prop::collection::btree_set("[a-z][a-z0-9_]{0,12}", 1..40)) {
        let mut io = Io::standalone("prop", true);
        for name in &names {
            io.define_value::<f64>(name).unwrap();
        }
        let listed: BTreeSet<String> = io.available_variables().into_keys().collect();
        prop_assert_eq!(&listed, &names);
        for name in &names {
            prop_assert!(io.inquire_variable::<f64>(name).is_some());
            prop_assert!(io.inquire_variable::<i32>(name).is_none());
        }
    }

    #[test]
    fn prop_selection_inside_shape_is_accepted(
        dims in prop::collection::vec((1usize..64, 0usize..64, 0usize..64), 1..4)
    ) {
        let shape: Vec<usize> = dims.iter().map(|d| d.0).collect();
        let start: Vec<usize> = dims.iter().map(|d| d.1 % d.0).collect();
        let count: Vec<usize> = dims
            .iter()
            .zip(&start)
            .map(|(d, s)| d.2 % (d.0 - s + 1))
            .collect();

        let mut io = Io::standalone("prop", true);
        let handle = io.define_variable::<f32>("v", &shape, &start, &count, false).unwrap();
        let expected: usize = count.iter().product();
        prop_assert_eq!(io.variable(handle).unwrap().element_count(), expected);
    }

    #[test]
    fn prop_selection_past_shape_is_rejected(shape in 1usize..1000, start in 0usize..1000, extra in 1usize..100) {
        let count = (shape + extra).saturating_sub(start);
        let mut io = Io::standalone("prop", true);
        let result = io.define_variable::<u8>("v", &[shape], &[start], &[count], true);
        let rejected = matches!(result, Err(AdaptioError::InvalidDimensions { .. }));
        prop_assert!(rejected);
    }
}
