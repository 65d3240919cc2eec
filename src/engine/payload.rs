//! Step payloads and their byte encoding
//!
//! A step is serialized as one [`StepPayload`]: the variable blocks put
//! during the step, plus (until the definition is final) the schema and the
//! attributes of the producing catalog. Element vectors and whole payloads
//! are encoded with bincode.

use crate::catalog::{
    Attribute, AttributeValue, Selection, VariableCatalog, VariableDescriptor,
};
use crate::error::{AdaptioError, Result};
use crate::types::{DataType, DataTypeTag};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One variable's data for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableBlock {
    pub name: String,
    pub type_tag: DataTypeTag,
    pub shape: Vec<usize>,
    pub start: Vec<usize>,
    pub count: Vec<usize>,
    /// Encoded elements (raw records for compound variables)
    pub bytes: Vec<u8>,
}

impl VariableBlock {
    pub fn selection(&self) -> Selection {
        Selection::new(&self.shape, &self.start, &self.count)
    }

    /// Decode the elements as `T`, checking the stored type first
    pub fn decode<T: DataType>(&self) -> Result<Vec<T>> {
        if self.type_tag != T::TAG {
            return Err(AdaptioError::TypeMismatch {
                name: self.name.clone(),
                expected: T::TAG.to_string(),
                found: self.type_tag.to_string(),
            });
        }
        decode_values(&self.bytes)
    }
}

/// One attribute, with its values encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub name: String,
    pub type_tag: DataTypeTag,
    pub single: bool,
    pub bytes: Vec<u8>,
}

/// Everything written during one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    pub step: u64,
    pub schema: Vec<VariableDescriptor>,
    pub variables: Vec<VariableBlock>,
    pub attributes: Vec<AttributeRecord>,
}

impl StepPayload {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            ..Self::default()
        }
    }

    /// Add a block, replacing an earlier block of the same variable
    pub fn push(&mut self, block: VariableBlock) {
        match self.variables.iter_mut().find(|b| b.name == block.name) {
            Some(existing) => *existing = block,
            None => self.variables.push(block),
        }
    }

    pub fn find(&self, name: &str) -> Option<&VariableBlock> {
        self.variables.iter().find(|b| b.name == name)
    }

    /// Bytes of variable data carried by this step
    pub fn data_bytes(&self) -> usize {
        self.variables.iter().map(|b| b.bytes.len()).sum()
    }

    /// Attach the producer's schema and attributes
    pub(crate) fn describe(&mut self, catalog: &VariableCatalog) -> Result<()> {
        self.schema = catalog.descriptors();
        self.attributes = catalog.attribute_records()?;
        Ok(())
    }

    /// Make the consumer catalog reflect this step
    pub(crate) fn apply_to(&self, catalog: &mut VariableCatalog) -> Result<()> {
        for descriptor in &self.schema {
            catalog.adopt_descriptor(descriptor);
        }
        for block in &self.variables {
            let constant_dims = self
                .schema
                .iter()
                .find(|d| d.name == block.name)
                .map(|d| d.constant_dims)
                .unwrap_or(false);
            catalog.adopt_descriptor(&VariableDescriptor {
                name: block.name.clone(),
                type_tag: block.type_tag,
                selection: block.selection(),
                constant_dims,
                layout: None,
            });
        }
        for record in &self.attributes {
            catalog.adopt_attribute(record)?;
        }
        Ok(())
    }
}

pub fn encode_values<T: Serialize>(values: &[T]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(values)?)
}

pub fn decode_values<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn encode_attribute<T: DataType>(attribute: &Attribute<T>) -> Result<AttributeRecord> {
    Ok(AttributeRecord {
        name: attribute.name().to_string(),
        type_tag: T::TAG,
        single: attribute.is_single_value(),
        bytes: encode_values(attribute.as_slice())?,
    })
}

pub(crate) fn decode_attribute<T: DataType>(record: &AttributeRecord) -> Result<AttributeValue<T>> {
    let mut values: Vec<T> = decode_values(&record.bytes)?;
    if record.single {
        match (values.pop(), values.is_empty()) {
            (Some(value), true) => Ok(AttributeValue::Single(value)),
            _ => Err(AdaptioError::Serialization(format!(
                "single-value attribute '{}' does not hold exactly one value",
                record.name
            ))),
        }
    } else {
        Ok(AttributeValue::Array(values))
    }
}

/// Encode a step for a transport
pub fn encode_step(payload: &StepPayload) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(payload)?))
}

/// Decode a step read from a transport
pub fn decode_step(bytes: &[u8]) -> Result<StepPayload> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Complex64;

    fn block(name: &str, values: &[f64]) -> VariableBlock {
        VariableBlock {
            name: name.to_string(),
            type_tag: DataTypeTag::Double,
            shape: vec![values.len()],
            start: vec![0],
            count: vec![values.len()],
            bytes: encode_values(values).unwrap(),
        }
    }

    #[test]
    fn test_push_replaces_same_variable() {
        let mut payload = StepPayload::new(3);
        payload.push(block("t", &[1.0]));
        payload.push(block("p", &[2.0]));
        payload.push(block("t", &[5.0, 6.0]));
        assert_eq!(payload.variables.len(), 2);
        assert_eq!(payload.find("t").unwrap().decode::<f64>().unwrap(), vec![5.0, 6.0]);
        assert!(payload.find("q").is_none());
    }

    #[test]
    fn test_decode_checks_type() {
        let b = block("t", &[1.0, 2.0]);
        assert!(matches!(
            b.decode::<f32>(),
            Err(AdaptioError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_step_encoding_preserves_payload() {
        let mut payload = StepPayload::new(42);
        payload.push(block("t", &[0.5; 16]));
        payload.attributes.push(AttributeRecord {
            name: "z".into(),
            type_tag: DataTypeTag::ComplexDouble,
            single: true,
            bytes: encode_values(&[Complex64::new(1.0, -1.0)]).unwrap(),
        });
        let decoded = decode_step(&encode_step(&payload).unwrap()).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.data_bytes(), payload.data_bytes());
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert!(matches!(
            decode_step(&[0xff, 0x01]),
            Err(AdaptioError::Serialization(_))
        ));
    }

    #[test]
    fn test_apply_to_defines_reader_variables() {
        let mut producer = VariableCatalog::new(true);
        producer
            .define_variable::<f64>("t", &[4], &[0], &[4], true)
            .unwrap();
        producer.define_attribute("units", "K".to_string()).unwrap();

        let mut payload = StepPayload::new(0);
        payload.describe(&producer).unwrap();
        payload.push(block("t", &[1.0, 2.0, 3.0, 4.0]));
        payload.push(VariableBlock {
            name: "extra".into(),
            type_tag: DataTypeTag::Int32,
            shape: vec![],
            start: vec![],
            count: vec![2],
            bytes: encode_values(&[7i32, 8]).unwrap(),
        });

        let mut consumer = VariableCatalog::new(true);
        payload.apply_to(&mut consumer).unwrap();
        let t = consumer.variable_by_name::<f64>("t").unwrap();
        assert!(t.constant_dims());
        assert_eq!(t.shape(), &[4]);
        assert_eq!(consumer.variable_by_name::<i32>("extra").unwrap().count(), &[2]);
        assert!(consumer.attribute_by_name::<String>("units").is_some());
    }
}
