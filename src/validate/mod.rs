//! Semantic validation: per-record payload checks looked up by [`RecordKey`].
//!
//! Payload decoders for each sensor type own the meaning of their records;
//! what the verifier needs from them is a yes/no on field-level constraints.
//! Each decoder registers a [`SemanticValidator`] for the record keys it
//! understands.  The verifier looks a block's key up and calls whatever is
//! there, without knowing any concrete decoder type.  Blocks with no
//! registered validator pass.
//!
//! # Thread safety
//! Validators are shared by every worker of a batch run and must be
//! `Send + Sync`; they receive borrowed payload bytes and keep no state
//! between calls.

pub mod builtin;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::block::{Block, BlockHeader, RecordKey};
use crate::class_table::ClassTable;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("payload too short: need {needed} bytes, have {actual}")]
    TooShort { needed: usize, actual: usize },
    #[error("{field} = {value} outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min:   f64,
        max:   f64,
    },
    #[error("{0}")]
    Invalid(String),
}

pub trait SemanticValidator: Send + Sync {
    fn validate(&self, header: &BlockHeader, payload: &[u8]) -> Result<(), ValidationError>;
}

impl<F> SemanticValidator for F
where
    F: Fn(&BlockHeader, &[u8]) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate(&self, header: &BlockHeader, payload: &[u8]) -> Result<(), ValidationError> {
        self(header, payload)
    }
}

#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<RecordKey, Arc<dyn SemanticValidator>>,
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.validators.keys().collect();
        keys.sort();
        f.debug_struct("ValidatorRegistry").field("keys", &keys).finish()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the range checks for the built-in record classes.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry, &ClassTable::builtin());
        registry
    }

    /// Register `validator` for `key`, replacing any earlier one.
    pub fn register<V>(&mut self, key: RecordKey, validator: V) -> &mut Self
    where
        V: SemanticValidator + 'static,
    {
        self.validators.insert(key, Arc::new(validator));
        self
    }

    /// Register one validator for `data_id` under every version of
    /// `class_id` that `table` accepts it in.
    pub fn register_for_class<V>(&mut self, table: &ClassTable, class_id: u16, data_id: u16, validator: V) -> &mut Self
    where
        V: SemanticValidator + 'static,
    {
        let shared: Arc<dyn SemanticValidator> = Arc::new(validator);
        for key in table.keys().iter().filter(|k| k.class_id == class_id && k.data_id == data_id) {
            self.validators.insert(*key, Arc::clone(&shared));
        }
        self
    }

    pub fn lookup(&self, key: &RecordKey) -> Option<&dyn SemanticValidator> {
        self.validators.get(key).map(|v| v.as_ref())
    }

    pub fn validate(&self, block: &Block) -> Result<(), ValidationError> {
        match self.lookup(&block.key()) {
            Some(v) => v.validate(&block.header, &block.payload),
            None    => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_table::CLASS_CAMERA;

    #[test]
    fn unregistered_key_passes() {
        let r = ValidatorRegistry::new();
        let b = Block::new(RecordKey::new(0x7777, 1, 0, 1), vec![0xFF]);
        assert!(r.validate(&b).is_ok());
    }

    #[test]
    fn closure_validator_is_dispatched_by_key() {
        let key = RecordKey::new(CLASS_CAMERA, 1, 0, 2);
        let mut r = ValidatorRegistry::new();
        r.register(key, |_: &BlockHeader, payload: &[u8]| {
            if payload.is_empty() {
                Err(ValidationError::Invalid("empty calibration".into()))
            } else {
                Ok(())
            }
        });
        assert!(r.validate(&Block::new(key, vec![1])).is_ok());
        assert_eq!(
            r.validate(&Block::new(key, Vec::new())),
            Err(ValidationError::Invalid("empty calibration".into()))
        );
        // Same data id under another version is not covered.
        assert!(r.validate(&Block::new(RecordKey::new(CLASS_CAMERA, 1, 1, 2), Vec::new())).is_ok());
    }

    #[test]
    fn class_registration_covers_every_version() {
        let table = ClassTable::builtin();
        let mut r = ValidatorRegistry::new();
        r.register_for_class(&table, CLASS_CAMERA, 2, |_: &BlockHeader, _: &[u8]| {
            Err(ValidationError::Invalid("always".into()))
        });
        assert_eq!(r.len(), 2);
        assert!(r.lookup(&RecordKey::new(CLASS_CAMERA, 1, 1, 2)).is_some());
    }
}
