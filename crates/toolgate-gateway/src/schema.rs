//! JSON Schema validation with per-tool compiled validator cache.

use std::collections::HashMap;
use std::sync::Arc;

use jsonschema::Validator;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{InvocationError, SchemaStage};

/// Reported validation messages per failing document.
const MAX_REPORTED_ERRORS: usize = 8;

/// Compiled validators keyed by `connector.tool` and stage.
#[derive(Default)]
pub struct SchemaCache {
    validators: RwLock<HashMap<(String, SchemaStage), Arc<Validator>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `instance` against `schema`, compiling it on first use.
    ///
    /// A schema that fails to compile is reported as a validation error of
    /// the same stage; the tool's contract is broken either way.
    pub fn validate(
        &self,
        tool_name: &str,
        stage: SchemaStage,
        schema: &Value,
        instance: &Value,
    ) -> Result<(), InvocationError> {
        let validator = self.validator(tool_name, stage, schema).map_err(|message| {
            InvocationError::Validation {
                stage,
                errors: vec![message],
            }
        })?;

        let errors: Vec<String> = validator
            .iter_errors(instance)
            .take(MAX_REPORTED_ERRORS)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(InvocationError::Validation { stage, errors })
        }
    }

    fn validator(
        &self,
        tool_name: &str,
        stage: SchemaStage,
        schema: &Value,
    ) -> Result<Arc<Validator>, String> {
        let key = (tool_name.to_string(), stage);
        if let Some(v) = self.validators.read().get(&key) {
            return Ok(v.clone());
        }
        let compiled = jsonschema::validator_for(schema)
            .map_err(|e| format!("invalid {stage} schema for '{tool_name}': {e}"))?;
        let compiled = Arc::new(compiled);
        self.validators.write().insert(key, compiled.clone());
        Ok(compiled)
    }

    /// Drop the cached validators for `tool_name`, e.g. after re-registration.
    pub fn invalidate(&self, tool_name: &str) {
        self.validators.write().retain(|(name, _), _| name != tool_name);
    }

    pub fn len(&self) -> usize {
        self.validators.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("compiled", &self.len())
            .finish()
    }
}
