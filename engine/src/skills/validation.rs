//! Contract validation
//!
//! Schemas are compiled once at registration (Draft 2020-12). Validation
//! collects every violation into a single `EngineError::Validation`.

use jsonschema::{Draft, Validator};
use sdk::errors::EngineError;
use sdk::types::SkillContract;
use serde_json::Value;

/// Compiled input and output schemas of one contract
pub struct ContractValidator {
    skill: String,
    input: Validator,
    output: Validator,
}

impl std::fmt::Debug for ContractValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractValidator")
            .field("skill", &self.skill)
            .finish_non_exhaustive()
    }
}

impl ContractValidator {
    /// Compile both schemas of `contract`
    pub fn compile(contract: &SkillContract) -> Result<Self, EngineError> {
        Ok(Self {
            skill: contract.name.clone(),
            input: compile_schema(&contract.name, "input", &contract.input_schema)?,
            output: compile_schema(&contract.name, "output", &contract.output_schema)?,
        })
    }

    /// Check arguments before invocation
    pub fn validate_input(&self, args: &Value) -> Result<(), EngineError> {
        check(&self.input, args, &self.skill, "arguments")
    }

    /// Check a result after invocation
    pub fn validate_output(&self, result: &Value) -> Result<(), EngineError> {
        check(&self.output, result, &self.skill, "result")
    }
}

fn compile_schema(skill: &str, which: &str, schema: &Value) -> Result<Validator, EngineError> {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|e| EngineError::Config(format!("invalid {} schema for {}: {}", which, skill, e)))
}

fn check(validator: &Validator, instance: &Value, skill: &str, what: &str) -> Result<(), EngineError> {
    let messages: Vec<String> = validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();

    if messages.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "{} {} rejected: {}",
            skill,
            what,
            messages.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::SideEffectClass;
    use serde_json::json;

    fn contract() -> SkillContract {
        SkillContract::new(
            "web.fetch",
            "Fetch a page",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "pattern": "^https?://"}
                },
                "required": ["url"],
                "additionalProperties": false
            }),
            json!({
                "type": "object",
                "properties": {"content": {"type": "string"}},
                "required": ["content"]
            }),
            SideEffectClass::ReadOnly,
        )
    }

    #[test]
    fn test_valid_arguments_pass() {
        let validator = ContractValidator::compile(&contract()).unwrap();
        assert!(validator
            .validate_input(&json!({"url": "https://example.com"}))
            .is_ok());
    }

    #[test]
    fn test_every_violation_is_reported() {
        let validator = ContractValidator::compile(&contract()).unwrap();
        let err = validator
            .validate_input(&json!({"url": "ftp://x", "extra": true}))
            .unwrap_err();

        let EngineError::Validation(message) = err else {
            panic!("expected validation error");
        };
        assert!(message.starts_with("web.fetch arguments rejected"));
        assert!(message.contains("; "));
    }

    #[test]
    fn test_output_checked_independently() {
        let validator = ContractValidator::compile(&contract()).unwrap();
        assert!(validator.validate_output(&json!({"content": "ok"})).is_ok());
        assert!(matches!(
            validator.validate_output(&json!({"body": "ok"})),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_schema_is_a_config_error() {
        let mut bad = contract();
        bad.input_schema = json!({"type": 12});
        assert!(matches!(
            ContractValidator::compile(&bad),
            Err(EngineError::Config(_))
        ));
    }
}
