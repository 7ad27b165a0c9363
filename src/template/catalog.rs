use std::collections::HashMap;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Step, StepType};
use crate::template::engine::{
    ParameterType, Template, TemplateEngine, TemplateParameter,
};

/// Engine pre-loaded with the built-in templates and their derived rules.
pub fn builtin_engine() -> TemplateEngine {
    let mut engine = TemplateEngine::new();
    engine.register(calculator_basic());
    engine.register_rule("calculator-basic", calculator_result);
    engine.register(notepad_note());
    engine
}

/// Two operands and an operation; the expected display value is derived
/// into `{result}` for the final validation step.
fn calculator_basic() -> Template {
    Template {
        id: "calculator-basic".to_string(),
        name: "Basic calculation".to_string(),
        description: "Runs a two-operand calculation and validates the display".to_string(),
        application_path: "calc".to_string(),
        arguments: None,
        parameters: vec![
            TemplateParameter {
                name: "num1".to_string(),
                param_type: ParameterType::Number,
                required: true,
                default: None,
                validation_pattern: None,
            },
            TemplateParameter {
                name: "num2".to_string(),
                param_type: ParameterType::Number,
                required: true,
                default: None,
                validation_pattern: None,
            },
            TemplateParameter {
                name: "operation".to_string(),
                param_type: ParameterType::String,
                required: true,
                default: None,
                validation_pattern: Some("^(add|subtract|multiply|divide)$".to_string()),
            },
        ],
        steps: vec![
            Step::new(0, StepType::Click, "{num1}"),
            Step::new(1, StepType::Click, "{operation}"),
            Step::new(2, StepType::Click, "{num2}"),
            Step::new(3, StepType::Click, "="),
            Step::new(4, StepType::Validate, "display").with_value("{result}"),
        ],
    }
}

/// Derived rule for `calculator-basic`: computes `{result}` from the
/// operands.
fn calculator_result(params: &mut HashMap<String, String>) -> Result<()> {
    let num = |name: &str| -> Result<f64> {
        params
            .get(name)
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| DispatchError::InvalidInput(format!("parameter `{name}` is missing")))
    };
    let a = num("num1")?;
    let b = num("num2")?;
    let op = params
        .get("operation")
        .cloned()
        .unwrap_or_default();
    let result = match op.as_str() {
        "add" => a + b,
        "subtract" => a - b,
        "multiply" => a * b,
        "divide" => {
            if b == 0.0 {
                return Err(DispatchError::InvalidInput(
                    "division by zero".to_string(),
                ));
            }
            a / b
        }
        other => {
            return Err(DispatchError::InvalidInput(format!(
                "unknown operation `{other}`"
            )));
        }
    };
    params.insert("result".to_string(), format_number(result));
    Ok(())
}

/// Whole results print without a decimal point, matching what a calculator
/// display shows.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Opens a notepad, types a titled note and saves nothing.
fn notepad_note() -> Template {
    Template {
        id: "notepad-note".to_string(),
        name: "Write a note".to_string(),
        description: "Types a titled note into a fresh notepad window".to_string(),
        application_path: "notepad".to_string(),
        arguments: None,
        parameters: vec![
            TemplateParameter {
                name: "title".to_string(),
                param_type: ParameterType::String,
                required: false,
                default: Some("Untitled".to_string()),
                validation_pattern: None,
            },
            TemplateParameter {
                name: "text".to_string(),
                param_type: ParameterType::String,
                required: true,
                default: None,
                validation_pattern: None,
            },
        ],
        steps: vec![
            Step::new(0, StepType::WaitForElement, "editor"),
            Step::new(1, StepType::Type, "editor").with_value("{title}"),
            Step::new(2, StepType::KeyPress, "editor").with_value("Enter"),
            Step::new(3, StepType::Type, "editor").with_value("{text}"),
        ],
    }
}
