use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobPriority, JobStatus, Step, DEFAULT_MAX_RETRIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
}

/// Declared parameter of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_pattern: Option<String>,
}

/// A parameterized job recipe. Step targets, values and descriptions may
/// carry `{token}` placeholders resolved at expansion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub name: String,
    pub description: String,
    pub application_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    pub parameters: Vec<TemplateParameter>,
    pub steps: Vec<Step>,
}

/// Computes parameters derived from the caller-supplied ones, e.g. the
/// arithmetic `{result}` of the calculator template.
pub type DerivedRule = fn(&mut HashMap<String, String>) -> Result<()>;

/// Options carried from the execute request into the expanded job.
#[derive(Debug, Default, Clone)]
pub struct ExpandOptions {
    pub priority: Option<JobPriority>,
    pub webhook_url: Option<String>,
    pub max_retries: Option<u32>,
}

/// Validates parameters, applies derived rules and expands step templates
/// into a concrete Job.
#[derive(Default)]
pub struct TemplateEngine {
    templates: HashMap<String, Template>,
    derived_rules: HashMap<String, DerivedRule>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: Template) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn register_rule(&mut self, template_id: impl Into<String>, rule: DerivedRule) {
        self.derived_rules.insert(template_id.into(), rule);
    }

    pub fn get(&self, id: &str) -> Option<&Template> {
        self.templates.get(id)
    }

    pub fn list(&self) -> Vec<&Template> {
        let mut templates: Vec<&Template> = self.templates.values().collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    /// Expand a template into a fresh Pending job.
    pub fn expand(
        &self,
        template_id: &str,
        params: &HashMap<String, String>,
        opts: ExpandOptions,
    ) -> Result<Job> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| DispatchError::TemplateNotFound(template_id.to_string()))?;

        let mut resolved = self.validate_parameters(template, params)?;

        if let Some(rule) = self.derived_rules.get(template_id) {
            rule(&mut resolved)?;
        }

        let mut steps = template.steps.clone();
        steps.sort_by_key(|s| s.order);

        let mut unresolved = BTreeSet::new();
        for step in &mut steps {
            step.target = substitute_tokens(&step.target, &resolved, &mut unresolved);
            if let Some(value) = &step.value {
                step.value = Some(substitute_tokens(value, &resolved, &mut unresolved));
            }
            if let Some(description) = &step.description {
                step.description = Some(substitute_tokens(description, &resolved, &mut unresolved));
            }
        }
        let arguments = template
            .arguments
            .as_ref()
            .map(|a| substitute_tokens(a, &resolved, &mut unresolved));

        if !unresolved.is_empty() {
            let tokens: Vec<String> = unresolved.into_iter().collect();
            return Err(DispatchError::InvalidInput(format!(
                "unresolved tokens in template {template_id}: {}",
                tokens.join(", ")
            )));
        }

        Ok(Job {
            id: Uuid::new_v4(),
            name: template.name.clone(),
            application_path: template.application_path.clone(),
            arguments,
            steps,
            status: JobStatus::Pending,
            priority: opts.priority.unwrap_or(JobPriority::Normal),
            created_at: Utc::now(),
            queued_at: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            assigned_agent_id: None,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: opts.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            screenshots: Vec::new(),
            webhook_url: opts.webhook_url,
            template_id: Some(template.id.clone()),
            template_parameters: Some(resolved),
            metadata: HashMap::new(),
        })
    }

    /// Check required/type/pattern constraints and fold in defaults.
    fn validate_parameters(
        &self,
        template: &Template,
        supplied: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::new();
        for decl in &template.parameters {
            let value = match supplied.get(&decl.name) {
                Some(v) => v.clone(),
                None => match &decl.default {
                    Some(d) => d.clone(),
                    None if decl.required => {
                        return Err(DispatchError::InvalidInput(format!(
                            "missing required parameter `{}`",
                            decl.name
                        )));
                    }
                    None => continue,
                },
            };

            match decl.param_type {
                ParameterType::Number => {
                    if value.parse::<f64>().is_err() {
                        return Err(DispatchError::InvalidInput(format!(
                            "parameter `{}` is not a number: {value}",
                            decl.name
                        )));
                    }
                }
                ParameterType::Boolean => {
                    if !value.eq_ignore_ascii_case("true") && !value.eq_ignore_ascii_case("false") {
                        return Err(DispatchError::InvalidInput(format!(
                            "parameter `{}` is not a boolean: {value}",
                            decl.name
                        )));
                    }
                }
                ParameterType::String => {}
            }

            if let Some(pattern) = &decl.validation_pattern {
                let re = Regex::new(pattern).map_err(|e| {
                    DispatchError::Internal(format!(
                        "bad validation pattern on parameter `{}`: {e}",
                        decl.name
                    ))
                })?;
                if !re.is_match(&value) {
                    return Err(DispatchError::InvalidInput(format!(
                        "parameter `{}` does not match `{pattern}`: {value}",
                        decl.name
                    )));
                }
            }

            resolved.insert(decl.name.clone(), value);
        }
        Ok(resolved)
    }
}

/// Replace every `{name}` occurrence with the parameter value, in one
/// left-to-right pass. Values are spliced in verbatim; braces inside them
/// are never re-expanded. Unknown tokens stay literal and are reported to
/// the caller through `unresolved`.
pub fn substitute_tokens(
    input: &str,
    params: &HashMap<String, String>,
    unresolved: &mut BTreeSet<String>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let token = &after_open[..close];
                match params.get(token) {
                    Some(value) => out.push_str(value),
                    None => {
                        unresolved.insert(token.to_string());
                        out.push('{');
                        out.push_str(token);
                        out.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
