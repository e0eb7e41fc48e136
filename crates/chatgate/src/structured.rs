//! Asking a model for JSON of a known shape and checking that it delivered.
use indoc::indoc;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::OnceLock;
use tera::{Context, Tera};

use crate::errors::{FieldIssue, GatewayError, GatewayResult};

/// The root of the reply, used when an issue is not tied to one field
const ROOT: &str = "$";

const FORMAT_TEMPLATE: &str = indoc! {r#"
    Your response should be in JSON format.
    Do not include any explanations, only provide a RFC8259 compliant JSON response following this format without deviation.
    Do not include markdown code blocks in your response.
    The response must be a single JSON object describing a {{ name }} with these fields:
    {% for field in fields %}- "{{ field.name }}": {{ field.kind }}{% if not field.required %} (optional){% endif %}
    {% endfor %}
    Here is the JSON Schema instance your output must adhere to:
    {{ schema }}
"#};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    fn schema(self) -> Value {
        match self {
            FieldKind::Any => json!({}),
            kind => json!({ "type": kind.as_str() }),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON type name of a value, for mismatch reports
fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// The fields a structured reply must carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputShape {
    name: String,
    fields: Vec<FieldSpec>,
}

impl OutputShape {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field<S: Into<String>>(mut self, name: S, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional<S: Into<String>>(mut self, name: S, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|field| (field.name.clone(), field.kind.schema()))
            .collect();
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.required)
            .map(|field| field.name.as_str())
            .collect();

        json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Text appended to the system prompt describing the expected reply
    pub fn format_instructions(&self) -> GatewayResult<String> {
        let mut tera = Tera::default();
        tera.add_raw_template("format", FORMAT_TEMPLATE)
            .map_err(|e| GatewayError::Config(format!("invalid format template: {}", e)))?;

        let mut context = Context::new();
        context.insert("name", &self.name);
        context.insert("fields", &self.fields);
        context.insert(
            "schema",
            &serde_json::to_string_pretty(&self.json_schema()).unwrap_or_default(),
        );
        tera.render("format", &context)
            .map_err(|e| GatewayError::Config(format!("failed to render format instructions: {}", e)))
    }

    /// Pull the JSON object out of a model reply and check it against the shape.
    /// Every problem found is reported at once.
    pub fn parse(&self, reply: &str) -> GatewayResult<Value> {
        let raw = extract_json(reply).ok_or_else(|| {
            self.failure(vec![FieldIssue::new(ROOT, "response contains no JSON object")])
        })?;
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| self.failure(vec![FieldIssue::new(ROOT, format!("is not valid JSON: {}", e))]))?;

        let Some(object) = value.as_object() else {
            return Err(self.failure(vec![FieldIssue::new(
                ROOT,
                format!("expected object, found {}", kind_of(&value)),
            )]));
        };

        let issues: Vec<FieldIssue> = self
            .fields
            .iter()
            .filter_map(|field| match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    Some(FieldIssue::new(&field.name, "is missing"))
                }
                None | Some(Value::Null) => None,
                Some(found) if !field.kind.matches(found) => Some(FieldIssue::new(
                    &field.name,
                    format!("expected {}, found {}", field.kind, kind_of(found)),
                )),
                Some(_) => None,
            })
            .collect();

        if issues.is_empty() {
            Ok(value)
        } else {
            Err(self.failure(issues))
        }
    }

    /// Deserialize an already validated value into a concrete type
    pub fn convert<T: DeserializeOwned>(&self, value: Value) -> GatewayResult<T> {
        serde_json::from_value(value).map_err(|e| {
            let message = e.to_string();
            let field = missing_field(&message).unwrap_or(ROOT).to_string();
            self.failure(vec![FieldIssue::new(field, message)])
        })
    }

    fn failure(&self, issues: Vec<FieldIssue>) -> GatewayError {
        GatewayError::Conversion {
            target: self.name.clone(),
            issues,
        }
    }
}

/// The JSON payload of a reply: the first fenced block holding JSON, else the outermost braces
pub fn extract_json(reply: &str) -> Option<&str> {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    let fenced = FENCED.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)```").expect("static regex")
    });
    let block = fenced
        .captures_iter(reply)
        .filter_map(|c| c.get(1))
        .map(|body| body.as_str().trim())
        .find(|body| body.starts_with('{') || body.starts_with('['));
    if block.is_some() {
        return block;
    }

    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

fn missing_field(message: &str) -> Option<&str> {
    static MISSING: OnceLock<Regex> = OnceLock::new();
    let re = MISSING.get_or_init(|| Regex::new(r"missing field `([^`]+)`").expect("static regex"));
    re.captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}
