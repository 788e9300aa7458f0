//! Flow input schema: typed parameters with defaults, enums and secrets.
//!
//! The serde document keeps what only the engine cares about (defaults,
//! `password`, display `order`); conformance is checked by compiling it
//! to a JSON Schema and validating with `jsonschema`.

use std::collections::{BTreeMap, BTreeSet};

use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::context::FlowInput;
use crate::error::InputError;

/// Declared parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    /// Whether a value conforms to this type.
    pub fn accepts(self, value: &Value) -> bool {
        conforms(&json!({ "type": self.name() }), value)
    }

    /// JSON Schema name of the type.
    pub fn name(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(rename = "type", default)]
    pub ty: Option<ParamType>,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(rename = "enum", default)]
    pub allowed: Option<Vec<Value>>,

    #[serde(default)]
    pub description: Option<String>,

    /// Sensitive value, masked in logs.
    #[serde(default, alias = "secret")]
    pub password: bool,
}

/// Schema of a flow's input, or of a leaf body's input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, Property>,

    #[serde(default)]
    pub required: Vec<String>,

    /// Display order of the parameters.
    #[serde(default)]
    pub order: Vec<String>,
}

impl InputSchema {
    /// Add a property (builder style).
    pub fn property(mut self, name: &str, property: Property) -> Self {
        self.properties.insert(name.to_string(), property);
        self
    }

    /// Mark a property as required (builder style).
    pub fn require(mut self, name: &str) -> Self {
        self.required.push(name.to_string());
        self
    }

    /// The equivalent JSON Schema document.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, property)| (name.clone(), property.to_json_schema()))
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }

    /// Compile the schema for validation.
    pub fn validator(&self) -> Result<Validator, InputError> {
        jsonschema::validator_for(&self.to_json_schema())
            .map_err(|e| InputError::InvalidSchema(e.to_string()))
    }

    /// Validate raw values and fill in defaults.
    ///
    /// Values for undeclared parameters are passed through unchanged. A
    /// `null` value counts as absent.
    pub fn apply(&self, raw: Map<String, Value>) -> Result<FlowInput, InputError> {
        let mut values = raw;

        for (name, property) in &self.properties {
            if values.get(name).map_or(true, Value::is_null) {
                if let Some(default) = &property.default {
                    values.insert(name.clone(), default.clone());
                }
            }
        }

        let present: Map<String, Value> = values
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if !self.validator()?.is_valid(&Value::Object(present.clone())) {
            return Err(self.diagnose(&present));
        }

        let secrets: BTreeSet<String> = self
            .properties
            .iter()
            .filter(|(_, p)| p.password)
            .map(|(name, _)| name.clone())
            .collect();

        Ok(FlowInput::with_secrets(values, secrets))
    }

    /// Name the first rule a rejected input breaks.
    fn diagnose(&self, present: &Map<String, Value>) -> InputError {
        if let Some(name) = self.required.iter().find(|n| !present.contains_key(*n)) {
            return InputError::MissingRequired(name.clone());
        }
        self.properties
            .iter()
            .filter_map(|(name, property)| {
                let value = present.get(name)?;
                property.check(name, value).err()
            })
            .next()
            .unwrap_or_else(|| InputError::InvalidSchema("input rejected by schema".to_string()))
    }
}

impl Property {
    /// A property of the given type.
    pub fn of(ty: ParamType) -> Self {
        Self {
            ty: Some(ty),
            ..Self::default()
        }
    }

    /// Set a default value.
    pub fn with_default<V: Into<Value>>(mut self, value: V) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Restrict to a set of values.
    pub fn one_of<V: Into<Value>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Mark as sensitive.
    pub fn secret(mut self) -> Self {
        self.password = true;
        self
    }

    /// The equivalent JSON Schema document.
    pub fn to_json_schema(&self) -> Value {
        let mut schema = Map::new();
        if let Some(ty) = self.ty {
            schema.insert("type".to_string(), Value::from(ty.name()));
        }
        if let Some(allowed) = &self.allowed {
            schema.insert("enum".to_string(), Value::from(allowed.clone()));
        }
        if let Some(default) = &self.default {
            schema.insert("default".to_string(), default.clone());
        }
        if let Some(description) = &self.description {
            schema.insert("description".to_string(), Value::from(description.as_str()));
        }
        Value::Object(schema)
    }

    /// Check one value against this property.
    pub fn check(&self, name: &str, value: &Value) -> Result<(), InputError> {
        if conforms(&self.to_json_schema(), value) {
            return Ok(());
        }
        match self.ty {
            Some(ty) if !ty.accepts(value) => Err(InputError::TypeMismatch {
                name: name.to_string(),
                expected: ty.name().to_string(),
            }),
            _ => Err(InputError::NotInEnum(name.to_string())),
        }
    }
}

/// Whether `value` validates against `schema`. A schema that does not
/// compile accepts nothing.
fn conforms(schema: &Value, value: &Value) -> bool {
    jsonschema::validator_for(schema).is_ok_and(|validator| validator.is_valid(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> InputSchema {
        InputSchema::default()
            .property(
                "stock_market",
                Property::of(ParamType::String)
                    .with_default("HSX")
                    .one_of(["HSX", "HNX", "UPCOM"]),
            )
            .property("limit", Property::of(ParamType::Integer).with_default(5))
            .property("s3_secret", Property::of(ParamType::String).secret())
            .property("bucket", Property::of(ParamType::String))
            .require("bucket")
    }

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let input = schema().apply(raw(json!({"bucket": "reports"}))).unwrap();
        assert_eq!(input.get("stock_market"), Some(&json!("HSX")));
        assert_eq!(input.get("limit"), Some(&json!(5)));
    }

    #[test]
    fn test_missing_required() {
        let err = schema().apply(raw(json!({}))).unwrap_err();
        assert_eq!(err, InputError::MissingRequired("bucket".into()));
    }

    #[test]
    fn test_type_mismatch() {
        let err = schema()
            .apply(raw(json!({"bucket": "b", "limit": "five"})))
            .unwrap_err();
        assert!(matches!(err, InputError::TypeMismatch { name, .. } if name == "limit"));
    }

    #[test]
    fn test_enum_violation() {
        let err = schema()
            .apply(raw(json!({"bucket": "b", "stock_market": "NYSE"})))
            .unwrap_err();
        assert_eq!(err, InputError::NotInEnum("stock_market".into()));
    }

    #[test]
    fn test_null_counts_as_missing() {
        let err = schema().apply(raw(json!({"bucket": null}))).unwrap_err();
        assert_eq!(err, InputError::MissingRequired("bucket".into()));

        let input = schema()
            .apply(raw(json!({"bucket": "b", "limit": null})))
            .unwrap();
        assert_eq!(input.get("limit"), Some(&json!(5)));
    }

    #[test]
    fn test_json_schema_document() {
        let doc = schema().to_json_schema();
        assert_eq!(doc["type"], json!("object"));
        assert_eq!(doc["required"], json!(["bucket"]));
        assert_eq!(
            doc["properties"]["stock_market"],
            json!({"type": "string", "enum": ["HSX", "HNX", "UPCOM"], "default": "HSX"})
        );
        assert!(schema().validator().unwrap().is_valid(&json!({"bucket": "b"})));
    }

    #[test]
    fn test_property_check() {
        let market = Property::of(ParamType::String).one_of(["HSX", "HNX"]);
        assert!(market.check("m", &json!("HNX")).is_ok());
        assert_eq!(
            market.check("m", &json!(3)),
            Err(InputError::TypeMismatch {
                name: "m".into(),
                expected: "string".into()
            })
        );
        assert_eq!(market.check("m", &json!("NYSE")), Err(InputError::NotInEnum("m".into())));
        assert!(Property::default().check("any", &json!([1])).is_ok());
    }

    #[test]
    fn test_secret_marked() {
        let input = schema()
            .apply(raw(json!({"bucket": "b", "s3_secret": "k"})))
            .unwrap();
        assert!(input.is_secret("s3_secret"));
        assert_eq!(input.redacted()["s3_secret"], json!("***"));
    }

    #[test]
    fn test_parse_schema_document() {
        let yaml = r#"
properties:
  fmt:
    type: string
    enum: [pdf, png]
    default: pdf
  api_key:
    type: string
    password: true
required: [fmt]
order: [fmt, api_key]
"#;
        let schema: InputSchema = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(schema.properties["fmt"].ty, Some(ParamType::String));
        assert!(schema.properties["api_key"].password);
        assert_eq!(schema.order, vec!["fmt", "api_key"]);
    }
}
