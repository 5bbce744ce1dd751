//! JSON Schema 子集编译与校验
//!
//! 支持关键字：type、enum、const、required、properties、additionalProperties、items、
//! minLength / maxLength / pattern、minItems / maxItems / uniqueItems、minProperties / maxProperties、
//! minimum / maximum / exclusiveMinimum / exclusiveMaximum / multipleOf、allOf / anyOf / oneOf / not；
//! 布尔 schema（true / false）。
//! 注解类关键字（$schema、title、description 等）忽略；其余标准校验关键字（$ref、format、if 等）
//! 无法执行，编译时直接报错，不会静默放行。编译在启动时进行，关键字类型不对同样报错。

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("schema {location}: {message}")]
    Invalid { location: String, message: String },
    #[error("failed to read schema {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("schema {path} is not valid JSON: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 单条校验错误：字段路径（JSON Pointer）+ 描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "object" => JsonType::Object,
            "array" => JsonType::Array,
            "string" => JsonType::String,
            "number" => JsonType::Number,
            "integer" => JsonType::Integer,
            "boolean" => JsonType::Boolean,
            "null" => JsonType::Null,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            JsonType::Object => "object",
            JsonType::Array => "array",
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Null => "null",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
            }
            JsonType::Boolean => value.is_boolean(),
            JsonType::Null => value.is_null(),
        }
    }
}

#[derive(Debug, Clone)]
enum Additional {
    Allow,
    Deny,
    Schema(Box<Node>),
}

#[derive(Debug, Clone)]
enum Node {
    Any,
    Never,
    Rules(Box<Rules>),
}

#[derive(Debug, Clone)]
struct Rules {
    types: Option<Vec<JsonType>>,
    enum_values: Option<Vec<Value>>,
    const_value: Option<Value>,
    required: Vec<String>,
    properties: BTreeMap<String, Node>,
    additional: Additional,
    items: Option<Node>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    min_items: Option<usize>,
    max_items: Option<usize>,
    min_properties: Option<usize>,
    max_properties: Option<usize>,
    unique_items: bool,
    pattern: Option<Regex>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    exclusive_minimum: Option<f64>,
    exclusive_maximum: Option<f64>,
    multiple_of: Option<f64>,
    all_of: Vec<Node>,
    any_of: Vec<Node>,
    one_of: Vec<Node>,
    not: Option<Node>,
}

/// 标准中存在但此处不执行的校验关键字
const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$ref",
    "$dynamicRef",
    "$recursiveRef",
    "format",
    "dependencies",
    "dependentRequired",
    "dependentSchemas",
    "patternProperties",
    "propertyNames",
    "if",
    "then",
    "else",
    "contains",
    "minContains",
    "maxContains",
    "additionalItems",
    "prefixItems",
    "unevaluatedItems",
    "unevaluatedProperties",
    "contentEncoding",
    "contentMediaType",
    "contentSchema",
];

/// 编译后的 schema；校验纯函数、无副作用
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    root: Node,
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> Result<Self, SchemaError> {
        Ok(Self {
            root: compile_node(schema, "#")?,
        })
    }

    /// 校验；返回全部错误（不在第一个错误处停止）
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        check(&self.root, instance, "", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn invalid(location: &str, message: impl Into<String>) -> SchemaError {
    SchemaError::Invalid {
        location: location.to_string(),
        message: message.into(),
    }
}

fn compile_node(schema: &Value, loc: &str) -> Result<Node, SchemaError> {
    let obj = match schema {
        Value::Bool(true) => return Ok(Node::Any),
        Value::Bool(false) => return Ok(Node::Never),
        Value::Object(obj) => obj,
        _ => return Err(invalid(loc, "schema must be an object or boolean")),
    };

    if let Some(key) = obj.keys().find(|k| UNSUPPORTED_KEYWORDS.contains(&k.as_str())) {
        return Err(invalid(loc, format!("unsupported keyword '{key}'")));
    }

    let types = match obj.get("type") {
        None => None,
        Some(Value::String(name)) => Some(vec![parse_type(name, loc)?]),
        Some(Value::Array(names)) => Some(
            names
                .iter()
                .map(|n| {
                    n.as_str()
                        .ok_or_else(|| invalid(loc, "type entries must be strings"))
                        .and_then(|s| parse_type(s, loc))
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(_) => return Err(invalid(loc, "type must be a string or array")),
    };

    let enum_values = match obj.get("enum") {
        None => None,
        Some(Value::Array(values)) if !values.is_empty() => Some(values.clone()),
        Some(_) => return Err(invalid(loc, "enum must be a non-empty array")),
    };

    let required = match obj.get("required") {
        None => Vec::new(),
        Some(Value::Array(keys)) => keys
            .iter()
            .map(|k| {
                k.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(loc, "required entries must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid(loc, "required must be an array")),
    };

    let mut properties = BTreeMap::new();
    match obj.get("properties") {
        None => {}
        Some(Value::Object(props)) => {
            for (key, sub) in props {
                let sub_loc = format!("{loc}/properties/{key}");
                properties.insert(key.clone(), compile_node(sub, &sub_loc)?);
            }
        }
        Some(_) => return Err(invalid(loc, "properties must be an object")),
    }

    let additional = match obj.get("additionalProperties") {
        None | Some(Value::Bool(true)) => Additional::Allow,
        Some(Value::Bool(false)) => Additional::Deny,
        Some(sub @ Value::Object(_)) => Additional::Schema(Box::new(compile_node(
            sub,
            &format!("{loc}/additionalProperties"),
        )?)),
        Some(_) => return Err(invalid(loc, "additionalProperties must be a boolean or schema")),
    };

    let items = match obj.get("items") {
        None => None,
        Some(sub) => Some(compile_node(sub, &format!("{loc}/items"))?),
    };

    let pattern = match obj.get("pattern") {
        None => None,
        Some(Value::String(p)) => Some(
            Regex::new(p).map_err(|e| invalid(loc, format!("pattern is not a valid regex: {e}")))?,
        ),
        Some(_) => return Err(invalid(loc, "pattern must be a string")),
    };

    let unique_items = match obj.get("uniqueItems") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(invalid(loc, "uniqueItems must be a boolean")),
    };

    let multiple_of = number_keyword(obj, "multipleOf", loc)?;
    if multiple_of.is_some_and(|m| m <= 0.0) {
        return Err(invalid(loc, "multipleOf must be greater than 0"));
    }

    let not = match obj.get("not") {
        None => None,
        Some(sub) => Some(compile_node(sub, &format!("{loc}/not"))?),
    };

    Ok(Node::Rules(Box::new(Rules {
        types,
        enum_values,
        const_value: obj.get("const").cloned(),
        required,
        properties,
        additional,
        items,
        min_length: usize_keyword(obj, "minLength", loc)?,
        max_length: usize_keyword(obj, "maxLength", loc)?,
        min_items: usize_keyword(obj, "minItems", loc)?,
        max_items: usize_keyword(obj, "maxItems", loc)?,
        min_properties: usize_keyword(obj, "minProperties", loc)?,
        max_properties: usize_keyword(obj, "maxProperties", loc)?,
        unique_items,
        pattern,
        minimum: number_keyword(obj, "minimum", loc)?,
        maximum: number_keyword(obj, "maximum", loc)?,
        exclusive_minimum: number_keyword(obj, "exclusiveMinimum", loc)?,
        exclusive_maximum: number_keyword(obj, "exclusiveMaximum", loc)?,
        multiple_of,
        all_of: subschemas(obj, "allOf", loc)?,
        any_of: subschemas(obj, "anyOf", loc)?,
        one_of: subschemas(obj, "oneOf", loc)?,
        not,
    })))
}

fn subschemas(obj: &Map<String, Value>, key: &str, loc: &str) -> Result<Vec<Node>, SchemaError> {
    match obj.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(subs)) if !subs.is_empty() => subs
            .iter()
            .enumerate()
            .map(|(i, sub)| compile_node(sub, &format!("{loc}/{key}/{i}")))
            .collect(),
        Some(_) => Err(invalid(loc, format!("{key} must be a non-empty array"))),
    }
}

fn is_valid(node: &Node, value: &Value) -> bool {
    let mut scratch = Vec::new();
    check(node, value, "", &mut scratch);
    scratch.is_empty()
}

fn parse_type(name: &str, loc: &str) -> Result<JsonType, SchemaError> {
    JsonType::parse(name).ok_or_else(|| invalid(loc, format!("unknown type '{name}'")))
}

fn usize_keyword(obj: &Map<String, Value>, key: &str, loc: &str) -> Result<Option<usize>, SchemaError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| invalid(loc, format!("{key} must be a non-negative integer"))),
    }
}

fn number_keyword(obj: &Map<String, Value>, key: &str, loc: &str) -> Result<Option<f64>, SchemaError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(loc, format!("{key} must be a number"))),
    }
}

fn check(node: &Node, value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    let rules = match node {
        Node::Any => return,
        Node::Never => {
            errors.push(ValidationError::new(path, "must not be present"));
            return;
        }
        Node::Rules(rules) => rules,
    };

    if let Some(types) = &rules.types {
        if !types.iter().any(|t| t.matches(value)) {
            let names: Vec<_> = types.iter().map(|t| t.name()).collect();
            errors.push(ValidationError::new(path, format!("must be {}", names.join(","))));
            return;
        }
    }

    if let Some(allowed) = &rules.enum_values {
        if !allowed.contains(value) {
            errors.push(ValidationError::new(
                path,
                format!("must be equal to one of the allowed values: {}", Value::Array(allowed.clone())),
            ));
        }
    }

    if let Some(expected) = &rules.const_value {
        if expected != value {
            errors.push(ValidationError::new(path, format!("must be equal to constant {expected}")));
        }
    }

    for sub in &rules.all_of {
        check(sub, value, path, errors);
    }
    if !rules.any_of.is_empty() && !rules.any_of.iter().any(|sub| is_valid(sub, value)) {
        errors.push(ValidationError::new(path, "must match a schema in anyOf"));
    }
    if !rules.one_of.is_empty() {
        let matched = rules.one_of.iter().filter(|sub| is_valid(sub, value)).count();
        if matched != 1 {
            errors.push(ValidationError::new(
                path,
                format!("must match exactly one schema in oneOf (matched {matched})"),
            ));
        }
    }
    if let Some(sub) = &rules.not {
        if is_valid(sub, value) {
            errors.push(ValidationError::new(path, "must NOT be valid against schema in not"));
        }
    }

    match value {
        Value::Object(map) => {
            if let Some(min) = rules.min_properties {
                if map.len() < min {
                    errors.push(ValidationError::new(path, format!("must NOT have fewer than {min} properties")));
                }
            }
            if let Some(max) = rules.max_properties {
                if map.len() > max {
                    errors.push(ValidationError::new(path, format!("must NOT have more than {max} properties")));
                }
            }
            for key in &rules.required {
                if !map.contains_key(key) {
                    errors.push(ValidationError::new(
                        path,
                        format!("must have required property '{key}'"),
                    ));
                }
            }
            for (key, sub_value) in map {
                let sub_path = format!("{path}/{key}");
                match rules.properties.get(key) {
                    Some(sub) => check(sub, sub_value, &sub_path, errors),
                    None => match &rules.additional {
                        Additional::Allow => {}
                        Additional::Deny => errors.push(ValidationError::new(
                            path,
                            format!("must NOT have additional property '{key}'"),
                        )),
                        Additional::Schema(sub) => check(sub, sub_value, &sub_path, errors),
                    },
                }
            }
        }
        Value::Array(items) => {
            if let Some(min) = rules.min_items {
                if items.len() < min {
                    errors.push(ValidationError::new(path, format!("must NOT have fewer than {min} items")));
                }
            }
            if let Some(max) = rules.max_items {
                if items.len() > max {
                    errors.push(ValidationError::new(path, format!("must NOT have more than {max} items")));
                }
            }
            if rules.unique_items {
                let duplicate = items
                    .iter()
                    .enumerate()
                    .find_map(|(i, a)| items[..i].iter().position(|b| b == a).map(|j| (j, i)));
                if let Some((j, i)) = duplicate {
                    errors.push(ValidationError::new(
                        path,
                        format!("must NOT have duplicate items (items ## {j} and {i} are identical)"),
                    ));
                }
            }
            if let Some(item_schema) = &rules.items {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}/{i}"), errors);
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count();
            if let Some(min) = rules.min_length {
                if len < min {
                    errors.push(ValidationError::new(path, format!("must NOT have fewer than {min} characters")));
                }
            }
            if let Some(max) = rules.max_length {
                if len > max {
                    errors.push(ValidationError::new(path, format!("must NOT have more than {max} characters")));
                }
            }
            if let Some(re) = &rules.pattern {
                if !re.is_match(s) {
                    errors.push(ValidationError::new(
                        path,
                        format!("must match pattern \"{}\"", re.as_str()),
                    ));
                }
            }
        }
        Value::Number(n) => {
            if let (Some(min), Some(v)) = (rules.minimum, n.as_f64()) {
                if v < min {
                    errors.push(ValidationError::new(path, format!("must be >= {min}")));
                }
            }
            if let (Some(max), Some(v)) = (rules.maximum, n.as_f64()) {
                if v > max {
                    errors.push(ValidationError::new(path, format!("must be <= {max}")));
                }
            }
            if let (Some(min), Some(v)) = (rules.exclusive_minimum, n.as_f64()) {
                if v <= min {
                    errors.push(ValidationError::new(path, format!("must be > {min}")));
                }
            }
            if let (Some(max), Some(v)) = (rules.exclusive_maximum, n.as_f64()) {
                if v >= max {
                    errors.push(ValidationError::new(path, format!("must be < {max}")));
                }
            }
            if let (Some(m), Some(v)) = (rules.multiple_of, n.as_f64()) {
                let q = v / m;
                if (q - q.round()).abs() > 1e-9 {
                    errors.push(ValidationError::new(path, format!("must be multiple of {m}")));
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required_and_types() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "required": ["a", "b"],
            "properties": {"a": {"type": "string"}, "b": {"type": "integer"}}
        }))
        .unwrap();
        assert!(schema.validate(&json!({"a": "x", "b": 1})).is_ok());
        let errors = schema.validate(&json!({"a": 5})).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.path == "/a" && e.message == "must be string"));
        assert!(errors.iter().any(|e| e.message.contains("'b'")));
    }

    #[test]
    fn test_enum_and_nested_paths() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "properties": {
                "meta": {"type": "object", "properties": {"status": {"enum": ["ok", "error"]}}}
            }
        }))
        .unwrap();
        let errors = schema
            .validate(&json!({"meta": {"status": "invalid_status"}}))
            .unwrap_err();
        assert_eq!(errors[0].path, "/meta/status");
    }

    #[test]
    fn test_type_union_and_null() {
        let schema = CompiledSchema::compile(&json!({"type": ["string", "null"]})).unwrap();
        assert!(schema.validate(&json!(null)).is_ok());
        assert!(schema.validate(&json!("s")).is_ok());
        assert!(schema.validate(&json!(1)).is_err());
    }

    #[test]
    fn test_array_items() {
        let schema = CompiledSchema::compile(&json!({
            "type": "array", "minItems": 1, "items": {"type": "object", "required": ["id"]}
        }))
        .unwrap();
        assert!(schema.validate(&json!([{"id": 1}])).is_ok());
        assert!(schema.validate(&json!([])).is_err());
        let errors = schema.validate(&json!([{"id": 1}, {}])).unwrap_err();
        assert_eq!(errors[0].path, "/1");
    }

    #[test]
    fn test_additional_properties_false() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object", "properties": {"a": true}, "additionalProperties": false
        }))
        .unwrap();
        assert!(schema.validate(&json!({"a": 1})).is_ok());
        assert!(schema.validate(&json!({"a": 1, "b": 2})).is_err());
    }

    #[test]
    fn test_string_and_number_bounds() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "minLength": 2},
                "count": {"type": "number", "minimum": 0, "maximum": 10}
            }
        }))
        .unwrap();
        assert!(schema.validate(&json!({"name": "ab", "count": 5})).is_ok());
        assert_eq!(
            schema.validate(&json!({"name": "a", "count": 11})).unwrap_err().len(),
            2
        );
    }

    #[test]
    fn test_compile_rejects_bad_keywords() {
        assert!(CompiledSchema::compile(&json!({"type": "strng"})).is_err());
        assert!(CompiledSchema::compile(&json!({"required": "a"})).is_err());
        assert!(CompiledSchema::compile(&json!({"properties": []})).is_err());
        assert!(CompiledSchema::compile(&json!({"enum": []})).is_err());
        assert!(CompiledSchema::compile(&json!({"minLength": -1})).is_err());
        assert!(CompiledSchema::compile(&json!("object")).is_err());
    }

    #[test]
    fn test_pattern_and_combinators_enforced() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "pattern": "^[0-9]+$"},
                "kind": {"anyOf": [{"const": "a"}, {"const": "b"}]},
                "level": {"oneOf": [{"type": "integer"}, {"type": "number", "minimum": 5}]},
                "name": {"allOf": [{"type": "string"}, {"minLength": 2}], "not": {"const": "xx"}}
            }
        }))
        .unwrap();
        assert!(schema
            .validate(&json!({"id": "42", "kind": "b", "level": 1, "name": "ab"}))
            .is_ok());

        let errors = schema
            .validate(&json!({"id": "abc", "kind": "zzz", "level": 7, "name": "xx"}))
            .unwrap_err();
        let message = |path: &str| {
            errors
                .iter()
                .find(|e| e.path == path)
                .map(|e| e.message.clone())
                .unwrap_or_default()
        };
        assert_eq!(errors.len(), 4);
        assert!(message("/id").contains("pattern"));
        assert!(message("/kind").contains("anyOf"));
        assert!(message("/level").contains("matched 2"));
        assert!(message("/name").contains("not"));
    }

    #[test]
    fn test_numeric_and_collection_keywords() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "minProperties": 1,
            "properties": {
                "n": {"exclusiveMinimum": 0, "exclusiveMaximum": 10, "multipleOf": 2},
                "tags": {"type": "array", "uniqueItems": true}
            }
        }))
        .unwrap();
        assert!(schema.validate(&json!({"n": 4, "tags": ["a", "b"]})).is_ok());
        assert!(schema.validate(&json!({})).is_err());
        assert!(schema.validate(&json!({"n": 0})).is_err());
        assert!(schema.validate(&json!({"n": 3})).is_err());
        assert!(schema.validate(&json!({"n": 10})).is_err());
        assert!(schema.validate(&json!({"tags": ["a", "a"]})).is_err());
    }

    #[test]
    fn test_unenforceable_keywords_rejected() {
        for schema in [
            json!({"properties": {"ref": {"$ref": "#/definitions/x"}}, "definitions": {"x": {"type": "integer"}}}),
            json!({"type": "string", "format": "email"}),
            json!({"if": {"type": "string"}, "then": {"minLength": 1}}),
            json!({"items": {"patternProperties": {"^a": {"type": "string"}}}}),
            json!({"anyOf": [{"dependencies": {"a": ["b"]}}]}),
        ] {
            let err = CompiledSchema::compile(&schema).unwrap_err();
            assert!(err.to_string().contains("unsupported keyword"), "{err}");
        }
        assert!(CompiledSchema::compile(&json!({"pattern": "("})).is_err());
        assert!(CompiledSchema::compile(&json!({"anyOf": []})).is_err());
        assert!(CompiledSchema::compile(&json!({"multipleOf": 0})).is_err());
    }

    #[test]
    fn test_unknown_keywords_ignored() {
        let schema = CompiledSchema::compile(&json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "x",
            "type": "object"
        }))
        .unwrap();
        assert!(schema.validate(&json!({})).is_ok());
    }
}
