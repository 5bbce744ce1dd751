//! 输出校验：JSON Schema 子集编译、按 agent 的 schema 注册表、纠错提示用的信封 schema

pub mod schema;
pub mod validator;

pub use schema::{CompiledSchema, SchemaError, ValidationError};
pub use validator::{envelope_schema_json, generic_schema, OutputValidator, AGENT_SCHEMA_SUFFIX};
