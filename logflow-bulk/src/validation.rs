//! Commands are validated synchronously, before being admitted. Every action has its own
//! [Validator], looked up by action name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use logflow_core::Value;

use crate::command::BulkCommand;
use crate::error::{Error, Result};

/// Checks the parameters of the commands of one action. Returns the reason of the rejection,
/// the registry adds the command to it.
pub trait Validator: Send + Sync {
    fn validate(&self, command: &BulkCommand) -> std::result::Result<(), String>;
}

/// Validators keyed by action name.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, action: impl Into<String>, validator: Arc<dyn Validator>) -> Self {
        self.validators.insert(action.into(), validator);
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.validators.contains_key(action)
    }

    pub fn validate(&self, command: &BulkCommand) -> Result<()> {
        let validator = self
            .validators
            .get(&command.action)
            .ok_or_else(|| Error::UnknownAction(command.action.clone()))?;
        validator
            .validate(command)
            .map_err(|reason| Error::Validation(format!("{reason} in command: {command}")))
    }
}

/// Expected shape of a parameter value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Bool,
    Int,
    /// any integer or floating value
    Number,
    List(Box<ParamKind>),
    Map,
    Enum(Vec<String>),
    /// name of a schema known to the [SchemaCatalog]
    SchemaRef,
    /// `prefix:field` of a schema known to the [SchemaCatalog]
    FieldRef,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::String => f.write_str("string"),
            ParamKind::Bool => f.write_str("boolean"),
            ParamKind::Int => f.write_str("integer"),
            ParamKind::Number => f.write_str("number"),
            ParamKind::List(inner) => write!(f, "list of {inner}"),
            ParamKind::Map => f.write_str("map"),
            ParamKind::Enum(values) => write!(f, "one of [{}]", values.join(", ")),
            ParamKind::SchemaRef => f.write_str("schema name"),
            ParamKind::FieldRef => f.write_str("field name"),
        }
    }
}

#[derive(Clone, Debug)]
struct ParamSpec {
    kind: ParamKind,
    required: bool,
}

/// Declared parameters of an action.
#[derive(Clone, Debug, Default)]
pub struct ParamSchema {
    params: BTreeMap<String, ParamSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.insert(
            name.into(),
            ParamSpec {
                kind,
                required: false,
            },
        );
        self
    }

    pub fn required(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.insert(
            name.into(),
            ParamSpec {
                kind,
                required: true,
            },
        );
        self
    }
}

#[derive(Clone, Debug)]
struct SchemaInfo {
    prefix: String,
    fields: BTreeSet<String>,
}

/// Document schemas and their fields, the reference for [ParamKind::SchemaRef] and
/// [ParamKind::FieldRef] values.
#[derive(Clone, Debug, Default)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, SchemaInfo>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema<I, S>(
        mut self,
        name: impl Into<String>,
        prefix: impl Into<String>,
        fields: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schemas.insert(
            name.into(),
            SchemaInfo {
                prefix: prefix.into(),
                fields: fields.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// `field` is either `prefix:name` or `schema:name`.
    pub fn has_field(&self, field: &str) -> bool {
        let Some((qualifier, name)) = field.split_once(':') else {
            return false;
        };
        self.schemas.iter().any(|(schema, info)| {
            (info.prefix == qualifier || schema == qualifier) && info.fields.contains(name)
        })
    }
}

/// [Validator] checking the parameters of a command against a declared [ParamSchema].
pub struct SchemaValidator {
    schema: ParamSchema,
    catalog: Arc<SchemaCatalog>,
}

impl SchemaValidator {
    pub fn new(schema: ParamSchema, catalog: Arc<SchemaCatalog>) -> Self {
        Self { schema, catalog }
    }

    fn check(&self, name: &str, kind: &ParamKind, value: &Value) -> std::result::Result<(), String> {
        let mismatch = || format!("Parameter '{name}' must be of type {kind}, got {value:?}");
        match kind {
            ParamKind::String => value.as_str().map(|_| ()).ok_or_else(mismatch),
            ParamKind::Bool => match value {
                Value::Bool(_) => Ok(()),
                _ => Err(mismatch()),
            },
            ParamKind::Int => value.as_i128().map(|_| ()).ok_or_else(mismatch),
            ParamKind::Number => value.is_numeric().then_some(()).ok_or_else(mismatch),
            ParamKind::Map => value.as_map().map(|_| ()).ok_or_else(mismatch),
            ParamKind::List(inner) => match value {
                Value::List(items) => items
                    .iter()
                    .try_for_each(|item| self.check(name, inner, item)),
                _ => Err(mismatch()),
            },
            ParamKind::Enum(allowed) => {
                let text = value.as_str().ok_or_else(mismatch)?;
                if allowed.iter().any(|candidate| candidate == text) {
                    Ok(())
                } else {
                    Err(format!(
                        "Parameter '{name}' value '{text}' is not one of [{}]",
                        allowed.join(", ")
                    ))
                }
            }
            ParamKind::SchemaRef => {
                let schema = value.as_str().ok_or_else(mismatch)?;
                if self.catalog.has_schema(schema) {
                    Ok(())
                } else {
                    Err(format!("Unknown schema '{schema}' for parameter '{name}'"))
                }
            }
            ParamKind::FieldRef => {
                let field = value.as_str().ok_or_else(mismatch)?;
                if self.catalog.has_field(field) {
                    Ok(())
                } else {
                    Err(format!("Unknown field '{field}' for parameter '{name}'"))
                }
            }
        }
    }
}

impl Validator for SchemaValidator {
    fn validate(&self, command: &BulkCommand) -> std::result::Result<(), String> {
        if let Some(unknown) = command
            .params
            .keys()
            .find(|name| !self.schema.params.contains_key(*name))
        {
            return Err(format!("Unknown parameter '{unknown}'"));
        }
        for (name, spec) in &self.schema.params {
            match command.params.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("Missing required parameter '{name}'"));
                }
                None | Some(Value::Null) => {}
                Some(value) => self.check(name, &spec.kind, value)?,
            }
        }
        Ok(())
    }
}
