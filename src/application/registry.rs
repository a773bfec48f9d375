//! Query registry: the fixed set of named queries a dashboard may read.
//!
//! Definitions are registered through [`QueryRegistryBuilder`] at startup.
//! The built [`QueryRegistry`] exposes no mutation, so it can be shared behind
//! an `Arc` and read concurrently without locking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::domain::error::DomainError;
use crate::domain::queries::{PreparedQuery, QueryDefinition};
use crate::domain::types::SqlValue;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown query `{name}`")]
    UnknownQuery { name: String },
    #[error("parameter mismatch for query `{query}`: {reason}")]
    ParameterMismatch { query: String, reason: String },
    #[error("query `{name}` is registered more than once")]
    Duplicate { name: String },
    #[error("invalid query definition: {0}")]
    InvalidDefinition(String),
}

impl RegistryError {
    pub fn unknown(name: impl Into<String>) -> Self {
        Self::UnknownQuery { name: name.into() }
    }

    fn mismatch(query: &str, reason: impl Into<String>) -> Self {
        Self::ParameterMismatch {
            query: query.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::UnknownQuery { .. } => "unknown_query",
            RegistryError::ParameterMismatch { .. } => "parameter_mismatch",
            RegistryError::Duplicate { .. } => "duplicate_query",
            RegistryError::InvalidDefinition(_) => "invalid_definition",
        }
    }
}

impl From<DomainError> for RegistryError {
    fn from(err: DomainError) -> Self {
        Self::InvalidDefinition(err.to_string())
    }
}

#[derive(Debug, Default)]
pub struct QueryRegistryBuilder {
    order: Vec<String>,
    definitions: HashMap<String, Arc<QueryDefinition>>,
}

impl QueryRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition after validating its shape and default arguments.
    pub fn register(&mut self, definition: QueryDefinition) -> Result<&mut Self, RegistryError> {
        definition.validate_shape()?;
        if self.definitions.contains_key(&definition.name) {
            return Err(RegistryError::Duplicate {
                name: definition.name,
            });
        }
        bind_arguments(&definition, &definition.arguments)?;

        debug!(
            target = "dashcache::registry",
            query = %definition.name,
            params = definition.params.len(),
            max_staleness_secs = definition.max_staleness.as_secs(),
            "Registered query"
        );
        self.order.push(definition.name.clone());
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(self)
    }

    pub fn build(self) -> QueryRegistry {
        QueryRegistry {
            order: self.order,
            definitions: self.definitions,
        }
    }
}

#[derive(Debug, Default)]
pub struct QueryRegistry {
    order: Vec<String>,
    definitions: HashMap<String, Arc<QueryDefinition>>,
}

impl QueryRegistry {
    pub fn builder() -> QueryRegistryBuilder {
        QueryRegistryBuilder::new()
    }

    /// Build a registry from a list of definitions, failing on the first bad one.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = QueryDefinition>,
    ) -> Result<Self, RegistryError> {
        let mut builder = Self::builder();
        for definition in definitions {
            builder.register(definition)?;
        }
        Ok(builder.build())
    }

    pub fn lookup(&self, name: &str) -> Result<&QueryDefinition, RegistryError> {
        self.definitions
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| RegistryError::unknown(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Validate `arguments` against the parameter schema and bind them in
    /// placeholder order.
    pub fn prepare(
        &self,
        name: &str,
        arguments: &BTreeMap<String, SqlValue>,
    ) -> Result<PreparedQuery, RegistryError> {
        let definition = self.lookup(name)?;
        let values = bind_arguments(definition, arguments)?;
        Ok(PreparedQuery {
            name: definition.name.clone(),
            sql: definition.sql.clone(),
            values,
        })
    }

    /// Prepare with the arguments bound at registration.
    pub fn prepare_default(&self, name: &str) -> Result<PreparedQuery, RegistryError> {
        let definition = self.lookup(name)?;
        self.prepare(name, &definition.arguments)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Registered definitions in registration order.
    pub fn definitions(&self) -> impl Iterator<Item = &QueryDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.definitions.get(name).map(Arc::as_ref))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn bind_arguments(
    definition: &QueryDefinition,
    arguments: &BTreeMap<String, SqlValue>,
) -> Result<Vec<SqlValue>, RegistryError> {
    if let Some(unknown) = arguments
        .keys()
        .find(|key| !definition.params.iter().any(|param| &param.name == *key))
    {
        return Err(RegistryError::mismatch(
            &definition.name,
            format!("unknown parameter `{unknown}`"),
        ));
    }

    definition
        .params
        .iter()
        .map(|param| {
            let value = arguments.get(&param.name).cloned().unwrap_or(SqlValue::Null);
            if value.is_null() && !param.nullable {
                return Err(RegistryError::mismatch(
                    &definition.name,
                    format!("parameter `{}` requires a value", param.name),
                ));
            }
            value.coerce(param.kind).map_err(|err| {
                RegistryError::mismatch(
                    &definition.name,
                    format!("parameter `{}`: {err}", param.name),
                )
            })
        })
        .collect()
}
