//! Named query definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::error::DomainError;
use super::types::{ParamType, SqlValue};

/// One typed positional placeholder (`@P1`, `@P2`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamType,
    pub nullable: bool,
}

/// A registered dashboard query. Immutable once registered.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDefinition {
    pub name: String,
    pub sql: String,
    pub params: Vec<ParamSpec>,
    pub max_staleness: Duration,
    /// Arguments bound by scheduled refreshes, keyed by parameter name.
    pub arguments: BTreeMap<String, SqlValue>,
    /// Columns every result must contain.
    pub expected_columns: Vec<String>,
}

impl QueryDefinition {
    /// Structural checks that do not depend on argument values.
    pub fn validate_shape(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("query name must not be empty"));
        }
        if self.sql.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "query `{}` has empty SQL text",
                self.name
            )));
        }
        if self.max_staleness.is_zero() {
            return Err(DomainError::validation(format!(
                "query `{}` must allow a non-zero staleness",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for param in &self.params {
            if param.name.trim().is_empty() {
                return Err(DomainError::validation(format!(
                    "query `{}` has an unnamed parameter",
                    self.name
                )));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(DomainError::validation(format!(
                    "query `{}` declares parameter `{}` twice",
                    self.name, param.name
                )));
            }
        }

        let placeholders = placeholder_indices(&self.sql);
        let expected: BTreeSet<usize> = (1..=self.params.len()).collect();
        if placeholders != expected {
            return Err(DomainError::validation(format!(
                "query `{}` declares {} parameter(s) but its SQL uses placeholders {:?}",
                self.name,
                self.params.len(),
                placeholders
                    .iter()
                    .map(|index| format!("@P{index}"))
                    .collect::<Vec<_>>()
            )));
        }

        Ok(())
    }
}

/// A query ready for execution: SQL text plus values in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedQuery {
    pub name: String,
    pub sql: String,
    pub values: Vec<SqlValue>,
}

/// Collect the distinct `@Pn` placeholder indices used outside string literals.
pub fn placeholder_indices(sql: &str) -> BTreeSet<usize> {
    let bytes = sql.as_bytes();
    let mut found = BTreeSet::new();
    let mut in_literal = false;
    let mut index = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        if byte == b'\'' {
            in_literal = !in_literal;
            index += 1;
            continue;
        }
        if !in_literal
            && byte == b'@'
            && matches!(bytes.get(index + 1), Some(b'P') | Some(b'p'))
        {
            let digits_start = index + 2;
            let mut end = digits_start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            let word_continues = bytes
                .get(end)
                .is_some_and(|next| next.is_ascii_alphanumeric() || *next == b'_');
            if end > digits_start && !word_continues {
                if let Ok(number) = sql[digits_start..end].parse::<usize>() {
                    found.insert(number);
                }
            }
            index = end.max(index + 1);
            continue;
        }
        index += 1;
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(sql: &str, params: usize) -> QueryDefinition {
        QueryDefinition {
            name: "personnel".to_string(),
            sql: sql.to_string(),
            params: (0..params)
                .map(|index| ParamSpec {
                    name: format!("p{index}"),
                    kind: ParamType::Int,
                    nullable: true,
                })
                .collect(),
            max_staleness: Duration::from_secs(60),
            arguments: BTreeMap::new(),
            expected_columns: Vec::new(),
        }
    }

    #[test]
    fn finds_placeholders_outside_literals() {
        let found = placeholder_indices("EXEC report @P1, '@P9', @p2, @P10x, @Param");
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn shape_accepts_contiguous_placeholders() {
        definition("EXEC Rpt_Data @P1, @P2, @P3", 3)
            .validate_shape()
            .expect("valid definition");
    }

    #[test]
    fn shape_rejects_count_mismatch() {
        let err = definition("EXEC Rpt_Data @P1, @P3", 2)
            .validate_shape()
            .expect_err("gap in placeholders");
        assert!(err.to_string().contains("declares 2 parameter(s)"));
    }

    #[test]
    fn shape_rejects_zero_staleness() {
        let mut def = definition("SELECT 1", 0);
        def.max_staleness = Duration::ZERO;
        assert!(def.validate_shape().is_err());
    }
}
