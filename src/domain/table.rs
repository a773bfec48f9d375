//! Tabular query results.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Serialize, Serializer};
use serde_json::{Map, Number, Value};
use time::{
    Date, OffsetDateTime, PrimitiveDateTime, Time, format_description::well_known::Rfc3339,
    macros::format_description,
};

use super::error::DomainError;

/// A single typed cell as returned by the database.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(Date),
    Time(Time),
    DateTime(PrimitiveDateTime),
    DateTimeOffset(OffsetDateTime),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Null and whitespace-only text both count as blank.
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    /// Render the value as display text; `None` for null.
    pub fn render(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(value) => Some(value.to_string()),
            CellValue::Int(value) => Some(value.to_string()),
            CellValue::Float(value) => Some(value.to_string()),
            CellValue::Text(value) => Some(value.clone()),
            CellValue::Date(value) => Some(
                value
                    .format(format_description!("[year]-[month]-[day]"))
                    .unwrap_or_else(|_| value.to_string()),
            ),
            CellValue::Time(value) => Some(
                value
                    .format(format_description!("[hour]:[minute]:[second]"))
                    .unwrap_or_else(|_| value.to_string()),
            ),
            CellValue::DateTime(value) => Some(
                value
                    .format(format_description!(
                        "[year]-[month]-[day]T[hour]:[minute]:[second]"
                    ))
                    .unwrap_or_else(|_| value.to_string()),
            ),
            CellValue::DateTimeOffset(value) => Some(
                value
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| value.to_string()),
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(value) => Value::Bool(*value),
            CellValue::Int(value) => Value::Number((*value).into()),
            CellValue::Float(value) => Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            other => other.render().map(Value::String).unwrap_or(Value::Null),
        }
    }

    /// Equality against a user-supplied key, interpreted by the cell's type.
    pub fn matches_key(&self, key: &str) -> bool {
        let key = key.trim();
        match self {
            CellValue::Null => false,
            CellValue::Int(value) => match key.parse::<i64>() {
                Ok(parsed) => parsed == *value,
                Err(_) => key
                    .parse::<f64>()
                    .map(|parsed| parsed == *value as f64)
                    .unwrap_or(false),
            },
            CellValue::Float(value) => key
                .parse::<f64>()
                .map(|parsed| parsed == *value)
                .unwrap_or(false),
            CellValue::Bool(value) => key
                .parse::<bool>()
                .map(|parsed| parsed == *value)
                .unwrap_or(false),
            other => other
                .render()
                .map(|text| text.trim() == key)
                .unwrap_or(false),
        }
    }

    fn sort_rank(&self) -> u8 {
        match self {
            CellValue::Bool(_) => 0,
            CellValue::Int(_) | CellValue::Float(_) => 1,
            CellValue::Date(_)
            | CellValue::Time(_)
            | CellValue::DateTime(_)
            | CellValue::DateTimeOffset(_) => 2,
            CellValue::Text(_) => 3,
            CellValue::Null => 4,
        }
    }

    /// Total order used for sorting: `bool < numbers < temporal < text < null`.
    pub fn sort_cmp(&self, other: &CellValue) -> Ordering {
        use CellValue::*;

        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (DateTimeOffset(a), DateTimeOffset(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (a, b) if a.sort_rank() == b.sort_rank() => a.render().cmp(&b.render()),
            (a, b) => a.sort_rank().cmp(&b.sort_rank()),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    cells: Vec<CellValue>,
}

impl Row {
    pub fn new(cells: Vec<CellValue>) -> Self {
        Self { cells }
    }

    pub fn get(&self, index: usize) -> Option<&CellValue> {
        self.cells.get(index)
    }

    pub fn cells(&self) -> &[CellValue] {
        &self.cells
    }
}

/// Ordered rows sharing a single ordered column list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl ResultSet {
    /// Build a result set, rejecting rows whose width differs from the header.
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Result<Self, DomainError> {
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.cells.len() != columns.len())
        {
            return Err(DomainError::invariant(format!(
                "row {index} has {} cells but the result has {} columns",
                row.cells.len(),
                columns.len()
            )));
        }
        Ok(Self {
            columns: disambiguate(columns),
            rows,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Iterate one row as `(column, value)` pairs in column order.
    pub fn record<'a>(&'a self, row: &'a Row) -> impl Iterator<Item = (&'a str, &'a CellValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(row.cells.iter())
    }

    pub fn record_json(&self, row: &Row) -> Map<String, Value> {
        self.record(row)
            .map(|(column, value)| (column.to_string(), value.to_json()))
            .collect()
    }
}

/// Suffix repeated column names (`total`, `total_2`, ...) so every cell keeps
/// its own key in JSON records.
fn disambiguate(columns: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(columns.len());
    columns
        .into_iter()
        .map(|column| {
            if seen.insert(column.clone()) {
                return column;
            }
            let mut suffix = 2;
            loop {
                let candidate = format!("{column}_{suffix}");
                if seen.insert(candidate.clone()) {
                    return candidate;
                }
                suffix += 1;
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    fn text(value: &str) -> CellValue {
        CellValue::Text(value.to_string())
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = ResultSet::new(
            vec!["a".to_string(), "b".to_string()],
            vec![Row::new(vec![CellValue::Int(1)])],
        )
        .expect_err("ragged row");
        assert!(err.to_string().contains("row 0 has 1 cells"));
    }

    #[test]
    fn record_preserves_column_order() {
        let set = ResultSet::new(
            vec!["region".to_string(), "total".to_string()],
            vec![Row::new(vec![text("north"), CellValue::Int(12)])],
        )
        .expect("valid set");
        let pairs: Vec<_> = set.record(&set.rows()[0]).collect();
        assert_eq!(pairs[0], ("region", &text("north")));
        assert_eq!(pairs[1], ("total", &CellValue::Int(12)));
    }

    #[test]
    fn json_records_keep_column_order_and_repeated_names() {
        let set = ResultSet::new(
            vec![
                "total".to_string(),
                "region".to_string(),
                "total".to_string(),
            ],
            vec![Row::new(vec![
                CellValue::Int(12),
                text("north"),
                CellValue::Int(30),
            ])],
        )
        .expect("valid set");
        assert_eq!(set.columns(), ["total", "region", "total_2"]);

        let record = set.record_json(&set.rows()[0]);
        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, ["total", "region", "total_2"]);
        assert_eq!(record["total_2"], Value::from(30));
    }

    #[test]
    fn key_matching_follows_cell_type() {
        assert!(CellValue::Int(1042).matches_key(" 1042 "));
        assert!(CellValue::Int(7).matches_key("7.0"));
        assert!(!CellValue::Int(7).matches_key("seven"));
        assert!(text("A-12").matches_key("A-12"));
        assert!(!CellValue::Null.matches_key(""));
    }

    #[test]
    fn sort_order_places_numbers_before_text_and_null_last() {
        let mut values = vec![
            CellValue::Null,
            text("b"),
            CellValue::Float(2.5),
            CellValue::Int(2),
            CellValue::Date(date!(2024 - 01 - 01)),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(values[0], CellValue::Int(2));
        assert_eq!(values[1], CellValue::Float(2.5));
        assert_eq!(values[2], CellValue::Date(date!(2024 - 01 - 01)));
        assert_eq!(values[3], text("b"));
        assert_eq!(values[4], CellValue::Null);
    }

    #[test]
    fn json_rendering_of_temporal_values() {
        assert_eq!(
            CellValue::Date(date!(2024 - 02 - 29)).to_json(),
            Value::String("2024-02-29".to_string())
        );
        assert_eq!(CellValue::Float(f64::NAN).to_json(), Value::Null);
    }
}
