//! Filtered and sorted views over a cached result.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::domain::table::{CellValue, ResultSet, Row};

/// Category filter value selecting rows whose category is null or blank.
pub const NONE_CATEGORY: &str = "__NONE__";
pub const NO_MATCHES_MESSAGE: &str = "No data found with current filters.";
pub const NO_DATA_YET_MESSAGE: &str = "No data has been fetched yet.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Optional filters and ordering applied to a cached result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ViewRequest {
    pub key_column: Option<String>,
    pub key: Option<String>,
    pub category_column: Option<String>,
    pub category: Option<String>,
    pub sort: Option<String>,
    pub order: Option<SortOrder>,
}

impl ViewRequest {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Row selection over a shared result set.
#[derive(Debug, Clone)]
pub struct TableView {
    result: Arc<ResultSet>,
    rows: Vec<usize>,
    message: Option<String>,
}

impl TableView {
    pub fn apply(result: Arc<ResultSet>, request: &ViewRequest) -> Self {
        let mut rows: Vec<usize> = (0..result.len()).collect();

        if let (Some(column), Some(key)) = (non_blank(&request.key_column), non_blank(&request.key))
        {
            let Some(index) = result.column_index(column) else {
                return Self::empty(result, format!("Column '{column}' not found."));
            };
            rows.retain(|&row| cell(&result, row, index).matches_key(key));
        }

        if let Some(column) = non_blank(&request.category_column) {
            let Some(resolved) = find_column(result.columns(), column) else {
                return Self::empty(result, format!("Column '{column}' not found."));
            };
            let index = result.column_index(resolved).unwrap_or_default();
            if let Some(category) = non_blank(&request.category) {
                rows.retain(|&row| matches_category(cell(&result, row, index), category));
            }
        }

        if let Some(index) = non_blank(&request.sort).and_then(|column| result.column_index(column))
        {
            let order = request.order.unwrap_or_default();
            rows.sort_by(|&a, &b| {
                compare_nulls_last(cell(&result, a, index), cell(&result, b, index), order)
            });
        }

        let message = rows.is_empty().then(|| NO_MATCHES_MESSAGE.to_string());
        Self {
            result,
            rows,
            message,
        }
    }

    fn empty(result: Arc<ResultSet>, message: String) -> Self {
        Self {
            result,
            rows: Vec::new(),
            message: Some(message),
        }
    }

    pub fn columns(&self) -> &[String] {
        self.result.columns()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter().map(|&index| &self.result.rows()[index])
    }

    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows().map(|row| self.result.record_json(row)).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.result.len()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Resolve a column name case-insensitively: exact match first, then substring.
pub fn find_column<'a>(columns: &'a [String], target: &str) -> Option<&'a str> {
    let target = target.trim().to_lowercase();
    if target.is_empty() {
        return None;
    }
    let normalized = |column: &String| column.trim().to_lowercase();
    columns
        .iter()
        .find(|column| normalized(column) == target)
        .or_else(|| columns.iter().find(|column| normalized(column).contains(&target)))
        .map(String::as_str)
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn cell(result: &ResultSet, row: usize, column: usize) -> &CellValue {
    result.rows()[row].get(column).unwrap_or(&CellValue::Null)
}

fn matches_category(value: &CellValue, category: &str) -> bool {
    if category == NONE_CATEGORY {
        return value.is_blank();
    }
    value
        .render()
        .is_some_and(|rendered| rendered.trim() == category)
}

fn compare_nulls_last(a: &CellValue, b: &CellValue, order: SortOrder) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => match order {
            SortOrder::Asc => a.sort_cmp(b),
            SortOrder::Desc => b.sort_cmp(a),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> CellValue {
        CellValue::Text(value.to_string())
    }

    fn personnel() -> Arc<ResultSet> {
        Arc::new(
            ResultSet::new(
                vec![
                    "Person_Instance_ID".to_string(),
                    "Full_Name".to_string(),
                    " Ar_Military ".to_string(),
                ],
                vec![
                    Row::new(vec![CellValue::Int(1042), text("Avery"), text("Veteran ")]),
                    Row::new(vec![CellValue::Int(1043), text("Blake"), CellValue::Null]),
                    Row::new(vec![CellValue::Int(1044), text("Casey"), text("  ")]),
                    Row::new(vec![CellValue::Int(1045), CellValue::Null, text("Reserve")]),
                ],
            )
            .expect("valid set"),
        )
    }

    fn request() -> ViewRequest {
        ViewRequest::default()
    }

    #[test]
    fn empty_request_returns_every_row() {
        let view = TableView::apply(personnel(), &request());
        assert_eq!(view.len(), 4);
        assert_eq!(view.message(), None);
        assert_eq!(view.records()[0]["Person_Instance_ID"], Value::from(1042));
    }

    #[test]
    fn key_filter_matches_typed_cells() {
        let view = TableView::apply(
            personnel(),
            &ViewRequest {
                key_column: Some("Person_Instance_ID".to_string()),
                key: Some(" 1044 ".to_string()),
                ..request()
            },
        );
        assert_eq!(view.len(), 1);
        assert_eq!(view.records()[0]["Full_Name"], Value::from("Casey"));
    }

    #[test]
    fn none_category_selects_null_and_blank() {
        let view = TableView::apply(
            personnel(),
            &ViewRequest {
                category_column: Some("ar_military".to_string()),
                category: Some(NONE_CATEGORY.to_string()),
                ..request()
            },
        );
        let ids: Vec<_> = view
            .records()
            .into_iter()
            .map(|record| record["Person_Instance_ID"].clone())
            .collect();
        assert_eq!(ids, vec![Value::from(1043), Value::from(1044)]);
    }

    #[test]
    fn category_values_are_trimmed_before_comparison() {
        let view = TableView::apply(
            personnel(),
            &ViewRequest {
                category_column: Some("Military".to_string()),
                category: Some("Veteran".to_string()),
                ..request()
            },
        );
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn unresolved_category_column_reports_message() {
        let view = TableView::apply(
            personnel(),
            &ViewRequest {
                category_column: Some("Branch".to_string()),
                ..request()
            },
        );
        assert!(view.is_empty());
        assert_eq!(view.message(), Some("Column 'Branch' not found."));
    }

    #[test]
    fn descending_sort_keeps_nulls_last() {
        let view = TableView::apply(
            personnel(),
            &ViewRequest {
                sort: Some("Full_Name".to_string()),
                order: Some(SortOrder::Desc),
                ..request()
            },
        );
        let names: Vec<_> = view
            .records()
            .into_iter()
            .map(|record| record["Full_Name"].clone())
            .collect();
        assert_eq!(
            names,
            vec![
                Value::from("Casey"),
                Value::from("Blake"),
                Value::from("Avery"),
                Value::Null
            ]
        );
    }

    #[test]
    fn filters_without_matches_explain_emptiness() {
        let view = TableView::apply(
            personnel(),
            &ViewRequest {
                key_column: Some("Person_Instance_ID".to_string()),
                key: Some("9".to_string()),
                ..request()
            },
        );
        assert!(view.is_empty());
        assert_eq!(view.message(), Some(NO_MATCHES_MESSAGE));
        assert_eq!(view.total_rows(), 4);
    }

    #[test]
    fn find_column_prefers_exact_match() {
        let columns = vec!["Ar_Military_Code".to_string(), " AR_MILITARY".to_string()];
        assert_eq!(find_column(&columns, "ar_military"), Some(" AR_MILITARY"));
        assert_eq!(find_column(&columns, "code"), Some("Ar_Military_Code"));
        assert_eq!(find_column(&columns, "branch"), None);
    }
}
