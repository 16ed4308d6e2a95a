//! Reference subject library: a small column-oriented table.
//!
//! [`Frame`] is deliberately plain (column names plus rows of JSON values)
//! so the interceptor has a realistic subject to observe. [`FrameOps`] is
//! implemented both for `Frame` itself and for `Traced<Frame>`; the traced
//! implementation delegates to the plain one and records a node per call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::event::{ParamValue, Params, Shape};
use crate::intercept::{Interceptor, OperationVocabulary, Shaped, Traced};

/// Operations on [`Frame`] that the interceptor records.
pub const FRAME_OPERATIONS: &[&str] = &[
    "read_csv",
    "from_rows",
    "select",
    "drop_column",
    "rename_column",
    "fill_null",
    "filter_eq",
    "sort_by",
    "deduplicate",
    "head",
    "merge",
    "concat",
    "insert_column",
];

/// Vocabulary built from [`FRAME_OPERATIONS`].
pub fn frame_vocabulary() -> OperationVocabulary {
    FRAME_OPERATIONS.iter().copied().collect()
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown column: {column}")]
    UnknownColumn { column: String },

    #[error("column already exists: {column}")]
    DuplicateColumn { column: String },

    #[error("row {row} has {found} values, expected {expected}")]
    RowLength {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("column mismatch: expected {expected:?}, found {found:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("CSV parse error: {message}")]
    Parse { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A table of JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    /// Build a frame, checking that every row has one value per column.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, FrameError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(FrameError::DuplicateColumn {
                    column: column.clone(),
                });
            }
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(FrameError::RowLength {
                    row: i,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    /// Parse CSV text: header line, comma-separated, no embedded commas.
    ///
    /// Empty cells become `null`; numbers and booleans are parsed.
    pub fn from_csv_str(content: &str) -> Result<Self, FrameError> {
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let columns: Vec<String> = lines
            .next()
            .ok_or_else(|| FrameError::Parse {
                message: "missing header line".to_string(),
            })?
            .split(',')
            .map(|s| s.trim().trim_matches('"').to_string())
            .collect();

        let rows = lines
            .map(|line| line.split(',').map(parse_cell).collect())
            .collect();
        Self::new(columns, rows)
    }

    pub fn read_csv(path: &Path) -> Result<Self, FrameError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_csv_str(&content)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Values of one column, top to bottom.
    pub fn column(&self, name: &str) -> Result<Vec<&Value>, FrameError> {
        let idx = self.index_of(name)?;
        Ok(self.rows.iter().map(|r| &r[idx]).collect())
    }

    fn index_of(&self, column: &str) -> Result<usize, FrameError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| FrameError::UnknownColumn {
                column: column.to_string(),
            })
    }
}

fn parse_cell(raw: &str) -> Value {
    let cell = raw.trim().trim_matches('"');
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        return Value::from(f);
    }
    match cell {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

/// Total order over JSON cells: numbers, then strings, then booleans, with
/// nulls last.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Number(_) => 0,
            Value::String(_) => 1,
            Value::Bool(_) => 2,
            Value::Array(_) | Value::Object(_) => 3,
            Value::Null => 4,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

impl Shaped for Frame {
    fn shape(&self) -> Option<Shape> {
        Some(Shape::table(self.rows.len(), self.columns.len()))
    }
}

/// Table operations shared by plain and traced frames.
pub trait FrameOps: Sized {
    /// Keep only `columns`, in the given order.
    fn select(&self, columns: &[&str]) -> Result<Self, FrameError>;

    fn drop_column(&self, column: &str) -> Result<Self, FrameError>;

    fn rename_column(&self, from: &str, to: &str) -> Result<Self, FrameError>;

    /// Replace nulls in `column` with `value`.
    fn fill_null(&self, column: &str, value: Value) -> Result<Self, FrameError>;

    /// Keep rows whose `column` equals `value`.
    fn filter_eq(&self, column: &str, value: &Value) -> Result<Self, FrameError>;

    /// Stable sort on one column; nulls sort last when ascending.
    fn sort_by(&self, column: &str, ascending: bool) -> Result<Self, FrameError>;

    /// Drop repeated rows, keeping the first occurrence.
    fn deduplicate(&self) -> Result<Self, FrameError>;

    fn head(&self, n: usize) -> Result<Self, FrameError>;

    /// Inner join on `on`. Right-side columns that clash with left-side
    /// names get a `_right` suffix.
    fn merge(&self, other: &Self, on: &str) -> Result<Self, FrameError>;

    /// Append `other`'s rows. Columns must match exactly.
    fn concat(&self, other: &Self) -> Result<Self, FrameError>;

    /// Add a column holding `value` in every row, in place.
    fn insert_column(&mut self, name: &str, value: Value) -> Result<(), FrameError>;
}

impl FrameOps for Frame {
    fn select(&self, columns: &[&str]) -> Result<Self, FrameError> {
        let indices = columns
            .iter()
            .map(|c| self.index_of(c))
            .collect::<Result<Vec<_>, _>>()?;
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Frame::new(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    fn drop_column(&self, column: &str) -> Result<Self, FrameError> {
        let idx = self.index_of(column)?;
        let mut out = self.clone();
        out.columns.remove(idx);
        for row in &mut out.rows {
            row.remove(idx);
        }
        Ok(out)
    }

    fn rename_column(&self, from: &str, to: &str) -> Result<Self, FrameError> {
        let idx = self.index_of(from)?;
        if from != to && self.columns.iter().any(|c| c == to) {
            return Err(FrameError::DuplicateColumn {
                column: to.to_string(),
            });
        }
        let mut out = self.clone();
        out.columns[idx] = to.to_string();
        Ok(out)
    }

    fn fill_null(&self, column: &str, value: Value) -> Result<Self, FrameError> {
        let idx = self.index_of(column)?;
        let mut out = self.clone();
        for row in &mut out.rows {
            if row[idx].is_null() {
                row[idx] = value.clone();
            }
        }
        Ok(out)
    }

    fn filter_eq(&self, column: &str, value: &Value) -> Result<Self, FrameError> {
        let idx = self.index_of(column)?;
        Ok(Frame {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| &row[idx] == value)
                .cloned()
                .collect(),
        })
    }

    fn sort_by(&self, column: &str, ascending: bool) -> Result<Self, FrameError> {
        let idx = self.index_of(column)?;
        let mut out = self.clone();
        out.rows.sort_by(|a, b| {
            let ord = compare_values(&a[idx], &b[idx]);
            if ascending { ord } else { ord.reverse() }
        });
        Ok(out)
    }

    fn deduplicate(&self) -> Result<Self, FrameError> {
        let mut seen = HashSet::new();
        let mut out = self.clone();
        out.rows.retain(|row| seen.insert(Value::Array(row.clone()).to_string()));
        Ok(out)
    }

    fn head(&self, n: usize) -> Result<Self, FrameError> {
        Ok(Frame {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        })
    }

    fn merge(&self, other: &Self, on: &str) -> Result<Self, FrameError> {
        let left_key = self.index_of(on)?;
        let right_key = other.index_of(on)?;

        let mut columns = self.columns.clone();
        let mut right_indices = Vec::new();
        for (i, name) in other.columns.iter().enumerate() {
            if i == right_key {
                continue;
            }
            right_indices.push(i);
            if columns.contains(name) {
                columns.push(format!("{name}_right"));
            } else {
                columns.push(name.clone());
            }
        }

        let mut by_key: HashMap<String, Vec<&Vec<Value>>> = HashMap::new();
        for row in &other.rows {
            if !row[right_key].is_null() {
                by_key.entry(row[right_key].to_string()).or_default().push(row);
            }
        }

        let mut rows = Vec::new();
        for left in &self.rows {
            if left[left_key].is_null() {
                continue;
            }
            if let Some(matches) = by_key.get(&left[left_key].to_string()) {
                for right in matches {
                    let mut row = left.clone();
                    row.extend(right_indices.iter().map(|&i| right[i].clone()));
                    rows.push(row);
                }
            }
        }
        Frame::new(columns, rows)
    }

    fn concat(&self, other: &Self) -> Result<Self, FrameError> {
        if self.columns != other.columns {
            return Err(FrameError::ColumnMismatch {
                expected: self.columns.clone(),
                found: other.columns.clone(),
            });
        }
        let mut out = self.clone();
        out.rows.extend(other.rows.iter().cloned());
        Ok(out)
    }

    fn insert_column(&mut self, name: &str, value: Value) -> Result<(), FrameError> {
        if self.columns.iter().any(|c| c == name) {
            return Err(FrameError::DuplicateColumn {
                column: name.to_string(),
            });
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(value.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Traced frames
// ---------------------------------------------------------------------------

fn params<const N: usize>(entries: [(&str, ParamValue); N]) -> Params {
    entries
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Load a CSV file as a traced root subject.
pub fn read_csv(interceptor: &Interceptor, path: &Path) -> Result<Traced<Frame>, FrameError> {
    let p = params([("path", interceptor.param(&path.display().to_string()))]);
    interceptor.source("read_csv", p, || Frame::read_csv(path))
}

/// Build a frame from rows as a traced root subject.
pub fn from_rows(
    interceptor: &Interceptor,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
) -> Result<Traced<Frame>, FrameError> {
    let p = params([("columns", interceptor.param(&columns))]);
    interceptor.source("from_rows", p, || Frame::new(columns, rows))
}

impl FrameOps for Traced<Frame> {
    fn select(&self, columns: &[&str]) -> Result<Self, FrameError> {
        let p = params([("columns", self.interceptor().param(columns))]);
        self.derive("select", p, |f| f.select(columns))
    }

    fn drop_column(&self, column: &str) -> Result<Self, FrameError> {
        let p = params([("column", self.interceptor().param(column))]);
        self.derive("drop_column", p, |f| f.drop_column(column))
    }

    fn rename_column(&self, from: &str, to: &str) -> Result<Self, FrameError> {
        let p = params([
            ("from", self.interceptor().param(from)),
            ("to", self.interceptor().param(to)),
        ]);
        self.derive("rename_column", p, |f| f.rename_column(from, to))
    }

    fn fill_null(&self, column: &str, value: Value) -> Result<Self, FrameError> {
        let p = params([
            ("column", self.interceptor().param(column)),
            ("value", self.interceptor().param(&value)),
        ]);
        self.derive("fill_null", p, |f| f.fill_null(column, value))
    }

    fn filter_eq(&self, column: &str, value: &Value) -> Result<Self, FrameError> {
        let p = params([
            ("column", self.interceptor().param(column)),
            ("value", self.interceptor().param(value)),
        ]);
        self.derive("filter_eq", p, |f| f.filter_eq(column, value))
    }

    fn sort_by(&self, column: &str, ascending: bool) -> Result<Self, FrameError> {
        let p = params([
            ("column", self.interceptor().param(column)),
            ("ascending", ParamValue::literal(ascending)),
        ]);
        self.derive("sort_by", p, |f| f.sort_by(column, ascending))
    }

    fn deduplicate(&self) -> Result<Self, FrameError> {
        self.derive("deduplicate", Params::new(), |f| f.deduplicate())
    }

    fn head(&self, n: usize) -> Result<Self, FrameError> {
        let p = params([("n", ParamValue::literal(n))]);
        self.derive("head", p, |f| f.head(n))
    }

    fn merge(&self, other: &Self, on: &str) -> Result<Self, FrameError> {
        let p = params([("on", self.interceptor().param(on))]);
        self.combine(other, "merge", p, |left, right| left.merge(right, on))
    }

    fn concat(&self, other: &Self) -> Result<Self, FrameError> {
        self.combine(other, "concat", Params::new(), |top, bottom| top.concat(bottom))
    }

    fn insert_column(&mut self, name: &str, value: Value) -> Result<(), FrameError> {
        let p = params([
            ("name", self.interceptor().param(name)),
            ("value", self.interceptor().param(&value)),
        ]);
        self.observe("insert_column", p, |f| f.insert_column(name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> Frame {
        Frame::new(
            vec!["id".into(), "name".into(), "age".into()],
            vec![
                vec![json!(1), json!("ada"), json!(36)],
                vec![json!(2), json!("bob"), Value::Null],
                vec![json!(3), json!("cy"), json!(29)],
                vec![json!(2), json!("bob"), Value::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let err = Frame::new(vec!["a".into()], vec![vec![json!(1), json!(2)]]).unwrap_err();
        assert!(matches!(err, FrameError::RowLength { row: 0, expected: 1, found: 2 }));
        assert!(matches!(
            Frame::new(vec!["a".into(), "a".into()], vec![]),
            Err(FrameError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_from_csv_str() {
        let frame = Frame::from_csv_str("id,name,score\n1,ada,9.5\n2,,true\n").unwrap();
        assert_eq!(frame.columns(), &["id", "name", "score"]);
        assert_eq!(frame.rows()[0], vec![json!(1), json!("ada"), json!(9.5)]);
        assert_eq!(frame.rows()[1], vec![json!(2), Value::Null, json!(true)]);
        assert_eq!(frame.shape(), Some(Shape::table(2, 3)));
        assert!(matches!(Frame::from_csv_str(""), Err(FrameError::Parse { .. })));
    }

    #[test]
    fn test_select_drop_rename() {
        let frame = people();
        let selected = frame.select(&["age", "id"]).unwrap();
        assert_eq!(selected.columns(), &["age", "id"]);
        assert_eq!(selected.rows()[0], vec![json!(36), json!(1)]);

        let dropped = frame.drop_column("name").unwrap();
        assert_eq!(dropped.column_count(), 2);

        let renamed = frame.rename_column("name", "first_name").unwrap();
        assert_eq!(renamed.columns()[1], "first_name");
        assert!(matches!(
            frame.rename_column("name", "age"),
            Err(FrameError::DuplicateColumn { .. })
        ));
        assert!(matches!(
            frame.select(&["missing"]),
            Err(FrameError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_fill_filter_sort_dedup_head() {
        let frame = people();
        let filled = frame.fill_null("age", json!(0)).unwrap();
        assert_eq!(filled.rows()[1][2], json!(0));

        let bobs = frame.filter_eq("name", &json!("bob")).unwrap();
        assert_eq!(bobs.row_count(), 2);

        let sorted = frame.sort_by("age", true).unwrap();
        let ages: Vec<&Value> = sorted.column("age").unwrap();
        assert_eq!(ages, vec![&json!(29), &json!(36), &Value::Null, &Value::Null]);

        let desc = frame.sort_by("id", false).unwrap();
        assert_eq!(desc.rows()[0][0], json!(3));

        assert_eq!(frame.deduplicate().unwrap().row_count(), 3);
        assert_eq!(frame.head(2).unwrap().row_count(), 2);
        assert_eq!(frame.head(10).unwrap().row_count(), 4);
    }

    #[test]
    fn test_merge_and_concat() {
        let frame = people().deduplicate().unwrap();
        let scores = Frame::new(
            vec!["id".into(), "name".into(), "score".into()],
            vec![
                vec![json!(1), json!("A"), json!(90)],
                vec![json!(3), json!("C"), json!(70)],
                vec![json!(9), json!("Z"), json!(10)],
            ],
        )
        .unwrap();

        let merged = frame.merge(&scores, "id").unwrap();
        assert_eq!(merged.columns(), &["id", "name", "age", "name_right", "score"]);
        assert_eq!(merged.row_count(), 2);
        assert_eq!(merged.rows()[1][4], json!(70));

        let doubled = frame.concat(&frame).unwrap();
        assert_eq!(doubled.row_count(), 6);
        assert!(matches!(
            frame.concat(&scores),
            Err(FrameError::ColumnMismatch { .. })
        ));
    }

    #[test]
    fn test_insert_column_in_place() {
        let mut frame = people();
        frame.insert_column("source", json!("crm")).unwrap();
        assert_eq!(frame.column_count(), 4);
        assert_eq!(frame.rows()[3][3], json!("crm"));
        assert!(frame.insert_column("source", json!(1)).is_err());
    }

    #[test]
    fn test_vocabulary_covers_operations() {
        let vocab = frame_vocabulary();
        assert_eq!(vocab.len(), FRAME_OPERATIONS.len());
        assert!(vocab.contains("merge"));
        assert!(!vocab.contains("plot"));
    }
}
