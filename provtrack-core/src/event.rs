//! Event model: the canonical form of one observed operation (a node) and
//! one observed dependency (an edge).
//!
//! Everything here is pure data. The only behavior is validation, which the
//! tracker runs before a [`NodeEvent`] becomes a [`TransformNode`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ValidationError;

/// Default upper bound for a literal parameter's serialized size.
pub const DEFAULT_MAX_PARAM_BYTES: usize = 4096;

/// Run-unique node identifier, assigned by the tracker starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle for an in-memory subject, used only for edge inference.
///
/// Handles come from a process-wide counter and are never derived from
/// memory addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectRef(u64);

static NEXT_SUBJECT: AtomicU64 = AtomicU64::new(1);

impl SubjectRef {
    /// Allocate a fresh handle.
    pub fn allocate() -> Self {
        Self(NEXT_SUBJECT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject#{}", self.0)
    }
}

/// Structural descriptor of a subject: one entry per dimension
/// (rows, columns, ...). Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Result<Self, ValidationError> {
        if dims.is_empty() {
            return Err(ValidationError::EmptyShape);
        }
        Ok(Self(dims))
    }

    /// Two-dimensional shape, the common case for tabular subjects.
    pub fn table(rows: usize, columns: usize) -> Self {
        Self(vec![rows, columns])
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rows(&self) -> usize {
        self.0[0]
    }

    pub fn columns(&self) -> Option<usize> {
        self.0.get(1).copied()
    }
}

impl TryFrom<Vec<usize>> for Shape {
    type Error = ValidationError;

    fn try_from(dims: Vec<usize>) -> Result<Self, Self::Error> {
        Shape::new(dims)
    }
}

impl From<Shape> for Vec<usize> {
    fn from(shape: Shape) -> Self {
        shape.0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "({})", dims.join(", "))
    }
}

/// Why a parameter was summarized instead of recorded literally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryReason {
    TooLarge,
    NotSerializable,
    /// The argument is itself a tracked subject (e.g. the right side of a join).
    Subject,
}

/// A captured parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamValue {
    Literal {
        value: serde_json::Value,
    },
    Summary {
        type_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shape: Option<Shape>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<usize>,
        reason: SummaryReason,
    },
}

impl ParamValue {
    /// Capture `value` literally if it serializes within `max_bytes`,
    /// otherwise record a summary of its type and shape.
    pub fn capture<T: Serialize + ?Sized>(value: &T, max_bytes: usize) -> Self {
        let type_name = std::any::type_name::<T>().to_string();
        match serde_json::to_value(value) {
            Ok(json) => {
                let size = serde_json::to_string(&json).map(|s| s.len()).unwrap_or(0);
                if size > max_bytes {
                    ParamValue::Summary {
                        type_name,
                        shape: json_shape(&json),
                        size_bytes: Some(size),
                        reason: SummaryReason::TooLarge,
                    }
                } else {
                    ParamValue::Literal { value: json }
                }
            }
            Err(_) => ParamValue::Summary {
                type_name,
                shape: None,
                size_bytes: None,
                reason: SummaryReason::NotSerializable,
            },
        }
    }

    /// Summary for a value that has no serializable form at all
    /// (closures, handles, predicates).
    pub fn opaque<T: ?Sized>() -> Self {
        ParamValue::Summary {
            type_name: std::any::type_name::<T>().to_string(),
            shape: None,
            size_bytes: None,
            reason: SummaryReason::NotSerializable,
        }
    }

    /// Summary for a subject passed as an argument.
    pub fn subject(type_name: impl Into<String>, shape: Option<Shape>) -> Self {
        ParamValue::Summary {
            type_name: type_name.into(),
            shape,
            size_bytes: None,
            reason: SummaryReason::Subject,
        }
    }

    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        ParamValue::Literal {
            value: value.into(),
        }
    }

    pub fn is_summary(&self) -> bool {
        matches!(self, ParamValue::Summary { .. })
    }
}

/// Shape of a JSON value when it is a list or a map.
fn json_shape(value: &serde_json::Value) -> Option<Shape> {
    match value {
        serde_json::Value::Array(items) => {
            let inner = items.first().and_then(|first| match first {
                serde_json::Value::Array(row) => Some(row.len()),
                _ => None,
            });
            match inner {
                Some(cols) => Some(Shape::table(items.len(), cols)),
                None => Some(Shape(vec![items.len()])),
            }
        }
        serde_json::Value::Object(map) => Some(Shape(vec![map.len()])),
        _ => None,
    }
}

/// Mapping of argument name to captured value, ordered by name.
pub type Params = BTreeMap<String, ParamValue>;

/// An observed operation before the tracker assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub operation: String,
    pub params: Params,
    pub input_shape: Option<Shape>,
    pub output_shape: Option<Shape>,
    pub subject_ref: Option<SubjectRef>,
}

impl NodeEvent {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: Params::new(),
            input_shape: None,
            output_shape: None,
            subject_ref: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    pub fn input_shape(mut self, shape: Option<Shape>) -> Self {
        self.input_shape = shape;
        self
    }

    pub fn output_shape(mut self, shape: Option<Shape>) -> Self {
        self.output_shape = shape;
        self
    }

    pub fn subject(mut self, subject: SubjectRef) -> Self {
        self.subject_ref = Some(subject);
        self
    }

    /// Check required fields. Shapes are well-formed by construction.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.operation.trim().is_empty() {
            return Err(ValidationError::EmptyOperation);
        }
        if self.operation.chars().any(char::is_control) {
            return Err(ValidationError::InvalidOperation {
                operation: self.operation.clone(),
            });
        }
        for (name, value) in &self.params {
            if name.trim().is_empty() {
                return Err(ValidationError::EmptyParamName {
                    operation: self.operation.clone(),
                });
            }
            if let ParamValue::Summary { type_name, .. } = value {
                if type_name.trim().is_empty() {
                    return Err(ValidationError::EmptySummary { name: name.clone() });
                }
            }
        }
        Ok(())
    }

    /// Freeze into a node. Only the tracker calls this.
    pub(crate) fn into_node(self, id: NodeId, timestamp: DateTime<Utc>) -> TransformNode {
        TransformNode {
            id,
            operation: self.operation,
            params: self.params,
            input_shape: self.input_shape,
            output_shape: self.output_shape,
            timestamp,
            subject_ref: self.subject_ref,
        }
    }
}

/// One recorded operation. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformNode {
    pub id: NodeId,
    pub operation: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_shape: Option<Shape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_shape: Option<Shape>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub subject_ref: Option<SubjectRef>,
}

impl PartialEq for TransformNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TransformNode {}

impl Hash for TransformNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// "`to`'s input was produced by `from`'s output."
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransformEdge {
    pub from: NodeId,
    pub to: NodeId,
}

impl TransformEdge {
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for TransformEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shape_rejects_empty() {
        assert_eq!(Shape::new(vec![]), Err(ValidationError::EmptyShape));
        let shape = Shape::new(vec![10, 3]).unwrap();
        assert_eq!(shape.rows(), 10);
        assert_eq!(shape.columns(), Some(3));
        assert_eq!(shape.to_string(), "(10, 3)");
    }

    #[test]
    fn test_shape_deserialize_validates() {
        let ok: Shape = serde_json::from_str("[4, 2]").unwrap();
        assert_eq!(ok, Shape::table(4, 2));
        assert!(serde_json::from_str::<Shape>("[]").is_err());
    }

    #[test]
    fn test_capture_literal() {
        let value = ParamValue::capture(&vec!["a", "b"], DEFAULT_MAX_PARAM_BYTES);
        assert_eq!(value, ParamValue::literal(serde_json::json!(["a", "b"])));
    }

    #[test]
    fn test_capture_too_large_is_summarized() {
        let rows: Vec<Vec<u32>> = (0..100).map(|i| vec![i, i + 1, i + 2]).collect();
        let value = ParamValue::capture(&rows, 64);
        match value {
            ParamValue::Summary {
                shape,
                size_bytes,
                reason,
                type_name,
            } => {
                assert_eq!(reason, SummaryReason::TooLarge);
                assert_eq!(shape, Some(Shape::table(100, 3)));
                assert!(size_bytes.unwrap() > 64);
                assert!(type_name.contains("Vec"));
            }
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[test]
    fn test_capture_not_serializable_is_summarized() {
        // Maps with non-string keys fail JSON serialization.
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], 2u8);
        let value = ParamValue::capture(&map, DEFAULT_MAX_PARAM_BYTES);
        assert!(matches!(
            value,
            ParamValue::Summary {
                reason: SummaryReason::NotSerializable,
                ..
            }
        ));
    }

    #[test]
    fn test_validate_event() {
        assert_eq!(
            NodeEvent::new("").validate(),
            Err(ValidationError::EmptyOperation)
        );
        assert!(matches!(
            NodeEvent::new("drop\ncolumn").validate(),
            Err(ValidationError::InvalidOperation { .. })
        ));
        assert!(matches!(
            NodeEvent::new("fill_null")
                .param("", ParamValue::literal(0))
                .validate(),
            Err(ValidationError::EmptyParamName { .. })
        ));
        assert!(
            NodeEvent::new("fill_null")
                .param("value", ParamValue::literal(0))
                .output_shape(Some(Shape::table(2, 1)))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_node_identity_equality() {
        let now = Utc::now();
        let a = NodeEvent::new("head").into_node(NodeId(1), now);
        let b = NodeEvent::new("tail").into_node(NodeId(1), now);
        let c = NodeEvent::new("head").into_node(NodeId(2), now);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<TransformNode> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_subject_ref_not_serialized() {
        let node = NodeEvent::new("head")
            .subject(SubjectRef::allocate())
            .into_node(NodeId(1), Utc::now());
        let json = serde_json::to_value(&node).unwrap();
        assert!(json.get("subject_ref").is_none());
        let back: TransformNode = serde_json::from_value(json).unwrap();
        assert!(back.subject_ref.is_none());
    }

    #[test]
    fn test_subject_refs_are_unique() {
        let a = SubjectRef::allocate();
        let b = SubjectRef::allocate();
        assert_ne!(a, b);
    }
}
