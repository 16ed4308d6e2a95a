//! Interceptor: turns operations on subjects into node events.
//!
//! A subject library declares which operations are observable through an
//! [`OperationVocabulary`] and exposes structure through [`Shaped`]. Subjects
//! are wrapped in [`Traced`]; every observable call made through the wrapper
//! runs the real operation, then emits one node whose inbound edge comes
//! from the subject's previous node.
//!
//! Lineage between subjects is kept in a table keyed by [`SubjectRef`]. An
//! entry lives exactly as long as its `Traced` wrapper.
//!
//! ## Failure rules
//!
//! - A failing operation returns its error unchanged and emits nothing.
//! - A failing emission (no tracker, tracker stopped, invalid event) is
//!   logged and dropped. The caller still gets the operation's result and
//!   the lineage table is not touched.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use crate::config::CaptureConfig;
use crate::error::TrackError;
use crate::event::{NodeEvent, ParamValue, Params, Shape, SubjectRef};
use crate::global;
use crate::tracker::{GraphRecorder, NodeRef};

/// Structural descriptor exposed by a subject library.
pub trait Shaped {
    fn shape(&self) -> Option<Shape>;
}

impl<T> Shaped for Vec<T> {
    fn shape(&self) -> Option<Shape> {
        Shape::new(vec![self.len()]).ok()
    }
}

/// The set of operation names a subject library declares observable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationVocabulary {
    names: BTreeSet<String>,
}

impl OperationVocabulary {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.names.contains(operation)
    }

    pub fn insert(&mut self, operation: impl Into<String>) -> bool {
        self.names.insert(operation.into())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for OperationVocabulary {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[derive(Clone)]
enum RecorderSource {
    Fixed(Arc<dyn GraphRecorder>),
    Global,
}

type LineageTable = Arc<Mutex<HashMap<SubjectRef, NodeRef>>>;

/// Emits node events for operations on [`Traced`] subjects.
///
/// Clones share the same recorder and lineage table.
#[derive(Clone)]
pub struct Interceptor {
    recorder: RecorderSource,
    vocabulary: Arc<OperationVocabulary>,
    capture: CaptureConfig,
    lineage: LineageTable,
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recorder = match self.recorder {
            RecorderSource::Fixed(_) => "fixed",
            RecorderSource::Global => "global",
        };
        f.debug_struct("Interceptor")
            .field("recorder", &recorder)
            .field("vocabulary", &self.vocabulary.len())
            .field("capture", &self.capture)
            .field("tracked_subjects", &self.tracked_subjects())
            .finish()
    }
}

impl Interceptor {
    /// Interceptor that records into `recorder`.
    pub fn new(recorder: Arc<dyn GraphRecorder>, vocabulary: OperationVocabulary) -> Self {
        Self::with_source(RecorderSource::Fixed(recorder), vocabulary)
    }

    /// Interceptor that records into whatever tracker is installed in
    /// [`global`] at the time of each call.
    pub fn global(vocabulary: OperationVocabulary) -> Self {
        Self::with_source(RecorderSource::Global, vocabulary)
    }

    fn with_source(recorder: RecorderSource, vocabulary: OperationVocabulary) -> Self {
        Self {
            recorder,
            vocabulary: Arc::new(vocabulary),
            capture: CaptureConfig::default(),
            lineage: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    pub fn vocabulary(&self) -> &OperationVocabulary {
        &self.vocabulary
    }

    /// Capture an argument under this interceptor's size limit.
    pub fn param<T: Serialize + ?Sized>(&self, value: &T) -> ParamValue {
        ParamValue::capture(value, self.capture.max_param_bytes)
    }

    /// Number of live subjects with a recorded node.
    pub fn tracked_subjects(&self) -> usize {
        self.table().len()
    }

    /// Register a subject without emitting a node.
    pub fn wrap<S>(&self, subject: S) -> Traced<S> {
        Traced {
            inner: subject,
            registration: Registration {
                subject: SubjectRef::allocate(),
                lineage: self.lineage.clone(),
            },
            interceptor: self.clone(),
        }
    }

    /// Produce a subject from nothing (a load, a constructor) and record it
    /// as a root node.
    pub fn source<S, E>(
        &self,
        operation: &str,
        params: Params,
        f: impl FnOnce() -> Result<S, E>,
    ) -> Result<Traced<S>, E>
    where
        S: Shaped,
    {
        let traced = self.wrap(f()?);
        if self.vocabulary.contains(operation) {
            let event = NodeEvent::new(operation)
                .params(params)
                .output_shape(traced.inner.shape())
                .subject(traced.subject_ref());
            self.emit_and_link(traced.subject_ref(), event, &[]);
        }
        Ok(traced)
    }

    fn recorder(&self) -> Option<Arc<dyn GraphRecorder>> {
        match &self.recorder {
            RecorderSource::Fixed(recorder) => Some(recorder.clone()),
            RecorderSource::Global => {
                global::tracker().map(|t| t as Arc<dyn GraphRecorder>)
            }
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<SubjectRef, NodeRef>> {
        self.lineage.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn last_node(&self, subject: SubjectRef) -> Option<NodeRef> {
        self.table().get(&subject).copied()
    }

    fn link(&self, subject: SubjectRef, node: NodeRef) {
        self.table().insert(subject, node);
    }

    /// Record `event` with inbound edges from `parents`; on success point
    /// `subject` at the new node.
    fn emit_and_link(&self, subject: SubjectRef, event: NodeEvent, parents: &[NodeRef]) {
        let Some(recorder) = self.recorder() else {
            tracing::debug!(operation = %event.operation, "No tracker installed; event dropped");
            return;
        };

        let operation = event.operation.clone();
        match recorder.record_derived(event, parents) {
            Ok(node) => self.link(subject, node),
            Err(TrackError::NotStarted) => {
                tracing::debug!(%operation, "Tracker not started; event dropped");
            }
            Err(err) => {
                tracing::warn!(%operation, error = %err, "Dropped lineage event");
            }
        }
    }
}

/// Removes the subject's lineage entry when the wrapper goes away.
struct Registration {
    subject: SubjectRef,
    lineage: LineageTable,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.lineage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.subject);
    }
}

/// A subject registered with an [`Interceptor`].
///
/// Reads go through `Deref`; observable operations go through
/// [`observe`](Traced::observe), [`derive`](Traced::derive) and
/// [`combine`](Traced::combine).
pub struct Traced<S> {
    inner: S,
    registration: Registration,
    interceptor: Interceptor,
}

impl<S> Traced<S> {
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Unwrap the subject. Its lineage entry is released.
    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn subject_ref(&self) -> SubjectRef {
        self.registration.subject
    }

    /// The node most recently recorded for this subject.
    pub fn last_node(&self) -> Option<NodeRef> {
        self.interceptor.last_node(self.subject_ref())
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    fn predecessors(&self) -> Vec<NodeRef> {
        self.last_node().into_iter().collect()
    }
}

impl<S: Shaped> Traced<S> {
    /// Run an in-place operation on the subject.
    ///
    /// The new node's parent is the subject's previous node, and the subject
    /// then points at the new node (same-subject chaining).
    pub fn observe<R, E>(
        &mut self,
        operation: &str,
        params: Params,
        f: impl FnOnce(&mut S) -> Result<R, E>,
    ) -> Result<R, E> {
        if !self.interceptor.vocabulary.contains(operation) {
            return f(&mut self.inner);
        }

        let input_shape = self.inner.shape();
        let result = f(&mut self.inner)?;
        let event = NodeEvent::new(operation)
            .params(params)
            .input_shape(input_shape)
            .output_shape(self.inner.shape())
            .subject(self.subject_ref());
        let parents = self.predecessors();
        self.interceptor
            .emit_and_link(self.subject_ref(), event, &parents);
        Ok(result)
    }

    /// Run an operation that returns a new subject.
    ///
    /// Unobservable operations emit nothing; the result then inherits this
    /// subject's last node so later observable calls stay connected.
    pub fn derive<T, E>(
        &self,
        operation: &str,
        params: Params,
        f: impl FnOnce(&S) -> Result<T, E>,
    ) -> Result<Traced<T>, E>
    where
        T: Shaped,
    {
        let output = self.interceptor.wrap(f(&self.inner)?);
        let parents = self.predecessors();

        if self.interceptor.vocabulary.contains(operation) {
            let event = NodeEvent::new(operation)
                .params(params)
                .input_shape(self.inner.shape())
                .output_shape(output.inner.shape())
                .subject(output.subject_ref());
            self.interceptor
                .emit_and_link(output.subject_ref(), event, &parents);
        } else if let Some(last) = parents.first() {
            self.interceptor.link(output.subject_ref(), *last);
        }
        Ok(output)
    }

    /// Run an operation over this subject and `other` that returns a new
    /// subject, with one inbound edge per distinct predecessor.
    ///
    /// `other` is recorded as a summary parameter named `other` unless the
    /// caller already supplied that key.
    pub fn combine<O, T, E>(
        &self,
        other: &Traced<O>,
        operation: &str,
        params: Params,
        f: impl FnOnce(&S, &O) -> Result<T, E>,
    ) -> Result<Traced<T>, E>
    where
        O: Shaped,
        T: Shaped,
    {
        let output = self.interceptor.wrap(f(&self.inner, &other.inner)?);
        if !self.interceptor.vocabulary.contains(operation) {
            return Ok(output);
        }

        let mut params = params;
        params
            .entry("other".to_string())
            .or_insert_with(|| ParamValue::subject(std::any::type_name::<O>(), other.shape()));

        let mut parents = self.predecessors();
        parents.extend(other.last_node());

        let event = NodeEvent::new(operation)
            .params(params)
            .input_shape(self.inner.shape())
            .output_shape(output.inner.shape())
            .subject(output.subject_ref());
        self.interceptor
            .emit_and_link(output.subject_ref(), event, &parents);
        Ok(output)
    }
}

impl<S> Deref for Traced<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.inner
    }
}

impl<S: Shaped> Shaped for Traced<S> {
    fn shape(&self) -> Option<Shape> {
        self.inner.shape()
    }
}

/// A clone is a new subject that shares the original's lineage.
impl<S: Clone> Clone for Traced<S> {
    fn clone(&self) -> Self {
        let copy = self.interceptor.wrap(self.inner.clone());
        if let Some(last) = self.last_node() {
            self.interceptor.link(copy.subject_ref(), last);
        }
        copy
    }
}

impl<S: fmt::Debug> fmt::Debug for Traced<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Traced")
            .field("subject", &self.subject_ref())
            .field("last_node", &self.last_node())
            .field("inner", &self.inner)
            .finish()
    }
}
