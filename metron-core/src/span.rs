//! Span Trees
//!
//! An in-memory tree of timed, annotated spans representing one
//! transaction's execution. Span handles stay valid across threads; the
//! tree guards its state with a mutex so pool workers can report into a
//! parent request's trace.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Scalar value accepted for annotations and custom variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// String
    String(String),
}

impl Scalar {
    /// Convert a JSON value, rejecting arrays and objects
    pub fn from_json(value: &serde_json::Value) -> Option<Scalar> {
        match value {
            serde_json::Value::Null => Some(Scalar::Null),
            serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Scalar::Int(i))
                } else {
                    n.as_f64().map(Scalar::Float)
                }
            }
            serde_json::Value::String(s) => Some(Scalar::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<i32> for Scalar {
    fn from(i: i32) -> Self {
        Scalar::Int(i as i64)
    }
}

impl From<u64> for Scalar {
    fn from(i: u64) -> Self {
        Scalar::Int(i as i64)
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// One span in serialized form, children nested in call order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanData {
    /// Random non-zero span id
    pub id: u64,
    /// Span category, e.g. "sql" or "http"
    pub category: String,
    /// Timer start in microseconds since transaction start
    pub start_us: Option<u64>,
    /// Elapsed microseconds between first start and first stop
    pub duration_us: Option<u64>,
    /// Merged annotations
    pub annotations: BTreeMap<String, Scalar>,
    /// Child spans in insertion order
    pub children: Vec<SpanData>,
}

/// Generate a random non-zero span id (0 is reserved for the null span)
fn random_span_id() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

struct SpanNode {
    id: u64,
    category: String,
    start_us: Option<u64>,
    stop_us: Option<u64>,
    annotations: BTreeMap<String, Scalar>,
    children: Vec<usize>,
}

impl SpanNode {
    fn new(id: u64, category: &str) -> Self {
        Self {
            id,
            category: category.to_string(),
            start_us: None,
            stop_us: None,
            annotations: BTreeMap::new(),
            children: Vec::new(),
        }
    }
}

struct TreeState {
    anchor: Instant,
    nodes: Vec<SpanNode>,
    // Active span stack of node indices; the root sits at the bottom.
    active: Vec<usize>,
}

impl TreeState {
    fn now_us(&self) -> u64 {
        self.anchor.elapsed().as_micros() as u64
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    fn attach(&mut self, category: &str, parent: usize) -> u64 {
        let id = random_span_id();
        let index = self.nodes.len();
        self.nodes.push(SpanNode::new(id, category));
        self.nodes[parent].children.push(index);
        self.active.push(index);
        id
    }
}

/// The span tree of one traced transaction
#[derive(Clone)]
pub struct SpanTree {
    inner: Arc<Mutex<TreeState>>,
}

impl SpanTree {
    /// Create a tree with a started root span of the given category
    pub fn new(root_category: &str) -> Self {
        let anchor = Instant::now();
        let mut root = SpanNode::new(random_span_id(), root_category);
        root.start_us = Some(0);

        Self {
            inner: Arc::new(Mutex::new(TreeState {
                anchor,
                nodes: vec![root],
                active: vec![0],
            })),
        }
    }

    // A poisoned lock still holds usable state; the profiler must never
    // panic on the tracing path.
    fn lock(&self) -> MutexGuard<'_, TreeState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocate a span as the last child of the currently active span
    pub fn create_span(&self, category: &str) -> Span {
        let mut state = self.lock();

        let parent = match state.active.last() {
            Some(&top) => top,
            None => {
                tracing::warn!(category, "no active span, attaching to root");
                0
            }
        };
        let id = state.attach(category, parent);

        Span::recording(id, self.clone())
    }

    /// Allocate a span as the last child of the span with the given id
    pub fn create_span_under(&self, parent_id: u64, category: &str) -> Span {
        let mut state = self.lock();

        let parent = match state.index_of(parent_id) {
            Some(index) => index,
            None => {
                tracing::warn!(parent_id, category, "unknown parent span, attaching to root");
                0
            }
        };
        let id = state.attach(category, parent);

        Span::recording(id, self.clone())
    }

    /// Record the timer start for a span; only the first start takes effect
    pub fn start_timer(&self, id: u64) {
        let mut state = self.lock();
        let now = state.now_us();

        if let Some(index) = state.index_of(id) {
            let node = &mut state.nodes[index];
            if node.start_us.is_none() {
                node.start_us = Some(now);
            }
        }
    }

    /// Record the timer stop for a span and pop it from the active stack.
    ///
    /// Only the first stop after a start takes effect. Stopping a span that
    /// is not the stack top pops every entry above it as well; this is a
    /// usage error tolerated with a warning.
    pub fn stop_timer(&self, id: u64) {
        let mut state = self.lock();
        let now = state.now_us();

        let Some(index) = state.index_of(id) else {
            return;
        };

        {
            let node = &mut state.nodes[index];
            if node.start_us.is_some() && node.stop_us.is_none() {
                node.stop_us = Some(now);
            }
        }

        if let Some(pos) = state.active.iter().position(|&i| i == index) {
            if pos + 1 != state.active.len() {
                tracing::warn!(
                    span_id = id,
                    popped = state.active.len() - pos,
                    "stopped span was not the active stack top"
                );
            }
            state.active.truncate(pos);
        }
    }

    /// Merge annotations into a span; later values overwrite per key
    pub fn annotate<I, K, V>(&self, id: u64, annotations: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Scalar>,
    {
        let mut state = self.lock();

        if let Some(index) = state.index_of(id) {
            let node = &mut state.nodes[index];
            for (key, value) in annotations {
                node.annotations.insert(key.into(), value.into());
            }
        }
    }

    /// The root span's id
    pub fn root_id(&self) -> u64 {
        self.lock().nodes[0].id
    }

    /// Total number of spans in the tree, root included
    pub fn span_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Stop the root timer if still running and clear the active stack
    pub fn finalize(&self) {
        let mut state = self.lock();
        let now = state.now_us();

        let root = &mut state.nodes[0];
        if root.start_us.is_some() && root.stop_us.is_none() {
            root.stop_us = Some(now);
        }
        state.active.clear();
    }

    /// The root span's elapsed time, if its timer has stopped
    pub fn root_duration_us(&self) -> Option<u64> {
        let state = self.lock();
        let root = &state.nodes[0];
        match (root.start_us, root.stop_us) {
            (Some(start), Some(stop)) => Some(stop.saturating_sub(start)),
            _ => None,
        }
    }

    /// Snapshot the tree as nested serializable span data
    pub fn collect(&self) -> SpanData {
        let state = self.lock();
        build_data(&state.nodes, 0)
    }
}

fn build_data(nodes: &[SpanNode], index: usize) -> SpanData {
    let node = &nodes[index];
    SpanData {
        id: node.id,
        category: node.category.clone(),
        start_us: node.start_us,
        duration_us: match (node.start_us, node.stop_us) {
            (Some(start), Some(stop)) => Some(stop.saturating_sub(start)),
            _ => None,
        },
        annotations: node.annotations.clone(),
        children: node
            .children
            .iter()
            .map(|&child| build_data(nodes, child))
            .collect(),
    }
}

#[derive(Clone)]
struct SpanRef {
    id: u64,
    tree: SpanTree,
}

/// Handle to one span of the active transaction.
///
/// The inert null variant is returned whenever tracing is disabled; every
/// operation on it is a no-op and `id()` returns 0, so instrumentation call
/// sites never branch on tracing state.
#[derive(Clone)]
pub struct Span {
    inner: Option<SpanRef>,
}

impl Span {
    /// The inert span
    pub fn null() -> Self {
        Self { inner: None }
    }

    pub(crate) fn recording(id: u64, tree: SpanTree) -> Self {
        Self {
            inner: Some(SpanRef { id, tree }),
        }
    }

    /// True for the inert variant
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// The span id; 0 for the inert variant
    pub fn id(&self) -> u64 {
        self.inner.as_ref().map(|r| r.id).unwrap_or(0)
    }

    /// Create a child span; the inert variant returns itself
    pub fn create_span(&self, category: &str) -> Span {
        match &self.inner {
            Some(r) => r.tree.create_span_under(r.id, category),
            None => Span::null(),
        }
    }

    /// Record the timer start in microseconds; idempotent
    pub fn start_timer(&self) {
        if let Some(r) = &self.inner {
            r.tree.start_timer(r.id);
        }
    }

    /// Record the timer stop in microseconds; idempotent
    pub fn stop_timer(&self) {
        if let Some(r) = &self.inner {
            r.tree.stop_timer(r.id);
        }
    }

    /// Merge annotations into the span
    pub fn annotate<I, K, V>(&self, annotations: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Scalar>,
    {
        if let Some(r) = &self.inner {
            r.tree.annotate(r.id, annotations);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_root_span_started_at_creation() {
        let tree = SpanTree::new("app");
        let data = tree.collect();

        assert_eq!(data.category, "app");
        assert_eq!(data.start_us, Some(0));
        assert!(data.duration_us.is_none());
    }

    #[test]
    fn test_create_span_nests_under_stack_top() {
        let tree = SpanTree::new("app");

        let outer = tree.create_span("php");
        outer.start_timer();
        let inner = tree.create_span("sql");
        inner.start_timer();
        inner.stop_timer();
        outer.stop_timer();
        tree.finalize();

        let data = tree.collect();
        assert_eq!(data.children.len(), 1);
        assert_eq!(data.children[0].category, "php");
        assert_eq!(data.children[0].children.len(), 1);
        assert_eq!(data.children[0].children[0].category, "sql");
    }

    #[test]
    fn test_timer_first_start_and_stop_win() {
        let tree = SpanTree::new("app");
        let span = tree.create_span("sql");

        span.start_timer();
        thread::sleep(Duration::from_millis(2));
        span.start_timer();
        span.stop_timer();
        let first = tree.collect().children[0].duration_us;

        thread::sleep(Duration::from_millis(2));
        span.stop_timer();
        let second = tree.collect().children[0].duration_us;

        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn test_stop_without_start_records_nothing() {
        let tree = SpanTree::new("app");
        let span = tree.create_span("sql");

        span.stop_timer();

        let data = tree.collect();
        assert!(data.children[0].start_us.is_none());
        assert!(data.children[0].duration_us.is_none());
    }

    #[test]
    fn test_elapsed_is_measured() {
        let tree = SpanTree::new("app");
        let span = tree.create_span("sql");

        span.start_timer();
        thread::sleep(Duration::from_millis(5));
        span.stop_timer();

        let elapsed = tree.collect().children[0].duration_us.unwrap();
        assert!(elapsed >= 4_000, "elapsed was {}us", elapsed);
    }

    #[test]
    fn test_annotate_merges_and_overwrites() {
        let tree = SpanTree::new("app");
        let span = tree.create_span("sql");

        span.annotate([("title", "SELECT 1")]);
        span.annotate([("rows", Scalar::Int(3)), ("title", Scalar::from("SELECT 2"))]);

        let data = tree.collect();
        let annotations = &data.children[0].annotations;
        assert_eq!(annotations.get("title"), Some(&Scalar::from("SELECT 2")));
        assert_eq!(annotations.get("rows"), Some(&Scalar::Int(3)));
    }

    #[test]
    fn test_stop_of_non_top_span_pops_through() {
        let tree = SpanTree::new("app");

        let outer = tree.create_span("controller");
        outer.start_timer();
        let inner = tree.create_span("view");
        inner.start_timer();

        // Out of order: the outer span is not the stack top.
        outer.stop_timer();

        // The stack recovered; the next span nests under the root again.
        let next = tree.create_span("sql");
        next.start_timer();
        next.stop_timer();

        let data = tree.collect();
        assert_eq!(data.children.len(), 2);
        assert_eq!(data.children[0].category, "controller");
        assert_eq!(data.children[1].category, "sql");
        assert!(data.children[0].duration_us.is_some());
    }

    #[test]
    fn test_null_span_is_inert() {
        let span = Span::null();

        assert!(span.is_null());
        assert_eq!(span.id(), 0);
        span.start_timer();
        span.stop_timer();
        span.annotate([("key", "value")]);

        let child = span.create_span("sql");
        assert!(child.is_null());
        assert_eq!(child.id(), 0);
    }

    #[test]
    fn test_span_ids_are_non_zero_and_unique() {
        let tree = SpanTree::new("app");
        let a = tree.create_span("sql");
        let b = tree.create_span("sql");

        assert_ne!(a.id(), 0);
        assert_ne!(b.id(), 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_create_child_via_span_handle() {
        let tree = SpanTree::new("app");
        let parent = tree.create_span("http");
        let child = parent.create_span("dns");

        let data = tree.collect();
        assert_eq!(data.children[0].children[0].id, child.id());
    }

    #[test]
    fn test_finalize_stops_root() {
        let tree = SpanTree::new("app");
        thread::sleep(Duration::from_millis(1));
        tree.finalize();

        assert!(tree.root_duration_us().is_some());

        // A second finalize keeps the first stop timestamp.
        let first = tree.root_duration_us();
        tree.finalize();
        assert_eq!(tree.root_duration_us(), first);
    }

    #[test]
    fn test_scalar_from_json_rejects_compounds() {
        assert!(Scalar::from_json(&serde_json::json!([1, 2])).is_none());
        assert!(Scalar::from_json(&serde_json::json!({"a": 1})).is_none());
        assert_eq!(
            Scalar::from_json(&serde_json::json!("x")),
            Some(Scalar::from("x"))
        );
        assert_eq!(Scalar::from_json(&serde_json::json!(7)), Some(Scalar::Int(7)));
        assert_eq!(Scalar::from_json(&serde_json::Value::Null), Some(Scalar::Null));
    }

    #[test]
    fn test_spans_shared_across_threads() {
        let tree = SpanTree::new("app");
        let span = tree.create_span("worker");
        span.start_timer();

        let handle = {
            let span = span.clone();
            thread::spawn(move || {
                span.annotate([("thread", "pool-1")]);
                span.stop_timer();
            })
        };
        handle.join().expect("worker thread panicked");

        let data = tree.collect();
        assert!(data.children[0].duration_us.is_some());
        assert_eq!(
            data.children[0].annotations.get("thread"),
            Some(&Scalar::from("pool-1"))
        );
    }
}
