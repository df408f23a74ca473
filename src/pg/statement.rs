//! Prepared statements, row descriptors and result rows.
//!
//! A [`RowDescriptor`] is built once per statement or result and shared by
//! every [`Row`] through an `Arc`. [`StatementCache`] maps SQL text to the
//! statement prepared for it on one connection.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use lru::LruCache;
use smallvec::SmallVec;

use super::protocol::{FieldDescription, Format};
use super::types::{Oid, PgValue};

// ============================================================================
// Rows
// ============================================================================

/// Ordered column metadata of a result.
///
/// Built once per RowDescription and shared by every row through an `Arc`.
#[derive(Debug, Default, PartialEq)]
pub struct RowDescriptor {
    columns: Vec<FieldDescription>,
    by_name: HashMap<String, usize>,
}

impl RowDescriptor {
    pub fn new(columns: Vec<FieldDescription>) -> Self {
        let mut by_name = HashMap::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            // First column wins for duplicate names, as in `SELECT a.id, b.id`
            by_name.entry(col.name.clone()).or_insert(i);
        }
        Self { columns, by_name }
    }

    /// Same columns, with every result format forced to `format`.
    ///
    /// A statement Describe reports text formats because no portal exists
    /// yet; rows come back in the formats requested at Bind time.
    pub fn with_format(&self, format: Format) -> Self {
        Self::new(
            self.columns
                .iter()
                .cloned()
                .map(|mut col| {
                    col.format = format;
                    col
                })
                .collect(),
        )
    }

    #[inline]
    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

/// One result row. Values are stored inline for narrow rows.
#[derive(Debug, Clone)]
pub struct Row {
    desc: Arc<RowDescriptor>,
    values: SmallVec<[PgValue; 8]>,
}

impl Row {
    pub(crate) fn new(desc: Arc<RowDescriptor>, values: SmallVec<[PgValue; 8]>) -> Self {
        Self { desc, values }
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&PgValue> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&PgValue> {
        self.desc.index_of(name).and_then(|i| self.values.get(i))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn descriptor(&self) -> &Arc<RowDescriptor> {
        &self.desc
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<PgValue> {
        self.values.into_vec()
    }
}

/// Rows and completion tag of one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// `None` for statements that return no rows
    pub columns: Option<Arc<RowDescriptor>>,
    pub rows: Vec<Row>,
    /// e.g. `INSERT 0 3`, `SELECT 2`; empty for an empty query string
    pub command_tag: String,
}

impl QueryResult {
    /// Row count carried by the command tag (0 when it has none).
    pub fn rows_affected(&self) -> u64 {
        self.command_tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

// ============================================================================
// Prepared Statement
// ============================================================================

/// Server-side statement created by Parse and described by Describe.
///
/// A statement belongs to the connection that prepared it and is useless
/// once that connection closes.
#[derive(Debug)]
pub struct PreparedStatement {
    /// `__sw_<n>`, unique per connection
    pub name: String,
    pub query: String,
    /// As reported by ParameterDescription
    pub param_types: Vec<Oid>,
    /// Result columns, with the binary result format requested at Bind time
    pub columns: Arc<RowDescriptor>,
    pub(crate) connection_id: u64,
    closed: AtomicBool,
}

impl PreparedStatement {
    pub(crate) fn new(
        name: String,
        query: String,
        param_types: Vec<Oid>,
        columns: Arc<RowDescriptor>,
        connection_id: u64,
    ) -> Self {
        Self {
            name,
            query,
            param_types,
            columns,
            connection_id,
            closed: AtomicBool::new(false),
        }
    }

    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip to closed; false if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

// ============================================================================
// Statement Cache
// ============================================================================

/// Bounded, least-recently-used map from SQL text to statement.
///
/// Eviction hands the statement back to the caller, which still has to
/// close it on the server.
pub struct StatementCache {
    cache: LruCache<String, Arc<PreparedStatement>>,
    next_id: AtomicU32,
}

impl StatementCache {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_id: AtomicU32::new(0),
        }
    }

    /// Lookup that also marks the entry as most recently used.
    pub fn get_and_touch(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(query).map(Arc::clone)
    }

    /// Returns whatever was pushed out: the least recently used entry, or
    /// a different statement previously cached for the same query.
    pub fn insert(
        &mut self,
        query: String,
        statement: Arc<PreparedStatement>,
    ) -> Option<Arc<PreparedStatement>> {
        match self.cache.push(query, Arc::clone(&statement)) {
            Some((_, old)) if !Arc::ptr_eq(&old, &statement) => Some(old),
            _ => None,
        }
    }

    /// Drop `statement` if it is the one cached for its query.
    pub fn remove(&mut self, statement: &PreparedStatement) -> bool {
        match self.cache.peek(&statement.query) {
            Some(cached) if std::ptr::eq(cached.as_ref(), statement) => {
                self.cache.pop(&statement.query);
                true
            }
            _ => false,
        }
    }

    pub fn next_statement_name(&self) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("__sw_{}", id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
