//! Key-value abstraction with hash, set, and bounded-list primitives.
//!
//! The fact store and rule registry only talk to this trait. [`RedbStore`]
//! is the embedded implementation; anything with the same primitives (a
//! remote cache, a sharded store) can be dropped in behind it.
//!
//! [`RedbStore`]: crate::redb_store::RedbStore

use async_trait::async_trait;

use crate::error::Result;

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Set `fields` on hash `key`, overwriting existing values.
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Remove one field from hash `key`.
    HashDelete { key: String, field: String },
    /// Abort the whole batch with [`LetheError::Conflict`] unless hash field
    /// `field` of `key` currently holds `value` (`None`: the field is absent).
    ///
    /// [`LetheError::Conflict`]: crate::error::LetheError::Conflict
    Expect {
        key: String,
        field: String,
        value: Option<String>,
    },
    /// Add members to set `key`.
    SetAdd { key: String, members: Vec<String> },
    /// Remove members from set `key`. Absent members are ignored.
    SetRemove { key: String, members: Vec<String> },
    /// Push `value` onto the front of list `key`, keeping at most `max_len`
    /// entries (oldest dropped).
    ListPush {
        key: String,
        value: String,
        max_len: usize,
    },
}

/// An ordered group of mutations committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash_set(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.ops.push(WriteOp::HashSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn hash_delete(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::HashDelete {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    /// Guard the batch on the current value of a hash field.
    pub fn expect(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: Option<String>,
    ) -> &mut Self {
        self.ops.push(WriteOp::Expect {
            key: key.into(),
            field: field.into(),
            value,
        });
        self
    }

    pub fn set_add(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::SetAdd {
            key: key.into(),
            members: vec![member.into()],
        });
        self
    }

    pub fn set_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::SetRemove {
            key: key.into(),
            members: vec![member.into()],
        });
        self
    }

    pub fn list_push(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        max_len: usize,
    ) -> &mut Self {
        self.ops.push(WriteOp::ListPush {
            key: key.into(),
            value: value.into(),
            max_len,
        });
        self
    }

    /// Append every op of `other`, preserving order.
    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Storage primitives shared by every component that persists state.
///
/// Missing keys are never errors: reads of absent hashes, sets, or lists
/// return empty results. Errors mean the store itself failed.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Cheap connectivity check. Fails with `Unavailable` when the store
    /// cannot be reached.
    async fn ping(&self) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// All `(field, value)` pairs of a hash, sorted by field.
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>>;

    /// Members of a set, sorted.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Members present in every listed set, sorted. An empty key list yields
    /// an empty result.
    async fn set_intersect(&self, keys: &[String]) -> Result<Vec<String>>;

    async fn set_len(&self, key: &str) -> Result<usize>;

    /// Up to `limit` list entries, most recently pushed first.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>>;

    /// Commit every op in `batch` atomically: all of them or none. A failed
    /// [`WriteOp::Expect`] guard rolls back the batch and returns
    /// `LetheError::Conflict`.
    async fn apply(&self, batch: WriteBatch) -> Result<()>;
}
