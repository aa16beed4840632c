//! Operation plans
//!
//! A plan is an ordered list of REST operations. Ordering respects
//! referential integrity: rule deletions that drop references run first,
//! dependency sections are created before their dependents, and backend
//! deletions run last, after everything that could reference them is gone.
//! Within one rank the comparator's emission order (the desired rule
//! sequence) is preserved by a stable sort.

use htc_crd::OperationSummary;
use serde_json::Value;

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// POST a new object
    Create,
    /// PUT over an existing object
    Update,
    /// DELETE an object
    Delete,
}

/// Execution ranks, ascending. See module docs for the rationale.
pub mod rank {
    /// Deletes of frontend children (may drop backend references)
    pub const FRONTEND_CHILD_DELETE: u8 = 0;
    /// Deletes of whole frontends
    pub const FRONTEND_DELETE: u8 = 5;
    /// Updates of the global/defaults singletons
    pub const SINGLETON: u8 = 10;
    /// Creates/updates of auxiliary sections (resolvers, peers, ...)
    pub const AUX_UPSERT: u8 = 15;
    /// Creates/updates of backends
    pub const BACKEND_UPSERT: u8 = 30;
    /// Backend children (servers, rules, checks)
    pub const BACKEND_CHILD: u8 = 35;
    /// Creates/updates of frontends
    pub const FRONTEND_UPSERT: u8 = 50;
    /// Frontend children creates/updates (binds, rules, acls)
    pub const FRONTEND_CHILD_UPSERT: u8 = 55;
    /// Deletes of whole backends
    pub const BACKEND_DELETE: u8 = 70;
    /// Deletes of auxiliary sections
    pub const AUX_DELETE: u8 = 75;
}

/// One REST operation against the configuration endpoints.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Create, update or delete
    pub kind: OpKind,
    /// Path under `services/haproxy/configuration/`
    pub path: String,
    /// Request body; `None` for deletes
    pub body: Option<Value>,
    /// Execution rank
    pub rank: u8,
    /// Human-readable element description for logs and errors
    pub describe: String,
}

/// The comparator's output for one pod.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Operations, ordered for execution after [`Plan::finish`]
    pub ops: Vec<Operation>,
    /// Set when some difference cannot be expressed as structured
    /// operations; the executor must raw-push instead
    pub requires_raw: bool,
}

impl Plan {
    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && !self.requires_raw
    }

    /// Establish execution order (stable within ranks).
    pub fn finish(&mut self) {
        self.ops.sort_by_key(|op| op.rank);
    }

    /// Operation counts for the deployment status.
    pub fn summary(&self) -> OperationSummary {
        let creates = self.ops.iter().filter(|op| op.kind == OpKind::Create).count() as u32;
        let updates = self.ops.iter().filter(|op| op.kind == OpKind::Update).count() as u32;
        let deletes = self.ops.iter().filter(|op| op.kind == OpKind::Delete).count() as u32;
        OperationSummary::new(creates, updates, deletes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OpKind, rank: u8, path: &str) -> Operation {
        Operation {
            kind,
            path: path.to_string(),
            body: None,
            rank,
            describe: path.to_string(),
        }
    }

    #[test]
    fn finish_orders_by_rank_stably() {
        let mut plan = Plan::default();
        plan.ops.push(op(OpKind::Create, rank::FRONTEND_CHILD_UPSERT, "fe/rule/0"));
        plan.ops.push(op(OpKind::Delete, rank::BACKEND_DELETE, "backends/old"));
        plan.ops.push(op(OpKind::Create, rank::BACKEND_UPSERT, "backends/new"));
        plan.ops.push(op(OpKind::Create, rank::FRONTEND_CHILD_UPSERT, "fe/rule/1"));
        plan.finish();

        let paths: Vec<_> = plan.ops.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, vec!["backends/new", "fe/rule/0", "fe/rule/1", "backends/old"]);
    }

    #[test]
    fn summary_counts_by_kind() {
        let mut plan = Plan::default();
        plan.ops.push(op(OpKind::Create, 0, "a"));
        plan.ops.push(op(OpKind::Update, 0, "b"));
        plan.ops.push(op(OpKind::Update, 0, "c"));
        plan.ops.push(op(OpKind::Delete, 0, "d"));
        let summary = plan.summary();
        assert_eq!((summary.creates, summary.updates, summary.deletes), (1, 2, 1));
        assert_eq!(summary.total, 4);
    }
}
