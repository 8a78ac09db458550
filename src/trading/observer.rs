//! Source position observer: diffs consecutive polls of the source terminal.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::{SourceClient, SourceError};
use crate::models::SourcePosition;

/// Changes between two consecutive snapshots. The three sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionDiff {
    /// Present now, absent before
    pub opened: Vec<SourcePosition>,
    /// Present in both, with changed volume, stop-loss or take-profit
    pub modified: Vec<SourcePosition>,
    /// Present before, absent now (last seen state)
    pub closed: Vec<SourcePosition>,
}

impl PositionDiff {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.modified.is_empty() && self.closed.is_empty()
    }
}

/// Polls the source and keeps the last successful snapshot.
pub struct PositionObserver {
    client: Arc<dyn SourceClient>,
    snapshot: BTreeMap<String, SourcePosition>,
}

impl PositionObserver {
    pub fn new(client: Arc<dyn SourceClient>) -> Self {
        Self {
            client,
            snapshot: BTreeMap::new(),
        }
    }

    /// Fetch the current positions and diff them against the last snapshot.
    ///
    /// A failed fetch leaves the previous snapshot untouched, so an outage is
    /// never mistaken for every position closing.
    pub async fn poll(&mut self) -> Result<PositionDiff, SourceError> {
        let positions = match self.client.fetch_open_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Source poll failed; keeping previous snapshot");
                return Err(e);
            }
        };

        let mut current: BTreeMap<String, SourcePosition> = BTreeMap::new();
        for position in positions {
            if let Some(dup) = current.insert(position.position_id.clone(), position) {
                warn!(position = %dup.position_id, "Duplicate position id in source snapshot");
            }
        }

        let diff = diff_snapshots(&self.snapshot, &current);
        if !diff.is_empty() {
            debug!(
                opened = diff.opened.len(),
                modified = diff.modified.len(),
                closed = diff.closed.len(),
                "Source positions changed"
            );
        }

        self.snapshot = current;
        Ok(diff)
    }

    /// Last successful snapshot, keyed by position id.
    pub fn snapshot(&self) -> &BTreeMap<String, SourcePosition> {
        &self.snapshot
    }
}

fn diff_snapshots(
    previous: &BTreeMap<String, SourcePosition>,
    current: &BTreeMap<String, SourcePosition>,
) -> PositionDiff {
    let mut diff = PositionDiff::default();

    for (id, position) in current {
        match previous.get(id) {
            None => diff.opened.push(position.clone()),
            Some(before) if position.differs_from(before) => diff.modified.push(position.clone()),
            Some(_) => {}
        }
    }

    for (id, position) in previous {
        if !current.contains_key(id) {
            diff.closed.push(position.clone());
        }
    }

    diff
}
