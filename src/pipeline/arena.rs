//! Per-run bookkeeping of stage outputs.
//!
//! The arena owns one slot per stage. A stage's downstream reads resolve
//! through the arena rather than through shared mutable state, and cleanup
//! asks the arena which ephemeral tables are still alive.

use std::collections::HashSet;

use uuid::Uuid;

use crate::warehouse::{ConnectionId, TableRef};

use super::graph::{StageId, TableInput};
use super::stages::StageOutput;

/// Outputs of one run, indexed by [`StageId`].
#[derive(Debug)]
pub struct TableArena {
    run_id: Uuid,
    conn: ConnectionId,
    slots: Vec<Option<StageOutput>>,
    created: Vec<TableRef>,
    dropped: HashSet<String>,
}

impl TableArena {
    pub fn new(run_id: Uuid, conn: ConnectionId, stages: usize) -> Self {
        Self {
            run_id,
            conn,
            slots: vec![None; stages],
            created: Vec::new(),
            dropped: HashSet::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The ephemeral table reserved for `stage` in this run.
    pub fn ephemeral_for(&self, stage: StageId) -> TableRef {
        TableRef::ephemeral(self.run_id, stage, self.conn.clone())
    }

    /// Stores a stage's output. Ephemeral tables it names become owned by
    /// the run.
    pub fn record(&mut self, stage: StageId, output: StageOutput) {
        if let Some(table) = output.table() {
            if table.is_ephemeral() && !self.created.contains(table) {
                self.created.push(table.clone());
            }
        }
        if let Some(slot) = self.slots.get_mut(stage.index()) {
            *slot = Some(output);
        }
    }

    pub fn get(&self, stage: StageId) -> Option<&StageOutput> {
        self.slots.get(stage.index()).and_then(Option::as_ref)
    }

    /// Resolves a stage input to a concrete table, or `None` if the
    /// producing stage has not completed.
    pub fn resolve(&self, input: &TableInput) -> Option<TableRef> {
        match input {
            TableInput::Table(table) => Some(table.clone()),
            TableInput::Stage(id) => self.get(*id).and_then(StageOutput::table).cloned(),
        }
    }

    /// Ephemeral tables created by the run and not yet dropped, in creation
    /// order.
    pub fn ephemeral_tables(&self) -> Vec<TableRef> {
        self.created
            .iter()
            .filter(|t| !self.dropped.contains(&t.physical_name()))
            .cloned()
            .collect()
    }

    pub fn mark_dropped(&mut self, table: &TableRef) {
        self.dropped.insert(table.physical_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::MergeReport;

    fn arena() -> TableArena {
        TableArena::new(Uuid::new_v4(), ConnectionId::new("snowflake_default"), 4)
    }

    #[test]
    fn test_resolve_stage_and_named_inputs() {
        let mut arena = arena();
        let load = StageId::new(0);
        assert!(arena.resolve(&TableInput::Stage(load)).is_none());

        let table = arena.ephemeral_for(load);
        arena.record(
            load,
            StageOutput::Table {
                table: table.clone(),
                rows: Some(3),
            },
        );
        assert_eq!(arena.resolve(&TableInput::Stage(load)), Some(table));

        let customers = TableRef::named("customers_table", "snowflake_default");
        assert_eq!(
            arena.resolve(&TableInput::Table(customers.clone())),
            Some(customers)
        );
    }

    #[test]
    fn test_ephemeral_tables_exclude_named_and_dropped() {
        let mut arena = arena();
        let a = arena.ephemeral_for(StageId::new(0));
        let b = arena.ephemeral_for(StageId::new(1));
        arena.record(StageId::new(0), StageOutput::Table { table: a.clone(), rows: None });
        arena.record(StageId::new(1), StageOutput::Table { table: b.clone(), rows: None });
        arena.record(
            StageId::new(2),
            StageOutput::Merged {
                table: TableRef::named("reporting_table", "snowflake_default"),
                report: MergeReport::default(),
            },
        );
        assert_eq!(arena.ephemeral_tables(), vec![a.clone(), b.clone()]);

        arena.mark_dropped(&a);
        assert_eq!(arena.ephemeral_tables(), vec![b]);
    }
}
