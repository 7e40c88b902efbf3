//! The global harmonic log.

use harmony_engine::{DeltaOperation, Harmonic, HarmonicId, RecordId};
use serde_json::Value;

/// Append-only log of confirmed changes with monotonically increasing ids.
#[derive(Debug, Clone, Default)]
pub struct HarmonicLog {
    entries: Vec<Harmonic>,
    last_id: u64,
}

impl HarmonicLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed change and return its harmonic.
    pub fn append(
        &mut self,
        table: &str,
        operation: DeltaOperation,
        record_id: RecordId,
        record: Option<&Value>,
    ) -> Harmonic {
        self.last_id += 1;
        let harmonic = Harmonic::new(self.last_id, table, operation, record_id, record);
        self.entries.push(harmonic.clone());
        harmonic
    }

    /// Harmonics of `table` with an id greater than `after`, in log order.
    pub fn after(&self, table: &str, after: &HarmonicId) -> Vec<Harmonic> {
        self.entries
            .iter()
            .filter(|h| h.table_name == table && h.id > *after)
            .cloned()
            .collect()
    }

    /// Id of the newest entry of any table.
    pub fn latest(&self) -> Option<HarmonicId> {
        (self.last_id > 0).then(|| HarmonicId::from(self.last_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_increase_across_tables() {
        let mut log = HarmonicLog::new();
        assert_eq!(log.latest(), None);

        let first = log.append("todos", DeltaOperation::Create, "a".into(), Some(&json!({"id": "a"})));
        let second = log.append("projects", DeltaOperation::Create, "p".into(), Some(&json!({"id": "p"})));
        let third = log.append("todos", DeltaOperation::Delete, "a".into(), None);

        assert!(first.id < second.id && second.id < third.id);
        assert_eq!(log.latest(), Some(HarmonicId::from(3u64)));
        assert_eq!(log.len(), 3);

        let todos = log.after("todos", &HarmonicId::from(1u64));
        assert_eq!(todos, vec![third]);
        assert_eq!(log.after("todos", &HarmonicId::from(0u64)).len(), 2);
    }
}
