//! Positional replacement of an entry's attribute set.
//!
//! The current attributes are flattened (predicates in map order, values in
//! stored order) and walked in lock-step with the incoming list. Overlapping
//! slots are overwritten in place so their ledger rows keep their indices,
//! surplus incoming attributes are appended and surplus slots are erased.
//! Incoming attributes are grouped by predicate in map order before the walk,
//! so the order of predicates in a request does not matter. Values of one
//! predicate are matched by position only: reordering them rewrites slots.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::debug;

use crate::attribute::{Attribute, IndexedAttributeData};
use crate::ledger::{Condition, LedgerError, NewRow, RowUpdate, Table};

pub type AttributeMap = BTreeMap<String, Vec<IndexedAttributeData>>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub updated: usize,
    pub appended: usize,
    pub erased: usize,
    pub changed_predicates: BTreeSet<String>,
}

impl ReconcileOutcome {
    pub fn writes(&self) -> usize {
        self.updated + self.appended + self.erased
    }
}

/// Drops repeated `(predicate, value)` pairs, keeping the first occurrence.
pub fn dedup_attributes(attributes: &[Attribute]) -> Vec<Attribute> {
    let mut seen = HashSet::new();
    attributes
        .iter()
        .filter(|a| seen.insert((a.predicate.clone(), a.data.value.clone())))
        .cloned()
        .collect()
}

pub fn flatten(attributes: AttributeMap) -> Vec<(String, IndexedAttributeData)> {
    attributes
        .into_iter()
        .flat_map(|(p, values)| values.into_iter().map(move |v| (p.clone(), v)))
        .collect()
}

pub fn regroup(slots: Vec<(String, IndexedAttributeData)>) -> AttributeMap {
    let mut map = AttributeMap::new();
    for (p, v) in slots {
        map.entry(p).or_default().push(v);
    }
    map
}

/// Replaces `attributes` (owned by entry `entry_id`) with `incoming`.
///
/// Memory tracks the ledger write by write: if a ledger call fails the map
/// reflects every write that succeeded before it.
pub fn reconcile(
    table: &mut dyn Table,
    entry_id: &str,
    attributes: &mut AttributeMap,
    incoming: &[Attribute],
) -> Result<ReconcileOutcome, LedgerError> {
    let mut incoming = dedup_attributes(incoming);
    incoming.sort_by(|a, b| a.predicate.cmp(&b.predicate));
    let mut slots = flatten(std::mem::take(attributes));
    let mut outcome = ReconcileOutcome::default();
    debug!(
        entry_id,
        current = slots.len(),
        incoming = incoming.len(),
        "reconciling attributes"
    );
    let result = walk(table, entry_id, &mut slots, &incoming, &mut outcome);
    *attributes = regroup(slots);
    result.map(|()| outcome)
}

fn walk(
    table: &mut dyn Table,
    entry_id: &str,
    slots: &mut Vec<(String, IndexedAttributeData)>,
    incoming: &[Attribute],
    outcome: &mut ReconcileOutcome,
) -> Result<(), LedgerError> {
    let overlap = slots.len().min(incoming.len());

    for (slot, new) in slots.iter_mut().zip(incoming).take(overlap) {
        let (predicate, current) = slot;
        if *predicate == new.predicate && current.data == new.data && current.idx.is_some() {
            continue;
        }
        match current.idx {
            Some(idx) => {
                debug!(entry_id, idx, from = %predicate, to = %new.predicate, "overwriting attribute slot");
                let update = RowUpdate::default()
                    .predicate(new.predicate.clone())
                    .value(new.data.value.clone())
                    .flags(new.data.flags);
                table.update(&update, &Condition::idx(idx))?;
                outcome.updated += 1;
            }
            None => {
                current.idx = Some(table.insert(new_row(entry_id, new))?);
                outcome.appended += 1;
            }
        }
        outcome.changed_predicates.insert(predicate.clone());
        outcome.changed_predicates.insert(new.predicate.clone());
        *predicate = new.predicate.clone();
        current.data = new.data.clone();
    }

    for new in &incoming[overlap..] {
        debug!(entry_id, predicate = %new.predicate, "appending attribute");
        let idx = table.insert(new_row(entry_id, new))?;
        slots.push((new.predicate.clone(), IndexedAttributeData::persisted(idx, new.data.clone())));
        outcome.appended += 1;
        outcome.changed_predicates.insert(new.predicate.clone());
    }

    while slots.len() > incoming.len() {
        let Some((predicate, current)) = slots.last() else { break };
        if let Some(idx) = current.idx {
            debug!(entry_id, idx, predicate = %predicate, "erasing attribute slot");
            table.erase(&Condition::idx(idx))?;
            outcome.erased += 1;
        }
        outcome.changed_predicates.insert(predicate.clone());
        slots.pop();
    }
    Ok(())
}

pub(crate) fn new_row(entry_id: &str, attribute: &Attribute) -> NewRow {
    NewRow {
        id: entry_id.to_string(),
        predicate: attribute.predicate.clone(),
        value: attribute.data.value.clone(),
        flags: attribute.data.flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttrFlag, AttributeData};
    use crate::ledger::MemoryTable;

    fn attr(p: &str, v: &str) -> Attribute {
        Attribute::new(p, AttributeData::plain(v))
    }

    fn values(map: &AttributeMap) -> Vec<(String, String)> {
        flatten(map.clone()).into_iter().map(|(p, v)| (p, v.data.value)).collect()
    }

    fn owned(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(p, v)| (p.to_string(), v.to_string())).collect()
    }

    fn seeded(table: &mut MemoryTable, attrs: &[Attribute]) -> AttributeMap {
        let mut map = AttributeMap::new();
        let outcome = reconcile(table, "e", &mut map, attrs).unwrap();
        assert_eq!(outcome.appended, attrs.len());
        map
    }

    #[test]
    fn appends_into_empty_entry() {
        let mut table = MemoryTable::new();
        let map = seeded(&mut table, &[attr("name", "E"), attr("text", "body")]);
        assert_eq!(table.len(), 2);
        assert_eq!(values(&map), owned(&[("name", "E"), ("text", "body")]));
        assert!(map.values().flatten().all(|v| v.idx.is_some()));
    }

    #[test]
    fn overwrites_in_place_preserving_row_indices() {
        let mut table = MemoryTable::new();
        let mut map = seeded(&mut table, &[attr("name", "E"), attr("text", "body")]);
        let before: Vec<i64> = map.values().flatten().filter_map(|v| v.idx).collect();

        let outcome = reconcile(&mut table, "e", &mut map, &[attr("name", "E2"), attr("text", "body")]).unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.appended + outcome.erased, 0);
        assert_eq!(outcome.changed_predicates.iter().collect::<Vec<_>>(), vec!["name"]);

        let after: Vec<i64> = map.values().flatten().filter_map(|v| v.idx).collect();
        assert_eq!(before, after);
        let rows = table.query(None).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.predicate == "name" && r.value == "E2"));
    }

    #[test]
    fn identical_save_writes_nothing() {
        let mut table = MemoryTable::new();
        let attrs = [attr("name", "E"), attr("text", "body")];
        let mut map = seeded(&mut table, &attrs);
        let rows_before = table.query(None).unwrap();
        let outcome = reconcile(&mut table, "e", &mut map, &attrs).unwrap();
        assert_eq!(outcome.writes(), 0);
        assert!(outcome.changed_predicates.is_empty());
        assert_eq!(table.query(None).unwrap(), rows_before);
    }

    #[test]
    fn shrinking_erases_trailing_slots_and_empty_predicates() {
        let mut table = MemoryTable::new();
        let mut map = seeded(&mut table, &[attr("a", "1"), attr("b", "2"), attr("c", "3")]);
        let outcome = reconcile(&mut table, "e", &mut map, &[attr("a", "1")]).unwrap();
        assert_eq!(outcome.erased, 2);
        assert_eq!(table.len(), 1);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(outcome.changed_predicates.contains("b") && outcome.changed_predicates.contains("c"));
    }

    #[test]
    fn reordering_values_overwrites_positionally() {
        let mut table = MemoryTable::new();
        let mut map = seeded(&mut table, &[attr("a", "1"), attr("a", "2")]);
        let outcome = reconcile(&mut table, "e", &mut map, &[attr("a", "2"), attr("a", "1")]).unwrap();
        assert_eq!(outcome.updated, 2);
        assert_eq!(table.len(), 2);
        assert_eq!(values(&map), owned(&[("a", "2"), ("a", "1")]));
    }

    #[test]
    fn predicate_order_of_request_is_irrelevant() {
        let mut table = MemoryTable::new();
        let attrs = [attr("text", "body"), attr("name", "N")];
        let mut map = seeded(&mut table, &attrs);
        let rows_before = table.query(None).unwrap();
        assert_eq!(rows_before[0].predicate, "name");

        let outcome = reconcile(&mut table, "e", &mut map, &attrs).unwrap();
        assert_eq!(outcome.writes(), 0);
        assert_eq!(table.query(None).unwrap(), rows_before);

        let outcome = reconcile(&mut table, "e", &mut map, &[attr("name", "N"), attr("text", "body")]).unwrap();
        assert_eq!(outcome.writes(), 0);
    }

    #[test]
    fn slot_may_change_predicate() {
        let mut table = MemoryTable::new();
        let mut map = seeded(&mut table, &[attr("a", "1")]);
        let idx = map["a"][0].idx;
        let outcome = reconcile(&mut table, "e", &mut map, &[attr("z", "9")]).unwrap();
        assert_eq!(outcome.updated, 1);
        assert!(!map.contains_key("a"));
        assert_eq!(map["z"][0].idx, idx);
        let row = &table.query(None).unwrap()[0];
        assert_eq!((row.predicate.as_str(), row.value.as_str()), ("z", "9"));
    }

    #[test]
    fn flag_change_counts_as_change() {
        let mut table = MemoryTable::new();
        let mut map = seeded(&mut table, &[attr("a", "1")]);
        let flagged = Attribute::new("a", AttributeData::new("1", AttrFlag::Date.into()));
        let outcome = reconcile(&mut table, "e", &mut map, &[flagged]).unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(table.query(None).unwrap()[0].flags, crate::attribute::AttrFlags::from(AttrFlag::Date));
    }

    #[test]
    fn unpersisted_slots_are_inserted() {
        let mut table = MemoryTable::new();
        let mut map = AttributeMap::new();
        map.insert("a".into(), vec![IndexedAttributeData { idx: None, data: AttributeData::plain("1") }]);
        map.insert("b".into(), vec![IndexedAttributeData { idx: None, data: AttributeData::plain("2") }]);
        let outcome = reconcile(&mut table, "e", &mut map, &[attr("a", "1")]).unwrap();
        assert_eq!(outcome.appended, 1);
        assert_eq!(outcome.erased, 0);
        assert_eq!(table.len(), 1);
        assert!(map["a"][0].idx.is_some());
    }

    #[test]
    fn duplicate_incoming_pairs_are_dropped() {
        let mut table = MemoryTable::new();
        let mut map = AttributeMap::new();
        reconcile(&mut table, "e", &mut map, &[attr("a", "1"), attr("a", "1"), attr("a", "2")]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(map["a"].len(), 2);
    }
}
