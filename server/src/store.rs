//! The wiki entry tree and its bridge to the ledger.
//!
//! Entries live in an arena keyed by id; parent and child links are ids, not
//! references. The synthetic `root` entry is always present, has no parent
//! and is never written to the ledger. The store keeps three structures in
//! step with the tree: the ledger rows, the q-gram index (exactly the live
//! non-root ids) and the render cache.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::attribute::{
    Attribute, AttributeData, IndexedAttributeData, NAME_PREDICATE, PARENT_PREDICATE, TEXT_PREDICATE,
};
use crate::error::WikiError;
use crate::ledger::{Column, Condition, NewRow, Row, RowUpdate, Table};
use crate::qgram::QGramIndex;
use crate::reconcile::{reconcile, AttributeMap, ReconcileOutcome};
use crate::render::{CacheStats, RenderCache, Renderer};

pub const ROOT_ID: &str = "root";
pub const WIKI_TABLE: &str = "wiki";

const DEGRADED_PREFIX: &str = "Unable to parse the input markdown<br/>";

#[derive(Debug, Clone)]
pub struct Entry {
    id: String,
    parent: Option<String>,
    children: Vec<String>,
    attributes: AttributeMap,
    /// Ledger row persisting the `parent` predicate, if one was ever saved.
    parent_slot: Option<IndexedAttributeData>,
}

impl Entry {
    fn new(id: &str) -> Self {
        Self { id: id.to_string(), parent: None, children: Vec::new(), attributes: AttributeMap::new(), parent_slot: None }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn attribute(&self, predicate: &str) -> Option<&[IndexedAttributeData]> {
        self.attributes.get(predicate).map(Vec::as_slice)
    }

    /// First `name` value, falling back to the id.
    pub fn name(&self) -> &str {
        self.attribute(NAME_PREDICATE)
            .and_then(|values| values.first())
            .map(|v| v.data.value.as_str())
            .unwrap_or(&self.id)
    }

    fn load_attribute(&mut self, predicate: &str, value: IndexedAttributeData) -> bool {
        let values = self.attributes.entry(predicate.to_string()).or_default();
        if values.iter().any(|v| v.data.value == value.data.value) {
            return false;
        }
        values.push(value);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryView {
    pub id: String,
    pub name: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub attributes: BTreeMap<String, Vec<AttributeData>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    /// `None` for the root.
    pub id: Option<String>,
    pub name: String,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub entries: usize,
    pub attributes: usize,
    pub skipped_rows: usize,
    pub duplicates: usize,
    pub orphaned: usize,
    pub broken_cycles: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Created(ReconcileOutcome),
    Updated(ReconcileOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    Html(String),
    /// The renderer failed; carries the raw text behind a notice.
    Degraded(String),
}

impl Rendered {
    pub fn body(&self) -> &str {
        match self {
            Rendered::Html(s) | Rendered::Degraded(s) => s,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Rendered::Degraded(_))
    }
}

pub struct EntryStore {
    table: Box<dyn Table>,
    renderer: Box<dyn Renderer>,
    entries: HashMap<String, Entry>,
    index: QGramIndex,
    cache: RenderCache,
}

impl EntryStore {
    /// Rebuilds the tree from every ledger row.
    ///
    /// Only a failure to read the ledger at all is fatal; bad rows are logged
    /// and skipped, and whatever cannot be placed ends up under root.
    pub fn load(
        table: Box<dyn Table>,
        renderer: Box<dyn Renderer>,
        cache_capacity: usize,
    ) -> Result<(Self, LoadReport), WikiError> {
        let mut store = Self {
            table,
            renderer,
            entries: HashMap::new(),
            index: QGramIndex::new(),
            cache: RenderCache::new(cache_capacity),
        };
        store.entries.insert(ROOT_ID.to_string(), Entry::new(ROOT_ID));
        let rows = store.table.query(None)?;
        let report = store.replay(&rows);
        info!(
            entries = report.entries,
            attributes = report.attributes,
            skipped = report.skipped_rows,
            duplicates = report.duplicates,
            orphaned = report.orphaned,
            broken_cycles = report.broken_cycles,
            "Wiki loaded"
        );
        Ok((store, report))
    }

    fn replay(&mut self, rows: &[Row]) -> LoadReport {
        let mut report = LoadReport::default();
        let loadable = |row: &Row| row.id != ROOT_ID && !row.id.is_empty();

        // Pass 1: one shell per id, in first-seen order.
        let mut order: Vec<String> = Vec::new();
        for row in rows {
            if !loadable(row) {
                warn!(idx = row.idx, id = %row.id, "{}", WikiError::Inconsistency(format!("row {} belongs to no loadable entry", row.idx)));
                report.skipped_rows += 1;
                continue;
            }
            if !self.entries.contains_key(&row.id) {
                self.entries.insert(row.id.clone(), Entry::new(&row.id));
                self.index.add(&row.id, &row.id);
                order.push(row.id.clone());
            }
        }

        // Pass 2: attributes and parent links.
        let mut links: Vec<(String, String)> = Vec::new();
        for row in rows.iter().filter(|r| loadable(*r)) {
            let parent_known = self.entries.contains_key(&row.value);
            let Some(entry) = self.entries.get_mut(&row.id) else {
                warn!(idx = row.idx, id = %row.id, "row refers to an entry missing after the first pass");
                report.skipped_rows += 1;
                continue;
            };
            let data = AttributeData::new(row.value.clone(), row.flags);
            if row.predicate == PARENT_PREDICATE {
                if entry.parent_slot.is_some() {
                    warn!(id = %row.id, idx = row.idx, "Duplicate parent row while loading, keeping the first");
                    report.duplicates += 1;
                    continue;
                }
                entry.parent_slot = Some(IndexedAttributeData::persisted(row.idx, data));
                if parent_known {
                    links.push((row.id.clone(), row.value.clone()));
                } else {
                    error!(id = %row.id, parent = %row.value, "The entry refers to a nonexistent parent");
                    report.orphaned += 1;
                }
            } else if entry.load_attribute(&row.predicate, IndexedAttributeData::persisted(row.idx, data)) {
                report.attributes += 1;
            } else {
                warn!(id = %row.id, predicate = %row.predicate, value = %row.value, "Duplicate attribute while loading");
                report.duplicates += 1;
            }
        }

        for (child, parent) in links {
            if self.is_ancestor_or_self(&child, &parent) {
                warn!(id = %child, parent = %parent, "Parent link would close a cycle, attaching to root instead");
                report.broken_cycles += 1;
                continue;
            }
            self.attach(&child, &parent);
        }

        for id in &order {
            if self.entries.get(id).map_or(false, |e| e.parent.is_none()) {
                self.attach(id, ROOT_ID);
            }
        }
        report.entries = order.len();
        report
    }

    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        id != ROOT_ID && self.entries.contains_key(id)
    }

    pub fn index(&self) -> &QGramIndex {
        &self.index
    }

    pub fn table(&self) -> &dyn Table {
        self.table.as_ref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn entry(&self, id: &str) -> Option<&Entry> {
        if id == ROOT_ID {
            return None;
        }
        self.entries.get(id)
    }

    fn require(&self, id: &str) -> Result<&Entry, WikiError> {
        self.entry(id).ok_or_else(|| WikiError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<EntryView, WikiError> {
        let entry = self.require(id)?;
        Ok(EntryView {
            id: entry.id.clone(),
            name: entry.name().to_string(),
            parent: entry.parent.clone(),
            children: entry.children.clone(),
            attributes: entry
                .attributes
                .iter()
                .map(|(p, values)| (p.clone(), values.iter().map(|v| v.data.clone()).collect()))
                .collect(),
        })
    }

    /// Values of `predicate` on `id` in stored order; empty if either is unknown.
    pub fn get_attribute(&self, id: &str, predicate: &str) -> Vec<AttributeData> {
        self.entry(id)
            .and_then(|e| e.attribute(predicate))
            .map(|values| values.iter().map(|v| v.data.clone()).collect())
            .unwrap_or_default()
    }

    pub fn raw(&self, id: &str) -> Result<String, WikiError> {
        let entry = self.require(id)?;
        match entry.attribute(TEXT_PREDICATE).and_then(|v| v.first()) {
            Some(text) => Ok(text.data.value.clone()),
            None => {
                warn!(id, "Entry has no {} attribute", TEXT_PREDICATE);
                Ok(String::new())
            }
        }
    }

    /// Rendered `text` of `id`, served from the render cache when fresh.
    pub fn render(&mut self, id: &str) -> Result<Rendered, WikiError> {
        let raw = self.raw(id)?;
        match self.cache.get_or_render(id, TEXT_PREDICATE, &raw, self.renderer.as_ref()) {
            Ok(html) => Ok(Rendered::Html(html)),
            Err(err) => {
                warn!(id, error = %err, "Rendering failed, answering with the raw text");
                Ok(Rendered::Degraded(format!("{}{}", DEGRADED_PREFIX, raw)))
            }
        }
    }

    /// Depth-first tree from root; children appear in attach order.
    ///
    /// Nodes are built bottom-up from an explicit stack, so deep chains do
    /// not grow the call stack.
    pub fn list_tree(&self) -> TreeNode {
        let mut built: HashMap<String, TreeNode> = HashMap::new();
        let mut stack = vec![(ROOT_ID.to_string(), false)];
        while let Some((id, expanded)) = stack.pop() {
            let entry = self.entries.get(&id);
            let children = entry.map(|e| e.children.as_slice()).unwrap_or_default();
            if !expanded {
                stack.push((id, true));
                stack.extend(children.iter().rev().map(|c| (c.clone(), false)));
                continue;
            }
            let node = TreeNode {
                id: (id != ROOT_ID).then(|| id.clone()),
                name: entry.map_or(id.as_str(), |e| e.name()).to_string(),
                children: children.iter().filter_map(|c| built.remove(c)).collect(),
            };
            built.insert(id, node);
        }
        built
            .remove(ROOT_ID)
            .unwrap_or_else(|| TreeNode { id: None, name: ROOT_ID.to_string(), children: Vec::new() })
    }

    /// Replaces the full attribute set of `id`, creating the entry if needed.
    ///
    /// A `parent` attribute places the entry in the tree (root when absent)
    /// and is persisted separately from the reconciled attributes.
    pub fn save(&mut self, id: &str, attributes: Vec<Attribute>) -> Result<SaveOutcome, WikiError> {
        if id == ROOT_ID {
            return Err(WikiError::NotAllowed("`root` is not an allowed id".to_string()));
        }
        if id.is_empty() {
            return Err(WikiError::Validation("empty entry id".to_string()));
        }
        let (parents, attributes): (Vec<Attribute>, Vec<Attribute>) =
            attributes.into_iter().partition(|a| a.predicate == PARENT_PREDICATE);
        if parents.len() > 1 {
            return Err(WikiError::Validation("more than one parent given".to_string()));
        }
        let explicit_parent = parents.into_iter().next();
        let parent_id = explicit_parent.as_ref().map_or(ROOT_ID, |a| a.data.value.as_str()).to_string();
        if !self.entries.contains_key(&parent_id) {
            return Err(WikiError::Validation(format!("unknown parent '{}'", parent_id)));
        }

        if self.entries.contains_key(id) && self.is_ancestor_or_self(id, &parent_id) {
            return Err(WikiError::Validation(format!("'{}' cannot be moved below '{}'", id, parent_id)));
        }

        let outcome = match self.apply_save(id, &parent_id, explicit_parent.as_ref(), &attributes) {
            Ok(outcome) => outcome,
            Err(err) => {
                // Slots written before the failure are already live in memory.
                self.cache.invalidate_entry(id);
                return Err(err);
            }
        };

        let changed = match &outcome {
            SaveOutcome::Created(o) | SaveOutcome::Updated(o) => &o.changed_predicates,
        };
        for predicate in changed {
            self.cache.invalidate(id, predicate);
        }
        self.table.flush()?;
        Ok(outcome)
    }

    fn apply_save(
        &mut self,
        id: &str,
        parent_id: &str,
        explicit_parent: Option<&Attribute>,
        attributes: &[Attribute],
    ) -> Result<SaveOutcome, WikiError> {
        if self.entries.contains_key(id) {
            let outcome = self.reconcile_entry(id, attributes)?;
            self.persist_parent(id, explicit_parent)?;
            if self.entries.get(id).and_then(|e| e.parent.as_deref()) != Some(parent_id) {
                debug!(id, parent = %parent_id, "reparenting");
                self.detach(id);
                self.attach(id, parent_id);
            }
            info!(id, updated = outcome.updated, appended = outcome.appended, erased = outcome.erased, "Updated wiki entry");
            Ok(SaveOutcome::Updated(outcome))
        } else {
            self.entries.insert(id.to_string(), Entry::new(id));
            self.attach(id, parent_id);
            self.index.add(id, id);
            let outcome = self.reconcile_entry(id, attributes)?;
            self.persist_parent(id, explicit_parent)?;
            info!(id, parent = %parent_id, attributes = outcome.appended, "Created wiki entry");
            Ok(SaveOutcome::Created(outcome))
        }
    }

    fn reconcile_entry(&mut self, id: &str, attributes: &[Attribute]) -> Result<ReconcileOutcome, WikiError> {
        let entry = self.entries.get_mut(id).ok_or_else(|| WikiError::NotFound(id.to_string()))?;
        Ok(reconcile(self.table.as_mut(), id, &mut entry.attributes, attributes)?)
    }

    fn persist_parent(&mut self, id: &str, parent: Option<&Attribute>) -> Result<(), WikiError> {
        let entry = self.entries.get_mut(id).ok_or_else(|| WikiError::NotFound(id.to_string()))?;
        match (parent, entry.parent_slot.as_mut()) {
            (Some(attr), Some(slot)) => {
                if slot.data != attr.data {
                    if let Some(idx) = slot.idx {
                        let update = RowUpdate::default().value(attr.data.value.clone()).flags(attr.data.flags);
                        self.table.update(&update, &Condition::idx(idx))?;
                    } else {
                        slot.idx = Some(self.table.insert(parent_row(id, attr))?);
                    }
                    slot.data = attr.data.clone();
                }
            }
            (Some(attr), None) => {
                let idx = self.table.insert(parent_row(id, attr))?;
                entry.parent_slot = Some(IndexedAttributeData::persisted(idx, attr.data.clone()));
            }
            (None, Some(_)) => {
                if let Some(idx) = entry.parent_slot.take().and_then(|s| s.idx) {
                    self.table.erase(&Condition::idx(idx))?;
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Removes `id` and its whole subtree, children before parents.
    /// Returns the removed ids in removal order.
    pub fn delete(&mut self, id: &str) -> Result<Vec<String>, WikiError> {
        if id == ROOT_ID {
            return Err(WikiError::NotAllowed("the root entry cannot be deleted".to_string()));
        }
        if !self.entries.contains_key(id) {
            return Err(WikiError::NotAllowed(format!("unknown entry '{}'", id)));
        }
        let doomed = self.subtree_post_order(id);
        let mut rows = 0usize;
        for node in &doomed {
            rows += self.table.erase(&Condition::eq(Column::Id, node.as_str()))?;
            self.detach(node);
            self.entries.remove(node);
            self.index.remove(node);
            self.cache.invalidate_entry(node);
        }
        self.table.flush()?;
        info!(id, entries = doomed.len(), rows, "Deleted wiki entry");
        Ok(doomed)
    }

    fn subtree_post_order(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![(id.to_string(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                out.push(node);
                continue;
            }
            let children = self.entries.get(&node).map(|e| e.children.clone()).unwrap_or_default();
            stack.push((node, true));
            stack.extend(children.into_iter().rev().map(|c| (c, false)));
        }
        out
    }

    /// True if `ancestor` is `node` or lies on the parent chain of `node`.
    fn is_ancestor_or_self(&self, ancestor: &str, node: &str) -> bool {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.entries.get(id).and_then(|e| e.parent.as_deref());
        }
        false
    }

    fn attach(&mut self, child: &str, parent: &str) {
        if let Some(p) = self.entries.get_mut(parent) {
            p.children.push(child.to_string());
        }
        if let Some(c) = self.entries.get_mut(child) {
            c.parent = Some(parent.to_string());
        }
    }

    fn detach(&mut self, child: &str) {
        let Some(parent) = self.entries.get_mut(child).and_then(|c| c.parent.take()) else { return };
        if let Some(p) = self.entries.get_mut(&parent) {
            p.children.retain(|c| c != child);
        }
    }

    /// Checks the tree and index invariants, reporting the first violation.
    pub fn verify(&self) -> Result<(), WikiError> {
        for (id, entry) in &self.entries {
            if id == ROOT_ID {
                if entry.parent.is_some() {
                    return Err(WikiError::Inconsistency("root has a parent".to_string()));
                }
                continue;
            }
            let mut cur = entry.parent.as_deref();
            let mut steps = 0usize;
            while let Some(p) = cur {
                if p == ROOT_ID {
                    break;
                }
                steps += 1;
                if steps > self.entries.len() {
                    return Err(WikiError::Inconsistency(format!("cycle above '{}'", id)));
                }
                cur = self.entries.get(p).and_then(|e| e.parent.as_deref());
            }
            if cur.is_none() {
                return Err(WikiError::Inconsistency(format!("'{}' is not reachable from root", id)));
            }
            let parent = entry.parent.as_deref().unwrap_or_default();
            let listed = self.entries.get(parent).map_or(0, |p| p.children.iter().filter(|c| *c == id).count());
            if listed != 1 {
                return Err(WikiError::Inconsistency(format!("'{}' listed {} times under '{}'", id, listed, parent)));
            }
            if !self.index.contains(id) {
                return Err(WikiError::Inconsistency(format!("'{}' missing from the completion index", id)));
            }
        }
        if self.index.len() != self.len() {
            return Err(WikiError::Inconsistency("completion index holds stale ids".to_string()));
        }
        Ok(())
    }
}

fn parent_row(id: &str, attr: &Attribute) -> NewRow {
    NewRow {
        id: id.to_string(),
        predicate: PARENT_PREDICATE.to_string(),
        value: attr.data.value.clone(),
        flags: attr.data.flags,
    }
}
