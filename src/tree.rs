//! The in-process hierarchical store engine.
//!
//! A tree of path segments. Every node carries an address assigned at
//! creation; explicitly created keys are marked indexed and are the
//! ones enumeration returns. Values keep a timestamped history, keys
//! and values expire independently and lazily, and each node can hold
//! metadata attributes and a relationship address list.
//!
//! The command runtime couples to this module only through the
//! operation set the handlers call; it can be swapped for another
//! engine that exposes the same surface.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::escape::{escape_segment, escape_token_path, PatternSegment};
use crate::value::NativeValue;

pub type StoreAddress = u64;

pub const ROOT_ADDRESS: StoreAddress = 1;

/// Current Unix time in nanoseconds.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Resolve a wire TTL argument: positive is an absolute Unix
/// nanosecond timestamp, negative is relative to now, zero clears.
pub fn resolve_expire_ns(raw: i64) -> i64 {
    if raw < 0 { now_ns().saturating_add(-raw) } else { raw }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SetExFlags {
    pub must_exist: bool,
    pub must_not_exist: bool,
    pub no_value_update: bool,
}

#[derive(Clone, Debug)]
pub struct KeyMatch {
    pub segments: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub has_value: bool,
    pub has_children: bool,
    pub value: Option<NativeValue>,
    pub relationships: Option<Vec<StoreAddress>>,
}

#[derive(Clone, Debug)]
pub struct LevelKey {
    pub segment: String,
    pub has_value: bool,
    pub has_children: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JsonOptions {
    /// Map JSON string values to child key segments instead of values.
    pub string_values_as_keys: bool,
}

#[derive(Clone, Debug)]
struct ValueVersion {
    ts_ns: i64,
    value: Option<NativeValue>,
}

#[derive(Clone, Debug)]
struct Node {
    address: StoreAddress,
    parent: StoreAddress,
    segment: String,
    children: BTreeMap<String, StoreAddress>,
    /// True for keys created through an explicit key operation, false
    /// for segments that exist only as ancestors of one.
    indexed: bool,
    history: Vec<ValueVersion>,
    key_expire_ns: i64,
    value_expire_ns: i64,
    metadata: BTreeMap<String, String>,
    relationships: Option<Vec<StoreAddress>>,
}

impl Node {
    fn new(address: StoreAddress, parent: StoreAddress, segment: String) -> Self {
        Self {
            address,
            parent,
            segment,
            children: BTreeMap::new(),
            indexed: false,
            history: Vec::new(),
            key_expire_ns: 0,
            value_expire_ns: 0,
            metadata: BTreeMap::new(),
            relationships: None,
        }
    }

    fn key_expired(&self, now: i64) -> bool {
        self.key_expire_ns > 0 && self.key_expire_ns <= now
    }

    fn current_value(&self, now: i64) -> Option<&NativeValue> {
        if self.value_expire_ns > 0 && self.value_expire_ns <= now {
            return None;
        }
        self.history.last().and_then(|v| v.value.as_ref())
    }

    fn value_at(&self, when_ns: i64) -> Option<&NativeValue> {
        self.history
            .iter()
            .rev()
            .find(|v| v.ts_ns <= when_ns)
            .and_then(|v| v.value.as_ref())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AutoLinkDef {
    data_key: String,
    fields: Vec<String>,
}

struct TreeState {
    nodes: HashMap<StoreAddress, Node>,
    next_address: StoreAddress,
    auto_links: HashMap<String, AutoLinkDef>,
    staged_counter: u64,
}

impl TreeState {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ADDRESS, Node::new(ROOT_ADDRESS, 0, String::new()));
        Self {
            nodes,
            next_address: ROOT_ADDRESS + 1,
            auto_links: HashMap::new(),
            staged_counter: 0,
        }
    }

    fn alloc(&mut self) -> StoreAddress {
        let addr = self.next_address;
        self.next_address += 1;
        addr
    }

    /// Walk to an existing node, honoring key expiry along the path.
    fn find(&self, segments: &[String], now: i64) -> Option<StoreAddress> {
        let mut addr = ROOT_ADDRESS;
        for segment in segments {
            let node = self.nodes.get(&addr)?;
            addr = *node.children.get(segment)?;
            if self.nodes.get(&addr)?.key_expired(now) {
                return None;
            }
        }
        Some(addr)
    }

    /// Walk to a node, creating any missing segments along the way.
    /// Returns the final address and whether the node already existed.
    fn ensure(&mut self, segments: &[String], now: i64) -> (StoreAddress, bool) {
        let mut addr = ROOT_ADDRESS;
        let mut existed = true;
        for segment in segments {
            let next = self
                .nodes
                .get(&addr)
                .and_then(|n| n.children.get(segment))
                .copied();
            match next {
                Some(child) if !self.nodes[&child].key_expired(now) => addr = child,
                Some(child) => {
                    // expired key in the path: recycle the node in place
                    self.reset_node(child);
                    existed = false;
                    addr = child;
                }
                None => {
                    let child = self.alloc();
                    self.nodes
                        .insert(child, Node::new(child, addr, segment.clone()));
                    if let Some(parent) = self.nodes.get_mut(&addr) {
                        parent.children.insert(segment.clone(), child);
                    }
                    existed = false;
                    addr = child;
                }
            }
        }
        (addr, existed)
    }

    fn reset_node(&mut self, addr: StoreAddress) {
        let children: Vec<StoreAddress> = self
            .nodes
            .get(&addr)
            .map(|n| n.children.values().copied().collect())
            .unwrap_or_default();
        for child in children {
            self.remove_subtree(child);
        }
        if let Some(node) = self.nodes.get_mut(&addr) {
            node.children.clear();
            node.indexed = false;
            node.history.clear();
            node.key_expire_ns = 0;
            node.value_expire_ns = 0;
            node.metadata.clear();
            node.relationships = None;
        }
    }

    fn remove_subtree(&mut self, addr: StoreAddress) {
        let children: Vec<StoreAddress> = self
            .nodes
            .get(&addr)
            .map(|n| n.children.values().copied().collect())
            .unwrap_or_default();
        for child in children {
            self.remove_subtree(child);
        }
        if let Some(node) = self.nodes.remove(&addr) {
            if let Some(parent) = self.nodes.get_mut(&node.parent) {
                parent.children.remove(&node.segment);
            }
        }
    }

    fn path_of(&self, addr: StoreAddress) -> Vec<String> {
        let mut segments = Vec::new();
        let mut cur = addr;
        while cur != ROOT_ADDRESS {
            match self.nodes.get(&cur) {
                Some(node) => {
                    segments.push(node.segment.clone());
                    cur = node.parent;
                }
                None => break,
            }
        }
        segments.reverse();
        segments
    }

    /// DFS over indexed, unexpired keys whose full path matches the
    /// pattern. Children are visited in segment order.
    fn match_keys(&self, pattern: &[PatternSegment], now: i64) -> Vec<StoreAddress> {
        let mut out = Vec::new();
        self.match_walk(ROOT_ADDRESS, pattern, now, &mut out);
        out
    }

    fn match_walk(
        &self,
        addr: StoreAddress,
        pattern: &[PatternSegment],
        now: i64,
        out: &mut Vec<StoreAddress>,
    ) {
        let Some(node) = self.nodes.get(&addr) else {
            return;
        };
        if addr != ROOT_ADDRESS && node.key_expired(now) {
            return;
        }
        if pattern.is_empty() {
            if addr != ROOT_ADDRESS && node.indexed {
                out.push(addr);
            }
            return;
        }
        match &pattern[0] {
            PatternSegment::AnyDepth => {
                // zero segments consumed
                self.match_walk(addr, &pattern[1..], now, out);
                for child in node.children.values() {
                    // one-or-more segments consumed
                    self.match_walk(*child, pattern, now, out);
                }
            }
            seg => {
                for (name, child) in &node.children {
                    if seg.matches(name) {
                        self.match_walk(*child, &pattern[1..], now, out);
                    }
                }
            }
        }
    }

    fn key_match(&self, addr: StoreAddress, now: i64) -> KeyMatch {
        let node = &self.nodes[&addr];
        let value = node.current_value(now).cloned();
        KeyMatch {
            segments: self.path_of(addr),
            metadata: node.metadata.clone(),
            has_value: value.is_some(),
            has_children: !node.children.is_empty(),
            value,
            relationships: node.relationships.clone(),
        }
    }
}

pub struct TreeStore {
    state: RwLock<TreeState>,
    app_version: u32,
}

impl TreeStore {
    pub fn new(app_version: u32) -> Self {
        Self {
            state: RwLock::new(TreeState::new()),
            app_version,
        }
    }

    // ── Key operations ────────────────────────────────────────────────────────

    pub async fn set_key(&self, segments: &[String]) -> (StoreAddress, bool) {
        let now = now_ns();
        let mut state = self.state.write().await;
        let (addr, existed) = state.ensure(segments, now);
        let node = state.nodes.get_mut(&addr).expect("ensured node");
        let was_indexed = node.indexed;
        node.indexed = true;
        (addr, existed && was_indexed)
    }

    /// Set `segments` only when `test` names an existing key.
    pub async fn set_key_if_exists(
        &self,
        test: &[String],
        segments: &[String],
    ) -> (StoreAddress, bool) {
        let now = now_ns();
        let mut state = self.state.write().await;
        if state.find(test, now).is_none() {
            return (0, false);
        }
        let (addr, existed) = state.ensure(segments, now);
        let node = state.nodes.get_mut(&addr).expect("ensured node");
        let was_indexed = node.indexed;
        node.indexed = true;
        (addr, existed && was_indexed)
    }

    pub async fn locate_key(&self, segments: &[String]) -> Option<StoreAddress> {
        let state = self.state.read().await;
        state.find(segments, now_ns())
    }

    pub async fn is_key_indexed(&self, segments: &[String]) -> Option<StoreAddress> {
        let state = self.state.read().await;
        let addr = state.find(segments, now_ns())?;
        state.nodes.get(&addr).filter(|n| n.indexed).map(|n| n.address)
    }

    pub async fn key_from_address(&self, address: StoreAddress) -> Option<Vec<String>> {
        let state = self.state.read().await;
        let node = state.nodes.get(&address)?;
        if node.key_expired(now_ns()) {
            return None;
        }
        Some(state.path_of(address))
    }

    pub async fn key_value_from_address(
        &self,
        address: StoreAddress,
    ) -> Option<(Vec<String>, Option<NativeValue>)> {
        let now = now_ns();
        let state = self.state.read().await;
        let node = state.nodes.get(&address)?;
        if node.key_expired(now) {
            return None;
        }
        Some((state.path_of(address), node.current_value(now).cloned()))
    }

    /// Delete a childless key. Returns (key removed, value removed,
    /// original value).
    pub async fn delete_key(
        &self,
        segments: &[String],
    ) -> (bool, bool, Option<NativeValue>) {
        let now = now_ns();
        let mut state = self.state.write().await;
        let Some(addr) = state.find(segments, now) else {
            return (false, false, None);
        };
        if addr == ROOT_ADDRESS {
            return (false, false, None);
        }
        let node = &state.nodes[&addr];
        if !node.children.is_empty() {
            return (false, false, None);
        }
        let original = node.current_value(now).cloned();
        let had_value = original.is_some();
        state.remove_subtree(addr);
        (true, had_value, original)
    }

    /// Remove the value from a key; with `clean`, also delete the key
    /// and any ancestors left childless and valueless.
    pub async fn delete_key_with_value(
        &self,
        segments: &[String],
        clean: bool,
    ) -> (bool, Option<NativeValue>) {
        let now = now_ns();
        let mut state = self.state.write().await;
        let Some(addr) = state.find(segments, now) else {
            return (false, None);
        };
        let node = state.nodes.get_mut(&addr).expect("found node");
        let Some(original) = node.current_value(now).cloned() else {
            return (false, None);
        };
        node.history.push(ValueVersion { ts_ns: now, value: None });
        node.value_expire_ns = 0;
        if clean {
            let mut cur = addr;
            while cur != ROOT_ADDRESS {
                let node = &state.nodes[&cur];
                if !node.children.is_empty() || node.current_value(now).is_some() {
                    break;
                }
                let parent = node.parent;
                state.remove_subtree(cur);
                cur = parent;
            }
        }
        (true, Some(original))
    }

    pub async fn delete_key_tree(&self, segments: &[String]) -> bool {
        let now = now_ns();
        let mut state = self.state.write().await;
        let Some(addr) = state.find(segments, now) else {
            return false;
        };
        if addr == ROOT_ADDRESS {
            let children: Vec<StoreAddress> =
                state.nodes[&ROOT_ADDRESS].children.values().copied().collect();
            let any = !children.is_empty();
            for child in children {
                state.remove_subtree(child);
            }
            return any;
        }
        state.remove_subtree(addr);
        true
    }

    pub async fn move_key(
        &self,
        src: &[String],
        dest: &[String],
        overwrite: bool,
    ) -> (bool, bool) {
        let mut state = self.state.write().await;
        Self::move_in_state(&mut state, src, dest, overwrite)
    }

    pub async fn move_referenced_key(
        &self,
        src: &[String],
        dest: &[String],
        overwrite: bool,
        expire_ns: i64,
        refs: &[Vec<String>],
        unrefs: &[Vec<String>],
    ) -> (bool, bool) {
        let now = now_ns();
        let mut state = self.state.write().await;
        let (exists, moved) = Self::move_in_state(&mut state, src, dest, overwrite);
        if !moved {
            return (exists, moved);
        }
        let dest_addr = state.find(dest, now).expect("moved node");
        if expire_ns != 0 {
            if let Some(node) = state.nodes.get_mut(&dest_addr) {
                node.key_expire_ns = resolve_expire_ns(expire_ns);
            }
        }
        for ref_key in refs {
            let (addr, _) = state.ensure(ref_key, now);
            let node = state.nodes.get_mut(&addr).expect("ensured node");
            node.indexed = true;
            let rels = node.relationships.get_or_insert_with(Vec::new);
            if !rels.contains(&dest_addr) {
                rels.push(dest_addr);
            }
        }
        for unref_key in unrefs {
            if let Some(addr) = state.find(unref_key, now) {
                if let Some(node) = state.nodes.get_mut(&addr) {
                    if let Some(rels) = node.relationships.as_mut() {
                        rels.retain(|&a| a != dest_addr);
                    }
                }
            }
        }
        (exists, moved)
    }

    fn move_in_state(
        state: &mut TreeState,
        src: &[String],
        dest: &[String],
        overwrite: bool,
    ) -> (bool, bool) {
        let now = now_ns();
        let dest_exists = state.find(dest, now).is_some();
        let Some(src_addr) = state.find(src, now) else {
            return (dest_exists, false);
        };
        if src_addr == ROOT_ADDRESS || dest.is_empty() {
            return (dest_exists, false);
        }
        if dest_exists && !overwrite {
            return (true, false);
        }
        if dest_exists {
            let dest_addr = state.find(dest, now).expect("checked above");
            state.remove_subtree(dest_addr);
        }
        // detach the source node, then graft it under the destination parent
        let src_node = &state.nodes[&src_addr];
        let (src_parent, src_segment) = (src_node.parent, src_node.segment.clone());
        if let Some(parent) = state.nodes.get_mut(&src_parent) {
            parent.children.remove(&src_segment);
        }
        let (parent_path, leaf) = dest.split_at(dest.len() - 1);
        let (parent_addr, _) = state.ensure(parent_path, now);
        let leaf = leaf[0].clone();
        if let Some(parent) = state.nodes.get_mut(&parent_addr) {
            parent.children.insert(leaf.clone(), src_addr);
        }
        if let Some(node) = state.nodes.get_mut(&src_addr) {
            node.parent = parent_addr;
            node.segment = leaf;
            node.indexed = true;
        }
        (dest_exists, true)
    }

    // ── Value operations ──────────────────────────────────────────────────────

    pub async fn set_key_value(
        &self,
        segments: &[String],
        value: NativeValue,
    ) -> (StoreAddress, bool) {
        let now = now_ns();
        let mut state = self.state.write().await;
        let (addr, _) = state.ensure(segments, now);
        let node = state.nodes.get_mut(&addr).expect("ensured node");
        let first_value = node.history.is_empty();
        node.indexed = true;
        node.value_expire_ns = 0;
        node.history.push(ValueVersion { ts_ns: now, value: Some(value) });
        (addr, first_value)
    }

    pub async fn set_key_value_ex(
        &self,
        segments: &[String],
        value: Option<NativeValue>,
        flags: SetExFlags,
        expire_ns: i64,
        relationships: Option<Vec<StoreAddress>>,
    ) -> (StoreAddress, bool, Option<NativeValue>) {
        let now = now_ns();
        let mut state = self.state.write().await;
        let existing = state.find(segments, now);
        if flags.must_exist && existing.is_none() {
            return (0, false, None);
        }
        if flags.must_not_exist {
            if let Some(addr) = existing {
                return (addr, true, None);
            }
        }
        let exists = existing.is_some();
        let (addr, _) = state.ensure(segments, now);
        let node = state.nodes.get_mut(&addr).expect("ensured node");
        node.indexed = true;
        let original = node.current_value(now).cloned();
        if !flags.no_value_update {
            node.value_expire_ns = 0;
            node.history.push(ValueVersion { ts_ns: now, value });
        }
        if expire_ns != 0 {
            node.value_expire_ns = resolve_expire_ns(expire_ns);
        }
        if let Some(rels) = relationships {
            node.relationships = Some(rels);
        }
        (addr, exists, original)
    }

    /// Returns (value, key exists, value exists).
    pub async fn get_key_value(
        &self,
        segments: &[String],
    ) -> (Option<NativeValue>, bool, bool) {
        let now = now_ns();
        let state = self.state.read().await;
        match state.find(segments, now) {
            None => (None, false, false),
            Some(addr) => {
                let value = state.nodes[&addr].current_value(now).cloned();
                let has = value.is_some();
                (value, true, has)
            }
        }
    }

    pub async fn get_key_value_at_time(
        &self,
        segments: &[String],
        when_ns: i64,
    ) -> Option<NativeValue> {
        let now = now_ns();
        let when = if when_ns < 0 { now.saturating_add(when_ns) } else { when_ns };
        let state = self.state.read().await;
        let addr = state.find(segments, now)?;
        state.nodes[&addr].value_at(when).cloned()
    }

    /// Evaluate an arithmetic expression against the current value and
    /// store the result. `v` names the current value.
    pub async fn calculate_key_value(
        &self,
        segments: &[String],
        expression: &str,
    ) -> Option<(StoreAddress, NativeValue)> {
        let now = now_ns();
        let mut state = self.state.write().await;
        let current = state
            .find(segments, now)
            .and_then(|addr| state.nodes[&addr].current_value(now).cloned())
            .and_then(|v| v.as_f64());
        let result = eval_expression(expression, current)?;
        let value = NativeValue::from_numeric(result);
        let (addr, _) = state.ensure(segments, now);
        let node = state.nodes.get_mut(&addr).expect("ensured node");
        node.indexed = true;
        node.value_expire_ns = 0;
        node.history.push(ValueVersion { ts_ns: now, value: Some(value.clone()) });
        Some((addr, value))
    }

    // ── TTL operations ────────────────────────────────────────────────────────

    pub async fn get_key_ttl(&self, segments: &[String]) -> i64 {
        let state = self.state.read().await;
        match state.find(segments, now_ns()) {
            Some(addr) => state.nodes[&addr].key_expire_ns,
            None => 0,
        }
    }

    pub async fn set_key_ttl(&self, segments: &[String], ttl_ns: i64) -> bool {
        let mut state = self.state.write().await;
        match state.find(segments, now_ns()) {
            Some(addr) => {
                let node = state.nodes.get_mut(&addr).expect("found node");
                node.key_expire_ns = if ttl_ns == 0 { 0 } else { resolve_expire_ns(ttl_ns) };
                true
            }
            None => false,
        }
    }

    pub async fn get_key_value_ttl(&self, segments: &[String]) -> i64 {
        let state = self.state.read().await;
        match state.find(segments, now_ns()) {
            Some(addr) => state.nodes[&addr].value_expire_ns,
            None => 0,
        }
    }

    pub async fn set_key_value_ttl(&self, segments: &[String], ttl_ns: i64) -> bool {
        let mut state = self.state.write().await;
        match state.find(segments, now_ns()) {
            Some(addr) => {
                let node = state.nodes.get_mut(&addr).expect("found node");
                node.value_expire_ns = if ttl_ns == 0 { 0 } else { resolve_expire_ns(ttl_ns) };
                true
            }
            None => false,
        }
    }

    // ── Metadata operations ───────────────────────────────────────────────────

    pub async fn set_metadata_attribute(
        &self,
        segments: &[String],
        attribute: &str,
        value: &str,
    ) -> (bool, Option<String>) {
        let mut state = self.state.write().await;
        match state.find(segments, now_ns()) {
            None => (false, None),
            Some(addr) => {
                let node = state.nodes.get_mut(&addr).expect("found node");
                let prior = node.metadata.insert(attribute.to_string(), value.to_string());
                (true, prior)
            }
        }
    }

    pub async fn get_metadata_attribute(
        &self,
        segments: &[String],
        attribute: &str,
    ) -> Option<String> {
        let state = self.state.read().await;
        let addr = state.find(segments, now_ns())?;
        state.nodes[&addr].metadata.get(attribute).cloned()
    }

    pub async fn get_metadata_attributes(&self, segments: &[String]) -> Option<Vec<String>> {
        let state = self.state.read().await;
        let addr = state.find(segments, now_ns())?;
        Some(state.nodes[&addr].metadata.keys().cloned().collect())
    }

    pub async fn clear_metadata_attribute(
        &self,
        segments: &[String],
        attribute: &str,
    ) -> (bool, Option<String>) {
        let mut state = self.state.write().await;
        match state.find(segments, now_ns()) {
            None => (false, None),
            Some(addr) => {
                let node = state.nodes.get_mut(&addr).expect("found node");
                match node.metadata.remove(attribute) {
                    Some(prior) => (true, Some(prior)),
                    None => (false, None),
                }
            }
        }
    }

    pub async fn clear_key_metadata(&self, segments: &[String]) {
        let mut state = self.state.write().await;
        if let Some(addr) = state.find(segments, now_ns()) {
            state.nodes.get_mut(&addr).expect("found node").metadata.clear();
        }
    }

    // ── Enumeration ───────────────────────────────────────────────────────────

    pub async fn get_matching_keys(
        &self,
        pattern: &[PatternSegment],
        start: usize,
        limit: usize,
        leaves_only: bool,
    ) -> Vec<KeyMatch> {
        let now = now_ns();
        let state = self.state.read().await;
        state
            .match_keys(pattern, now)
            .into_iter()
            .map(|addr| state.key_match(addr, now))
            .filter(|m| !leaves_only || !m.has_children)
            .skip(start)
            .take(limit)
            .collect()
    }

    pub async fn get_matching_key_values(
        &self,
        pattern: &[PatternSegment],
        start: usize,
        limit: usize,
    ) -> Vec<KeyMatch> {
        let now = now_ns();
        let state = self.state.read().await;
        state
            .match_keys(pattern, now)
            .into_iter()
            .map(|addr| state.key_match(addr, now))
            .filter(|m| m.has_value)
            .skip(start)
            .take(limit)
            .collect()
    }

    /// Enumerate one level below a key, filtering segments with an
    /// in-segment glob. `None` when the key does not exist.
    pub async fn get_level_keys(
        &self,
        segments: &[String],
        pattern: &str,
        start: usize,
        limit: usize,
    ) -> Option<Vec<LevelKey>> {
        let now = now_ns();
        let state = self.state.read().await;
        let addr = state.find(segments, now)?;
        let glob = PatternSegment::Glob(pattern.to_string());
        let keys = state.nodes[&addr]
            .children
            .iter()
            .filter_map(|(name, child)| {
                let node = state.nodes.get(child)?;
                if node.key_expired(now) || !glob.matches(name) {
                    return None;
                }
                Some(LevelKey {
                    segment: name.clone(),
                    has_value: node.current_value(now).is_some(),
                    has_children: !node.children.is_empty(),
                })
            })
            .skip(start)
            .take(limit)
            .collect();
        Some(keys)
    }

    // ── Relationships ─────────────────────────────────────────────────────────

    /// Follow relationship `index` of a key. Returns whether the link
    /// slot exists and, when the linked key is live, its path and
    /// current value.
    pub async fn get_relationship_value(
        &self,
        segments: &[String],
        index: usize,
    ) -> (bool, Option<(Vec<String>, Option<NativeValue>)>) {
        let now = now_ns();
        let state = self.state.read().await;
        let Some(addr) = state.find(segments, now) else {
            return (false, None);
        };
        let Some(target) = state.nodes[&addr]
            .relationships
            .as_ref()
            .and_then(|rels| rels.get(index))
            .copied()
        else {
            return (false, None);
        };
        match state.nodes.get(&target) {
            Some(node) if !node.key_expired(now) => (
                true,
                Some((state.path_of(target), node.current_value(now).cloned())),
            ),
            _ => (true, None),
        }
    }

    // ── Auto-links ────────────────────────────────────────────────────────────

    pub async fn define_auto_link(
        &self,
        data_key: &str,
        link_key: &str,
        fields: Vec<String>,
    ) -> bool {
        let mut state = self.state.write().await;
        state
            .auto_links
            .insert(
                link_key.to_string(),
                AutoLinkDef { data_key: data_key.to_string(), fields },
            )
            .is_none()
    }

    pub async fn get_auto_link_definition(
        &self,
        link_key: &str,
    ) -> Option<(String, Vec<String>)> {
        let state = self.state.read().await;
        state
            .auto_links
            .get(link_key)
            .map(|def| (def.data_key.clone(), def.fields.clone()))
    }

    pub async fn remove_auto_link(&self, link_key: &str) -> bool {
        let mut state = self.state.write().await;
        state.auto_links.remove(link_key).is_some()
    }

    // ── JSON surface ──────────────────────────────────────────────────────────

    pub async fn export(&self, segments: &[String]) -> Option<serde_json::Value> {
        let now = now_ns();
        let state = self.state.read().await;
        let addr = state.find(segments, now)?;
        Some(export_node(&state, addr, now))
    }

    pub async fn import(
        &self,
        segments: &[String],
        data: &serde_json::Value,
    ) -> Result<(), String> {
        let now = now_ns();
        let mut state = self.state.write().await;
        let (addr, _) = state.ensure(segments, now);
        state.reset_node(addr);
        import_node(&mut state, addr, data, now)
    }

    pub async fn get_key_as_json(
        &self,
        segments: &[String],
        opts: JsonOptions,
    ) -> Option<serde_json::Value> {
        let now = now_ns();
        let state = self.state.read().await;
        let addr = state.find(segments, now)?;
        Some(node_to_json(&state, addr, opts, now))
    }

    /// Replace the subtree at `segments` with the JSON structure.
    /// Returns (whether a subtree was replaced, the key address).
    pub async fn set_key_json(
        &self,
        segments: &[String],
        data: &serde_json::Value,
        opts: JsonOptions,
    ) -> (bool, StoreAddress) {
        let now = now_ns();
        let mut state = self.state.write().await;
        let existed = state.find(segments, now).is_some();
        let (addr, _) = state.ensure(segments, now);
        state.reset_node(addr);
        if let Some(node) = state.nodes.get_mut(&addr) {
            node.indexed = true;
        }
        json_to_node(&mut state, addr, data, opts, now);
        (existed, addr)
    }

    pub async fn create_key_json(
        &self,
        segments: &[String],
        data: &serde_json::Value,
        opts: JsonOptions,
    ) -> Option<StoreAddress> {
        let now = now_ns();
        let mut state = self.state.write().await;
        if state.find(segments, now).is_some() {
            return None;
        }
        let (addr, _) = state.ensure(segments, now);
        if let Some(node) = state.nodes.get_mut(&addr) {
            node.indexed = true;
        }
        json_to_node(&mut state, addr, data, opts, now);
        Some(addr)
    }

    pub async fn replace_key_json(
        &self,
        segments: &[String],
        data: &serde_json::Value,
        opts: JsonOptions,
    ) -> Option<StoreAddress> {
        let now = now_ns();
        let mut state = self.state.write().await;
        let addr = state.find(segments, now)?;
        state.reset_node(addr);
        if let Some(node) = state.nodes.get_mut(&addr) {
            node.indexed = true;
        }
        json_to_node(&mut state, addr, data, opts, now);
        Some(addr)
    }

    pub async fn merge_key_json(
        &self,
        segments: &[String],
        data: &serde_json::Value,
        opts: JsonOptions,
    ) -> StoreAddress {
        let now = now_ns();
        let mut state = self.state.write().await;
        let (addr, _) = state.ensure(segments, now);
        if let Some(node) = state.nodes.get_mut(&addr) {
            node.indexed = true;
        }
        merge_json_into_node(&mut state, addr, data, opts, now);
        addr
    }

    /// Write JSON under a reserved unique staging key for a later move.
    pub async fn stage_key_json(
        &self,
        data: &serde_json::Value,
        opts: JsonOptions,
    ) -> (Vec<String>, StoreAddress) {
        let now = now_ns();
        let mut state = self.state.write().await;
        state.staged_counter += 1;
        let temp = vec!["staged".to_string(), state.staged_counter.to_string()];
        let (addr, _) = state.ensure(&temp, now);
        if let Some(node) = state.nodes.get_mut(&addr) {
            node.indexed = true;
        }
        json_to_node(&mut state, addr, data, opts, now);
        (temp, addr)
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Serialise the store to `path` atomically (write `<path>.tmp`,
    /// then rename).
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let state = self.state.read().await;
        let persisted = PersistedStore {
            app_version: self.app_version,
            next_address: state.next_address,
            root: persist_node(&state, ROOT_ADDRESS),
            auto_links: state.auto_links.clone(),
            staged_counter: state.staged_counter,
        };
        drop(state);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        bincode::serialize_into(&mut file, &persisted)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.flush()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Deserialise a store from `path`. Expired keys are dropped.
    pub async fn load(&self, path: &Path) -> io::Result<()> {
        let file = File::open(path)?;
        let persisted: PersistedStore = bincode::deserialize_from(file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        debug!(
            path = %path.display(),
            app_version = persisted.app_version,
            "loaded store snapshot"
        );

        let now = now_ns();
        let mut state = TreeState::new();
        state.next_address = persisted.next_address.max(ROOT_ADDRESS + 1);
        state.auto_links = persisted.auto_links;
        state.staged_counter = persisted.staged_counter;
        restore_node(&mut state, ROOT_ADDRESS, 0, &persisted.root, now);
        *self.state.write().await = state;
        Ok(())
    }
}

// ── Expression evaluator ──────────────────────────────────────────────────────

/// Tiny arithmetic grammar over f64: `+ - * /`, parentheses, unary
/// minus, numeric literals, and `v` for the key's current value.
fn eval_expression(expr: &str, current: Option<f64>) -> Option<f64> {
    let tokens: Vec<char> = expr.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pos = 0usize;
    let result = eval_sum(&tokens, &mut pos, current)?;
    if pos == tokens.len() { Some(result) } else { None }
}

fn eval_sum(t: &[char], pos: &mut usize, v: Option<f64>) -> Option<f64> {
    let mut acc = eval_product(t, pos, v)?;
    while let Some(&op) = t.get(*pos) {
        if op != '+' && op != '-' {
            break;
        }
        *pos += 1;
        let rhs = eval_product(t, pos, v)?;
        acc = if op == '+' { acc + rhs } else { acc - rhs };
    }
    Some(acc)
}

fn eval_product(t: &[char], pos: &mut usize, v: Option<f64>) -> Option<f64> {
    let mut acc = eval_atom(t, pos, v)?;
    while let Some(&op) = t.get(*pos) {
        if op != '*' && op != '/' {
            break;
        }
        *pos += 1;
        let rhs = eval_atom(t, pos, v)?;
        if op == '*' {
            acc *= rhs;
        } else {
            if rhs == 0.0 {
                return None;
            }
            acc /= rhs;
        }
    }
    Some(acc)
}

fn eval_atom(t: &[char], pos: &mut usize, v: Option<f64>) -> Option<f64> {
    match t.get(*pos) {
        Some('(') => {
            *pos += 1;
            let inner = eval_sum(t, pos, v)?;
            if t.get(*pos) != Some(&')') {
                return None;
            }
            *pos += 1;
            Some(inner)
        }
        Some('-') => {
            *pos += 1;
            Some(-eval_atom(t, pos, v)?)
        }
        Some('v') => {
            *pos += 1;
            v
        }
        Some(c) if c.is_ascii_digit() || *c == '.' => {
            let start = *pos;
            while let Some(c) = t.get(*pos) {
                if c.is_ascii_digit() || *c == '.' {
                    *pos += 1;
                } else {
                    break;
                }
            }
            t[start..*pos].iter().collect::<String>().parse().ok()
        }
        _ => None,
    }
}

// ── JSON conversion helpers ───────────────────────────────────────────────────

fn json_number(n: &serde_json::Number) -> NativeValue {
    if let Some(i) = n.as_i64() {
        NativeValue::Int64(i)
    } else {
        NativeValue::Float64(n.as_f64().unwrap_or(0.0))
    }
}

fn set_child(state: &mut TreeState, parent: StoreAddress, segment: &str) -> StoreAddress {
    let existing = state
        .nodes
        .get(&parent)
        .and_then(|n| n.children.get(segment))
        .copied();
    if let Some(addr) = existing {
        return addr;
    }
    let addr = state.alloc();
    let mut node = Node::new(addr, parent, segment.to_string());
    node.indexed = true;
    state.nodes.insert(addr, node);
    if let Some(p) = state.nodes.get_mut(&parent) {
        p.children.insert(segment.to_string(), addr);
    }
    addr
}

fn json_to_node(
    state: &mut TreeState,
    addr: StoreAddress,
    data: &serde_json::Value,
    opts: JsonOptions,
    now: i64,
) {
    match data {
        serde_json::Value::Object(map) => {
            for (key, child_data) in map {
                let child = set_child(state, addr, key);
                json_to_node(state, child, child_data, opts, now);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let child = set_child(state, addr, &i.to_string());
                json_to_node(state, child, item, opts, now);
            }
        }
        serde_json::Value::String(s) if opts.string_values_as_keys => {
            set_child(state, addr, s);
        }
        serde_json::Value::String(s) => {
            if let Some(node) = state.nodes.get_mut(&addr) {
                node.history.push(ValueVersion {
                    ts_ns: now,
                    value: Some(NativeValue::Str(s.clone())),
                });
            }
        }
        serde_json::Value::Number(n) => {
            if let Some(node) = state.nodes.get_mut(&addr) {
                node.history.push(ValueVersion { ts_ns: now, value: Some(json_number(n)) });
            }
        }
        serde_json::Value::Bool(b) => {
            if let Some(node) = state.nodes.get_mut(&addr) {
                node.history.push(ValueVersion {
                    ts_ns: now,
                    value: Some(NativeValue::Bool(*b)),
                });
            }
        }
        serde_json::Value::Null => {}
    }
}

fn merge_json_into_node(
    state: &mut TreeState,
    addr: StoreAddress,
    data: &serde_json::Value,
    opts: JsonOptions,
    now: i64,
) {
    match data {
        serde_json::Value::Object(map) => {
            for (key, child_data) in map {
                let child = set_child(state, addr, key);
                merge_json_into_node(state, child, child_data, opts, now);
            }
        }
        other => {
            // scalars and arrays overwrite in place
            state.reset_node(addr);
            if let Some(node) = state.nodes.get_mut(&addr) {
                node.indexed = true;
            }
            json_to_node(state, addr, other, opts, now);
        }
    }
}

fn node_to_json(
    state: &TreeState,
    addr: StoreAddress,
    opts: JsonOptions,
    now: i64,
) -> serde_json::Value {
    let node = &state.nodes[&addr];
    let live_children: Vec<(&String, StoreAddress)> = node
        .children
        .iter()
        .filter(|(_, child)| {
            state.nodes.get(child).is_some_and(|n| !n.key_expired(now))
        })
        .map(|(name, child)| (name, *child))
        .collect();

    if !live_children.is_empty() {
        if opts.string_values_as_keys
            && live_children.iter().all(|(_, child)| {
                let n = &state.nodes[child];
                n.children.is_empty() && n.current_value(now).is_none()
            })
        {
            if live_children.len() == 1 {
                return serde_json::Value::String(live_children[0].0.clone());
            }
            return serde_json::Value::Array(
                live_children
                    .iter()
                    .map(|(name, _)| serde_json::Value::String((*name).clone()))
                    .collect(),
            );
        }
        // children are keyed by decimal index, but the child map
        // orders names lexicographically ("10" before "2"); sort by
        // numeric value before deciding this is an array
        let mut numbered: Vec<(usize, StoreAddress)> = Vec::with_capacity(live_children.len());
        for (name, child) in &live_children {
            match name.parse::<usize>() {
                Ok(n) => numbered.push((n, *child)),
                Err(_) => {
                    numbered.clear();
                    break;
                }
            }
        }
        if !numbered.is_empty() {
            numbered.sort_unstable_by_key(|(n, _)| *n);
            if numbered.iter().enumerate().all(|(i, (n, _))| *n == i) {
                return serde_json::Value::Array(
                    numbered
                        .iter()
                        .map(|(_, child)| node_to_json(state, *child, opts, now))
                        .collect(),
                );
            }
        }
        let mut map = serde_json::Map::new();
        for (name, child) in live_children {
            map.insert(escape_segment(name), node_to_json(state, child, opts, now));
        }
        return serde_json::Value::Object(map);
    }

    match node.current_value(now) {
        Some(NativeValue::Str(s)) => serde_json::Value::String(s.clone()),
        Some(NativeValue::Bool(b)) => serde_json::Value::Bool(*b),
        Some(NativeValue::Json(v)) => v.clone(),
        Some(value) => match value.as_f64() {
            Some(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                serde_json::Value::from(n as i64)
            }
            Some(n) => serde_json::Value::from(n),
            None => {
                let (escaped, _) = value.encode();
                serde_json::Value::String(escaped)
            }
        },
        None => serde_json::Value::Null,
    }
}

fn export_node(state: &TreeState, addr: StoreAddress, now: i64) -> serde_json::Value {
    let node = &state.nodes[&addr];
    let mut map = serde_json::Map::new();
    if node.indexed {
        map.insert("indexed".into(), serde_json::Value::Bool(true));
    }
    if let Some(value) = node.current_value(now) {
        let (data, value_type) = value.encode();
        let mut vm = serde_json::Map::new();
        vm.insert("type".into(), serde_json::Value::String(value_type));
        vm.insert("data".into(), serde_json::Value::String(data));
        map.insert("value".into(), serde_json::Value::Object(vm));
    }
    if !node.metadata.is_empty() {
        map.insert(
            "metadata".into(),
            serde_json::Value::Object(
                node.metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect(),
            ),
        );
    }
    if node.key_expire_ns > 0 {
        map.insert("key_ttl".into(), serde_json::Value::from(node.key_expire_ns));
    }
    if node.value_expire_ns > 0 {
        map.insert("value_ttl".into(), serde_json::Value::from(node.value_expire_ns));
    }
    let mut children = serde_json::Map::new();
    for (name, child) in &node.children {
        let child_node = &state.nodes[child];
        if child_node.key_expired(now) {
            continue;
        }
        children.insert(escape_segment(name), export_node(state, *child, now));
    }
    if !children.is_empty() {
        map.insert("children".into(), serde_json::Value::Object(children));
    }
    serde_json::Value::Object(map)
}

fn import_node(
    state: &mut TreeState,
    addr: StoreAddress,
    data: &serde_json::Value,
    now: i64,
) -> Result<(), String> {
    let serde_json::Value::Object(map) = data else {
        return Err("import data must be an object".to_string());
    };
    let native = match map.get("value") {
        Some(value) => {
            let value_type = value
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let text = value.get("data").and_then(|v| v.as_str()).unwrap_or_default();
            let exact = crate::escape::value_unescape(text);
            Some(NativeValue::decode(&exact, value_type).map_err(|e| e.to_string())?)
        }
        None => None,
    };

    if let Some(node) = state.nodes.get_mut(&addr) {
        // the snapshot is authoritative: an absent flag means an
        // unindexed intermediate, overriding set_child's default
        node.indexed = map.get("indexed").and_then(|v| v.as_bool()).unwrap_or(false);
        if let Some(native) = native {
            node.history.push(ValueVersion { ts_ns: now, value: Some(native) });
        }
        if let Some(serde_json::Value::Object(meta)) = map.get("metadata") {
            for (k, v) in meta {
                if let Some(s) = v.as_str() {
                    node.metadata.insert(k.clone(), s.to_string());
                }
            }
        }
        if let Some(ttl) = map.get("key_ttl").and_then(|v| v.as_i64()) {
            node.key_expire_ns = ttl;
        }
        if let Some(ttl) = map.get("value_ttl").and_then(|v| v.as_i64()) {
            node.value_expire_ns = ttl;
        }
    }

    if let Some(serde_json::Value::Object(children)) = map.get("children") {
        for (name, child_data) in children {
            let segment = crate::escape::unescape_segment(name);
            let child = set_child(state, addr, &segment);
            import_node(state, child, child_data, now)?;
        }
    }
    Ok(())
}

// ── Serializable mirror types ─────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
enum PersistedValue {
    Bytes(Vec<u8>),
    Str(String),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Complex64(f32, f32),
    Complex128(f64, f64),
    /// JSON payloads persist as text; bincode cannot carry
    /// self-describing values.
    Json(String),
}

impl PersistedValue {
    fn from_native(v: &NativeValue) -> Self {
        match v {
            NativeValue::Bytes(b) => PersistedValue::Bytes(b.clone()),
            NativeValue::Str(s) => PersistedValue::Str(s.clone()),
            NativeValue::Int8(n) => PersistedValue::Int8(*n),
            NativeValue::Int16(n) => PersistedValue::Int16(*n),
            NativeValue::Int32(n) => PersistedValue::Int32(*n),
            NativeValue::Int64(n) => PersistedValue::Int64(*n),
            NativeValue::UInt8(n) => PersistedValue::UInt8(*n),
            NativeValue::UInt16(n) => PersistedValue::UInt16(*n),
            NativeValue::UInt32(n) => PersistedValue::UInt32(*n),
            NativeValue::UInt64(n) => PersistedValue::UInt64(*n),
            NativeValue::Float32(f) => PersistedValue::Float32(*f),
            NativeValue::Float64(f) => PersistedValue::Float64(*f),
            NativeValue::Bool(b) => PersistedValue::Bool(*b),
            NativeValue::Complex64(c) => PersistedValue::Complex64(c.re, c.im),
            NativeValue::Complex128(c) => PersistedValue::Complex128(c.re, c.im),
            NativeValue::Json(v) => PersistedValue::Json(v.to_string()),
        }
    }

    fn into_native(self) -> NativeValue {
        match self {
            PersistedValue::Bytes(b) => NativeValue::Bytes(b),
            PersistedValue::Str(s) => NativeValue::Str(s),
            PersistedValue::Int8(n) => NativeValue::Int8(n),
            PersistedValue::Int16(n) => NativeValue::Int16(n),
            PersistedValue::Int32(n) => NativeValue::Int32(n),
            PersistedValue::Int64(n) => NativeValue::Int64(n),
            PersistedValue::UInt8(n) => NativeValue::UInt8(n),
            PersistedValue::UInt16(n) => NativeValue::UInt16(n),
            PersistedValue::UInt32(n) => NativeValue::UInt32(n),
            PersistedValue::UInt64(n) => NativeValue::UInt64(n),
            PersistedValue::Float32(f) => NativeValue::Float32(f),
            PersistedValue::Float64(f) => NativeValue::Float64(f),
            PersistedValue::Bool(b) => NativeValue::Bool(b),
            PersistedValue::Complex64(re, im) => NativeValue::Complex64(Complex::new(re, im)),
            PersistedValue::Complex128(re, im) => NativeValue::Complex128(Complex::new(re, im)),
            PersistedValue::Json(s) => NativeValue::Json(
                serde_json::from_str(&s).unwrap_or(serde_json::Value::Null),
            ),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedNode {
    address: StoreAddress,
    segment: String,
    indexed: bool,
    history: Vec<(i64, Option<PersistedValue>)>,
    key_expire_ns: i64,
    value_expire_ns: i64,
    metadata: BTreeMap<String, String>,
    relationships: Option<Vec<StoreAddress>>,
    children: Vec<PersistedNode>,
}

#[derive(Serialize, Deserialize)]
struct PersistedStore {
    app_version: u32,
    next_address: StoreAddress,
    root: PersistedNode,
    auto_links: HashMap<String, AutoLinkDef>,
    staged_counter: u64,
}

fn persist_node(state: &TreeState, addr: StoreAddress) -> PersistedNode {
    let node = &state.nodes[&addr];
    PersistedNode {
        address: node.address,
        segment: node.segment.clone(),
        indexed: node.indexed,
        history: node
            .history
            .iter()
            .map(|v| (v.ts_ns, v.value.as_ref().map(PersistedValue::from_native)))
            .collect(),
        key_expire_ns: node.key_expire_ns,
        value_expire_ns: node.value_expire_ns,
        metadata: node.metadata.clone(),
        relationships: node.relationships.clone(),
        children: node
            .children
            .values()
            .map(|child| persist_node(state, *child))
            .collect(),
    }
}

fn restore_node(
    state: &mut TreeState,
    addr: StoreAddress,
    parent: StoreAddress,
    persisted: &PersistedNode,
    now: i64,
) {
    let mut node = Node::new(addr, parent, persisted.segment.clone());
    node.indexed = persisted.indexed;
    node.history = persisted
        .history
        .iter()
        .map(|(ts, v)| ValueVersion {
            ts_ns: *ts,
            value: v.as_ref().map(pv_clone),
        })
        .collect();
    node.key_expire_ns = persisted.key_expire_ns;
    node.value_expire_ns = persisted.value_expire_ns;
    node.metadata = persisted.metadata.clone();
    node.relationships = persisted.relationships.clone();
    for child in &persisted.children {
        if child.key_expire_ns > 0 && child.key_expire_ns <= now {
            continue;
        }
        node.children.insert(child.segment.clone(), child.address);
    }
    state.nodes.insert(addr, node);
    for child in &persisted.children {
        if child.key_expire_ns > 0 && child.key_expire_ns <= now {
            continue;
        }
        restore_node(state, child.address, addr, child, now);
    }
}

fn pv_clone(pv: &PersistedValue) -> NativeValue {
    // round-trip through the mirror to avoid a second Clone impl
    match pv {
        PersistedValue::Bytes(b) => NativeValue::Bytes(b.clone()),
        PersistedValue::Str(s) => NativeValue::Str(s.clone()),
        PersistedValue::Int8(n) => NativeValue::Int8(*n),
        PersistedValue::Int16(n) => NativeValue::Int16(*n),
        PersistedValue::Int32(n) => NativeValue::Int32(*n),
        PersistedValue::Int64(n) => NativeValue::Int64(*n),
        PersistedValue::UInt8(n) => NativeValue::UInt8(*n),
        PersistedValue::UInt16(n) => NativeValue::UInt16(*n),
        PersistedValue::UInt32(n) => NativeValue::UInt32(*n),
        PersistedValue::UInt64(n) => NativeValue::UInt64(*n),
        PersistedValue::Float32(f) => NativeValue::Float32(*f),
        PersistedValue::Float64(f) => NativeValue::Float64(*f),
        PersistedValue::Bool(b) => NativeValue::Bool(*b),
        PersistedValue::Complex64(re, im) => NativeValue::Complex64(Complex::new(*re, *im)),
        PersistedValue::Complex128(re, im) => NativeValue::Complex128(Complex::new(*re, *im)),
        PersistedValue::Json(s) => {
            NativeValue::Json(serde_json::from_str(s).unwrap_or(serde_json::Value::Null))
        }
    }
}

/// Escaped token path for a key, used by handlers building responses.
pub fn token_path(segments: &[String]) -> String {
    escape_token_path(segments)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::parse_token_pattern;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn segs(path: &str) -> Vec<String> {
        crate::escape::parse_token_path(path)
    }

    fn temp_path() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("treekv_tree_{}_{}.db", std::process::id(), n))
    }

    #[tokio::test]
    async fn set_key_assigns_sequential_addresses() {
        let ts = TreeStore::new(1);
        let (addr, exists) = ts.set_key(&segs("/client/test/key")).await;
        assert_eq!(addr, 4); // root is 1, three segments follow
        assert!(!exists);
        let (addr2, exists2) = ts.set_key(&segs("/client/test/key")).await;
        assert_eq!(addr2, 4);
        assert!(exists2);
    }

    #[tokio::test]
    async fn locate_finds_intermediate_but_index_does_not() {
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/a/b/c")).await;
        assert!(ts.locate_key(&segs("/a/b")).await.is_some());
        assert!(ts.is_key_indexed(&segs("/a/b")).await.is_none());
        assert!(ts.is_key_indexed(&segs("/a/b/c")).await.is_some());
    }

    #[tokio::test]
    async fn set_key_if_exists_requires_test_key() {
        let ts = TreeStore::new(1);
        let (addr, _) = ts.set_key_if_exists(&segs("/missing"), &segs("/x")).await;
        assert_eq!(addr, 0);
        ts.set_key(&segs("/present")).await;
        let (addr, _) = ts.set_key_if_exists(&segs("/present"), &segs("/x")).await;
        assert_ne!(addr, 0);
        assert!(ts.locate_key(&segs("/x")).await.is_some());
    }

    #[tokio::test]
    async fn value_round_trip_and_first_value() {
        let ts = TreeStore::new(1);
        let (_, first) = ts
            .set_key_value(&segs("/k"), NativeValue::Str("v1".into()))
            .await;
        assert!(first);
        let (_, first2) = ts
            .set_key_value(&segs("/k"), NativeValue::Str("v2".into()))
            .await;
        assert!(!first2);
        let (val, key_exists, val_exists) = ts.get_key_value(&segs("/k")).await;
        assert!(key_exists && val_exists);
        assert_eq!(val, Some(NativeValue::Str("v2".into())));
    }

    #[tokio::test]
    async fn value_history_is_queryable() {
        let ts = TreeStore::new(1);
        ts.set_key_value(&segs("/k"), NativeValue::Int64(1)).await;
        let between = now_ns();
        ts.set_key_value(&segs("/k"), NativeValue::Int64(2)).await;
        let old = ts.get_key_value_at_time(&segs("/k"), between).await;
        assert_eq!(old, Some(NativeValue::Int64(1)));
        let latest = ts.get_key_value_at_time(&segs("/k"), -0).await;
        // when 0 means the epoch; nothing was set then
        assert_eq!(latest, None);
    }

    #[tokio::test]
    async fn setex_must_not_exist_preserves_existing() {
        let ts = TreeStore::new(1);
        let flags = SetExFlags { must_not_exist: true, ..Default::default() };
        let (_, exists, _) = ts
            .set_key_value_ex(
                &segs("/x"),
                Some(NativeValue::Str("hello".into())),
                flags,
                0,
                None,
            )
            .await;
        assert!(!exists);
        let (_, exists, _) = ts
            .set_key_value_ex(
                &segs("/x"),
                Some(NativeValue::Str("other".into())),
                flags,
                0,
                None,
            )
            .await;
        assert!(exists);
        let (val, _, _) = ts.get_key_value(&segs("/x")).await;
        assert_eq!(val, Some(NativeValue::Str("hello".into())));
    }

    #[tokio::test]
    async fn setex_must_exist_refuses_missing() {
        let ts = TreeStore::new(1);
        let flags = SetExFlags { must_exist: true, ..Default::default() };
        let (addr, exists, _) = ts
            .set_key_value_ex(&segs("/nope"), Some(NativeValue::Int64(1)), flags, 0, None)
            .await;
        assert_eq!(addr, 0);
        assert!(!exists);
    }

    #[tokio::test]
    async fn expired_value_leaves_key_alive() {
        let ts = TreeStore::new(1);
        ts.set_key_value_ex(
            &segs("/x"),
            Some(NativeValue::Str("v".into())),
            SetExFlags::default(),
            now_ns() - 1, // already past
            None,
        )
        .await;
        let (val, key_exists, val_exists) = ts.get_key_value(&segs("/x")).await;
        assert!(key_exists);
        assert!(!val_exists);
        assert_eq!(val, None);
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/gone")).await;
        ts.set_key_ttl(&segs("/gone"), now_ns() - 1).await;
        assert!(ts.locate_key(&segs("/gone")).await.is_none());
    }

    #[tokio::test]
    async fn negative_ttl_is_relative() {
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/k")).await;
        let hour_ns = 3_600_000_000_000i64;
        assert!(ts.set_key_ttl(&segs("/k"), -hour_ns).await);
        let ttl = ts.get_key_ttl(&segs("/k")).await;
        assert!(ttl > now_ns());
    }

    #[tokio::test]
    async fn delete_key_refuses_parent() {
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/a/b")).await;
        let (removed, _, _) = ts.delete_key(&segs("/a")).await;
        assert!(!removed);
        let (removed, _, _) = ts.delete_key(&segs("/a/b")).await;
        assert!(removed);
    }

    #[tokio::test]
    async fn delete_key_with_value_clean_prunes_ancestors() {
        let ts = TreeStore::new(1);
        ts.set_key_value(&segs("/a/b/c"), NativeValue::Int64(9)).await;
        let (removed, original) = ts.delete_key_with_value(&segs("/a/b/c"), true).await;
        assert!(removed);
        assert_eq!(original, Some(NativeValue::Int64(9)));
        assert!(ts.locate_key(&segs("/a")).await.is_none());
    }

    #[tokio::test]
    async fn delete_tree_removes_subtree() {
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/a/b/c")).await;
        ts.set_key(&segs("/a/b/d")).await;
        assert!(ts.delete_key_tree(&segs("/a")).await);
        assert!(ts.locate_key(&segs("/a/b/c")).await.is_none());
        assert!(ts.locate_key(&segs("/a")).await.is_none());
    }

    #[tokio::test]
    async fn move_key_respects_overwrite() {
        let ts = TreeStore::new(1);
        ts.set_key_value(&segs("/src"), NativeValue::Int64(1)).await;
        ts.set_key_value(&segs("/dst"), NativeValue::Int64(2)).await;
        let (exists, moved) = ts.move_key(&segs("/src"), &segs("/dst"), false).await;
        assert!(exists && !moved);
        let (exists, moved) = ts.move_key(&segs("/src"), &segs("/dst"), true).await;
        assert!(exists && moved);
        let (val, _, _) = ts.get_key_value(&segs("/dst")).await;
        assert_eq!(val, Some(NativeValue::Int64(1)));
        assert!(ts.locate_key(&segs("/src")).await.is_none());
    }

    #[tokio::test]
    async fn move_referenced_key_links_refs() {
        let ts = TreeStore::new(1);
        ts.set_key_value(&segs("/src"), NativeValue::Int64(7)).await;
        let (_, moved) = ts
            .move_referenced_key(
                &segs("/src"),
                &segs("/dst"),
                false,
                0,
                &[segs("/index/byid")],
                &[],
            )
            .await;
        assert!(moved);
        let (has_link, linked) = ts.get_relationship_value(&segs("/index/byid"), 0).await;
        assert!(has_link);
        let (path, value) = linked.unwrap();
        assert_eq!(token_path(&path), "/dst");
        assert_eq!(value, Some(NativeValue::Int64(7)));
    }

    #[tokio::test]
    async fn metadata_set_get_clear() {
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/k")).await;
        let (key_exists, prior) = ts.set_metadata_attribute(&segs("/k"), "color", "red").await;
        assert!(key_exists);
        assert!(prior.is_none());
        let (_, prior) = ts.set_metadata_attribute(&segs("/k"), "color", "blue").await;
        assert_eq!(prior.as_deref(), Some("red"));
        assert_eq!(
            ts.get_metadata_attribute(&segs("/k"), "color").await.as_deref(),
            Some("blue")
        );
        assert_eq!(
            ts.get_metadata_attributes(&segs("/k")).await,
            Some(vec!["color".to_string()])
        );
        let (existed, original) = ts.clear_metadata_attribute(&segs("/k"), "color").await;
        assert!(existed);
        assert_eq!(original.as_deref(), Some("blue"));
        ts.clear_key_metadata(&segs("/k")).await;
        assert_eq!(ts.get_metadata_attributes(&segs("/k")).await, Some(vec![]));
    }

    #[tokio::test]
    async fn matching_returns_indexed_keys_in_order() {
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/client/test/key")).await;
        ts.set_key(&segs("/client/test/data/cat")).await;
        ts.set_key(&segs("/client/test/data/mouse")).await;
        let pat = parse_token_pattern("/client/**");
        let matches = ts.get_matching_keys(&pat, 0, 10000, false).await;
        let paths: Vec<String> = matches.iter().map(|m| token_path(&m.segments)).collect();
        assert_eq!(
            paths,
            vec!["/client/test/data/cat", "/client/test/data/mouse", "/client/test/key"]
        );
    }

    #[tokio::test]
    async fn matching_window_applies_start_and_limit() {
        let ts = TreeStore::new(1);
        for name in ["a", "b", "c", "d"] {
            ts.set_key(&segs(&format!("/k/{name}"))).await;
        }
        let pat = parse_token_pattern("/k/*");
        let matches = ts.get_matching_keys(&pat, 1, 2, false).await;
        let paths: Vec<String> = matches.iter().map(|m| token_path(&m.segments)).collect();
        assert_eq!(paths, vec!["/k/b", "/k/c"]);
    }

    #[tokio::test]
    async fn matching_key_values_needs_a_value() {
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/bare")).await;
        ts.set_key_value(&segs("/full"), NativeValue::Int64(1)).await;
        let pat = parse_token_pattern("/**");
        let matches = ts.get_matching_key_values(&pat, 0, 100).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(token_path(&matches[0].segments), "/full");
    }

    #[tokio::test]
    async fn level_keys_glob_and_flags() {
        let ts = TreeStore::new(1);
        ts.set_key_value(&segs("/p/apple"), NativeValue::Int64(1)).await;
        ts.set_key(&segs("/p/avocado/seed")).await;
        ts.set_key(&segs("/p/banana")).await;
        let keys = ts.get_level_keys(&segs("/p"), "a*", 0, 100).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].segment, "apple");
        assert!(keys[0].has_value);
        assert!(!keys[0].has_children);
        assert_eq!(keys[1].segment, "avocado");
        assert!(keys[1].has_children);
        assert!(ts.get_level_keys(&segs("/missing"), "*", 0, 1).await.is_none());
    }

    #[tokio::test]
    async fn calc_reads_and_writes_value() {
        let ts = TreeStore::new(1);
        ts.set_key_value(&segs("/n"), NativeValue::Int64(10)).await;
        let (_, value) = ts.calculate_key_value(&segs("/n"), "v * 2 + 1").await.unwrap();
        assert_eq!(value, NativeValue::Int64(21));
        assert!(ts.calculate_key_value(&segs("/n"), "v +").await.is_none());
    }

    #[test]
    fn expression_grammar() {
        assert_eq!(eval_expression("1 + 2 * 3", None), Some(7.0));
        assert_eq!(eval_expression("(1 + 2) * 3", None), Some(9.0));
        assert_eq!(eval_expression("-4 / 2", None), Some(-2.0));
        assert_eq!(eval_expression("v + 1", Some(5.0)), Some(6.0));
        assert_eq!(eval_expression("v", None), None);
        assert_eq!(eval_expression("1 / 0", None), None);
    }

    #[tokio::test]
    async fn json_set_and_get_round_trip() {
        let ts = TreeStore::new(1);
        let data: serde_json::Value =
            serde_json::from_str(r#"{"name":"cat","count":3,"tags":["a","b"]}"#).unwrap();
        let (replaced, _) = ts.set_key_json(&segs("/pet"), &data, JsonOptions::default()).await;
        assert!(!replaced);
        let back = ts.get_key_as_json(&segs("/pet"), JsonOptions::default()).await.unwrap();
        assert_eq!(back, data);
        let (replaced, _) = ts.set_key_json(&segs("/pet"), &data, JsonOptions::default()).await;
        assert!(replaced);
    }

    #[tokio::test]
    async fn json_long_array_round_trips_as_array() {
        let ts = TreeStore::new(1);
        // 12 elements: "10" and "11" sort before "2" in the child map
        let data = serde_json::json!({"items": (0..12).collect::<Vec<i64>>()});
        ts.set_key_json(&segs("/arr"), &data, JsonOptions::default()).await;
        let back = ts.get_key_as_json(&segs("/arr"), JsonOptions::default()).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn json_sparse_indices_stay_an_object() {
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/sparse/0")).await;
        ts.set_key_value(&segs("/sparse/2"), NativeValue::Int64(2)).await;
        let back = ts.get_key_as_json(&segs("/sparse"), JsonOptions::default()).await.unwrap();
        assert!(back.is_object(), "a gap in the indices is not an array");
    }

    #[tokio::test]
    async fn json_create_and_replace_preconditions() {
        let ts = TreeStore::new(1);
        let data = serde_json::json!({"a": 1});
        assert!(ts.create_key_json(&segs("/j"), &data, JsonOptions::default()).await.is_some());
        assert!(ts.create_key_json(&segs("/j"), &data, JsonOptions::default()).await.is_none());
        assert!(ts.replace_key_json(&segs("/j"), &data, JsonOptions::default()).await.is_some());
        assert!(ts.replace_key_json(&segs("/missing"), &data, JsonOptions::default()).await.is_none());
    }

    #[tokio::test]
    async fn json_merge_keeps_siblings() {
        let ts = TreeStore::new(1);
        ts.set_key_json(
            &segs("/m"),
            &serde_json::json!({"keep": 1, "change": 2}),
            JsonOptions::default(),
        )
        .await;
        ts.merge_key_json(
            &segs("/m"),
            &serde_json::json!({"change": 9, "new": 3}),
            JsonOptions::default(),
        )
        .await;
        let back = ts.get_key_as_json(&segs("/m"), JsonOptions::default()).await.unwrap();
        assert_eq!(back, serde_json::json!({"keep": 1, "change": 9, "new": 3}));
    }

    #[tokio::test]
    async fn json_string_values_as_keys() {
        let ts = TreeStore::new(1);
        let opts = JsonOptions { string_values_as_keys: true };
        ts.set_key_json(&segs("/s"), &serde_json::json!({"color": "red"}), opts).await;
        assert!(ts.locate_key(&segs("/s/color/red")).await.is_some());
        let back = ts.get_key_as_json(&segs("/s"), opts).await.unwrap();
        assert_eq!(back, serde_json::json!({"color": "red"}));
    }

    #[tokio::test]
    async fn stage_uses_unique_temp_keys() {
        let ts = TreeStore::new(1);
        let (p1, _) = ts.stage_key_json(&serde_json::json!({"a":1}), JsonOptions::default()).await;
        let (p2, _) = ts.stage_key_json(&serde_json::json!({"b":2}), JsonOptions::default()).await;
        assert_ne!(p1, p2);
        assert!(ts.locate_key(&p1).await.is_some());
    }

    #[tokio::test]
    async fn export_import_round_trip() {
        let ts = TreeStore::new(1);
        ts.set_key_value(&segs("/e/k"), NativeValue::Bytes(vec![0, 1, 255])).await;
        ts.set_metadata_attribute(&segs("/e/k"), "m", "1").await;
        let exported = ts.export(&segs("/e")).await.unwrap();

        let ts2 = TreeStore::new(1);
        ts2.import(&segs("/e"), &exported).await.unwrap();
        let (val, _, _) = ts2.get_key_value(&segs("/e/k")).await;
        assert_eq!(val, Some(NativeValue::Bytes(vec![0, 1, 255])));
        assert_eq!(
            ts2.get_metadata_attribute(&segs("/e/k"), "m").await.as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn import_keeps_intermediate_nodes_unindexed() {
        let ts = TreeStore::new(1);
        // /e/mid exists only as an ancestor of the real key
        ts.set_key_value(&segs("/e/mid/leaf"), NativeValue::Int64(1)).await;
        assert!(ts.is_key_indexed(&segs("/e/mid")).await.is_none());
        let exported = ts.export(&segs("/e")).await.unwrap();

        let ts2 = TreeStore::new(1);
        ts2.import(&segs("/e"), &exported).await.unwrap();
        assert!(ts2.is_key_indexed(&segs("/e/mid")).await.is_none());
        assert!(ts2.is_key_indexed(&segs("/e/mid/leaf")).await.is_some());

        // enumeration still skips the intermediate after the round trip
        let pat = parse_token_pattern("/e/**");
        let matches = ts2.get_matching_keys(&pat, 0, 100, false).await;
        let paths: Vec<String> = matches.iter().map(|m| token_path(&m.segments)).collect();
        assert_eq!(paths, vec!["/e/mid/leaf"]);
    }

    #[tokio::test]
    async fn auto_link_define_get_remove() {
        let ts = TreeStore::new(1);
        assert!(
            ts.define_auto_link("/data", "/index", vec!["id".to_string()]).await
        );
        let (data_key, fields) = ts.get_auto_link_definition("/index").await.unwrap();
        assert_eq!(data_key, "/data");
        assert_eq!(fields, vec!["id"]);
        assert!(ts.remove_auto_link("/index").await);
        assert!(!ts.remove_auto_link("/index").await);
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let path = temp_path();
        let ts = TreeStore::new(7);
        ts.set_key_value(&segs("/a/b"), NativeValue::Str("hello".into())).await;
        ts.set_metadata_attribute(&segs("/a/b"), "m", "v").await;
        let (addr_before, _) = ts.set_key(&segs("/a/b")).await;
        ts.save(&path).await.expect("save failed");

        let loaded = TreeStore::new(7);
        loaded.load(&path).await.expect("load failed");
        let (val, _, _) = loaded.get_key_value(&segs("/a/b")).await;
        assert_eq!(val, Some(NativeValue::Str("hello".into())));
        // addresses survive the round trip
        assert_eq!(loaded.locate_key(&segs("/a/b")).await, Some(addr_before));

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn load_drops_expired_keys() {
        let path = temp_path();
        let ts = TreeStore::new(1);
        ts.set_key(&segs("/live")).await;
        ts.set_key(&segs("/dead")).await;
        ts.set_key_ttl(&segs("/dead"), now_ns() + 50_000_000).await; // 50 ms
        ts.save(&path).await.expect("save failed");

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        let loaded = TreeStore::new(1);
        loaded.load(&path).await.expect("load failed");
        assert!(loaded.locate_key(&segs("/live")).await.is_some());
        assert!(loaded.locate_key(&segs("/dead")).await.is_none());

        let _ = fs::remove_file(&path);
    }
}
