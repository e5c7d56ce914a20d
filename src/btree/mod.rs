//! Disk-backed B+ tree
//!
//! An ordered map from i32 keys to fixed-width string values, stored in
//! byte-formatted disk pages and accessed exclusively through the buffer
//! pool. It supports:
//! - Point lookups and in-place value updates
//! - Range scans (via the linked leaf chain)
//! - Lazy deletion (values are tombstoned, keys stay in place)
//! - Reopening a persisted tree from its meta page
//!
//! Every page fetched or allocated inside an operation is unpinned exactly
//! once before the operation returns, on error paths included; pages whose
//! bytes were mutated are unpinned dirty.

mod error;
mod node;

pub use error::{TreeError, TreeResult};
pub use node::{INTERNAL_MAX_KEYS, LEAF_MAX_ENTRIES, VALUE_SIZE};

use crate::storage::{BufferManager, INVALID_PAGE_ID, PageId};

use node::{InternalPage, LeafEntry, LeafPage, NodeKind};

/// Page reserved for tree metadata: it persists the root page id
pub const META_PAGE_ID: PageId = 0;

/// B+ tree over a buffer pool
pub struct BPlusTree {
    pool: BufferManager,
    /// Root page id, INVALID_PAGE_ID while the tree is empty
    root_page_id: PageId,
}

impl BPlusTree {
    /// Open a tree over the given buffer pool. A file that already holds
    /// pages has its root recovered from the meta page; an empty file
    /// starts as an empty tree.
    pub fn new(pool: BufferManager) -> TreeResult<Self> {
        let mut tree = Self {
            pool,
            root_page_id: INVALID_PAGE_ID,
        };
        tree.load_meta_page()?;
        Ok(tree)
    }

    /// Whether the tree holds no pages at all
    pub fn is_empty(&self) -> bool {
        self.root_page_id == INVALID_PAGE_ID
    }

    /// Look up a key. Tombstoned entries read as absent.
    pub fn search(&mut self, key: i32) -> TreeResult<Option<String>> {
        if self.is_empty() {
            return Ok(None);
        }

        let leaf_id = self.find_leaf_page(key)?;
        let leaf = LeafPage::new(self.pool.page_mut(leaf_id)?);
        let idx = leaf.find_key(key);

        let mut result = None;
        if idx < leaf.num_keys() && leaf.key_at(idx) == key {
            let value = leaf.value_at(idx);
            if value[0] != 0 {
                result = Some(node::unpack_value(value));
            }
        }

        self.pool.unpin_page(leaf_id, false);
        Ok(result)
    }

    /// Insert a key or overwrite the value of an existing key. Values
    /// longer than VALUE_SIZE - 1 bytes are truncated.
    pub fn insert(&mut self, key: i32, value: &str) -> TreeResult<()> {
        if self.is_empty() {
            return self.start_new_tree(key, value);
        }

        let leaf_id = self.find_leaf_page(key)?;

        // An existing key is overwritten in place and can never force a
        // split, so it must not be routed into one.
        let needs_split = {
            let leaf = LeafPage::new(self.pool.page_mut(leaf_id)?);
            let idx = leaf.find_key(key);
            let update = idx < leaf.num_keys() && leaf.key_at(idx) == key;
            !update && leaf.num_keys() >= LEAF_MAX_ENTRIES
        };

        let result = if needs_split {
            self.split_leaf(leaf_id, key, value)
        } else {
            LeafPage::new(self.pool.page_mut(leaf_id)?).insert(key, value);
            Ok(())
        };

        self.pool.unpin_page(leaf_id, true);
        result
    }

    /// Remove a key. The entry is tombstoned: its value bytes are zeroed
    /// while the key keeps its slot, so no rebalancing is ever needed.
    /// Returns false if the key was never inserted.
    pub fn remove(&mut self, key: i32) -> TreeResult<bool> {
        if self.is_empty() {
            return Ok(false);
        }

        let leaf_id = self.find_leaf_page(key)?;
        let mut leaf = LeafPage::new(self.pool.page_mut(leaf_id)?);
        let idx = leaf.find_key(key);

        if idx >= leaf.num_keys() || leaf.key_at(idx) != key {
            self.pool.unpin_page(leaf_id, false);
            return Ok(false);
        }

        leaf.clear_value(idx);
        self.pool.unpin_page(leaf_id, true);
        Ok(true)
    }

    /// Collect all live entries with keys in [start_key, end_key], in
    /// ascending key order
    pub fn scan(&mut self, start_key: i32, end_key: i32) -> TreeResult<Vec<(i32, String)>> {
        let mut results = Vec::new();
        if self.is_empty() {
            return Ok(results);
        }

        let mut leaf_id = self.find_leaf_page(start_key)?;
        let mut first_leaf = true;

        loop {
            let mut past_end = false;
            let next_id;
            {
                let leaf = LeafPage::new(self.pool.page_mut(leaf_id)?);

                // Later leaves are walked from their first entry
                let start_idx = if first_leaf {
                    leaf.find_key(start_key)
                } else {
                    0
                };
                first_leaf = false;

                for i in start_idx..leaf.num_keys() {
                    let key = leaf.key_at(i);
                    if key > end_key {
                        past_end = true;
                        break;
                    }
                    let value = leaf.value_at(i);
                    if key >= start_key && value[0] != 0 {
                        results.push((key, node::unpack_value(value)));
                    }
                }

                next_id = leaf.next();
            }

            self.pool.unpin_page(leaf_id, false);

            if past_end || next_id == INVALID_PAGE_ID {
                break;
            }
            self.pool.fetch_page(next_id)?;
            leaf_id = next_id;
        }

        Ok(results)
    }

    // ---- meta page ----

    fn load_meta_page(&mut self) -> TreeResult<()> {
        // A fresh file has no pages yet; the meta page appears together
        // with the first root.
        if self.pool.disk().num_pages() == 0 {
            return Ok(());
        }

        self.pool.fetch_page(META_PAGE_ID)?;
        let data = self.pool.page(META_PAGE_ID)?;
        self.root_page_id = i32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
        self.pool.unpin_page(META_PAGE_ID, false);
        Ok(())
    }

    /// Persist the current root page id to the meta page
    fn update_meta_page(&mut self) -> TreeResult<()> {
        self.pool.fetch_page(META_PAGE_ID)?;
        let data = self.pool.page_mut(META_PAGE_ID)?;
        data[0..4].copy_from_slice(&self.root_page_id.to_ne_bytes());
        self.pool.unpin_page(META_PAGE_ID, true);
        Ok(())
    }

    // ---- descent ----

    /// Descend to the leaf that owns `key`. The returned page is left
    /// pinned; the caller unpins it.
    fn find_leaf_page(&mut self, key: i32) -> TreeResult<PageId> {
        let mut page_id = self.root_page_id;
        self.pool.fetch_page(page_id)?;

        loop {
            let data = self.pool.page_mut(page_id)?;
            let child = match node::kind(data) {
                Some(NodeKind::Leaf) => None,
                Some(NodeKind::Internal) => Some(InternalPage::new(data).find_child(key)),
                _ => {
                    let raw = node::raw_kind(data);
                    self.pool.unpin_page(page_id, false);
                    return Err(TreeError::CorruptNode { page_id, raw });
                }
            };

            match child {
                None => return Ok(page_id),
                Some(child_id) => {
                    self.pool.unpin_page(page_id, false);
                    self.pool.fetch_page(child_id)?;
                    page_id = child_id;
                }
            }
        }
    }

    // ---- insertion machinery ----

    /// First insert into a fresh file: the meta page and the root leaf are
    /// allocated together, then the root id is persisted
    fn start_new_tree(&mut self, key: i32, value: &str) -> TreeResult<()> {
        let meta_id = self.pool.new_page()?;
        self.pool.unpin_page(meta_id, true);

        let root_id = self.pool.new_page()?;
        {
            let mut root = LeafPage::new(self.pool.page_mut(root_id)?);
            root.init(INVALID_PAGE_ID);
            root.insert(key, value);
        }

        self.root_page_id = root_id;
        let result = self.update_meta_page();
        self.pool.unpin_page(root_id, true);
        result
    }

    /// Split a full leaf while inserting a new key into it. The caller
    /// unpins the (left) leaf.
    fn split_leaf(&mut self, leaf_id: PageId, key: i32, value: &str) -> TreeResult<()> {
        // Merge the existing entries and the new one into sorted scratch
        // space; the key is new, so this holds LEAF_MAX_ENTRIES + 1 slots
        let (scratch, parent_id, old_next) = {
            let leaf = LeafPage::new(self.pool.page_mut(leaf_id)?);
            let n = leaf.num_keys();
            let idx = leaf.find_key(key);

            let mut scratch = Vec::with_capacity(n + 1);
            for i in 0..n {
                if i == idx {
                    scratch.push(LeafEntry::new(key, value));
                }
                scratch.push(leaf.entry(i));
            }
            if idx == n {
                scratch.push(LeafEntry::new(key, value));
            }

            (scratch, leaf.parent(), leaf.next())
        };

        let total = scratch.len();
        let split = total / 2;

        let new_leaf_id = self.pool.new_page()?;
        {
            let mut new_leaf = LeafPage::new(self.pool.page_mut(new_leaf_id)?);
            new_leaf.init(parent_id);
            new_leaf.set_next(old_next);
            for (i, entry) in scratch[split..].iter().enumerate() {
                new_leaf.write_entry(i, entry);
            }
            new_leaf.set_num_keys(total - split);
        }
        {
            let mut old_leaf = LeafPage::new(self.pool.page_mut(leaf_id)?);
            for (i, entry) in scratch[..split].iter().enumerate() {
                old_leaf.write_entry(i, entry);
            }
            old_leaf.set_num_keys(split);
            old_leaf.set_next(new_leaf_id);
        }

        // The right sibling's first key is copied up as the separator
        let middle_key = scratch[split].key;
        let result = self.insert_into_parent(leaf_id, middle_key, new_leaf_id);

        self.pool.unpin_page(new_leaf_id, true);
        result
    }

    /// Hook a freshly split-off right page into the parent of its left
    /// sibling, growing the tree at the root if necessary
    fn insert_into_parent(&mut self, left_id: PageId, key: i32, right_id: PageId) -> TreeResult<()> {
        let parent_id = node::parent(self.pool.page(left_id)?);
        if parent_id == INVALID_PAGE_ID {
            return self.create_new_root(left_id, key, right_id);
        }

        self.pool.fetch_page(parent_id)?;
        node::set_parent(self.pool.page_mut(right_id)?, parent_id);

        let has_room = {
            let parent = InternalPage::new(self.pool.page_mut(parent_id)?);
            parent.num_keys() < INTERNAL_MAX_KEYS
        };

        let result = if has_room {
            InternalPage::new(self.pool.page_mut(parent_id)?).insert(key, right_id);
            Ok(())
        } else {
            self.split_internal(parent_id, key, right_id)
        };

        self.pool.unpin_page(parent_id, true);
        result
    }

    /// Split a full internal node while inserting a separator into it. The
    /// caller unpins the (left) node.
    fn split_internal(
        &mut self,
        internal_id: PageId,
        key: i32,
        right_child_id: PageId,
    ) -> TreeResult<()> {
        let (scratch_keys, scratch_children, parent_id) = {
            let internal = InternalPage::new(self.pool.page_mut(internal_id)?);
            let n = internal.num_keys();

            let mut idx = 0;
            while idx < n && internal.key_at(idx) < key {
                idx += 1;
            }

            let mut scratch_keys = Vec::with_capacity(n + 1);
            for i in 0..n {
                if i == idx {
                    scratch_keys.push(key);
                }
                scratch_keys.push(internal.key_at(i));
            }
            if idx == n {
                scratch_keys.push(key);
            }

            // The new child sits immediately right of the new key
            let mut scratch_children = Vec::with_capacity(n + 2);
            for i in 0..=n {
                if i == idx + 1 {
                    scratch_children.push(right_child_id);
                }
                scratch_children.push(internal.child_at(i));
            }
            if idx == n {
                scratch_children.push(right_child_id);
            }

            (scratch_keys, scratch_children, internal.parent())
        };

        let total_keys = scratch_keys.len();
        let split = total_keys / 2;
        // The middle key moves up; it appears in neither half
        let middle_key = scratch_keys[split];
        let moved_keys = total_keys - split - 1;

        let new_id = self.pool.new_page()?;
        {
            let mut old = InternalPage::new(self.pool.page_mut(internal_id)?);
            for i in 0..split {
                old.set_key(i, scratch_keys[i]);
                old.set_child(i, scratch_children[i]);
            }
            old.set_child(split, scratch_children[split]);
            old.set_num_keys(split);
        }
        {
            let mut new = InternalPage::new(self.pool.page_mut(new_id)?);
            new.init(parent_id);
            for i in (split + 1)..total_keys {
                new.set_key(i - split - 1, scratch_keys[i]);
                new.set_child(i - split - 1, scratch_children[i]);
            }
            new.set_child(moved_keys, scratch_children[total_keys]);
            new.set_num_keys(moved_keys);
        }

        // Children that moved right now live under the new node; they are
        // visited one at a time, so only a single extra pin is ever held
        for &child_id in &scratch_children[split + 1..] {
            self.pool.fetch_page(child_id)?;
            node::set_parent(self.pool.page_mut(child_id)?, new_id);
            self.pool.unpin_page(child_id, true);
        }

        let result = self.insert_into_parent(internal_id, middle_key, new_id);

        self.pool.unpin_page(new_id, true);
        result
    }

    /// Grow the tree by one level: a new root holding one separator and
    /// the two freshly split pages
    fn create_new_root(&mut self, left_id: PageId, key: i32, right_id: PageId) -> TreeResult<()> {
        let root_id = self.pool.new_page()?;
        {
            let mut root = InternalPage::new(self.pool.page_mut(root_id)?);
            root.init(INVALID_PAGE_ID);
            root.set_key(0, key);
            root.set_child(0, left_id);
            root.set_child(1, right_id);
            root.set_num_keys(1);
        }

        node::set_parent(self.pool.page_mut(left_id)?, root_id);
        node::set_parent(self.pool.page_mut(right_id)?, root_id);

        self.root_page_id = root_id;
        let result = self.update_meta_page();
        self.pool.unpin_page(root_id, true);
        result
    }
}

impl Drop for BPlusTree {
    fn drop(&mut self) {
        // Make sure the root id reaches disk; the pool flushes the rest
        // when it is dropped right after
        let _ = self.pool.flush_page(META_PAGE_ID);
    }
}
