//! B+Tree operations.
//!
//! Every operation works on a [`TreeState`] owned by the caller and reaches
//! pages through a [`Transaction`]. Mutations copy the root-to-leaf path into
//! the transaction before editing it, then split or merge pages on those
//! private copies, keeping the counters in the state in step.

use crate::btree::cursor::Cursor;
use crate::btree::TreeState;
use crate::error::{Result, StorageError};
use crate::page::{build_overflow_run, read_overflow_run, Node, NodeValue, TreePage};
use crate::txn::Transaction;
use crate::types::{
    overflow_pages_for, PageFlags, PageNumber, MAX_INLINE_VALUE_SIZE, MAX_KEY_SIZE,
    PAGE_HEADER_SIZE, PAGE_SIZE,
};

/// Pages using less than this are merged into a sibling
const MERGE_THRESHOLD: usize = PAGE_SIZE / 4;

/// Look up a key and return its value
pub fn get(tx: &Transaction<'_>, state: &TreeState, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let (cursor, found) = Cursor::seek(tx, state, key)?;
    if !found.exact {
        return Ok(None);
    }
    let (leaf, position) = cursor.leaf();
    let node = TreePage::new(tx.get_page(leaf)?.as_bytes())?.node(position)?;
    node_value(tx, node).map(Some)
}

/// Value of a leaf node, following an overflow reference
pub(crate) fn node_value(tx: &Transaction<'_>, node: Node) -> Result<Vec<u8>> {
    match node.value {
        NodeValue::Data(data) => Ok(data),
        NodeValue::Overflow { first_page, .. } => read_overflow_run(first_page, |page| tx.get_page(page)),
        NodeValue::Child(child) => Err(StorageError::corruption(format!(
            "expected a leaf node, found a reference to page {}",
            child
        ))),
    }
}

/// Insert or update a key-value pair
pub fn insert(
    tx: &mut Transaction<'_>,
    state: &mut TreeState,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(StorageError::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_SIZE,
        });
    }
    if value.len() > u32::MAX as usize {
        return Err(StorageError::invalid_operation(format!(
            "value of {} bytes is too large",
            value.len()
        )));
    }

    let (mut cursor, found) = Cursor::seek(tx, state, key)?;
    cursor.make_writable(tx, state)?;
    let (leaf, position) = cursor.leaf();

    if found.exact {
        let old = TreePage::new(tx.get_page(leaf)?.as_bytes())?.node(position)?;
        if let NodeValue::Overflow { first_page, size } = old.value {
            free_overflow(tx, state, first_page, size);
        }
        TreePage::new(tx.page_mut(leaf)?)?.remove_node(position)?;
    } else {
        state.entries += 1;
    }

    let node = if value.len() > MAX_INLINE_VALUE_SIZE {
        let first_page = write_overflow(tx, state, value)?;
        Node::overflow(key.to_vec(), first_page, value.len() as u64)
    } else {
        Node::data(key.to_vec(), value.to_vec())
    };

    let level = cursor.path.len() - 1;
    insert_at(tx, state, &cursor, level, position, node)
}

/// Insert `node` at `position` of the page at `level`, splitting upward
fn insert_at(
    tx: &mut Transaction<'_>,
    state: &mut TreeState,
    cursor: &Cursor,
    level: usize,
    position: usize,
    node: Node,
) -> Result<()> {
    let page_number = cursor.path[level].0;
    let (mut nodes, flags) = {
        let mut page = TreePage::new(tx.page_mut(page_number)?)?;
        if page.has_space_for(node.encoded_size())? {
            return page.insert_node(position, &node);
        }
        let flags = if page.is_leaf() {
            PageFlags::Leaf
        } else {
            PageFlags::Branch
        };
        (page.nodes()?, flags)
    };

    nodes.insert(position, node);
    let split_at = split_point(&nodes, flags)?;
    let mut right_nodes = nodes.split_off(split_at);
    let separator = right_nodes[0].key.clone();
    if flags == PageFlags::Branch {
        // The first key of a branch means "everything below the next key".
        right_nodes[0].key.clear();
    }

    fill_page(tx.page_mut(page_number)?, page_number, flags, &nodes)?;
    let right = tx.allocate_pages(1)?;
    fill_page(tx.page_mut(right)?, right, flags, &right_nodes)?;
    add_page(state, flags);

    if level == 0 {
        let root = tx.allocate_pages(1)?;
        let mut page = TreePage::init(tx.page_mut(root)?, root, PageFlags::Branch);
        page.insert_node(0, &Node::branch(Vec::new(), page_number))?;
        page.insert_node(1, &Node::branch(separator, right))?;
        state.root_page = root;
        state.depth += 1;
        add_page(state, PageFlags::Branch);
        return Ok(());
    }

    let parent_position = cursor.path[level - 1].1 + 1;
    insert_at(
        tx,
        state,
        cursor,
        level - 1,
        parent_position,
        Node::branch(separator, right),
    )
}

/// Index of the first node of the right half, balancing bytes between halves
fn split_point(nodes: &[Node], flags: PageFlags) -> Result<usize> {
    let capacity = PAGE_SIZE - PAGE_HEADER_SIZE;
    let sizes: Vec<usize> = nodes.iter().map(|n| n.encoded_size() + 2).collect();
    let total: usize = sizes.iter().sum();

    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for k in 1..nodes.len() {
        left += sizes[k - 1];
        let first_right = match (&nodes[k].value, flags) {
            (NodeValue::Child(child), PageFlags::Branch) => {
                Node::branch(Vec::new(), *child).encoded_size() + 2
            }
            _ => sizes[k],
        };
        let right = total - left - sizes[k] + first_right;
        if left > capacity || right > capacity {
            continue;
        }
        let imbalance = left.abs_diff(right);
        if best.map_or(true, |(_, b)| imbalance < b) {
            best = Some((k, imbalance));
        }
    }

    best.map(|(k, _)| k).ok_or_else(|| {
        StorageError::corruption(format!("no split point for {} nodes", nodes.len()))
    })
}

fn fill_page(
    buf: &mut crate::page::PageBuf,
    page_number: PageNumber,
    flags: PageFlags,
    nodes: &[Node],
) -> Result<()> {
    let mut page = TreePage::init(buf, page_number, flags);
    for (index, node) in nodes.iter().enumerate() {
        page.insert_node(index, node)?;
    }
    Ok(())
}

fn add_page(state: &mut TreeState, flags: PageFlags) {
    state.page_count += 1;
    match flags {
        PageFlags::Leaf => state.leaf_pages += 1,
        PageFlags::Branch => state.branch_pages += 1,
        PageFlags::Overflow => state.overflow_pages += 1,
    }
}

fn remove_page(state: &mut TreeState, is_leaf: bool) {
    state.page_count = state.page_count.saturating_sub(1);
    if is_leaf {
        state.leaf_pages = state.leaf_pages.saturating_sub(1);
    } else {
        state.branch_pages = state.branch_pages.saturating_sub(1);
    }
}

fn write_overflow(tx: &mut Transaction<'_>, state: &mut TreeState, value: &[u8]) -> Result<PageNumber> {
    let count = overflow_pages_for(value.len());
    let first = tx.allocate_pages(count)?;
    for (i, page) in build_overflow_run(first, value).into_iter().enumerate() {
        *tx.page_mut(first.offset(i as u64))? = page;
    }
    state.overflow_pages += count;
    state.page_count += count;
    Ok(first)
}

fn free_overflow(tx: &mut Transaction<'_>, state: &mut TreeState, first: PageNumber, size: u64) {
    let count = overflow_pages_for(size as usize);
    for i in 0..count {
        tx.free_page(first.offset(i));
    }
    state.overflow_pages = state.overflow_pages.saturating_sub(count);
    state.page_count = state.page_count.saturating_sub(count);
}

/// Delete a key from the tree
///
/// Returns true if the key was found and deleted. A miss copies nothing.
pub fn delete(tx: &mut Transaction<'_>, state: &mut TreeState, key: &[u8]) -> Result<bool> {
    let (mut cursor, found) = Cursor::seek(tx, state, key)?;
    if !found.exact {
        return Ok(false);
    }

    cursor.make_writable(tx, state)?;
    let (leaf, position) = cursor.leaf();
    let old = TreePage::new(tx.get_page(leaf)?.as_bytes())?.node(position)?;
    if let NodeValue::Overflow { first_page, size } = old.value {
        free_overflow(tx, state, first_page, size);
    }
    TreePage::new(tx.page_mut(leaf)?)?.remove_node(position)?;
    state.entries = state.entries.saturating_sub(1);

    let level = cursor.path.len() - 1;
    rebalance(tx, state, &cursor, level)?;
    Ok(true)
}

/// Restore page fill after a removal from the page at `level`
fn rebalance(
    tx: &mut Transaction<'_>,
    state: &mut TreeState,
    cursor: &Cursor,
    level: usize,
) -> Result<()> {
    if level == 0 {
        return collapse_root(tx, state);
    }

    let page_number = cursor.path[level].0;
    let (count, used, is_leaf) = {
        let buf = tx.get_page(page_number)?;
        let page = TreePage::new(buf.as_bytes())?;
        (page.count(), page.used_space()?, page.is_leaf())
    };
    let (parent, position) = cursor.path[level - 1];

    if count == 0 {
        tx.free_page(page_number);
        remove_page(state, is_leaf);
        remove_child(tx, parent, position)?;
        return rebalance(tx, state, cursor, level - 1);
    }
    if used >= MERGE_THRESHOLD {
        return Ok(());
    }

    let (left_index, right_index) = if position > 0 {
        (position - 1, position)
    } else {
        (0, 1)
    };
    let (left, right, separator) = {
        let buf = tx.get_page(parent)?;
        let page = TreePage::new(buf.as_bytes())?;
        if page.count() < 2 {
            return Ok(());
        }
        (
            page.child(left_index)?,
            page.child(right_index)?,
            page.key(right_index)?.to_vec(),
        )
    };

    let mut moved = TreePage::new(tx.get_page(right)?.as_bytes())?.nodes()?;
    if !is_leaf {
        if let Some(first) = moved.first_mut() {
            first.key = separator;
        }
    }
    let left_used = TreePage::new(tx.get_page(left)?.as_bytes())?.used_space()?;
    let extra: usize = moved.iter().map(|n| n.encoded_size() + 2).sum();
    if left_used + extra > PAGE_SIZE {
        return Ok(());
    }

    let left = tx.modify_page(Some((parent, left_index)), left)?;
    {
        let mut page = TreePage::new(tx.page_mut(left)?)?;
        let start = page.count();
        for (i, node) in moved.iter().enumerate() {
            page.insert_node(start + i, node)?;
        }
    }
    tx.free_page(right);
    remove_page(state, is_leaf);
    remove_child(tx, parent, right_index)?;

    rebalance(tx, state, cursor, level - 1)
}

/// Drop branch node `index`, keeping node 0's key empty
fn remove_child(tx: &mut Transaction<'_>, parent: PageNumber, index: usize) -> Result<()> {
    let mut page = TreePage::new(tx.page_mut(parent)?)?;
    page.remove_node(index)?;
    if index == 0 && page.count() > 0 {
        let child = page.child(0)?;
        page.replace_node(0, &Node::branch(Vec::new(), child))?;
    }
    Ok(())
}

/// Replace a root branch that has a single child by that child
fn collapse_root(tx: &mut Transaction<'_>, state: &mut TreeState) -> Result<()> {
    loop {
        let only_child = {
            let buf = tx.get_page(state.root_page)?;
            let page = TreePage::new(buf.as_bytes())?;
            if page.is_branch() && page.count() == 1 {
                Some(page.child(0)?)
            } else {
                None
            }
        };
        match only_child {
            Some(child) => {
                tx.free_page(state.root_page);
                remove_page(state, false);
                state.root_page = child;
                state.depth = state.depth.saturating_sub(1);
            }
            None => return Ok(()),
        }
    }
}

/// Free every page of the tree, overflow runs included
pub fn free_all(tx: &mut Transaction<'_>, state: &TreeState) -> Result<()> {
    let mut stack = vec![state.root_page];
    while let Some(page_number) = stack.pop() {
        let nodes = TreePage::new(tx.get_page(page_number)?.as_bytes())?.nodes()?;
        for node in nodes {
            match node.value {
                NodeValue::Child(child) => stack.push(child),
                NodeValue::Overflow { first_page, size } => {
                    for i in 0..overflow_pages_for(size as usize) {
                        tx.free_page(first_page.offset(i));
                    }
                }
                NodeValue::Data(_) => {}
            }
        }
        tx.free_page(page_number);
    }
    Ok(())
}
