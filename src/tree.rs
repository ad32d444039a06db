//! Arena + index tree materialization
//!
//! Departments and permissions are stored as flat parent-pointer rows. Trees
//! are rebuilt from those rows on every read; nothing here is persisted.

use std::collections::{HashMap, HashSet};

use crate::entity::ROOT_ID;

/// A node that can be linked under its parent
pub trait TreeNode: Sized {
    fn id(&self) -> i64;
    fn parent_id(&self) -> i64;
    fn sequence(&self) -> i32;
    fn children(&self) -> &[Self];
    fn set_children(&mut self, children: Vec<Self>);
}

/// Build the forest whose roots have `parent_id == 0`
pub fn build_forest<N: TreeNode>(nodes: Vec<N>) -> Vec<N> {
    build_forest_from(nodes, |n| n.parent_id() == ROOT_ID)
}

/// Build the one-node forest rooted at `root_id` (empty if absent)
pub fn build_subtree<N: TreeNode>(nodes: Vec<N>, root_id: i64) -> Vec<N> {
    build_forest_from(nodes, |n| n.id() == root_id)
}

/// Build an ordered forest.
///
/// Pass one indexes nodes by id, pass two links every non-root node under its
/// parent, pass three sorts each sibling list by `(sequence, id)` while
/// assembling. Nodes whose parent is missing, or that are not reachable from
/// a root, are dropped.
pub fn build_forest_from<N, F>(nodes: Vec<N>, is_root: F) -> Vec<N>
where
    N: TreeNode,
    F: Fn(&N) -> bool,
{
    let mut index: HashMap<i64, usize> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        index.insert(node.id(), i);
    }

    let mut roots: Vec<usize> = Vec::new();
    let mut children: HashMap<i64, Vec<usize>> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        if is_root(node) {
            roots.push(i);
        } else if index.contains_key(&node.parent_id()) {
            children.entry(node.parent_id()).or_default().push(i);
        } else {
            tracing::debug!("Dropping orphan node {} (parent {})", node.id(), node.parent_id());
        }
    }

    let key = |i: &usize| (nodes[*i].sequence(), nodes[*i].id());
    roots.sort_by_key(key);
    for list in children.values_mut() {
        list.sort_by_key(key);
    }

    let mut arena: Vec<Option<N>> = nodes.into_iter().map(Some).collect();
    roots
        .into_iter()
        .filter_map(|i| assemble(i, &mut arena, &children))
        .collect()
}

// A node is taken out of the arena once, so corrupt cyclic input terminates.
fn assemble<N: TreeNode>(
    i: usize,
    arena: &mut [Option<N>],
    children: &HashMap<i64, Vec<usize>>,
) -> Option<N> {
    let mut node = arena[i].take()?;
    if let Some(list) = children.get(&node.id()) {
        let kids: Vec<N> = list
            .iter()
            .filter_map(|c| assemble(*c, arena, children))
            .collect();
        node.set_children(kids);
    }
    Some(node)
}

/// Ids of every descendant of `root_id`, excluding itself
pub fn descendant_ids(edges: &[(i64, i64)], root_id: i64) -> Vec<i64> {
    let mut by_parent: HashMap<i64, Vec<i64>> = HashMap::new();
    for (id, parent) in edges {
        by_parent.entry(*parent).or_default().push(*id);
    }

    let mut seen: HashSet<i64> = HashSet::from([root_id]);
    let mut queue = vec![root_id];
    let mut out = Vec::new();
    while let Some(current) = queue.pop() {
        if let Some(kids) = by_parent.get(&current) {
            for kid in kids {
                if seen.insert(*kid) {
                    out.push(*kid);
                    queue.push(*kid);
                }
            }
        }
    }
    out
}

/// Walk from `start` up to the root and report whether `needle` is met
/// (including `start` itself). Used to reject moves that would create a cycle.
pub fn ancestry_contains(parents: &HashMap<i64, i64>, start: i64, needle: i64) -> bool {
    let mut current = start;
    let mut seen = HashSet::new();
    while current != ROOT_ID {
        if current == needle {
            return true;
        }
        if !seen.insert(current) {
            // Already cyclic data; refuse to extend it
            return true;
        }
        match parents.get(&current) {
            Some(parent) => current = *parent,
            None => break,
        }
    }
    false
}

/// Depth-first visit of a forest
pub fn walk<N: TreeNode>(forest: &[N], visit: &mut impl FnMut(&N, usize)) {
    fn go<N: TreeNode>(nodes: &[N], depth: usize, visit: &mut impl FnMut(&N, usize)) {
        for node in nodes {
            visit(node, depth);
            go(node.children(), depth + 1, visit);
        }
    }
    go(forest, 0, visit);
}
