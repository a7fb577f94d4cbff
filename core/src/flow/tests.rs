//! Tests for history storage and graph walks

use super::graph::{enclosing_blocks, is_within};
use super::*;
use tempfile::TempDir;

fn node(id: u64, parents: &[u64], kind: NodeKind) -> FlowNode {
    FlowNode::new(NodeId(id), parents.iter().map(|p| NodeId(*p)).collect(), kind)
}

fn locked(nodes: &[FlowNode]) -> (TempDir, LockedStorage) {
    let dir = TempDir::new().unwrap();
    let mut storage = BulkNodeStorage::fresh(dir.path().join("nodes.json"));
    for n in nodes {
        storage.store(n, false).unwrap();
    }
    (dir, LockedStorage::new(Box::new(storage)))
}

// ============================================================================
// Per-node storage
// ============================================================================

#[test]
fn test_node_file_storage_writes_immediately() {
    let dir = TempDir::new().unwrap();
    let mut storage = NodeFileStorage::open(dir.path().join("nodes")).unwrap();
    storage.store(&node(1, &[], NodeKind::FlowStart), false).unwrap();

    assert!(dir.path().join("nodes/1.json").exists());

    let reopened = NodeFileStorage::open(dir.path().join("nodes")).unwrap();
    assert_eq!(reopened.get(NodeId(1)).unwrap().unwrap().kind, NodeKind::FlowStart);
}

#[test]
fn test_deferred_writes_wait_for_autopersist() {
    let dir = TempDir::new().unwrap();
    let mut storage = NodeFileStorage::open(dir.path().join("nodes")).unwrap();
    storage.store(&node(2, &[1], NodeKind::Atom), true).unwrap();
    storage
        .save_actions(NodeId(2), vec![NodeAction::new("log", serde_json::json!("hi"))])
        .unwrap();

    let path = dir.path().join("nodes/2.json");
    assert!(!path.exists());
    assert_eq!(storage.load_actions(NodeId(2)).unwrap().len(), 1);

    storage.autopersist(NodeId(2)).unwrap();
    assert!(path.exists());

    let reopened = NodeFileStorage::open(dir.path().join("nodes")).unwrap();
    assert_eq!(reopened.load_actions(NodeId(2)).unwrap()[0].kind, "log");
}

#[test]
fn test_flush_writes_deferred_nodes() {
    let dir = TempDir::new().unwrap();
    let mut storage = NodeFileStorage::open(dir.path().join("nodes")).unwrap();
    storage.store(&node(1, &[], NodeKind::FlowStart), true).unwrap();
    storage.store(&node(2, &[1], NodeKind::Atom), true).unwrap();
    storage.flush().unwrap();

    let reopened = NodeFileStorage::open(dir.path().join("nodes")).unwrap();
    assert_eq!(reopened.nodes().unwrap().len(), 2);
}

// ============================================================================
// Bulk storage
// ============================================================================

#[test]
fn test_bulk_storage_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nodes.json");
    let mut storage = BulkNodeStorage::fresh(&path);
    storage.store(&node(1, &[], NodeKind::FlowStart), false).unwrap();
    assert!(!path.exists());
    storage.flush().unwrap();

    let reopened = BulkNodeStorage::open(&path).unwrap();
    assert_eq!(reopened.nodes().unwrap().len(), 1);
}

#[test]
fn test_locked_storage_swap() {
    let (dir, storage) = locked(&[node(1, &[], NodeKind::FlowStart)]);
    assert_eq!(storage.kind(), StorageKind::Bulk);

    let per_node = NodeFileStorage::open(dir.path().join("nodes")).unwrap();
    let previous = storage.swap(Box::new(per_node));
    assert_eq!(previous.nodes().unwrap().len(), 1);
    assert_eq!(storage.kind(), StorageKind::PerNode);
    assert!(storage.get(NodeId(1)).unwrap().is_none());
}

// ============================================================================
// Graph
// ============================================================================

#[test]
fn test_enclosing_blocks_skip_closed_blocks() {
    // 1 start, 2 stage {, 3 echo, 4 }, 5 parallel {, 6 branch {, 7 wait
    let (_dir, storage) = locked(&[
        node(1, &[], NodeKind::FlowStart),
        node(2, &[1], NodeKind::BlockStart { body: true }),
        node(3, &[2], NodeKind::Atom),
        node(4, &[3], NodeKind::BlockEnd { start: NodeId(2) }),
        node(5, &[4], NodeKind::BlockStart { body: false }),
        node(6, &[5], NodeKind::BlockStart { body: true }),
        node(7, &[6], NodeKind::Atom),
    ]);

    let blocks = enclosing_blocks(&storage, NodeId(7)).unwrap();
    assert_eq!(blocks, vec![NodeId(6), NodeId(5)]);

    assert!(is_within(&storage, NodeId(7), NodeId(6)).unwrap());
    assert!(!is_within(&storage, NodeId(7), NodeId(2)).unwrap());
    assert!(is_within(&storage, NodeId(6), NodeId(6)).unwrap());
}

#[test]
fn test_missing_node_is_an_error() {
    let (_dir, storage) = locked(&[node(2, &[1], NodeKind::Atom)]);
    assert!(enclosing_blocks(&storage, NodeId(2)).is_err());
}

#[test]
fn test_result_combine_keeps_worse() {
    assert_eq!(FlowResult::Success.combine(FlowResult::Failure), FlowResult::Failure);
    assert_eq!(FlowResult::Aborted.combine(FlowResult::Failure), FlowResult::Aborted);
    assert!(FlowResult::NotBuilt.is_worse_or_equal(FlowResult::Failure));
}
