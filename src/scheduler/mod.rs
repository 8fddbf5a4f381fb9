//! Bin-packing scheduler
//!
//! Matches queued placement requests to nodes using three fixed-size
//! tables (nodes, queue, running replicas). Tables are allocated once at
//! construction and never grow; an empty slot is marked by job id 0 (or an
//! absent node name). Running out of table space is a configuration error
//! and is reported as [`SchedulerError`].
//!
//! A pass places every replica of a queued entry or none of them. Nodes and
//! replicas carry a last-seen tick; anything not refreshed since the
//! current tick is dropped by [`Scheduler::prune_nodes`] and
//! [`Scheduler::prune_jobs`], returning its resources.

use std::fmt::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_NODES: usize = 1024;
pub const MAX_JOBS_IN_QUEUE: usize = MAX_NODES * 8;
pub const MAX_RUNNING_REPLICAS: usize = MAX_JOBS_IN_QUEUE;
pub const MAX_NODES_TO_CONSIDER: usize = 128;

const DUMP_STATE_EVERY: u64 = 10;

/// Job id marking an empty table slot
const EMPTY: u64 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Node table is full, cannot register '{0}'")]
    NodeTableFull(String),

    #[error("Queue is full, cannot enqueue job {0}")]
    QueueFull(u64),

    #[error("Replica table is full, cannot place job {0}")]
    ReplicaTableFull(u64),

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("Invalid request for job {0}: {1}")]
    InvalidRequest(u64, String),
}

/// Per-replica resource footprint, also used for node capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
    pub gpus: i64,
}

impl ResourceRequest {
    pub fn new(cpu_millis: i64, memory_bytes: i64, gpus: i64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            gpus,
        }
    }

    pub fn fits_within(&self, other: &ResourceRequest) -> bool {
        self.cpu_millis <= other.cpu_millis
            && self.memory_bytes <= other.memory_bytes
            && self.gpus <= other.gpus
    }
}

/// A replica placed on a node
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatedReplica<T> {
    pub job_id: u64,
    pub rank: u32,
    pub node: String,
    pub request: ResourceRequest,
    pub data: T,
}

/// Snapshot of one node's bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub name: String,
    pub node_type: String,
    pub remaining: ResourceRequest,
    pub capacity: ResourceRequest,
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub nodes: usize,
    pub queued: usize,
    pub running: usize,
    pub time: u64,
}

#[derive(Debug, Clone, Default)]
struct NodeEntry {
    node_type: String,
    remaining: ResourceRequest,
    capacity: ResourceRequest,
    last_seen: u64,
    unschedulable: bool,
}

#[derive(Debug, Clone)]
struct QueueEntry<T> {
    node_type: String,
    request: ResourceRequest,
    replicas: u32,
    data: Option<T>,
}

impl<T> Default for QueueEntry<T> {
    fn default() -> Self {
        Self {
            node_type: String::new(),
            request: ResourceRequest::default(),
            replicas: 0,
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ReplicaEntry<T> {
    rank: u32,
    node: usize,
    request: ResourceRequest,
    last_seen: u64,
    data: Option<T>,
}

impl<T> Default for ReplicaEntry<T> {
    fn default() -> Self {
        Self {
            rank: 0,
            node: 0,
            request: ResourceRequest::default(),
            last_seen: 0,
            data: None,
        }
    }
}

fn table<E: Default>(size: usize) -> Box<[E]> {
    (0..size).map(|_| E::default()).collect()
}

fn satisfies(node: &NodeEntry, node_type: &str, request: &ResourceRequest) -> bool {
    !node.unschedulable && node.node_type == node_type && request.fits_within(&node.remaining)
}

fn subtract(node: &mut NodeEntry, request: &ResourceRequest) {
    node.remaining.cpu_millis -= request.cpu_millis;
    node.remaining.memory_bytes -= request.memory_bytes;
    node.remaining.gpus -= request.gpus;
}

fn give_back(node: &mut NodeEntry, request: &ResourceRequest) {
    node.remaining.cpu_millis += request.cpu_millis;
    node.remaining.memory_bytes += request.memory_bytes;
    node.remaining.gpus += request.gpus;
}

/// Bin-packing scheduler over fixed-size tables. `T` is an opaque payload
/// handed back with every placement.
pub struct Scheduler<T> {
    node_names: Box<[Option<String>]>,
    nodes: Box<[NodeEntry]>,
    next_node_idx: usize,

    queue_ids: Box<[u64]>,
    queue: Box<[QueueEntry<T>]>,
    next_queue_idx: usize,
    queued: usize,

    replica_ids: Box<[u64]>,
    replicas: Box<[ReplicaEntry<T>]>,
    next_replica_idx: usize,
    running: usize,

    // Scratch space reused by every pass
    nodes_to_consider: Box<[usize]>,
    allocation: Vec<usize>,

    time: u64,
    dump_state_at: u64,
}

impl<T: Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            node_names: table(MAX_NODES),
            nodes: table(MAX_NODES),
            next_node_idx: 0,
            queue_ids: vec![EMPTY; MAX_JOBS_IN_QUEUE].into_boxed_slice(),
            queue: table(MAX_JOBS_IN_QUEUE),
            next_queue_idx: 0,
            queued: 0,
            replica_ids: vec![EMPTY; MAX_RUNNING_REPLICAS].into_boxed_slice(),
            replicas: table(MAX_RUNNING_REPLICAS),
            next_replica_idx: 0,
            running: 0,
            nodes_to_consider: vec![0; MAX_NODES_TO_CONSIDER].into_boxed_slice(),
            allocation: Vec::new(),
            time: 0,
            dump_state_at: 0,
        }
    }

    /// Current tick. Advanced by every [`schedule`](Self::schedule) pass.
    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            nodes: self.node_names.iter().filter(|n| n.is_some()).count(),
            queued: self.queued,
            running: self.running,
            time: self.time,
        }
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    fn node_index(&self, name: &str) -> Option<usize> {
        self.node_names
            .iter()
            .position(|n| n.as_deref() == Some(name))
    }

    /// Register a node, or refresh it if it is already known. Capacity is
    /// recorded on first registration only.
    pub fn register_node(
        &mut self,
        name: &str,
        node_type: &str,
        capacity: ResourceRequest,
        unschedulable: bool,
    ) -> Result<(), SchedulerError> {
        if let Some(idx) = self.node_index(name) {
            let node = &mut self.nodes[idx];
            node.last_seen = self.time;
            node.unschedulable = unschedulable;
            return Ok(());
        }

        let idx = (0..MAX_NODES)
            .map(|offset| (self.next_node_idx + offset) % MAX_NODES)
            .find(|&idx| self.node_names[idx].is_none())
            .ok_or_else(|| SchedulerError::NodeTableFull(name.to_string()))?;

        self.node_names[idx] = Some(name.to_string());
        self.nodes[idx] = NodeEntry {
            node_type: node_type.to_string(),
            remaining: capacity,
            capacity,
            last_seen: self.time,
            unschedulable,
        };
        self.next_node_idx = (idx + 1) % MAX_NODES;
        debug!("Registered node {} ({}) with {:?}", name, node_type, capacity);
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<NodeView> {
        self.node_index(name).map(|idx| self.node_view(idx))
    }

    pub fn nodes(&self) -> Vec<NodeView> {
        (0..MAX_NODES)
            .filter(|&idx| self.node_names[idx].is_some())
            .map(|idx| self.node_view(idx))
            .collect()
    }

    fn node_view(&self, idx: usize) -> NodeView {
        let node = &self.nodes[idx];
        NodeView {
            name: self.node_names[idx].clone().unwrap_or_default(),
            node_type: node.node_type.clone(),
            remaining: node.remaining,
            capacity: node.capacity,
            unschedulable: node.unschedulable,
        }
    }

    /// Drop nodes not registered since the current tick, along with any
    /// replicas placed on them. Remaining capacity of surviving nodes is
    /// recomputed from their replicas. Returns the names of dropped nodes.
    pub fn prune_nodes(&mut self) -> Vec<String> {
        let mut pruned = Vec::new();

        for idx in 0..MAX_NODES {
            if self.node_names[idx].is_none() || self.nodes[idx].last_seen == self.time {
                continue;
            }

            if let Some(name) = self.node_names[idx].take() {
                for r in 0..MAX_RUNNING_REPLICAS {
                    if self.replica_ids[r] != EMPTY && self.replicas[r].node == idx {
                        self.replica_ids[r] = EMPTY;
                        self.replicas[r].data = None;
                        self.running -= 1;
                    }
                }
                debug!("Pruned node {}", name);
                pruned.push(name);
            }
        }

        for idx in 0..MAX_NODES {
            if self.node_names[idx].is_none() {
                continue;
            }

            let mut expected = self.nodes[idx].capacity;
            for r in 0..MAX_RUNNING_REPLICAS {
                if self.replica_ids[r] != EMPTY && self.replicas[r].node == idx {
                    let req = self.replicas[r].request;
                    expected.cpu_millis -= req.cpu_millis;
                    expected.memory_bytes -= req.memory_bytes;
                    expected.gpus -= req.gpus;
                }
            }

            if expected != self.nodes[idx].remaining {
                warn!(
                    "Capacity drift on node {:?}: tracked {:?}, expected {:?}",
                    self.node_names[idx], self.nodes[idx].remaining, expected
                );
                self.nodes[idx].remaining = expected;
            }
        }

        pruned
    }

    // =========================================================================
    // Queue
    // =========================================================================

    fn queue_index(&self, job_id: u64) -> Option<usize> {
        self.queue_ids.iter().position(|&id| id == job_id)
    }

    /// Queue a placement request for `replicas` identical replicas. Queuing
    /// a job that is already queued replaces its entry.
    pub fn add_job_to_queue(
        &mut self,
        job_id: u64,
        node_type: &str,
        request: ResourceRequest,
        replicas: u32,
        data: T,
    ) -> Result<(), SchedulerError> {
        if job_id == EMPTY {
            return Err(SchedulerError::InvalidRequest(job_id, "job id 0 is reserved".into()));
        }
        if replicas == 0 {
            return Err(SchedulerError::InvalidRequest(job_id, "no replicas requested".into()));
        }

        let idx = match self.queue_index(job_id) {
            Some(idx) => idx,
            None => {
                let idx = (0..MAX_JOBS_IN_QUEUE)
                    .map(|offset| (self.next_queue_idx + offset) % MAX_JOBS_IN_QUEUE)
                    .find(|&idx| self.queue_ids[idx] == EMPTY)
                    .ok_or(SchedulerError::QueueFull(job_id))?;
                self.next_queue_idx = (idx + 1) % MAX_JOBS_IN_QUEUE;
                self.queued += 1;
                idx
            }
        };

        self.queue_ids[idx] = job_id;
        self.queue[idx] = QueueEntry {
            node_type: node_type.to_string(),
            request,
            replicas,
            data: Some(data),
        };
        Ok(())
    }

    pub fn is_job_in_queue(&self, job_id: u64) -> bool {
        job_id != EMPTY && self.queue_index(job_id).is_some()
    }

    /// Remove a queued request. Returns whether it was queued.
    pub fn remove_job_from_queue(&mut self, job_id: u64) -> bool {
        if job_id == EMPTY {
            return false;
        }
        match self.queue_index(job_id) {
            Some(idx) => {
                self.queue_ids[idx] = EMPTY;
                self.queue[idx].data = None;
                self.queued -= 1;
                true
            }
            None => false,
        }
    }

    pub fn jobs_in_queue(&self) -> Vec<u64> {
        self.queue_ids.iter().copied().filter(|&id| id != EMPTY).collect()
    }

    // =========================================================================
    // Running replicas
    // =========================================================================

    fn replica_index(&self, job_id: u64, rank: u32) -> Option<usize> {
        if job_id == EMPTY {
            return None;
        }
        (0..MAX_RUNNING_REPLICAS)
            .find(|&r| self.replica_ids[r] == job_id && self.replicas[r].rank == rank)
    }

    fn allocated(&self, idx: usize) -> Option<AllocatedReplica<T>> {
        let entry = &self.replicas[idx];
        Some(AllocatedReplica {
            job_id: self.replica_ids[idx],
            rank: entry.rank,
            node: self.node_names[entry.node].clone()?,
            request: entry.request,
            data: entry.data.clone()?,
        })
    }

    fn free_replica_slot(&mut self) -> Option<usize> {
        let idx = (0..MAX_RUNNING_REPLICAS)
            .map(|offset| (self.next_replica_idx + offset) % MAX_RUNNING_REPLICAS)
            .find(|&idx| self.replica_ids[idx] == EMPTY)?;
        self.next_replica_idx = (idx + 1) % MAX_RUNNING_REPLICAS;
        Some(idx)
    }

    /// Look up a running replica. With `touch` its last-seen tick is
    /// refreshed so the next [`prune_jobs`](Self::prune_jobs) keeps it.
    pub fn find_running_replica(
        &mut self,
        job_id: u64,
        rank: u32,
        touch: bool,
    ) -> Option<AllocatedReplica<T>> {
        let idx = self.replica_index(job_id, rank)?;
        if touch {
            self.replicas[idx].last_seen = self.time;
        }
        self.allocated(idx)
    }

    /// Record a replica that is already running on `node`, e.g. one found
    /// while resyncing with the cluster. A known replica is only touched.
    pub fn add_running_replica(
        &mut self,
        job_id: u64,
        rank: u32,
        request: ResourceRequest,
        node: &str,
        data: T,
    ) -> Result<(), SchedulerError> {
        if job_id == EMPTY {
            return Err(SchedulerError::InvalidRequest(job_id, "job id 0 is reserved".into()));
        }
        if let Some(idx) = self.replica_index(job_id, rank) {
            self.replicas[idx].last_seen = self.time;
            return Ok(());
        }

        let node_idx = self
            .node_index(node)
            .ok_or_else(|| SchedulerError::UnknownNode(node.to_string()))?;
        let idx = self
            .free_replica_slot()
            .ok_or(SchedulerError::ReplicaTableFull(job_id))?;

        self.replica_ids[idx] = job_id;
        self.replicas[idx] = ReplicaEntry {
            rank,
            node: node_idx,
            request,
            last_seen: self.time,
            data: Some(data),
        };
        self.running += 1;
        subtract(&mut self.nodes[node_idx], &request);
        Ok(())
    }

    pub fn running_replicas(&self) -> Vec<AllocatedReplica<T>> {
        (0..MAX_RUNNING_REPLICAS)
            .filter(|&idx| self.replica_ids[idx] != EMPTY)
            .filter_map(|idx| self.allocated(idx))
            .collect()
    }

    fn release_replica(&mut self, idx: usize) -> Option<AllocatedReplica<T>> {
        let released = self.allocated(idx);
        let entry = &mut self.replicas[idx];
        if self.node_names[entry.node].is_some() {
            give_back(&mut self.nodes[entry.node], &entry.request);
        }
        entry.data = None;
        self.replica_ids[idx] = EMPTY;
        self.running -= 1;
        released
    }

    /// Drop replicas not touched since the current tick and return their
    /// resources to their nodes.
    pub fn prune_jobs(&mut self) -> Vec<AllocatedReplica<T>> {
        let mut pruned = Vec::new();
        for idx in 0..MAX_RUNNING_REPLICAS {
            if self.replica_ids[idx] != EMPTY && self.replicas[idx].last_seen != self.time {
                if let Some(replica) = self.release_replica(idx) {
                    pruned.push(replica);
                }
            }
        }
        pruned
    }

    /// Remove every replica of a job (returning resources) and its queue
    /// entry, if any.
    pub fn remove_job(&mut self, job_id: u64) -> Vec<AllocatedReplica<T>> {
        let mut removed = Vec::new();
        if job_id == EMPTY {
            return removed;
        }
        for idx in 0..MAX_RUNNING_REPLICAS {
            if self.replica_ids[idx] == job_id {
                if let Some(replica) = self.release_replica(idx) {
                    removed.push(replica);
                }
            }
        }
        self.remove_job_from_queue(job_id);
        removed
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Run one scheduling pass and advance the tick.
    ///
    /// For each queued entry the satisfying nodes (up to
    /// [`MAX_NODES_TO_CONSIDER`]) are ordered smallest-first by gpu, cpu and
    /// memory, ties by table order. Replicas are assigned greedily to the
    /// first candidate that still fits, so one node may take several.
    /// Entries that cannot be fully placed are rolled back and stay queued.
    pub fn schedule(&mut self) -> Result<Vec<AllocatedReplica<T>>, SchedulerError> {
        let mut scheduled = Vec::new();

        for q in 0..MAX_JOBS_IN_QUEUE {
            let job_id = self.queue_ids[q];
            if job_id == EMPTY {
                continue;
            }

            let entry = &self.queue[q];
            let request = entry.request;
            let replicas = entry.replicas as usize;

            let mut considered = 0;
            for n in 0..MAX_NODES {
                if considered >= MAX_NODES_TO_CONSIDER {
                    break;
                }
                if self.node_names[n].is_some() && satisfies(&self.nodes[n], &entry.node_type, &request) {
                    self.nodes_to_consider[considered] = n;
                    considered += 1;
                }
            }

            if considered == 0 {
                continue;
            }

            let nodes = &self.nodes;
            self.nodes_to_consider[..considered].sort_unstable_by_key(|&n| {
                let r = &nodes[n].remaining;
                (r.gpus, r.cpu_millis, r.memory_bytes, n)
            });

            self.allocation.clear();
            'ranks: while self.allocation.len() < replicas {
                for c in 0..considered {
                    let n = self.nodes_to_consider[c];
                    if satisfies(&self.nodes[n], &entry.node_type, &request) {
                        subtract(&mut self.nodes[n], &request);
                        self.allocation.push(n);
                        continue 'ranks;
                    }
                }
                break;
            }

            let complete = self.allocation.len() == replicas;
            let room = MAX_RUNNING_REPLICAS - self.running >= replicas;
            if !complete || !room {
                for i in 0..self.allocation.len() {
                    let n = self.allocation[i];
                    give_back(&mut self.nodes[n], &request);
                }
                if !room {
                    return Err(SchedulerError::ReplicaTableFull(job_id));
                }
                continue;
            }

            let Some(data) = self.queue[q].data.take() else {
                warn!("Queue entry for job {} has no payload, dropping it", job_id);
                for i in 0..self.allocation.len() {
                    let n = self.allocation[i];
                    give_back(&mut self.nodes[n], &request);
                }
                self.queue_ids[q] = EMPTY;
                self.queued -= 1;
                continue;
            };

            for rank in 0..replicas {
                let n = self.allocation[rank];
                let slot = self
                    .free_replica_slot()
                    .ok_or(SchedulerError::ReplicaTableFull(job_id))?;
                self.replica_ids[slot] = job_id;
                self.replicas[slot] = ReplicaEntry {
                    rank: rank as u32,
                    node: n,
                    request,
                    last_seen: self.time,
                    data: Some(data.clone()),
                };
                self.running += 1;

                scheduled.push(AllocatedReplica {
                    job_id,
                    rank: rank as u32,
                    node: self.node_names[n].clone().unwrap_or_default(),
                    request,
                    data: data.clone(),
                });
            }

            self.queue_ids[q] = EMPTY;
            self.queued -= 1;
        }

        if self.time >= self.dump_state_at {
            self.dump_state_at += DUMP_STATE_EVERY;
            debug!("Scheduler state:\n{}", self.dump_state());
        }

        self.time += 1;
        Ok(scheduled)
    }

    /// Human readable dump of all three tables
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Current time: {}", self.time);

        let _ = writeln!(out, "Queue:");
        for idx in 0..MAX_JOBS_IN_QUEUE {
            let id = self.queue_ids[idx];
            if id == EMPTY {
                continue;
            }
            let e = &self.queue[idx];
            let _ = writeln!(
                out,
                "  job {} x{} on {}: {:?}",
                id, e.replicas, e.node_type, e.request
            );
        }

        let _ = writeln!(out, "Running (one line per rank):");
        for idx in 0..MAX_RUNNING_REPLICAS {
            let id = self.replica_ids[idx];
            if id == EMPTY {
                continue;
            }
            let e = &self.replicas[idx];
            let _ = writeln!(
                out,
                "  job {} rank {} on {}: {:?} (seen {})",
                id,
                e.rank,
                self.node_names[e.node].as_deref().unwrap_or("?"),
                e.request,
                e.last_seen
            );
        }

        let _ = writeln!(out, "Nodes:");
        for idx in 0..MAX_NODES {
            if let Some(name) = &self.node_names[idx] {
                let n = &self.nodes[idx];
                let _ = writeln!(
                    out,
                    "  {} ({}) remaining {:?} of {:?}{}",
                    name,
                    n.node_type,
                    n.remaining,
                    n.capacity,
                    if n.unschedulable { " [unschedulable]" } else { "" }
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GI: i64 = 1 << 30;

    fn small() -> ResourceRequest {
        ResourceRequest::new(1000, GI, 1)
    }

    #[test]
    fn test_register_node_twice_refreshes() {
        let mut s: Scheduler<()> = Scheduler::new();
        s.register_node("n1", "gpu", ResourceRequest::new(8000, 8 * GI, 8), false)
            .unwrap();
        s.register_node("n1", "gpu", ResourceRequest::new(1, 1, 1), true)
            .unwrap();

        let node = s.node("n1").unwrap();
        assert_eq!(node.capacity.gpus, 8);
        assert!(node.unschedulable);
        assert_eq!(s.stats().nodes, 1);
    }

    #[test]
    fn test_node_table_exhaustion_is_an_error() {
        let mut s: Scheduler<()> = Scheduler::new();
        for i in 0..MAX_NODES {
            s.register_node(&format!("n{i}"), "cpu", small(), false).unwrap();
        }
        assert_eq!(
            s.register_node("overflow", "cpu", small(), false),
            Err(SchedulerError::NodeTableFull("overflow".into()))
        );
    }

    #[test]
    fn test_prefers_smallest_node() {
        let mut s: Scheduler<&str> = Scheduler::new();
        s.register_node("big", "gpu", ResourceRequest::new(64000, 512 * GI, 8), false)
            .unwrap();
        s.register_node("small", "gpu", ResourceRequest::new(8000, 32 * GI, 2), false)
            .unwrap();

        s.add_job_to_queue(1, "gpu", small(), 1, "a").unwrap();
        let placed = s.schedule().unwrap();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].node, "small");
        assert_eq!(placed[0].data, "a");
    }

    #[test]
    fn test_type_and_unschedulable_are_respected() {
        let mut s: Scheduler<()> = Scheduler::new();
        s.register_node("cpu-node", "cpu", ResourceRequest::new(8000, 8 * GI, 8), false)
            .unwrap();
        s.register_node("cordoned", "gpu", ResourceRequest::new(8000, 8 * GI, 8), true)
            .unwrap();

        s.add_job_to_queue(1, "gpu", small(), 1, ()).unwrap();
        assert!(s.schedule().unwrap().is_empty());
        assert!(s.is_job_in_queue(1));
    }

    #[test]
    fn test_multi_replica_spills_to_next_node() {
        let mut s: Scheduler<()> = Scheduler::new();
        s.register_node("a", "gpu", ResourceRequest::new(2000, 2 * GI, 2), false)
            .unwrap();
        s.register_node("b", "gpu", ResourceRequest::new(4000, 4 * GI, 4), false)
            .unwrap();

        s.add_job_to_queue(9, "gpu", small(), 4, ()).unwrap();
        let placed = s.schedule().unwrap();
        assert_eq!(placed.len(), 4);
        let on_a = placed.iter().filter(|r| r.node == "a").count();
        assert_eq!(on_a, 2);
        let ranks: Vec<u32> = placed.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert!(!s.is_job_in_queue(9));
    }

    #[test]
    fn test_prune_nodes_drops_replicas_on_missing_nodes() {
        let mut s: Scheduler<()> = Scheduler::new();
        s.register_node("a", "gpu", ResourceRequest::new(8000, 8 * GI, 8), false)
            .unwrap();
        s.register_node("b", "gpu", ResourceRequest::new(8000, 8 * GI, 8), false)
            .unwrap();
        s.add_running_replica(5, 0, small(), "a", ()).unwrap();
        s.add_running_replica(6, 0, small(), "b", ()).unwrap();
        s.schedule().unwrap();

        // Only `b` is seen in the next scan
        s.register_node("b", "gpu", ResourceRequest::default(), false)
            .unwrap();
        let pruned = s.prune_nodes();

        assert_eq!(pruned, vec!["a".to_string()]);
        assert!(s.node("a").is_none());
        assert!(s.find_running_replica(5, 0, false).is_none());
        assert!(s.find_running_replica(6, 0, false).is_some());
        assert_eq!(s.node("b").unwrap().remaining.gpus, 7);
    }

    #[test]
    fn test_add_running_replica_on_unknown_node() {
        let mut s: Scheduler<()> = Scheduler::new();
        assert_eq!(
            s.add_running_replica(1, 0, small(), "ghost", ()),
            Err(SchedulerError::UnknownNode("ghost".into()))
        );
    }

    #[test]
    fn test_add_running_replica_twice_only_touches() {
        let mut s: Scheduler<()> = Scheduler::new();
        s.register_node("a", "gpu", ResourceRequest::new(8000, 8 * GI, 8), false)
            .unwrap();
        s.add_running_replica(1, 0, small(), "a", ()).unwrap();
        s.add_running_replica(1, 0, small(), "a", ()).unwrap();
        assert_eq!(s.node("a").unwrap().remaining.gpus, 7);
        assert_eq!(s.stats().running, 1);
    }

    #[test]
    fn test_remove_job_returns_resources_and_dequeues() {
        let mut s: Scheduler<()> = Scheduler::new();
        s.register_node("a", "gpu", ResourceRequest::new(8000, 8 * GI, 8), false)
            .unwrap();
        s.add_job_to_queue(3, "gpu", small(), 2, ()).unwrap();
        s.schedule().unwrap();
        assert_eq!(s.node("a").unwrap().remaining.gpus, 6);

        s.add_job_to_queue(4, "gpu", ResourceRequest::new(1000, GI, 100), 1, ())
            .unwrap();
        let removed = s.remove_job(3);
        assert_eq!(removed.len(), 2);
        assert_eq!(s.node("a").unwrap().remaining.gpus, 8);

        s.remove_job(4);
        assert!(!s.is_job_in_queue(4));
        assert_eq!(s.stats().queued, 0);
    }

    #[test]
    fn test_requeue_replaces_entry() {
        let mut s: Scheduler<u8> = Scheduler::new();
        s.add_job_to_queue(1, "gpu", small(), 1, 1).unwrap();
        s.add_job_to_queue(1, "gpu", small(), 2, 2).unwrap();
        assert_eq!(s.jobs_in_queue(), vec![1]);
        assert_eq!(s.stats().queued, 1);
    }

    #[test]
    fn test_reserved_job_id() {
        let mut s: Scheduler<()> = Scheduler::new();
        assert!(matches!(
            s.add_job_to_queue(0, "gpu", small(), 1, ()),
            Err(SchedulerError::InvalidRequest(0, _))
        ));
    }

    #[test]
    fn test_dump_state_mentions_everything() {
        let mut s: Scheduler<()> = Scheduler::new();
        s.register_node("a", "gpu", ResourceRequest::new(8000, 8 * GI, 8), false)
            .unwrap();
        s.add_job_to_queue(11, "gpu", small(), 1, ()).unwrap();
        let dump = s.dump_state();
        assert!(dump.contains("job 11"));
        assert!(dump.contains("a (gpu)"));
    }
}
