//! End-to-end scheduling scenarios against the bin-packing scheduler

use std::collections::BTreeMap;

use clusterjobs::scheduler::{ResourceRequest, Scheduler};
use proptest::prelude::*;

const GI: i64 = 1 << 30;

fn one_gpu() -> ResourceRequest {
    ResourceRequest::new(1000, GI, 1)
}

/// A node with room for five single-gpu jobs, and those five jobs queued
fn gpu_node_with_five_jobs() -> Scheduler<String> {
    let mut scheduler = Scheduler::new();
    scheduler
        .register_node("gpu-1", "gpu", ResourceRequest::new(8000, 8 * GI, 5), false)
        .unwrap();
    for id in 1..=5 {
        scheduler
            .add_job_to_queue(id, "gpu", one_gpu(), 1, format!("job-{id}"))
            .unwrap();
    }
    scheduler
}

#[test]
fn test_five_jobs_fill_the_node_and_sixth_waits() {
    let mut scheduler = gpu_node_with_five_jobs();
    scheduler.add_job_to_queue(6, "gpu", one_gpu(), 1, "job-6".into()).unwrap();

    let placed = scheduler.schedule().unwrap();

    assert_eq!(placed.len(), 5);
    assert!(placed.iter().all(|r| r.node == "gpu-1" && r.rank == 0));
    let node = scheduler.node("gpu-1").unwrap();
    assert_eq!(node.remaining.gpus, 0);
    assert!(scheduler.is_job_in_queue(6));
}

#[test]
fn test_pruned_replica_frees_room_for_queued_job() {
    let mut scheduler = Scheduler::new();
    scheduler
        .register_node("gpu-1", "gpu", ResourceRequest::new(8000, 8 * GI, 5), false)
        .unwrap();
    for id in 1..=6 {
        scheduler
            .add_job_to_queue(id, "gpu", one_gpu(), 1, format!("job-{id}"))
            .unwrap();
    }
    assert_eq!(scheduler.schedule().unwrap().len(), 5);
    assert!(scheduler.is_job_in_queue(6));

    for id in 1..=4 {
        assert!(scheduler.find_running_replica(id, 0, true).is_some());
    }
    let pruned = scheduler.prune_jobs();

    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].job_id, 5);
    assert_eq!(pruned[0].request, one_gpu());
    let node = scheduler.node("gpu-1").unwrap();
    assert_eq!(node.remaining, ResourceRequest::new(4000, 4 * GI, 1));

    let placed = scheduler.schedule().unwrap();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].job_id, 6);
    assert_eq!(placed[0].data, "job-6");
    assert_eq!(scheduler.node("gpu-1").unwrap().remaining.gpus, 0);
}

#[test]
fn test_group_that_does_not_fit_is_rolled_back() {
    let mut scheduler: Scheduler<String> = Scheduler::new();
    scheduler
        .register_node("gpu-1", "gpu", ResourceRequest::new(8000, 8 * GI, 1), false)
        .unwrap();
    let before = scheduler.node("gpu-1").unwrap().remaining;

    scheduler.add_job_to_queue(9, "gpu", one_gpu(), 2, "pair".into()).unwrap();
    let placed = scheduler.schedule().unwrap();

    assert!(placed.is_empty());
    assert_eq!(scheduler.node("gpu-1").unwrap().remaining, before);
    assert!(scheduler.is_job_in_queue(9));
    assert!(scheduler.running_replicas().is_empty());
}

#[test]
fn test_touching_between_scans_prevents_pruning() {
    let mut scheduler = gpu_node_with_five_jobs();
    scheduler.schedule().unwrap();

    // Next scan: node and every replica re-observed
    scheduler
        .register_node("gpu-1", "gpu", ResourceRequest::new(8000, 8 * GI, 5), false)
        .unwrap();
    for id in 1..=5 {
        scheduler.find_running_replica(id, 0, true);
    }

    assert!(scheduler.prune_nodes().is_empty());
    assert!(scheduler.prune_jobs().is_empty());
    assert_eq!(scheduler.running_replicas().len(), 5);

    // A pass without any observation drops everything
    scheduler.schedule().unwrap();
    assert_eq!(scheduler.prune_nodes(), vec!["gpu-1".to_string()]);
    assert!(scheduler.running_replicas().is_empty());
}

#[derive(Debug, Clone)]
enum Op {
    RegisterNode {
        index: u8,
        gpu_type: bool,
        capacity: ResourceRequest,
    },
    Enqueue {
        gpu_type: bool,
        request: ResourceRequest,
        replicas: u32,
    },
    Schedule,
}

fn node_type(gpu_type: bool) -> &'static str {
    if gpu_type {
        "gpu"
    } else {
        "cpu"
    }
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => (0u8..6, any::<bool>(), 1i64..=16, 1i64..=16, 0i64..5).prop_map(
            |(index, gpu_type, cpu, mem, gpus)| Op::RegisterNode {
                index,
                gpu_type,
                capacity: ResourceRequest::new(1000 * cpu, GI * mem, gpus),
            }
        ),
        2 => (any::<bool>(), 1i64..=8, 1i64..=4, 0i64..2, 1u32..=3).prop_map(
            |(gpu_type, cpu, mem, gpus, replicas)| Op::Enqueue {
                gpu_type,
                request: ResourceRequest::new(250 * cpu, GI / 2 * mem, gpus),
                replicas,
            }
        ),
        1 => Just(Op::Schedule),
    ]
}

proptest! {
    #[test]
    fn test_allocations_never_exceed_capacity(ops in prop::collection::vec(arb_op(), 1..200)) {
        let mut scheduler: Scheduler<usize> = Scheduler::new();
        let mut next_job = 1;

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::RegisterNode { index, gpu_type, capacity } => {
                    let name = format!("node-{index}");
                    scheduler
                        .register_node(&name, node_type(gpu_type), capacity, false)
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                }
                Op::Enqueue { gpu_type, request, replicas } => {
                    scheduler
                        .add_job_to_queue(next_job, node_type(gpu_type), request, replicas, step)
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                    next_job += 1;
                }
                Op::Schedule => {
                    let placed = scheduler
                        .schedule()
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                    let mut by_job = BTreeMap::new();
                    for replica in &placed {
                        let (count, max_rank) = by_job.entry(replica.job_id).or_insert((0u32, 0u32));
                        *count += 1;
                        *max_rank = (*max_rank).max(replica.rank);
                    }
                    for (job_id, (count, max_rank)) in by_job {
                        prop_assert_eq!(count, max_rank + 1, "job {} was partially placed", job_id);
                    }
                }
            }

            let running = scheduler.running_replicas();
            for node in scheduler.nodes() {
                let mut used = ResourceRequest::default();
                for replica in running.iter().filter(|r| r.node == node.name) {
                    used.cpu_millis += replica.request.cpu_millis;
                    used.memory_bytes += replica.request.memory_bytes;
                    used.gpus += replica.request.gpus;
                }
                prop_assert!(
                    used.fits_within(&node.capacity),
                    "{} over capacity: {:?} > {:?}",
                    node.name,
                    used,
                    node.capacity
                );
                prop_assert!(node.remaining.cpu_millis >= 0);
                prop_assert!(node.remaining.memory_bytes >= 0);
                prop_assert!(node.remaining.gpus >= 0);
            }
        }
    }
}
