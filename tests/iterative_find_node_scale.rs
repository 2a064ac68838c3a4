#[path = "common/mod.rs"]
mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{test_config, NetworkRegistry, TestNode};
use futures::stream::{self, StreamExt};
use kadmesh::{xor_distance, NodeId};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use serde::Serialize;
use tokio::sync::Mutex;

const NODE_COUNT: usize = 256;
const K_PARAM: usize = 20;
const ALPHA_PARAM: usize = 3;
const RING_NEIGHBORS: usize = 3;
const RANDOM_CONTACTS: usize = 12;
const TARGET_SAMPLES: usize = 64;
const ORIGINS_PER_TARGET: usize = 4;

#[derive(Debug, Serialize, Clone)]
struct SampleRow {
    origin_index: usize,
    target_index: usize,
    overlap_fraction: f64,
    closest_present: bool,
}

#[derive(Clone)]
struct QuerySpec {
    origin_index: usize,
    target_index: usize,
    target: NodeId,
}

#[derive(Serialize)]
struct AggregateReport {
    node_count: usize,
    sample_count: usize,
    mean_overlap_fraction: f64,
    closest_present_fraction: f64,
}

/// Each node starts out knowing only its ring neighbours (in ID order) and a
/// handful of random peers, then joins through one of them. Lookups must still
/// converge on the true k closest nodes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn iterative_find_node_converges_on_sparse_tables() {
    let mut rng = StdRng::seed_from_u64(0xfeed_face_cafe_beef);
    let mut node_ids: Vec<NodeId> = (0..NODE_COUNT).map(|_| random_node_id(&mut rng)).collect();
    node_ids.sort();

    let registry = Arc::new(NetworkRegistry::default());
    let mut nodes = Vec::with_capacity(NODE_COUNT);
    for id in &node_ids {
        let config = test_config(K_PARAM, ALPHA_PARAM);
        nodes.push(TestNode::with_id(registry.clone(), *id, config).await);
    }
    let contacts: Vec<_> = nodes.iter().map(|n| n.contact()).collect();

    for (i, node) in nodes.iter().enumerate() {
        let mut neighbours = HashSet::new();
        for offset in 1..=RING_NEIGHBORS {
            neighbours.insert((i + offset) % NODE_COUNT);
            neighbours.insert((i + NODE_COUNT - offset) % NODE_COUNT);
        }
        while neighbours.len() < 2 * RING_NEIGHBORS + RANDOM_CONTACTS {
            let candidate = rng.gen_range(0..NODE_COUNT);
            if candidate != i {
                neighbours.insert(candidate);
            }
        }
        for peer in neighbours {
            node.node.observe_contact(contacts[peer].clone()).await;
        }
    }

    stream::iter(nodes.iter())
        .for_each_concurrent(Some(32), |node| async move {
            node.node.bootstrap(&[]).await.expect("bootstrap");
        })
        .await;

    let mut queries = Vec::with_capacity(TARGET_SAMPLES * ORIGINS_PER_TARGET);
    for target_index in 0..TARGET_SAMPLES {
        let target = random_node_id(&mut rng);
        for _ in 0..ORIGINS_PER_TARGET {
            queries.push(QuerySpec {
                origin_index: rng.gen_range(0..NODE_COUNT),
                target_index,
                target,
            });
        }
    }

    let dht_nodes: Arc<Vec<_>> = Arc::new(nodes.iter().map(|n| n.node.clone()).collect());
    let node_ids = Arc::new(node_ids);
    let samples = Arc::new(Mutex::new(Vec::with_capacity(queries.len())));

    stream::iter(queries)
        .for_each_concurrent(Some(32), |query| {
            let dht_nodes = dht_nodes.clone();
            let node_ids = node_ids.clone();
            let samples = samples.clone();
            async move {
                let origin = &dht_nodes[query.origin_index];
                let results = origin
                    .iterative_find_node(query.target)
                    .await
                    .expect("iterative lookup succeeds");
                let result_ids: HashSet<NodeId> = results.iter().map(|c| c.id).collect();

                // The origin never lists itself, so leave it out of the ideal set too.
                let perfect = perfect_closest(&node_ids, &query.target, &origin.node_id());
                let overlap = perfect.iter().filter(|id| result_ids.contains(*id)).count();
                samples.lock().await.push(SampleRow {
                    origin_index: query.origin_index,
                    target_index: query.target_index,
                    overlap_fraction: overlap as f64 / perfect.len() as f64,
                    closest_present: result_ids.contains(&perfect[0]),
                });
            }
        })
        .await;

    let samples = samples.lock().await;
    let mean_overlap =
        samples.iter().map(|row| row.overlap_fraction).sum::<f64>() / samples.len() as f64;
    let closest_present =
        samples.iter().filter(|row| row.closest_present).count() as f64 / samples.len() as f64;

    let report = AggregateReport {
        node_count: NODE_COUNT,
        sample_count: samples.len(),
        mean_overlap_fraction: mean_overlap,
        closest_present_fraction: closest_present,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("serialize report")
    );

    assert!(mean_overlap >= 0.8, "mean overlap too low: {mean_overlap:.3}");
    assert!(
        closest_present >= 0.9,
        "closest node missing too often: {closest_present:.3}"
    );
}

fn perfect_closest(node_ids: &[NodeId], target: &NodeId, exclude: &NodeId) -> Vec<NodeId> {
    let mut sorted: Vec<NodeId> = node_ids.iter().copied().filter(|id| id != exclude).collect();
    sorted.sort_by_key(|id| xor_distance(id, target));
    sorted.truncate(K_PARAM);
    sorted
}

fn random_node_id(rng: &mut StdRng) -> NodeId {
    let mut id = [0u8; 32];
    rng.fill_bytes(&mut id);
    id
}
