//! Multi-node cluster tests: topology-driven connection maintenance, seed
//! bootstrap, and remote fetch over the GET RPC.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use warren::{
    ClusterConfig, Ctx, Neighborhood, NodeId, NodeRecord, RawVersioned, StoreClient, VectorClock,
    NODE_STORE,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    predicate()
}

fn start_node(id: &NodeId, master_eligible: bool, seeds: &[(String, u16)]) -> Ctx {
    let ctx = Ctx::new();
    ctx.configure_local(id.clone(), "127.0.0.1", 0, master_eligible);
    for (hostname, port) in seeds {
        ctx.add_seed(hostname.clone(), *port);
    }
    ctx.register_store("data");
    ctx.start(2).expect("context should start");
    ctx
}

/// Tell `ctx` where every node in the cluster lives.
fn seed_node_records(ctx: &Ctx, nodes: &[(NodeId, u16, bool)]) {
    let client: StoreClient<NodeId, NodeRecord> = ctx.store_client(NODE_STORE).unwrap();
    for (id, port, master_eligible) in nodes {
        if *id == ctx.get_local_node_id() {
            continue;
        }
        let current = client.get(id).unwrap();
        client
            .update(
                id,
                &current,
                &NodeRecord {
                    hostname: "127.0.0.1".to_string(),
                    port: *port,
                    master_eligible: *master_eligible,
                },
            )
            .unwrap();
    }
}

fn two_neighborhood_config() -> ClusterConfig {
    let mut config = ClusterConfig::new();
    config.add_neighborhood(Neighborhood {
        prefix: NodeId::new(vec![1]),
        masters: vec![NodeId::new(vec![1, 1]), NodeId::new(vec![1, 2])],
    });
    config.add_neighborhood(Neighborhood {
        prefix: NodeId::new(vec![2]),
        masters: vec![NodeId::new(vec![2, 1]), NodeId::new(vec![2, 2])],
    });
    config
}

#[test]
fn four_masters_converge_across_two_neighborhoods() {
    init_tracing();
    let ids: Vec<NodeId> = vec![
        NodeId::new(vec![1, 1]),
        NodeId::new(vec![1, 2]),
        NodeId::new(vec![2, 1]),
        NodeId::new(vec![2, 2]),
    ];

    let first = start_node(&ids[0], true, &[]);
    let first_port = first.local_endpoint().unwrap().port();
    let seeds = vec![("127.0.0.1".to_string(), first_port)];

    let mut cluster = vec![first];
    for id in &ids[1..] {
        cluster.push(start_node(id, true, &seeds));
    }

    let records: Vec<(NodeId, u16, bool)> = ids
        .iter()
        .zip(&cluster)
        .map(|(id, ctx)| (id.clone(), ctx.local_endpoint().unwrap().port(), true))
        .collect();
    for ctx in &cluster {
        seed_node_records(ctx, &records);
        ctx.set_static_config(two_neighborhood_config());
    }

    // Maintenance runs every few seconds and idle connections flap, so
    // latch each pair the first time it is observed ready.
    let mut ready = vec![vec![false; ids.len()]; ids.len()];
    let all_pairs_seen = wait_until(Duration::from_secs(30), || {
        for (a, ctx) in cluster.iter().enumerate() {
            for (b, id) in ids.iter().enumerate() {
                if a != b && !ready[a][b] && ctx.is_node_ready(id) {
                    ready[a][b] = true;
                }
            }
        }
        (0..ids.len()).all(|a| (0..ids.len()).all(|b| a == b || ready[a][b]))
    });
    assert!(
        all_pairs_seen,
        "not all master pairs became ready: {ready:?}"
    );

    for ctx in &cluster {
        ctx.stop();
    }
}

#[test]
fn non_master_connects_only_to_local_masters() {
    init_tracing();
    let master_ids = [
        NodeId::new(vec![1, 1]),
        NodeId::new(vec![1, 2]),
        NodeId::new(vec![2, 1]),
    ];
    let outsider_id = NodeId::new(vec![1, 3]);

    let masters: Vec<Ctx> = master_ids
        .iter()
        .map(|id| start_node(id, true, &[]))
        .collect();
    let outsider = start_node(&outsider_id, false, &[]);

    let mut records: Vec<(NodeId, u16, bool)> = master_ids
        .iter()
        .zip(&masters)
        .map(|(id, ctx)| (id.clone(), ctx.local_endpoint().unwrap().port(), true))
        .collect();
    records.push((
        outsider_id.clone(),
        outsider.local_endpoint().unwrap().port(),
        false,
    ));

    let mut config = ClusterConfig::new();
    config.add_neighborhood(Neighborhood {
        prefix: NodeId::new(vec![1]),
        masters: vec![master_ids[0].clone(), master_ids[1].clone()],
    });
    config.add_neighborhood(Neighborhood {
        prefix: NodeId::new(vec![2]),
        masters: vec![master_ids[2].clone()],
    });
    for ctx in masters.iter().chain(std::iter::once(&outsider)) {
        seed_node_records(ctx, &records);
        ctx.set_static_config(config.clone());
    }

    let mut seen = [false, false];
    let local_ready = wait_until(Duration::from_secs(30), || {
        for (i, id) in master_ids[..2].iter().enumerate() {
            if !seen[i] && outsider.is_node_ready(id) {
                seen[i] = true;
            }
        }
        seen.iter().all(|ready| *ready)
    });
    assert!(local_ready, "outsider never reached its local masters");

    // The non-master must not dial masters outside its neighborhood.
    assert!(!outsider.is_node_ready(&master_ids[2]));

    for ctx in masters.iter().chain(std::iter::once(&outsider)) {
        ctx.stop();
    }
}

#[test]
fn bootstrap_rolls_over_to_next_seed() {
    init_tracing();
    let seed_id = NodeId::new(vec![1, 1]);
    let seed_node = start_node(&seed_id, true, &[]);
    let seed_port = seed_node.local_endpoint().unwrap().port();

    // A port with nothing listening: bind an ephemeral port, note it, and
    // release it again.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let joiner = start_node(
        &NodeId::new(vec![1, 2]),
        true,
        &[
            ("127.0.0.1".to_string(), dead_port),
            ("127.0.0.1".to_string(), seed_port),
        ],
    );

    let connected = wait_until(Duration::from_secs(15), || {
        joiner.is_node_ready(&seed_id)
    });
    assert!(connected, "bootstrap never rolled over to the live seed");

    joiner.stop();
    seed_node.stop();
}

#[test]
fn remote_fetch_applies_values_as_remote_writes() {
    init_tracing();
    let a_id = NodeId::new(vec![1, 1]);
    let b_id = NodeId::new(vec![1, 2]);
    let node_a = start_node(&a_id, true, &[]);
    let node_b = start_node(&b_id, true, &[]);

    let records = vec![
        (a_id.clone(), node_a.local_endpoint().unwrap().port(), true),
        (b_id.clone(), node_b.local_endpoint().unwrap().port(), true),
    ];
    seed_node_records(&node_a, &records);

    // B holds a value A has never seen.
    let value = RawVersioned::new(
        Some(b"remote-value".to_vec()),
        VectorClock::with_entries(SystemTime::now(), vec![(b_id.clone(), 1)]),
    );
    assert!(node_b
        .get_raw_store("data")
        .unwrap()
        .put(b"k", &value)
        .unwrap());

    let changes: Arc<Mutex<Vec<(Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = changes.clone();
    node_a
        .add_raw_listener(
            "data",
            Arc::new(move |key, local| {
                seen.lock().unwrap().push((key.to_vec(), local));
            }),
        )
        .unwrap();

    node_a.fetch_remote(&b_id, "data", b"k").unwrap();

    let applied = wait_until(Duration::from_secs(15), || {
        node_a
            .get_raw_store("data")
            .unwrap()
            .get(b"k")
            .unwrap()
            .iter()
            .any(|v| v.get().map(|bytes| bytes.as_slice()) == Some(b"remote-value"))
    });
    assert!(applied, "remote value never reached the local store");

    let changes = changes.lock().unwrap();
    assert!(changes.contains(&(b"k".to_vec(), false)));

    node_a.stop();
    node_b.stop();
}
