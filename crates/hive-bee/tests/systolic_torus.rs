//! Cannon's algorithm across real mesh links.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hive_bee::mesh::{InboundMessage, MeshService, TcpVoteTransport};
use hive_bee::pacemaker::{Pacemaker, StragglerPolicy};
use hive_bee::protocol::{pulse_signing_bytes, PeerMessage};
use hive_bee::systolic::{run_steps, Matrix, RunReport, StepContext, SystolicEngine};
use hive_consensus::{ConsensusConfig, ConsensusManager};
use hive_immune::{Attestor, Blacklist};
use hive_topology::{Direction, GridCoord};
use serde_json::json;
use tokio::sync::mpsc;

struct Cell {
    id: String,
    mesh: Arc<MeshService>,
    pacemaker: Arc<Pacemaker<Matrix>>,
    addr: SocketAddr,
}

/// Feed verified pulses into the pacemaker, as the node does.
fn dispatch(
    mut rx: mpsc::Receiver<InboundMessage>,
    pacemaker: Arc<Pacemaker<Matrix>>,
    attestor: Attestor,
) {
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            let PeerMessage::PulseData {
                bee_id,
                step,
                operand,
                payload,
                attestation,
            } = inbound.message
            else {
                continue;
            };
            let bytes = pulse_signing_bytes(step, operand, &payload).unwrap();
            assert!(attestor.verify_hex(&bytes, &attestation, &bee_id));
            assert_eq!(inbound.from, Some(operand.source()));
            let block: Matrix = serde_json::from_value(payload).unwrap();
            pacemaker.enqueue(operand.source(), step, block).unwrap();
        }
    });
}

async fn cell(id: &str, coord: GridCoord, attestor: &Attestor) -> Cell {
    let (consensus, _promotions) =
        ConsensusManager::new(id, ConsensusConfig::default(), Arc::new(TcpVoteTransport));
    let (mesh, rx) = MeshService::new(id, Arc::new(Blacklist::default()), Arc::new(consensus));
    mesh.set_coord(coord);
    let addr = mesh
        .start_listener("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let pacemaker = Arc::new(Pacemaker::new(Duration::from_secs(5), StragglerPolicy::Fail));
    dispatch(rx, Arc::clone(&pacemaker), attestor.clone());
    Cell {
        id: id.to_string(),
        mesh,
        pacemaker,
        addr,
    }
}

fn scalar(v: f64) -> serde_json::Value {
    json!({"rows": 1, "cols": 1, "data": [v]})
}

async fn run(cell: &Cell, attestor: &Attestor, a: f64, b: f64, steps: u32) -> (RunReport, f64) {
    let mut engine = SystolicEngine::default();
    engine
        .load_shard(&json!({"a": scalar(a), "b": scalar(b)}))
        .unwrap();
    let ctx = StepContext {
        self_id: &cell.id,
        mesh: &cell.mesh,
        pacemaker: &cell.pacemaker,
        attestor,
    };
    let report = tokio::time::timeout(Duration::from_secs(10), run_steps(&mut engine, &ctx, steps))
        .await
        .unwrap()
        .unwrap();
    let c = engine.accumulator().unwrap();
    assert_eq!(report.digest, c.digest());
    (report, c.get(0, 0))
}

#[tokio::test]
async fn single_bee_torus_loops_operands_back() {
    let attestor = Attestor::default();
    let solo = cell("bee-solo", GridCoord::ORIGIN, &attestor).await;

    // On a 1x1 torus every neighbor is ourselves
    assert!(solo.mesh.connect(Direction::West, solo.addr).await);
    assert!(solo.mesh.connect(Direction::North, solo.addr).await);

    let (report, c) = run(&solo, &attestor, 2.0, 3.0, 3).await;
    assert_eq!(report.steps, 3);
    assert!(report.degraded_steps.is_empty());
    assert_eq!(c, 18.0);
}

#[tokio::test]
async fn two_by_two_torus_computes_matrix_product() {
    let attestor = Attestor::default();
    let a = [[1.0, 2.0], [3.0, 4.0]];
    let b = [[5.0, 6.0], [7.0, 8.0]];
    let expected = [[19.0, 22.0], [43.0, 50.0]];

    let mut cells = Vec::new();
    for i in 0..2u32 {
        for j in 0..2u32 {
            let id = format!("bee-{}{}", i, j);
            cells.push(cell(&id, GridCoord::new(i, j), &attestor).await);
        }
    }
    let at = |i: u32, j: u32| &cells[(i * 2 + j) as usize];

    for i in 0..2u32 {
        for j in 0..2u32 {
            let west = at(i, (j + 1) % 2).addr;
            let north = at((i + 1) % 2, j).addr;
            assert!(at(i, j).mesh.connect(Direction::West, west).await);
            assert!(at(i, j).mesh.connect(Direction::North, north).await);
        }
    }

    // Cannon's initial skew: A(i, i+j), B(i+j, j)
    let mut runs = Vec::new();
    for i in 0..2usize {
        for j in 0..2usize {
            let k = (i + j) % 2;
            let cell = at(i as u32, j as u32);
            runs.push(run(cell, &attestor, a[i][k], b[k][j], 2));
        }
    }
    let results = futures::future::join_all(runs).await;

    for (idx, (report, c)) in results.into_iter().enumerate() {
        let (i, j) = (idx / 2, idx % 2);
        assert!(report.degraded_steps.is_empty());
        assert_eq!(c, expected[i][j], "cell ({}, {})", i, j);
    }
}
