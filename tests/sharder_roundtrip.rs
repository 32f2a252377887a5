//! File sharder round-trips through a fleet of real prover services.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use tensorage::directory::{Peer, PeerDirectory, PeerId};
use tensorage::protocol::local::{LocalFabric, LocalRpc};
use tensorage::prover::{ProverConfig, ProverService};
use tensorage::shard::layout;
use tensorage::sharder::{FileSharder, PlacementIndex, SharderConfig, SharderError};

const CHUNK: usize = 256;

fn peer(uid: u16, id: &str, stake: f64, is_auditor: bool) -> Peer {
    Peer {
        uid,
        peer_id: PeerId::from(id),
        endpoint: format!("127.0.0.1:{}", 8090 + uid),
        stake,
        is_auditor,
    }
}

fn fleet_directory() -> PeerDirectory {
    PeerDirectory::new(vec![
        peer(0, "5Auditor", 1000.0, true),
        peer(1, "5MinerA", 0.0, false),
        peer(2, "5MinerB", 0.0, false),
    ])
}

async fn spawn_fleet(tmp: &TempDir, dir: &PeerDirectory) -> Arc<LocalFabric> {
    let fabric = LocalFabric::new();
    for miner in dir.peers().iter().filter(|p| !p.is_auditor) {
        let service = ProverService::new(ProverConfig {
            db_root: tmp.path().to_path_buf(),
            wallet: "test".to_string(),
            hotkey: miner.peer_id.to_string(),
            own_peer: miner.peer_id.clone(),
            size_bytes: (CHUNK as u64) * 64 * dir.len() as u64,
            chunk_size: CHUNK,
            workers: 2,
            reallocate_interval: Duration::from_secs(600),
            restart: false,
        })
        .await
        .unwrap();
        service.reallocate(dir.clone()).await.unwrap();
        service.wait_for_generation().await;
        fabric
            .register(miner.peer_id.clone(), Arc::clone(&service))
            .await;
    }
    fabric
}

fn sharder(tmp: &TempDir, fabric: &Arc<LocalFabric>) -> FileSharder<LocalRpc> {
    let rpc = Arc::new(LocalRpc::new(PeerId::from("5Auditor"), Arc::clone(fabric)));
    FileSharder::new(
        SharderConfig {
            db_root: tmp.path().to_path_buf(),
            wallet: "test".to_string(),
            hotkey: "5Auditor".to_string(),
            own_peer: PeerId::from("5Auditor"),
            chunk_size: CHUNK,
            chunk_store_count: 1,
            limit_loop_count: 3,
        },
        rpc,
    )
}

#[tokio::test]
async fn three_chunk_file_roundtrips_byte_identical() {
    let tmp = TempDir::new().unwrap();
    let dir = fleet_directory();
    let fabric = spawn_fleet(&tmp, &dir).await;
    let sharder = sharder(&tmp, &fabric);

    // Two full chunks plus a partial third.
    let payload: Vec<u8> = (0..CHUNK * 2 + 77).map(|i| (i * 31 % 256) as u8).collect();
    let input = tmp.path().join("input.bin");
    tokio::fs::write(&input, &payload).await.unwrap();

    let outcome = sharder.store_file(&dir, &input).await.unwrap();
    assert_eq!(outcome.chunks, 3);

    // The placement index records every chunk in order.
    let index = PlacementIndex::open(
        &layout::data_dir(tmp.path(), "test", "5Auditor"),
        &outcome.db_name,
    )
    .await
    .unwrap();
    assert_eq!(index.total_chunks().await.unwrap(), 3);
    for chunk_id in 0..3 {
        assert!(!index.candidates(chunk_id).await.unwrap().is_empty());
    }
    index.close().await;

    let output = tmp.path().join("output.bin");
    sharder
        .retrieve_file(&dir, &outcome.db_name, &output)
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&output).await.unwrap(), payload);
}

#[tokio::test]
async fn empty_fleet_has_insufficient_capacity() {
    let tmp = TempDir::new().unwrap();
    let dir = fleet_directory();
    // Nobody registers with the fabric: every store RPC fails.
    let fabric = LocalFabric::new();
    let sharder = sharder(&tmp, &fabric);

    let input = tmp.path().join("input.bin");
    tokio::fs::write(&input, vec![7u8; CHUNK]).await.unwrap();

    let err = sharder.store_file(&dir, &input).await.err().unwrap();
    assert!(matches!(
        err,
        SharderError::InsufficientCapacity { chunk_id: 0 }
    ));
}

#[tokio::test]
async fn retrieval_fails_cleanly_when_the_fleet_vanishes() {
    let tmp = TempDir::new().unwrap();
    let dir = fleet_directory();
    let fabric = spawn_fleet(&tmp, &dir).await;
    let sharder = sharder(&tmp, &fabric);

    let input = tmp.path().join("input.bin");
    tokio::fs::write(&input, vec![42u8; CHUNK + 5]).await.unwrap();
    let outcome = sharder.store_file(&dir, &input).await.unwrap();

    fabric.deregister(&PeerId::from("5MinerA")).await;
    fabric.deregister(&PeerId::from("5MinerB")).await;

    let err = sharder
        .retrieve_file(&dir, &outcome.db_name, &tmp.path().join("out.bin"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SharderError::ChunkMissing { chunk_id: 0 }));
}
