//! In-process network simulation.
//!
//! Spins up a fleet of real prover services behind the local fabric, runs
//! the auditor loop against them for a fixed number of steps, and
//! optionally round-trips a file through the sharder. Everything runs on
//! real SQLite shards under a scratch (or given) database root, so this
//! exercises the whole challenge/score/shard pipeline without a network.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use tensorage::auditor::{Auditor, AuditorConfig};
use tensorage::directory::{FileChainClient, Peer, PeerDirectory, PeerId};
use tensorage::protocol::local::{LocalFabric, LocalRpc};
use tensorage::prover::{ProverConfig, ProverService};
use tensorage::sharder::{FileSharder, SharderConfig};

/// Synthetic but SS58-shaped identity for simulated peers.
fn sim_peer_id(label: &str) -> PeerId {
    let digest = Sha256::digest(label.as_bytes());
    PeerId::new(format!("5{}", &hex::encode(digest)[..15]))
}

pub async fn execute(
    provers: usize,
    steps: usize,
    chunk_size: usize,
    file: Option<PathBuf>,
    db_root: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let db_root = db_root.unwrap_or_else(|| {
        let noise: [u8; 4] = rand::random();
        std::env::temp_dir().join(format!("tensorage-sim-{}", hex::encode(noise)))
    });
    println!("Simulation state under {}", db_root.display());

    let auditor_id = sim_peer_id("validator-0");
    let mut peers = vec![Peer {
        uid: 0,
        peer_id: auditor_id.clone(),
        endpoint: "127.0.0.1:8090".to_string(),
        stake: 1000.0,
        is_auditor: true,
    }];
    for i in 0..provers {
        peers.push(Peer {
            uid: (i + 1) as u16,
            peer_id: sim_peer_id(&format!("miner-{i}")),
            endpoint: format!("127.0.0.1:{}", 8091 + i),
            stake: 0.0,
            is_auditor: false,
        });
    }
    let dir = PeerDirectory::new(peers);

    let directory_path = db_root.join("directory.json");
    std::fs::create_dir_all(&db_root)?;
    std::fs::write(&directory_path, serde_json::to_string_pretty(&dir)?)?;
    let chain = Arc::new(FileChainClient::new(directory_path));

    // Fleet: one real prover service per simulated miner, sized so each
    // pair holds a few frontier windows' worth of chunks.
    let pair_chunks: u64 = 64;
    let fabric = LocalFabric::new();
    let mut services = Vec::with_capacity(provers);
    println!("Generating {} prover shard(s)...", provers);
    for peer in dir.peers().iter().filter(|p| !p.is_auditor) {
        let service = ProverService::new(ProverConfig {
            db_root: db_root.clone(),
            wallet: "sim".to_string(),
            hotkey: peer.peer_id.to_string(),
            own_peer: peer.peer_id.clone(),
            size_bytes: pair_chunks * chunk_size as u64 * dir.len() as u64,
            chunk_size,
            workers: 2,
            reallocate_interval: Duration::from_secs(600),
            restart: false,
        })
        .await?;
        service.reallocate(dir.clone()).await?;
        service.wait_for_generation().await;
        fabric.register(peer.peer_id.clone(), Arc::clone(&service)).await;
        services.push(service);
    }

    let rpc = Arc::new(LocalRpc::new(auditor_id.clone(), Arc::clone(&fabric)));
    let auditor = Auditor::new(
        AuditorConfig {
            db_root: db_root.clone(),
            wallet: "sim".to_string(),
            hotkey: auditor_id.to_string(),
            own_peer: auditor_id.clone(),
            chunk_size,
            default_n_chunks: 32,
            increase_rate: 16,
            decrease_rate: 8,
            alpha: 0.9,
            step_time: Duration::from_millis(50),
            scores_time: Duration::from_millis(50),
            workers: 4,
            no_store: false,
            no_restore: false,
            restart: false,
        },
        Arc::clone(&rpc),
        Arc::clone(&chain),
    );

    let dir = auditor.bootstrap().await?;
    println!("Running {steps} validation step(s) against {provers} prover(s)...");
    for step in 0..steps {
        auditor.challenge_tick(&dir).await;
        auditor.apply_churn(&dir).await;
        auditor.scoring_tick(&dir).await?;

        println!("\nStep {step}:");
        println!("{:>4}  {:>18}  {:>9}", "Uid", "Hotkey", "N. Chunks");
        let allocations = auditor.allocations().await;
        for (uid, record) in allocations.iter().enumerate() {
            println!(
                "{:>4}  {:>18}  {:>9}",
                uid,
                record.hotkey.to_string(),
                record.n_chunks
            );
        }
    }

    if let Some(input) = file {
        println!("\nSharding {} across the fleet...", input.display());
        let sharder = FileSharder::new(
            SharderConfig {
                db_root: db_root.clone(),
                wallet: "sim".to_string(),
                hotkey: auditor_id.to_string(),
                own_peer: auditor_id.clone(),
                chunk_size,
                chunk_store_count: 1,
                limit_loop_count: 3,
            },
            Arc::clone(&rpc),
        );

        let outcome = sharder.store_file(&dir, &input).await?;
        println!("Stored as index {} ({} chunks).", outcome.db_name, outcome.chunks);

        let output = input.with_extension("retrieved");
        sharder.retrieve_file(&dir, &outcome.db_name, &output).await?;

        let original = std::fs::read(&input)?;
        let restored = std::fs::read(&output)?;
        if original == restored {
            println!("File retrieved byte-identical into {}", output.display());
        } else {
            return Err("retrieved file differs from the original".into());
        }
    }

    for service in &services {
        service.shutdown().await;
    }
    println!("\nSimulation finished.");
    Ok(())
}
