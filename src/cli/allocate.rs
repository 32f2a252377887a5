//! Bulk (re)generation of pair shards against a directory snapshot.
//!
//! The miner form builds full data shards, one per auditor, sized by
//! stake share. The validator form builds hash-only shards, one per peer,
//! at the default chunk count. Generation is confirmed interactively
//! unless `--no-prompt` is given, then runs on the worker pool.

use std::io::BufRead;
use std::path::PathBuf;

use tensorage::directory::{ChainClient, FileChainClient, PeerId};
use tensorage::prover::{human_readable_size, stake_allocations};
use tensorage::shard::{generate_all, layout, GeneratePlan, NodeRole};

use super::config::TensorageConfig;

pub async fn execute(
    config: TensorageConfig,
    directory: PathBuf,
    validator: bool,
    restart: bool,
    no_prompt: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = FileChainClient::new(directory).fetch_directory().await?;
    let own = PeerId::new(config.node.peer_id.clone());

    let role = if validator {
        NodeRole::Validator
    } else {
        NodeRole::Miner
    };
    let role_dir = layout::role_dir(
        &config.node.db_root,
        &config.node.wallet,
        &config.node.hotkey,
        role,
    );

    if restart && role_dir.exists() {
        println!("Restarting: deleting '{}'", role_dir.display());
        std::fs::remove_dir_all(&role_dir)?;
    }

    let chunk_size = config.storage.chunk_size;
    let mut plans = Vec::new();
    if validator {
        for peer in dir.peers() {
            plans.push(GeneratePlan::for_pair(
                &role_dir,
                &peer.peer_id,
                &own,
                config.auditor.default_n_chunks,
                chunk_size,
                true,
            )?);
        }
    } else {
        for (auditor, n_chunks) in stake_allocations(&dir, config.size_bytes(), chunk_size) {
            plans.push(GeneratePlan::for_pair(
                &role_dir,
                &own,
                &auditor,
                n_chunks,
                chunk_size,
                false,
            )?);
        }
    }

    let total_chunks: u64 = plans.iter().map(|p| p.n_chunks).sum();
    // Text encoding stores four bytes per chunk byte; hash-only rows are
    // a fixed handful of bytes each.
    let total_size = if validator {
        total_chunks * 80
    } else {
        total_chunks * chunk_size as u64 * 4
    };
    println!("Allocations:");
    for plan in &plans {
        println!(
            "  {} ({} chunks{})",
            plan.db_path.display(),
            plan.n_chunks,
            if plan.only_hash { ", hash only" } else { "" }
        );
    }

    if !no_prompt {
        println!(
            "Are you sure you want to partition {} databases with total size {}? (yes/no)",
            plans.len(),
            human_readable_size(total_size)
        );
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim().to_lowercase().as_str(), "yes" | "y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let results = generate_all(plans, config.workers()).await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        return Err(format!("{failed}/{} allocations failed", results.len()).into());
    }

    println!("Generated {} pair shard(s).", results.len());
    Ok(())
}
