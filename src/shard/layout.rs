//! On-disk naming for pair shards.
//!
//! Every (prover, auditor) pair maps to one single-file database at
//! `<root>/<wallet>/<hotkey>/<role>/DB-<prover>-<auditor>` holding one
//! table named `<prover><auditor>`. The prover owns the pair's data; the
//! auditor keeps a hash-only replica under its own tree with the same
//! name, so both sides derive identical content from the same seed.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::directory::PeerId;

/// Which side of the protocol this process plays; selects the role
/// directory under the wallet tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Miner,
    Validator,
}

impl NodeRole {
    pub fn dir_name(self) -> &'static str {
        match self {
            NodeRole::Miner => "miner",
            NodeRole::Validator => "validator",
        }
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("peer id {0:?} is not a valid table identifier")]
    InvalidPeerId(String),
}

/// `<root>/<wallet>/<hotkey>`
pub fn wallet_dir(root: &Path, wallet: &str, hotkey: &str) -> PathBuf {
    root.join(wallet).join(hotkey)
}

/// `<root>/<wallet>/<hotkey>/<role>`
pub fn role_dir(root: &Path, wallet: &str, hotkey: &str, role: NodeRole) -> PathBuf {
    wallet_dir(root, wallet, hotkey).join(role.dir_name())
}

/// `<root>/<wallet>/<hotkey>/data` — placement indexes for sharded files.
pub fn data_dir(root: &Path, wallet: &str, hotkey: &str) -> PathBuf {
    wallet_dir(root, wallet, hotkey).join("data")
}

/// `<root>/<wallet>/<hotkey>/validator-allocations.json`
pub fn allocations_path(root: &Path, wallet: &str, hotkey: &str) -> PathBuf {
    wallet_dir(root, wallet, hotkey).join("validator-allocations.json")
}

/// `DB-<prover>-<auditor>` under the given role directory.
pub fn shard_db_path(role_dir: &Path, prover: &PeerId, auditor: &PeerId) -> PathBuf {
    role_dir.join(format!("DB-{prover}-{auditor}"))
}

/// The pair's table name, `<prover><auditor>`.
///
/// SS58 identities are alphanumeric, which keeps the concatenation safe to
/// splice into SQL as a quoted identifier; anything else is rejected.
pub fn table_name(prover: &PeerId, auditor: &PeerId) -> Result<String, LayoutError> {
    let name = format!("{prover}{auditor}");
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(LayoutError::InvalidPeerId(name));
    }
    Ok(name)
}

/// The pair's PRF key: SHA-256 of `<prover><auditor>`.
///
/// Both sides derive it independently, which is what makes generation
/// reproducible across machines.
pub fn pair_seed(prover: &PeerId, auditor: &PeerId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prover.as_str().as_bytes());
    hasher.update(auditor.as_str().as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_compose() {
        let root = Path::new("/tmp/tensorage-db");
        let dir = role_dir(root, "default", "5Hot", NodeRole::Validator);
        assert_eq!(dir, PathBuf::from("/tmp/tensorage-db/default/5Hot/validator"));

        let db = shard_db_path(&dir, &PeerId::from("5Prover"), &PeerId::from("5Auditor"));
        assert!(db.ends_with("DB-5Prover-5Auditor"));

        assert!(allocations_path(root, "default", "5Hot")
            .ends_with("default/5Hot/validator-allocations.json"));
    }

    #[test]
    fn table_name_requires_alphanumeric() {
        let ok = table_name(&PeerId::from("5Abc"), &PeerId::from("9Xyz")).unwrap();
        assert_eq!(ok, "5Abc9Xyz");

        assert!(table_name(&PeerId::from("bad;drop"), &PeerId::from("x")).is_err());
        assert!(table_name(&PeerId::from(""), &PeerId::from("")).is_err());
    }

    #[test]
    fn seed_is_order_sensitive_and_stable() {
        let a = PeerId::from("5A");
        let b = PeerId::from("5B");
        assert_eq!(pair_seed(&a, &b), pair_seed(&a, &b));
        assert_ne!(pair_seed(&a, &b), pair_seed(&b, &a));
    }
}
