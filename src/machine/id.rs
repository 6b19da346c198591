// src/machine/id.rs

//! Persistent machine identity.
//!
//! The ID is 20 bytes of a `blake3` digest over a random seed, rendered as
//! 40 uppercase hex characters. It is written to
//! `<data_dir>/.machine/machineID` on first boot and read back afterwards.

use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, warn};

use crate::errors::Result;

const MACHINE_DIR: &str = ".machine";
const MACHINE_ID_FILE: &str = "machineID";
const ID_BYTES: usize = 20;
const SEED_LEN: usize = 64;

/// Length of the abbreviated ID used in logs and lookups.
pub const SHORT_ID_LEN: usize = 8;

pub fn machine_id_path(data_dir: &Path) -> PathBuf {
    data_dir.join(MACHINE_DIR).join(MACHINE_ID_FILE)
}

/// Read the persisted ID, generating and saving a fresh one when the file
/// is missing, empty or unreadable as an ID.
pub async fn load_or_create(data_dir: &Path) -> Result<String> {
    let path = machine_id_path(data_dir);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => {
            let id = raw.trim();
            if is_valid_id(id) {
                debug!(path = %path.display(), mach_id = id, "loaded machine id");
                return Ok(id.to_string());
            }
            warn!(path = %path.display(), "stored machine id is malformed; generating a new one");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let id = generate();
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&path, format!("{id}\n")).await?;
    info!(path = %path.display(), mach_id = %id, "generated new machine id");
    Ok(id)
}

pub fn generate() -> String {
    let seed: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SEED_LEN)
        .map(char::from)
        .collect();
    let digest = blake3::hash(seed.as_bytes());
    digest.as_bytes()[..ID_BYTES]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}

fn is_valid_id(id: &str) -> bool {
    id.len() == ID_BYTES * 2 && id.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// True when `candidate` is the full ID or an abbreviation of it.
pub fn matches_id(id: &str, candidate: &str) -> bool {
    !candidate.is_empty() && id.starts_with(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_forty_uppercase_hex_chars() {
        let id = generate();
        assert!(is_valid_id(&id));
        assert_eq!(id, id.to_uppercase());
        assert_ne!(id, generate());
    }

    #[tokio::test]
    async fn id_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create(dir.path()).await.unwrap();
        let second = load_or_create(dir.path()).await.unwrap();
        assert_eq!(first, second);
        assert!(machine_id_path(dir.path()).is_file());
    }

    #[tokio::test]
    async fn garbage_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = machine_id_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not-an-id").unwrap();

        let id = load_or_create(dir.path()).await.unwrap();
        assert!(is_valid_id(&id));
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), id);
    }

    #[test]
    fn short_ids_match() {
        let id = "0123456789ABCDEF0123456789ABCDEF01234567";
        assert_eq!(short_id(id), "01234567");
        assert!(matches_id(id, "01234567"));
        assert!(matches_id(id, id));
        assert!(!matches_id(id, ""));
        assert!(!matches_id(id, "FFFF"));
    }
}
