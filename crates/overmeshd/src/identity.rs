//! Persistent peer identity: a hex-encoded 32-byte id in a file.

use std::path::Path;

use anyhow::{Context, Result};

use overmesh_core::PeerId;

/// Load the peer id stored at `path`, creating a random one on first run.
pub fn load_or_create(path: &Path) -> Result<PeerId> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let bytes = hex::decode(text.trim())
            .with_context(|| format!("{} is not hex", path.display()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("{} must hold 32 bytes", path.display()))?;
        return Ok(PeerId::from_bytes(bytes));
    }

    let id = PeerId::random();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, hex::encode(id.as_bytes()))
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), peer = %id, "new peer id created");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("overmeshd-test-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("peer_id")
    }

    #[test]
    fn created_once_then_reloaded() {
        let path = temp_path("identity");
        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn garbage_file_is_an_error() {
        let path = temp_path("garbage");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "zz").unwrap();
        assert!(load_or_create(&path).is_err());
        std::fs::write(&path, "abcd").unwrap();
        assert!(load_or_create(&path).is_err());
    }
}
