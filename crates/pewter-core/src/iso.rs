//! ISO verification and explosion.
//!
//! Exploding an ISO into a bootenv's serving tree is delegated to the
//! external `explode_iso.sh` helper, guarded by the engine-wide
//! extraction lock so at most one extraction runs at a time. Failures
//! are logged and swallowed: the bootenv stays validated but not
//! available until the canary appears.

use crate::data_tracker::DataTracker;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;
use tracing::{error, info};

/// One pending extraction, captured while the owning bootenv was
/// validated.
#[derive(Debug, Clone)]
pub struct IsoTask {
    pub env_name: String,
    pub os_name: String,
    pub iso_path: PathBuf,
    pub dest: PathBuf,
    pub sha256: String,
}

/// The canary file written after a successful explosion; its content is
/// the ISO SHA256.
pub fn canary_name(os_name: &str) -> String {
    format!(".{}.rebar_canary", os_name.replace('/', "_"))
}

pub(crate) fn sha256_file(path: &std::path::Path) -> std::io::Result<String> {
    let mut f = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Run one extraction under the process-wide extraction lock.
pub(crate) fn explode(dt: &DataTracker, task: &IsoTask) {
    let _guard = dt.extraction_lock();

    if !task.sha256.is_empty() {
        let actual = match sha256_file(&task.iso_path) {
            Ok(h) => h,
            Err(e) => {
                error!(
                    "explode iso: failed to read {}: {e}",
                    task.iso_path.display()
                );
                return;
            }
        };
        if actual != task.sha256 {
            error!(
                "explode iso: SHA256 bad for {}: actual {actual} expected {}",
                task.env_name, task.sha256
            );
            return;
        }
    }

    let file_root = dt.file_root().to_path_buf();
    let script = file_root.join("explode_iso.sh");
    info!(
        "explode iso: extracting {} for {}",
        task.iso_path.display(),
        task.env_name
    );
    let out = Command::new(&script)
        .arg(&task.os_name)
        .arg(&file_root)
        .arg(&task.iso_path)
        .arg(&task.dest)
        .arg(&task.sha256)
        .output();
    match out {
        Ok(out) if out.status.success() => {}
        Ok(out) => {
            error!(
                "explode iso: explode_iso.sh failed for {}: {}",
                task.env_name, out.status
            );
            error!(
                "command output:\n{}{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Err(e) => {
            error!(
                "explode iso: explode_iso.sh failed for {}: {e}",
                task.env_name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_name_replaces_slashes() {
        assert_eq!(canary_name("ubuntu-20.04"), ".ubuntu-20.04.rebar_canary");
        assert_eq!(canary_name("redhat/rhel8"), ".redhat_rhel8.rebar_canary");
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
