//! Location of the log artifacts a unit produces.
//!
//! `dir/name.simion.exp` logs to `dir/name.simion.log` (descriptor) and
//! `dir/name.simion.log.bin` (binary log). Any other extension is replaced.

use std::path::{Path, PathBuf};

const UNIT_EXTENSION: &str = ".simion.exp";
const LOG_DESCRIPTOR_EXTENSION: &str = ".simion.log";
const BINARY_LOG_EXTENSION: &str = ".simion.log.bin";

/// Path of the log descriptor (`descriptor == true`) or binary log of a unit.
pub fn log_file_path(unit_path: &Path, descriptor: bool) -> PathBuf {
    let file_name = unit_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match file_name.strip_suffix(UNIT_EXTENSION) {
        Some(stem) => stem.to_string(),
        None => match file_name.rfind('.') {
            Some(dot) if dot > 0 => file_name[..dot].to_string(),
            _ => file_name,
        },
    };
    let extension = if descriptor {
        LOG_DESCRIPTOR_EXTENSION
    } else {
        BINARY_LOG_EXTENSION
    };
    unit_path.with_file_name(format!("{}{}", stem, extension))
}

pub fn file_exists_and_not_empty(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// A unit is finished when both of its log artifacts are present and non-empty.
pub fn is_finished(unit_path: &Path) -> bool {
    file_exists_and_not_empty(&log_file_path(unit_path, true))
        && file_exists_and_not_empty(&log_file_path(unit_path, false))
}

/// Delete whichever log artifacts exist. Returns true if at least one did.
pub fn delete_logs(unit_path: &Path) -> std::io::Result<bool> {
    let mut found = false;
    for descriptor in [true, false] {
        let path = log_file_path(unit_path, descriptor);
        if path.exists() {
            found = true;
            std::fs::remove_file(&path)?;
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simion_extension_is_replaced() {
        let unit = Path::new("/b/exp-1/unit-3.simion.exp");
        assert_eq!(
            log_file_path(unit, true),
            PathBuf::from("/b/exp-1/unit-3.simion.log")
        );
        assert_eq!(
            log_file_path(unit, false),
            PathBuf::from("/b/exp-1/unit-3.simion.log.bin")
        );
    }

    #[test]
    fn other_extension_is_replaced() {
        assert_eq!(
            log_file_path(Path::new("runs/a.xml"), true),
            PathBuf::from("runs/a.simion.log")
        );
        assert_eq!(
            log_file_path(Path::new("runs/noext"), false),
            PathBuf::from("runs/noext.simion.log.bin")
        );
    }

    #[test]
    fn finished_requires_both_non_empty_logs() {
        let dir = tempfile::tempdir().unwrap();
        let unit = dir.path().join("u.simion.exp");
        assert!(!is_finished(&unit));

        std::fs::write(log_file_path(&unit, true), "<Log/>").unwrap();
        assert!(!is_finished(&unit));

        std::fs::write(log_file_path(&unit, false), b"").unwrap();
        assert!(!is_finished(&unit), "empty binary log is not finished");

        std::fs::write(log_file_path(&unit, false), b"\x01\x02").unwrap();
        assert!(is_finished(&unit));

        assert!(delete_logs(&unit).unwrap());
        assert!(!log_file_path(&unit, true).exists());
        assert!(!delete_logs(&unit).unwrap());
    }
}
