// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::Path;

/// Read a pseudo-file, trimmed, with any failure collapsed to `None`.
///
/// The probed facts are all "absent or unreadable means the field is
/// absent"; a missing file is the current truth, not an error.
pub fn read_optional_file(path: &Path) -> Option<String> {
    let val = std::fs::read_to_string(path).ok()?;
    Some(val.trim_end_matches('\0').trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_optional_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuset.cpus");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "0-3,8").unwrap();

        assert_eq!(read_optional_file(&path).as_deref(), Some("0-3,8"));
        assert_eq!(read_optional_file(&dir.path().join("missing")), None);
    }
}
