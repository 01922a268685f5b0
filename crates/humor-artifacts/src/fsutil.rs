//! Filesystem helpers shared by merge and promotion.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Atomic write: write to a temp file in the same directory, then rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Recursively copy `src` into `dst`, skipping top-level entries named in
/// `skip`. `dst` is created if needed.
pub(crate) fn copy_dir(src: &Path, dst: &Path, skip: &[&str]) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name == *s) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if entry.file_type()?.is_dir() {
            copy_dir(&from, &to, &[])?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_dir_skips_named_entries() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("config.json"), b"{}").unwrap();
        fs::write(src.path().join("model.safetensors"), b"weights").unwrap();
        fs::create_dir(src.path().join("tokenizer")).unwrap();
        fs::write(src.path().join("tokenizer").join("vocab.txt"), b"a\nb").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let out = dst.path().join("copy");
        copy_dir(src.path(), &out, &["model.safetensors"]).unwrap();

        assert!(out.join("config.json").is_file());
        assert!(out.join("tokenizer").join("vocab.txt").is_file());
        assert!(!out.join("model.safetensors").exists());
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slots.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
