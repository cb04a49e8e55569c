//! Snapshot extraction under the fixed workspace root.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path};

use anyhow::{bail, Context, Result};
use zip::ZipArchive;

/// Extract `archive` under `root`, refusing any entry whose resolved path
/// would escape it. The first bad entry aborts the whole extraction; the
/// caller must not mark the workspace ready in that case.
pub fn extract_archive(archive: &Path, root: &Path) -> Result<()> {
    let file = File::open(archive).context("open uploaded archive")?;
    let mut zip = ZipArchive::new(file).context("read zip directory")?;
    fs::create_dir_all(root).context("create workspace root")?;
    let root = root.canonicalize().context("resolve workspace root")?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).context("read zip entry")?;
        let name = entry.name().to_string();
        let Some(relative) = sanitize_entry_name(&name) else {
            bail!("archive entry escapes workspace root: {name}");
        };
        let dest = root.join(relative);
        // Belt and braces: the joined path must still live under the root.
        if !dest.starts_with(&root) {
            bail!("archive entry escapes workspace root: {name}");
        }

        if entry.is_dir() {
            fs::create_dir_all(&dest).context("create directory entry")?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("create parent directory")?;
        }
        let mut out = File::create(&dest).context("create extracted file")?;
        io::copy(&mut entry, &mut out).context("extract file contents")?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(mode));
        }
    }

    Ok(())
}

/// Normalize a zip entry name to a relative path with no traversal
/// components. Returns `None` for absolute paths, `..`, or drive prefixes.
fn sanitize_entry_name(name: &str) -> Option<std::path::PathBuf> {
    let path = Path::new(name);
    let mut clean = std::path::PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().expect("temp zip");
        let mut writer = ZipWriter::new(file.reopen().expect("reopen"));
        for (name, contents) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start entry");
            writer.write_all(contents).expect("write entry");
        }
        writer.finish().expect("finish zip");
        file
    }

    #[test]
    fn extracts_nested_files() {
        let archive = write_zip(&[
            ("README.md", b"hello".as_slice()),
            ("src/main.rs", b"fn main() {}".as_slice()),
        ]);
        let root = tempfile::tempdir().expect("workspace");
        extract_archive(archive.path(), root.path()).expect("extract");
        assert_eq!(
            fs::read_to_string(root.path().join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
    }

    #[test]
    fn rejects_parent_traversal() {
        let archive = write_zip(&[("../etc/passwd", b"root:x:0:0".as_slice())]);
        let root = tempfile::tempdir().expect("workspace");
        let err = extract_archive(archive.path(), root.path()).unwrap_err();
        assert!(err.to_string().contains("escapes workspace root"));
        // Nothing may have been written outside the root.
        assert!(!root.path().parent().unwrap().join("etc/passwd").exists());
    }

    #[test]
    fn rejects_absolute_entry_names() {
        let archive = write_zip(&[("/etc/passwd", b"root:x:0:0".as_slice())]);
        let root = tempfile::tempdir().expect("workspace");
        assert!(extract_archive(archive.path(), root.path()).is_err());
    }

    #[test]
    fn traversal_aborts_the_whole_extraction_midway() {
        let archive = write_zip(&[
            ("ok.txt", b"fine".as_slice()),
            ("nested/../../escape.txt", b"nope".as_slice()),
        ]);
        let root = tempfile::tempdir().expect("workspace");
        assert!(extract_archive(archive.path(), root.path()).is_err());
        assert!(!root.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn sanitize_collapses_curdir_but_not_parent() {
        assert_eq!(
            sanitize_entry_name("./a/./b.txt").unwrap(),
            Path::new("a/b.txt")
        );
        assert!(sanitize_entry_name("a/../../b").is_none());
        assert!(sanitize_entry_name("..").is_none());
        assert!(sanitize_entry_name("").is_none());
    }
}
