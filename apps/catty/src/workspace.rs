//! Workspace snapshot: walk the current directory, zip what matters, and
//! push it to the executor's one-shot upload endpoint.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use ignore::WalkBuilder;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Names excluded regardless of any ignore file: version-control metadata,
/// dependency caches, virtualenvs, environment files, logs, OS droppings.
/// A match on any path component prunes the whole subtree.
const BUILTIN_IGNORES: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".env",
    ".DS_Store",
];

const BUILTIN_IGNORED_EXTENSIONS: &[&str] = &["pyc", "log"];

fn is_builtin_ignored(name: &OsStr) -> bool {
    if BUILTIN_IGNORES.iter().any(|ignored| name == *ignored) {
        return true;
    }
    Path::new(name)
        .extension()
        .and_then(OsStr::to_str)
        .map(|ext| BUILTIN_IGNORED_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Deflate-compressed zip of `dir`, honoring the built-in excludes plus the
/// directory's `.gitignore` if present.
pub fn build_archive(dir: &Path) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut cursor);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let walker = WalkBuilder::new(dir)
        .hidden(false)
        .git_ignore(true)
        .require_git(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(|entry| !is_builtin_ignored(entry.file_name()))
        .build();

    for entry in walker {
        let entry = entry.context("walk workspace")?;
        if entry.depth() == 0 {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .context("relativize workspace path")?;
        let name = relative.to_string_lossy().replace('\\', "/");

        let file_type = entry.file_type().context("stat workspace entry")?;
        if file_type.is_dir() {
            zip.add_directory(format!("{name}/"), options)
                .context("add directory entry")?;
        } else if file_type.is_file() {
            zip.start_file(name.as_str(), options)
                .context("add file entry")?;
            let mut file = File::open(entry.path()).context("open workspace file")?;
            std::io::copy(&mut file, &mut zip).context("copy file into archive")?;
        }
        // Symlinks and other specials are skipped: the remote side has no
        // use for links pointing at the local filesystem.
    }

    zip.finish().context("finalize archive")?;
    Ok(cursor.into_inner())
}

/// Convert the duplex connect URL into the executor's upload endpoint.
pub fn upload_url(connect_url: &str) -> String {
    connect_url
        .replacen("wss://", "https://", 1)
        .replacen("ws://", "http://", 1)
        .replacen("/connect", "/upload", 1)
}

/// POST the archive with the capability bearer and the instance-pin headers
/// returned at session creation.
pub async fn upload(
    url: &str,
    token: &str,
    pin_headers: &HashMap<String, String>,
    archive: Vec<u8>,
) -> Result<()> {
    let client = reqwest::Client::new();
    let mut request = client
        .post(url)
        .bearer_auth(token)
        .header(reqwest::header::CONTENT_TYPE, "application/zip")
        .body(archive);
    for (name, value) in pin_headers {
        request = request.header(name, value);
    }

    let response = request.send().await.context("send upload request")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("upload failed: {status} - {body}");
    }
    Ok(())
}

pub fn archive_current_dir() -> Result<Vec<u8>> {
    let cwd = std::env::current_dir().context("get current directory")?;
    build_archive(&cwd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;

    fn archive_names(root: &Path) -> HashSet<String> {
        let bytes = build_archive(root).expect("build archive");
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).expect("read archive");
        (0..zip.len())
            .map(|index| zip.by_index(index).unwrap().name().to_string())
            .collect()
    }

    fn touch(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn archives_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("main.py"), "print('hi')");
        touch(&dir.path().join("src/lib.rs"), "pub fn x() {}");
        let names = archive_names(dir.path());
        assert!(names.contains("main.py"));
        assert!(names.contains("src/lib.rs"));
    }

    #[test]
    fn builtin_excludes_prune_whole_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("app.js"), "ok");
        touch(&dir.path().join("node_modules/left-pad/index.js"), "no");
        touch(&dir.path().join("vendor/node_modules/x.js"), "no");
        touch(&dir.path().join(".git/HEAD"), "ref: main");
        touch(&dir.path().join("debug.log"), "no");
        touch(&dir.path().join("cache.pyc"), "no");

        let names = archive_names(dir.path());
        assert!(names.contains("app.js"));
        assert!(!names.iter().any(|name| name.contains("node_modules")));
        assert!(!names.iter().any(|name| name.contains(".git")));
        assert!(!names.contains("debug.log"));
        assert!(!names.contains("cache.pyc"));
    }

    #[test]
    fn gitignore_rules_apply() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(".gitignore"), "dist/\nsecret.txt\n");
        touch(&dir.path().join("keep.txt"), "yes");
        touch(&dir.path().join("secret.txt"), "no");
        touch(&dir.path().join("dist/bundle.js"), "no");

        let names = archive_names(dir.path());
        assert!(names.contains("keep.txt"));
        assert!(!names.contains("secret.txt"));
        assert!(!names.iter().any(|name| name.starts_with("dist/")));
    }

    #[test]
    fn archive_round_trips_contents() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("notes.md"), "remember the milk");

        let bytes = build_archive(dir.path()).unwrap();
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut entry = zip.by_name("notes.md").unwrap();
        let mut contents = String::new();
        std::io::Read::read_to_string(&mut entry, &mut contents).unwrap();
        assert_eq!(contents, "remember the milk");
    }

    #[test]
    fn upload_url_rewrites_scheme_and_path() {
        assert_eq!(
            upload_url("wss://catty-exec.fly.dev/connect"),
            "https://catty-exec.fly.dev/upload"
        );
        assert_eq!(
            upload_url("ws://localhost:8080/connect"),
            "http://localhost:8080/upload"
        );
    }
}
