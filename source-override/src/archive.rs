//! Tar artifact packing and extraction, both under hard size ceilings.

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("artifact is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("artifact expands to at least {size} bytes, exceeding the {limit} byte limit")]
    ExpandsTooLarge { size: u64, limit: u64 },

    #[error("failed to walk source tree: {0}")]
    Walk(#[from] ignore::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Packs `src` into a gzipped tar, honoring `.gitignore` and `.ignore`
/// files in the tree. VCS metadata directories are never packed.
///
/// The archive is staged in a single-use temp file under `tmp_root` so an
/// oversized result is never held in memory; the file is removed on every
/// exit path. Symlinks are recorded as link entries rather than followed.
pub fn pack(src: &Path, tmp_root: &Path, max_size: u64) -> Result<Vec<u8>, ArchiveError> {
    let staging = tempfile::Builder::new()
        .prefix("source-override-")
        .suffix(".tgz")
        .tempfile_in(tmp_root)?;

    let mut builder = tar::Builder::new(GzEncoder::new(staging.as_file(), Compression::default()));
    builder.follow_symlinks(false);

    let mut walk = ignore::WalkBuilder::new(src);
    walk.hidden(false)
        .parents(false)
        .git_global(false)
        .require_git(false)
        .filter_entry(|entry| !is_vcs_dir(entry));
    for entry in walk.build() {
        let entry = entry?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        if entry.file_type().is_some_and(|t| t.is_dir()) {
            builder.append_dir(rel, path)?;
        } else {
            builder.append_path_with_name(path, rel)?;
        }
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?;

    let size = staging.as_file().metadata()?.len();
    if size > max_size {
        return Err(ArchiveError::TooLarge {
            size,
            limit: max_size,
        });
    }

    let mut artifact = Vec::with_capacity(size as usize);
    staging.reopen()?.read_to_end(&mut artifact)?;
    Ok(artifact)
}

// `.gitignore` handling does not cover the VCS store itself; prune it so an
// artifact never carries repository history.
fn is_vcs_dir(entry: &ignore::DirEntry) -> bool {
    entry.file_type().is_some_and(|t| t.is_dir())
        && matches!(entry.file_name().to_str(), Some(".git" | ".hg" | ".svn"))
}

/// Unpacks an artifact into `dest`.
///
/// Symlink and hardlink entries are skipped so an artifact cannot point
/// outside its own tree, and entries escaping `dest` are refused. Claimed
/// entry sizes are totalled against `max_size` before anything larger is
/// written; the caller owns removing `dest` if extraction fails partway.
pub fn unpack(artifact: &[u8], dest: &Path, max_size: u64) -> Result<(), ArchiveError> {
    let mut archive = tar::Archive::new(GzDecoder::new(artifact));
    let mut total: u64 = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        match entry.header().entry_type() {
            tar::EntryType::Symlink | tar::EntryType::Link => {
                if let Ok(path) = entry.path() {
                    tracing::debug!(path = %path.display(), "skipping link entry");
                }
                continue;
            }
            _ => {}
        }
        total = total.saturating_add(entry.size());
        if total > max_size {
            return Err(ArchiveError::ExpandsTooLarge {
                size: total,
                limit: max_size,
            });
        }
        entry.unpack_in(dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn file_set(root: &Path) -> BTreeSet<PathBuf> {
        fn visit(root: &Path, dir: &Path, out: &mut BTreeSet<PathBuf>) {
            for entry in fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                let path = entry.path();
                if entry.file_type().unwrap().is_dir() {
                    visit(root, &path, out);
                } else {
                    out.insert(path.strip_prefix(root).unwrap().to_path_buf());
                }
            }
        }
        let mut out = BTreeSet::new();
        visit(root, root, &mut out);
        out
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "deploy/app.yaml", "kind: Deployment\n");
        write(dir.path(), "deploy/svc.yaml", "kind: Service\n");
        write(dir.path(), ".hidden", "kept\n");
        write(dir.path(), ".gitignore", "build/\n*.log\n");
        write(dir.path(), "build/out.bin", "binary\n");
        write(dir.path(), "debug.log", "noise\n");
        dir
    }

    #[test]
    fn round_trip_preserves_unignored_files() {
        let src = fixture();
        let tmp = tempfile::tempdir().unwrap();

        let artifact = pack(src.path(), tmp.path(), 1024 * 1024).unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack(&artifact, dest.path(), 1024 * 1024).unwrap();

        let files = file_set(dest.path());
        assert!(files.contains(&PathBuf::from("deploy/app.yaml")));
        assert!(files.contains(&PathBuf::from("deploy/svc.yaml")));
        assert!(files.contains(&PathBuf::from(".hidden")));
        assert!(files.contains(&PathBuf::from(".gitignore")));
        assert!(!files.contains(&PathBuf::from("build/out.bin")));
        assert!(!files.contains(&PathBuf::from("debug.log")));

        assert_eq!(
            fs::read_to_string(dest.path().join("deploy/app.yaml")).unwrap(),
            "kind: Deployment\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_extracted() {
        let src = fixture();
        std::os::unix::fs::symlink("deploy/app.yaml", src.path().join("link.yaml")).unwrap();
        let tmp = tempfile::tempdir().unwrap();

        let artifact = pack(src.path(), tmp.path(), 1024 * 1024).unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack(&artifact, dest.path(), 1024 * 1024).unwrap();
        assert!(!dest.path().join("link.yaml").exists());
        assert!(dest.path().join("deploy/app.yaml").exists());
    }

    #[test]
    fn vcs_directories_are_excluded() {
        let src = fixture();
        write(src.path(), ".git/HEAD", "ref: refs/heads/main\n");
        write(src.path(), ".git/objects/ab/cdef", "blob\n");
        write(src.path(), ".svn/entries", "12\n");
        let tmp = tempfile::tempdir().unwrap();

        let artifact = pack(src.path(), tmp.path(), 1024 * 1024).unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack(&artifact, dest.path(), 1024 * 1024).unwrap();

        let files = file_set(dest.path());
        assert!(!files.iter().any(|p| p.starts_with(".git")));
        assert!(!files.iter().any(|p| p.starts_with(".svn")));
        // Other dotfiles still travel.
        assert!(files.contains(&PathBuf::from(".hidden")));
        assert!(files.contains(&PathBuf::from("deploy/app.yaml")));
    }

    #[test]
    fn oversized_build_is_rejected_and_staging_removed() {
        let src = fixture();
        let tmp = tempfile::tempdir().unwrap();

        match pack(src.path(), tmp.path(), 16) {
            Err(ArchiveError::TooLarge { size, limit: 16 }) => assert!(size > 16),
            other => panic!("expected TooLarge, got {other:?}"),
        }

        // The staging file must not survive the failure.
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn oversized_extraction_is_rejected() {
        let src = fixture();
        let tmp = tempfile::tempdir().unwrap();
        let artifact = pack(src.path(), tmp.path(), 1024 * 1024).unwrap();

        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            unpack(&artifact, dest.path(), 4),
            Err(ArchiveError::ExpandsTooLarge { .. })
        ));
    }

    #[test]
    fn empty_directories_survive() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("empty")).unwrap();
        let tmp = tempfile::tempdir().unwrap();

        let artifact = pack(src.path(), tmp.path(), 1024 * 1024).unwrap();
        let dest = tempfile::tempdir().unwrap();
        unpack(&artifact, dest.path(), 1024 * 1024).unwrap();
        assert!(dest.path().join("empty").is_dir());
    }
}
