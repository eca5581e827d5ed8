//! Archive extraction and input discovery.

use super::{Stage, StageArtifacts, StageContext};
use crate::core::StageId;
use crate::errors::{DemflowError, Result};
use crate::utils::{with_suffix, FilePattern};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::ZipArchive;

/// Name of the extraction directory inside the per-input working directory.
const EXTRACTED_DIR: &str = "extracted";

/// Extraction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedInput {
    /// Root of the extracted tree.
    pub root: PathBuf,
    /// Directory actually holding the imagery, root or one level below.
    pub source_dir: PathBuf,
    /// Files matching the input pattern, sorted.
    pub files: Vec<PathBuf>,
}

impl StageArtifacts for ExtractedInput {
    fn primary(&self) -> &Path {
        &self.source_dir
    }
}

/// Unpacks an input archive.
///
/// A directory input is searched in place instead of being unpacked.
#[derive(Debug, Clone)]
pub struct ExtractionStage {
    pattern: FilePattern,
}

impl ExtractionStage {
    /// Creates a stage looking for files matching `input_pattern`, ignoring case.
    pub fn new(input_pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: FilePattern::case_insensitive(input_pattern)?,
        })
    }
}

#[async_trait]
impl Stage for ExtractionStage {
    type Input = PathBuf;
    type Output = ExtractedInput;

    fn id(&self) -> StageId {
        StageId::Extraction
    }

    async fn run(&self, ctx: &StageContext, archive: PathBuf) -> Result<ExtractedInput> {
        let target = ctx.work_dir().join(EXTRACTED_DIR);
        let pattern = self.pattern.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &target, &pattern))
            .await
            .map_err(|e| DemflowError::Io(std::io::Error::other(e)))?
    }
}

/// Extracts `archive` into `target` and locates the input files.
///
/// The archive is unpacked into a sibling staging directory that is renamed
/// to `target` only after the inputs were found. On failure neither
/// directory is left behind.
pub fn extract_archive(archive: &Path, target: &Path, pattern: &FilePattern) -> Result<ExtractedInput> {
    if archive.is_dir() {
        let (source_dir, files) = locate_inputs(archive, pattern)?
            .ok_or_else(|| no_input(archive, pattern))?;
        return Ok(ExtractedInput {
            root: archive.to_path_buf(),
            source_dir,
            files,
        });
    }

    let staging = with_suffix(target, ".partial");
    remove_dir_if_exists(&staging)?;
    remove_dir_if_exists(target)?;

    let located = unpack(archive, &staging).and_then(|()| {
        locate_inputs(&staging, pattern)?.ok_or_else(|| no_input(target, pattern))
    });
    let (staged_dir, staged_files) = match located {
        Ok(found) => found,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    if let Err(e) = std::fs::rename(&staging, target) {
        let _ = std::fs::remove_dir_all(&staging);
        let _ = std::fs::remove_dir_all(target);
        return Err(e.into());
    }

    let rebase = |path: &Path| match path.strip_prefix(&staging) {
        Ok(rel) if !rel.as_os_str().is_empty() => target.join(rel),
        _ => target.to_path_buf(),
    };
    let source_dir = rebase(&staged_dir);
    let files: Vec<PathBuf> = staged_files.iter().map(|f| rebase(f)).collect();

    info!(
        archive = %archive.display(),
        source_dir = %source_dir.display(),
        inputs = files.len(),
        "Archive extracted"
    );

    Ok(ExtractedInput {
        root: target.to_path_buf(),
        source_dir,
        files,
    })
}

fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let corrupt = |reason: String| DemflowError::ArchiveCorrupt {
        archive: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive).map_err(|e| corrupt(e.to_string()))?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| corrupt(e.to_string()))?;
    debug!(archive = %archive.display(), entries = zip.len(), "Unpacking archive");

    std::fs::create_dir_all(dest)?;
    zip.extract(dest).map_err(|e| corrupt(e.to_string()))
}

/// Finds the directory with the most matching files among `root` and its
/// direct subdirectories. Ties go to the shallower, then the first by name.
fn locate_inputs(root: &Path, pattern: &FilePattern) -> Result<Option<(PathBuf, Vec<PathBuf>)>> {
    let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();

    for entry in WalkDir::new(root).min_depth(1).max_depth(2).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || !pattern.matches(entry.path()) {
            continue;
        }
        if let Some(parent) = entry.path().parent() {
            by_dir
                .entry(parent.to_path_buf())
                .or_default()
                .push(entry.path().to_path_buf());
        }
    }

    Ok(by_dir.into_iter().max_by(|(dir_a, files_a), (dir_b, files_b)| {
        files_a
            .len()
            .cmp(&files_b.len())
            .then_with(|| dir_b.components().count().cmp(&dir_a.components().count()))
            .then_with(|| dir_b.cmp(dir_a))
    }))
}

fn no_input(dir: &Path, pattern: &FilePattern) -> DemflowError {
    DemflowError::NoInputFound {
        dir: dir.to_path_buf(),
        pattern: pattern.to_string(),
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_zip;

    fn pattern() -> FilePattern {
        FilePattern::case_insensitive("*.tif").unwrap()
    }

    #[test]
    fn test_root_level_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("scene.zip");
        write_zip(&archive, &[("a_Band3N.tif", b"n"), ("a_Band3B.tif", b"b")]).unwrap();
        let target = dir.path().join("extracted");

        let extracted = extract_archive(&archive, &target, &pattern()).unwrap();

        assert_eq!(extracted.source_dir, target);
        assert_eq!(extracted.files.len(), 2);
        assert!(extracted.files[0].starts_with(&target));
        assert!(!with_suffix(&target, ".partial").exists());
    }

    #[test]
    fn test_one_level_deep_archive_is_located_the_same() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("scene.zip");
        write_zip(
            &archive,
            &[
                ("AST_L1A_0031/a_Band3N.TIF", b"n"),
                ("AST_L1A_0031/a_Band3B.TIF", b"b"),
                ("README.txt", b"r"),
            ],
        )
        .unwrap();
        let target = dir.path().join("extracted");

        let extracted = extract_archive(&archive, &target, &pattern()).unwrap();

        assert_eq!(extracted.source_dir, target.join("AST_L1A_0031"));
        assert_eq!(extracted.files.len(), 2);
    }

    #[test]
    fn test_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"this is not a zip file").unwrap();
        let target = dir.path().join("extracted");

        let err = extract_archive(&archive, &target, &pattern()).unwrap_err();

        assert_eq!(err.code(), "ArchiveCorrupt");
        assert!(!target.exists());
        assert!(!with_suffix(&target, ".partial").exists());
    }

    #[test]
    fn test_missing_inputs_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.zip");
        write_zip(&archive, &[("notes.txt", b"no imagery")]).unwrap();
        let target = dir.path().join("extracted");

        let err = extract_archive(&archive, &target, &pattern()).unwrap_err();

        assert_eq!(err.code(), "NoInputFound");
        assert!(!target.exists());
        assert!(!with_suffix(&target, ".partial").exists());
    }

    #[test]
    fn test_directory_input_searched_in_place() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x_Band3N.tif"), b"n").unwrap();

        let extracted = extract_archive(dir.path(), &dir.path().join("unused"), &pattern()).unwrap();

        assert_eq!(extracted.source_dir, dir.path());
        assert!(!dir.path().join("unused").exists());
    }
}
