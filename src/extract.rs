//! Selective extraction of downloaded `.SAFE` zip archives.
use crate::error::ExtractionError;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

pub struct ArchiveExtractor;

impl ArchiveExtractor {
    /// True when `member` should be extracted for the polarization `filter`.
    /// Matching is a case-insensitive substring test; no filter keeps everything.
    pub fn matches(member: &str, filter: Option<&str>) -> bool {
        match filter {
            None => true,
            Some(filter) if filter.is_empty() => true,
            Some(filter) => member.to_lowercase().contains(&filter.to_lowercase()),
        }
    }

    /// Extract the members of `archive_path` selected by `polarization` into
    /// `output_dir`, keeping the paths they have inside the archive.
    ///
    /// Returns the top-level entries written (normally the `.SAFE` directory).
    pub fn extract(
        archive_path: &Path,
        polarization: Option<&str>,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, ExtractionError> {
        let file = File::open(archive_path).map_err(|source| ExtractionError::Open {
            path: archive_path.to_path_buf(),
            source,
        })?;
        let zip_err = |source: zip::result::ZipError| ExtractionError::Zip {
            path: archive_path.to_path_buf(),
            source,
        };
        let write_err = |path: &Path, source: io::Error| ExtractionError::Write {
            archive: archive_path.to_path_buf(),
            path: path.to_path_buf(),
            source,
        };

        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(zip_err)?;
        let mut roots: Vec<PathBuf> = vec![];
        let mut extracted = 0;

        for i in 0..archive.len() {
            let mut member = archive.by_index(i).map_err(zip_err)?;
            if !Self::matches(member.name(), polarization) {
                continue;
            }
            let Some(relative) = member.enclosed_name() else {
                warn!(member = member.name(), "Skipping archive member outside output directory");
                continue;
            };

            let target = output_dir.join(&relative);
            if member.is_dir() {
                fs::create_dir_all(&target).map_err(|e| write_err(&target, e))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| write_err(parent, e))?;
                }
                let mut out = File::create(&target).map_err(|e| write_err(&target, e))?;
                io::copy(&mut member, &mut out).map_err(|source| ExtractionError::Member {
                    archive: archive_path.to_path_buf(),
                    member: member.name().to_string(),
                    source,
                })?;
                extracted += 1;
            }

            if let Some(root) = relative.components().next() {
                let root = output_dir.join(root);
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
        }

        debug!(?archive_path, extracted, "Extracted archive members");
        Ok(roots)
    }
}

/// Extract every `.zip` in `archives` into `output_dir`.
///
/// Stops at the first archive that fails; archives extracted before it are
/// left on disk. Paths that are missing or are not zip files are skipped.
pub fn unzip_all(
    archives: &[PathBuf],
    polarization: Option<&str>,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, ExtractionError> {
    let mut products: Vec<PathBuf> = vec![];
    for archive in archives {
        let is_zip = archive
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if !is_zip || !archive.is_file() {
            warn!(?archive, "Not a downloaded zip archive, skipping");
            continue;
        }

        info!(?archive, "Unzipping");
        for root in ArchiveExtractor::extract(archive, polarization, output_dir)? {
            if !products.contains(&root) {
                products.push(root);
            }
        }
    }
    Ok(products)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    pub(crate) const SAFE_MEMBERS: [&str; 5] = [
        "S1A_IW_SLC__1SDV_20200110T161537.SAFE/manifest.safe",
        "S1A_IW_SLC__1SDV_20200110T161537.SAFE/measurement/s1a-iw1-slc-vv-20200110t161539.tiff",
        "S1A_IW_SLC__1SDV_20200110T161537.SAFE/measurement/s1a-iw1-slc-vh-20200110t161539.tiff",
        "S1A_IW_SLC__1SDV_20200110T161537.SAFE/annotation/s1a-iw1-slc-VV-20200110t161539.xml",
        "S1A_IW_SLC__1SDV_20200110T161537.SAFE/annotation/s1a-iw1-slc-VH-20200110t161539.xml",
    ];

    const SAFE_ROOT: &str = "S1A_IW_SLC__1SDV_20200110T161537.SAFE";

    /// `SAFE_MEMBERS` moved under a different product directory.
    pub(crate) fn product_members(root: &str) -> Vec<String> {
        SAFE_MEMBERS
            .iter()
            .map(|member| member.replacen(SAFE_ROOT, root, 1))
            .collect()
    }

    pub(crate) fn write_test_archive<S: AsRef<str>>(path: &Path, members: &[S]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        let mut roots: Vec<&str> = vec![];
        for member in members {
            let root = member.as_ref().split('/').next().unwrap();
            if !roots.contains(&root) {
                zip.add_directory(format!("{root}/"), options).unwrap();
                roots.push(root);
            }
        }
        for member in members {
            let member = member.as_ref();
            zip.start_file(member, options).unwrap();
            zip.write_all(member.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    fn extracted_files(dir: &Path) -> Vec<String> {
        let mut files = vec![];
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let relative = path.strip_prefix(dir).unwrap();
                    files.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        files.sort();
        files
    }

    #[test]
    fn test_matches() {
        assert!(ArchiveExtractor::matches("a/s1a-iw1-slc-VV-1.tiff", Some("vv")));
        assert!(ArchiveExtractor::matches("a/s1a-iw1-slc-vv-1.tiff", Some("VV")));
        assert!(!ArchiveExtractor::matches("a/s1a-iw1-slc-vh-1.tiff", Some("vv")));
        assert!(ArchiveExtractor::matches("a/manifest.safe", None));
        assert!(ArchiveExtractor::matches("a/manifest.safe", Some("")));
    }

    #[test]
    fn test_extract_polarization() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("scene.zip");
        write_test_archive(&archive, &SAFE_MEMBERS);
        let out = dir.path().join("out");

        let roots = ArchiveExtractor::extract(&archive, Some("vv"), &out).unwrap();

        assert_eq!(roots, vec![out.join("S1A_IW_SLC__1SDV_20200110T161537.SAFE")]);
        let files = extracted_files(&out);
        assert_eq!(
            files,
            vec![
                "S1A_IW_SLC__1SDV_20200110T161537.SAFE/annotation/s1a-iw1-slc-VV-20200110t161539.xml",
                "S1A_IW_SLC__1SDV_20200110T161537.SAFE/measurement/s1a-iw1-slc-vv-20200110t161539.tiff",
            ]
        );
        assert!(files.iter().all(|f| f.to_lowercase().contains("vv")));
    }

    #[test]
    fn test_extract_everything() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("scene.zip");
        write_test_archive(&archive, &SAFE_MEMBERS);
        let out = dir.path().join("out");

        ArchiveExtractor::extract(&archive, None, &out).unwrap();

        let mut expected: Vec<String> = SAFE_MEMBERS.iter().map(|m| m.to_string()).collect();
        expected.sort();
        assert_eq!(extracted_files(&out), expected);
        let manifest = out.join(SAFE_MEMBERS[0]);
        assert_eq!(fs::read_to_string(manifest).unwrap(), SAFE_MEMBERS[0]);
    }

    #[test]
    fn test_extract_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"PK\x03\x04 truncated").unwrap();

        let err = ArchiveExtractor::extract(&archive, None, dir.path()).unwrap_err();
        assert!(matches!(err, ExtractionError::Zip { .. }));
    }

    #[test]
    fn test_extract_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            ArchiveExtractor::extract(&dir.path().join("nope.zip"), None, dir.path()).unwrap_err();
        assert!(matches!(err, ExtractionError::Open { .. }));
    }

    #[test]
    fn test_unzip_all_keeps_earlier_extractions() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.zip");
        let bad = dir.path().join("bad.zip");
        let not_zip = dir.path().join("notes.txt");
        write_test_archive(&good, &SAFE_MEMBERS);
        fs::write(&bad, b"garbage").unwrap();
        fs::write(&not_zip, b"hello").unwrap();
        let out = dir.path().join("out");

        let err = unzip_all(&[not_zip, good, bad.clone()], Some("vv"), &out).unwrap_err();
        match err {
            ExtractionError::Zip { path, .. } => assert_eq!(path, bad),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(extracted_files(&out).len(), 2);
    }

    #[test]
    fn test_unzip_all_returns_products() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.zip");
        let second = dir.path().join("second.zip");
        write_test_archive(&first, &SAFE_MEMBERS);
        write_test_archive(&second, &SAFE_MEMBERS[..2]);
        let out = dir.path().join("out");

        let products = unzip_all(&[first, second], None, &out).unwrap();
        assert_eq!(
            products,
            vec![out.join("S1A_IW_SLC__1SDV_20200110T161537.SAFE")]
        );
    }
}
