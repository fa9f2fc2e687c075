use crate::error::{DownloadError, Error, Result};
use crate::extract::unzip_all;
use crate::query::QueryConfig;
use crate::search::SearchResult;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::process::Command;
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "urls.txt";

/// Download URLs, one per line, in search result order.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadManifest {
    urls: Vec<String>,
}

impl DownloadManifest {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }

    pub fn from_result(result: &SearchResult) -> Self {
        Self::new(result.urls().into_iter().map(String::from).collect())
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn read<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        let urls = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(String::from)
            .collect();
        Ok(Self { urls })
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let mut content = String::new();
        for url in self.urls.iter() {
            content.push_str(url);
            content.push('\n');
        }
        fs::write(path, content)
    }
}

/// An external tool that fetches every URL in a manifest file.
///
/// Skipping or resuming files already present in `destination` is up to the tool.
pub trait BatchDownloader {
    /// Short name, also used for the log file name.
    fn name(&self) -> &str;

    /// Run to completion with combined stdout and stderr written to `log_file`.
    async fn run(
        &self,
        manifest: &Path,
        destination: &Path,
        resume: bool,
        log_file: &Path,
    ) -> std::result::Result<ExitStatus, DownloadError>;
}

/// aria2c, authenticating through the user's `~/.netrc`.
pub struct Aria2c {
    program: PathBuf,
}

impl Aria2c {
    pub fn new() -> Self {
        Self::with_program("aria2c")
    }

    pub fn with_program<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Aria2c {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchDownloader for Aria2c {
    fn name(&self) -> &str {
        "aria2c"
    }

    async fn run(
        &self,
        manifest: &Path,
        destination: &Path,
        resume: bool,
        log_file: &Path,
    ) -> std::result::Result<ExitStatus, DownloadError> {
        warn_if_no_netrc();

        let io_err = |source: std::io::Error| DownloadError::Io {
            path: log_file.to_path_buf(),
            source,
        };
        let stdout = File::create(log_file).map_err(io_err)?;
        let stderr = stdout.try_clone().map_err(io_err)?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("-i").arg(manifest).arg("-d").arg(destination);
        if resume {
            cmd.arg("--continue=true");
        }
        info!(command = ?cmd.as_std(), "Downloading with aria2c");

        cmd.stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .await
            .map_err(|source| DownloadError::Spawn {
                tool: self.name().to_string(),
                source,
            })
    }
}

fn warn_if_no_netrc() {
    if let Some(home) = dirs::home_dir() {
        let netrc = home.join(".netrc");
        if !netrc.exists() {
            warn!(?netrc, "No .netrc found, Earthdata downloads will likely fail");
        }
    }
}

/// Writes the manifest, runs the batch downloader and optionally unzips.
pub struct DownloadOrchestrator<D: BatchDownloader> {
    downloader: D,
    log_dir: PathBuf,
    unzip: bool,
    polarization: Option<String>,
}

impl<D: BatchDownloader> DownloadOrchestrator<D> {
    pub fn new(downloader: D) -> Self {
        Self {
            downloader,
            log_dir: PathBuf::from("."),
            unzip: false,
            polarization: None,
        }
    }

    /// Unzip and polarization settings taken from `config`.
    pub fn from_config(downloader: D, config: &QueryConfig) -> Self {
        let orchestrator = Self::new(downloader);
        if config.unzip() {
            orchestrator.with_unzip(config.polarization())
        } else {
            orchestrator
        }
    }

    pub fn with_log_dir<P: Into<PathBuf>>(mut self, log_dir: P) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_unzip(mut self, polarization: Option<&str>) -> Self {
        self.unzip = true;
        self.polarization = polarization.map(String::from);
        self
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.downloader.name()))
    }

    /// Fetch every feature of `result` into `output_dir`.
    ///
    /// Returns `output_dir/<fileName>` for each feature, or the extracted
    /// product directories when unzipping. An empty result fails before
    /// anything is written.
    pub async fn download(&self, result: &SearchResult, output_dir: &Path) -> Result<Vec<PathBuf>> {
        if result.is_empty() {
            return Err(Error::EmptyResult);
        }
        let started = Instant::now();

        info!(?output_dir, "Saving to");
        create_dir(output_dir)?;
        create_dir(&self.log_dir)?;

        let manifest_path = output_dir.join(MANIFEST_FILE);
        DownloadManifest::from_result(result)
            .write(&manifest_path)
            .map_err(|source| DownloadError::Io {
                path: manifest_path.clone(),
                source,
            })?;

        let log_file = self.log_file();
        let status = self
            .downloader
            .run(&manifest_path, output_dir, true, &log_file)
            .await?;
        if !status.success() {
            return Err(DownloadError::ExitStatus {
                tool: self.downloader.name().to_string(),
                status,
                log: log_file,
            }
            .into());
        }

        let mut files: Vec<PathBuf> = result
            .file_names()
            .into_iter()
            .map(|name| output_dir.join(name))
            .collect();

        if self.unzip {
            info!("Unzipping files...");
            files = unzip_all(&files, self.polarization.as_deref(), output_dir)?;
        }

        info!(elapsed = ?started.elapsed(), count = files.len(), "Download finished");
        Ok(files)
    }
}

fn create_dir(path: &Path) -> std::result::Result<(), DownloadError> {
    fs::create_dir_all(path).map_err(|source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::tests::{product_members, write_test_archive};
    use crate::search::tests::TWO_FEATURES;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::Mutex;

    /// Records its invocations and writes a small `.SAFE` archive for every URL.
    struct FakeDownloader {
        exit_code: i32,
        calls: Mutex<Vec<(PathBuf, PathBuf, bool, PathBuf)>>,
    }

    impl FakeDownloader {
        fn new(exit_code: i32) -> Self {
            Self {
                exit_code,
                calls: Mutex::new(vec![]),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl BatchDownloader for FakeDownloader {
        fn name(&self) -> &str {
            "fake"
        }

        async fn run(
            &self,
            manifest: &Path,
            destination: &Path,
            resume: bool,
            log_file: &Path,
        ) -> std::result::Result<ExitStatus, DownloadError> {
            self.calls.lock().unwrap().push((
                manifest.to_path_buf(),
                destination.to_path_buf(),
                resume,
                log_file.to_path_buf(),
            ));
            fs::write(log_file, "fake log").unwrap();
            for url in DownloadManifest::read(manifest).unwrap().urls() {
                let name = url.rsplit('/').next().unwrap();
                let root = product_root(name);
                write_test_archive(&destination.join(name), product_members(&root).as_slice());
            }
            Ok(ExitStatus::from_raw(self.exit_code << 8))
        }
    }

    /// `S1A_..._8B0C.zip` unpacks to `S1A_..._8B0C.SAFE`.
    fn product_root(file_name: &str) -> String {
        format!("{}.SAFE", file_name.trim_end_matches(".zip"))
    }

    fn result() -> SearchResult {
        SearchResult::from_geojson(TWO_FEATURES).unwrap()
    }

    #[test]
    fn test_manifest_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let manifest = DownloadManifest::from_result(&result());
        manifest.write(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with(".zip\n"));
        assert_eq!(DownloadManifest::read(&path).unwrap(), manifest);
    }

    #[tokio::test]
    async fn test_empty_result_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("never");
        let orchestrator = DownloadOrchestrator::new(FakeDownloader::new(0))
            .with_log_dir(dir.path().join("logs"));

        let err = orchestrator
            .download(&SearchResult::default(), &output_dir)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::EmptyResult));
        assert!(!output_dir.exists());
        assert_eq!(orchestrator.downloader.call_count(), 0);
    }

    #[tokio::test]
    async fn test_download_returns_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("data/nested");
        let log_dir = dir.path().join("logs");
        let orchestrator = DownloadOrchestrator::new(FakeDownloader::new(0)).with_log_dir(&log_dir);

        let files = orchestrator.download(&result(), &output_dir).await.unwrap();

        assert_eq!(
            files,
            vec![
                output_dir.join("S1B_IW_SLC__1SDV_20200104T161453_20200104T161520_019668_025298_6B5A.zip"),
                output_dir.join("S1A_IW_SLC__1SDV_20200110T161537_20200110T161604_030739_038648_8B0C.zip"),
            ]
        );
        let calls = orchestrator.downloader.calls.lock().unwrap();
        let (manifest, destination, resume, log_file) = &calls[0];
        assert_eq!(manifest, &output_dir.join(MANIFEST_FILE));
        assert_eq!(destination, &output_dir);
        assert!(*resume);
        assert_eq!(log_file, &log_dir.join("fake.log"));
        assert_eq!(
            DownloadManifest::read(manifest).unwrap().urls(),
            result().urls()
        );
    }

    #[tokio::test]
    async fn test_download_surfaces_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            DownloadOrchestrator::new(FakeDownloader::new(3)).with_log_dir(dir.path());

        let err = orchestrator
            .download(&result(), &dir.path().join("data"))
            .await
            .unwrap_err();

        match err {
            Error::Download(DownloadError::ExitStatus { status, log, .. }) => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(log, dir.path().join("fake.log"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_download_and_unzip() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("data");
        let orchestrator = DownloadOrchestrator::new(FakeDownloader::new(0))
            .with_log_dir(dir.path())
            .with_unzip(Some("vv"));

        let files = orchestrator.download(&result(), &output_dir).await.unwrap();

        let products: Vec<PathBuf> = result()
            .file_names()
            .iter()
            .map(|name| output_dir.join(product_root(name)))
            .collect();
        assert_eq!(
            products,
            vec![
                output_dir.join("S1B_IW_SLC__1SDV_20200104T161453_20200104T161520_019668_025298_6B5A.SAFE"),
                output_dir.join("S1A_IW_SLC__1SDV_20200110T161537_20200110T161604_030739_038648_8B0C.SAFE"),
            ]
        );
        assert_eq!(files, products);
        for product in &products {
            assert!(product.join("measurement/s1a-iw1-slc-vv-20200110t161539.tiff").exists());
            assert!(!product.join("measurement/s1a-iw1-slc-vh-20200110t161539.tiff").exists());
        }
    }

    #[tokio::test]
    async fn test_missing_tool_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            DownloadOrchestrator::new(Aria2c::with_program("/nonexistent/aria2c"))
                .with_log_dir(dir.path());

        let err = orchestrator
            .download(&result(), &dir.path().join("data"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Download(DownloadError::Spawn { .. })));
        assert!(dir.path().join("aria2c.log").exists());
    }
}
