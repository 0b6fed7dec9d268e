//! Fetching OTA bundles from the artifact repository.
//!
//! `latest` resolves through the repo's storage API (two GETs: newest-entry
//! descriptor, then its metadata), downloads with a bounded retry budget,
//! and verifies size and MD5 before anyone is allowed to flash from the
//! file. Explicit URLs skip verification; the operator asked for exactly
//! that file.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use md5::{Digest, Md5};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("artifact request {url} failed: {detail}")]
    Http { url: String, detail: String },
    #[error("artifact api reply missing {field} (url {url})")]
    Api { url: String, field: &'static str },
    #[error("download of {url} still failing after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },
    #[error("package size mismatch for {path:?}: actual {actual} B, expect {expect} B")]
    SizeMismatch { path: PathBuf, actual: u64, expect: u64 },
    #[error("package md5 mismatch for {path:?}: actual {actual}, expect {expect}")]
    Md5Mismatch { path: PathBuf, actual: String, expect: String },
    #[error("i/o on {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("bad zip {path:?}: {source}")]
    Zip { path: PathBuf, source: zip::result::ZipError },
    #[error("{0} has no file name component")]
    BadUrl(String),
}

/// Byte-level observer for long downloads. The CLI hangs a progress bar off
/// this; the core does not care.
pub trait DownloadObserver {
    fn begin(&mut self, total_bytes: Option<u64>);
    fn chunk(&mut self, bytes: u64);
    fn end(&mut self);
}

pub struct NullObserver;

impl DownloadObserver for NullObserver {
    fn begin(&mut self, _total_bytes: Option<u64>) {}
    fn chunk(&mut self, _bytes: u64) {}
    fn end(&mut self) {}
}

/// One JSON GET with the default timeouts. For the odd API corner (package
/// pool listings) that does not fit [`ArtifactRepo`]'s two-hop shape.
pub fn get_json_url(url: &str) -> Result<serde_json::Value, FetchError> {
    get_json(&agent(), url)
}

/// Metadata of the newest package below one artifact path.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageInfo {
    pub download_uri: String,
    pub size: u64,
    pub md5: String,
}

pub struct ArtifactRepo {
    base: String,
    agent: ureq::Agent,
}

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(30))
        .timeout(Duration::from_secs(600))
        .build()
}

fn get_json(agent: &ureq::Agent, url: &str) -> Result<serde_json::Value, FetchError> {
    agent
        .get(url)
        .call()
        .map_err(|e| FetchError::Http { url: url.to_string(), detail: e.to_string() })?
        .into_json()
        .map_err(|e| FetchError::Http { url: url.to_string(), detail: e.to_string() })
}

/// jfrog-style APIs serialize numbers as strings; take either.
fn field_u64(value: &serde_json::Value, field: &'static str, url: &str) -> Result<u64, FetchError> {
    let v = &value[field];
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| FetchError::Api { url: url.to_string(), field })
}

fn field_str<'a>(
    value: &'a serde_json::Value,
    field: &'static str,
    url: &str,
) -> Result<&'a str, FetchError> {
    value[field].as_str().ok_or_else(|| FetchError::Api { url: url.to_string(), field })
}

impl ArtifactRepo {
    pub fn new(base: &str) -> Self {
        ArtifactRepo { base: base.trim_end_matches('/').to_string(), agent: agent() }
    }

    /// Resolve the newest package below `artifact_path`: one query for the
    /// newest entry's descriptor URI, one for its size/checksum/download URI.
    pub fn latest_package_info(&self, artifact_path: &str) -> Result<PackageInfo, FetchError> {
        let dir_url = format!("{}/{}?lastModified=", self.base, artifact_path.trim_matches('/'));
        let newest = get_json(&self.agent, &dir_url)?;
        let info_url = field_str(&newest, "uri", &dir_url)?.to_string();

        let info = get_json(&self.agent, &info_url)?;
        let package = PackageInfo {
            download_uri: field_str(&info, "downloadUri", &info_url)?.to_string(),
            size: field_u64(&info, "size", &info_url)?,
            md5: field_str(&info["checksums"], "md5", &info_url)?.to_string(),
        };
        log::info!("latest package: {} ({} B)", package.download_uri, package.size);
        Ok(package)
    }
}

pub struct Downloader {
    agent: ureq::Agent,
    max_retries: u32,
    retry_pause: Duration,
}

impl Default for Downloader {
    fn default() -> Self {
        Downloader { agent: agent(), max_retries: 10, retry_pause: Duration::from_secs(10) }
    }
}

impl Downloader {
    #[doc(hidden)]
    pub fn with_budget(max_retries: u32, retry_pause: Duration) -> Self {
        Downloader { agent: agent(), max_retries, retry_pause }
    }

    /// Download `url` into `dest_dir`, named after the URL's last path
    /// segment. A failed attempt removes the partial file before the next
    /// try; the budget exhausting is fatal.
    pub fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        observer: &mut dyn DownloadObserver,
    ) -> Result<PathBuf, FetchError> {
        let name = url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| FetchError::BadUrl(url.to_string()))?;
        let dest = dest_dir.join(name);

        for attempt in 1..=self.max_retries {
            match self.try_download(url, &dest, observer) {
                Ok(()) => {
                    log::info!("downloaded {} to {}", url, dest.display());
                    return Ok(dest);
                }
                Err(e) => {
                    log::warn!("download attempt {}/{} failed: {}", attempt, self.max_retries, e);
                    if dest.exists() {
                        let _ = fs::remove_file(&dest);
                    }
                    if attempt < self.max_retries {
                        thread::sleep(self.retry_pause.min(Duration::from_secs(attempt as u64 * 2)));
                    }
                }
            }
        }
        Err(FetchError::RetriesExhausted { url: url.to_string(), attempts: self.max_retries })
    }

    fn try_download(
        &self,
        url: &str,
        dest: &Path,
        observer: &mut dyn DownloadObserver,
    ) -> Result<(), FetchError> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| FetchError::Http { url: url.to_string(), detail: e.to_string() })?;
        let total = response
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok());
        observer.begin(total);

        let mut reader = response.into_reader();
        let mut file =
            File::create(dest).map_err(|source| FetchError::Io { path: dest.to_owned(), source })?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| FetchError::Http { url: url.to_string(), detail: e.to_string() })?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).map_err(|source| FetchError::Io { path: dest.to_owned(), source })?;
            observer.chunk(n as u64);
        }
        observer.end();
        Ok(())
    }
}

/// Size then MD5, streamed in 1 MiB chunks. A mismatch purges the file so a
/// later step cannot accidentally flash from it.
pub fn verify_package(path: &Path, expect_size: u64, expect_md5: &str) -> Result<(), FetchError> {
    let actual_size =
        fs::metadata(path).map_err(|source| FetchError::Io { path: path.to_owned(), source })?.len();
    if actual_size != expect_size {
        let _ = fs::remove_file(path);
        return Err(FetchError::SizeMismatch { path: path.to_owned(), actual: actual_size, expect: expect_size });
    }
    log::debug!("package size validate pass");

    let mut file = File::open(path).map_err(|source| FetchError::Io { path: path.to_owned(), source })?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|source| FetchError::Io { path: path.to_owned(), source })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let actual_md5 = hex::encode(hasher.finalize());
    if !actual_md5.eq_ignore_ascii_case(expect_md5) {
        let _ = fs::remove_file(path);
        return Err(FetchError::Md5Mismatch {
            path: path.to_owned(),
            actual: actual_md5,
            expect: expect_md5.to_string(),
        });
    }
    log::debug!("package md5 validate pass");
    Ok(())
}

/// Extract a bundle into `dest_dir`, creating it first if needed.
pub fn unzip(zip_path: &Path, dest_dir: &Path) -> Result<(), FetchError> {
    fs::create_dir_all(dest_dir).map_err(|source| FetchError::Io { path: dest_dir.to_owned(), source })?;
    let file = File::open(zip_path).map_err(|source| FetchError::Io { path: zip_path.to_owned(), source })?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|source| FetchError::Zip { path: zip_path.to_owned(), source })?;
    archive.extract(dest_dir).map_err(|source| FetchError::Zip { path: zip_path.to_owned(), source })?;
    log::info!("unzipped {} into {}", zip_path.display(), dest_dir.display());
    Ok(())
}

/// What the caller asked to flash from.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageSource {
    /// Resolve the newest bundle below the board's artifact path and verify
    /// size + MD5 after download.
    Latest,
    /// Download this URL as-is, unverified.
    Url(String),
}

/// End-to-end fetch: resolve (if `latest`), download, verify. Returns the
/// local path of the package zip.
pub fn fetch_package(
    repo: &ArtifactRepo,
    artifact_path: &str,
    source: &PackageSource,
    dest_dir: &Path,
    downloader: &Downloader,
    observer: &mut dyn DownloadObserver,
) -> Result<PathBuf, FetchError> {
    match source {
        PackageSource::Latest => {
            let info = repo.latest_package_info(artifact_path)?;
            let path = downloader.download(&info.download_uri, dest_dir, observer)?;
            verify_package(&path, info.size, &info.md5)?;
            Ok(path)
        }
        PackageSource::Url(url) => downloader.download(url, dest_dir, observer),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::Arc;

    use super::*;

    /// Tiny HTTP server with fixed routes, enough for ureq. `{ADDR}` inside
    /// a textual body is replaced with the server's own address so a route
    /// can refer back to the server.
    fn serve(routes: HashMap<String, (u16, Vec<u8>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let routes = Arc::new(routes);
        let self_addr = addr.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let routes = Arc::clone(&routes);
                let self_addr = self_addr.clone();
                thread::spawn(move || {
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut stream = stream;
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
                        return;
                    }
                    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
                    // drain headers
                    loop {
                        let mut header = String::new();
                        if reader.read_line(&mut header).unwrap_or(0) == 0 || header == "\r\n" {
                            break;
                        }
                    }
                    let (status, mut body) =
                        routes.get(&path).cloned().unwrap_or((404, b"not found".to_vec()));
                    if let Ok(text) = std::str::from_utf8(&body) {
                        if text.contains("{ADDR}") {
                            body = text.replace("{ADDR}", &self_addr).into_bytes();
                        }
                    }
                    let head = format!(
                        "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status,
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes());
                    let _ = stream.write_all(&body);
                });
            }
        });
        addr
    }

    #[test]
    fn md5_verify_accepts_good_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        fs::write(&path, b"abc").unwrap();
        verify_package(&path, 3, "900150983cd24fb0d6963f7d28e17f72").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn size_mismatch_purges_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        fs::write(&path, vec![0u8; 1024]).unwrap();
        let err = verify_package(&path, 2048, "whatever").unwrap_err();
        assert!(matches!(err, FetchError::SizeMismatch { actual: 1024, expect: 2048, .. }));
        assert!(!path.exists(), "failed package must not stay in the scratch dir");
    }

    #[test]
    fn md5_mismatch_purges_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        fs::write(&path, b"abc").unwrap();
        let err = verify_package(&path, 3, "00000000000000000000000000000000").unwrap_err();
        assert!(matches!(err, FetchError::Md5Mismatch { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn latest_info_walks_both_api_hops() {
        let mut routes = HashMap::new();
        routes.insert(
            "/repo/Dev/bsp/930?lastModified=".to_string(),
            (200, br#"{"uri": "http://{ADDR}/info"}"#.to_vec()),
        );
        routes.insert(
            "/info".to_string(),
            (
                200,
                br#"{"size": "5", "checksums": {"md5": "abc123"}, "downloadUri": "http://{ADDR}/pkg.zip"}"#
                    .to_vec(),
            ),
        );
        let addr = serve(routes);

        let repo = ArtifactRepo::new(&format!("http://{}/repo", addr));
        let info = repo.latest_package_info("Dev/bsp/930").unwrap();
        assert_eq!(info, PackageInfo {
            download_uri: format!("http://{}/pkg.zip", addr),
            size: 5,
            md5: "abc123".to_string(),
        });
    }

    #[test]
    fn download_retries_then_gives_up() {
        let mut routes = HashMap::new();
        routes.insert("/pkg.zip".to_string(), (500u16, b"boom".to_vec()));
        let addr = serve(routes);
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::with_budget(3, Duration::ZERO);
        let err = downloader
            .download(&format!("http://{}/pkg.zip", addr), dir.path(), &mut NullObserver)
            .unwrap_err();
        assert!(matches!(err, FetchError::RetriesExhausted { attempts: 3, .. }));
        assert!(!dir.path().join("pkg.zip").exists());
    }

    #[test]
    fn download_writes_file_and_reports_progress() {
        let mut routes = HashMap::new();
        routes.insert("/pkg.zip".to_string(), (200u16, vec![7u8; 4096]));
        let addr = serve(routes);
        let dir = tempfile::tempdir().unwrap();

        struct Counter(u64);
        impl DownloadObserver for Counter {
            fn begin(&mut self, total: Option<u64>) { assert_eq!(total, Some(4096)); }
            fn chunk(&mut self, bytes: u64) { self.0 += bytes; }
            fn end(&mut self) {}
        }

        let mut counter = Counter(0);
        let downloader = Downloader::with_budget(1, Duration::ZERO);
        let path =
            downloader.download(&format!("http://{}/pkg.zip", addr), dir.path(), &mut counter).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![7u8; 4096]);
        assert_eq!(counter.0, 4096);
    }

    #[test]
    fn unzip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bundle.zip");
        {
            let file = File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options: zip::write::SimpleFileOptions = Default::default();
            writer.start_file("IMG/SBL.img", options).unwrap();
            writer.write_all(b"sbl-bytes").unwrap();
            writer.start_file("data_board.json", options).unwrap();
            writer.write_all(b"{}").unwrap();
            writer.finish().unwrap();
        }
        let out = dir.path().join("out");
        unzip(&zip_path, &out).unwrap();
        assert_eq!(fs::read(out.join("IMG/SBL.img")).unwrap(), b"sbl-bytes");
        assert_eq!(fs::read(out.join("data_board.json")).unwrap(), b"{}");
    }
}
