//! Where the images come from: an explicit directory, a local zip, a URL,
//! the artifact repo's newest bundle, or a local build tree as the fallback
//! when the operator passed nothing.

use std::fs;
use std::path::{Path, PathBuf};

use board_config::{Config, ConfigError};
use ota_fetch::{ArtifactRepo, DownloadObserver, Downloader, FetchError, PackageSource};
use thiserror::Error;

/// Extracted bundles land here and are purged on every new upgrade.
pub const SCRATCH_DIR: &str = "/tmp/img_packages";

/// Storage-API root of the artifact repository.
pub const ARTIFACT_REPO_BASE: &str =
    "https://jfrog.carizon.work/artifactory/api/storage/project-snapshot-local";

/// Pattern of the local build output that substitutes for a package when
/// none is given.
const LOCAL_TREE_GLOB: &str = "./out/release*/target/product/img_packages";

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("i/o on {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("no package given and no local build tree matches {}", LOCAL_TREE_GLOB)]
    NoLocalTree,
}

/// How the operator pointed at the update bundle.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageLink {
    /// Newest verified bundle below the board's artifact path.
    Latest,
    /// Download exactly this zip, unverified.
    Url(String),
    /// A zip already on disk.
    File(PathBuf),
    /// A directory that already holds extracted images.
    Dir(PathBuf),
}

impl PackageLink {
    pub fn parse(s: &str) -> PackageLink {
        if s == "latest" {
            return PackageLink::Latest;
        }
        let path = Path::new(s);
        if path.is_dir() {
            PackageLink::Dir(path.to_owned())
        } else if path.is_file() {
            PackageLink::File(path.to_owned())
        } else {
            PackageLink::Url(s.to_string())
        }
    }
}

/// First build tree matching the release glob, if any.
pub fn local_tree_fallback() -> Option<PathBuf> {
    let paths = glob::glob(LOCAL_TREE_GLOB).ok()?;
    paths.filter_map(Result::ok).find(|p| p.is_dir())
}

fn reset_scratch(scratch: &Path) -> Result<(), StageError> {
    if scratch.exists() {
        fs::remove_dir_all(scratch)
            .map_err(|source| StageError::Io { path: scratch.to_owned(), source })?;
    }
    fs::create_dir_all(scratch).map_err(|source| StageError::Io { path: scratch.to_owned(), source })?;
    Ok(())
}

/// Produce a directory holding the images to flash or load. Bundles are
/// unpacked into a freshly reset `scratch`; a `Dir` link is used in place.
pub fn stage(
    link: Option<&PackageLink>,
    cfg: &Config,
    board: &str,
    scratch: &Path,
    downloader: &Downloader,
    observer: &mut dyn DownloadObserver,
) -> Result<PathBuf, StageError> {
    let link = match link {
        None => {
            let tree = local_tree_fallback().ok_or(StageError::NoLocalTree)?;
            log::info!("no package given, using local build tree {}", tree.display());
            return Ok(tree);
        }
        Some(link) => link,
    };

    match link {
        PackageLink::Dir(dir) => {
            log::info!("using image directory {}", dir.display());
            Ok(dir.clone())
        }
        PackageLink::File(zip) => {
            reset_scratch(scratch)?;
            ota_fetch::unzip(zip, scratch)?;
            Ok(scratch.to_owned())
        }
        PackageLink::Url(_) | PackageLink::Latest => {
            reset_scratch(scratch)?;
            let source = match link {
                PackageLink::Url(url) => PackageSource::Url(url.clone()),
                _ => PackageSource::Latest,
            };
            let artifact_path = cfg.board(board)?.artifact_path.clone();
            let repo = ArtifactRepo::new(ARTIFACT_REPO_BASE);
            let download_dir = scratch.parent().map(Path::to_owned).unwrap_or_else(std::env::temp_dir);
            let zip =
                ota_fetch::fetch_package(&repo, &artifact_path, &source, &download_dir, downloader, observer)?;
            log::info!("using ota package {}", zip.display());
            ota_fetch::unzip(&zip, scratch)?;
            Ok(scratch.to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parse_prefers_filesystem_over_url() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("pkg.zip");
        fs::write(&zip, b"z").unwrap();

        assert_eq!(PackageLink::parse("latest"), PackageLink::Latest);
        assert_eq!(PackageLink::parse(zip.to_str().unwrap()), PackageLink::File(zip.clone()));
        assert_eq!(
            PackageLink::parse(dir.path().to_str().unwrap()),
            PackageLink::Dir(dir.path().to_owned())
        );
        assert_eq!(
            PackageLink::parse("https://repo.example/pkg.zip"),
            PackageLink::Url("https://repo.example/pkg.zip".to_string())
        );
    }

    #[test]
    fn staging_a_zip_resets_the_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("leftover.img"), b"old").unwrap();

        let zip_path = dir.path().join("bundle.zip");
        {
            let file = fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options: zip::write::SimpleFileOptions = Default::default();
            writer.start_file("boot_a.img", options).unwrap();
            writer.write_all(b"img").unwrap();
            writer.finish().unwrap();
        }

        let cfg_dir = tempfile::tempdir().unwrap();
        let cfg = crate::testcfg::write_config(cfg_dir.path());
        let out = stage(
            Some(&PackageLink::File(zip_path)),
            &cfg,
            "cvm-a55",
            &scratch,
            &Downloader::with_budget(1, std::time::Duration::ZERO),
            &mut ota_fetch::NullObserver,
        )
        .unwrap();
        assert_eq!(out, scratch);
        assert!(out.join("boot_a.img").exists());
        assert!(!out.join("leftover.img").exists(), "scratch must be purged before extraction");
    }
}
