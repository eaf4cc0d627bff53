use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use crate::channel::{shell_quote, RemoteChannel, RemoteHost};
use crate::constants::MANIFEST_NAME;
use crate::error::CutoverError;
use crate::utils::{copy_dir, extract_tar_gz, is_tar_gz, render_template, sha256_file};

/// A fetched, immutable release bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub reference: String,
    pub sha256: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactSource {
    S3(String),
    Http(String),
    Local(PathBuf),
}

impl ArtifactSource {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            bail!("Artifact reference is empty");
        }
        if reference.starts_with("s3://") {
            return Ok(Self::S3(reference.to_string()));
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Ok(Self::Http(reference.to_string()));
        }
        let path = reference.strip_prefix("file://").unwrap_or(reference);
        Ok(Self::Local(PathBuf::from(path)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub sha256: String,
}

/// Resolves an artifact reference into an unpacked bundle under a staging dir.
pub struct ArtifactFetcher<'a, C: RemoteChannel + ?Sized> {
    channel: &'a C,
    host: &'a RemoteHost,
    fetch_command: &'a str,
    timeout: Duration,
}

impl<'a, C: RemoteChannel + ?Sized> ArtifactFetcher<'a, C> {
    pub fn new(
        channel: &'a C,
        host: &'a RemoteHost,
        fetch_command: &'a str,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            host,
            fetch_command,
            timeout,
        }
    }

    /// Fetches `reference` and unpacks it into `staging/app`, returning the artifact
    /// and the bundle root.
    pub fn fetch(&self, reference: &str, staging: &Path) -> Result<(Artifact, PathBuf)> {
        let missing = |reason: String| CutoverError::ArtifactMissing {
            reference: reference.to_string(),
            reason,
        };
        let source = ArtifactSource::parse(reference)?;
        let download_dir = staging.join("download");
        let unpack_dir = staging.join("app");
        fs::create_dir_all(&download_dir)
            .with_context(|| format!("Failed to create {}", download_dir.display()))?;

        let fetched = match source {
            ArtifactSource::S3(url) => {
                let dest = download_dir.join(file_name_of(&url));
                let command = render_template(
                    self.fetch_command,
                    &[
                        ("reference", &shell_quote(&url)),
                        ("dest", &shell_quote(&dest.display().to_string())),
                    ],
                );
                self.channel
                    .exec_checked(self.host, &command, self.timeout)
                    .map_err(|err| missing(err.to_string()))?;
                if !dest.is_file() {
                    let reason = format!("fetch produced no file at {}", dest.display());
                    return Err(missing(reason).into());
                }
                dest
            }
            ArtifactSource::Http(url) => {
                let dest = download_dir.join(file_name_of(&url));
                download(&url, &dest, self.timeout).map_err(|err| missing(format!("{err:#}")))?;
                dest
            }
            ArtifactSource::Local(path) => {
                if !path.exists() {
                    return Err(missing("no such file or directory".to_string()).into());
                }
                path
            }
        };

        let (sha256, bundle_root) = if fetched.is_dir() {
            let digest = tree_sha256(&fetched)?;
            copy_dir(&fetched, &unpack_dir)?;
            (digest, unpack_dir)
        } else if is_tar_gz(&fetched) {
            let digest = sha256_file(&fetched)?;
            extract_tar_gz(&fetched, &unpack_dir)?;
            (digest, single_root(&unpack_dir)?)
        } else {
            return Err(missing(format!(
                "{} is neither a directory nor a .tar.gz bundle",
                fetched.display()
            ))
            .into());
        };

        let version = match load_manifest(&bundle_root)? {
            Some(manifest) => {
                verify_manifest(&manifest, &bundle_root)?;
                tracing::info!(files = manifest.files.len(), "artifact manifest verified");
                manifest.version
            }
            None => None,
        };

        let fetched_at = Utc::now();
        let artifact = Artifact {
            id: artifact_id(&sha256, fetched_at),
            reference: reference.to_string(),
            sha256,
            fetched_at,
            version,
        };
        Ok((artifact, bundle_root))
    }
}

pub fn artifact_id(sha256: &str, fetched_at: DateTime<Utc>) -> String {
    let prefix: String = sha256.chars().take(12).collect();
    format!("{prefix}-{}", fetched_at.format("%Y%m%d%H%M%S"))
}

fn file_name_of(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .filter(|segment| !segment.contains(':'))
        .unwrap_or("artifact.tar.gz")
        .to_string()
}

fn download(url: &str, dest: &Path, timeout: Duration) -> Result<()> {
    let client = Client::builder()
        .user_agent("cutover")
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("Failed to download {url}"))?;
    if !response.status().is_success() {
        bail!("Download failed for {} ({})", url, response.status());
    }
    let mut file = fs::File::create(dest)?;
    if let Err(err) = io::copy(&mut response, &mut file) {
        let _ = fs::remove_file(dest);
        return Err(err.into());
    }
    Ok(())
}

/// Release tarballs often wrap everything in one top-level directory.
fn single_root(unpack_dir: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(unpack_dir)?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read {}", unpack_dir.display()))?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        if let Some(entry) = entries.pop() {
            return Ok(entry.path());
        }
    }
    Ok(unpack_dir.to_path_buf())
}

/// Digest over sorted relative paths and file digests.
fn tree_sha256(root: &Path) -> Result<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed while walking {}", root.display()))?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            files.push((rel.display().to_string(), sha256_file(entry.path())?));
        }
    }
    let mut hasher = Sha256::new();
    for (path, digest) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update([b'\n']);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn load_manifest(bundle_root: &Path) -> Result<Option<ArtifactManifest>> {
    let manifest_path = bundle_root.join(MANIFEST_NAME);
    if !manifest_path.is_file() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&manifest_path)
        .with_context(|| format!("Failed to read manifest at {}", manifest_path.display()))?;
    let manifest: ArtifactManifest = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse manifest at {}", manifest_path.display()))?;
    Ok(Some(manifest))
}

fn verify_manifest(manifest: &ArtifactManifest, bundle_root: &Path) -> Result<()> {
    for entry in &manifest.files {
        let rel = Path::new(&entry.path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("Manifest path escapes the bundle: {}", entry.path);
        }
        let file_path = bundle_root.join(rel);
        if !file_path.exists() {
            bail!("Manifest file missing: {}", entry.path);
        }
        let digest = sha256_file(&file_path)?;
        if !digest.eq_ignore_ascii_case(entry.sha256.trim()) {
            bail!(
                "Checksum mismatch for {} (expected {}, got {})",
                entry.path,
                entry.sha256,
                digest
            );
        }
    }
    Ok(())
}
