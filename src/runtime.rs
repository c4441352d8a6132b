//! Lifecycle of the local inference runtime (an Ollama-compatible server).
//!
//! The manager finds or installs the runtime binary, starts the server and
//! waits for it to answer, and makes sure a model is available. It is the only
//! place in the crate that owns a child process.
//!
//! Long operations report progress through a callback so callers decide how
//! (and whether) to render it.

use crate::config::ConfigStore;
use crate::error::RuntimeError;
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Pinned runtime release used for managed installs.
pub const RUNTIME_VERSION: &str = "0.5.4";

/// Models we know produce usable commands, largest first.
pub const RECOMMENDED_MODELS: [&str; 3] = ["qwen2.5-coder:7b", "qwen2.5-coder:3b", "qwen2.5-coder:1.5b"];

/// Pulled when the chosen model cannot be downloaded.
pub const FALLBACK_MODEL: &str = "qwen2.5-coder:1.5b";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

const GIB: u64 = 1024 * 1024 * 1024;

/// One progress notification: a status line and, when known, a percentage.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeProgress {
    pub status: String,
    pub percent: Option<f64>,
}

impl RuntimeProgress {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            percent: None,
        }
    }

    pub fn percent(status: impl Into<String>, done: u64, total: u64) -> Self {
        Self {
            status: status.into(),
            percent: (total > 0).then(|| done as f64 / total as f64 * 100.0),
        }
    }
}

/// Callback that receives progress notifications.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(RuntimeProgress) + Send);

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    NotInstalled,
    Installing,
    Installed,
    ServerStarting,
    ServerReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallSource {
    /// Downloaded into the config directory by us.
    Managed,
    /// Found on PATH.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub phase: RuntimePhase,
    pub source: Option<InstallSource>,
}

/// How long to wait for a freshly started server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_millis(500),
        }
    }
}

/// Where managed files live under the config directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimePaths {
    pub binary: PathBuf,
    pub models_dir: PathBuf,
}

impl RuntimePaths {
    pub fn under(config_dir: &Path) -> Self {
        let name = if cfg!(windows) { "ollama.exe" } else { "ollama" };
        Self {
            binary: config_dir.join("bin").join(name),
            models_dir: config_dir.join("ollama").join("models"),
        }
    }
}

// =============================================================================
// Platform and model selection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// The download is the executable itself.
    Raw,
    TarGz,
    Zip,
}

/// Release asset for a platform, as (`std::env::consts::OS`, `ARCH`).
pub fn download_asset(os: &str, arch: &str) -> Option<(&'static str, ArchiveKind)> {
    match (os, arch) {
        ("macos", _) => Some(("ollama-darwin", ArchiveKind::Raw)),
        ("linux", "x86_64") => Some(("ollama-linux-amd64.tgz", ArchiveKind::TarGz)),
        ("linux", "aarch64") => Some(("ollama-linux-arm64.tgz", ArchiveKind::TarGz)),
        ("windows", _) => Some(("ollama-windows-amd64.zip", ArchiveKind::Zip)),
        _ => None,
    }
}

/// Pick a recommended model from total RAM in bytes. Tiers are inclusive.
pub fn select_model_for_ram(total_bytes: u64) -> &'static str {
    let gib = total_bytes / GIB;
    if gib >= 8 {
        RECOMMENDED_MODELS[0]
    } else if gib >= 4 {
        RECOMMENDED_MODELS[1]
    } else {
        RECOMMENDED_MODELS[2]
    }
}

pub fn total_memory_bytes() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.total_memory()
}

/// A listed model satisfies a request on exact match, or as a tag variant
/// (`qwen2.5-coder:7b` is satisfied by `qwen2.5-coder:7b-q4_0`).
pub fn model_matches(listed: &str, requested: &str) -> bool {
    listed == requested || (requested.contains(':') && listed.starts_with(requested))
}

/// `host:port` of a base URL, for the server's bind address.
fn bind_address(base_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PullProgress {
    status: String,
    completed: u64,
    total: u64,
    error: Option<String>,
}

// =============================================================================
// Manager
// =============================================================================

pub struct RuntimeManager {
    paths: RuntimePaths,
    base_url: String,
    download_base: String,
    policy: StartupPolicy,
    total_memory: Option<u64>,
    client: reqwest::Client,
    status: Mutex<RuntimeStatus>,
    server: Mutex<Option<Child>>,
    install_lock: tokio::sync::Mutex<()>,
    pull_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RuntimeManager {
    pub fn new(config_dir: &Path, base_url: &str) -> Self {
        let paths = RuntimePaths::under(config_dir);
        let source = if paths.binary.exists() {
            Some(InstallSource::Managed)
        } else if which::which("ollama").is_ok() {
            Some(InstallSource::System)
        } else {
            None
        };
        let phase = if source.is_some() {
            RuntimePhase::Installed
        } else {
            RuntimePhase::NotInstalled
        };

        Self {
            paths,
            base_url: base_url.trim_end_matches('/').to_string(),
            download_base: format!(
                "https://github.com/ollama/ollama/releases/download/v{}",
                RUNTIME_VERSION
            ),
            policy: StartupPolicy::default(),
            total_memory: None,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            status: Mutex::new(RuntimeStatus { phase, source }),
            server: Mutex::new(None),
            install_lock: tokio::sync::Mutex::new(()),
            pull_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: StartupPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_download_base(mut self, url: &str) -> Self {
        self.download_base = url.trim_end_matches('/').to_string();
        self
    }

    /// Override the detected RAM (bytes) used for model auto-selection.
    pub fn with_total_memory(mut self, bytes: u64) -> Self {
        self.total_memory = Some(bytes);
        self
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.lock_status()
    }

    fn lock_status(&self) -> MutexGuard<'_, RuntimeStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: RuntimePhase) {
        let mut status = self.lock_status();
        if status.phase != phase {
            debug!("Runtime phase: {:?} -> {:?}", status.phase, phase);
            status.phase = phase;
        }
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Probe the server. A failed probe after a successful one moves the
    /// phase back to `ServerStarting`; nothing is cached between calls.
    pub async fn is_healthy(&self) -> bool {
        let healthy = match self.client.get(self.tags_url()).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("Runtime health probe failed: {}", err);
                false
            }
        };

        let phase = self.status().phase;
        if healthy {
            self.set_phase(RuntimePhase::ServerReady);
        } else if phase == RuntimePhase::ServerReady {
            self.set_phase(RuntimePhase::ServerStarting);
        }
        healthy
    }

    // =========================================================================
    // Install
    // =========================================================================

    /// Make sure a runtime binary exists and return its path.
    ///
    /// A managed binary wins, then one on PATH; otherwise the pinned release
    /// is downloaded for this platform.
    pub async fn ensure_installed(&self, progress: ProgressFn<'_>) -> Result<PathBuf, RuntimeError> {
        let _guard = self.install_lock.lock().await;

        if self.paths.binary.exists() {
            self.mark_installed(InstallSource::Managed);
            return Ok(self.paths.binary.clone());
        }

        if let Ok(system) = which::which("ollama") {
            info!("Using system runtime at {}", system.display());
            self.mark_installed(InstallSource::System);
            return Ok(system);
        }

        let (os, arch) = (std::env::consts::OS, std::env::consts::ARCH);
        let (asset, kind) = download_asset(os, arch).ok_or_else(|| RuntimeError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        })?;

        self.set_phase(RuntimePhase::Installing);
        let url = format!("{}/{}", self.download_base, asset);
        if let Err(err) = self.download_and_extract(&url, kind, progress).await {
            self.set_phase(RuntimePhase::NotInstalled);
            return Err(err);
        }

        self.mark_installed(InstallSource::Managed);
        Ok(self.paths.binary.clone())
    }

    fn mark_installed(&self, source: InstallSource) {
        let mut status = self.lock_status();
        status.source = Some(source);
        if matches!(status.phase, RuntimePhase::NotInstalled | RuntimePhase::Installing) {
            status.phase = RuntimePhase::Installed;
        }
    }

    /// Stream `url` to disk, then put the executable at the managed path.
    pub(crate) async fn download_and_extract(
        &self,
        url: &str,
        kind: ArchiveKind,
        progress: ProgressFn<'_>,
    ) -> Result<(), RuntimeError> {
        let bin_dir = self
            .paths
            .binary
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&bin_dir).await?;

        info!("Downloading runtime from {}", url);
        progress(RuntimeProgress::status("Downloading runtime..."));

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(RuntimeError::DownloadStatus {
                status: response.status().as_u16(),
            });
        }

        let archive = bin_dir.join("runtime.download");
        let extracted = match save_stream(response, &archive, progress).await {
            Ok(()) => {
                progress(RuntimeProgress::status("Extracting runtime..."));
                let dest = self.paths.binary.clone();
                let source = archive.clone();
                tokio::task::spawn_blocking(move || extract_binary(&source, kind, &dest))
                    .await
                    .map_err(|e| RuntimeError::Extract(e.to_string()))
                    .and_then(|result| result)
            }
            Err(err) => Err(err),
        };

        if let Err(err) = fs::remove_file(&archive) {
            debug!("Could not remove {}: {}", archive.display(), err);
        }
        extracted
    }

    // =========================================================================
    // Server
    // =========================================================================

    /// Install if needed and start the server unless one already answers.
    pub async fn ensure_running(&self, progress: ProgressFn<'_>) -> Result<(), RuntimeError> {
        if self.is_healthy().await {
            return Ok(());
        }

        let binary = self.ensure_installed(progress).await?;
        progress(RuntimeProgress::status("Starting runtime server..."));
        self.start_server(&binary).await
    }

    /// Launch `binary serve` and poll until the server answers.
    ///
    /// If the server never becomes ready, the child is killed and reaped
    /// before the error is returned.
    pub async fn start_server(&self, binary: &Path) -> Result<(), RuntimeError> {
        if self.is_healthy().await {
            return Ok(());
        }

        let mut command = Command::new(binary);
        command
            .arg("serve")
            .env("OLLAMA_MODELS", &self.paths.models_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(addr) = bind_address(&self.base_url) {
            command.env("OLLAMA_HOST", addr);
        }
        #[cfg(unix)]
        command.process_group(0);

        self.set_phase(RuntimePhase::ServerStarting);
        let mut child = command.spawn().map_err(RuntimeError::Spawn)?;
        let pid = child.id();
        info!("Started runtime server (pid {:?}) from {}", pid, binary.display());

        for attempt in 1..=self.policy.attempts {
            tokio::time::sleep(self.policy.interval).await;

            match child.try_wait() {
                Ok(Some(status)) => {
                    self.set_phase(RuntimePhase::Installed);
                    return Err(RuntimeError::ExitedDuringStartup {
                        status: status.to_string(),
                    });
                }
                Ok(None) => {}
                Err(err) => warn!("Could not poll runtime server: {}", err),
            }

            if self.is_healthy().await {
                debug!("Runtime server ready after {} attempts", attempt);
                *self.server.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
                return Ok(());
            }
        }

        warn!("Runtime server not ready, killing pid {:?}", pid);
        if let Err(err) = child.kill().await {
            warn!("Failed to kill runtime server: {}", err);
        }
        self.set_phase(RuntimePhase::Installed);

        Err(RuntimeError::StartupTimeout {
            attempts: self.policy.attempts,
            pid,
        })
    }

    // =========================================================================
    // Models
    // =========================================================================

    pub async fn list_models(&self) -> Result<Vec<String>, RuntimeError> {
        let response = self
            .client
            .get(self.tags_url())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|_| RuntimeError::Unreachable {
                url: self.base_url.clone(),
            })?;
        let tags: TagsResponse = response.error_for_status()?.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    pub async fn has_model(&self, model: &str) -> bool {
        match self.list_models().await {
            Ok(models) => models.iter().any(|listed| model_matches(listed, model)),
            Err(err) => {
                debug!("Could not list models: {}", err);
                false
            }
        }
    }

    /// Download a model, streaming progress. Concurrent pulls of the same
    /// model wait for the first one instead of downloading twice.
    pub async fn pull_model(&self, model: &str, progress: ProgressFn<'_>) -> Result<(), RuntimeError> {
        let lock = self.pull_lock(model);
        let _guard = lock.lock().await;

        if self.has_model(model).await {
            return Ok(());
        }

        info!("Pulling model {}", model);
        progress(RuntimeProgress::status(format!("Pulling {}...", model)));

        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&serde_json::json!({ "name": model, "stream": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Pull {
                model: model.to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), body.trim()),
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                report_pull_line(model, &line, progress)?;
            }
        }
        report_pull_line(model, &buffer, progress)?;

        Ok(())
    }

    fn pull_lock(&self, model: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.pull_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(model.to_string()).or_default().clone()
    }

    /// Settle on a model that is present on the server, pulling one if needed.
    ///
    /// Order: the requested model, then any recommended model already
    /// present, then a pull of the requested model (or one chosen by RAM when
    /// none was requested), then the fallback model. A RAM-chosen model is
    /// written back to `store` as `local.model`.
    pub async fn ensure_model(
        &self,
        requested: &str,
        store: Option<&ConfigStore>,
        progress: ProgressFn<'_>,
    ) -> Result<String, RuntimeError> {
        let available = self.list_models().await?;
        let present = |name: &str| available.iter().any(|listed| model_matches(listed, name));

        if !requested.is_empty() && present(requested) {
            return Ok(requested.to_string());
        }

        if let Some(model) = RECOMMENDED_MODELS.iter().copied().find(|&m| present(m)) {
            info!("Using already installed model {}", model);
            return Ok(model.to_string());
        }

        let auto_selected = requested.is_empty();
        let target = if auto_selected {
            let memory = self.total_memory.unwrap_or_else(total_memory_bytes);
            let chosen = select_model_for_ram(memory);
            info!("Auto-selected {} for {} GiB RAM", chosen, memory / GIB);
            chosen.to_string()
        } else {
            requested.to_string()
        };

        let model = match self.pull_model(&target, progress).await {
            Ok(()) => target,
            Err(err) if target != FALLBACK_MODEL => {
                warn!("{}; trying fallback model {}", err, FALLBACK_MODEL);
                self.pull_model(FALLBACK_MODEL, progress).await?;
                FALLBACK_MODEL.to_string()
            }
            Err(err) => return Err(err),
        };

        if auto_selected {
            if let Some(store) = store {
                if let Err(err) = store.set("local.model", &model) {
                    warn!("Could not save model preference: {}", err);
                }
            }
        }
        Ok(model)
    }
}

fn report_pull_line(model: &str, line: &[u8], progress: ProgressFn<'_>) -> Result<(), RuntimeError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }

    let update: PullProgress = match serde_json::from_str(text) {
        Ok(update) => update,
        Err(err) => {
            debug!("Skipping unparseable pull line: {}", err);
            return Ok(());
        }
    };

    if let Some(message) = update.error {
        return Err(RuntimeError::Pull {
            model: model.to_string(),
            message,
        });
    }

    progress(RuntimeProgress::percent(update.status, update.completed, update.total));
    Ok(())
}

// =============================================================================
// Download and extraction
// =============================================================================

async fn save_stream(response: reqwest::Response, path: &Path, progress: ProgressFn<'_>) -> Result<(), RuntimeError> {
    let total = response.content_length().unwrap_or(0);
    let mut file = tokio::fs::File::create(path).await?;
    let mut downloaded = 0u64;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        progress(RuntimeProgress::percent("Downloading runtime...", downloaded, total));
    }
    file.flush().await?;
    Ok(())
}

/// Put the runtime executable from `archive` at `dest` and mark it executable.
///
/// The binary is written next to `dest` and renamed into place, so `dest`
/// only ever holds a complete executable.
pub(crate) fn extract_binary(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), RuntimeError> {
    let staging = staging_path(dest);
    let result =
        write_binary(archive, kind, &staging).and_then(|()| fs::rename(&staging, dest).map_err(RuntimeError::from));
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "runtime".to_string());
    dest.with_file_name(format!("{}.partial", name))
}

fn write_binary(archive: &Path, kind: ArchiveKind, out: &Path) -> Result<(), RuntimeError> {
    match kind {
        ArchiveKind::Raw => {
            fs::copy(archive, out)?;
        }
        ArchiveKind::TarGz => extract_tar_gz(archive, out)?,
        ArchiveKind::Zip => extract_zip(archive, out)?,
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(out, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn copy_exact(reader: &mut impl io::Read, expected: u64, out: &Path) -> Result<(), RuntimeError> {
    let mut file = File::create(out)?;
    let copied = io::copy(reader, &mut file)?;
    if copied != expected {
        return Err(RuntimeError::Extract(format!(
            "archive truncated: got {} of {} bytes",
            copied, expected
        )));
    }
    Ok(())
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), RuntimeError> {
    let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));

    for entry in tar.entries()? {
        let mut entry = entry?;
        let is_binary = entry.header().entry_type().is_file()
            && entry.path()?.file_name() == Some(OsStr::new("ollama"));
        if is_binary {
            let size = entry.size();
            return copy_exact(&mut entry, size, dest);
        }
    }

    Err(RuntimeError::Extract("ollama binary not found in archive".to_string()))
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), RuntimeError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(|e| RuntimeError::Extract(e.to_string()))?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|e| RuntimeError::Extract(e.to_string()))?;
        if !entry.is_dir() && entry.name().ends_with("ollama.exe") {
            let size = entry.size();
            return copy_exact(&mut entry, size, dest);
        }
    }

    Err(RuntimeError::Extract("ollama.exe not found in archive".to_string()))
}
