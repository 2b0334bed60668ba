//! Copy-on-write sandbox: isolated file state plus command execution per candidate.
//!
//! A [`Sandbox`] holds an `Arc`-shared immutable base snapshot and a private
//! overlay of writes and deletions. Cloning copies only the overlay, so sibling
//! candidates never observe each other's writes. Commands run in a freshly
//! materialized temporary directory, either on the host or inside a container.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::path::{PathPolicy, normalize_path};
use crate::io::config::{SandboxConfig, ServiceConfig};
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::service::EphemeralService;
use crate::io::workspace::{read_tree, relative_path};
use crate::tree::{FileChange, FileMap};

const CONTAINER_WORKDIR: &str = "/workspace";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0} is not writable")]
    Permission(String),
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("no ephemeral service is configured ([sandbox.service])")]
    ServiceMissing,
    #[error("ephemeral service failed to start:\n{0}")]
    ServiceStart(String),
    #[error("ephemeral service unhealthy after {attempts} health checks:\n{last_output}")]
    ServiceUnhealthy { attempts: u32, last_output: String },
}

/// A binary file collected from a command run (e.g. a screenshot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Container {
    program: String,
    image: String,
}

/// Execution substrate shared by every sandbox of a run.
#[derive(Debug, Clone)]
pub struct SandboxRuntime {
    container: Option<Container>,
    command_timeout: Duration,
    output_limit_bytes: usize,
    sync_ignore: Vec<String>,
    service: Option<ServiceConfig>,
}

impl SandboxRuntime {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            container: config.image.as_ref().map(|image| Container {
                program: config.container_runtime.clone(),
                image: image.clone(),
            }),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            sync_ignore: config.sync_ignore.clone(),
            service: config.service.clone(),
        }
    }

    /// Host execution with default limits and no service.
    pub fn host() -> Self {
        Self::from_config(&SandboxConfig {
            image: None,
            service: None,
            ..SandboxConfig::default()
        })
    }

    pub fn with_service(mut self, service: Option<ServiceConfig>) -> Self {
        self.service = service;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn build_command(
        &self,
        dir: &Path,
        argv: &[String],
        cwd: Option<&str>,
        service: Option<&EphemeralService>,
    ) -> Result<Command> {
        let env = service.map(EphemeralService::env).unwrap_or_default();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;
        let cmd = match &self.container {
            None => {
                let mut cmd = Command::new(program);
                cmd.args(args)
                    .current_dir(cwd.map_or_else(|| dir.to_path_buf(), |c| dir.join(c)))
                    .envs(env);
                cmd
            }
            Some(container) => {
                let workdir = match cwd {
                    Some(c) => format!("{CONTAINER_WORKDIR}/{c}"),
                    None => CONTAINER_WORKDIR.to_string(),
                };
                let mut cmd = Command::new(&container.program);
                cmd.arg("run")
                    .arg("--rm")
                    .arg("-v")
                    .arg(format!("{}:{CONTAINER_WORKDIR}", dir.display()))
                    .arg("-w")
                    .arg(workdir);
                if let Some(service) = service {
                    cmd.arg("--network").arg(service.network());
                }
                for (key, value) in env {
                    cmd.arg("-e").arg(format!("{key}={value}"));
                }
                cmd.arg(&container.image).arg(program).args(args);
                cmd
            }
        };
        Ok(cmd)
    }
}

impl Default for SandboxRuntime {
    fn default() -> Self {
        Self::host()
    }
}

/// Isolated, permissioned file state for one candidate.
#[derive(Debug, Clone)]
pub struct Sandbox {
    base: Arc<FileMap>,
    overlay: BTreeMap<String, Option<String>>,
    policy: PathPolicy,
    runtime: Arc<SandboxRuntime>,
}

impl Sandbox {
    pub fn new(files: FileMap, runtime: Arc<SandboxRuntime>) -> Self {
        Self {
            base: Arc::new(files),
            overlay: BTreeMap::new(),
            policy: PathPolicy::permissive(),
            runtime,
        }
    }

    pub fn runtime(&self) -> &Arc<SandboxRuntime> {
        &self.runtime
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    pub fn configure_permissions(&mut self, protected: Vec<String>, allowed: Vec<String>) {
        let install = std::mem::take(&mut self.policy.install);
        self.policy = PathPolicy::new(allowed, protected).with_install(install);
    }

    /// Extra prefixes `exec_and_sync` may write besides the allowed ones.
    pub fn configure_install_paths(&mut self, install: Vec<String>) {
        self.policy.install = install;
    }

    fn lookup(&self, path: &str) -> Option<&String> {
        match self.overlay.get(path) {
            Some(entry) => entry.as_ref(),
            None => self.base.get(path),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        normalize_path(path).is_some_and(|p| self.lookup(&p).is_some())
    }

    pub fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let path = normalize_path(path).ok_or_else(|| SandboxError::InvalidPath(path.to_string()))?;
        self.lookup(&path)
            .cloned()
            .ok_or(SandboxError::NotFound(path))
    }

    /// Write a file. Rejected unless the path is allowed and not protected.
    pub fn write_file(&mut self, path: &str, content: &str) -> Result<(), SandboxError> {
        let path = self.writable(path)?;
        self.overlay.insert(path, Some(content.to_string()));
        Ok(())
    }

    pub fn delete(&mut self, path: &str) -> Result<(), SandboxError> {
        let path = self.writable(path)?;
        if self.lookup(&path).is_none() {
            return Err(SandboxError::NotFound(path));
        }
        self.overlay.insert(path, None);
        Ok(())
    }

    fn writable(&self, raw: &str) -> Result<String, SandboxError> {
        let path = normalize_path(raw).ok_or_else(|| SandboxError::InvalidPath(raw.to_string()))?;
        if !self.policy.can_write(&path) {
            return Err(SandboxError::Permission(path));
        }
        Ok(path)
    }

    /// Apply recorded changes without permission checks (restoring a node's state).
    pub fn apply_changes(&mut self, changes: &BTreeMap<String, FileChange>) {
        for (path, change) in changes {
            let entry = match change {
                FileChange::Write(content) => Some(content.clone()),
                FileChange::Delete => None,
            };
            self.overlay.insert(path.clone(), entry);
        }
    }

    /// Effective file state (base plus overlay).
    pub fn files(&self) -> FileMap {
        let mut files = (*self.base).clone();
        for (path, entry) in &self.overlay {
            match entry {
                Some(content) => {
                    files.insert(path.clone(), content.clone());
                }
                None => {
                    files.remove(path);
                }
            }
        }
        files
    }

    /// Overlay entries that actually differ from the base.
    pub fn changes(&self) -> BTreeMap<String, FileChange> {
        self.overlay
            .iter()
            .filter_map(|(path, entry)| match (entry, self.base.get(path)) {
                (Some(content), Some(base)) if content == base => None,
                (Some(content), _) => Some((path.clone(), FileChange::Write(content.clone()))),
                (None, Some(_)) => Some((path.clone(), FileChange::Delete)),
                (None, None) => None,
            })
            .collect()
    }

    /// Run a command against a throwaway copy of the file state.
    #[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or_default()))]
    pub async fn exec(&self, argv: &[String], cwd: Option<&str>) -> Result<CommandOutput> {
        let dir = self.materialize().await?;
        self.run_in(dir.path(), argv, cwd, None).await
    }

    /// Run a command and fold text-file changes back into this sandbox.
    ///
    /// Files under `sync_ignore` directories and non-UTF-8 files are not synced.
    /// If any changed path is not writable (see [`PathPolicy::can_install`]) the
    /// call fails with [`SandboxError::Permission`] and nothing is synced.
    #[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or_default()))]
    pub async fn exec_and_sync(
        &mut self,
        argv: &[String],
        cwd: Option<&str>,
    ) -> Result<CommandOutput> {
        let dir = self.materialize().await?;
        let output = self.run_in(dir.path(), argv, cwd, None).await?;

        let root = dir.path().to_path_buf();
        let ignore = self.runtime.sync_ignore.clone();
        let on_disk = tokio::task::spawn_blocking(move || read_tree(&root, &ignore))
            .await
            .context("join sync walker")??;

        let before = self.files();
        let mut synced: BTreeMap<String, Option<String>> = BTreeMap::new();
        for (path, content) in &on_disk {
            if before.get(path) != Some(content) {
                synced.insert(path.clone(), Some(content.clone()));
            }
        }
        for path in before.keys() {
            if !on_disk.contains_key(path) && !is_ignored(path, &self.runtime.sync_ignore) {
                synced.insert(path.clone(), None);
            }
        }

        let rejected: Vec<&str> = synced
            .keys()
            .filter(|path| !self.policy.can_install(path))
            .map(String::as_str)
            .collect();
        if !rejected.is_empty() {
            warn!(paths = ?rejected, "command touched files outside its write scope");
            return Err(SandboxError::Permission(rejected.join(", ")).into());
        }
        debug!(synced = synced.len(), "synced command changes");
        self.overlay.extend(synced);
        Ok(output)
    }

    /// Run a command with a freshly provisioned backing service.
    ///
    /// The service is always stopped afterwards. A failed health check is a hard
    /// error, and so is a runtime without a configured service.
    #[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or_default()))]
    pub async fn exec_with_ephemeral_service(
        &self,
        argv: &[String],
        cwd: Option<&str>,
    ) -> Result<CommandOutput> {
        let dir = self.materialize().await?;
        self.run_with_service(dir.path(), argv, cwd).await
    }

    /// Run a command, then collect every file it left under `artifacts_dir`.
    pub async fn exec_with_artifacts(
        &self,
        argv: &[String],
        artifacts_dir: &str,
        with_service: bool,
    ) -> Result<(CommandOutput, Vec<Artifact>)> {
        let artifacts_dir = normalize_path(artifacts_dir)
            .ok_or_else(|| SandboxError::InvalidPath(artifacts_dir.to_string()))?;
        let dir = self.materialize().await?;
        let output = if with_service {
            self.run_with_service(dir.path(), argv, None).await?
        } else {
            self.run_in(dir.path(), argv, None, None).await?
        };

        let artifact_root = dir.path().join(&artifacts_dir);
        let artifacts = tokio::task::spawn_blocking(move || collect_artifacts(&artifact_root))
            .await
            .context("join artifact walker")??
            .into_iter()
            .map(|(relative, bytes)| Artifact {
                path: format!("{artifacts_dir}/{relative}"),
                bytes,
            })
            .collect();
        Ok((output, artifacts))
    }

    async fn run_with_service(
        &self,
        dir: &Path,
        argv: &[String],
        cwd: Option<&str>,
    ) -> Result<CommandOutput> {
        let config = self
            .runtime
            .service
            .as_ref()
            .ok_or(SandboxError::ServiceMissing)?;
        let service = EphemeralService::start(
            config,
            self.runtime.command_timeout,
            self.runtime.output_limit_bytes,
        )
        .await?;
        let result = self.run_in(dir, argv, cwd, Some(&service)).await;
        service.stop().await;
        result
    }

    async fn run_in(
        &self,
        dir: &Path,
        argv: &[String],
        cwd: Option<&str>,
        service: Option<&EphemeralService>,
    ) -> Result<CommandOutput> {
        let cwd = match cwd {
            Some(raw) => {
                Some(normalize_path(raw).ok_or_else(|| SandboxError::InvalidPath(raw.to_string()))?)
            }
            None => None,
        };
        let cmd = self.runtime.build_command(dir, argv, cwd.as_deref(), service)?;
        run_command_with_timeout(
            cmd,
            None,
            self.runtime.command_timeout,
            self.runtime.output_limit_bytes,
        )
        .await
        .with_context(|| format!("run {}", argv.join(" ")))
    }

    async fn materialize(&self) -> Result<tempfile::TempDir> {
        let dir = tempfile::Builder::new()
            .prefix("beamforge-")
            .tempdir()
            .context("create sandbox directory")?;
        for (path, content) in self.files() {
            let target = dir.path().join(&path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            tokio::fs::write(&target, content)
                .await
                .with_context(|| format!("write {}", target.display()))?;
        }
        Ok(dir)
    }
}

fn is_ignored(path: &str, ignore: &[String]) -> bool {
    path.split('/')
        .any(|component| ignore.iter().any(|name| name == component))
}

fn collect_artifacts(root: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut artifacts = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.context("walk artifact directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = relative_path(root, entry.path()) else {
            continue;
        };
        let bytes = std::fs::read(entry.path())
            .with_context(|| format!("read {}", entry.path().display()))?;
        artifacts.push((path, bytes));
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(entries: &[(&str, &str)]) -> Sandbox {
        let files = entries
            .iter()
            .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
            .collect();
        Sandbox::new(files, Arc::new(SandboxRuntime::host()))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn clones_do_not_observe_each_other() {
        let mut first = sandbox(&[("a.ts", "base")]);
        let mut second = first.clone();
        first.write_file("a.ts", "first").expect("write first");
        second.delete("a.ts").expect("delete second");

        assert_eq!(first.read_file("a.ts").expect("read"), "first");
        assert_eq!(
            second.read_file("a.ts"),
            Err(SandboxError::NotFound("a.ts".to_string()))
        );
        assert_eq!(first.changes().len(), 1);
        assert_eq!(
            second.changes().get("a.ts"),
            Some(&FileChange::Delete)
        );
    }

    /// Verifies rejected writes leave no trace.
    ///
    /// Asserts: protected and out-of-scope writes fail with `Permission` and persist no change.
    #[test]
    fn rejected_write_persists_nothing() {
        let mut sb = sandbox(&[]);
        sb.configure_permissions(vec!["protected/".to_string()], vec!["src/".to_string()]);
        assert_eq!(
            sb.write_file("protected/x", "nope"),
            Err(SandboxError::Permission("protected/x".to_string()))
        );
        assert_eq!(
            sb.write_file("README.md", "nope"),
            Err(SandboxError::Permission("README.md".to_string()))
        );
        sb.write_file("src/ok.ts", "yes").expect("allowed");
        assert_eq!(sb.files().len(), 1);
    }

    #[test]
    fn unchanged_rewrite_is_not_a_change() {
        let mut sb = sandbox(&[("a.ts", "same")]);
        sb.write_file("a.ts", "same").expect("write");
        assert!(sb.changes().is_empty());
    }

    #[tokio::test]
    async fn exec_sees_files_but_discards_side_effects() {
        let sb = sandbox(&[("src/a.txt", "hello")]);
        let output = sb
            .exec(&sh("cat src/a.txt && echo new > b.txt"), None)
            .await
            .expect("exec");
        assert_eq!(output.stdout_lossy(), "hello");
        assert!(!sb.exists("b.txt"));
    }

    #[tokio::test]
    async fn exec_and_sync_folds_back_text_changes() {
        let mut sb = sandbox(&[("package.json", "{}"), ("old.txt", "x")]);
        sb.exec_and_sync(
            &sh("echo '{\"deps\":1}' > package.json && rm old.txt && mkdir -p node_modules && echo ignored > node_modules/m.js"),
            None,
        )
        .await
        .expect("exec");

        assert_eq!(sb.read_file("package.json").expect("read"), "{\"deps\":1}\n");
        assert!(!sb.exists("old.txt"));
        assert!(!sb.exists("node_modules/m.js"));
    }

    #[tokio::test]
    async fn artifacts_are_collected_sorted() {
        let sb = sandbox(&[]);
        let (output, artifacts) = sb
            .exec_with_artifacts(
                &sh("mkdir -p shots && printf b > shots/2.png && printf a > shots/1.png"),
                "shots",
                false,
            )
            .await
            .expect("exec");
        assert!(output.success());
        let paths: Vec<_> = artifacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["shots/1.png", "shots/2.png"]);
        assert_eq!(artifacts[0].bytes, b"a");
    }

    #[tokio::test]
    async fn service_env_reaches_the_command() {
        let service = ServiceConfig {
            start: vec!["true".to_string()],
            health: vec!["true".to_string()],
            stop: vec!["true".to_string()],
            env: BTreeMap::from([("DB".to_string(), "db-{id}".to_string())]),
            network: "host".to_string(),
            health_attempts: 2,
            health_interval_ms: 10,
        };
        let runtime = SandboxRuntime::host().with_service(Some(service));
        let sb = Sandbox::new(FileMap::new(), Arc::new(runtime));
        let output = sb
            .exec_with_ephemeral_service(&sh("printf \"$DB\""), None)
            .await
            .expect("exec");
        let stdout = output.stdout_lossy();
        assert!(stdout.starts_with("db-") && stdout.len() == 11, "{stdout}");
    }

    /// Verifies a command cannot write around the path policy.
    ///
    /// The command writes a protected file and a lockfile. Asserts: the call fails
    /// with `Permission` naming both paths and the overlay is untouched.
    #[tokio::test]
    async fn synced_writes_outside_policy_are_rejected() {
        let mut sb = sandbox(&[("src/a.ts", "a")]);
        sb.configure_permissions(vec!["protected/".to_string()], vec!["src/".to_string()]);
        let err = sb
            .exec_and_sync(
                &sh("mkdir -p protected && echo hacked > protected/x && echo lock > package-lock.json && echo b > src/b.ts"),
                None,
            )
            .await
            .expect_err("rejected");

        assert_eq!(
            err.downcast_ref::<SandboxError>(),
            Some(&SandboxError::Permission(
                "package-lock.json, protected/x".to_string()
            ))
        );
        assert!(sb.changes().is_empty());
        assert!(!sb.exists("protected/x"));
    }

    #[tokio::test]
    async fn install_paths_widen_synced_writes_only() {
        let mut sb = sandbox(&[("src/a.ts", "a")]);
        sb.configure_install_paths(vec!["package.json".to_string(), "package-lock.json".to_string()]);
        sb.configure_permissions(vec!["protected/".to_string()], vec!["src/".to_string()]);
        sb.exec_and_sync(&sh("echo lock > package-lock.json && echo b > src/b.ts"), None)
            .await
            .expect("sync");

        assert_eq!(sb.read_file("package-lock.json").expect("lock"), "lock\n");
        assert_eq!(sb.read_file("src/b.ts").expect("b"), "b\n");
        assert_eq!(
            sb.write_file("package-lock.json", "x"),
            Err(SandboxError::Permission("package-lock.json".to_string()))
        );
    }

    #[tokio::test]
    async fn service_command_without_service_fails() {
        let sb = sandbox(&[]);
        let err = sb
            .exec_with_ephemeral_service(&sh("printf \"url=[$DATABASE_URL]\""), None)
            .await
            .expect_err("no service");
        assert_eq!(
            err.downcast_ref::<SandboxError>(),
            Some(&SandboxError::ServiceMissing)
        );
    }

    /// Containerized commands join the service network and see its env.
    ///
    /// `echo` stands in for the container CLI, so stdout is the invocation itself.
    #[tokio::test]
    async fn container_invocation_joins_service_network() {
        let config = SandboxConfig {
            image: Some("node:22".to_string()),
            container_runtime: "echo".to_string(),
            service: Some(ServiceConfig {
                start: vec!["true".to_string()],
                health: vec!["true".to_string()],
                stop: vec!["true".to_string()],
                env: BTreeMap::from([(
                    "DATABASE_URL".to_string(),
                    "postgres://127.0.0.1:{port}/db".to_string(),
                )]),
                network: "net-{id}".to_string(),
                health_attempts: 1,
                health_interval_ms: 10,
            }),
            ..SandboxConfig::default()
        };
        let sb = Sandbox::new(FileMap::new(), Arc::new(SandboxRuntime::from_config(&config)));
        let output = sb
            .exec_with_ephemeral_service(&["npm".to_string(), "test".to_string()], None)
            .await
            .expect("exec");

        let line = output.stdout_lossy();
        assert!(line.starts_with("run --rm -v "), "{line}");
        assert!(line.contains(" --network net-"), "{line}");
        assert!(line.contains("-e DATABASE_URL=postgres://127.0.0.1:"), "{line}");
        assert!(line.trim_end().ends_with("node:22 npm test"), "{line}");
    }
}
