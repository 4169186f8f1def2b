//! Copy capability: moves changed data to the peer.
//!
//! [`RsyncCopier`] is the production backend. [`LocalMirrorCopier`] mirrors
//! into a local tree with the same `--relative` layout, for single-host
//! deployments and tests.

use crate::config::TransferConfig;
use async_trait::async_trait;
use peersync_watch::PathFilter;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, warn};

/// rsync exit code for "some source files vanished before they could be transferred".
const RSYNC_VANISHED: i32 = 24;

/// One copy invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    /// Local path to replicate.
    pub source: PathBuf,
    /// Destination directory override on the peer.
    pub destination: Option<PathBuf>,
    /// Paths neither copied nor deleted.
    pub excludes: PathFilter,
    /// Descend into directories.
    pub recursive: bool,
    /// Remove destination entries missing from the source directory.
    pub mirror_deletes: bool,
    /// Remove the destination when the source itself is missing.
    pub mirror_missing: bool,
}

/// Result of a copy invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Destination now matches the source.
    Success,
    /// The copy failed.
    Failed,
    /// The source disappeared before or during the copy.
    SourceVanished,
}

impl CopyOutcome {
    /// True for [`CopyOutcome::Success`].
    pub fn is_success(self) -> bool {
        self == CopyOutcome::Success
    }
}

/// Transfers data and notify descriptors to the peer.
#[async_trait]
pub trait DataCopier: Send + Sync {
    /// Replicate `request.source`.
    async fn copy(&self, request: &CopyRequest) -> CopyOutcome;

    /// Move `descriptor` into the sibling's `inbox`. Best effort.
    async fn notify(&self, descriptor: &Path, inbox: &Path) -> bool;
}

/// Build the copier selected by the daemon config.
pub fn copier_from_config(config: &TransferConfig) -> Arc<dyn DataCopier> {
    match config {
        TransferConfig::Rsync {
            program,
            remote_prefix,
        } => Arc::new(RsyncCopier::new(program.clone(), remote_prefix.clone())),
        TransferConfig::Local { root } => Arc::new(LocalMirrorCopier::new(root.clone())),
    }
}

/// Copier shelling out to rsync.
#[derive(Debug, Clone)]
pub struct RsyncCopier {
    program: PathBuf,
    remote_prefix: String,
}

impl RsyncCopier {
    /// Copier running `program`, with `remote_prefix` put before every destination.
    pub fn new(program: impl Into<PathBuf>, remote_prefix: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            remote_prefix: remote_prefix.into(),
        }
    }

    /// Arguments for a sync invocation.
    pub fn sync_args(&self, request: &CopyRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--compress".into()];
        if request.recursive {
            args.push("--recursive".into());
        }
        let flags = [
            "--perms", "--group", "--owner", "--times", "--atimes", "--update", "--relative",
        ];
        for flag in flags {
            args.push(flag.into());
        }
        if request.mirror_deletes {
            args.push("--delete".into());
        }
        if request.mirror_missing {
            args.push("--delete-missing-args".into());
        }
        for entry in request.excludes.entries() {
            args.push(format!("--exclude={}", entry).into());
        }
        args.push(request.source.clone().into_os_string());

        let destination = request
            .destination
            .as_deref()
            .unwrap_or_else(|| Path::new("/"));
        args.push(self.remote(destination));
        args
    }

    /// Arguments for a notify invocation.
    pub fn notify_args(&self, descriptor: &Path, inbox: &Path) -> Vec<OsString> {
        let mut target = self.remote(inbox);
        target.push("/");
        vec![
            "--compress".into(),
            "--remove-source-files".into(),
            descriptor.as_os_str().to_os_string(),
            target,
        ]
    }

    fn remote(&self, path: &Path) -> OsString {
        let mut target = OsString::from(&self.remote_prefix);
        target.push(path.as_os_str());
        target
    }

    async fn run(&self, args: Vec<OsString>) -> io::Result<std::process::Output> {
        debug!("Rsync command: {:?} {:?}", self.program, args);
        Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
    }
}

#[async_trait]
impl DataCopier for RsyncCopier {
    async fn copy(&self, request: &CopyRequest) -> CopyOutcome {
        let output = match self.run(self.sync_args(request)).await {
            Ok(output) => output,
            Err(e) => {
                error!("Failed to spawn {:?}: {}", self.program, e);
                return CopyOutcome::Failed;
            }
        };

        if output.status.success() {
            return CopyOutcome::Success;
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let vanished = output.status.code() == Some(RSYNC_VANISHED)
            || fs::symlink_metadata(&request.source).is_err();
        if vanished {
            warn!("Source {:?} vanished during sync: {}", request.source, stderr.trim());
            CopyOutcome::SourceVanished
        } else {
            error!(
                "Error syncing {:?} (status {}): {}",
                request.source,
                output.status,
                stderr.trim()
            );
            CopyOutcome::Failed
        }
    }

    async fn notify(&self, descriptor: &Path, inbox: &Path) -> bool {
        match self.run(self.notify_args(descriptor, inbox)).await {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    "Sibling notify for {:?} failed (status {}): {}",
                    descriptor,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                warn!("Failed to spawn {:?} for sibling notify: {}", self.program, e);
                false
            }
        }
    }
}

/// Copier mirroring into a local destination root.
///
/// A source `/a/b` lands at `<root>/<destination>/a/b`, the layout rsync
/// produces with `--relative`.
#[derive(Debug, Clone)]
pub struct LocalMirrorCopier {
    root: PathBuf,
}

impl LocalMirrorCopier {
    /// Copier writing below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where `source` lands for `request`.
    pub fn target_for(&self, destination: Option<&Path>, source: &Path) -> PathBuf {
        let mut target = self.root.clone();
        if let Some(destination) = destination {
            target.push(relative(destination));
        }
        target.push(relative(source));
        target
    }
}

#[async_trait]
impl DataCopier for LocalMirrorCopier {
    async fn copy(&self, request: &CopyRequest) -> CopyOutcome {
        let target = self.target_for(request.destination.as_deref(), &request.source);
        let request = request.clone();
        match tokio::task::spawn_blocking(move || mirror(&request, &target)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Mirror task failed: {}", e);
                CopyOutcome::Failed
            }
        }
    }

    async fn notify(&self, descriptor: &Path, inbox: &Path) -> bool {
        let inbox = self.target_for(None, inbox);
        let descriptor = descriptor.to_path_buf();
        let moved = tokio::task::spawn_blocking(move || -> io::Result<()> {
            fs::create_dir_all(&inbox)?;
            let name = descriptor
                .file_name()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "descriptor has no file name")
                })?;
            fs::copy(&descriptor, inbox.join(name))?;
            fs::remove_file(&descriptor)
        })
        .await;
        match moved {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Sibling notify failed: {}", e);
                false
            }
            Err(e) => {
                warn!("Sibling notify task failed: {}", e);
                false
            }
        }
    }
}

/// `path` without its root, so it can be joined under another directory.
fn relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn mirror(request: &CopyRequest, target: &Path) -> CopyOutcome {
    let source = &request.source;
    if request.excludes.is_excluded(source) {
        debug!("{:?} is in exclude list. Hence skipping", source);
        return CopyOutcome::Success;
    }

    let meta = match fs::symlink_metadata(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if !request.mirror_missing {
                return CopyOutcome::SourceVanished;
            }
            return match remove_path(target) {
                Ok(()) => CopyOutcome::Success,
                Err(e) => {
                    error!("Failed to remove {:?}: {}", target, e);
                    CopyOutcome::Failed
                }
            };
        }
        Err(e) => {
            error!("Cannot stat {:?}: {}", source, e);
            return CopyOutcome::Failed;
        }
    };

    let result = if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
    } else {
        Ok(())
    }
    .and_then(|()| {
        if meta.is_dir() {
            if request.recursive {
                mirror_dir(request, source, target)
            } else {
                fs::create_dir_all(target)
            }
        } else {
            mirror_entry(source, target, &meta)
        }
    });

    match result {
        Ok(()) => CopyOutcome::Success,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("Entry under {:?} vanished mid-copy: {}", source, e);
            CopyOutcome::SourceVanished
        }
        Err(e) => {
            error!("Error syncing {:?} to {:?}: {}", source, target, e);
            CopyOutcome::Failed
        }
    }
}

fn mirror_dir(request: &CopyRequest, source: &Path, target: &Path) -> io::Result<()> {
    if fs::symlink_metadata(target).is_ok_and(|m| !m.is_dir()) {
        fs::remove_file(target)?;
    }
    fs::create_dir_all(target)?;

    let mut seen = Vec::new();
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let child = entry.path();
        seen.push(entry.file_name());
        if request.excludes.is_excluded(&child) {
            continue;
        }
        let meta = fs::symlink_metadata(&child)?;
        let child_target = target.join(entry.file_name());
        if meta.is_dir() {
            mirror_dir(request, &child, &child_target)?;
        } else {
            mirror_entry(&child, &child_target, &meta)?;
        }
    }

    if request.mirror_deletes {
        for entry in fs::read_dir(target)? {
            let entry = entry?;
            let name = entry.file_name();
            if seen.contains(&name) || request.excludes.is_excluded(&source.join(&name)) {
                continue;
            }
            debug!("Removing {:?}, no longer in {:?}", entry.path(), source);
            remove_path(&entry.path())?;
        }
    }
    Ok(())
}

fn mirror_entry(source: &Path, target: &Path, meta: &fs::Metadata) -> io::Result<()> {
    if meta.file_type().is_symlink() {
        let link = fs::read_link(source)?;
        if fs::read_link(target).is_ok_and(|existing| existing == link) {
            return Ok(());
        }
        remove_path(target)?;
        return std::os::unix::fs::symlink(link, target);
    }
    if !meta.is_file() {
        debug!("Skipping special file {:?}", source);
        return Ok(());
    }

    if let Ok(existing) = fs::symlink_metadata(target) {
        let same_size = existing.is_file() && existing.len() == meta.len();
        if same_size && fs::read(target)? == fs::read(source)? {
            return Ok(());
        }
        if !existing.is_file() {
            remove_path(target)?;
        }
    }
    fs::copy(source, target)?;
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(source: &Path) -> CopyRequest {
        CopyRequest {
            source: source.to_path_buf(),
            destination: None,
            excludes: PathFilter::new(),
            recursive: true,
            mirror_deletes: true,
            mirror_missing: true,
        }
    }

    mod rsync {
        use super::*;

        fn strings(args: Vec<OsString>) -> Vec<String> {
            args.into_iter().map(|a| a.to_string_lossy().into_owned()).collect()
        }

        #[test]
        fn test_sync_args_for_directory() {
            let copier = RsyncCopier::new("rsync", "peer:");
            let mut req = request(Path::new("/var/lib/app"));
            req.excludes = PathFilter::from_entries(["/var/lib/app/cache/"]);
            let args = strings(copier.sync_args(&req));
            assert_eq!(
                args,
                vec![
                    "--compress",
                    "--recursive",
                    "--perms",
                    "--group",
                    "--owner",
                    "--times",
                    "--atimes",
                    "--update",
                    "--relative",
                    "--delete",
                    "--delete-missing-args",
                    "--exclude=/var/lib/app/cache/",
                    "/var/lib/app",
                    "peer:/",
                ]
            );
        }

        #[test]
        fn test_sync_args_for_file_copy() {
            let copier = RsyncCopier::new("rsync", "peer:");
            let req = CopyRequest {
                destination: Some(PathBuf::from("/backup")),
                recursive: false,
                mirror_deletes: false,
                mirror_missing: false,
                ..request(Path::new("/etc/app.conf"))
            };
            let args = strings(copier.sync_args(&req));
            assert!(!args.contains(&"--recursive".to_string()));
            assert!(!args.contains(&"--delete".to_string()));
            assert!(!args.contains(&"--delete-missing-args".to_string()));
            assert_eq!(args[args.len() - 2], "/etc/app.conf");
            assert_eq!(args[args.len() - 1], "peer:/backup");
        }

        #[test]
        fn test_notify_args() {
            let copier = RsyncCopier::new("rsync", "peer:");
            let descriptor = Path::new("/tmp/notify_1.json");
            let args = strings(copier.notify_args(descriptor, Path::new("/inbox")));
            assert_eq!(
                args,
                vec!["--compress", "--remove-source-files", "/tmp/notify_1.json", "peer:/inbox/"]
            );
        }

        #[tokio::test]
        async fn test_missing_program_fails() {
            let copier = RsyncCopier::new("/nonexistent/rsync-binary", "");
            let tmp = TempDir::new().unwrap();
            assert_eq!(copier.copy(&request(tmp.path())).await, CopyOutcome::Failed);
        }
    }

    mod local {
        use super::*;

        fn tree(tmp: &TempDir) -> (PathBuf, LocalMirrorCopier, PathBuf) {
            let src = tmp.path().join("src/data");
            fs::create_dir_all(src.join("nested")).unwrap();
            fs::write(src.join("a.txt"), b"A").unwrap();
            fs::write(src.join("nested/b.txt"), b"B").unwrap();
            let dest_root = tmp.path().join("dest");
            let copier = LocalMirrorCopier::new(&dest_root);
            let target = copier.target_for(None, &src);
            (src, copier, target)
        }

        #[test]
        fn test_target_uses_relative_layout() {
            let copier = LocalMirrorCopier::new("/mirror");
            assert_eq!(
                copier.target_for(None, Path::new("/etc/app.conf")),
                PathBuf::from("/mirror/etc/app.conf")
            );
            assert_eq!(
                copier.target_for(Some(Path::new("/backup")), Path::new("/etc/app.conf")),
                PathBuf::from("/mirror/backup/etc/app.conf")
            );
        }

        #[tokio::test]
        async fn test_copy_is_idempotent_and_leaves_unrelated_content() {
            let tmp = TempDir::new().unwrap();
            let (src, copier, target) = tree(&tmp);
            let unrelated = tmp.path().join("dest/unrelated.txt");
            fs::create_dir_all(unrelated.parent().unwrap()).unwrap();
            fs::write(&unrelated, b"keep").unwrap();

            let req = request(&src);
            assert_eq!(copier.copy(&req).await, CopyOutcome::Success);
            assert_eq!(copier.copy(&req).await, CopyOutcome::Success);

            assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"A");
            assert_eq!(fs::read(target.join("nested/b.txt")).unwrap(), b"B");
            assert_eq!(fs::read(&unrelated).unwrap(), b"keep");
        }

        #[tokio::test]
        async fn test_mirror_deletes_removes_stale_entries() {
            let tmp = TempDir::new().unwrap();
            let (src, copier, target) = tree(&tmp);
            let req = request(&src);
            copier.copy(&req).await;

            fs::remove_file(src.join("a.txt")).unwrap();
            assert_eq!(copier.copy(&req).await, CopyOutcome::Success);
            assert!(!target.join("a.txt").exists());
            assert!(target.join("nested/b.txt").exists());
        }

        #[tokio::test]
        async fn test_excluded_paths_neither_copied_nor_deleted() {
            let tmp = TempDir::new().unwrap();
            let (src, copier, target) = tree(&tmp);
            fs::create_dir_all(target.join("nested")).unwrap();
            fs::write(target.join("nested/peer-only"), b"p").unwrap();

            let mut req = request(&src);
            req.excludes = PathFilter::from_entries([format!("{}/", src.join("nested").display())]);
            assert_eq!(copier.copy(&req).await, CopyOutcome::Success);

            assert!(target.join("a.txt").exists());
            assert!(!target.join("nested/b.txt").exists());
            assert!(target.join("nested/peer-only").exists());
        }

        #[tokio::test]
        async fn test_missing_source() {
            let tmp = TempDir::new().unwrap();
            let (src, copier, target) = tree(&tmp);
            copier.copy(&request(&src)).await;
            let gone = src.join("a.txt");
            fs::remove_file(&gone).unwrap();

            let strict = CopyRequest {
                mirror_missing: false,
                ..request(&gone)
            };
            assert_eq!(copier.copy(&strict).await, CopyOutcome::SourceVanished);
            assert!(target.join("a.txt").exists());

            assert_eq!(copier.copy(&request(&gone)).await, CopyOutcome::Success);
            assert!(!target.join("a.txt").exists());
        }

        #[tokio::test]
        async fn test_notify_moves_descriptor_into_inbox() {
            let tmp = TempDir::new().unwrap();
            let copier = LocalMirrorCopier::new(tmp.path().join("peer"));
            let descriptor = tmp.path().join("notify_x.json");
            fs::write(&descriptor, b"{}").unwrap();

            assert!(copier.notify(&descriptor, Path::new("/inbox")).await);
            assert!(!descriptor.exists());
            assert!(tmp.path().join("peer/inbox/notify_x.json").exists());
        }
    }
}
