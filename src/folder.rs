//! Recursive folder download built on `LIST_FOLDER` and `PULL_FILE`.
//!
//! Files are fetched one at a time, each over its own connection, in the
//! order the peer listed them. A file that fails is reported and skipped.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

use crate::client::FileClient;
use crate::events::{FolderProgress, ProgressStatus};
use crate::protocol::{base_name, ProtocolError};

/// What a folder download achieved
#[derive(Debug, Default)]
pub struct FolderReport {
    /// Local paths written in full
    pub completed: Vec<PathBuf>,
    /// Relative paths that failed, with the reason
    pub failed: Vec<(String, ProtocolError)>,
}

impl FolderReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Download every file under `remote_folder` into `save_dir/<folder name>/`.
///
/// Only the listing itself can fail the whole call. Per-file outcomes go to
/// `on_progress` and the returned report.
pub async fn download_folder<F>(
    client: &FileClient,
    peer: SocketAddr,
    remote_folder: &str,
    save_dir: &Path,
    mut on_progress: F,
) -> Result<FolderReport, ProtocolError>
where
    F: FnMut(FolderProgress),
{
    let folder_name = base_name(remote_folder)
        .ok_or_else(|| ProtocolError::InvalidPath(remote_folder.to_string()))?;
    let local_root = save_dir.join(&folder_name);

    let files: Vec<_> = client
        .list_folder(peer, remote_folder)
        .await?
        .into_iter()
        .filter(|entry| entry.is_file())
        .collect();
    let total = files.len();
    info!("📁 Downloading {} file(s) from {} into {:?}", total, remote_folder, local_root);

    let mut report = FolderReport::default();

    for (index, entry) in files.iter().enumerate() {
        let overall_ratio = (index + 1) as f64 / total as f64;
        let relative_path = entry.relative_path.clone();
        let step = |status, file_ratio, error| FolderProgress {
            relative_path: relative_path.clone(),
            status,
            file_ratio,
            overall_ratio,
            error,
        };

        on_progress(step(ProgressStatus::Start, 0.0, None));

        let result = match local_relative(&relative_path) {
            Some(relative) => {
                let local_path = local_root.join(relative);
                let remote_path = format!(
                    "{}/{}",
                    remote_folder.trim_end_matches(['/', '\\']),
                    relative_path
                );
                client
                    .download_file(peer, &remote_path, &local_path, |session| {
                        on_progress(step(ProgressStatus::Progress, session.ratio(), None))
                    })
                    .await
                    .map(|_| local_path)
            }
            None => Err(ProtocolError::InvalidPath(relative_path.clone())),
        };

        match result {
            Ok(local_path) => {
                on_progress(step(ProgressStatus::Done, 1.0, None));
                report.completed.push(local_path);
            }
            Err(e) => {
                warn!("Failed to download {}: {}", relative_path, e);
                on_progress(step(ProgressStatus::Error, 0.0, Some(e.to_string())));
                report.failed.push((relative_path, e));
            }
        }
    }

    info!(
        "Folder download finished: {} done, {} failed",
        report.completed.len(),
        report.failed.len()
    );
    Ok(report)
}

/// A listed relative path as a local one, refusing anything that could
/// leave the target folder
fn local_relative(relative_path: &str) -> Option<PathBuf> {
    let path = Path::new(relative_path);
    if relative_path.is_empty()
        || !path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use crate::catalog::MemoryCatalog;
    use crate::server::{FileServer, FileServerConfig};
    use crate::service::ServiceHandle;
    use crate::testutil;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn start_files() -> (ServiceHandle, TempDir) {
        let save_dir = TempDir::new().unwrap();
        let config = FileServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            save_dir: save_dir.path().to_path_buf(),
            tls_config: testutil::server_tls(),
            auth: AuthContext::open(),
            max_connections: 16,
            recv_timeout: Duration::from_secs(5),
        };
        let handle = FileServer::bind(config, Arc::new(MemoryCatalog::new()))
            .await
            .unwrap()
            .spawn()
            .unwrap();
        (handle, save_dir)
    }

    fn client() -> FileClient {
        FileClient::new(testutil::client_tls(), None)
    }

    #[test]
    fn test_local_relative_refuses_escapes() {
        assert_eq!(local_relative("b/c.txt"), Some(PathBuf::from("b/c.txt")));
        assert!(local_relative("../c.txt").is_none());
        assert!(local_relative("/etc/passwd").is_none());
        assert!(local_relative("").is_none());
    }

    #[tokio::test]
    async fn test_folder_download_recreates_tree() {
        let (handle, _server_dir) = start_files().await;
        let remote = TempDir::new().unwrap();
        let shared = remote.path().join("shared");
        std::fs::create_dir_all(shared.join("b")).unwrap();
        std::fs::write(shared.join("a.txt"), vec![1u8; 10]).unwrap();
        std::fs::write(shared.join("b/c.txt"), vec![2u8; 20]).unwrap();
        let save = TempDir::new().unwrap();

        let mut events = Vec::new();
        let report = download_folder(
            &client(),
            handle.local_addr(),
            &shared.to_string_lossy(),
            save.path(),
            |progress| events.push(progress),
        )
        .await
        .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.completed.len(), 2);
        let root = save.path().join("shared");
        assert_eq!(std::fs::metadata(root.join("a.txt")).unwrap().len(), 10);
        assert_eq!(std::fs::metadata(root.join("b/c.txt")).unwrap().len(), 20);

        let done: Vec<_> = events
            .iter()
            .filter(|e| e.status == ProgressStatus::Done)
            .collect();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].relative_path, "a.txt");
        assert_eq!(done[0].overall_ratio, 0.5);
        assert_eq!(done[1].relative_path, "b/c.txt");
        assert_eq!(done[1].overall_ratio, 1.0);

        assert_eq!(events[0].status, ProgressStatus::Start);
        assert!(events
            .iter()
            .any(|e| e.status == ProgressStatus::Progress && e.file_ratio == 1.0));
    }

    #[tokio::test]
    async fn test_failed_file_does_not_abort_the_rest() {
        let (handle, _server_dir) = start_files().await;
        let remote = TempDir::new().unwrap();
        let shared = remote.path().join("docs");
        std::fs::create_dir_all(&shared).unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(shared.join(name), name.as_bytes()).unwrap();
        }
        let save = TempDir::new().unwrap();

        // b.txt disappears after the listing was taken
        let doomed = shared.join("b.txt");
        let mut events = Vec::new();
        let report = download_folder(
            &client(),
            handle.local_addr(),
            &shared.to_string_lossy(),
            save.path(),
            |progress| {
                if progress.relative_path == "a.txt" && progress.status == ProgressStatus::Start {
                    let _ = std::fs::remove_file(&doomed);
                }
                events.push(progress);
            },
        )
        .await
        .unwrap();

        assert_eq!(report.completed.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b.txt");
        assert!(matches!(report.failed[0].1, ProtocolError::NotFound(_)));

        let outcomes: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.status, ProgressStatus::Done | ProgressStatus::Error))
            .map(|e| (e.relative_path.as_str(), e.status))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("a.txt", ProgressStatus::Done),
                ("b.txt", ProgressStatus::Error),
                ("c.txt", ProgressStatus::Done),
            ]
        );
        assert!(save.path().join("docs/c.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_folder_fails_the_call() {
        let (handle, _server_dir) = start_files().await;
        let save = TempDir::new().unwrap();

        let result = download_folder(
            &client(),
            handle.local_addr(),
            "/no/such/folder",
            save.path(),
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::NotFound(_))));
    }
}
