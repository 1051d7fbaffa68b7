use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use inferoute_types::{DynamicConfig, RouterError, RouterResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Quiet period after a filesystem event before the document is re-read, so
/// editors that write in several syscalls produce one reload.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Watches the dynamic configuration document and hands every valid new
/// version to the apply callback (the same code path `POST /reconfigure`
/// uses). Invalid documents are logged and skipped; the previous
/// configuration stays active.
pub struct FileDiscovery {
    path: PathBuf,
    apply: Arc<dyn Fn(DynamicConfig) + Send + Sync>,
}

/// Keeps the filesystem watcher and the debounce task alive.
pub struct FileDiscoveryHandle {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl FileDiscoveryHandle {
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl FileDiscovery {
    pub fn new(
        path: impl Into<PathBuf>,
        apply: Arc<dyn Fn(DynamicConfig) + Send + Sync>,
    ) -> Self {
        Self {
            path: path.into(),
            apply,
        }
    }

    /// Load the document once, then watch for changes.
    pub fn spawn(self) -> RouterResult<FileDiscoveryHandle> {
        let initial = load_config(&self.path)?;
        (self.apply)(initial);

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let watched = self.path.clone();

        let mut watcher = notify::recommended_watcher(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => {
                    error!(error = %e, "config file watch error");
                }
            },
        )
        .map_err(|e| RouterError::config_invalid(format!("cannot create file watcher: {e}")))?;

        let watch_target = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .map_err(|e| {
                RouterError::config_invalid(format!(
                    "cannot watch {}: {e}",
                    watch_target.display()
                ))
            })?;
        info!(path = %self.path.display(), "watching dynamic configuration");

        let apply = self.apply;
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(DEBOUNCE).await;
                // Collapse the burst of events behind one reload.
                while rx.try_recv().is_ok() {}

                match load_config(&watched) {
                    Ok(config) => {
                        info!(path = %watched.display(), "configuration file changed, reloading");
                        apply(config);
                    }
                    Err(e) => {
                        warn!(path = %watched.display(), error = %e, "ignoring invalid configuration file");
                    }
                }
            }
        });

        Ok(FileDiscoveryHandle {
            _watcher: watcher,
            task,
        })
    }
}

fn load_config(path: &Path) -> RouterResult<DynamicConfig> {
    let bytes = std::fs::read(path).map_err(|e| {
        RouterError::config_invalid(format!("cannot read {}: {e}", path.display()))
    })?;
    DynamicConfig::parse(&bytes)
}
