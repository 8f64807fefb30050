//! Watches a workspace's `factory.json` and turns edits into queue kicks.
//!
//! Uses the `notify` debouncer (kqueue on macOS, inotify on Linux). Only the
//! workspace config is hot-reloaded; global settings require a restart.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::hub::WorkspaceCore;
use crate::workspace::WorkspaceConfig;

pub struct ConfigWatcher {
    // Hold the watcher alive; dropping it stops the file watch.
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching the workspace's artifact root for `factory.json`
    /// changes. Returns `None` when the watcher cannot be created; the
    /// daemon runs fine without hot-reload.
    pub fn start(core: Arc<WorkspaceCore>) -> Option<Self> {
        let config_path = core.workspace.artifact_root.join("factory.json");
        let rt_handle = tokio::runtime::Handle::current();

        let core_for_events = core.clone();
        let config_path_clone = config_path.clone();
        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                let Ok(events) = result else { return };
                use notify_debouncer_full::notify::EventKind;
                let relevant = events.iter().any(|e| {
                    matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                        && e.event.paths.iter().any(|p| p == &config_path_clone)
                });
                if !relevant {
                    return;
                }
                let core = core_for_events.clone();
                let path = config_path_clone.clone();
                rt_handle.spawn(async move {
                    let new_config = load_config(&path).await;
                    if core.config().await != new_config {
                        info!(
                            workspace = %core.workspace_id(),
                            "factory.json reloaded, kicking queue"
                        );
                        core.set_config(new_config).await;
                    }
                });
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                if let Err(e) = debouncer.watcher().watch(
                    &core.workspace.artifact_root,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "workspace config watcher started");
                Some(Self {
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

async fn load_config(path: &Path) -> WorkspaceConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => WorkspaceConfig::default(),
    }
}
