use std::{io::ErrorKind, path::Path, time::Duration};

use chrono::Utc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{lifecycle::JOB_DIR_PREFIX, registry::TokenRegistry};

pub fn spawn_sweeper(registry: TokenRegistry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reclaimed = registry.sweep(Utc::now()).await;
            if reclaimed > 0 {
                info!(reclaimed, "sweeper reclaimed expired downloads");
            } else {
                debug!("sweeper found nothing to reclaim");
            }
        }
    })
}

/// Removes job directories left behind by a previous process. Tokens do not survive a
/// restart, so nothing can ever claim them.
pub async fn purge_orphaned_jobs(temp_root: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(temp_root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!(path = ?temp_root, %error, "could not open temp root for purge");
            }
            return 0;
        }
    };

    let mut purged = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "could not iterate temp root for purge");
                break;
            }
        };

        if !entry.file_name().to_string_lossy().starts_with(JOB_DIR_PREFIX) {
            continue;
        }

        let path = entry.path();
        let is_dir = match entry.file_type().await {
            Ok(file_type) => file_type.is_dir(),
            Err(error) => {
                warn!(?path, %error, "could not read entry type");
                continue;
            }
        };
        if !is_dir {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => purged += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!(?path, %error, "could not remove orphaned job directory"),
        }
    }

    if purged > 0 {
        info!(purged, "removed orphaned job directories from a previous run");
    }
    purged
}
