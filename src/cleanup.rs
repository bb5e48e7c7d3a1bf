use crate::frontmatter::document_id;
use crate::io::FileIo;
use crate::models::{CleanupTarget, OrphanCleanupConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

pub const DEFAULT_MIN_DISK_COUNT: usize = 5;
pub const DEFAULT_MIN_KEEP_RATIO: f64 = 0.5;

/// Refuses cleanup when a large on-disk set would lose most of its items,
/// which usually means the in-memory keep-set was loaded incompletely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupSafeguard {
    pub min_disk_count: usize,
    pub min_keep_ratio: f64,
}

impl Default for CleanupSafeguard {
    fn default() -> Self {
        Self {
            min_disk_count: DEFAULT_MIN_DISK_COUNT,
            min_keep_ratio: DEFAULT_MIN_KEEP_RATIO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafeguardDecision {
    Proceed,
    Skip { keep_ratio: f64 },
}

impl CleanupSafeguard {
    pub fn evaluate(&self, keep_count: usize, disk_count: usize) -> SafeguardDecision {
        let keep_ratio = keep_count as f64 / disk_count.max(1) as f64;
        if disk_count > self.min_disk_count && keep_ratio < self.min_keep_ratio {
            SafeguardDecision::Skip { keep_ratio }
        } else {
            SafeguardDecision::Proceed
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CleanupOutcome {
    EmptyKeepSet {
        subdir: String,
    },
    Tripped {
        subdir: String,
        keep_count: usize,
        disk_count: usize,
        keep_ratio: f64,
    },
    Cleaned {
        subdir: String,
        removed: usize,
    },
    Failed {
        subdir: String,
        error: String,
    },
}

impl CleanupOutcome {
    pub fn removed(&self) -> usize {
        match self {
            Self::Cleaned { removed, .. } => *removed,
            _ => 0,
        }
    }
}

pub async fn run_orphan_cleanup(
    io: &dyn FileIo,
    data_dir: &Path,
    configs: &[OrphanCleanupConfig],
    label: &str,
    safeguard: &CleanupSafeguard,
) -> Vec<CleanupOutcome> {
    let mut outcomes = Vec::with_capacity(configs.len());
    for config in configs {
        let subdir = config.target.subdir().to_string();
        if config.keep_ids.is_empty() {
            tracing::debug!(label = %label, subdir = %subdir, "empty keep-set; skipping cleanup");
            outcomes.push(CleanupOutcome::EmptyKeepSet { subdir });
            continue;
        }

        let keep_count = config.keep_ids.iter().collect::<BTreeSet<_>>().len();
        let disk_count = count_items_on_disk(io, data_dir, &config.target).await;
        if let SafeguardDecision::Skip { keep_ratio } = safeguard.evaluate(keep_count, disk_count) {
            tracing::warn!(
                label = %label,
                subdir = %subdir,
                keep_count,
                disk_count,
                keep_percent = %format!("{:.1}%", keep_ratio * 100.0),
                "orphan cleanup skipped; keep-set covers too few on-disk items"
            );
            outcomes.push(CleanupOutcome::Tripped {
                subdir,
                keep_count,
                disk_count,
                keep_ratio,
            });
            continue;
        }

        match io.cleanup_orphan(data_dir, &config.target, &config.keep_ids).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(label = %label, subdir = %subdir, removed, "removed orphaned items");
                }
                outcomes.push(CleanupOutcome::Cleaned { subdir, removed });
            }
            Err(error) => {
                tracing::error!(label = %label, subdir = %subdir, error = %error, "orphan cleanup failed");
                outcomes.push(CleanupOutcome::Failed {
                    subdir,
                    error: error.to_string(),
                });
            }
        }
    }
    outcomes
}

/// Counts items of `target`'s shape without touching them. Scan failures
/// count as zero.
pub async fn count_items_on_disk(io: &dyn FileIo, data_dir: &Path, target: &CleanupTarget) -> usize {
    let root = data_dir.join(target.subdir());
    let scan = match target {
        CleanupTarget::Dirs { marker_file, .. } => {
            io.scan_and_read(&root, &[marker_file.clone()], false, None).await
        }
        CleanupTarget::Files { extension, .. } => {
            io.scan_and_read(&root, &[format!("*.{extension}")], false, None).await
        }
        CleanupTarget::FilesRecursive {
            marker_file,
            extension,
            ..
        } => {
            io.scan_and_read(
                &root,
                &[format!("*.{extension}"), marker_file.clone()],
                true,
                None,
            )
            .await
        }
    };
    let scan = match scan {
        Ok(scan) => scan,
        Err(error) => {
            tracing::debug!(path = %root.display(), error = %error, "counting on-disk items failed");
            return 0;
        }
    };

    match target {
        CleanupTarget::Dirs { .. } => scan.dirs.iter().filter(|dir| dir.parent() == Some(root.as_path())).count(),
        CleanupTarget::Files { .. } => scan
            .files
            .keys()
            .filter(|path| path.parent() == Some(root.as_path()))
            .count(),
        CleanupTarget::FilesRecursive {
            marker_file,
            extension,
            ..
        } => scan
            .files
            .iter()
            .filter(|(path, _)| path.extension().and_then(|value| value.to_str()) == Some(extension.as_str()))
            .filter(|(path, _)| {
                path.parent()
                    .is_some_and(|parent| scan.files.contains_key(&parent.join(marker_file)))
            })
            .filter(|(_, content)| document_id(content).is_some())
            .count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalFileIo;

    fn files_target() -> CleanupTarget {
        CleanupTarget::Files {
            subdir: "humans".to_string(),
            extension: "md".to_string(),
        }
    }

    fn seed_humans(root: &Path, count: usize) -> Vec<String> {
        let dir = root.join("humans");
        std::fs::create_dir_all(&dir).expect("create humans");
        (0..count)
            .map(|index| {
                let id = format!("h{index}");
                std::fs::write(dir.join(format!("{id}.md")), "x").expect("write human");
                id
            })
            .collect()
    }

    #[test]
    fn safeguard_thresholds() {
        let safeguard = CleanupSafeguard::default();
        assert!(matches!(safeguard.evaluate(2, 10), SafeguardDecision::Skip { .. }));
        assert_eq!(safeguard.evaluate(8, 10), SafeguardDecision::Proceed);
        assert_eq!(safeguard.evaluate(1, 5), SafeguardDecision::Proceed);
        assert_eq!(safeguard.evaluate(5, 10), SafeguardDecision::Proceed);
    }

    #[tokio::test]
    async fn tripped_safeguard_leaves_disk_untouched() {
        let root = tempfile::tempdir().expect("temp dir");
        let ids = seed_humans(root.path(), 10);
        let configs = vec![OrphanCleanupConfig::new(files_target(), ids[..2].to_vec())];

        let outcomes = run_orphan_cleanup(
            &LocalFileIo::new(),
            root.path(),
            &configs,
            "humans",
            &CleanupSafeguard::default(),
        )
        .await;

        assert!(matches!(
            outcomes[0],
            CleanupOutcome::Tripped {
                keep_count: 2,
                disk_count: 10,
                ..
            }
        ));
        assert_eq!(std::fs::read_dir(root.path().join("humans")).expect("read dir").count(), 10);
    }

    #[tokio::test]
    async fn cleanup_proceeds_when_most_items_are_kept() {
        let root = tempfile::tempdir().expect("temp dir");
        let ids = seed_humans(root.path(), 10);
        let configs = vec![OrphanCleanupConfig::new(files_target(), ids[..8].to_vec())];

        let outcomes = run_orphan_cleanup(
            &LocalFileIo::new(),
            root.path(),
            &configs,
            "humans",
            &CleanupSafeguard::default(),
        )
        .await;

        assert_eq!(outcomes[0].removed(), 2);
        assert!(root.path().join("humans").join("h7.md").exists());
        assert!(!root.path().join("humans").join("h9.md").exists());
    }

    #[tokio::test]
    async fn empty_keep_set_never_cleans() {
        let root = tempfile::tempdir().expect("temp dir");
        seed_humans(root.path(), 3);
        let configs = vec![OrphanCleanupConfig::new(files_target(), Vec::new())];

        let outcomes = run_orphan_cleanup(
            &LocalFileIo::new(),
            root.path(),
            &configs,
            "humans",
            &CleanupSafeguard::default(),
        )
        .await;

        assert!(matches!(outcomes[0], CleanupOutcome::EmptyKeepSet { .. }));
        assert_eq!(std::fs::read_dir(root.path().join("humans")).expect("read dir").count(), 3);
    }

    #[tokio::test]
    async fn counts_follow_target_shape() {
        let root = tempfile::tempdir().expect("temp dir");
        let io = LocalFileIo::new();
        let sessions = root.path().join("sessions");
        std::fs::create_dir_all(sessions.join("s1").join("notes")).expect("create s1");
        std::fs::create_dir_all(sessions.join("s2")).expect("create s2");
        std::fs::write(sessions.join("s1").join("_meta.json"), "{}").expect("write meta");
        std::fs::write(sessions.join("s1").join("a.md"), "---\nid: a\n---\n").expect("write a");
        std::fs::write(sessions.join("s1").join("loose.md"), "no frontmatter").expect("write loose");
        std::fs::write(sessions.join("s1").join("notes").join("b.md"), "---\nid: b\n---\n").expect("write b");
        std::fs::write(sessions.join("s2").join("c.md"), "---\nid: c\n---\n").expect("write c");

        let recursive = CleanupTarget::FilesRecursive {
            subdir: "sessions".to_string(),
            marker_file: "_meta.json".to_string(),
            extension: "md".to_string(),
        };
        assert_eq!(count_items_on_disk(&io, root.path(), &recursive).await, 1);

        let dirs = CleanupTarget::Dirs {
            subdir: "sessions".to_string(),
            marker_file: "_meta.json".to_string(),
        };
        assert_eq!(count_items_on_disk(&io, root.path(), &dirs).await, 1);

        let missing = CleanupTarget::Files {
            subdir: "missing".to_string(),
            extension: "md".to_string(),
        };
        assert_eq!(count_items_on_disk(&io, root.path(), &missing).await, 0);
    }
}
