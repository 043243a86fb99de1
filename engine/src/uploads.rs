//! The uploads directory: listing, deletion and a watcher that keeps the
//! playlist in step with files removed behind our back.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::asset::MediaType;
use crate::engine::Engine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Uploads {
    dir: PathBuf,
}

impl Uploads {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of an uploaded file, or `None` if `name` would escape the directory.
    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        let bad = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.contains('\0');
        (!bad).then(|| self.dir.join(name))
    }

    /// Regular files in the directory, sorted by name. A missing directory
    /// lists as empty.
    pub async fn list(&self) -> Vec<UploadedFile> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(dir = %self.dir.display(), "cannot list uploads: {e}");
                }
                return out;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                out.push(UploadedFile {
                    name: name.to_string(),
                    size: meta.len(),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn exists(&self, name: &str) -> bool {
        match self.path_of(name) {
            Some(p) => tokio::fs::metadata(p).await.map(|m| m.is_file()).unwrap_or(false),
            None => false,
        }
    }

    pub async fn remove(&self, name: &str) -> io::Result<()> {
        let path = self
            .path_of(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;
        tokio::fs::remove_file(path).await
    }
}

/// Media type implied by a file extension.
pub fn guess_media_type(name: &str) -> MediaType {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "svg" => MediaType::Image,
        "mp4" | "webm" | "mkv" | "mov" | "avi" | "ogv" => MediaType::Video,
        "html" | "htm" => MediaType::Web,
        _ => MediaType::Undefined,
    }
}

/// Watch the uploads directory. Files that disappear take their playlist
/// entries with them and the file list is rebroadcast after every change.
/// The returned watcher must be kept alive.
pub fn watch(engine: Arc<Engine>) -> notify::Result<RecommendedWatcher> {
    let dir = engine.uploads.dir().to_path_buf();
    std::fs::create_dir_all(&dir)?;

    let (tx, mut rx) = mpsc::channel::<Vec<PathBuf>>(64);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            if tx.blocking_send(event.paths).is_err() {
                debug!("uploads watcher receiver dropped");
            }
        }
        Err(e) => warn!("uploads watcher error: {e}"),
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(dir = %dir.display(), "watching uploads");

    tokio::spawn(async move {
        while let Some(paths) = rx.recv().await {
            for path in paths {
                if path.exists() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
                let removed = engine.mutate(|p| p.remove_file(name)).await;
                if removed > 0 {
                    info!(file = name, removed, "uploaded file vanished, dropped its assets");
                }
            }
            engine.broadcast_files().await;
        }
    });
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_from_extension() {
        assert_eq!(guess_media_type("promo.mp4"), MediaType::Video);
        assert_eq!(guess_media_type("Logo.PNG"), MediaType::Image);
        assert_eq!(guess_media_type("menu.html"), MediaType::Web);
        assert_eq!(guess_media_type("notes"), MediaType::Undefined);
    }

    #[test]
    fn names_cannot_escape() {
        let u = Uploads::new("/srv/uploads");
        assert_eq!(u.path_of("a.png"), Some(PathBuf::from("/srv/uploads/a.png")));
        assert!(u.path_of("../etc/passwd").is_none());
        assert!(u.path_of("..").is_none());
        assert!(u.path_of("").is_none());
    }

    #[tokio::test]
    async fn lists_sorted_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let u = Uploads::new(dir.path());
        std::fs::write(dir.path().join("b.png"), b"12").unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let names: Vec<_> = u.list().await.into_iter().map(|f| (f.name, f.size)).collect();
        assert_eq!(names, vec![("a.mp4".to_string(), 1), ("b.png".to_string(), 2)]);
        assert!(u.exists("a.mp4").await);
        assert!(!u.exists("sub").await);

        u.remove("a.mp4").await.unwrap();
        assert!(!u.exists("a.mp4").await);
        assert!(u.remove("../x").await.is_err());
    }

    #[tokio::test]
    async fn missing_dir_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let u = Uploads::new(dir.path().join("nope"));
        assert!(u.list().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn vanished_file_drops_its_assets() {
        let dir = tempfile::tempdir().unwrap();
        let assets = vec![
            crate::asset::Asset::new("file:a.png"),
            crate::asset::Asset::new("https://menu.example/"),
        ];
        let (engine, _rx) = crate::testing::engine(&dir, assets, false);
        std::fs::create_dir_all(engine.uploads.dir()).unwrap();
        let file = engine.uploads.dir().join("a.png");
        std::fs::write(&file, b"png").unwrap();

        let _watcher = watch(engine.clone()).unwrap();
        std::fs::remove_file(&file).unwrap();

        let drained = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while engine.view(|p| p.len()).await != 1 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "asset for the deleted file was not dropped");
        let left = engine.view(|p| p.assets()[0].url.clone()).await;
        assert_eq!(left, "https://menu.example/");
    }
}
