//! Shared fixtures for indexer integration tests

use cbt::{CbtEngine, NullCbt};
use dao::ClientDao;
use indexer::context::IndexerContext;
use indexer::fileserv::{FileServ, NullFileServ};
use indexer::platform::UnixPlatform;
use indexer::snapshot::SnapshotBackend;
use indexer::tokens::NullTokenSource;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;
use watcher::NullChangeSource;

/// Snapshot backend doubling the original volume directory via a bind-style
/// copy: "snapshots" are directories under the fixture root whose content
/// is whatever the volume had when `create` ran.
pub struct TestSnapshots {
    pub base: PathBuf,
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
    pub fail: AtomicBool,
}

impl TestSnapshots {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }
}

impl SnapshotBackend for TestSnapshots {
    fn create(&self, ssetid: Uuid, _volume: &str, _logical_name: &str) -> anyhow::Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("snapshot provider failure injected");
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let mount = self.base.join(format!("snap_{}_{}", ssetid.simple(), n));
        std::fs::create_dir_all(&mount)?;
        Ok(mount.to_string_lossy().into_owned())
    }

    fn remove(&self, _ssetid: Uuid, volpath: &str, _volume: &str) -> anyhow::Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        std::fs::remove_dir_all(volpath).ok();
        Ok(())
    }

    fn locally_mounted(&self) -> bool {
        true
    }
}

/// File server stub with a switchable active-transfer flag.
#[derive(Default)]
pub struct BusyFileServ {
    pub active: AtomicBool,
    inner: NullFileServ,
}

impl FileServ for BusyFileServ {
    fn has_active_transfers(&self, _share: &str, _token: &str) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn share_dir(&self, token: &str, name: &str, path: &str) {
        self.inner.share_dir(token, name, path);
    }

    fn remove_dir(&self, token: &str, name: &str) {
        self.inner.remove_dir(token, name);
    }

    fn share_path(&self, name: &str) -> String {
        self.inner.share_path(name)
    }
}

pub struct Fixture {
    pub tmp: TempDir,
    pub data_dir: PathBuf,
    pub fs_root: PathBuf,
    pub snapshots: Arc<TestSnapshots>,
    pub fileserv: Arc<BusyFileServ>,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("data");
        let fs_root = tmp.path().join("fs");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::create_dir_all(&fs_root).unwrap();

        let snapshots = Arc::new(TestSnapshots::new(&tmp.path().join("snaps")));
        let fileserv = Arc::new(BusyFileServ::default());

        Self {
            tmp,
            data_dir,
            fs_root,
            snapshots,
            fileserv,
        }
    }

    pub fn context(&self) -> Arc<IndexerContext> {
        let dao = ClientDao::open(&self.tmp.path().join("db")).unwrap();
        Arc::new(IndexerContext::new(
            dao,
            Box::new(NullChangeSource),
            self.snapshots.clone(),
            CbtEngine::new(Arc::new(NullCbt), &self.data_dir),
            Arc::new(UnixPlatform),
            self.fileserv.clone(),
            Arc::new(NullTokenSource),
            &self.data_dir,
        ))
    }

    pub fn filelist(&self) -> String {
        std::fs::read_to_string(self.data_dir.join("filelist.ub")).unwrap_or_default()
    }
}

/// Collect every reply word sent for one request.
pub async fn collect_replies(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) -> Vec<String> {
    let mut replies = Vec::new();
    while let Some(word) = rx.recv().await {
        replies.push(word);
    }
    replies
}
