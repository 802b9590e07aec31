//! Local OCI image cache.
//!
//! The cache is a push source for the reconciler: `get` either returns the
//! cached image or the `Pulling` sentinel, and the first sight of an unknown
//! reference starts a background pull. Registered listeners receive a
//! pull-done event when a reference is materialised, so the reconciler never
//! polls.
//!
//! Pull mechanics live behind the [`ImagePuller`] seam; the shipped puller
//! delegates to an external fetch command that must leave a `rootfs` file in
//! the destination directory.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::process::Command;
use tracing::info;
use tracing::warn;

pub const ROOTFS_FILE: &str = "rootfs";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ImageError {
    /// Sentinel: the reference is being pulled; a pull-done event will fire.
    #[snafu(display("image {image_ref} is being pulled"))]
    Pulling { image_ref: String },

    #[snafu(display("no image puller configured, cannot pull {image_ref}"))]
    NoPuller { image_ref: String },

    #[snafu(display("failed to run image puller {}: {source}", bin.display()))]
    RunPuller { bin: PathBuf, source: std::io::Error },

    #[snafu(display("image puller exited with {status} for {image_ref}"))]
    PullerFailed { image_ref: String, status: std::process::ExitStatus },

    #[snafu(display("pull of {image_ref} left no rootfs at {}", path.display()))]
    MissingRootfs { image_ref: String, path: PathBuf },

    #[snafu(display("pull of {image_ref} failed: {message}"))]
    PullFailed { image_ref: String, message: String },

    #[snafu(display("image cache io on {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },
}

impl ImageError {
    pub fn is_pulling(&self) -> bool {
        matches!(self, ImageError::Pulling { .. })
    }
}

pub type Result<T, E = ImageError> = std::result::Result<T, E>;

/// A materialised image.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub image_ref: String,
    pub rootfs: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PullDoneEvent {
    pub image_ref: String,
}

type Listener = Box<dyn Fn(&PullDoneEvent) + Send + Sync>;

/// Fetches an image reference into a destination directory.
#[async_trait]
pub trait ImagePuller: Send + Sync + 'static {
    async fn pull(&self, image_ref: &str, dest: &Path) -> Result<()>;
}

/// Puller that shells out: `<bin> <ref> <dest-dir>`.
pub struct CommandPuller {
    bin: Option<PathBuf>,
}

impl CommandPuller {
    pub fn new(bin: Option<PathBuf>) -> Self {
        Self { bin }
    }
}

#[async_trait]
impl ImagePuller for CommandPuller {
    async fn pull(&self, image_ref: &str, dest: &Path) -> Result<()> {
        let Some(bin) = &self.bin else {
            return NoPullerSnafu { image_ref }.fail();
        };

        let status = Command::new(bin)
            .arg(image_ref)
            .arg(dest)
            .stdin(Stdio::null())
            .status()
            .await
            .context(RunPullerSnafu { bin: bin.clone() })?;
        if !status.success() {
            return PullerFailedSnafu { image_ref, status }.fail();
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

struct Inner {
    images_dir: PathBuf,
    puller: Arc<dyn ImagePuller>,
    pulling: Mutex<HashSet<String>>,
    /// Failures surfaced on the next `get`, so the caller's retry/backoff
    /// machinery drives re-pulls instead of the cache looping on its own.
    failed: Mutex<HashMap<String, String>>,
    listeners: Mutex<Vec<Listener>>,
}

impl ImageCache {
    pub fn new(images_dir: impl Into<PathBuf>, puller: Arc<dyn ImagePuller>) -> Self {
        Self {
            inner: Arc::new(Inner {
                images_dir: images_dir.into(),
                puller,
                pulling: Mutex::new(HashSet::new()),
                failed: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn add_listener(&self, listener: impl Fn(&PullDoneEvent) + Send + Sync + 'static) {
        self.inner.listeners.lock().expect("listener lock").push(Box::new(listener));
    }

    /// Look up a reference, starting a background pull on first sight.
    pub async fn get(&self, image_ref: &str) -> Result<CachedImage> {
        let rootfs = self.rootfs_path(image_ref);
        match tokio::fs::try_exists(&rootfs).await {
            Ok(true) => {
                return Ok(CachedImage {
                    image_ref: image_ref.to_string(),
                    rootfs,
                });
            }
            Ok(false) => {}
            Err(source) => return Err(ImageError::Io { path: rootfs, source }),
        }

        if let Some(message) = self.inner.failed.lock().expect("failed lock").remove(image_ref) {
            return PullFailedSnafu { image_ref, message }.fail();
        }

        {
            let mut pulling = self.inner.pulling.lock().expect("pulling lock");
            if !pulling.insert(image_ref.to_string()) {
                return PullingSnafu { image_ref }.fail();
            }
        }

        info!(image = %image_ref, "image not in cache, starting pull");
        let cache = self.clone();
        let pulled_ref = image_ref.to_string();
        tokio::spawn(async move {
            if let Err(error) = cache.pull(&pulled_ref).await {
                warn!(image = %pulled_ref, %error, "image pull failed");
                cache
                    .inner
                    .failed
                    .lock()
                    .expect("failed lock")
                    .insert(pulled_ref.clone(), error.to_string());
            }
            cache.inner.pulling.lock().expect("pulling lock").remove(&pulled_ref);
        });

        PullingSnafu { image_ref }.fail()
    }

    async fn pull(&self, image_ref: &str) -> Result<()> {
        let dest = self.image_dir(image_ref);
        tokio::fs::create_dir_all(&dest).await.context(IoSnafu { path: dest.clone() })?;

        self.inner.puller.pull(image_ref, &dest).await?;

        let rootfs = dest.join(ROOTFS_FILE);
        match tokio::fs::try_exists(&rootfs).await {
            Ok(true) => {}
            Ok(false) => return MissingRootfsSnafu { image_ref, path: rootfs }.fail(),
            Err(source) => return Err(ImageError::Io { path: rootfs, source }),
        }

        info!(image = %image_ref, "image pulled");
        let event = PullDoneEvent { image_ref: image_ref.to_string() };
        for listener in self.inner.listeners.lock().expect("listener lock").iter() {
            listener(&event);
        }
        Ok(())
    }

    fn image_dir(&self, image_ref: &str) -> PathBuf {
        self.inner.images_dir.join(escape_ref(image_ref))
    }

    fn rootfs_path(&self, image_ref: &str) -> PathBuf {
        self.image_dir(image_ref).join(ROOTFS_FILE)
    }
}

/// Flatten an OCI reference into a single path component.
fn escape_ref(image_ref: &str) -> String {
    image_ref
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct WritePuller;

    #[async_trait]
    impl ImagePuller for WritePuller {
        async fn pull(&self, _image_ref: &str, dest: &Path) -> Result<()> {
            tokio::fs::write(dest.join(ROOTFS_FILE), b"disk").await.unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_get_pulls_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path(), Arc::new(WritePuller));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_listener = fired.clone();
        cache.add_listener(move |evt| {
            assert_eq!(evt.image_ref, "registry.example/os:1.0");
            fired_in_listener.fetch_add(1, Ordering::SeqCst);
        });

        let err = cache.get("registry.example/os:1.0").await.unwrap_err();
        assert!(err.is_pulling());

        // Wait out the background pull.
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let image = cache.get("registry.example/os:1.0").await.unwrap();
        assert!(image.rootfs.is_file());
    }

    struct BrokenPuller;

    #[async_trait]
    impl ImagePuller for BrokenPuller {
        async fn pull(&self, image_ref: &str, _dest: &Path) -> Result<()> {
            NoPullerSnafu { image_ref }.fail()
        }
    }

    #[tokio::test]
    async fn failed_pull_surfaces_once_then_retries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path(), Arc::new(BrokenPuller));

        assert!(cache.get("reg.io/os:1").await.unwrap_err().is_pulling());
        for _ in 0..100 {
            if !cache.inner.failed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        // The stored failure is reported once, then the next get re-pulls.
        let err = cache.get("reg.io/os:1").await.unwrap_err();
        assert!(matches!(err, ImageError::PullFailed { .. }));
        assert!(cache.get("reg.io/os:1").await.unwrap_err().is_pulling());
    }

    #[tokio::test]
    async fn escaping_keeps_refs_apart() {
        assert_ne!(escape_ref("a/b:1"), escape_ref("a/b:2"));
        assert_eq!(escape_ref("reg.io/os:1.0"), "reg.io_os_1.0");
    }
}
