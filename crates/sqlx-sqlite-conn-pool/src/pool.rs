//! Sharing policies: one handle per caller, or one handle for everyone

use std::ffi::OsString;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::config::HandleConfig;
use crate::handle::ConnectionHandle;
use crate::{Error, Result};

/// How callers of a [`ConnectionPool`] get at the database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
   /// Every `acquire` opens a private handle, closed again on release.
   ///
   /// Writers only coordinate through the engine's file lock, so concurrent
   /// writers see busy errors and may starve each other. This is the lower
   /// guarantee mode; pair it with a busy-retry policy.
   Isolated,

   /// One handle is opened up front and lent out to a single holder at a time.
   ///
   /// Every statement is serialized through the pool's admission, so writers
   /// never contend on the file lock among themselves.
   #[default]
   Shared,
}

/// Hands out connection handles according to a [`SharingMode`].
///
/// ## Admission
///
/// In shared mode the single handle sits behind a FIFO mutex. `acquire`
/// returns only once every earlier holder has released it, so statements
/// (and whole transactions, when bracketed inside one acquisition) are
/// totally ordered in request order. Holding a [`PooledHandle`] is the right
/// to issue calls against the shared handle; there is no other path to it.
///
/// Reads are serialized the same way. Letting queries interleave with a
/// writer would need snapshot isolation from the engine.
#[derive(Debug)]
pub struct ConnectionPool {
   path: PathBuf,
   mode: SharingMode,
   config: HandleConfig,
   shared: Option<Arc<Mutex<ConnectionHandle>>>,
   admissions: AtomicU64,
   closed: AtomicBool,
}

impl ConnectionPool {
   /// Create a pool for the database at `path`.
   ///
   /// Shared mode opens its handle immediately, so open failures surface here.
   pub async fn new(
      path: impl AsRef<Path>,
      mode: SharingMode,
      config: HandleConfig,
   ) -> Result<Self> {
      let path = path.as_ref().to_path_buf();

      let shared = match mode {
         SharingMode::Shared => {
            let handle = ConnectionHandle::open(&path, &config).await?;
            Some(Arc::new(Mutex::new(handle)))
         }
         SharingMode::Isolated => None,
      };

      debug!(
         path = %path.display(),
         ?mode,
         threadsafe = ConnectionHandle::threadsafe_mode(),
         "connection pool created"
      );

      Ok(Self {
         path,
         mode,
         config,
         shared,
         admissions: AtomicU64::new(0),
         closed: AtomicBool::new(false),
      })
   }

   pub fn mode(&self) -> SharingMode {
      self.mode
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn config(&self) -> &HandleConfig {
      &self.config
   }

   /// Number of handles handed out so far
   pub fn admissions(&self) -> u64 {
      self.admissions.load(Ordering::Relaxed)
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::SeqCst)
   }

   /// Get a handle to issue statements on.
   ///
   /// In shared mode this waits for admission behind every earlier caller.
   /// A rollback left pending by a previous holder runs before the handle is
   /// returned.
   pub async fn acquire(&self) -> Result<PooledHandle> {
      if self.is_closed() {
         return Err(Error::PoolClosed);
      }

      let slot = match &self.shared {
         Some(shared) => {
            let mut guard = Arc::clone(shared).lock_owned().await;

            // The pool may have been closed while we waited
            if guard.is_closed() {
               return Err(Error::PoolClosed);
            }

            guard.recover().await?;
            Slot::Shared(guard)
         }
         None => Slot::Isolated(ConnectionHandle::open(&self.path, &self.config).await?),
      };

      let admission = self.admissions.fetch_add(1, Ordering::Relaxed) + 1;
      trace!(admission, mode = ?self.mode, "handle acquired");

      Ok(PooledHandle {
         slot,
         mode: self.mode,
      })
   }

   /// Give a handle back. Isolated handles are closed; the shared handle is
   /// passed on to the next caller waiting for admission.
   pub async fn release(&self, handle: PooledHandle) -> Result<()> {
      match handle.slot {
         Slot::Isolated(mut handle) => handle.close().await,
         Slot::Shared(guard) => {
            trace!(handle = guard.id(), "shared handle released");
            drop(guard);
            Ok(())
         }
      }
   }

   /// Close the pool. The shared handle is closed once its current holder
   /// releases it; later `acquire` calls fail with [`Error::PoolClosed`].
   pub async fn close(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::SeqCst) {
         return Err(Error::PoolClosed);
      }

      if let Some(shared) = &self.shared {
         let mut handle = shared.lock().await;
         if !handle.is_closed() {
            handle.close().await?;
         }
      }

      debug!(path = %self.path.display(), "connection pool closed");
      Ok(())
   }

   /// Close the pool and delete the database file with its journal files
   pub async fn remove(&self) -> Result<()> {
      match self.close().await {
         Ok(()) | Err(Error::PoolClosed) => {}
         Err(e) => return Err(e),
      }

      for suffix in ["", "-journal", "-wal", "-shm"] {
         let mut file: OsString = self.path.clone().into_os_string();
         file.push(suffix);

         match tokio::fs::remove_file(&file).await {
            Ok(()) => trace!(file = ?file, "database file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
         }
      }

      debug!(path = %self.path.display(), "database removed");
      Ok(())
   }
}

enum Slot {
   Isolated(ConnectionHandle),
   Shared(OwnedMutexGuard<ConnectionHandle>),
}

/// RAII access to a handle handed out by a [`ConnectionPool`].
///
/// For the shared handle this is the admission token: dropping it lets the
/// next waiting caller in. An isolated handle is closed by the engine when
/// dropped; [`ConnectionPool::release`] closes it explicitly.
#[must_use = "if unused, the handle is immediately released"]
pub struct PooledHandle {
   slot: Slot,
   mode: SharingMode,
}

impl PooledHandle {
   pub fn mode(&self) -> SharingMode {
      self.mode
   }
}

impl Deref for PooledHandle {
   type Target = ConnectionHandle;

   fn deref(&self) -> &Self::Target {
      match &self.slot {
         Slot::Isolated(handle) => handle,
         Slot::Shared(guard) => &**guard,
      }
   }
}

impl DerefMut for PooledHandle {
   fn deref_mut(&mut self) -> &mut Self::Target {
      match &mut self.slot {
         Slot::Isolated(handle) => handle,
         Slot::Shared(guard) => &mut **guard,
      }
   }
}

impl std::fmt::Debug for PooledHandle {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PooledHandle")
         .field("mode", &self.mode)
         .field("handle", &**self)
         .finish()
   }
}
