//! Integration tests for both sharing modes.

use std::sync::Arc;
use std::time::Duration;

use sqlx::Row;
use sqlx_sqlite_conn_pool::{ConnectionPool, Error, HandleConfig, SharingMode, Statement};
use tempfile::TempDir;

async fn create_pool(mode: SharingMode) -> (Arc<ConnectionPool>, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let pool = ConnectionPool::new(
      temp_dir.path().join("test.db"),
      mode,
      HandleConfig::default(),
   )
   .await
   .expect("Failed to create pool");

   let mut handle = pool.acquire().await.unwrap();
   handle
      .execute(&"CREATE TABLE students (sid INTEGER)".into())
      .await
      .unwrap();
   pool.release(handle).await.unwrap();

   (Arc::new(pool), temp_dir)
}

async fn count_students(pool: &ConnectionPool) -> i64 {
   let mut handle = pool.acquire().await.unwrap();
   let rows = handle
      .fetch_all(&"SELECT COUNT(sid) AS total FROM students".into())
      .await
      .unwrap();
   pool.release(handle).await.unwrap();
   rows[0].get("total")
}

// ============================================================================
// Shared Mode
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_mode_hands_out_the_same_handle() {
   let (pool, _temp) = create_pool(SharingMode::Shared).await;

   let first = pool.acquire().await.unwrap();
   let first_id = first.id();
   pool.release(first).await.unwrap();

   let second = pool.acquire().await.unwrap();
   assert_eq!(second.id(), first_id);
   assert_eq!(second.mode(), SharingMode::Shared);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_mode_admits_one_holder_at_a_time() {
   let (pool, _temp) = create_pool(SharingMode::Shared).await;

   let holder = pool.acquire().await.unwrap();

   let waiter = {
      let pool = Arc::clone(&pool);
      tokio::spawn(async move {
         let handle = pool.acquire().await.unwrap();
         pool.release(handle).await.unwrap();
      })
   };

   // The waiter cannot get in while the handle is held
   tokio::time::sleep(Duration::from_millis(50)).await;
   assert!(!waiter.is_finished());

   pool.release(holder).await.unwrap();
   tokio::time::timeout(Duration::from_secs(5), waiter)
      .await
      .expect("waiter should be admitted after release")
      .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_mode_admits_waiters_in_request_order() {
   let (pool, _temp) = create_pool(SharingMode::Shared).await;

   let holder = pool.acquire().await.unwrap();

   // Each waiter queues up before the next one is spawned
   let mut waiters = Vec::new();
   for i in 0..6_i64 {
      let pool = Arc::clone(&pool);
      waiters.push(tokio::spawn(async move {
         let mut handle = pool.acquire().await?;
         handle
            .execute(&Statement::new("INSERT INTO students VALUES (?)").bind(i))
            .await?;
         pool.release(handle).await
      }));
      tokio::time::sleep(Duration::from_millis(20)).await;
   }

   assert!(waiters.iter().all(|waiter| !waiter.is_finished()));
   pool.release(holder).await.unwrap();

   for waiter in waiters {
      tokio::time::timeout(Duration::from_secs(5), waiter)
         .await
         .expect("every waiter should be admitted")
         .unwrap()
         .unwrap();
   }

   let mut handle = pool.acquire().await.unwrap();
   let rows = handle
      .fetch_all(&"SELECT sid FROM students ORDER BY rowid".into())
      .await
      .unwrap();
   pool.release(handle).await.unwrap();

   let order: Vec<i64> = rows.iter().map(|row| row.get("sid")).collect();
   assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_mode_concurrent_inserts_all_commit() {
   let (pool, _temp) = create_pool(SharingMode::Shared).await;
   let before = count_students(&pool).await;

   let mut tasks = Vec::new();
   for i in 0..8 {
      let pool = Arc::clone(&pool);
      tasks.push(tokio::spawn(async move {
         let mut handle = pool.acquire().await?;
         handle
            .execute(&Statement::new("INSERT INTO students VALUES (?)").bind(100 + i))
            .await?;
         pool.release(handle).await
      }));
   }

   for task in tasks {
      task.await.unwrap().expect("shared writers never see busy");
   }

   assert_eq!(count_students(&pool).await, before + 8);
}

#[tokio::test]
async fn test_abandoned_transaction_is_rolled_back_for_next_holder() {
   let (pool, _temp) = create_pool(SharingMode::Shared).await;

   let mut handle = pool.acquire().await.unwrap();
   handle.execute(&"BEGIN".into()).await.unwrap();
   handle
      .execute(&"INSERT INTO students VALUES (1)".into())
      .await
      .unwrap();
   handle.defer_rollback();
   drop(handle);

   let mut handle = pool.acquire().await.unwrap();
   assert!(!handle.rollback_pending());
   assert!(!handle.in_transaction().await.unwrap());
   pool.release(handle).await.unwrap();

   assert_eq!(count_students(&pool).await, 0);
}

// ============================================================================
// Isolated Mode
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_mode_opens_a_handle_per_caller() {
   let (pool, _temp) = create_pool(SharingMode::Isolated).await;

   let first = pool.acquire().await.unwrap();
   let second = pool.acquire().await.unwrap();
   assert_ne!(first.id(), second.id());
   assert_eq!(first.mode(), SharingMode::Isolated);

   pool.release(first).await.unwrap();
   pool.release(second).await.unwrap();
   assert_eq!(pool.admissions(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_writers_contend_on_the_file_lock() {
   let (pool, _temp) = create_pool(SharingMode::Isolated).await;

   // Hold the write lock on one isolated handle
   let mut blocker = pool.acquire().await.unwrap();
   blocker.execute(&"BEGIN IMMEDIATE".into()).await.unwrap();

   let mut tasks = Vec::new();
   for _ in 0..5 {
      let pool = Arc::clone(&pool);
      tasks.push(tokio::spawn(async move {
         let mut handle = pool.acquire().await?;
         let result = handle
            .execute(&"INSERT INTO students VALUES (100)".into())
            .await;
         pool.release(handle).await?;
         result
      }));
   }

   for task in tasks {
      let err = task.await.unwrap().unwrap_err();
      assert!(err.is_busy(), "expected busy, got {err}");
   }

   blocker.execute(&"COMMIT".into()).await.unwrap();
   pool.release(blocker).await.unwrap();
   assert_eq!(count_students(&pool).await, 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_closed_pool_rejects_acquire_and_second_close() {
   let (pool, _temp) = create_pool(SharingMode::Shared).await;

   pool.close().await.unwrap();
   assert!(pool.is_closed());

   assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
   assert!(matches!(pool.close().await, Err(Error::PoolClosed)));
}

#[tokio::test]
async fn test_remove_deletes_database_files() {
   let (pool, temp) = create_pool(SharingMode::Shared).await;
   let path = temp.path().join("test.db");
   assert!(path.exists());

   pool.remove().await.unwrap();
   assert!(!path.exists());
   assert!(!temp.path().join("test.db-journal").exists());
}
