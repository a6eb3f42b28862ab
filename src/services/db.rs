use std::cell::UnsafeCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use rusqlite::{types::FromSql, Connection, TransactionBehavior};
use thread_local::ThreadLocal;
use tokio::task;
use tracing::{debug, info, instrument, warn};

static DB_SETTINGS: &[(&str, &str)] = &[
    ("journal_mode", "delete"),
    ("synchronous", "full"),
    ("cache_size", "-8192"),
    ("busy_timeout", "100"),
    ("temp_store", "memory"),
    ("foreign_keys", "on"),
];

/// Schema migrations as `(name, version, sql)`, applied in order.
static MIGRATIONS: &[(&str, i32, &str)] = &[(
    "1-job_queue.sql",
    1,
    include_str!("../../migrations/1-job_queue.sql"),
)];

const DB_TIMEOUT: Duration = Duration::from_secs(10);
const CACHED_QUERIES: usize = 256;

/// SQLite handle with one connection per thread that touches it.
pub struct Database {
    connections: ThreadLocal<UnsafeCell<Connection>>,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        debug!("detected sqlite library version: {}", rusqlite::version());
        info!("connecting to database at {}...", path.display());

        let db = Arc::new(Self {
            connections: ThreadLocal::new(),
            path: path.to_path_buf(),
        });
        // surface a bad path or failing migration at startup rather than on first use
        db.acquire_conn()?;
        Ok(db)
    }

    fn acquire_conn(&self) -> Result<&UnsafeCell<Connection>> {
        self.connections.get_or_try(|| {
            let mut conn = Connection::open(&self.path)?;
            conn.set_prepared_statement_cache_capacity(CACHED_QUERIES);
            apply_pragmas(&conn)?;
            apply_migrations(&mut conn)?;
            Ok(UnsafeCell::new(conn))
        })
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    for (pragma, value) in DB_SETTINGS {
        conn.pragma_update(None, pragma, value)?;
    }

    Ok(())
}

fn apply_migrations(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
    let current_version: i32 =
        tx.query_row("SELECT user_version FROM pragma_user_version", [], |row| {
            row.get(0)
        })?;

    for (name, version, migration) in MIGRATIONS {
        if *version > current_version {
            info!("applying migration: {}...", name);
            tx.execute_batch(migration)?;
            tx.pragma_update(None, "user_version", version)?;
        }
    }

    tx.commit()?;
    Ok(())
}

trait QueryMode {
    type Handle<'conn>;

    fn handle(connection: &mut rusqlite::Connection) -> rusqlite::Result<Self::Handle<'_>>;
}

struct NoTx;

impl QueryMode for NoTx {
    type Handle<'conn> = &'conn rusqlite::Connection;

    fn handle(connection: &mut rusqlite::Connection) -> rusqlite::Result<Self::Handle<'_>> {
        Ok(connection)
    }
}

struct Tx;

impl QueryMode for Tx {
    type Handle<'conn> = rusqlite::Transaction<'conn>;

    fn handle(connection: &mut rusqlite::Connection) -> rusqlite::Result<Self::Handle<'_>> {
        connection.transaction_with_behavior(TransactionBehavior::Immediate)
    }
}

#[instrument(skip(db, query), err)]
fn query_inner<M, F, T>(db: &Database, mut query: F) -> Result<T>
where
    T: Send,
    M: QueryMode,
    F: FnMut(M::Handle<'_>) -> Result<T> + Send,
{
    task::block_in_place(move || {
        let start = Instant::now();
        let end = start + DB_TIMEOUT;
        // SAFETY: the connection is thread local and never handed out past this closure
        let conn = unsafe { &mut *db.acquire_conn()?.get() };

        let ret = loop {
            let handle = M::handle(conn)?;

            match query(handle) {
                Ok(item) => break Ok(item),
                Err(err) => {
                    if let Some(sq_err) = err.downcast_ref::<rusqlite::Error>() {
                        if sq_err.sqlite_error_code() == Some(rusqlite::ErrorCode::DatabaseBusy) {
                            warn!("database is busy, retrying");

                            if Instant::now() > end {
                                bail!("database busy, timed out");
                            }
                            thread::yield_now();
                            continue;
                        }
                    }

                    break Err(err);
                }
            }
        };

        debug!("transaction took {:?}", start.elapsed());
        ret
    })
}

pub fn query<F, T>(db: &Database, query: F) -> Result<T>
where
    T: Send,
    F: FnMut(&rusqlite::Connection) -> Result<T> + Send,
{
    query_inner::<NoTx, _, _>(db, query)
}

/// Like [`query`] but inside an immediate transaction; the closure commits.
pub fn query_tx<F, T>(db: &Database, query: F) -> Result<T>
where
    T: Send,
    F: FnMut(rusqlite::Transaction) -> Result<T> + Send,
{
    query_inner::<Tx, _, _>(db, query)
}

pub fn row_extract<T: FromRow>(row: &rusqlite::Row) -> rusqlite::Result<T> {
    T::from_row(row)
}

pub trait FromRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self>
    where
        Self: Sized;
}

impl<A> FromRow for (A,)
where
    A: FromSql,
{
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok((row.get(0)?,))
    }
}

impl<A, B> FromRow for (A, B)
where
    A: FromSql,
    B: FromSql,
{
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok((row.get(0)?, row.get(1)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn migrations_create_job_queue() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();

        let (version,): (i32,) = query(&db, |conn| {
            Ok(conn.query_row("SELECT user_version FROM pragma_user_version", [], row_extract)?)
        })
        .unwrap();
        assert_eq!(version, 1);

        let (count,): (i64,) = query(&db, |conn| {
            Ok(conn.query_row("SELECT count(*) FROM job_queue", [], row_extract)?)
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reopening_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = Database::open(&path).unwrap();
            query(&db, |conn| {
                conn.execute(
                    "INSERT INTO job_queue (job_type, args, state, scheduled) VALUES ('x', '{}', 'queued', 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let (count,): (i64,) = query(&db, |conn| {
            Ok(conn.query_row("SELECT count(*) FROM job_queue", [], row_extract)?)
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();

        query_tx(&db, |tx| {
            tx.execute(
                "INSERT INTO job_queue (job_type, args, state, scheduled) VALUES ('x', '{}', 'queued', 0)",
                [],
            )?;
            // no commit
            Ok(())
        })
        .unwrap();

        let (count,): (i64,) = query(&db, |conn| {
            Ok(conn.query_row("SELECT count(*) FROM job_queue", [], row_extract)?)
        })
        .unwrap();
        assert_eq!(count, 0);
    }
}
