use std::{
    ops::Deref,
    path::{Path, PathBuf},
};

use r2d2::{ManageConnection, Pool, PooledConnection};
use tracing::info;

use crate::state::AppResult;

pub struct ConnectionManager {
    path: PathBuf,
}

impl ManageConnection for ConnectionManager {
    type Connection = rusqlite::Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = rusqlite::Connection::open(&self.path)?;
        // NOTE: Read the docs before changing something about these pragmas
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.query_row("SELECT 1", [], |_r| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct Database(Pool<ConnectionManager>);

impl Database {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Sized above the combined worker-pool count so a fully busy engine
        // never stalls on checkout.
        let pool = Pool::builder().max_size(32).build(ConnectionManager {
            path: path.to_path_buf(),
        })?;
        let mut connection = pool.get()?;
        db_init(&mut connection)?;
        Ok(Self(pool))
    }

    /// A throwaway database for tests.
    #[cfg(test)]
    pub fn open_in_dir(dir: &Path) -> Self {
        Self::open(&dir.join("metadata.db")).expect("failed to open test database")
    }
}

impl Deref for Database {
    type Target = Pool<ConnectionManager>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub type Connection<'a> = &'a mut PooledConnection<ConnectionManager>;

fn db_init(conn: Connection) -> rusqlite::Result<()> {
    {
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'task'")?;
        let mut rows = stmt.query([])?;
        let initialized = rows.next()?.is_some();
        if initialized {
            return Ok(());
        }
    };
    info!("Setting up database for the first time");

    const INIT_REQUEST: &str = include_str!("../sql/init.sql");
    conn.execute_batch(INIT_REQUEST)?;

    Ok(())
}

type Mapfn<T> = for<'a, 'b> fn(&'a rusqlite::Row<'b>) -> Result<T, rusqlite::Error>;

pub trait QueryRowIntoStmtExt<T> {
    fn query_row_into<P: rusqlite::Params>(&mut self, params: P) -> Result<T, rusqlite::Error>;
    fn query_map_into<P: rusqlite::Params>(
        &mut self,
        params: P,
    ) -> Result<rusqlite::MappedRows<'_, Mapfn<T>>, rusqlite::Error>;
}

impl<T> QueryRowIntoStmtExt<T> for rusqlite::Statement<'_>
where
    T: for<'a> TryFrom<&'a rusqlite::Row<'a>, Error = rusqlite::Error>,
{
    /// Executes the prepared statement and tries to convert the first row into the provided type
    fn query_row_into<P: rusqlite::Params>(&mut self, params: P) -> Result<T, rusqlite::Error> {
        self.query_row(params, |row| row.try_into())
    }

    /// Executes the prepared statement and tries to convert each row into the provided type
    fn query_map_into<P: rusqlite::Params>(
        &mut self,
        params: P,
    ) -> Result<rusqlite::MappedRows<'_, Mapfn<T>>, rusqlite::Error> {
        fn map_row<T>(row: &rusqlite::Row<'_>) -> Result<T, rusqlite::Error>
        where
            T: for<'a> TryFrom<&'a rusqlite::Row<'a>, Error = rusqlite::Error>,
        {
            row.try_into()
        }

        self.query_map(params, map_row)
    }
}

pub trait QueryRowGetStmtExt<T> {
    fn query_row_get<P: rusqlite::Params>(&mut self, params: P) -> Result<T, rusqlite::Error>;
    fn query_map_get<P: rusqlite::Params>(
        &mut self,
        params: P,
    ) -> Result<rusqlite::MappedRows<'_, Mapfn<T>>, rusqlite::Error>;
}

impl<T> QueryRowGetStmtExt<T> for rusqlite::Statement<'_>
where
    T: rusqlite::types::FromSql,
{
    /// Executes the prepared statement and gets the first column of the first row
    fn query_row_get<P: rusqlite::Params>(&mut self, params: P) -> Result<T, rusqlite::Error> {
        self.query_row(params, |row| row.get(0))
    }

    /// Executes the prepared statement and gets the first column of each row
    fn query_map_get<P: rusqlite::Params>(
        &mut self,
        params: P,
    ) -> Result<rusqlite::MappedRows<'_, Mapfn<T>>, rusqlite::Error> {
        fn map_row<T>(row: &rusqlite::Row<'_>) -> Result<T, rusqlite::Error>
        where
            T: rusqlite::types::FromSql,
        {
            row.get(0)
        }

        self.query_map(params, map_row)
    }
}

pub trait QueryRowGetConnExt<T> {
    fn query_row_get<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<T, rusqlite::Error>;
}

impl<T> QueryRowGetConnExt<T> for rusqlite::Connection
where
    T: rusqlite::types::FromSql,
{
    /// Executes the provided sql and gets the first column of the first row
    fn query_row_get<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<T, rusqlite::Error> {
        self.query_row(sql, params, |row| row.get(0))
    }
}
