//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Petramap.
//
// Petramap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Petramap is distributed in the hope that  it will be useful, but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Petramap. If not, see <http://www.gnu.org/licenses/>.

//! Access to the mail database.
//!
//! Every protocol connection checks out its own `Connection`; the injector
//! opens another one per transaction so that its writes cannot become
//! entangled with command processing on the same socket. The schema ships
//! inside the binary and is stamped into a fresh database on first open,
//! keyed off `PRAGMA user_version`.

pub mod types;

use std::path::Path;
use std::time::Duration;

use log::info;

use crate::support::error::Error;

/// The schema revision this binary writes.
const SCHEMA_VERSION: i64 = 1;

static SCHEMA: &str = include_str!("schema.sql");

/// How long a handle waits on a competing writer before reporting busy.
const BUSY_WAIT: Duration = Duration::from_secs(10);

/// A handle on the mail database.
pub struct Connection {
    pub(crate) cxn: rusqlite::Connection,
}

impl Connection {
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::configure(rusqlite::Connection::open(path)?)
    }

    /// A connection to a transient in-memory database.
    ///
    /// Only useful for tests, but not marked `cfg(test)` since integration
    /// fixtures elsewhere in the crate want it too.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::configure(rusqlite::Connection::open_in_memory()?)
    }

    fn configure(cxn: rusqlite::Connection) -> Result<Self, Error> {
        cxn.busy_timeout(BUSY_WAIT)?;
        cxn.execute_batch("PRAGMA foreign_keys = ON")?;

        let mut this = Self { cxn };
        this.ensure_schema()?;
        Ok(this)
    }

    /// Stamps the schema into a database that predates it.
    ///
    /// The version check and the stamp share one write transaction, so two
    /// processes racing to open the same fresh database cannot both apply
    /// the schema.
    fn ensure_schema(&mut self) -> Result<(), Error> {
        let txn = self.cxn.transaction_with_behavior(
            rusqlite::TransactionBehavior::Immediate,
        )?;

        let version: i64 =
            txn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            info!("New mail database, applying schema");
            txn.execute_batch(SCHEMA)?;
            txn.pragma_update(None, "user_version", &SCHEMA_VERSION)?;
        }

        txn.commit()?;
        Ok(())
    }

    /// Begins a write transaction.
    ///
    /// The write lock is taken up front, so a transaction that has read
    /// its counters can never lose a lock-promotion race against another
    /// writer; it either holds the lock or waits at BEGIN.
    pub(crate) fn begin_write(
        &mut self,
    ) -> Result<rusqlite::Transaction<'_>, Error> {
        self.cxn
            .transaction_with_behavior(
                rusqlite::TransactionBehavior::Immediate,
            )
            .map_err(Into::into)
    }
}
