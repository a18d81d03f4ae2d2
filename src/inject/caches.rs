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

//! Insert-if-missing dictionaries: flag names, annotation names, header
//! field names, and addresses.
//!
//! The pattern is always SELECT the requested names, INSERT whichever are
//! missing, then SELECT again; a unique violation on the INSERT means
//! another injector created the row first and the second SELECT picks it
//! up. Resolution happens inside the caller's transaction; the in-memory
//! read-through cache is only primed once that transaction commits, so a
//! rollback cannot leave phantom ids behind.

use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::OptionalExtension as _;

use crate::db::types::*;
use crate::mime::model::Address;
use crate::support::error::Error;

/// A name→id dictionary backed by a two-column table.
pub struct NameCache {
    table: &'static str,
    map: Mutex<HashMap<String, i64>>,
}

/// Ids resolved during a transaction, to be fed back to the cache on commit.
pub type Resolved = HashMap<String, i64>;

impl NameCache {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            map: Mutex::new(HashMap::new()),
        }
    }

    /// A cache-only lookup; returns `None` until a commit has primed the
    /// name.
    pub fn translate(&self, name: &str) -> Option<i64> {
        self.map.lock().unwrap().get(name).copied()
    }

    /// Resolves every name to an id, creating rows as needed.
    pub fn resolve<'a>(
        &self,
        cxn: &rusqlite::Connection,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<Resolved, Error> {
        let mut out = Resolved::new();
        let mut unknown = Vec::<&str>::new();
        {
            let map = self.map.lock().unwrap();
            for name in names {
                match map.get(name) {
                    Some(&id) => {
                        out.insert(name.to_owned(), id);
                    },
                    None if !unknown.contains(&name) => unknown.push(name),
                    None => (),
                }
            }
        }
        if unknown.is_empty() {
            return Ok(out);
        }

        let mut select = cxn.prepare_cached(&format!(
            "SELECT `id` FROM `{}` WHERE `name` = ?",
            self.table,
        ))?;
        let mut insert = cxn.prepare_cached(&format!(
            "INSERT INTO `{}` (`name`) VALUES (?)",
            self.table,
        ))?;

        for pass in 0..2 {
            let mut missing = Vec::new();
            for &name in &unknown {
                match select
                    .query_row((name,), scalar::<i64>)
                    .optional()?
                {
                    Some(id) => {
                        out.insert(name.to_owned(), id);
                    },
                    None => missing.push(name),
                }
            }

            if missing.is_empty() {
                break;
            }
            if 1 == pass {
                return Err(Error::InjectionFailed(format!(
                    "{} row for {:?} could not be created",
                    self.table, missing[0],
                )));
            }

            for &name in &missing {
                match insert.execute((name,)) {
                    Ok(_) => (),
                    // Raced by a concurrent injector; the re-SELECT gets it.
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if rusqlite::ErrorCode::ConstraintViolation
                            == e.code => {},
                    Err(e) => return Err(e.into()),
                }
            }
            unknown = missing;
        }

        Ok(out)
    }

    /// Feeds committed resolutions back into the cache.
    pub fn prime(&self, resolved: &Resolved) {
        let mut map = self.map.lock().unwrap();
        for (name, &id) in resolved {
            map.insert(name.clone(), id);
        }
    }
}

/// The address dictionary, keyed by the full stringified form.
pub struct AddressCache {
    map: Mutex<HashMap<String, i64>>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves every distinct address to its id in one batch.
    pub fn resolve(
        &self,
        cxn: &rusqlite::Connection,
        addresses: &[Address],
    ) -> Result<HashMap<String, AddressId>, Error> {
        let mut out = HashMap::new();

        let mut select = cxn.prepare_cached(
            "SELECT `id` FROM `addresses` \
             WHERE `name` = ? AND `localpart` = ? AND `domain` = ?",
        )?;
        let mut insert = cxn.prepare_cached(
            "INSERT INTO `addresses` (`name`, `localpart`, `domain`) \
             VALUES (?, ?, ?)",
        )?;

        for address in addresses {
            let key = address.to_string();
            if out.contains_key(&key) {
                continue;
            }
            if let Some(&id) = self.map.lock().unwrap().get(&key) {
                out.insert(key, AddressId(id));
                continue;
            }

            let params =
                (&address.name, &address.localpart, &address.domain);
            let mut id =
                select.query_row(params, scalar::<i64>).optional()?;
            if id.is_none() {
                match insert.execute(params) {
                    Ok(_) => id = Some(cxn.last_insert_rowid()),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if rusqlite::ErrorCode::ConstraintViolation
                            == e.code =>
                    {
                        id = select
                            .query_row(params, scalar::<i64>)
                            .optional()?;
                    },
                    Err(e) => return Err(e.into()),
                }
            }

            let id = id.ok_or_else(|| {
                Error::InjectionFailed(format!(
                    "addresses row for {:?} could not be created",
                    key,
                ))
            })?;
            out.insert(key, AddressId(id));
        }

        Ok(out)
    }

    pub fn prime(&self, resolved: &HashMap<String, AddressId>) {
        let mut map = self.map.lock().unwrap();
        for (key, id) in resolved {
            map.insert(key.clone(), id.0);
        }
    }
}

/// All of the process-wide dictionaries, carried in the server context.
pub struct Caches {
    pub flags: NameCache,
    pub annotations: NameCache,
    pub fields: NameCache,
    pub addresses: AddressCache,
}

impl Caches {
    pub fn new() -> Self {
        Self {
            flags: NameCache::new("flag_names"),
            annotations: NameCache::new("annotation_names"),
            fields: NameCache::new("field_names"),
            addresses: AddressCache::new(),
        }
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}
