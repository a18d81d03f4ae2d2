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

//! The identifier and counter types that travel between SQL and the rest
//! of the crate.
//!
//! Every table key gets its own newtype so that a mailbox id cannot be
//! bound where a bodypart id belongs; the row ids all wrap the `i64` that
//! SQLite hands out. UIDs and MODSEQs are not row ids (they are allocated
//! by the injector, not the database) and carry their own widths.

use chrono::prelude::*;
use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef,
};

/// Declares a newtype over an `INTEGER PRIMARY KEY` column, together with
/// its SQL conversions.
macro_rules! row_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
        )]
        pub struct $name(pub i64);

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                i64::column_result(value).map($name)
            }
        }
    };
}

row_id!(MailboxId);
row_id!(UserId);
row_id!(BodypartId);
row_id!(AddressId);
row_id! {
    /// A per-mailbox modification sequence number (RFC 7162).
    Modseq
}

/// A per-mailbox message identifier (RFC 3501 §2.3.1.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub u32);

impl ToSql for Uid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0 as i64))
    }
}

impl FromSql for Uid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        u32::column_result(value).map(Uid)
    }
}

/// A second-resolution timestamp, stored as a plain INTEGER.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTimestamp(pub DateTime<Utc>);

impl UnixTimestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl ToSql for UnixTimestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.timestamp()))
    }
}

impl FromSql for UnixTimestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let seconds = i64::column_result(value)?;
        match DateTime::from_timestamp(seconds, 0) {
            Some(when) => Ok(Self(when)),
            None => Err(FromSqlError::OutOfRange(seconds)),
        }
    }
}

/// Row mapper for single-column queries; shaped to slot straight into
/// `query_row` and `query_map`. Rows with more columns are mapped with a
/// plain closure at the call site.
pub fn scalar<T: FromSql>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    row.get(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ids_round_trip_through_sql() {
        let cxn = rusqlite::Connection::open_in_memory().unwrap();

        let uid: Uid =
            cxn.query_row("SELECT ?", (Uid(7),), scalar).unwrap();
        assert_eq!(Uid(7), uid);

        let mailbox: MailboxId = cxn
            .query_row("SELECT ?", (MailboxId(-3),), scalar)
            .unwrap();
        assert_eq!(MailboxId(-3), mailbox);

        let now = UnixTimestamp::now();
        let back: UnixTimestamp =
            cxn.query_row("SELECT ?", (now,), scalar).unwrap();
        assert_eq!(now.0.timestamp(), back.0.timestamp());
    }
}
