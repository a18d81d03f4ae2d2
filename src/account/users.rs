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

//! User lookup for authentication and recipient verification.

use rusqlite::OptionalExtension as _;

use crate::db::{self, types::*};
use crate::support::error::Error;

#[derive(Clone, Debug)]
pub struct User {
    pub id: UserId,
    pub login: String,
    /// The stored CRAM-MD5 / LOGIN secret.
    pub secret: String,
    pub inbox: MailboxId,
}

impl User {
    /// The root of the user's mailbox hierarchy.
    pub fn home(&self) -> String {
        format!("/users/{}", self.login)
    }

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            login: row.get("login")?,
            secret: row.get("secret")?,
            inbox: row.get("inbox")?,
        })
    }
}

pub fn lookup_user(
    cxn: &db::Connection,
    login: &str,
) -> Result<Option<User>, Error> {
    cxn.cxn
        .query_row(
            "SELECT `id`, `login`, `secret`, `inbox` FROM `users` \
             WHERE `login` = ?",
            (login,),
            User::read,
        )
        .optional()
        .map_err(Into::into)
}

/// Resolves a `localpart@domain` envelope recipient to an inbox.
///
/// Aliases take precedence; a localpart matching a login delivers to that
/// user's inbox regardless of domain.
pub fn lookup_recipient(
    cxn: &db::Connection,
    localpart: &str,
    domain: &str,
) -> Result<Option<MailboxId>, Error> {
    let alias = cxn
        .cxn
        .query_row(
            "SELECT `mailbox` FROM `aliases` \
             WHERE `localpart` = ? AND `domain` = ?",
            (localpart, domain),
            scalar,
        )
        .optional()?;
    if alias.is_some() {
        return Ok(alias);
    }

    Ok(lookup_user(cxn, localpart)?.map(|user| user.inbox))
}
