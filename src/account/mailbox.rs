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

//! The process-wide mailbox graph.
//!
//! Mailbox rows live in the database; this module keeps the in-memory mirror
//! of each mailbox's `uidnext`/`nextmodseq` plus the live IMAP sessions
//! watching it. The mirror is only advanced after a successful injection
//! commit, at which point peers are told over the cluster channel and every
//! watching session records the new message.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use rusqlite::OptionalExtension as _;

use crate::db::{self, types::*};
use crate::support::error::Error;

/// A change visible to a live session, in the order it happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    New(Uid),
}

/// One live IMAP session (one SELECTed mailbox on one connection).
pub struct Session {
    pub id: u64,
    pub mailbox: MailboxId,
    recent: Mutex<BTreeSet<u32>>,
    changes: Mutex<Vec<Change>>,
}

impl Session {
    /// Marks `uid` \Recent in this session.
    pub fn add_recent(&self, uid: Uid) {
        self.recent.lock().unwrap().insert(uid.0);
    }

    pub fn recent_count(&self) -> usize {
        self.recent.lock().unwrap().len()
    }

    pub fn record_change(&self, change: Change) {
        self.changes.lock().unwrap().push(change);
    }

    /// Removes and returns the changes accumulated since the last poll.
    pub fn take_changes(&self) -> Vec<Change> {
        std::mem::take(&mut *self.changes.lock().unwrap())
    }
}

struct MailboxInfo {
    name: String,
    uidnext: Uid,
    nextmodseq: Modseq,
    sessions: Vec<Arc<Session>>,
}

/// What `note_injection` decided for one mailbox: the datagram to broadcast
/// (if any counter advanced).
pub struct Announcement {
    pub datagram: Option<String>,
}

#[derive(Default)]
pub struct MailboxStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    by_id: HashMap<i64, MailboxInfo>,
    next_session_id: u64,
}

impl MailboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the mailbox named `name`, loading its counters into the
    /// in-memory mirror if this is the first time it is seen.
    pub fn obtain(
        &self,
        cxn: &db::Connection,
        name: &str,
    ) -> Result<MailboxId, Error> {
        let row = cxn
            .cxn
            .query_row::<(MailboxId, Uid, Modseq), _, _>(
                "SELECT `id`, `uidnext`, `nextmodseq` FROM `mailboxes` \
                 WHERE `name` = ? AND NOT `deleted`",
                (name,),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or(Error::NxMailbox)?;

        let mut inner = self.inner.lock().unwrap();
        inner.by_id.entry(row.0 .0).or_insert_with(|| MailboxInfo {
            name: name.to_owned(),
            uidnext: row.1,
            nextmodseq: row.2,
            sessions: Vec::new(),
        });
        Ok(row.0)
    }

    pub fn name(&self, id: MailboxId) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .by_id
            .get(&id.0)
            .map(|info| info.name.clone())
    }

    /// Ensures `id` is mirrored, fetching its row by id if needed.
    pub fn obtain_by_id(
        &self,
        cxn: &db::Connection,
        id: MailboxId,
    ) -> Result<(), Error> {
        if self.inner.lock().unwrap().by_id.contains_key(&id.0) {
            return Ok(());
        }

        let row = cxn
            .cxn
            .query_row::<(String, Uid, Modseq), _, _>(
                "SELECT `name`, `uidnext`, `nextmodseq` FROM `mailboxes` \
                 WHERE `id` = ?",
                (id,),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or(Error::NxMailbox)?;

        let mut inner = self.inner.lock().unwrap();
        inner.by_id.entry(id.0).or_insert_with(|| MailboxInfo {
            name: row.0,
            uidnext: row.1,
            nextmodseq: row.2,
            sessions: Vec::new(),
        });
        Ok(())
    }

    /// Opens a live session on a mailbox already known to the store.
    pub fn open_session(&self, mailbox: MailboxId) -> Arc<Session> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_session_id += 1;
        let session = Arc::new(Session {
            id: inner.next_session_id,
            mailbox,
            recent: Mutex::new(BTreeSet::new()),
            changes: Mutex::new(Vec::new()),
        });

        if let Some(info) = inner.by_id.get_mut(&mailbox.0) {
            info.sessions.push(Arc::clone(&session));
        }
        session
    }

    pub fn close_session(&self, session: &Session) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.by_id.get_mut(&session.mailbox.0) {
            info.sessions.retain(|s| s.id != session.id);
        }
    }

    /// The session that would receive \Recent for the next message, i.e. the
    /// first live session of the mailbox.
    pub fn first_session_id(&self, mailbox: MailboxId) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .by_id
            .get(&mailbox.0)
            .and_then(|info| info.sessions.first())
            .map(|session| session.id)
    }

    /// Records a committed injection.
    ///
    /// If the in-memory `uidnext`/`nextmodseq` are at or below the allocated
    /// values they are bumped past them, and a datagram describing the
    /// advance is returned for the cluster channel. The message is marked
    /// \Recent in `recent_in` (if that session is still live), and every
    /// session of the mailbox records a `New` change.
    pub fn note_injection(
        &self,
        mailbox: MailboxId,
        uid: Uid,
        modseq: Modseq,
        recent_in: Option<u64>,
    ) -> Announcement {
        let mut inner = self.inner.lock().unwrap();
        let Some(info) = inner.by_id.get_mut(&mailbox.0) else {
            return Announcement { datagram: None };
        };

        let bump_uid = info.uidnext <= uid;
        let bump_ms = info.nextmodseq <= modseq;
        let datagram = if bump_uid && bump_ms {
            info.uidnext = Uid(uid.0 + 1);
            info.nextmodseq = Modseq(modseq.0 + 1);
            Some(format!(
                "mailbox \"{}\" uidnext={} nextmodseq={}",
                info.name, info.uidnext.0, info.nextmodseq.0,
            ))
        } else if bump_uid {
            info.uidnext = Uid(uid.0 + 1);
            Some(format!(
                "mailbox \"{}\" uidnext={}",
                info.name, info.uidnext.0,
            ))
        } else if bump_ms {
            info.nextmodseq = Modseq(modseq.0 + 1);
            Some(format!(
                "mailbox \"{}\" nextmodseq={}",
                info.name, info.nextmodseq.0,
            ))
        } else {
            None
        };

        for session in &info.sessions {
            if Some(session.id) == recent_in {
                session.add_recent(uid);
            }
            session.record_change(Change::New(uid));
        }

        Announcement { datagram }
    }

    /// All non-deleted mailbox names, for LIST.
    pub fn all_names(
        &self,
        cxn: &db::Connection,
    ) -> Result<Vec<String>, Error> {
        cxn.cxn
            .prepare(
                "SELECT `name` FROM `mailboxes` WHERE NOT `deleted` \
                 ORDER BY `name`",
            )?
            .query_map((), scalar)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> (db::Connection, MailboxStore, MailboxId) {
        let cxn = db::Connection::open_in_memory().unwrap();
        cxn.cxn
            .execute("INSERT INTO `mailboxes` (`name`) VALUES ('/x')", ())
            .unwrap();
        let store = MailboxStore::new();
        let id = store.obtain(&cxn, "/x").unwrap();
        (cxn, store, id)
    }

    #[test]
    fn injection_bumps_and_announces() {
        let (_cxn, store, id) = fixture();

        let announcement =
            store.note_injection(id, Uid(1), Modseq(1), None);
        assert_eq!(
            Some("mailbox \"/x\" uidnext=2 nextmodseq=2".to_owned()),
            announcement.datagram,
        );

        // A stale repeat of the same values changes nothing.
        let announcement =
            store.note_injection(id, Uid(1), Modseq(1), None);
        assert_eq!(None, announcement.datagram);

        // Only modseq advancing produces the partial form.
        let announcement =
            store.note_injection(id, Uid(1), Modseq(5), None);
        assert_eq!(
            Some("mailbox \"/x\" nextmodseq=6".to_owned()),
            announcement.datagram,
        );
    }

    #[test]
    fn sessions_see_changes_and_recent() {
        let (_cxn, store, id) = fixture();

        let first = store.open_session(id);
        let second = store.open_session(id);
        assert_eq!(Some(first.id), store.first_session_id(id));

        store.note_injection(id, Uid(1), Modseq(1), Some(first.id));

        assert_eq!(1, first.recent_count());
        assert_eq!(0, second.recent_count());
        assert_eq!(vec![Change::New(Uid(1))], first.take_changes());
        assert_eq!(vec![Change::New(Uid(1))], second.take_changes());
        assert!(first.take_changes().is_empty());

        store.close_session(&first);
        assert_eq!(Some(second.id), store.first_session_id(id));
    }
}
