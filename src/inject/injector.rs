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

//! The injector: writes one parsed message into N mailboxes in a single
//! database transaction.
//!
//! The pipeline is a linear phase machine. Body parts are stored first
//! (content-addressed, so concurrent injectors sharing bytes converge on one
//! row), then a UID and MODSEQ are allocated per target mailbox, then the
//! message, part-number, header, flag, annotation, and address rows are
//! written, and finally the transaction commits. Mailboxes are locked in
//! sorted order so that injectors can never deadlock against each other;
//! the in-memory mailbox mirror and live sessions learn about the message
//! only after COMMIT succeeds, via `announce`.

use std::collections::{HashMap, HashSet};

use chrono::prelude::*;
use log::{debug, info};
use openssl::hash::{hash, MessageDigest};
use rusqlite::OptionalExtension as _;

use super::caches::{Caches, Resolved};
use crate::account::mailbox::MailboxStore;
use crate::db::{self, types::*};
use crate::mime::model::*;
use crate::mime::parse::parse_address_list;
use crate::net::cluster::ClusterClient;
use crate::support::error::Error;
use crate::support::hex::to_hex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Inactive,
    InsertingBodyparts,
    SelectingUids,
    InsertingMessages,
    LinkingFields,
    LinkingFlags,
    LinkingAnnotations,
    LinkingAddresses,
    AwaitingCompletion,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub name: String,
    pub value: String,
    /// `None` for shared annotations.
    pub owner: Option<UserId>,
}

/// Everything the injector needs to do its work.
pub struct Injection {
    pub message: Message,
    /// Target mailboxes. Sorted and deduplicated on construction.
    pub mailboxes: Vec<MailboxId>,
    pub flags: Vec<String>,
    pub annotations: Vec<Annotation>,
    /// Recipients to be reached over SMTP later; the message is additionally
    /// spooled for them.
    pub remote_recipients: Vec<Address>,
    pub sender: Option<Address>,
    /// Whether this message wraps an unparsable original (stored as part 2).
    pub wrapped: bool,
}

impl Injection {
    pub fn new(message: Message, mailboxes: Vec<MailboxId>) -> Self {
        Self {
            message,
            mailboxes,
            flags: Vec::new(),
            annotations: Vec::new(),
            remote_recipients: Vec::new(),
            sender: None,
            wrapped: false,
        }
    }
}

/// The per-mailbox allocation this injection obtained.
#[derive(Clone, Debug)]
struct UidAlloc {
    mailbox: MailboxId,
    uid: Uid,
    modseq: Modseq,
    /// The session in which the message is \Recent, if any.
    recent_in: Option<u64>,
}

struct FieldLink {
    part: String,
    position: u32,
    field_type: FieldType,
    name: String,
    value: String,
}

struct AddressLink {
    part: String,
    position: u32,
    field_type: FieldType,
    address: Address,
    number: u32,
}

/// Resolutions accumulated during the transaction, fed to the caches only
/// once COMMIT has succeeded.
#[derive(Default)]
struct Primes {
    fields: Resolved,
    flags: Resolved,
    annotations: Resolved,
    addresses: HashMap<String, AddressId>,
}

pub struct Injector {
    injection: Injection,
    state: State,
    error: Option<String>,
    uids: Vec<UidAlloc>,
    address_links: Vec<AddressLink>,
}

impl Injector {
    pub fn new(mut injection: Injection) -> Self {
        injection.mailboxes.sort();
        injection.mailboxes.dedup();

        // Flags are deduplicated case-insensitively, keeping the first
        // spelling offered.
        let mut seen = HashSet::<String>::new();
        injection
            .flags
            .retain(|flag| seen.insert(flag.to_ascii_lowercase()));

        // Annotations are deduplicated by (owner, name); the last value
        // offered wins.
        let mut deduped = Vec::<Annotation>::new();
        for annotation in injection.annotations.drain(..) {
            match deduped.iter_mut().find(|a| {
                a.owner == annotation.owner && a.name == annotation.name
            }) {
                Some(existing) => existing.value = annotation.value,
                None => deduped.push(annotation),
            }
        }
        injection.annotations = deduped;

        Self {
            injection,
            state: State::Inactive,
            error: None,
            uids: Vec::new(),
            address_links: Vec::new(),
        }
    }

    pub fn done(&self) -> bool {
        State::Done == self.state
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> String {
        self.error.clone().unwrap_or_default()
    }

    /// The UID allocated in `mailbox`, once injection has progressed far
    /// enough to know it.
    pub fn uid(&self, mailbox: MailboxId) -> Option<Uid> {
        self.uids
            .iter()
            .find(|alloc| mailbox == alloc.mailbox)
            .map(|alloc| alloc.uid)
    }

    /// Runs the whole pipeline. On return, `done()` is true and `failed()`
    /// tells whether the transaction committed.
    pub fn execute(
        &mut self,
        cxn: &mut db::Connection,
        store: &MailboxStore,
        caches: &Caches,
        spool_mailbox: &str,
    ) {
        if State::Inactive != self.state {
            return;
        }

        self.log_message_details(store);

        match self.run_transaction(cxn, store, caches, spool_mailbox) {
            Ok(primes) => {
                caches.fields.prime(&primes.fields);
                caches.flags.prime(&primes.flags);
                caches.annotations.prime(&primes.annotations);
                caches.addresses.prime(&primes.addresses);
                info!("Injection succeeded");
            },
            Err(e) => {
                info!("Injection failed in {:?}: {}", self.state, e);
                self.error = Some(e.to_string());
            },
        }

        self.state = State::Done;
    }

    /// Announces the injection to the in-memory mailbox graph, live
    /// sessions, and cluster peers.
    ///
    /// Must only be called after `execute` when `failed()` is false.
    pub fn announce(&self, store: &MailboxStore, cluster: &ClusterClient) {
        for alloc in &self.uids {
            let announcement = store.note_injection(
                alloc.mailbox,
                alloc.uid,
                alloc.modseq,
                alloc.recent_in,
            );
            if let Some(datagram) = announcement.datagram {
                cluster.send(&datagram);
            }
        }
    }

    fn log_message_details(&self, store: &MailboxStore) {
        let id = self
            .injection
            .message
            .header
            .message_id()
            .unwrap_or("(no message-id)");
        for &mailbox in &self.injection.mailboxes {
            info!(
                "Injecting message {} into mailbox {}",
                id,
                store
                    .name(mailbox)
                    .unwrap_or_else(|| format!("#{}", mailbox.0)),
            );
        }
    }

    fn run_transaction(
        &mut self,
        cxn: &mut db::Connection,
        store: &MailboxStore,
        caches: &Caches,
        spool_mailbox: &str,
    ) -> Result<Primes, Error> {
        let mut primes = Primes::default();
        let txn = cxn.begin_write()?;

        self.state = State::InsertingBodyparts;
        let bids = self.insert_bodyparts(&txn)?;

        self.state = State::SelectingUids;
        self.select_uids(&txn, store)?;

        self.state = State::InsertingMessages;
        self.insert_messages(&txn)?;

        self.state = State::LinkingFields;
        self.link_part_numbers(&txn, &bids)?;
        primes.fields = self.link_header_fields(&txn, caches)?;
        self.link_dates(&txn)?;

        self.state = State::LinkingFlags;
        primes.flags = self.link_flags(&txn, caches)?;

        self.state = State::LinkingAnnotations;
        primes.annotations = self.link_annotations(&txn, caches)?;
        self.handle_wrapping(&txn, &bids)?;

        self.state = State::LinkingAddresses;
        primes.addresses =
            self.link_addresses(&txn, caches, store, spool_mailbox)?;

        self.state = State::AwaitingCompletion;
        txn.commit()?;
        Ok(primes)
    }

    /// Stores each storable body part, learning its content-addressed id.
    ///
    /// The insert runs under a savepoint; any failure is taken to mean the
    /// row already exists, and the follow-up select by hash learns the id
    /// either way. A select that comes back empty is a hard failure.
    fn insert_bodyparts(
        &self,
        txn: &rusqlite::Transaction<'_>,
    ) -> Result<Vec<Option<BodypartId>>, Error> {
        let mut bids = Vec::with_capacity(self.injection.message.bodyparts.len());
        let mut savepoint = 0u32;

        for bp in &self.injection.message.bodyparts {
            let (store_text, store_data) = storage_decision(bp);
            if !store_text && !store_data {
                bids.push(None);
                continue;
            }

            let text = if store_text {
                Some(bp.text.clone().unwrap_or_else(|| {
                    String::from_utf8_lossy(&bp.data).into_owned()
                }))
            } else {
                None
            };
            let canonical: &[u8] = match text {
                Some(ref text) => text.as_bytes(),
                None => &bp.data,
            };
            let content_hash =
                to_hex(hash(MessageDigest::md5(), canonical)?.as_ref());

            txn.execute_batch(&format!("SAVEPOINT a{}", savepoint))?;
            let data: Option<&[u8]> = if store_data {
                Some(&bp.data)
            } else {
                None
            };
            let inserted = txn.execute(
                "INSERT INTO `bodyparts` (`hash`, `bytes`, `text`, `data`) \
                 VALUES (?, ?, ?, ?)",
                (&content_hash, bp.bytes as i64, &text, data),
            );
            if inserted.is_err() {
                txn.execute_batch(&format!("ROLLBACK TO a{}", savepoint))?;
            }

            let id = txn
                .query_row(
                    "SELECT `id` FROM `bodyparts` WHERE `hash` = ?",
                    (&content_hash,),
                    scalar::<i64>,
                )
                .optional()?
                .ok_or(Error::MissingBodypart)?;
            bids.push(Some(BodypartId(id)));
            savepoint += 1;
        }

        Ok(bids)
    }

    /// Reads and advances the allocation counters of every target mailbox.
    ///
    /// The mailbox list is sorted, so every injector acquires its row
    /// updates in the same order and UID announcements match commit order.
    /// When the allocated UID equals `first_recent`, the message will be
    /// \Recent in the mailbox's first live session and `first_recent`
    /// advances along with the other counters.
    fn select_uids(
        &mut self,
        txn: &rusqlite::Transaction<'_>,
        store: &MailboxStore,
    ) -> Result<(), Error> {
        for &mailbox in &self.injection.mailboxes {
            let (uidnext, nextmodseq, first_recent): (Uid, Modseq, Uid) =
                txn.query_row(
                    "SELECT `uidnext`, `nextmodseq`, `first_recent` \
                     FROM `mailboxes` WHERE `id` = ?",
                    (mailbox,),
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;

            let mut recent_in = None;
            if uidnext == first_recent {
                recent_in = store.first_session_id(mailbox);
            }

            if recent_in.is_some() {
                txn.execute(
                    "UPDATE `mailboxes` SET \
                       `uidnext` = `uidnext` + 1, \
                       `nextmodseq` = `nextmodseq` + 1, \
                       `first_recent` = `first_recent` + 1 \
                     WHERE `id` = ?",
                    (mailbox,),
                )?;
            } else {
                txn.execute(
                    "UPDATE `mailboxes` SET \
                       `uidnext` = `uidnext` + 1, \
                       `nextmodseq` = `nextmodseq` + 1 \
                     WHERE `id` = ?",
                    (mailbox,),
                )?;
            }

            self.uids.push(UidAlloc {
                mailbox,
                uid: uidnext,
                modseq: nextmodseq,
                recent_in,
            });
        }

        Ok(())
    }

    fn insert_messages(
        &self,
        txn: &rusqlite::Transaction<'_>,
    ) -> Result<(), Error> {
        let idate = UnixTimestamp(internal_date(&self.injection.message));
        let size = self.injection.message.rfc822.len() as i64;

        let mut qm = txn.prepare_cached(
            "INSERT INTO `messages` (`mailbox`, `uid`, `idate`, `rfc822size`) \
             VALUES (?, ?, ?, ?)",
        )?;
        let mut qms = txn.prepare_cached(
            "INSERT INTO `modsequences` (`mailbox`, `uid`, `modseq`) \
             VALUES (?, ?, ?)",
        )?;

        for alloc in &self.uids {
            qm.execute((alloc.mailbox, alloc.uid, idate, size))?;
            qms.execute((alloc.mailbox, alloc.uid, alloc.modseq))?;
        }

        Ok(())
    }

    fn link_part_numbers(
        &self,
        txn: &rusqlite::Transaction<'_>,
        bids: &[Option<BodypartId>],
    ) -> Result<(), Error> {
        let mut q = txn.prepare_cached(
            "INSERT INTO `part_numbers` \
             (`mailbox`, `uid`, `part`, `bodypart`, `bytes`, `lines`) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )?;

        for alloc in &self.uids {
            q.execute((
                alloc.mailbox,
                alloc.uid,
                "",
                None::<BodypartId>,
                None::<i64>,
                None::<i64>,
            ))?;

            for (ix, bp) in
                self.injection.message.bodyparts.iter().enumerate()
            {
                q.execute((
                    alloc.mailbox,
                    alloc.uid,
                    &bp.part_number,
                    bids[ix],
                    bp.encoded_bytes as i64,
                    bp.encoded_lines as i64,
                ))?;

                if bp.message.is_some() {
                    q.execute((
                        alloc.mailbox,
                        alloc.uid,
                        format!("{}.rfc822", bp.part_number),
                        bids[ix],
                        bp.encoded_bytes as i64,
                        bp.encoded_lines as i64,
                    ))?;
                }
            }
        }

        Ok(())
    }

    /// Builds the header-field and address links for every header in the
    /// message, then writes the `header_fields` rows.
    ///
    /// The MIME header of the sole part of a singlepart message is
    /// physically collocated with the message header above it, so those
    /// fields are not linked again. Address-bearing fields are deferred to
    /// `link_addresses`.
    fn link_header_fields(
        &mut self,
        txn: &rusqlite::Transaction<'_>,
        caches: &Caches,
    ) -> Result<Resolved, Error> {
        let mut links = Vec::<FieldLink>::new();
        let mut address_links = Vec::<AddressLink>::new();
        let mut other_names = Vec::<String>::new();

        let mut build = |header: &Header, part: &str| {
            for field in &header.fields {
                if field.field_type.is_address_field() {
                    for (number, address) in
                        parse_address_list(&field.value).into_iter().enumerate()
                    {
                        address_links.push(AddressLink {
                            part: part.to_owned(),
                            position: field.position,
                            field_type: field.field_type,
                            address,
                            number: number as u32,
                        });
                    }
                    continue;
                }

                if FieldType::Other == field.field_type
                    && !other_names.contains(&field.name)
                {
                    other_names.push(field.name.clone());
                }
                links.push(FieldLink {
                    part: part.to_owned(),
                    position: field.position,
                    field_type: field.field_type,
                    name: field.name.clone(),
                    value: field.value.clone(),
                });
            }
        };

        let message = &self.injection.message;
        build(&message.header, "");

        let skip = aliased_parts(message);
        for bp in &message.bodyparts {
            if !skip.contains(&bp.part_number) {
                build(&bp.header, &bp.part_number);
            }
            if let Some(ref nested) = bp.message {
                build(
                    &nested.header,
                    &format!("{}.rfc822", bp.part_number),
                );
            }
        }

        let resolved = caches
            .fields
            .resolve(txn, other_names.iter().map(String::as_str))?;

        let mut q = txn.prepare_cached(
            "INSERT INTO `header_fields` \
             (`mailbox`, `uid`, `part`, `position`, `field`, `value`) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )?;
        for alloc in &self.uids {
            for link in &links {
                let field = match resolved.get(&link.name) {
                    Some(&id) => id,
                    None => link.field_type as u32 as i64,
                };
                q.execute((
                    alloc.mailbox,
                    alloc.uid,
                    &link.part,
                    link.position,
                    field,
                    &link.value,
                ))?;
            }
        }

        self.address_links = address_links;
        Ok(resolved)
    }

    fn link_dates(
        &self,
        txn: &rusqlite::Transaction<'_>,
    ) -> Result<(), Error> {
        let Some(date) = self.injection.message.header.date() else {
            return Ok(());
        };

        let mut q = txn.prepare_cached(
            "INSERT INTO `date_fields` (`mailbox`, `uid`, `value`) \
             VALUES (?, ?, ?)",
        )?;
        for alloc in &self.uids {
            q.execute((alloc.mailbox, alloc.uid, date.to_rfc3339()))?;
        }

        Ok(())
    }

    fn link_flags(
        &self,
        txn: &rusqlite::Transaction<'_>,
        caches: &Caches,
    ) -> Result<Resolved, Error> {
        let resolved = caches.flags.resolve(
            txn,
            self.injection.flags.iter().map(String::as_str),
        )?;

        let mut q = txn.prepare_cached(
            "INSERT INTO `flags` (`flag`, `uid`, `mailbox`) \
             VALUES (?, ?, ?)",
        )?;
        for flag in &self.injection.flags {
            for alloc in &self.uids {
                q.execute((resolved[flag], alloc.uid, alloc.mailbox))?;
            }
        }

        Ok(resolved)
    }

    fn link_annotations(
        &self,
        txn: &rusqlite::Transaction<'_>,
        caches: &Caches,
    ) -> Result<Resolved, Error> {
        let resolved = caches.annotations.resolve(
            txn,
            self.injection
                .annotations
                .iter()
                .map(|a| a.name.as_str()),
        )?;

        let mut q = txn.prepare_cached(
            "INSERT INTO `annotations` \
             (`mailbox`, `uid`, `name`, `value`, `owner`) \
             VALUES (?, ?, ?, ?, ?)",
        )?;
        for annotation in &self.injection.annotations {
            for alloc in &self.uids {
                q.execute((
                    alloc.mailbox,
                    alloc.uid,
                    resolved[&annotation.name],
                    &annotation.value,
                    annotation.owner,
                ))?;
            }
        }

        Ok(resolved)
    }

    /// For a wrapper around an unparsable message, records that part 2 is
    /// the original raw message.
    fn handle_wrapping(
        &self,
        txn: &rusqlite::Transaction<'_>,
        bids: &[Option<BodypartId>],
    ) -> Result<(), Error> {
        if !self.injection.wrapped {
            return Ok(());
        }

        for (ix, bp) in self.injection.message.bodyparts.iter().enumerate()
        {
            if "2" == bp.part_number {
                if let Some(bid) = bids[ix] {
                    txn.execute(
                        "INSERT INTO `unparsed_messages` (`bodypart`) \
                         VALUES (?)",
                        (bid,),
                    )?;
                }
                break;
            }
        }

        Ok(())
    }

    /// Resolves every address in the message (plus envelope addresses) to a
    /// dictionary id, writes the `address_fields` rows, and spools the
    /// message for any remote recipients.
    fn link_addresses(
        &mut self,
        txn: &rusqlite::Transaction<'_>,
        caches: &Caches,
        store: &MailboxStore,
        spool_mailbox: &str,
    ) -> Result<HashMap<String, AddressId>, Error> {
        // Dedup by stringified form; track the bare localpart@domain forms
        // so envelope recipients can reuse a header address's row.
        let mut unique = Vec::<Address>::new();
        let mut seen = HashSet::<String>::new();
        let mut naked = HashMap::<String, Address>::new();

        for link in &self.address_links {
            if seen.insert(link.address.to_string()) {
                naked
                    .entry(link.address.lp_domain())
                    .or_insert_with(|| link.address.clone());
                unique.push(link.address.clone());
            }
        }

        let mut remote_keys = Vec::<String>::new();
        for recipient in &self.injection.remote_recipients {
            match naked.get(&recipient.lp_domain()) {
                Some(existing) => remote_keys.push(existing.to_string()),
                None => {
                    naked.insert(
                        recipient.lp_domain(),
                        recipient.clone(),
                    );
                    if seen.insert(recipient.to_string()) {
                        unique.push(recipient.clone());
                    }
                    remote_keys.push(recipient.to_string());
                },
            }
        }

        if let Some(ref sender) = self.injection.sender {
            if seen.insert(sender.to_string()) {
                unique.push(sender.clone());
            }
        }

        let resolved = caches.addresses.resolve(txn, &unique)?;

        let mut q = txn.prepare_cached(
            "INSERT INTO `address_fields` \
             (`mailbox`, `uid`, `part`, `position`, `field`, `address`, \
              `number`) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )?;
        for alloc in &self.uids {
            for link in &self.address_links {
                q.execute((
                    alloc.mailbox,
                    alloc.uid,
                    &link.part,
                    link.position,
                    link.field_type as u32,
                    resolved[&link.address.to_string()],
                    link.number,
                ))?;
            }
        }

        self.insert_deliveries(
            txn,
            store,
            spool_mailbox,
            &resolved,
            &remote_keys,
        )?;
        Ok(resolved)
    }

    /// Inserts one `deliveries` row (in the spool mailbox) and one
    /// `delivery_recipients` row per remote recipient.
    fn insert_deliveries(
        &self,
        txn: &rusqlite::Transaction<'_>,
        store: &MailboxStore,
        spool_mailbox: &str,
        resolved: &HashMap<String, AddressId>,
        remote_keys: &[String],
    ) -> Result<(), Error> {
        if remote_keys.is_empty() {
            return Ok(());
        }

        let spool = self
            .uids
            .iter()
            .find(|alloc| {
                store.name(alloc.mailbox).as_deref() == Some(spool_mailbox)
            })
            .ok_or(Error::NoSpoolMailbox)?;
        let sender = self.injection.sender.as_ref().ok_or_else(|| {
            Error::InjectionFailed(
                "remote recipients without a sender".to_owned(),
            )
        })?;

        let now = Utc::now();
        txn.execute(
            "INSERT INTO `deliveries` \
             (`sender`, `mailbox`, `uid`, `injected_at`, `expires_at`) \
             VALUES (?, ?, ?, ?, ?)",
            (
                resolved[&sender.to_string()],
                spool.mailbox,
                spool.uid,
                UnixTimestamp(now),
                UnixTimestamp(now + chrono::Duration::days(2)),
            ),
        )?;
        let delivery = txn.last_insert_rowid();

        let mut q = txn.prepare_cached(
            "INSERT INTO `delivery_recipients` (`delivery`, `recipient`) \
             VALUES (?, ?)",
        )?;
        for key in remote_keys {
            q.execute((delivery, resolved[key]))?;
        }

        debug!(
            "Spooled delivery {} for {} remote recipient(s)",
            delivery,
            remote_keys.len(),
        );
        Ok(())
    }
}

/// Which columns to fill for a body part's `bodyparts` row, if any:
/// `(store decoded text, store raw data)`.
fn storage_decision(bp: &Bodypart) -> (bool, bool) {
    match bp.content_type {
        None => (true, false),
        Some(ref ct) if "text" == ct.ctype => (true, "html" == ct.subtype),
        Some(ref ct) if "multipart" == ct.ctype => {
            (false, "signed" == ct.subtype)
        },
        Some(ref ct) if ct.is("message", "rfc822") => (false, false),
        Some(_) => (false, true),
    }
}

/// The part numbers whose MIME headers are physically collocated with a
/// message header above them: the sole part of a singlepart message, at
/// every nesting level.
fn aliased_parts(message: &Message) -> HashSet<String> {
    let mut skip = HashSet::new();

    let multipart = |header: &Header| {
        header
            .content_type()
            .map_or(false, |ct| "multipart" == ct.ctype)
    };

    if !multipart(&message.header) {
        skip.insert("1".to_owned());
    }
    for bp in &message.bodyparts {
        if let Some(ref nested) = bp.message {
            if !multipart(&nested.header) {
                skip.insert(format!("{}.1", bp.part_number));
            }
        }
    }

    skip
}

/// A sensible internaldate: the explicit one if set, else the `;`-tail of
/// the most recent `Received:` header, else `Date:`, else now.
fn internal_date(message: &Message) -> DateTime<Utc> {
    if let Some(date) = message.internal_date {
        return date;
    }

    for field in &message.header.fields {
        if FieldType::Received == field.field_type {
            if let Some(ix) = field.value.rfind(';') {
                if let Ok(date) = DateTime::parse_from_rfc2822(
                    field.value[ix + 1..].trim(),
                ) {
                    return date.with_timezone(&Utc);
                }
            }
        }
    }

    if let Some(date) = message.header.date() {
        return date.with_timezone(&Utc);
    }

    Utc::now()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mime::parse::{parse_message, wrap_unparsable};
    use crate::net::cluster::ClusterClient;

    struct Fixture {
        cxn: db::Connection,
        store: MailboxStore,
        caches: Caches,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                cxn: db::Connection::open_in_memory().unwrap(),
                store: MailboxStore::new(),
                caches: Caches::new(),
            }
        }

        fn create_mailbox(&self, name: &str) -> MailboxId {
            self.cxn
                .cxn
                .execute(
                    "INSERT INTO `mailboxes` (`name`) VALUES (?)",
                    (name,),
                )
                .unwrap();
            self.store.obtain(&self.cxn, name).unwrap()
        }

        fn inject(&mut self, injection: Injection) -> Injector {
            let mut injector = Injector::new(injection);
            injector.execute(
                &mut self.cxn,
                &self.store,
                &self.caches,
                "/petramap/spool",
            );
            assert!(injector.done());
            injector
        }

        fn count(&self, sql: &str) -> i64 {
            self.cxn.cxn.query_row(sql, (), scalar).unwrap()
        }
    }

    const SIMPLE: &[u8] = b"Subject: t\r\n\
        Date: Mon, 7 Feb 1994 21:52:25 -0800\r\n\
        From: Kiki <kiki@example.com>\r\n\
        To: mja@example.net, Other <o@example.org>\r\n\
        \r\n\
        hi\r\n";

    #[test]
    fn basic_injection() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");

        let message = parse_message(SIMPLE).unwrap();
        let injector =
            fixture.inject(Injection::new(message, vec![inbox]));

        assert!(!injector.failed(), "{}", injector.error());
        assert_eq!(Some(Uid(1)), injector.uid(inbox));

        // Counters advanced
        let (uidnext, nextmodseq) = fixture
            .cxn
            .cxn
            .query_row(
                "SELECT `uidnext`, `nextmodseq` FROM `mailboxes` \
                 WHERE `id` = ?",
                (inbox,),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(Uid(2), uidnext);
        assert_eq!(Modseq(2), nextmodseq);

        // One message row, one modseq row
        assert_eq!(1, fixture.count("SELECT COUNT(*) FROM `messages`"));
        let modseq = fixture.count("SELECT `modseq` FROM `modsequences`");
        assert_eq!(1, modseq);

        // Root and part 1 in part_numbers; part 1 has the bodypart
        assert_eq!(
            2,
            fixture.count("SELECT COUNT(*) FROM `part_numbers`"),
        );
        let text: String = fixture
            .cxn
            .cxn
            .query_row(
                "SELECT `text` FROM `bodyparts` \
                 JOIN `part_numbers` ON `bodypart` = `bodyparts`.`id` \
                 WHERE `part` = '1'",
                (),
                scalar,
            )
            .unwrap();
        assert_eq!("hi\r\n", text);

        // Subject at its ordinal; From/To decomposed into address_fields,
        // not header_fields
        assert_eq!(
            1,
            fixture.count(
                "SELECT COUNT(*) FROM `header_fields` WHERE `field` = 19",
            ),
        );
        assert_eq!(
            0,
            fixture.count(
                "SELECT COUNT(*) FROM `header_fields` WHERE `field` = 1",
            ),
        );
        // From (1 address, number 0) + To (2 addresses, numbers 0 and 1)
        assert_eq!(
            3,
            fixture.count("SELECT COUNT(*) FROM `address_fields`"),
        );
        assert_eq!(
            1,
            fixture.count(
                "SELECT COUNT(*) FROM `address_fields` \
                 WHERE `field` = 7 AND `number` = 1",
            ),
        );

        // The Date: field landed in date_fields
        assert_eq!(1, fixture.count("SELECT COUNT(*) FROM `date_fields`"));

        // idate derived from Date: (no Received:)
        let idate = fixture.count("SELECT `idate` FROM `messages`");
        assert_eq!(
            DateTime::parse_from_rfc2822("Mon, 7 Feb 1994 21:52:25 -0800")
                .unwrap()
                .timestamp(),
            idate,
        );
    }

    #[test]
    fn bodyparts_are_content_addressed() {
        let mut fixture = Fixture::new();
        let one = fixture.create_mailbox("/users/kiki/INBOX");
        let two = fixture.create_mailbox("/users/mja/INBOX");

        let first = fixture
            .inject(Injection::new(parse_message(SIMPLE).unwrap(), vec![one]));
        let second = fixture
            .inject(Injection::new(parse_message(SIMPLE).unwrap(), vec![two]));
        assert!(!first.failed() && !second.failed());

        // Same bytes, one row
        assert_eq!(1, fixture.count("SELECT COUNT(*) FROM `bodyparts`"));
    }

    #[test]
    fn uid_and_modseq_are_monotonic() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");

        for expected in 1..=3i64 {
            let injector = fixture.inject(Injection::new(
                parse_message(SIMPLE).unwrap(),
                vec![inbox],
            ));
            assert!(!injector.failed());
            assert_eq!(Some(Uid(expected as u32)), injector.uid(inbox));
        }

        let modseqs: Vec<i64> = fixture
            .cxn
            .cxn
            .prepare("SELECT `modseq` FROM `modsequences` ORDER BY `uid`")
            .unwrap()
            .query_map((), scalar)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(vec![1, 2, 3], modseqs);
    }

    #[test]
    fn multi_mailbox_allocation() {
        let mut fixture = Fixture::new();
        let one = fixture.create_mailbox("/users/kiki/INBOX");
        let two = fixture.create_mailbox("/users/mja/INBOX");

        // Duplicates collapse; both mailboxes get their own UID.
        let injector = fixture.inject(Injection::new(
            parse_message(SIMPLE).unwrap(),
            vec![two, one, two],
        ));
        assert!(!injector.failed());
        assert_eq!(Some(Uid(1)), injector.uid(one));
        assert_eq!(Some(Uid(1)), injector.uid(two));
        assert_eq!(2, fixture.count("SELECT COUNT(*) FROM `messages`"));
    }

    #[test]
    fn recent_goes_to_first_session() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");
        let first = fixture.store.open_session(inbox);
        let second = fixture.store.open_session(inbox);

        let injector = fixture.inject(Injection::new(
            parse_message(SIMPLE).unwrap(),
            vec![inbox],
        ));
        assert!(!injector.failed());
        injector.announce(&fixture.store, &ClusterClient::disabled());

        assert_eq!(1, first.recent_count());
        assert_eq!(0, second.recent_count());
        assert_eq!(
            vec![crate::account::mailbox::Change::New(Uid(1))],
            second.take_changes(),
        );

        // first_recent advanced with uidnext
        let first_recent = fixture
            .count("SELECT `first_recent` FROM `mailboxes`");
        assert_eq!(2, first_recent);
    }

    #[test]
    fn no_session_leaves_first_recent() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");

        let injector = fixture.inject(Injection::new(
            parse_message(SIMPLE).unwrap(),
            vec![inbox],
        ));
        assert!(!injector.failed());

        assert_eq!(
            1,
            fixture.count("SELECT `first_recent` FROM `mailboxes`"),
        );
        assert_eq!(2, fixture.count("SELECT `uidnext` FROM `mailboxes`"));
    }

    #[test]
    fn flags_and_annotations() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");

        let mut injection =
            Injection::new(parse_message(SIMPLE).unwrap(), vec![inbox]);
        injection.flags =
            vec!["\\Seen".to_owned(), "\\SEEN".to_owned(), "work".to_owned()];
        injection.annotations = vec![
            Annotation {
                name: "/comment".to_owned(),
                value: "first".to_owned(),
                owner: None,
            },
            Annotation {
                name: "/comment".to_owned(),
                value: "second".to_owned(),
                owner: None,
            },
        ];
        let injector = fixture.inject(injection);
        assert!(!injector.failed(), "{}", injector.error());

        // \SEEN collapsed into \Seen
        assert_eq!(2, fixture.count("SELECT COUNT(*) FROM `flags`"));
        assert_eq!(2, fixture.count("SELECT COUNT(*) FROM `flag_names`"));

        // Last annotation value wins; owner is NULL for shared
        assert_eq!(1, fixture.count("SELECT COUNT(*) FROM `annotations`"));
        let (value, owner): (String, Option<i64>) = fixture
            .cxn
            .cxn
            .query_row(
                "SELECT `value`, `owner` FROM `annotations`",
                (),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!("second", value);
        assert_eq!(None, owner);

        // The caches were primed by the commit
        assert!(fixture.caches.flags.translate("\\Seen").is_some());
        assert!(fixture
            .caches
            .annotations
            .translate("/comment")
            .is_some());
    }

    #[test]
    fn deliveries_for_remote_recipients() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");
        let spool = fixture.create_mailbox("/petramap/spool");

        let mut injection = Injection::new(
            parse_message(SIMPLE).unwrap(),
            vec![inbox, spool],
        );
        injection.sender = Some(Address::new("", "kiki", "example.com"));
        injection.remote_recipients = vec![
            Address::new("", "far", "example.net"),
            // Matches a To: address by naked form; reuses its row
            Address::new("", "mja", "example.net"),
        ];
        let injector = fixture.inject(injection);
        assert!(!injector.failed(), "{}", injector.error());

        assert_eq!(1, fixture.count("SELECT COUNT(*) FROM `deliveries`"));
        assert_eq!(
            2,
            fixture.count("SELECT COUNT(*) FROM `delivery_recipients`"),
        );

        let (mailbox, uid): (MailboxId, Uid) = fixture
            .cxn
            .cxn
            .query_row(
                "SELECT `mailbox`, `uid` FROM `deliveries`",
                (),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(spool, mailbox);
        assert_eq!(injector.uid(spool), Some(uid));
    }

    #[test]
    fn delivery_without_spool_mailbox_fails() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");

        let mut injection =
            Injection::new(parse_message(SIMPLE).unwrap(), vec![inbox]);
        injection.sender = Some(Address::new("", "kiki", "example.com"));
        injection.remote_recipients =
            vec![Address::new("", "far", "example.net")];
        let injector = fixture.inject(injection);

        assert!(injector.failed());
        // The whole transaction rolled back
        assert_eq!(0, fixture.count("SELECT COUNT(*) FROM `messages`"));
        assert_eq!(
            1,
            fixture.count("SELECT `uidnext` FROM `mailboxes`"),
        );
    }

    #[test]
    fn wrapped_message_records_original() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");

        let raw = b"utterly unparsable";
        let mut injection = Injection::new(
            wrap_unparsable(raw, "no header"),
            vec![inbox],
        );
        injection.wrapped = true;
        let injector = fixture.inject(injection);
        assert!(!injector.failed(), "{}", injector.error());

        let stored: Vec<u8> = fixture
            .cxn
            .cxn
            .query_row(
                "SELECT `data` FROM `bodyparts` \
                 JOIN `unparsed_messages` \
                 ON `bodypart` = `bodyparts`.`id`",
                (),
                scalar,
            )
            .unwrap();
        assert_eq!(raw.to_vec(), stored);
    }

    #[test]
    fn html_stores_text_and_data() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");

        let message = parse_message(
            b"Subject: h\r\n\
              Content-Type: text/html\r\n\
              \r\n\
              <p>hello</p>\r\n",
        )
        .unwrap();
        let injector =
            fixture.inject(Injection::new(message, vec![inbox]));
        assert!(!injector.failed());

        let (text, data): (Option<String>, Option<Vec<u8>>) = fixture
            .cxn
            .cxn
            .query_row(
                "SELECT `text`, `data` FROM `bodyparts`",
                (),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(Some("<p>hello</p>\r\n".to_owned()), text);
        assert_eq!(Some(b"<p>hello</p>\r\n".to_vec()), data);
    }

    #[test]
    fn multipart_containers_store_nothing() {
        let mut fixture = Fixture::new();
        let inbox = fixture.create_mailbox("/users/kiki/INBOX");

        let message = parse_message(
            b"Content-Type: multipart/mixed; boundary=bb\r\n\
              \r\n\
              --bb\r\n\
              \r\n\
              one\r\n\
              --bb\r\n\
              \r\n\
              two\r\n\
              --bb--\r\n",
        )
        .unwrap();
        let injector =
            fixture.inject(Injection::new(message, vec![inbox]));
        assert!(!injector.failed());

        // Parts "", "1", and "2"; the root "" is the container here since
        // the message itself is multipart.
        assert_eq!(
            3,
            fixture.count("SELECT COUNT(*) FROM `part_numbers`"),
        );
        assert_eq!(2, fixture.count("SELECT COUNT(*) FROM `bodyparts`"));
    }

    #[test]
    fn concurrent_injections_serialise() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("mail.sqlite");
        {
            let cxn = db::Connection::open(&path).unwrap();
            cxn.cxn
                .execute("INSERT INTO `mailboxes` (`name`) VALUES ('/m')", ())
                .unwrap();
        }

        let store = std::sync::Arc::new(MailboxStore::new());
        let caches = std::sync::Arc::new(Caches::new());

        let mut workers = Vec::new();
        for _ in 0..2 {
            let path = path.clone();
            let store = std::sync::Arc::clone(&store);
            let caches = std::sync::Arc::clone(&caches);
            workers.push(std::thread::spawn(move || {
                let mut cxn = db::Connection::open(&path).unwrap();
                let mailbox = store.obtain(&cxn, "/m").unwrap();

                let mut injector = Injector::new(Injection::new(
                    parse_message(SIMPLE).unwrap(),
                    vec![mailbox],
                ));
                injector.execute(
                    &mut cxn,
                    &store,
                    &caches,
                    "/petramap/spool",
                );
                assert!(!injector.failed(), "{}", injector.error());
                injector.uid(mailbox).unwrap()
            }));
        }

        let mut uids: Vec<u32> = workers
            .into_iter()
            .map(|worker| worker.join().unwrap().0)
            .collect();
        uids.sort();
        assert_eq!(vec![1, 2], uids);

        let cxn = db::Connection::open(&path).unwrap();
        let uidnext: i64 = cxn
            .cxn
            .query_row("SELECT `uidnext` FROM `mailboxes`", (), scalar)
            .unwrap();
        assert_eq!(3, uidnext);
    }

    #[test]
    fn injection_into_nx_mailbox_rolls_back() {
        let mut fixture = Fixture::new();
        let injector = fixture.inject(Injection::new(
            parse_message(SIMPLE).unwrap(),
            vec![MailboxId(42)],
        ));

        assert!(injector.failed());
        assert!(!injector.error().is_empty());
        assert_eq!(0, fixture.count("SELECT COUNT(*) FROM `messages`"));
        // The bodypart insert rolled back with everything else
        assert_eq!(0, fixture.count("SELECT COUNT(*) FROM `bodyparts`"));
    }
}
