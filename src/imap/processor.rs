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

//! Execution of individual IMAP commands against the connection state.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::info;

use super::command::{Command, CommandKind, ConnState, RespCond};
use crate::account::mailbox::Session;
use crate::account::pattern::{pattern_match, Match};
use crate::account::users::{self, User};
use crate::context::Context;
use crate::db::{self, types::*};
use crate::inject::injector::{Injection, Injector};
use crate::mime::parse::{parse_message, wrap_unparsable};
use crate::sasl::{Dialogue, Mechanism, Outcome};
use crate::support::log_prefix::LogPrefix;

pub struct Processor {
    pub ctx: Arc<Context>,
    pub cxn: db::Connection,
    pub state: ConnState,
    pub user: Option<User>,
    pub session: Option<Arc<Session>>,
    /// Bytes queued for the wire; the server flushes after every pass.
    pub output: Vec<u8>,
    pub log_prefix: LogPrefix,
    /// Set when a successful STARTTLS needs the server to swap streams.
    pub start_tls: bool,
    pub tls_active: bool,
    pub closing: bool,
}

impl Processor {
    pub fn new(
        ctx: Arc<Context>,
        cxn: db::Connection,
        log_prefix: LogPrefix,
    ) -> Self {
        Self {
            ctx,
            cxn,
            state: ConnState::NotAuthenticated,
            user: None,
            session: None,
            output: Vec::new(),
            log_prefix,
            start_tls: false,
            tls_active: false,
            closing: false,
        }
    }

    pub fn capabilities(&self) -> String {
        let mut caps =
            "IMAP4rev1 LITERAL+ ID IDLE AUTH=CRAM-MD5".to_owned();
        if self.ctx.config.tls.is_some() && !self.tls_active {
            caps.push_str(" STARTTLS");
        }
        caps
    }

    /// Gives `cmd` one execution step.
    pub fn execute(&mut self, cmd: &mut Command) {
        use CommandKind as K;

        let kind = std::mem::replace(&mut cmd.kind, K::Close);
        cmd.kind = match kind {
            K::Capability => {
                cmd.respond(format!("CAPABILITY {}", self.capabilities()));
                cmd.finish();
                K::Capability
            },

            K::Noop => {
                self.report_new_messages(cmd);
                cmd.finish();
                K::Noop
            },

            K::Logout => {
                cmd.respond("BYE logging out");
                self.state = ConnState::Logout;
                self.closing = true;
                cmd.finish();
                K::Logout
            },

            K::Id => {
                cmd.respond(format!(
                    "ID (\"name\" \"petramap\" \"version\" \"{}\")",
                    env!("CARGO_PKG_VERSION"),
                ));
                cmd.finish();
                K::Id
            },

            K::StartTls => {
                self.cmd_starttls(cmd);
                K::StartTls
            },

            K::Login { login, password } => {
                self.cmd_login(cmd, &login, &password);
                K::Login { login, password }
            },

            K::Authenticate {
                mechanism,
                initial_response,
                dialogue,
            } => {
                let dialogue = self.cmd_authenticate(
                    cmd,
                    &mechanism,
                    initial_response.as_deref(),
                    dialogue,
                );
                K::Authenticate {
                    mechanism,
                    initial_response,
                    dialogue,
                }
            },

            K::Idle { idling } => {
                let idling = self.cmd_idle(cmd, idling);
                K::Idle { idling }
            },

            K::List {
                reference,
                pattern,
                lsub,
            } => {
                self.cmd_list(cmd, &reference, &pattern, lsub);
                K::List {
                    reference,
                    pattern,
                    lsub,
                }
            },

            K::Select { mailbox, read_only } => {
                self.cmd_select(cmd, &mailbox, read_only);
                K::Select { mailbox, read_only }
            },

            K::Close => {
                self.end_session();
                self.state = ConnState::Authenticated;
                cmd.finish();
                K::Close
            },

            K::Append {
                mailbox,
                flags,
                content,
            } => {
                self.cmd_append(cmd, &mailbox, &flags, &content);
                K::Append {
                    mailbox,
                    flags,
                    content,
                }
            },
        };
    }

    /// Feeds a line of reserved input to `cmd`.
    pub fn read(&mut self, cmd: &mut Command, line: &[u8]) {
        use CommandKind as K;

        let kind = std::mem::replace(&mut cmd.kind, K::Close);
        cmd.kind = match kind {
            K::Authenticate {
                mechanism,
                initial_response,
                dialogue,
            } => {
                let dialogue = self.auth_respond(cmd, dialogue, line);
                K::Authenticate {
                    mechanism,
                    initial_response,
                    dialogue,
                }
            },

            K::Idle { idling } => {
                if line.eq_ignore_ascii_case(b"DONE") {
                    cmd.finish();
                } else {
                    cmd.error(RespCond::Bad, "Expected DONE");
                }
                K::Idle { idling }
            },

            other => {
                cmd.error(RespCond::Bad, "Unexpected input");
                other
            },
        };
    }

    pub fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.ctx.store.close_session(&session);
        }
    }

    fn cmd_starttls(&mut self, cmd: &mut Command) {
        if self.tls_active {
            cmd.error(RespCond::Bad, "Already using TLS");
            return;
        }
        if self.ctx.config.tls.is_none() {
            cmd.error(RespCond::No, "TLS not configured");
            return;
        }

        cmd.set_status_text("Begin TLS negotiation now");
        self.start_tls = true;
        cmd.finish();
    }

    fn cmd_login(&mut self, cmd: &mut Command, login: &str, password: &str) {
        let user = match users::lookup_user(&self.cxn, login) {
            Ok(user) => user,
            Err(e) => {
                cmd.error(RespCond::No, e.to_string());
                return;
            },
        };

        // No distinction between unknown user and wrong password.
        match user {
            Some(user) if user.secret == password => {
                self.set_user(user);
                cmd.finish();
            },
            _ => {
                info!(
                    "{} Rejected login for user {login}",
                    self.log_prefix,
                );
                cmd.error(RespCond::No, "Sorry");
            },
        }
    }

    fn set_user(&mut self, user: User) {
        self.log_prefix.set_user(user.login.clone());
        info!("{} Authenticated", self.log_prefix);
        self.user = Some(user);
        self.state = ConnState::Authenticated;
    }

    fn cmd_authenticate(
        &mut self,
        cmd: &mut Command,
        mechanism: &str,
        initial_response: Option<&str>,
        dialogue: Option<Dialogue>,
    ) -> Option<Dialogue> {
        // Re-entered while awaiting the client's response: nothing to do.
        if dialogue.is_some() {
            return dialogue;
        }

        let Some(mechanism) = Mechanism::create(mechanism) else {
            cmd.error(
                RespCond::No,
                format!("Mechanism {} not supported", mechanism),
            );
            return None;
        };

        let mut dialogue = Dialogue::new(
            mechanism,
            self.ctx.config.security.allow_anonymous,
        );
        match dialogue.start(
            &self.ctx.config.hostname,
            initial_response,
            &self.cxn,
        ) {
            Ok(outcome) => self.apply_sasl_outcome(cmd, outcome),
            Err(e) => cmd.error(RespCond::No, e.to_string()),
        }
        Some(dialogue)
    }

    fn auth_respond(
        &mut self,
        cmd: &mut Command,
        dialogue: Option<Dialogue>,
        line: &[u8],
    ) -> Option<Dialogue> {
        let Some(mut dialogue) = dialogue else {
            cmd.error(RespCond::Bad, "Unexpected input");
            return None;
        };

        match dialogue.respond(line, &self.cxn) {
            Ok(outcome) => self.apply_sasl_outcome(cmd, outcome),
            Err(e) => cmd.error(RespCond::No, e.to_string()),
        }
        Some(dialogue)
    }

    fn apply_sasl_outcome(&mut self, cmd: &mut Command, outcome: Outcome) {
        match outcome {
            Outcome::Challenge(challenge) => {
                self.output.extend_from_slice(
                    format!("+ {}\r\n", challenge).as_bytes(),
                );
                cmd.wants_input = true;
            },
            Outcome::Succeeded(user) => {
                self.set_user(user);
                cmd.finish();
            },
            Outcome::Failed(quip) => {
                // An explicit client abort is a syntax-level matter.
                let cond = if "authentication terminated" == quip {
                    RespCond::Bad
                } else {
                    RespCond::No
                };
                cmd.error(cond, quip);
            },
        }
    }

    fn cmd_idle(&mut self, cmd: &mut Command, idling: bool) -> bool {
        if !idling {
            self.output.extend_from_slice(b"+ idling\r\n");
            cmd.wants_input = true;
            return true;
        }

        // Re-entered while idling: push any new arrivals immediately.
        let mut lines = Vec::new();
        self.with_new_messages(|exists| {
            lines.push(format!("* {} EXISTS\r\n", exists));
        });
        for line in lines {
            self.output.extend_from_slice(line.as_bytes());
        }
        idling
    }

    /// NOOP-style change reporting: if the selected mailbox gained
    /// messages, report the new EXISTS count as an untagged response.
    fn report_new_messages(&mut self, cmd: &mut Command) {
        let mut lines = Vec::new();
        self.with_new_messages(|exists| {
            lines.push(format!("{} EXISTS", exists));
        });
        for line in lines {
            cmd.respond(line);
        }
    }

    fn with_new_messages(&self, mut f: impl FnMut(i64)) {
        let Some(ref session) = self.session else {
            return;
        };
        if session.take_changes().is_empty() {
            return;
        }

        let exists = self
            .cxn
            .cxn
            .query_row(
                "SELECT COUNT(*) FROM `messages` WHERE `mailbox` = ?",
                (session.mailbox,),
                scalar::<i64>,
            )
            .unwrap_or(0);
        f(exists);
    }

    /// Interprets a client-supplied mailbox name against the user's home.
    fn absolute_name(&self, name: &str) -> String {
        if name.starts_with('/') {
            return name.to_owned();
        }

        let home = self
            .user
            .as_ref()
            .map(User::home)
            .unwrap_or_default();
        if name.eq_ignore_ascii_case("inbox") {
            format!("{}/INBOX", home)
        } else {
            format!("{}/{}", home, name)
        }
    }

    fn cmd_list(
        &mut self,
        cmd: &mut Command,
        reference: &str,
        pattern: &str,
        lsub: bool,
    ) {
        let verb = if lsub { "LSUB" } else { "LIST" };

        // An empty pattern just names the hierarchy delimiter.
        if pattern.is_empty() {
            cmd.respond(format!("{} (\\Noselect) \"/\" \"\"", verb));
            cmd.finish();
            return;
        }

        let names = if lsub {
            self.subscription_names()
        } else {
            self.ctx.store.all_names(&self.cxn)
        };
        let names = match names {
            Ok(names) => names,
            Err(e) => {
                cmd.error(RespCond::No, e.to_string());
                return;
            },
        };

        // Intermediate hierarchy levels exist for matching purposes even
        // when no mailbox row backs them.
        let mut candidates = BTreeSet::new();
        for name in names {
            let mut boundary = name.len();
            loop {
                candidates.insert(name[..boundary].to_owned());
                match name[..boundary].rfind('/') {
                    Some(0) | None => break,
                    Some(ix) => boundary = ix,
                }
            }
        }

        let base = if reference.is_empty() {
            self.user.as_ref().map(User::home).unwrap_or_default()
        } else {
            self.absolute_name(reference.trim_end_matches('/'))
        };
        let absolute = pattern.starts_with('/');

        let displays: Vec<(String, bool)> = candidates
            .iter()
            .filter_map(|candidate| {
                let display = if absolute {
                    candidate.as_str()
                } else {
                    candidate.strip_prefix(&format!("{}/", base))?
                };
                if Match::Yes != pattern_match(pattern, display) {
                    return None;
                }

                let has_children = candidates
                    .iter()
                    .any(|c| c.starts_with(&format!("{}/", candidate)));
                Some((display.to_owned(), has_children))
            })
            .collect();

        for (display, has_children) in displays {
            let attrs = if lsub {
                String::new()
            } else if has_children {
                "\\HasChildren".to_owned()
            } else {
                "\\HasNoChildren".to_owned()
            };
            cmd.respond(format!(
                "{} ({}) \"/\" {}",
                verb,
                attrs,
                quote_mailbox(&display),
            ));
        }
        cmd.finish();
    }

    fn subscription_names(
        &self,
    ) -> Result<Vec<String>, crate::support::error::Error> {
        let Some(ref user) = self.user else {
            return Ok(Vec::new());
        };
        self.cxn
            .cxn
            .prepare(
                "SELECT `path` FROM `subscriptions` WHERE `user` = ? \
                 ORDER BY `path`",
            )?
            .query_map((user.id,), scalar)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(Into::into)
    }

    fn cmd_select(
        &mut self,
        cmd: &mut Command,
        mailbox: &str,
        read_only: bool,
    ) {
        let name = self.absolute_name(mailbox);
        let id = match self.ctx.store.obtain(&self.cxn, &name) {
            Ok(id) => id,
            Err(_) => {
                cmd.error(RespCond::No, "No such mailbox");
                return;
            },
        };

        self.end_session();
        let session = self.ctx.store.open_session(id);

        let counts = self
            .cxn
            .cxn
            .query_row(
                "SELECT `uidnext`, `first_recent` FROM `mailboxes` \
                 WHERE `id` = ?",
                (id,),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        let exists = self
            .cxn
            .cxn
            .query_row(
                "SELECT COUNT(*) FROM `messages` WHERE `mailbox` = ?",
                (id,),
                scalar::<i64>,
            )
            .unwrap_or(0);

        let (uidnext, first_recent) =
            counts.unwrap_or((Uid(1), Uid(1)));
        cmd.respond(format!("{} EXISTS", exists));
        cmd.respond(format!(
            "{} RECENT",
            uidnext.0.saturating_sub(first_recent.0),
        ));
        cmd.respond(
            "FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)",
        );
        cmd.respond("OK [UIDVALIDITY 1] UIDs valid");
        cmd.respond(format!("OK [UIDNEXT {}] next UID", uidnext.0));

        self.session = Some(session);
        self.state = ConnState::Selected;
        cmd.set_status_text(if read_only {
            "[READ-ONLY] done"
        } else {
            "[READ-WRITE] done"
        });
        cmd.finish();
        info!("{} Selected mailbox {}", self.log_prefix, name);
    }

    fn cmd_append(
        &mut self,
        cmd: &mut Command,
        mailbox: &str,
        flags: &[String],
        content: &[u8],
    ) {
        let name = self.absolute_name(mailbox);
        let id = match self.ctx.store.obtain(&self.cxn, &name) {
            Ok(id) => id,
            Err(_) => {
                cmd.error(
                    RespCond::No,
                    "[TRYCREATE] No such mailbox",
                );
                return;
            },
        };

        let (message, wrapped) = match parse_message(content) {
            Ok(message) => (message, false),
            Err(e) => (wrap_unparsable(content, &e.to_string()), true),
        };

        let mut injection = Injection::new(message, vec![id]);
        injection.flags = flags.to_vec();
        injection.wrapped = wrapped;

        let mut injector = Injector::new(injection);
        injector.execute(
            &mut self.cxn,
            &self.ctx.store,
            &self.ctx.caches,
            &self.ctx.config.spool_mailbox,
        );

        if injector.failed() {
            cmd.error(RespCond::No, injector.error());
        } else {
            injector.announce(&self.ctx.store, &self.ctx.cluster);
            cmd.finish();
        }
    }
}

/// Quotes a mailbox name for a LIST/LSUB response when the atom form won't
/// do.
fn quote_mailbox(name: &str) -> String {
    let atom_safe = !name.is_empty()
        && name.bytes().all(|b| {
            b > b' '
                && b < 127
                && !matches!(b, b'(' | b')' | b'{' | b'"' | b'\\' | b'%' | b'*')
        });
    if atom_safe {
        name.to_owned()
    } else {
        format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
    }
}
