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

//! IMAP command objects.
//!
//! A command is an explicit state object: created Unparsed when its line
//! arrives, argument-parsed when the scheduler lets its group start,
//! re-entered by `execute` until Finished, and Retired once its responses
//! hit the wire. Responses accumulate on the command so that the scheduler
//! can hold them back until every earlier command has spoken.

use crate::sasl;

use super::parser::ImapParser;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandState {
    Unparsed,
    Blocked,
    Executing,
    Finished,
    Retired,
}

/// The connection-level IMAP state (RFC 3501 §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RespCond {
    Ok,
    No,
    Bad,
}

/// Parsed arguments and per-command progress.
pub enum CommandKind {
    Capability,
    Noop,
    Logout,
    Id,
    StartTls,
    Login {
        login: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial_response: Option<String>,
        dialogue: Option<sasl::Dialogue>,
    },
    Idle {
        idling: bool,
    },
    List {
        reference: String,
        pattern: String,
        lsub: bool,
    },
    Select {
        mailbox: String,
        read_only: bool,
    },
    Close,
    Append {
        mailbox: String,
        flags: Vec<String>,
        content: Vec<u8>,
    },
}

pub struct Command {
    pub id: u64,
    pub tag: String,
    pub name: String,
    pub parser: ImapParser,
    pub state: CommandState,
    pub kind: CommandKind,
    /// Untagged response lines, without CRLF.
    responses: Vec<String>,
    status: (RespCond, String),
    errored: bool,
    /// Set by `execute` to claim the connection's input.
    pub wants_input: bool,
}

impl Command {
    /// Creates the command named `name`, or `None` if there is no such
    /// command.
    pub fn create(
        id: u64,
        tag: String,
        name: String,
        parser: ImapParser,
    ) -> Option<Self> {
        let kind = match name.as_str() {
            "capability" => CommandKind::Capability,
            "noop" => CommandKind::Noop,
            "logout" => CommandKind::Logout,
            "id" => CommandKind::Id,
            "starttls" => CommandKind::StartTls,
            "login" => CommandKind::Login {
                login: String::new(),
                password: String::new(),
            },
            "authenticate" => CommandKind::Authenticate {
                mechanism: String::new(),
                initial_response: None,
                dialogue: None,
            },
            "idle" => CommandKind::Idle { idling: false },
            "list" => CommandKind::List {
                reference: String::new(),
                pattern: String::new(),
                lsub: false,
            },
            "lsub" => CommandKind::List {
                reference: String::new(),
                pattern: String::new(),
                lsub: true,
            },
            "select" => CommandKind::Select {
                mailbox: String::new(),
                read_only: false,
            },
            "examine" => CommandKind::Select {
                mailbox: String::new(),
                read_only: true,
            },
            "close" => CommandKind::Close,
            "append" => CommandKind::Append {
                mailbox: String::new(),
                flags: Vec::new(),
                content: Vec::new(),
            },
            _ => return None,
        };

        Some(Self {
            id,
            tag,
            name,
            parser,
            state: CommandState::Unparsed,
            kind,
            responses: Vec::new(),
            status: (RespCond::Ok, "done".to_owned()),
            errored: false,
            wants_input: false,
        })
    }

    /// The concurrency class. 0 means the command must execute alone;
    /// commands sharing a positive group may execute concurrently.
    pub fn group(&self) -> u32 {
        match self.kind {
            // Read-only listing commands
            CommandKind::List { .. } => 1,
            // Pure status chatter
            CommandKind::Capability | CommandKind::Noop | CommandKind::Id => {
                2
            },
            _ => 0,
        }
    }

    pub fn valid_in(&self, state: ConnState) -> bool {
        match self.kind {
            CommandKind::Capability
            | CommandKind::Noop
            | CommandKind::Logout
            | CommandKind::Id => ConnState::Logout != state,
            CommandKind::StartTls
            | CommandKind::Login { .. }
            | CommandKind::Authenticate { .. } => {
                ConnState::NotAuthenticated == state
            },
            CommandKind::List { .. }
            | CommandKind::Select { .. }
            | CommandKind::Append { .. }
            | CommandKind::Idle { idling: _ } => matches!(
                state,
                ConnState::Authenticated | ConnState::Selected,
            ),
            CommandKind::Close => ConnState::Selected == state,
        }
    }

    /// Parses the command's arguments from its residual parser state.
    ///
    /// On a syntax error the command fails with BAD and is Finished by the
    /// scheduler.
    pub fn parse(&mut self) {
        match self.kind {
            CommandKind::Capability
            | CommandKind::Noop
            | CommandKind::Logout
            | CommandKind::StartTls
            | CommandKind::Close
            | CommandKind::Idle { .. } => {
                self.parser.end();
            },

            CommandKind::Id => {
                // ID (field value ...) or ID NIL; we take note of nothing.
                self.parser.space();
                if self.parser.present("(") {
                    if !self.parser.present(")") {
                        loop {
                            self.parser.string();
                            self.parser.space();
                            self.parser.nstring();
                            if !self.parser.present(" ") {
                                break;
                            }
                        }
                        self.parser.require(")");
                    }
                } else {
                    self.parser.require("NIL");
                }
                self.parser.end();
            },

            CommandKind::Login {
                ref mut login,
                ref mut password,
            } => {
                self.parser.space();
                *login = self.parser.astring();
                self.parser.space();
                *password = self.parser.astring();
                self.parser.end();
            },

            CommandKind::Authenticate {
                ref mut mechanism,
                ref mut initial_response,
                ..
            } => {
                self.parser.space();
                *mechanism = self.parser.atom().to_ascii_lowercase();
                // A SASL initial response may follow on the same line.
                if self.parser.present(" ") {
                    let mut ir = String::new();
                    loop {
                        let c = self.parser.next_char();
                        if c.is_ascii_alphanumeric()
                            || matches!(c, b'+' | b'/' | b'=')
                        {
                            ir.push(c as char);
                            self.parser.step();
                        } else {
                            break;
                        }
                    }
                    *initial_response = Some(ir);
                }
                self.parser.end();
            },

            CommandKind::List {
                ref mut reference,
                ref mut pattern,
                ..
            } => {
                self.parser.space();
                *reference = self.parser.astring();
                self.parser.space();
                *pattern = self.parser.list_mailbox();
                self.parser.end();
            },

            CommandKind::Select {
                ref mut mailbox, ..
            } => {
                self.parser.space();
                *mailbox = self.parser.astring();
                self.parser.end();
            },

            CommandKind::Append {
                ref mut mailbox,
                ref mut flags,
                ref mut content,
            } => {
                self.parser.space();
                *mailbox = self.parser.astring();
                self.parser.space();

                if self.parser.present("(") {
                    if !self.parser.present(")") {
                        loop {
                            flags.push(self.parser.atom());
                            if !self.parser.present(" ") {
                                break;
                            }
                        }
                        self.parser.require(")");
                    }
                    self.parser.space();
                }

                // An optional INTERNALDATE; recorded nowhere since the
                // injector's heuristics reconstruct a sensible date.
                if b'"' == self.parser.next_char() {
                    self.parser.string();
                    self.parser.space();
                }

                *content = self.parser.string_bytes();
                self.parser.end();
            },
        }

        if !self.parser.ok() {
            self.error(RespCond::Bad, self.parser.error());
        }
    }

    pub fn ok(&self) -> bool {
        !self.errored
    }

    /// Fails the command. The first error wins.
    pub fn error(&mut self, cond: RespCond, text: impl Into<String>) {
        if !self.errored {
            self.errored = true;
            self.status = (cond, text.into());
        }
        self.state = CommandState::Finished;
    }

    /// Adds an untagged response line (no CRLF).
    pub fn respond(&mut self, line: impl Into<String>) {
        self.responses.push(line.into());
    }

    pub fn set_status_text(&mut self, text: impl Into<String>) {
        if !self.errored {
            self.status.1 = text.into();
        }
    }

    pub fn finish(&mut self) {
        self.state = CommandState::Finished;
    }

    /// Flushes the untagged responses and the tagged completion, retiring
    /// the command.
    pub fn emit_responses(&mut self, out: &mut Vec<u8>) {
        for line in self.responses.drain(..) {
            out.extend_from_slice(b"* ");
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        let cond = match self.status.0 {
            RespCond::Ok => "OK",
            RespCond::No => "NO",
            RespCond::Bad => "BAD",
        };
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.tag, cond, self.status.1)
                .as_bytes(),
        );
        self.state = CommandState::Retired;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parsed(line: &str) -> Command {
        let mut parser = ImapParser::new(line.as_bytes().to_vec());
        let tag = parser.tag();
        parser.space();
        let name = parser.command();
        let mut cmd = Command::create(1, tag, name, parser).unwrap();
        cmd.parse();
        cmd
    }

    #[test]
    fn login_parses() {
        let cmd = parsed("A1 LOGIN kiki \"pass word\"");
        assert!(cmd.ok());
        match cmd.kind {
            CommandKind::Login {
                ref login,
                ref password,
            } => {
                assert_eq!("kiki", login);
                assert_eq!("pass word", password);
            },
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn authenticate_with_initial_response() {
        let cmd = parsed("A1 AUTHENTICATE CRAM-MD5 dGVzdA==");
        assert!(cmd.ok());
        match cmd.kind {
            CommandKind::Authenticate {
                ref mechanism,
                ref initial_response,
                ..
            } => {
                assert_eq!("cram-md5", mechanism);
                assert_eq!(Some("dGVzdA=="), initial_response.as_deref());
            },
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn append_with_flags_and_literal() {
        let cmd = parsed(
            "A1 APPEND INBOX (\\Seen work) {11}\r\nhello there",
        );
        assert!(cmd.ok());
        match cmd.kind {
            CommandKind::Append {
                ref mailbox,
                ref flags,
                ref content,
            } => {
                assert_eq!("INBOX", mailbox);
                assert_eq!(
                    &["\\Seen".to_owned(), "work".to_owned()][..],
                    flags,
                );
                assert_eq!(b"hello there".to_vec(), *content);
            },
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn trailing_garbage_is_bad() {
        let mut cmd = parsed("A1 NOOP garbage");
        assert!(!cmd.ok());
        let mut out = Vec::new();
        cmd.emit_responses(&mut out);
        assert!(String::from_utf8(out).unwrap().starts_with("A1 BAD"));
    }

    #[test]
    fn groups() {
        assert_eq!(1, parsed("A1 LIST \"\" *").group());
        assert_eq!(2, parsed("A2 NOOP").group());
        assert_eq!(0, parsed("A3 LOGOUT").group());
    }

    #[test]
    fn state_filter() {
        assert!(parsed("A1 LOGIN a b")
            .valid_in(ConnState::NotAuthenticated));
        assert!(!parsed("A1 LOGIN a b").valid_in(ConnState::Authenticated));
        assert!(!parsed("A1 LIST \"\" *")
            .valid_in(ConnState::NotAuthenticated));
        assert!(parsed("A1 CLOSE").valid_in(ConnState::Selected));
        assert!(!parsed("A1 CLOSE").valid_in(ConnState::Authenticated));
    }
}
