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

//! The IMAP connection loop: framing, literals, input reservation, and
//! timeouts.
//!
//! Bytes from the socket land in the read buffer. Complete lines are
//! assembled into commands; a line ending in `{n}` or `{n+}` switches the
//! framer into literal mode, which splices the next n bytes verbatim into
//! the pending command (`+ reading literal` is sent first unless the
//! non-synchronising form was used). While a command has the input
//! reserved, lines are fed to it directly instead of being parsed.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::info;
use openssl::ssl::SslAcceptor;
use regex::bytes::Regex;

use super::command::{Command, ConnState};
use super::parser::ImapParser;
use super::processor::Processor;
use super::scheduler::Scheduler;
use crate::net::tls;
use crate::support::buffer::Buffer;
use crate::support::error::Error;

/// Longest accepted command line, literals included.
const MAX_LINE: usize = 262_144;
/// How much input an unauthenticated client may send, total.
const PRE_LOGIN_BYTE_CAP: usize = 32 * 1024;

const PRE_LOGIN_TIMEOUT: Duration = Duration::from_secs(120);
const INACTIVE_TIMEOUT: Duration = Duration::from_secs(1800);
const IDLE_TIMEOUT: Duration = Duration::from_secs(10800);

/// The socket handle kept around for deadline control after the `Read` and
/// `Write` halves have been boxed away.
enum DeadlineSocket {
    None,
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl DeadlineSocket {
    fn set_read_timeout(&self, timeout: Duration) {
        let _ = match *self {
            DeadlineSocket::None => Ok(()),
            DeadlineSocket::Tcp(ref s) => s.set_read_timeout(Some(timeout)),
            DeadlineSocket::Unix(ref s) => {
                s.set_read_timeout(Some(timeout))
            },
        };
    }
}

pub struct ImapServer {
    read: Box<dyn Read + Send>,
    write: Box<dyn Write + Send>,
    pub proc: Processor,
    sched: Scheduler,
    buffer: Buffer,
    /// The command line being assembled, literals spliced in.
    pending: Vec<u8>,
    reading_literal: bool,
    literal_size: usize,
    bytes_arrived: usize,
    socket: DeadlineSocket,
    acceptor: Option<Arc<SslAcceptor>>,
}

impl ImapServer {
    pub fn new(
        read: Box<dyn Read + Send>,
        write: Box<dyn Write + Send>,
        proc: Processor,
    ) -> Self {
        Self {
            read,
            write,
            proc,
            sched: Scheduler::new(),
            buffer: Buffer::new(),
            pending: Vec::new(),
            reading_literal: false,
            literal_size: 0,
            bytes_arrived: 0,
            socket: DeadlineSocket::None,
            acceptor: None,
        }
    }

    /// Builds a server over a TCP socket, enabling deadlines and (when an
    /// acceptor is supplied) STARTTLS.
    pub fn with_socket(
        socket: TcpStream,
        proc: Processor,
        acceptor: Option<Arc<SslAcceptor>>,
    ) -> Result<Self, Error> {
        let read = Box::new(socket.try_clone()?);
        let write = Box::new(socket.try_clone()?);
        let mut this = Self::new(read, write, proc);
        this.socket = DeadlineSocket::Tcp(socket);
        this.acceptor = acceptor;
        Ok(this)
    }

    /// Builds a server over the plaintext end of a TLS bridge, for the
    /// implicit-TLS service. The greeting is only delivered once the
    /// worker's handshake succeeds; if it fails, the bridge collapses and
    /// the connection closes silently.
    pub fn with_tls_bridge(
        socket: UnixStream,
        mut proc: Processor,
    ) -> Result<Self, Error> {
        proc.tls_active = true;
        let read = Box::new(socket.try_clone()?);
        let write = Box::new(socket.try_clone()?);
        let mut this = Self::new(read, write, proc);
        this.socket = DeadlineSocket::Unix(socket);
        Ok(this)
    }

    pub fn run(&mut self) -> Result<(), Error> {
        self.proc.output.extend_from_slice(
            format!(
                "* OK [CAPABILITY {}] {} Petramap IMAP Server\r\n",
                self.proc.capabilities(),
                self.proc.ctx.config.hostname,
            )
            .as_bytes(),
        );

        let mut chunk = [0u8; 8192];
        loop {
            self.flush()?;
            if self.proc.closing {
                break;
            }
            if self.proc.start_tls {
                self.begin_tls()?;
            }

            self.set_deadline();
            let nread = match self.read.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e)
                    if io::ErrorKind::Interrupted == e.kind() =>
                {
                    continue;
                },
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut,
                    ) =>
                {
                    info!("{} Idle timeout", self.proc.log_prefix);
                    self.proc
                        .output
                        .extend_from_slice(b"* BYE Tempus fugit\r\n");
                    break;
                },
                Err(e) => return Err(e.into()),
            };

            self.buffer.append(&chunk[..nread]);
            if ConnState::NotAuthenticated == self.proc.state {
                self.bytes_arrived += nread;
                if self.bytes_arrived > PRE_LOGIN_BYTE_CAP {
                    info!(
                        "{} >32k received before login",
                        self.proc.log_prefix,
                    );
                    self.proc.output.extend_from_slice(
                        b"* BYE overlong login sequence\r\n",
                    );
                    break;
                }
            }

            self.parse();
            self.sched.run(&mut self.proc);
        }

        self.proc.end_session();
        self.flush()?;
        Ok(())
    }

    /// Consumes as much buffered input as possible: literal bytes, reserved
    /// input, or complete command lines.
    fn parse(&mut self) {
        loop {
            if self.proc.closing {
                return;
            }

            if self.reading_literal {
                if self.buffer.len() < self.literal_size {
                    return;
                }
                let bytes = self.buffer.remove(self.literal_size);
                self.pending.extend_from_slice(&bytes);
                self.reading_literal = false;
                continue;
            }

            if self.sched.reader.is_some() {
                match self.buffer.remove_line() {
                    Some(line) => {
                        self.sched.feed_reader(&mut self.proc, &line);
                        self.sched.run(&mut self.proc);
                    },
                    None => return,
                }
                continue;
            }

            match self.buffer.remove_line() {
                None => {
                    if self.buffer.len() > MAX_LINE {
                        self.fatal_overlong();
                    }
                    return;
                },
                Some(line) => {
                    if self.pending.len() + line.len() > MAX_LINE {
                        self.fatal_overlong();
                        return;
                    }

                    let literal = ends_with_literal(&line);
                    self.pending.extend_from_slice(&line);

                    match literal {
                        Some((size, plus)) => {
                            if self.pending.len() + size > MAX_LINE {
                                self.fatal_overlong();
                                return;
                            }
                            self.pending.extend_from_slice(b"\r\n");
                            self.reading_literal = true;
                            self.literal_size = size;
                            if !plus {
                                self.proc.output.extend_from_slice(
                                    b"+ reading literal\r\n",
                                );
                            }
                        },
                        None => {
                            let cmdline = std::mem::take(&mut self.pending);
                            self.add_command(cmdline);
                            // Start the command before looking at further
                            // buffered lines, so that anything reserving
                            // the input gets them.
                            self.sched.run(&mut self.proc);
                        },
                    }
                },
            }
        }
    }

    /// Parses enough of the command line to create a Command, which the
    /// scheduler will parse fully and execute when its group may run.
    fn add_command(&mut self, cmdline: Vec<u8>) {
        let mut parser = ImapParser::new(cmdline);

        let tag = parser.tag();
        if !parser.ok() {
            self.proc.output.extend_from_slice(
                format!("* BAD {}\r\n", parser.error()).as_bytes(),
            );
            return;
        }

        parser.require(" ");
        let name = parser.command();
        if !parser.ok() {
            self.proc.output.extend_from_slice(
                format!("* BAD {}\r\n", parser.error()).as_bytes(),
            );
            return;
        }

        let id = self.sched.next_id();
        match Command::create(id, tag.clone(), name.clone(), parser) {
            Some(command) => self.sched.add(command),
            None => {
                info!(
                    "{} Unknown command {:?}",
                    self.proc.log_prefix, name,
                );
                self.proc.output.extend_from_slice(
                    format!("{} BAD No such command: {}\r\n", tag, name)
                        .as_bytes(),
                );
            },
        }
    }

    fn fatal_overlong(&mut self) {
        info!("{} Connection closed: line too long", self.proc.log_prefix);
        self.proc
            .output
            .extend_from_slice(b"* BAD Line too long\r\n");
        self.proc.closing = true;
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.proc.output.is_empty() {
            return Ok(());
        }

        let output = std::mem::take(&mut self.proc.output);
        self.write.write_all(&output)?;
        self.write.flush()?;
        Ok(())
    }

    fn set_deadline(&mut self) {
        let timeout =
            if ConnState::NotAuthenticated == self.proc.state {
                PRE_LOGIN_TIMEOUT
            } else if self.sched.idle() && !self.sched.commands.is_empty() {
                IDLE_TIMEOUT
            } else {
                INACTIVE_TIMEOUT
            };
        self.socket.set_read_timeout(timeout);
    }

    /// Swaps the byte stream for the TLS bridge's plaintext end after a
    /// successful STARTTLS.
    fn begin_tls(&mut self) -> Result<(), Error> {
        self.proc.start_tls = false;

        let socket = match std::mem::replace(
            &mut self.socket,
            DeadlineSocket::None,
        ) {
            DeadlineSocket::Tcp(socket) => socket,
            other => {
                self.socket = other;
                return Err(Error::TlsNotConfigured);
            },
        };
        let acceptor =
            self.acceptor.clone().ok_or(Error::TlsNotConfigured)?;

        info!("{} Start TLS handshake", self.proc.log_prefix);
        socket.set_read_timeout(None)?;
        let plain = tls::start(acceptor, socket)?;
        self.read = Box::new(plain.try_clone()?);
        self.write = Box::new(plain.try_clone()?);
        self.socket = DeadlineSocket::Unix(plain);
        self.proc.tls_active = true;
        Ok(())
    }
}

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r#"\{([0-9]+)(\+?)\}$"#).unwrap();
}

/// Checks whether a just-received line ends with a literal announcement,
/// returning its size and whether it is the non-synchronising form.
fn ends_with_literal(line: &[u8]) -> Option<(usize, bool)> {
    let captures = LITERAL_AT_EOL.captures(line)?;
    let size = std::str::from_utf8(captures.get(1)?.as_bytes())
        .ok()?
        .parse()
        .ok()?;
    let plus = !captures.get(2)?.as_bytes().is_empty();
    Some((size, plus))
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::account::users::testutil::create_user;
    use crate::context::Context;
    use crate::db::types::scalar;
    use crate::support::log_prefix::LogPrefix;
    use crate::support::system_config::SystemConfig;

    /// A `Write` handle into a shared buffer, so the test can inspect what
    /// the server sent after `run` returns.
    #[derive(Clone)]
    struct SharedOut(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedOut {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        ctx: Arc<Context>,
        _tmpdir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let tmpdir = tempfile::TempDir::new().unwrap();
            let config: SystemConfig = toml::from_str(&format!(
                "hostname = \"mail.example.com\"\n\
                 database = {:?}",
                tmpdir.path().join("mail.sqlite"),
            ))
            .unwrap();

            let ctx = Context::new(config);
            let cxn = ctx.open_db().unwrap();
            create_user(&cxn, "kiki", "secret");
            cxn.cxn
                .execute(
                    "INSERT INTO `mailboxes` (`name`) \
                     VALUES ('/users/kiki/lists/mja')",
                    (),
                )
                .unwrap();

            Self {
                ctx,
                _tmpdir: tmpdir,
            }
        }

        fn session(&self, input: &str) -> String {
            let cxn = self.ctx.open_db().unwrap();
            let proc = Processor::new(
                Arc::clone(&self.ctx),
                cxn,
                LogPrefix::new("imap", "test".to_owned()),
            );

            let out = SharedOut(Arc::new(Mutex::new(Vec::new())));
            let mut server = ImapServer::new(
                Box::new(io::Cursor::new(input.as_bytes().to_vec())),
                Box::new(out.clone()),
                proc,
            );
            server.run().unwrap();

            let out = out.0.lock().unwrap().clone();
            String::from_utf8(out).unwrap()
        }

        fn count(&self, sql: &str) -> i64 {
            self.ctx
                .open_db()
                .unwrap()
                .cxn
                .query_row(sql, (), scalar)
                .unwrap()
        }
    }

    /// Asserts `needles` appear in `haystack` in the given order.
    fn assert_in_order(haystack: &str, needles: &[&str]) {
        let mut from = 0;
        for needle in needles {
            match haystack[from..].find(needle) {
                Some(ix) => from += ix + needle.len(),
                None => panic!(
                    "{:?} missing (in order) from:\n{}",
                    needle, haystack,
                ),
            }
        }
    }

    #[test]
    fn greeting_and_logout() {
        let fixture = Fixture::new();
        let out = fixture.session("A1 LOGOUT\r\n");
        assert_in_order(
            &out,
            &[
                "* OK [CAPABILITY IMAP4rev1 LITERAL+ ID IDLE \
                 AUTH=CRAM-MD5] mail.example.com",
                "* BYE logging out",
                "A1 OK",
            ],
        );
    }

    #[test]
    fn login_then_list_wildcard() {
        let fixture = Fixture::new();
        let out = fixture.session(
            "A0 LOGIN kiki secret\r\n\
             A1 LIST \"\" *\r\n\
             A2 LOGOUT\r\n",
        );
        assert_in_order(
            &out,
            &[
                "A0 OK",
                "* LIST (\\HasNoChildren) \"/\" INBOX\r\n",
                "* LIST (\\HasChildren) \"/\" lists\r\n",
                "* LIST (\\HasNoChildren) \"/\" lists/mja\r\n",
                "A1 OK",
                "A2 OK",
            ],
        );
    }

    #[test]
    fn list_percent_stays_in_level() {
        let fixture = Fixture::new();
        let out = fixture.session(
            "A0 LOGIN kiki secret\r\n\
             A1 LIST \"\" %\r\n\
             A2 LOGOUT\r\n",
        );
        assert_in_order(
            &out,
            &["\"/\" INBOX\r\n", "\"/\" lists\r\n", "A1 OK"],
        );
        assert!(!out.contains("lists/mja"));
    }

    #[test]
    fn literal_plus_append_needs_no_continuation() {
        let fixture = Fixture::new();
        let out = fixture.session(
            "A0 LOGIN kiki secret\r\n\
             A1 APPEND INBOX {10+}\r\n0123456789\r\n\
             A2 LOGOUT\r\n",
        );
        assert_in_order(&out, &["A0 OK", "A1 OK", "A2 OK"]);
        assert!(!out.contains("+ reading literal"), "{}", out);

        // The unparsable content was wrapped and injected anyway.
        assert_eq!(1, fixture.count("SELECT COUNT(*) FROM `messages`"));
        assert_eq!(
            1,
            fixture.count("SELECT COUNT(*) FROM `unparsed_messages`"),
        );
    }

    #[test]
    fn synchronising_literals_get_continuations() {
        let fixture = Fixture::new();
        let out = fixture.session(
            "A1 LOGIN {4}\r\nkiki {6}\r\nsecret\r\n\
             A2 LOGOUT\r\n",
        );
        assert_in_order(
            &out,
            &["+ reading literal", "+ reading literal", "A1 OK", "A2 OK"],
        );
    }

    #[test]
    fn append_parseable_message() {
        let fixture = Fixture::new();
        let message = "Subject: hello\r\n\r\nworld\r\n";
        let out = fixture.session(&format!(
            "A0 LOGIN kiki secret\r\n\
             A1 APPEND INBOX (\\Seen) {{{}}}\r\n{}\r\n\
             A2 LOGOUT\r\n",
            message.len(),
            message,
        ));
        assert_in_order(&out, &["+ reading literal", "A1 OK"]);

        assert_eq!(1, fixture.count("SELECT COUNT(*) FROM `messages`"));
        assert_eq!(1, fixture.count("SELECT COUNT(*) FROM `flags`"));
        assert_eq!(
            0,
            fixture.count("SELECT COUNT(*) FROM `unparsed_messages`"),
        );
    }

    #[test]
    fn idle_until_done() {
        let fixture = Fixture::new();
        let out = fixture.session(
            "A0 LOGIN kiki secret\r\n\
             A1 IDLE\r\n\
             DONE\r\n\
             A2 LOGOUT\r\n",
        );
        assert_in_order(&out, &["+ idling", "A1 OK", "A2 OK"]);
    }

    #[test]
    fn authenticate_abort() {
        let fixture = Fixture::new();
        let out = fixture.session(
            "A1 AUTHENTICATE CRAM-MD5\r\n\
             *\r\n\
             A2 LOGOUT\r\n",
        );
        assert_in_order(
            &out,
            &["+ ", "A1 BAD authentication terminated", "A2 OK"],
        );
    }

    #[test]
    fn select_reports_counts() {
        let fixture = Fixture::new();
        let out = fixture.session(
            "A0 LOGIN kiki secret\r\n\
             A1 SELECT INBOX\r\n\
             A2 CLOSE\r\n\
             A3 LOGOUT\r\n",
        );
        assert_in_order(
            &out,
            &[
                "* 0 EXISTS",
                "* 0 RECENT",
                "* OK [UIDNEXT 1]",
                "A1 OK [READ-WRITE]",
                "A2 OK",
            ],
        );
    }

    #[test]
    fn commands_answer_in_order() {
        let fixture = Fixture::new();
        let out = fixture.session(
            "A0 LOGIN kiki secret\r\n\
             A1 NOOP\r\nA2 NOOP\r\nA3 NOOP\r\n\
             A4 LOGOUT\r\n",
        );
        assert_in_order(&out, &["A0 OK", "A1 OK", "A2 OK", "A3 OK", "A4 OK"]);
    }

    #[test]
    fn state_filter_rejects_early_list() {
        let fixture = Fixture::new();
        let out = fixture.session("A1 LIST \"\" *\r\nA2 LOGOUT\r\n");
        assert_in_order(
            &out,
            &["A1 BAD Not permitted in this state", "A2 OK"],
        );
    }

    #[test]
    fn unknown_commands_get_bad() {
        let fixture = Fixture::new();
        let out = fixture.session("A1 FROBNICATE x\r\nA2 LOGOUT\r\n");
        assert_in_order(
            &out,
            &["A1 BAD No such command: frobnicate", "A2 OK"],
        );
    }

    #[test]
    fn wrong_password_is_no() {
        let fixture = Fixture::new();
        let out =
            fixture.session("A1 LOGIN kiki wrong\r\nA2 LOGOUT\r\n");
        assert_in_order(&out, &["A1 NO Sorry", "A2 OK"]);
    }

    #[test]
    fn pre_login_byte_cap() {
        let fixture = Fixture::new();
        let mut input = String::new();
        for ix in 0..6000 {
            input.push_str(&format!("A{} NOOP\r\n", ix));
        }

        let out = fixture.session(&input);
        assert!(out.contains("* BYE overlong login sequence"), "{}", out);
    }

    #[test]
    fn starttls_unconfigured_is_refused() {
        let fixture = Fixture::new();
        let out =
            fixture.session("A1 STARTTLS\r\nA2 LOGOUT\r\n");
        assert_in_order(&out, &["A1 NO TLS not configured", "A2 OK"]);
    }
}
