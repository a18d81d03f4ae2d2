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

//! The SMTP/LMTP server: envelope acquisition, DATA accumulation, and
//! message injection.
//!
//! This is not an MTA; it accepts messages for local mailboxes (spooling
//! a copy for any remote recipients) and never relays. LMTP differs from
//! SMTP in its greeting verb (LHLO) and in emitting one DATA completion
//! response per recipient rather than a single aggregate one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::prelude::*;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use super::codes::{rc, ReplyCode};
use super::syntax::{parse_address, parse_command_line, Verb};
use crate::account::users::{self, User};
use crate::context::Context;
use crate::db::{self, types::*};
use crate::inject::injector::{Injection, Injector};
use crate::mime::model::{Address, FieldType};
use crate::mime::parse::{parse_message, wrap_unparsable};
use crate::sasl::{Dialogue, Mechanism, Outcome};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::MessageCopyMode;

/// RFC 5321 allows much less, but extensions stretch lines; beyond this we
/// give up on the connection entirely.
const MAX_LINE: usize = 32 * 1024;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(1800);

/// Sequence number distinguishing message-copy files written in the same
/// second by this process.
static COPY_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub trait AsyncRw: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncRw for T {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Initial,
    MailFrom,
    RcptTo,
    Data,
    Body,
    Verifying,
    Injecting,
}

/// The envelope sender.
enum Sender {
    Bounce,
    Address(Address),
}

impl Sender {
    fn return_path(&self) -> String {
        match *self {
            Sender::Bounce => "<>".to_owned(),
            Sender::Address(ref a) => format!("<{}>", a.lp_domain()),
        }
    }
}

struct Recipient {
    address: Address,
    mailbox: MailboxId,
    mailbox_name: String,
}

pub struct SmtpServer {
    io: BufStream<Box<dyn AsyncRw>>,
    ctx: Arc<Context>,
    cxn: db::Connection,
    log_prefix: LogPrefix,
    lmtp: bool,
    /// The peer, as reported in synthesised Received headers.
    peer: String,
    /// The underlying socket, retained for the TLS bridge.
    tcp: Option<std::net::TcpStream>,

    state: State,
    helo: String,
    protocol: &'static str,
    sender: Option<Sender>,
    recipients: Vec<Recipient>,
    body: Vec<u8>,
    authenticated: Option<User>,
    tls_active: bool,

    /// The accumulated reply: final code plus the lines gathered so far.
    code: Option<ReplyCode>,
    lines: Vec<String>,
    quit: bool,
}

impl SmtpServer {
    pub fn new(
        io: Box<dyn AsyncRw>,
        ctx: Arc<Context>,
        cxn: db::Connection,
        log_prefix: LogPrefix,
        lmtp: bool,
        peer: String,
    ) -> Self {
        let protocol = if lmtp { "lmtp" } else { "smtp" };
        Self {
            io: BufStream::new(io),
            ctx,
            cxn,
            log_prefix,
            lmtp,
            peer,
            tcp: None,
            state: State::Initial,
            helo: String::new(),
            protocol,
            sender: None,
            recipients: Vec::new(),
            body: Vec::new(),
            authenticated: None,
            tls_active: false,
            code: None,
            lines: Vec::new(),
            quit: false,
        }
    }

    /// Supplies the raw socket so STARTTLS can hand it to the TLS bridge.
    pub fn set_socket(&mut self, socket: std::net::TcpStream) {
        self.tcp = Some(socket);
    }

    pub async fn run(&mut self) -> Result<(), Error> {
        self.respond(
            rc::ServiceReady,
            &format!(
                "{} {} Petramap ready",
                self.ctx.config.hostname,
                if self.lmtp { "LMTP" } else { "ESMTP" },
            ),
        );
        self.send_responses().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            buffer.clear();
            let nread = match tokio::time::timeout(
                COMMAND_TIMEOUT,
                (&mut self.io)
                    .take(MAX_LINE as u64)
                    .read_until(b'\n', &mut buffer),
            )
            .await
            {
                Err(_) => {
                    info!("{} Idle timeout", self.log_prefix);
                    self.write_line(
                        rc::ServiceNotAvailableClosing,
                        "Timeout",
                    )
                    .await?;
                    break;
                },
                Ok(result) => result?,
            };
            if 0 == nread {
                break;
            }

            if !buffer.ends_with(b"\n") {
                if buffer.len() >= MAX_LINE {
                    warn!("{} Connection closed: overlong line", self.log_prefix);
                    self.write_line(
                        rc::CommandSyntaxError,
                        "Line too long",
                    )
                    .await?;
                }
                break;
            }

            buffer.pop();
            if buffer.ends_with(b"\r") {
                buffer.pop();
            }

            if State::Body == self.state {
                if self.body_line(&buffer) {
                    self.inject().await?;
                }
            } else {
                let line =
                    String::from_utf8_lossy(&buffer).into_owned();
                self.dispatch(&line).await?;
            }

            if self.code.is_some() {
                self.send_responses().await?;
            }
        }

        self.io.flush().await?;
        Ok(())
    }

    async fn dispatch(&mut self, line: &str) -> Result<(), Error> {
        let (verb, arg) = parse_command_line(line);
        match verb {
            Verb::Helo => self.cmd_helo(&arg),
            Verb::Ehlo => self.cmd_ehlo(&arg),
            Verb::Lhlo => self.cmd_lhlo(&arg),
            Verb::MailFrom => self.cmd_mail(&arg),
            Verb::RcptTo => self.cmd_rcpt(&arg),
            Verb::Data => self.cmd_data(),
            Verb::Rset => self.cmd_rset(),
            Verb::Noop => self.respond(rc::Ok, "Fine."),
            Verb::Help => self.respond(
                rc::HelpMessage,
                "Commands: HELO EHLO MAIL RCPT DATA RSET NOOP QUIT",
            ),
            Verb::Auth => return self.cmd_auth(&arg).await,
            Verb::StartTls => return self.cmd_starttls().await,
            Verb::Quit => {
                self.quit = true;
                self.respond(rc::ServiceClosing, "Have a nice day.");
            },
            Verb::Unknown(name) => self.respond(
                rc::CommandSyntaxError,
                &format!(
                    "Unknown command ({})",
                    name.to_ascii_uppercase(),
                ),
            ),
        }
        Ok(())
    }

    fn helo_permitted(&mut self) -> bool {
        if !matches!(self.state, State::Initial | State::MailFrom) {
            self.respond(
                rc::BadSequenceOfCommands,
                "HELO permitted initially only",
            );
            return false;
        }
        true
    }

    fn set_helo(&mut self, arg: &str) {
        self.helo = arg
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_owned();
        self.log_prefix.set_helo(self.helo.clone());
    }

    fn cmd_helo(&mut self, arg: &str) {
        if self.lmtp {
            self.respond(
                rc::CommandSyntaxError,
                "This is LMTP, not SMTP. Please use LHLO.",
            );
            return;
        }
        if !self.helo_permitted() {
            return;
        }

        self.set_helo(arg);
        self.respond(rc::Ok, &self.ctx.config.hostname.clone());
        self.state = State::MailFrom;
    }

    fn cmd_ehlo(&mut self, arg: &str) {
        if self.lmtp {
            self.cmd_helo(arg);
            return;
        }
        if !self.helo_permitted() {
            return;
        }

        self.set_helo(arg);
        self.extended_greeting();
        self.state = State::MailFrom;
        self.protocol = "esmtp";
    }

    fn cmd_lhlo(&mut self, arg: &str) {
        if !self.lmtp {
            self.respond(
                rc::CommandSyntaxError,
                "You seem to be speaking LMTP, not SMTP",
            );
            return;
        }
        if !self.helo_permitted() {
            return;
        }

        self.set_helo(arg);
        self.extended_greeting();
        self.state = State::MailFrom;
        self.protocol = "lmtp";
    }

    fn extended_greeting(&mut self) {
        self.respond(rc::Ok, &self.ctx.config.hostname.clone());
        self.respond(rc::Ok, "DSN");
        if self.ctx.config.tls.is_some() && !self.tls_active {
            self.respond(rc::Ok, "STARTTLS");
        }
        self.respond(rc::Ok, "AUTH CRAM-MD5");
    }

    fn cmd_rset(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.body.clear();
        self.state = State::MailFrom;
        self.respond(rc::Ok, "State reset");
    }

    fn cmd_mail(&mut self, arg: &str) {
        if State::MailFrom != self.state {
            self.respond(
                rc::BadSequenceOfCommands,
                "Bad sequence of commands",
            );
            return;
        }

        self.recipients.clear();
        if arg.trim_start().starts_with("<>") {
            info!("{} Received message from <>", self.log_prefix);
            self.sender = Some(Sender::Bounce);
            self.respond(rc::Ok, "Accepted message from mailer-daemon");
            self.state = State::RcptTo;
            return;
        }

        match parse_address(arg) {
            Ok(address) => {
                info!(
                    "{} Received message from {}",
                    self.log_prefix, address,
                );
                self.respond(
                    rc::Ok,
                    &format!("Accepted message from {}", address),
                );
                self.sender = Some(Sender::Address(address));
                self.state = State::RcptTo;
            },
            Err((code, text)) => self.respond(code, &text),
        }
    }

    fn cmd_rcpt(&mut self, arg: &str) {
        if !matches!(self.state, State::RcptTo | State::Data) {
            self.respond(
                rc::BadSequenceOfCommands,
                "Must specify sender before recipient(s)",
            );
            return;
        }

        let address = match parse_address(arg) {
            Ok(address) => address,
            Err((code, text)) => {
                self.respond(code, &text);
                return;
            },
        };

        // The user lookup; the transaction is suspended until it answers.
        self.state = State::Verifying;
        let looked_up = users::lookup_recipient(
            &self.cxn,
            &address.localpart,
            &address.domain,
        )
        .and_then(|mailbox| match mailbox {
            None => Ok(None),
            Some(mailbox) => {
                self.ctx.store.obtain_by_id(&self.cxn, mailbox)?;
                Ok(self
                    .ctx
                    .store
                    .name(mailbox)
                    .map(|name| (mailbox, name)))
            },
        });
        self.rcpt_answer(address, looked_up);
    }

    /// Completes RCPT once the user lookup has answered.
    fn rcpt_answer(
        &mut self,
        address: Address,
        looked_up: Result<Option<(MailboxId, String)>, Error>,
    ) {
        match looked_up {
            Ok(Some((mailbox, mailbox_name))) => {
                info!(
                    "{} Delivering message to {}",
                    self.log_prefix,
                    address.lp_domain(),
                );
                self.respond(
                    rc::Ok,
                    &format!("Will send to {}", address.lp_domain()),
                );
                self.recipients.push(Recipient {
                    address,
                    mailbox,
                    mailbox_name,
                });
                self.state = State::Data;
            },
            Ok(None) => {
                self.respond(
                    rc::ActionNotTakenPermanent,
                    &format!(
                        "{} is not a legal destination address",
                        address.lp_domain(),
                    ),
                );
                self.state = self.state_after_failed_rcpt();
            },
            Err(e) => {
                self.respond(rc::ActionAborted, &e.to_string());
                self.state = self.state_after_failed_rcpt();
            },
        }
    }

    fn state_after_failed_rcpt(&self) -> State {
        if self.recipients.is_empty() {
            State::RcptTo
        } else {
            State::Data
        }
    }

    fn cmd_data(&mut self) {
        if State::Data != self.state {
            self.respond(
                rc::BadSequenceOfCommands,
                "Bad sequence of commands",
            );
            return;
        }

        self.respond(
            rc::StartMailInput,
            &format!("Go ahead ({} recipients)", self.recipients.len()),
        );
        self.state = State::Body;
    }

    /// Appends one line to the body, undoing dot-stuffing. Returns true
    /// when the terminating `.` was seen.
    fn body_line(&mut self, line: &[u8]) -> bool {
        if b"." == line {
            return true;
        }

        let line = line.strip_prefix(b".").unwrap_or(line);
        self.body.extend_from_slice(line);
        self.body.extend_from_slice(b"\r\n");
        false
    }

    async fn cmd_starttls(&mut self) -> Result<(), Error> {
        if self.tls_active {
            self.respond(rc::CommandNotImplemented, "Already using TLS");
            return Ok(());
        }
        let Some(ref tls_config) = self.ctx.config.tls else {
            self.respond(
                rc::ActionNotTakenPermanent,
                "TLS not configured",
            );
            return Ok(());
        };
        let Some(socket) = self.tcp.take() else {
            self.respond(
                rc::ActionNotTakenPermanent,
                "TLS not available on this transport",
            );
            return Ok(());
        };

        let acceptor =
            Arc::new(crate::net::tls::build_acceptor(tls_config)?);
        self.respond(rc::ServiceReady, "Start negotiating TLS now.");
        self.send_responses().await?;
        self.io.flush().await?;

        info!("{} Start TLS handshake", self.log_prefix);
        let plain = crate::net::tls::start(acceptor, socket)?;
        plain.set_nonblocking(true)?;
        let plain = tokio::net::UnixStream::from_std(plain)?;
        self.io = BufStream::new(Box::new(plain));
        self.tls_active = true;
        self.state = State::Initial;
        Ok(())
    }

    async fn cmd_auth(&mut self, arg: &str) -> Result<(), Error> {
        if self.authenticated.is_some() {
            self.respond(
                rc::BadSequenceOfCommands,
                "Already authenticated",
            );
            return Ok(());
        }

        let mut parts = arg.split_whitespace();
        let mechanism = parts.next().unwrap_or_default();
        let initial_response = parts.next();

        let Some(mechanism) = Mechanism::create(mechanism) else {
            self.respond(
                rc::CommandParameterNotImplemented,
                "Unsupported AUTH mechanism",
            );
            return Ok(());
        };

        let mut dialogue = Dialogue::new(
            mechanism,
            self.ctx.config.security.allow_anonymous,
        );
        let mut outcome = dialogue.start(
            &self.ctx.config.hostname,
            initial_response,
            &self.cxn,
        )?;

        loop {
            match outcome {
                Outcome::Challenge(challenge) => {
                    self.write_line(rc::ServerChallenge, &challenge)
                        .await?;

                    let mut buffer = Vec::new();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', &mut buffer)
                        .await?;
                    if !buffer.ends_with(b"\n") {
                        self.respond(
                            rc::CommandSyntaxError,
                            "Authentication line too long",
                        );
                        self.quit = true;
                        return Ok(());
                    }
                    buffer.pop();
                    if buffer.ends_with(b"\r") {
                        buffer.pop();
                    }

                    outcome = dialogue.respond(&buffer, &self.cxn)?;
                },
                Outcome::Succeeded(user) => {
                    self.log_prefix.set_user(user.login.clone());
                    self.authenticated = Some(user);
                    self.respond(rc::AuthenticationSucceeded, "OK");
                    return Ok(());
                },
                Outcome::Failed(quip) => {
                    let code = if "authentication terminated" == quip {
                        rc::ParameterSyntaxError
                    } else {
                        rc::AuthenticationCredentialsInvalid
                    };
                    self.respond(code, quip);
                    return Ok(());
                },
            }
        }
    }

    /// Builds and injects the received message, then reports completion:
    /// one aggregate response for SMTP, one response per recipient for
    /// LMTP.
    async fn inject(&mut self) -> Result<(), Error> {
        self.state = State::Injecting;

        let now = Utc::now();
        let received = format!(
            "Received: from {} (HELO {}) by {} with {}; {}\r\n",
            self.peer,
            self.helo,
            self.ctx.config.hostname,
            self.protocol,
            now.to_rfc2822(),
        );

        let mut raw =
            Vec::with_capacity(received.len() + self.body.len());
        raw.extend_from_slice(received.as_bytes());
        raw.extend_from_slice(&self.body);

        if self.lmtp {
            // Each recipient gets its own injection and its own final
            // response line.
            let mut results = Vec::new();
            for ix in 0..self.recipients.len() {
                let mailbox = self.recipients[ix].mailbox;
                let injector = self.inject_into(&raw, vec![mailbox], now);
                let outcome = if injector.failed() {
                    (
                        rc::ActionAborted,
                        format!(
                            "{}: {}",
                            self.recipients[ix].address.lp_domain(),
                            injector.error(),
                        ),
                        true,
                    )
                } else {
                    (
                        rc::Ok,
                        format!(
                            "{}: injected into {}",
                            self.recipients[ix].address.lp_domain(),
                            self.recipients[ix].mailbox_name,
                        ),
                        false,
                    )
                };
                results.push(outcome);
            }

            let any_failed = results.iter().any(|r| r.2);
            self.write_copy(any_failed);
            for (code, text, _) in results {
                self.write_line(code, &text).await?;
            }
        } else {
            let mailboxes: Vec<MailboxId> =
                self.recipients.iter().map(|r| r.mailbox).collect();
            let injector = self.inject_into(&raw, mailboxes, now);
            if injector.failed() {
                self.respond(rc::ActionAborted, &injector.error());
                self.write_copy(true);
            } else {
                self.respond(rc::Ok, "Done");
                self.write_copy(false);
            }
        }

        self.sender = None;
        self.recipients.clear();
        self.body.clear();
        self.state = State::MailFrom;
        Ok(())
    }

    fn inject_into(
        &mut self,
        raw: &[u8],
        mailboxes: Vec<MailboxId>,
        now: DateTime<Utc>,
    ) -> Injector {
        let (mut message, wrapped) = match parse_message(raw) {
            Ok(message) => (message, false),
            Err(e) => (wrap_unparsable(raw, &e.to_string()), true),
        };

        // The envelope sender is authoritative for Return-Path.
        let return_path = self
            .sender
            .as_ref()
            .map(Sender::return_path)
            .unwrap_or_else(|| "<>".to_owned());
        message.header.remove_field(FieldType::ReturnPath);
        message.header.add_front("Return-Path", &return_path);
        message.internal_date = Some(now);

        let mut injection = Injection::new(message, mailboxes);
        injection.wrapped = wrapped;
        if let Some(Sender::Address(ref address)) = self.sender {
            injection.sender = Some(address.clone());
        }

        let mut injector = Injector::new(injection);
        injector.execute(
            &mut self.cxn,
            &self.ctx.store,
            &self.ctx.caches,
            &self.ctx.config.spool_mailbox,
        );
        if injector.failed() {
            self.log_failed_injection(&injector);
        } else {
            injector.announce(&self.ctx.store, &self.ctx.cluster);
        }
        injector
    }

    fn log_failed_injection(&self, injector: &Injector) {
        error!(
            "{} Injection failed: {}",
            self.log_prefix,
            injector.error(),
        );
    }

    /// Writes a copy of the message to the message-copy directory when the
    /// configured mode calls for it.
    fn write_copy(&self, failed: bool) {
        let config = &self.ctx.config.message_copy;
        let wanted = match config.mode {
            MessageCopyMode::None => false,
            MessageCopyMode::All => true,
            MessageCopyMode::Delivered => !failed,
            MessageCopyMode::Errors => failed,
        };
        if !wanted {
            return;
        }

        let mut name = format!(
            "{}-{}-{}",
            Utc::now().timestamp(),
            std::process::id(),
            COPY_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        );
        if failed {
            name.push_str("-err");
        }
        let path = config.directory.join(name);

        let mut contents = Vec::new();
        contents.extend_from_slice(b"From: ");
        contents.extend_from_slice(
            self.sender
                .as_ref()
                .map(Sender::return_path)
                .unwrap_or_else(|| "<>".to_owned())
                .as_bytes(),
        );
        contents.extend_from_slice(b"\n");
        for recipient in &self.recipients {
            contents.extend_from_slice(
                format!("To: {}\n", recipient.address.lp_domain())
                    .as_bytes(),
            );
        }
        if failed {
            contents.extend_from_slice(b"Error: injection failed\n");
        }
        contents.extend_from_slice(b"\n");
        contents.extend_from_slice(&self.body);

        if let Err(e) = std::fs::write(&path, contents) {
            error!(
                "{} Could not write message copy {}: {}",
                self.log_prefix,
                path.display(),
                e,
            );
        }
    }

    /// Adds a line to the pending reply. The last code set becomes the
    /// reply's code.
    fn respond(&mut self, code: ReplyCode, text: &str) {
        self.code = Some(code);
        if !text.is_empty() {
            self.lines.push(text.to_owned());
        }
    }

    /// Sends the reply built up by `respond` calls, multi-line style: all
    /// lines but the last continue with `-`.
    async fn send_responses(&mut self) -> Result<(), Error> {
        let code = self.code.take().unwrap_or(rc::Ok) as u16;
        let mut lines = std::mem::take(&mut self.lines);
        if lines.is_empty() {
            lines.push("OK".to_owned());
        }

        let total = lines.len();
        for (ix, line) in lines.into_iter().enumerate() {
            let separator = if ix + 1 == total { ' ' } else { '-' };
            self.io
                .write_all(
                    format!("{}{}{}\r\n", code, separator, line)
                        .as_bytes(),
                )
                .await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Writes a single complete response line, bypassing the accumulator.
    async fn write_line(
        &mut self,
        code: ReplyCode,
        text: &str,
    ) -> Result<(), Error> {
        if code == rc::ServiceNotAvailableClosing {
            self.quit = true;
        }
        self.io
            .write_all(
                format!("{} {}\r\n", code as u16, text).as_bytes(),
            )
            .await?;
        self.io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tokio::io::BufReader;

    use super::*;
    use crate::account::users::testutil::create_user;
    use crate::sasl::cram_md5::hmac_md5_hex;
    use crate::support::system_config::SystemConfig;

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
            create_user(&cxn, "u1", "s1");
            create_user(&cxn, "u2", "s2");

            Self {
                ctx,
                _tmpdir: tmpdir,
            }
        }

        fn spawn(
            &self,
            lmtp: bool,
        ) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<()>) {
            let (client, server_io) = tokio::io::duplex(1 << 16);
            let ctx = Arc::clone(&self.ctx);
            let cxn = ctx.open_db().unwrap();
            let mut server = SmtpServer::new(
                Box::new(server_io),
                ctx,
                cxn,
                LogPrefix::new(
                    if lmtp { "lmtp" } else { "smtp" },
                    "test".to_owned(),
                ),
                lmtp,
                "192.0.2.9".to_owned(),
            );
            let task = tokio::spawn(async move {
                let _ = server.run().await;
            });
            (client, task)
        }

        /// Feeds the whole script, then returns everything the server said.
        async fn session(&self, lmtp: bool, script: &str) -> String {
            let (client, task) = self.spawn(lmtp);
            let (mut rd, mut wr) = tokio::io::split(client);

            wr.write_all(script.as_bytes()).await.unwrap();
            wr.shutdown().await.unwrap();

            let mut out = String::new();
            rd.read_to_string(&mut out).await.unwrap();
            task.await.unwrap();
            out
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

    #[tokio::test]
    async fn smtp_mail_transaction() {
        let fixture = Fixture::new();
        let out = fixture
            .session(
                false,
                "HELO h\r\n\
                 MAIL FROM:<a@x>\r\n\
                 RCPT TO:<kiki@local>\r\n\
                 DATA\r\n\
                 Subject: t\r\n\
                 \r\n\
                 hi\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;

        assert_in_order(
            &out,
            &[
                "220 mail.example.com ESMTP",
                "250 mail.example.com",
                "250 Accepted message from a@x",
                "250 Will send to kiki@local",
                "354 Go ahead (1 recipients)",
                "250 Done",
                "221 Have a nice day.",
            ],
        );

        assert_eq!(1, fixture.count("SELECT COUNT(*) FROM `messages`"));
        // Return-Path was replaced from the envelope and decomposed as an
        // address field; a Received header was synthesised.
        assert_eq!(
            1,
            fixture.count(
                "SELECT COUNT(*) FROM `address_fields` WHERE `field` = 5",
            ),
        );
        assert_eq!(
            1,
            fixture.count(
                "SELECT COUNT(*) FROM `header_fields` WHERE `field` = 28",
            ),
        );
    }

    #[tokio::test]
    async fn ehlo_advertises_extensions() {
        let fixture = Fixture::new();
        let out = fixture.session(false, "EHLO h\r\nQUIT\r\n").await;
        assert_in_order(
            &out,
            &["250-mail.example.com", "250-DSN", "250 AUTH CRAM-MD5"],
        );
    }

    #[tokio::test]
    async fn lmtp_gives_one_response_per_recipient() {
        let fixture = Fixture::new();
        let out = fixture
            .session(
                true,
                "LHLO h\r\n\
                 MAIL FROM:<>\r\n\
                 RCPT TO:<u1@local>\r\n\
                 RCPT TO:<u2@local>\r\n\
                 DATA\r\n\
                 Subject: t\r\n\
                 \r\n\
                 hi\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;

        assert_in_order(
            &out,
            &[
                "220 mail.example.com LMTP",
                "250 Accepted message from mailer-daemon",
                "250 u1@local: injected into /users/u1/INBOX",
                "250 u2@local: injected into /users/u2/INBOX",
            ],
        );
        assert_eq!(2, fixture.count("SELECT COUNT(*) FROM `messages`"));
    }

    #[tokio::test]
    async fn wrong_greeting_verb_is_rejected() {
        let fixture = Fixture::new();
        let out = fixture.session(false, "LHLO h\r\nQUIT\r\n").await;
        assert_in_order(
            &out,
            &["500 You seem to be speaking LMTP, not SMTP"],
        );

        let out = fixture.session(true, "HELO h\r\nQUIT\r\n").await;
        assert_in_order(
            &out,
            &["500 This is LMTP, not SMTP. Please use LHLO."],
        );
    }

    #[tokio::test]
    async fn commands_out_of_sequence() {
        let fixture = Fixture::new();
        let out = fixture
            .session(
                false,
                "HELO h\r\n\
                 RCPT TO:<kiki@local>\r\n\
                 DATA\r\n\
                 MAIL FROM:<a@x>\r\n\
                 MAIL FROM:<a@x>\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_in_order(
            &out,
            &[
                "503 Must specify sender before recipient(s)",
                "503 Bad sequence of commands",
                "250 Accepted message from a@x",
                "503 Bad sequence of commands",
                "221",
            ],
        );
    }

    #[tokio::test]
    async fn unknown_recipients_are_refused() {
        let fixture = Fixture::new();
        let out = fixture
            .session(
                false,
                "HELO h\r\n\
                 MAIL FROM:<a@x>\r\n\
                 RCPT TO:<nobody@local>\r\n\
                 DATA\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_in_order(
            &out,
            &[
                "550 nobody@local is not a legal destination address",
                // No valid recipient, so DATA is still out of sequence
                "503 Bad sequence of commands",
            ],
        );
    }

    #[tokio::test]
    async fn rset_preserves_helo() {
        let fixture = Fixture::new();
        let out = fixture
            .session(
                false,
                "HELO h\r\n\
                 MAIL FROM:<a@x>\r\n\
                 RSET\r\n\
                 MAIL FROM:<b@y>\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_in_order(
            &out,
            &[
                "250 State reset",
                "250 Accepted message from b@y",
            ],
        );
    }

    #[tokio::test]
    async fn envelope_address_syntax() {
        let fixture = Fixture::new();
        let out = fixture
            .session(
                false,
                "HELO h\r\n\
                 MAIL FROM:x\r\n\
                 MAIL FROM:<@x>\r\n\
                 MAIL FROM:<a>\r\n\
                 MAIL FROM:<a@>\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_in_order(
            &out,
            &[
                "503 Must have '<' before address x",
                "503 Empty localparts are not allowed",
                "503 Need @ between localpart and domain",
                "503 Empty domains are not allowed",
            ],
        );
    }

    #[tokio::test]
    async fn dot_stuffing_is_undone() {
        let fixture = Fixture::new();
        let out = fixture
            .session(
                false,
                "HELO h\r\n\
                 MAIL FROM:<a@x>\r\n\
                 RCPT TO:<kiki@local>\r\n\
                 DATA\r\n\
                 Subject: t\r\n\
                 \r\n\
                 ..dot\r\n\
                 .\r\n\
                 QUIT\r\n",
            )
            .await;
        assert_in_order(&out, &["250 Done"]);

        let text: String = fixture
            .ctx
            .open_db()
            .unwrap()
            .cxn
            .query_row("SELECT `text` FROM `bodyparts`", (), scalar)
            .unwrap();
        assert_eq!(".dot\r\n", text);
    }

    #[tokio::test]
    async fn overlong_lines_are_fatal() {
        let fixture = Fixture::new();
        let script = format!("HELO h\r\n{}", "x".repeat(40 * 1024));
        let out = fixture.session(false, &script).await;
        assert_in_order(&out, &["500 Line too long"]);
    }

    #[tokio::test]
    async fn auth_cram_md5_round_trip() {
        let fixture = Fixture::new();
        let (client, task) = fixture.spawn(false);
        let (rd, mut wr) = tokio::io::split(client);
        let mut rd = BufReader::new(rd);

        async fn line(
            rd: &mut (impl AsyncBufReadExt + Unpin),
        ) -> String {
            let mut s = String::new();
            rd.read_line(&mut s).await.unwrap();
            s
        }

        assert!(line(&mut rd).await.starts_with("220 "));
        wr.write_all(b"EHLO h\r\n").await.unwrap();
        loop {
            let l = line(&mut rd).await;
            if !l.starts_with("250-") {
                break;
            }
        }

        wr.write_all(b"AUTH CRAM-MD5\r\n").await.unwrap();
        let challenge_line = line(&mut rd).await;
        assert!(challenge_line.starts_with("334 "), "{}", challenge_line);
        let challenge =
            base64::decode(challenge_line[4..].trim()).unwrap();
        let challenge = String::from_utf8(challenge).unwrap();
        assert!(challenge.ends_with("@mail.example.com>"));

        let digest = hmac_md5_hex("secret", &challenge);
        let response = base64::encode(format!("kiki {digest}"));
        wr.write_all(format!("{}\r\n", response).as_bytes())
            .await
            .unwrap();
        assert!(line(&mut rd).await.starts_with("235 "));

        wr.write_all(b"QUIT\r\n").await.unwrap();
        wr.shutdown().await.unwrap();
        let mut rest = String::new();
        rd.read_to_string(&mut rest).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn auth_abort_and_failure() {
        let fixture = Fixture::new();
        let (client, task) = fixture.spawn(false);
        let (rd, mut wr) = tokio::io::split(client);
        let mut rd = BufReader::new(rd);

        let mut greeting = String::new();
        rd.read_line(&mut greeting).await.unwrap();

        wr.write_all(b"AUTH CRAM-MD5\r\n*\r\n").await.unwrap();
        let mut challenge = String::new();
        rd.read_line(&mut challenge).await.unwrap();
        assert!(challenge.starts_with("334 "));
        let mut aborted = String::new();
        rd.read_line(&mut aborted).await.unwrap();
        assert!(aborted.starts_with("501 "), "{}", aborted);

        // A wrong digest earns 535.
        wr.write_all(b"AUTH CRAM-MD5\r\n").await.unwrap();
        let mut challenge = String::new();
        rd.read_line(&mut challenge).await.unwrap();
        let response = base64::encode("kiki 00ff");
        wr.write_all(format!("{}\r\n", response).as_bytes())
            .await
            .unwrap();
        let mut failed = String::new();
        rd.read_line(&mut failed).await.unwrap();
        assert!(failed.starts_with("535 "), "{}", failed);

        wr.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_commands() {
        let fixture = Fixture::new();
        let out = fixture.session(false, "FROB x\r\nQUIT\r\n").await;
        assert_in_order(&out, &["500 Unknown command (FROB)", "221"]);
    }
}
