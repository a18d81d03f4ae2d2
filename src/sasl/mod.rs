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

//! The SASL challenge/response dialogue, shared between IMAP AUTHENTICATE
//! and SMTP AUTH.
//!
//! The dialogue is mechanism-agnostic: it owns the base64 framing, the `*`
//! abort, initial-response (SASL-IR) handling, and the terminal decision;
//! the mechanism supplies challenges and judges responses. Protocol servers
//! drive it a line at a time, so it suspends naturally wherever the
//! transport does.

pub mod cram_md5;

use log::info;

use self::cram_md5::CramMd5;
use crate::account::users::{self, User};
use crate::db;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MechanismState {
    IssuingChallenge,
    AwaitingInitialResponse,
    AwaitingResponse,
    Authenticating,
    Succeeded,
    Failed,
}

/// The mechanisms we implement.
pub enum Mechanism {
    CramMd5(CramMd5),
}

impl Mechanism {
    pub fn create(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("cram-md5") {
            Some(Self::CramMd5(CramMd5::new()))
        } else {
            None
        }
    }

    /// Whether the mechanism is client-first, i.e. accepts a SASL-IR.
    fn accepts_initial_response(&self) -> bool {
        match *self {
            // CRAM-MD5 is server-first.
            Self::CramMd5(_) => false,
        }
    }

    fn challenge(&mut self, hostname: &str) -> String {
        match *self {
            Self::CramMd5(ref mut m) => m.challenge(hostname),
        }
    }

    fn read_response(&mut self, response: &[u8]) -> bool {
        match *self {
            Self::CramMd5(ref mut m) => m.parse_response(response),
        }
    }

    fn login(&self) -> &str {
        match *self {
            Self::CramMd5(ref m) => m.login(),
        }
    }

    fn verify_secret(&self, stored_secret: &str) -> bool {
        match *self {
            Self::CramMd5(ref m) => m.verify(stored_secret),
        }
    }
}

/// What the protocol server should do next.
pub enum Outcome {
    /// Send `+ <data>` (already base64) and wait for the next line.
    Challenge(String),
    /// Authentication succeeded as this user.
    Succeeded(User),
    /// Authentication failed; the quip is safe to show the client.
    Failed(&'static str),
}

pub struct Dialogue {
    mechanism: Mechanism,
    state: MechanismState,
    allow_anonymous: bool,
}

impl Dialogue {
    pub fn new(mechanism: Mechanism, allow_anonymous: bool) -> Self {
        let state = if mechanism.accepts_initial_response() {
            MechanismState::AwaitingInitialResponse
        } else {
            MechanismState::IssuingChallenge
        };

        Self {
            mechanism,
            state,
            allow_anonymous,
        }
    }

    pub fn state(&self) -> MechanismState {
        self.state
    }

    pub fn done(&self) -> bool {
        matches!(
            self.state,
            MechanismState::Succeeded | MechanismState::Failed,
        )
    }

    /// Begins the dialogue, consuming any SASL-IR the client sent on the
    /// command line.
    pub fn start(
        &mut self,
        hostname: &str,
        initial_response: Option<&str>,
        cxn: &db::Connection,
    ) -> Result<Outcome, Error> {
        match (self.state, initial_response) {
            (MechanismState::AwaitingInitialResponse, Some(ir)) => {
                self.consume_response(ir.as_bytes(), cxn)
            },
            (MechanismState::AwaitingInitialResponse, None)
            | (MechanismState::IssuingChallenge, Some(_)) => {
                // A server-first mechanism cannot take an IR; a client-first
                // one without an IR gets an empty challenge.
                if MechanismState::IssuingChallenge == self.state
                    && initial_response.is_some()
                {
                    self.state = MechanismState::Failed;
                    return Ok(Outcome::Failed(
                        "Mechanism does not accept an initial response",
                    ));
                }
                self.state = MechanismState::AwaitingResponse;
                Ok(Outcome::Challenge(String::new()))
            },
            (MechanismState::IssuingChallenge, None) => {
                let challenge = self.mechanism.challenge(hostname);
                self.state = MechanismState::AwaitingResponse;
                Ok(Outcome::Challenge(base64::encode(challenge)))
            },
            _ => {
                self.state = MechanismState::Failed;
                Ok(Outcome::Failed("Unexpected authentication state"))
            },
        }
    }

    /// Feeds the dialogue the next client line.
    pub fn respond(
        &mut self,
        line: &[u8],
        cxn: &db::Connection,
    ) -> Result<Outcome, Error> {
        if MechanismState::AwaitingResponse != self.state {
            self.state = MechanismState::Failed;
            return Ok(Outcome::Failed("Unexpected authentication state"));
        }

        if b"*" == line {
            self.state = MechanismState::Failed;
            return Ok(Outcome::Failed("authentication terminated"));
        }

        self.consume_response(line, cxn)
    }

    fn consume_response(
        &mut self,
        encoded: &[u8],
        cxn: &db::Connection,
    ) -> Result<Outcome, Error> {
        let Ok(decoded) = base64::decode(encoded) else {
            self.state = MechanismState::Failed;
            return Ok(Outcome::Failed("Invalid base64"));
        };

        if !self.mechanism.read_response(&decoded) {
            self.state = MechanismState::Failed;
            return Ok(Outcome::Failed("Syntax error in credentials"));
        }

        self.state = MechanismState::Authenticating;
        self.verify(cxn)
    }

    fn verify(&mut self, cxn: &db::Connection) -> Result<Outcome, Error> {
        let login = self.mechanism.login().to_owned();
        let user = users::lookup_user(cxn, &login)?;

        let accepted = match user {
            Some(ref user)
                if self.allow_anonymous && "anonymous" == user.login =>
            {
                true
            },
            Some(ref user) => self.mechanism.verify_secret(&user.secret),
            // No detail leaked for unknown logins.
            None => false,
        };

        if accepted {
            self.state = MechanismState::Succeeded;
            info!("Authenticated as user {login}");
            Ok(Outcome::Succeeded(user.expect("checked above")))
        } else {
            self.state = MechanismState::Failed;
            info!("Rejected authentication as user {login}");
            Ok(Outcome::Failed("Sorry"))
        }
    }
}

#[cfg(test)]
mod test {
    use super::cram_md5::hmac_md5_hex;
    use super::*;
    use crate::account::users::testutil::create_user;

    fn challenge_of(outcome: &Outcome) -> String {
        match *outcome {
            Outcome::Challenge(ref c) => {
                String::from_utf8(base64::decode(c).unwrap()).unwrap()
            },
            _ => panic!("expected a challenge"),
        }
    }

    #[test]
    fn cram_md5_round_trip() {
        let cxn = db::Connection::open_in_memory().unwrap();
        create_user(&cxn, "kiki", "s");

        let mut dialogue = Dialogue::new(
            Mechanism::create("CRAM-MD5").unwrap(),
            false,
        );
        let outcome =
            dialogue.start("mail.example.com", None, &cxn).unwrap();
        let challenge = challenge_of(&outcome);

        let digest = hmac_md5_hex("s", &challenge);
        let response = base64::encode(format!("kiki {digest}"));
        match dialogue.respond(response.as_bytes(), &cxn).unwrap() {
            Outcome::Succeeded(user) => assert_eq!("kiki", user.login),
            _ => panic!("authentication should have succeeded"),
        }
        assert_eq!(MechanismState::Succeeded, dialogue.state());
    }

    #[test]
    fn wrong_secret_fails() {
        let cxn = db::Connection::open_in_memory().unwrap();
        create_user(&cxn, "kiki", "s");

        let mut dialogue =
            Dialogue::new(Mechanism::create("cram-md5").unwrap(), false);
        let outcome =
            dialogue.start("mail.example.com", None, &cxn).unwrap();
        let challenge = challenge_of(&outcome);

        let digest = hmac_md5_hex("wrong", &challenge);
        let response = base64::encode(format!("kiki {digest}"));
        match dialogue.respond(response.as_bytes(), &cxn).unwrap() {
            Outcome::Failed("Sorry") => (),
            _ => panic!("authentication should have failed"),
        }
    }

    #[test]
    fn unknown_user_fails_without_detail() {
        let cxn = db::Connection::open_in_memory().unwrap();

        let mut dialogue =
            Dialogue::new(Mechanism::create("cram-md5").unwrap(), false);
        let outcome = dialogue.start("", None, &cxn).unwrap();
        let challenge = challenge_of(&outcome);
        assert!(challenge.ends_with("@oryx.invalid>"));

        let digest = hmac_md5_hex("whatever", &challenge);
        let response = base64::encode(format!("nx {digest}"));
        match dialogue.respond(response.as_bytes(), &cxn).unwrap() {
            Outcome::Failed("Sorry") => (),
            _ => panic!("authentication should have failed"),
        }
    }

    #[test]
    fn star_aborts() {
        let cxn = db::Connection::open_in_memory().unwrap();
        let mut dialogue =
            Dialogue::new(Mechanism::create("cram-md5").unwrap(), false);
        dialogue.start("h.example", None, &cxn).unwrap();

        match dialogue.respond(b"*", &cxn).unwrap() {
            Outcome::Failed("authentication terminated") => (),
            _ => panic!("* should abort"),
        }
        assert!(dialogue.done());
    }

    #[test]
    fn bad_base64_fails() {
        let cxn = db::Connection::open_in_memory().unwrap();
        let mut dialogue =
            Dialogue::new(Mechanism::create("cram-md5").unwrap(), false);
        dialogue.start("h.example", None, &cxn).unwrap();

        match dialogue.respond(b"!!not base64!!", &cxn).unwrap() {
            Outcome::Failed(_) => (),
            _ => panic!("bad base64 should fail"),
        }
    }

    #[test]
    fn server_first_mechanism_rejects_initial_response() {
        let cxn = db::Connection::open_in_memory().unwrap();
        let mut dialogue =
            Dialogue::new(Mechanism::create("cram-md5").unwrap(), false);
        match dialogue.start("h.example", Some("aGk="), &cxn).unwrap() {
            Outcome::Failed(_) => (),
            _ => panic!("IR should be rejected"),
        }
    }

    #[test]
    fn anonymous_when_enabled() {
        let cxn = db::Connection::open_in_memory().unwrap();
        create_user(&cxn, "anonymous", "irrelevant");

        let mut dialogue =
            Dialogue::new(Mechanism::create("cram-md5").unwrap(), true);
        dialogue.start("h.example", None, &cxn).unwrap();

        // Digest doesn't matter for anonymous.
        let response = base64::encode("anonymous 00");
        match dialogue.respond(response.as_bytes(), &cxn).unwrap() {
            Outcome::Succeeded(user) => {
                assert_eq!("anonymous", user.login)
            },
            _ => panic!("anonymous should be allowed"),
        }
    }

    #[test]
    fn unknown_mechanism() {
        assert!(Mechanism::create("plain").is_none());
        assert!(Mechanism::create("CRAM-MD5").is_some());
    }
}
