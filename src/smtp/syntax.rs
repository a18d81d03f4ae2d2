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

//! SMTP/LMTP command-line and envelope-address syntax.

use super::codes::{rc, ReplyCode};
use crate::mime::model::Address;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verb {
    Helo,
    Ehlo,
    Lhlo,
    MailFrom,
    RcptTo,
    Data,
    Rset,
    Noop,
    Help,
    Auth,
    StartTls,
    Quit,
    Unknown(String),
}

/// Splits a command line into its verb and argument.
///
/// `MAIL FROM` and `RCPT TO` are recognised up to the colon, so both
/// `MAIL FROM:<a@b>` and `mail from: <a@b>` parse.
pub fn parse_command_line(line: &str) -> (Verb, String) {
    let line = line.trim_end_matches(['\r', '\n']);
    let word_end = line
        .find(' ')
        .unwrap_or(line.len())
        .min(line.find(':').unwrap_or(line.len()));
    let word = line[..word_end].to_ascii_lowercase();

    let (keyword, arg) = if "mail" == word || "rcpt" == word {
        match line.find(':') {
            Some(colon) => {
                let mut keyword = line[..colon].to_ascii_lowercase();
                keyword = keyword.split_whitespace().collect::<Vec<_>>().join(" ");
                (keyword, line[colon + 1..].to_owned())
            },
            None => (word, String::new()),
        }
    } else {
        let arg = line[word_end..].trim_start().to_owned();
        (word, arg)
    };

    let verb = match keyword.as_str() {
        "helo" => Verb::Helo,
        "ehlo" => Verb::Ehlo,
        "lhlo" => Verb::Lhlo,
        "mail from" => Verb::MailFrom,
        "rcpt to" => Verb::RcptTo,
        "data" => Verb::Data,
        "rset" => Verb::Rset,
        "noop" => Verb::Noop,
        "help" => Verb::Help,
        "auth" => Verb::Auth,
        "starttls" => Verb::StartTls,
        "quit" => Verb::Quit,
        other => Verb::Unknown(other.to_owned()),
    };
    (verb, arg)
}

fn dot_atom_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
                | '.',
        )
}

/// Parses an envelope address argument: `<localpart@domain>`.
///
/// Whitespace before the `<` is tolerated even though RFC 5321 forbids it;
/// too much deployed software emits it. Errors come back as the reply to
/// send.
pub fn parse_address(arg: &str) -> Result<Address, (ReplyCode, String)> {
    let arg = arg.trim_start();
    let Some(rest) = arg.strip_prefix('<') else {
        return Err((
            rc::BadSequenceOfCommands,
            format!("Must have '<' before address {}", arg),
        ));
    };

    let local_end =
        rest.find(|c| !dot_atom_char(c)).unwrap_or(rest.len());
    let localpart = &rest[..local_end];
    if localpart.is_empty() {
        return Err((
            rc::BadSequenceOfCommands,
            "Empty localparts are not allowed".to_owned(),
        ));
    }

    let rest = &rest[local_end..];
    let Some(rest) = rest.strip_prefix('@') else {
        return Err((
            rc::BadSequenceOfCommands,
            "Need @ between localpart and domain".to_owned(),
        ));
    };

    let domain_end =
        rest.find(|c| !dot_atom_char(c)).unwrap_or(rest.len());
    let domain = &rest[..domain_end];
    if domain.is_empty() {
        return Err((
            rc::BadSequenceOfCommands,
            "Empty domains are not allowed".to_owned(),
        ));
    }

    if !rest[domain_end..].starts_with('>') {
        return Err((
            rc::BadSequenceOfCommands,
            format!("Need > after address {}", arg),
        ));
    }

    Ok(Address::new("", localpart, domain))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_lines() {
        assert_eq!(
            (Verb::Helo, "mx.example.com".to_owned()),
            parse_command_line("HELO mx.example.com\r\n"),
        );
        assert_eq!(
            (Verb::MailFrom, "<a@x>".to_owned()),
            parse_command_line("MAIL FROM:<a@x>"),
        );
        assert_eq!(
            (Verb::RcptTo, " <u@local>".to_owned()),
            parse_command_line("rcpt  To: <u@local>"),
        );
        assert_eq!(
            (Verb::Quit, String::new()),
            parse_command_line("QUIT"),
        );
        assert_eq!(
            (Verb::Unknown("frob".to_owned()), "x".to_owned()),
            parse_command_line("FROB x"),
        );
    }

    #[test]
    fn good_addresses() {
        assert_eq!(
            Address::new("", "a", "x"),
            parse_address("<a@x>").unwrap(),
        );
        // Tolerated leading whitespace
        assert_eq!(
            Address::new("", "kiki", "example.com"),
            parse_address("  <kiki@example.com>").unwrap(),
        );
        assert_eq!(
            Address::new("", "a.b+c", "mx.example.org"),
            parse_address("<a.b+c@mx.example.org> SIZE=100").unwrap(),
        );
    }

    #[test]
    fn bad_addresses() {
        let must_have = parse_address("a@x").unwrap_err();
        assert_eq!(rc::BadSequenceOfCommands, must_have.0);
        assert!(must_have.1.starts_with("Must have '<'"));

        assert_eq!(
            "Empty localparts are not allowed",
            parse_address("<@x>").unwrap_err().1,
        );
        assert_eq!(
            "Need @ between localpart and domain",
            parse_address("<a>").unwrap_err().1,
        );
        assert_eq!(
            "Empty domains are not allowed",
            parse_address("<a@>").unwrap_err().1,
        );
        assert!(parse_address("<a@x")
            .unwrap_err()
            .1
            .starts_with("Need > after address"));
    }
}
