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

//! The IMAP command-line parser.
//!
//! The input is one complete command: the command line with any literal
//! contents already spliced in by the framer (a literal appears as
//! `{n}\r\n` followed by exactly n raw bytes). The parser records the first
//! error and returns neutral values from then on; it never unwinds, and the
//! caller checks `ok()` once at the end.

/// Characters that end an atom.
fn atom_special(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'{' | b'}' | b'"' | b'\\' | b'%' | b'*' | b']',
    ) || b <= b' '
        || b >= 127
}

pub struct ImapParser {
    input: Vec<u8>,
    pos: usize,
    error: Option<String>,
}

impl ImapParser {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input,
            pos: 0,
            error: None,
        }
    }

    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> String {
        self.error.clone().unwrap_or_default()
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    /// The byte at the cursor, or NUL at end of input.
    pub fn next_char(&self) -> u8 {
        self.input.get(self.pos).copied().unwrap_or(0)
    }

    /// Advances the cursor one byte.
    pub fn step(&mut self) {
        self.pos += 1;
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// A short extract of the unparsed input, for error messages.
    pub fn following(&self) -> String {
        let rest = &self.input[self.pos.min(self.input.len())..];
        let rest = &rest[..rest.len().min(20)];
        String::from_utf8_lossy(rest).into_owned()
    }

    /// Requires `literal` to appear verbatim at the cursor.
    pub fn require(&mut self, literal: &str) {
        if self.input[self.pos.min(self.input.len())..]
            .starts_with(literal.as_bytes())
        {
            self.pos += literal.len();
        } else {
            self.set_error(format!(
                "Expected {:?}, saw: {}",
                literal,
                self.following(),
            ));
        }
    }

    /// Consumes `literal` if present; returns whether it was.
    pub fn present(&mut self, literal: &str) -> bool {
        if self.input[self.pos.min(self.input.len())..]
            .starts_with(literal.as_bytes())
        {
            self.pos += literal.len();
            true
        } else {
            false
        }
    }

    pub fn space(&mut self) {
        self.require(" ");
    }

    /// Requires that the whole input has been consumed.
    pub fn end(&mut self) {
        if !self.at_end() && self.ok() {
            self.set_error(format!(
                "Trailing garbage: {}",
                self.following(),
            ));
        }
    }

    /// The command tag: any run of non-special characters except `+`.
    pub fn tag(&mut self) -> String {
        let start = self.pos;
        while !self.at_end() {
            let b = self.next_char();
            if atom_special(b) || b'+' == b {
                break;
            }
            self.step();
        }

        if start == self.pos {
            self.set_error(format!("Expected tag, saw: {}", self.following()));
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    /// The command name, returned lowercased. `UID` prefixes are kept as
    /// part of the name.
    pub fn command(&mut self) -> String {
        let mut name = self.atom().to_ascii_lowercase();
        if "uid" == name {
            self.space();
            name.push(' ');
            name.push_str(&self.atom().to_ascii_lowercase());
        }
        name
    }

    pub fn atom(&mut self) -> String {
        let start = self.pos;
        while !self.at_end() && !atom_special(self.next_char()) {
            self.step();
        }

        if start == self.pos {
            self.set_error(format!(
                "Expected atom, saw: {}",
                self.following(),
            ));
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    pub fn number(&mut self) -> u32 {
        let start = self.pos;
        while !self.at_end() && self.next_char().is_ascii_digit() {
            self.step();
        }

        let digits =
            String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        match digits.parse() {
            Ok(n) => n,
            Err(_) => {
                self.set_error(format!(
                    "Expected number, saw: {}",
                    self.following(),
                ));
                0
            },
        }
    }

    /// A quoted string or literal.
    pub fn string(&mut self) -> String {
        String::from_utf8_lossy(&self.string_bytes()).into_owned()
    }

    /// Like `string`, but returns the raw bytes. Literals may carry
    /// arbitrary binary content, which must survive APPEND untouched.
    pub fn string_bytes(&mut self) -> Vec<u8> {
        match self.next_char() {
            b'"' => self.quoted(),
            b'{' => self.literal(),
            _ => {
                self.set_error(format!(
                    "Expected string, saw: {}",
                    self.following(),
                ));
                Vec::new()
            },
        }
    }

    /// An atom, quoted string, or literal.
    pub fn astring(&mut self) -> String {
        match self.next_char() {
            b'"' | b'{' => self.string(),
            _ => self.atom(),
        }
    }

    /// NIL, or a string.
    pub fn nstring(&mut self) -> Option<String> {
        if self.present("NIL") || self.present("nil") {
            None
        } else {
            Some(self.string())
        }
    }

    /// Like an atom, but also admits the `%`, `*`, and `]` wildcard
    /// characters used by LIST and LSUB patterns.
    pub fn list_mailbox(&mut self) -> String {
        if b'"' == self.next_char() || b'{' == self.next_char() {
            return self.string();
        }

        let start = self.pos;
        while !self.at_end() {
            let b = self.next_char();
            if !atom_special(b) || matches!(b, b'%' | b'*' | b']') {
                self.step();
            } else {
                break;
            }
        }

        if start == self.pos {
            self.set_error(format!(
                "Expected list-mailbox, saw: {}",
                self.following(),
            ));
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn quoted(&mut self) -> Vec<u8> {
        self.require("\"");
        let mut out = Vec::new();
        loop {
            match self.next_char() {
                0 => {
                    self.set_error("Unterminated quoted string");
                    break;
                },
                b'"' => {
                    self.step();
                    break;
                },
                b'\\' => {
                    self.step();
                    out.push(self.next_char());
                    self.step();
                },
                b => {
                    out.push(b);
                    self.step();
                },
            }
        }
        out
    }

    /// `{n}\r\n` (or `{n+}\r\n`) followed by exactly n raw bytes, spliced
    /// in by the framer.
    fn literal(&mut self) -> Vec<u8> {
        self.require("{");
        let n = self.number() as usize;
        self.present("+");
        self.require("}");
        self.require("\r\n");
        if !self.ok() {
            return Vec::new();
        }

        if self.input.len() - self.pos < n {
            self.set_error("Literal truncated");
            return Vec::new();
        }

        let out = self.input[self.pos..self.pos + n].to_vec();
        self.pos += n;
        out
    }
}
