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

//! The structural model of a parsed message: a root header plus a tree of
//! body parts, flattened in the RFC 3501 §6.4.5 depth-first order the part
//! numbers are assigned against.

use std::fmt;

use chrono::prelude::*;

/// Header field classification.
///
/// The discriminant doubles as the field id written to `header_fields` when
/// the name is not in the `field_names` dictionary. Everything at or below
/// `ResentBcc` carries addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum FieldType {
    From = 1,
    ResentFrom = 2,
    Sender = 3,
    ResentSender = 4,
    ReturnPath = 5,
    ReplyTo = 6,
    To = 7,
    Cc = 8,
    Bcc = 9,
    ResentTo = 10,
    ResentCc = 11,
    ResentBcc = 12,
    MessageId = 13,
    ResentMessageId = 14,
    InReplyTo = 15,
    References = 16,
    Date = 17,
    ResentDate = 18,
    Subject = 19,
    Comments = 20,
    Keywords = 21,
    ContentType = 22,
    ContentTransferEncoding = 23,
    ContentDisposition = 24,
    ContentDescription = 25,
    ContentId = 26,
    MimeVersion = 27,
    Received = 28,
    ContentLanguage = 29,
    ContentLocation = 30,
    ContentMd5 = 31,
    Other = 32,
}

impl FieldType {
    pub fn classify(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "from" => Self::From,
            "resent-from" => Self::ResentFrom,
            "sender" => Self::Sender,
            "resent-sender" => Self::ResentSender,
            "return-path" => Self::ReturnPath,
            "reply-to" => Self::ReplyTo,
            "to" => Self::To,
            "cc" => Self::Cc,
            "bcc" => Self::Bcc,
            "resent-to" => Self::ResentTo,
            "resent-cc" => Self::ResentCc,
            "resent-bcc" => Self::ResentBcc,
            "message-id" => Self::MessageId,
            "resent-message-id" => Self::ResentMessageId,
            "in-reply-to" => Self::InReplyTo,
            "references" => Self::References,
            "date" => Self::Date,
            "resent-date" => Self::ResentDate,
            "subject" => Self::Subject,
            "comments" => Self::Comments,
            "keywords" => Self::Keywords,
            "content-type" => Self::ContentType,
            "content-transfer-encoding" => Self::ContentTransferEncoding,
            "content-disposition" => Self::ContentDisposition,
            "content-description" => Self::ContentDescription,
            "content-id" => Self::ContentId,
            "mime-version" => Self::MimeVersion,
            "received" => Self::Received,
            "content-language" => Self::ContentLanguage,
            "content-location" => Self::ContentLocation,
            "content-md5" => Self::ContentMd5,
            _ => Self::Other,
        }
    }

    pub fn is_address_field(self) -> bool {
        self <= Self::ResentBcc
    }
}

#[derive(Clone, Debug)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
    /// 1-based index of the field within its header.
    pub position: u32,
    pub field_type: FieldType,
}

#[derive(Clone, Debug, Default)]
pub struct Header {
    pub fields: Vec<HeaderField>,
}

impl Header {
    pub fn field(&self, field_type: FieldType) -> Option<&HeaderField> {
        self.fields.iter().find(|f| field_type == f.field_type)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.field(FieldType::MessageId).map(|f| f.value.as_str())
    }

    /// The parsed `Date:` field, if present and well-formed.
    pub fn date(&self) -> Option<DateTime<FixedOffset>> {
        self.field(FieldType::Date)
            .and_then(|f| DateTime::parse_from_rfc2822(f.value.trim()).ok())
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.field(FieldType::ContentType)
            .map(|f| ContentType::parse(&f.value))
    }

    /// Removes every field of the given type, then renumbers positions.
    pub fn remove_field(&mut self, field_type: FieldType) {
        self.fields.retain(|f| field_type != f.field_type);
        self.renumber();
    }

    /// Prepends a field, renumbering positions.
    pub fn add_front(&mut self, name: &str, value: &str) {
        self.fields.insert(
            0,
            HeaderField {
                name: name.to_owned(),
                value: value.to_owned(),
                position: 0,
                field_type: FieldType::classify(name),
            },
        );
        self.renumber();
    }

    fn renumber(&mut self) {
        for (ix, field) in self.fields.iter_mut().enumerate() {
            field.position = ix as u32 + 1;
        }
    }
}

/// A parsed `Content-Type:` value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentType {
    pub ctype: String,
    pub subtype: String,
    pub params: Vec<(String, String)>,
}

impl ContentType {
    /// Parses `type/subtype; param=value; ...`, permissively.
    ///
    /// Parameter values may be quoted; quoting is removed. A value without
    /// even a `/` comes back with an empty subtype.
    pub fn parse(value: &str) -> Self {
        let mut sections = value.split(';');
        let head = sections.next().unwrap_or("").trim();
        let (ctype, subtype) = match head.split_once('/') {
            Some((t, s)) => (t, s),
            None => (head, ""),
        };

        let mut params = Vec::new();
        for section in sections {
            if let Some((name, value)) = section.split_once('=') {
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                params.push((
                    name.trim().to_ascii_lowercase(),
                    value.to_owned(),
                ));
            }
        }

        Self {
            ctype: ctype.trim().to_ascii_lowercase(),
            subtype: subtype.trim().to_ascii_lowercase(),
            params,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| name == n)
            .map(|(_, v)| v.as_str())
    }

    pub fn is(&self, ctype: &str, subtype: &str) -> bool {
        ctype == self.ctype && subtype == self.subtype
    }
}

/// An RFC 822 mailbox, as stored in the `addresses` dictionary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Address {
    pub name: String,
    pub localpart: String,
    pub domain: String,
}

impl Address {
    pub fn new(name: &str, localpart: &str, domain: &str) -> Self {
        Self {
            name: name.to_owned(),
            localpart: localpart.to_owned(),
            domain: domain.to_owned(),
        }
    }

    /// The bare `localpart@domain` form used for envelope comparison.
    pub fn lp_domain(&self) -> String {
        format!("{}@{}", self.localpart, self.domain)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}@{}", self.localpart, self.domain)
        } else {
            write!(f, "{} <{}@{}>", self.name, self.localpart, self.domain)
        }
    }
}

/// One node of the body-part tree.
///
/// Multipart containers and `message/rfc822` parts appear here too; the flat
/// list in `Message` holds the whole tree in depth-first order.
#[derive(Clone, Debug)]
pub struct Bodypart {
    /// The RFC 3501 part number ("1", "2.1", ...).
    pub part_number: String,
    pub content_type: Option<ContentType>,
    pub header: Header,
    /// Content bytes after transfer decoding (for multipart containers, the
    /// raw inner section).
    pub data: Vec<u8>,
    /// Decoded text, present for textual parts.
    pub text: Option<String>,
    pub bytes: u64,
    pub lines: u64,
    pub encoded_bytes: u64,
    pub encoded_lines: u64,
    /// The embedded message, for `message/rfc822` parts.
    pub message: Option<Box<Message>>,
}

#[derive(Clone, Debug)]
pub struct Message {
    pub header: Header,
    /// The full raw form, as received.
    pub rfc822: Vec<u8>,
    /// Explicit internal date, if the source of the message supplied one.
    pub internal_date: Option<DateTime<Utc>>,
    /// All body parts, depth-first, including the parts of any embedded
    /// messages.
    pub bodyparts: Vec<Bodypart>,
}
