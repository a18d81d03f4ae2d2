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

//! Structural parsing of RFC 822 / MIME messages.
//!
//! This takes raw bytes to the `model` types: the header field list, the
//! body-part tree flattened in part-number order, and transfer-decoded
//! content. Charset handling is deliberately crude (non-UTF-8 text survives
//! via lossy conversion); full codec support lives outside this crate.

use super::encoding::TransferEncoding;
use super::model::*;
use crate::support::error::Error;

/// How deep we follow multipart/rfc822 nesting before treating the content
/// as opaque.
const MAX_DEPTH: u32 = 20;

pub fn parse_message(raw: &[u8]) -> Result<Message, Error> {
    parse_message_at_depth(raw, 0)
}

fn parse_message_at_depth(raw: &[u8], depth: u32) -> Result<Message, Error> {
    let (header_bytes, body) = split_message(raw);
    let header = parse_header(header_bytes)?;
    if header.fields.is_empty() {
        return Err(Error::BadMessage);
    }

    let mut bodyparts = Vec::new();
    match header.content_type() {
        Some(ct) if "multipart" == ct.ctype && depth < MAX_DEPTH => {
            parse_children("", &ct, body, depth, &mut bodyparts)?;
        },
        ct => {
            // The sole part of a singlepart message shares the physical
            // header of the message itself.
            parse_part(
                "1".to_owned(),
                header.clone(),
                ct,
                body,
                depth,
                &mut bodyparts,
            )?;
        },
    }

    Ok(Message {
        header,
        rfc822: raw.to_vec(),
        internal_date: None,
        bodyparts,
    })
}

/// Splits a multipart body on its boundary and parses each child part.
fn parse_children(
    container: &str,
    ct: &ContentType,
    body: &[u8],
    depth: u32,
    out: &mut Vec<Bodypart>,
) -> Result<(), Error> {
    let boundary = ct.param("boundary").ok_or(Error::BadMessage)?;
    let sections = split_multipart(body, boundary.as_bytes());
    if sections.is_empty() {
        return Err(Error::BadMessage);
    }

    for (ix, section) in sections.into_iter().enumerate() {
        let number = if container.is_empty() {
            format!("{}", ix + 1)
        } else {
            format!("{}.{}", container, ix + 1)
        };

        let (header_bytes, part_body) = split_message(section);
        let header = parse_header(header_bytes)?;
        let ct = header.content_type();
        parse_part(number, header, ct, part_body, depth, out)?;
    }

    Ok(())
}

/// Parses one body part and appends it (and, depth-first, its descendants)
/// to `out`.
fn parse_part(
    number: String,
    header: Header,
    ct: Option<ContentType>,
    raw: &[u8],
    depth: u32,
    out: &mut Vec<Bodypart>,
) -> Result<(), Error> {
    let encoded_bytes = raw.len() as u64;
    let encoded_lines = count_lines(raw);

    if let Some(ref ct) = ct {
        if "multipart" == ct.ctype && depth < MAX_DEPTH {
            // The container node itself. Its raw content is retained so
            // that signed multiparts can be stored byte-exactly.
            out.push(Bodypart {
                part_number: number.clone(),
                content_type: Some(ct.clone()),
                header: header.clone(),
                data: raw.to_vec(),
                text: None,
                bytes: raw.len() as u64,
                lines: count_lines(raw),
                encoded_bytes,
                encoded_lines,
                message: None,
            });
            return parse_children(&number, ct, raw, depth + 1, out);
        }
    }

    let cte = header
        .field(FieldType::ContentTransferEncoding)
        .map(|f| TransferEncoding::parse(&f.value))
        .unwrap_or_default();
    let data = cte.decode(raw);

    if ct
        .as_ref()
        .map_or(false, |ct| ct.is("message", "rfc822"))
        && depth < MAX_DEPTH
    {
        if let Ok(mut nested) = parse_message_at_depth(&data, depth + 1) {
            // Hoist the embedded message's parts into the flat list under
            // our own number; its header is linked at `<number>.rfc822`.
            let mut hoisted = std::mem::take(&mut nested.bodyparts);
            for part in &mut hoisted {
                part.part_number =
                    format!("{}.{}", number, part.part_number);
            }

            out.push(Bodypart {
                part_number: number,
                content_type: ct,
                header,
                bytes: data.len() as u64,
                lines: count_lines(&data),
                data,
                text: None,
                encoded_bytes,
                encoded_lines,
                message: Some(Box::new(nested)),
            });
            out.extend(hoisted);
            return Ok(());
        }
    }

    let textual = ct.as_ref().map_or(true, |ct| "text" == ct.ctype);
    let text = if textual {
        Some(String::from_utf8_lossy(&data).into_owned())
    } else {
        None
    };

    out.push(Bodypart {
        part_number: number,
        content_type: ct,
        header,
        bytes: data.len() as u64,
        lines: count_lines(&data),
        data,
        text,
        encoded_bytes,
        encoded_lines,
        message: None,
    });
    Ok(())
}

/// Splits raw message bytes at the first blank line.
///
/// If there is no blank line, the whole input is header and the body is
/// empty.
fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut ix = 0;
    while let Some(eol) = memchr::memchr(b'\n', &raw[ix..]) {
        let line_start = ix + eol + 1;
        let rest = &raw[line_start..];
        if rest.starts_with(b"\r\n") {
            return (&raw[..line_start], &rest[2..]);
        }
        if rest.starts_with(b"\n") {
            return (&raw[..line_start], &rest[1..]);
        }
        ix = line_start;
    }

    (raw, &[])
}

/// Parses header bytes into a field list, unfolding continuation lines.
fn parse_header(raw: &[u8]) -> Result<Header, Error> {
    let mut fields = Vec::<HeaderField>::new();

    for line in raw.split(|&b| b'\n' == b) {
        let line = match line.strip_suffix(b"\r") {
            Some(l) => l,
            None => line,
        };
        if line.is_empty() {
            continue;
        }

        if line[0] == b' ' || line[0] == b'\t' {
            // Folded continuation of the previous field.
            let prev = fields.last_mut().ok_or(Error::BadMessage)?;
            prev.value.push(' ');
            prev.value
                .push_str(String::from_utf8_lossy(line).trim_start());
            continue;
        }

        let colon =
            memchr::memchr(b':', line).ok_or(Error::BadMessage)?;
        let name = std::str::from_utf8(&line[..colon])
            .map_err(|_| Error::BadMessage)?
            .trim();
        if name.is_empty() || name.contains(' ') {
            return Err(Error::BadMessage);
        }

        let value =
            String::from_utf8_lossy(&line[colon + 1..]).trim().to_owned();
        fields.push(HeaderField {
            name: name.to_owned(),
            value,
            position: fields.len() as u32 + 1,
            field_type: FieldType::classify(name),
        });
    }

    Ok(Header { fields })
}

/// Splits a multipart body into its sections.
///
/// The preamble before the first delimiter and the epilogue after the
/// closing delimiter are discarded, per RFC 2046.
fn split_multipart<'a>(body: &'a [u8], boundary: &[u8]) -> Vec<&'a [u8]> {
    let mut sections = Vec::new();
    let mut current_start: Option<usize> = None;
    let mut ix = 0;

    while ix <= body.len() {
        let line_end = memchr::memchr(b'\n', &body[ix..])
            .map(|eol| ix + eol + 1)
            .unwrap_or(body.len());
        let line = trim_crlf(&body[ix..line_end]);

        let delimiter = line.len() >= 2 + boundary.len()
            && line.starts_with(b"--")
            && line[2..].starts_with(boundary);
        if delimiter {
            if let Some(start) = current_start.take() {
                sections.push(strip_final_crlf(&body[start..ix]));
            }

            if line[2 + boundary.len()..].starts_with(b"--") {
                break; // closing delimiter
            }
            current_start = Some(line_end);
        }

        if line_end == body.len() {
            // Tolerate a missing closing delimiter.
            if let Some(start) = current_start.take() {
                sections.push(strip_final_crlf(&body[start..]));
            }
            break;
        }
        ix = line_end;
    }

    sections
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// The line ending before a boundary delimiter belongs to the delimiter,
/// not the content.
fn strip_final_crlf(section: &[u8]) -> &[u8] {
    trim_crlf(section)
}

fn count_lines(data: &[u8]) -> u64 {
    if data.is_empty() {
        return 0;
    }
    let full = bytecount(data, b'\n');
    if data.ends_with(b"\n") {
        full
    } else {
        full + 1
    }
}

fn bytecount(data: &[u8], byte: u8) -> u64 {
    data.iter().filter(|&&b| byte == b).count() as u64
}

/// Builds a parseable wrapper around a message that failed to parse.
///
/// The wrapper is multipart/mixed: part 1 is a short explanation, part 2
/// carries the original bytes verbatim. The caller is expected to record the
/// wrapping so the original can be recovered later.
pub fn wrap_unparsable(raw: &[u8], why: &str) -> Message {
    let mut boundary = b"=-=-wrap".to_vec();
    while contains(raw, &boundary) {
        boundary.push(b'=');
    }
    let boundary = String::from_utf8(boundary).expect("ascii boundary");

    let mut wrapper = Vec::with_capacity(raw.len() + 512);
    wrapper.extend_from_slice(
        format!(
            "Subject: Unparsable message\r\n\
             Mime-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary=\"{b}\"\r\n\
             \r\n\
             --{b}\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             The appended message could not be parsed: {why}\r\n\
             --{b}\r\n\
             Content-Type: application/octet-stream\r\n\
             \r\n",
            b = boundary,
        )
        .as_bytes(),
    );
    wrapper.extend_from_slice(raw);
    wrapper.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    parse_message(&wrapper).expect("wrapper must parse")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| needle == window)
}

/// Parses a comma-separated address list from a structured header field.
///
/// This understands the `display <lp@dom>`, `<lp@dom>` and bare `lp@dom`
/// forms and skips anything it cannot make sense of; it does not attempt
/// the full RFC 822 group/route grammar.
pub fn parse_address_list(value: &str) -> Vec<Address> {
    let mut addresses = Vec::new();

    for element in split_address_list(value) {
        let element = element.trim();
        if element.is_empty() {
            continue;
        }

        let (name, addrspec) = match (element.find('<'), element.find('>'))
        {
            (Some(lt), Some(gt)) if lt < gt => {
                (element[..lt].trim(), &element[lt + 1..gt])
            },
            _ => ("", element),
        };

        if let Some((localpart, domain)) = addrspec.rsplit_once('@') {
            let localpart = localpart.trim();
            let domain = domain.trim();
            if !localpart.is_empty() && !domain.is_empty() {
                let name = name.trim_matches('"');
                addresses.push(Address::new(name, localpart, domain));
            }
        }
    }

    addresses
}

/// Splits on commas that are outside double quotes and angle brackets.
fn split_address_list(value: &str) -> Vec<&str> {
    let mut elements = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut angle = false;

    for (ix, ch) in value.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '<' if !quoted => angle = true,
            '>' if !quoted => angle = false,
            ',' if !quoted && !angle => {
                elements.push(&value[start..ix]);
                start = ix + 1;
            },
            _ => (),
        }
    }
    elements.push(&value[start..]);
    elements
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn singlepart_message() {
        let message = parse_message(
            b"Subject: test\r\n\
              From: Kiki <kiki@example.com>\r\n\
              \r\n\
              hello\r\n",
        )
        .unwrap();

        assert_eq!(2, message.header.fields.len());
        assert_eq!(1, message.bodyparts.len());

        let part = &message.bodyparts[0];
        assert_eq!("1", part.part_number);
        assert_eq!(Some("hello\r\n".to_owned()), part.text);
        assert_eq!(7, part.bytes);
        assert_eq!(1, part.lines);
        // Physically collocated with the root header
        assert_eq!(2, part.header.fields.len());
    }

    #[test]
    fn folded_header_fields() {
        let message = parse_message(
            b"Subject: one\r\n\ttwo\r\n three\r\n\r\nx",
        )
        .unwrap();
        assert_eq!("one two three", message.header.fields[0].value);
    }

    #[test]
    fn multipart_message() {
        let message = parse_message(
            b"Content-Type: multipart/mixed; boundary=bb\r\n\
              \r\n\
              preamble\r\n\
              --bb\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              first part\r\n\
              --bb\r\n\
              Content-Type: application/pdf\r\n\
              Content-Transfer-Encoding: base64\r\n\
              \r\n\
              AAEC\r\n\
              --bb--\r\n\
              epilogue\r\n",
        )
        .unwrap();

        assert_eq!(
            vec!["1".to_owned(), "2".to_owned()],
            message
                .bodyparts
                .iter()
                .map(|p| p.part_number.clone())
                .collect::<Vec<_>>(),
        );
        assert_eq!(
            Some("first part".to_owned()),
            message.bodyparts[0].text,
        );
        assert_eq!(vec![0u8, 1, 2], message.bodyparts[1].data);
        assert!(message.bodyparts[1].text.is_none());
    }

    #[test]
    fn nested_multipart_numbers() {
        let message = parse_message(
            b"Content-Type: multipart/mixed; boundary=outer\r\n\
              \r\n\
              --outer\r\n\
              Content-Type: multipart/alternative; boundary=inner\r\n\
              \r\n\
              --inner\r\n\
              \r\n\
              plain\r\n\
              --inner\r\n\
              Content-Type: text/html\r\n\
              \r\n\
              <p>html</p>\r\n\
              --inner--\r\n\
              --outer\r\n\
              \r\n\
              tail\r\n\
              --outer--\r\n",
        )
        .unwrap();

        assert_eq!(
            vec!["1", "1.1", "1.2", "2"],
            message
                .bodyparts
                .iter()
                .map(|p| p.part_number.as_str())
                .collect::<Vec<_>>(),
        );
    }

    #[test]
    fn embedded_rfc822() {
        let message = parse_message(
            b"Content-Type: multipart/mixed; boundary=bb\r\n\
              \r\n\
              --bb\r\n\
              \r\n\
              see attached\r\n\
              --bb\r\n\
              Content-Type: message/rfc822\r\n\
              \r\n\
              Subject: inner\r\n\
              \r\n\
              inner body\r\n\
              --bb--\r\n",
        )
        .unwrap();

        assert_eq!(
            vec!["1", "2", "2.1"],
            message
                .bodyparts
                .iter()
                .map(|p| p.part_number.as_str())
                .collect::<Vec<_>>(),
        );

        let rfc822 = &message.bodyparts[1];
        let nested = rfc822.message.as_ref().unwrap();
        assert_eq!("inner", nested.header.fields[0].value);
        assert_eq!(
            Some("inner body".to_owned()),
            message.bodyparts[2].text,
        );
    }

    #[test]
    fn headerless_input_is_rejected() {
        assert!(parse_message(b"no header here").is_err());
        assert!(parse_message(b"").is_err());
    }

    #[test]
    fn wrapper_roundtrip() {
        let raw = b"this is not : a message\x00binary";
        let wrapped = wrap_unparsable(raw, "no header");

        assert_eq!(2, wrapped.bodyparts.len());
        assert_eq!("2", wrapped.bodyparts[1].part_number);
        assert_eq!(raw.to_vec(), wrapped.bodyparts[1].data);
    }

    #[test]
    fn address_lists() {
        let addresses = parse_address_list(
            "Kiki <kiki@example.com>, mja@lists.example.org , \
             \"Last, First\" <f.last@example.net>",
        );
        assert_eq!(
            vec![
                Address::new("Kiki", "kiki", "example.com"),
                Address::new("", "mja", "lists.example.org"),
                Address::new("Last, First", "f.last", "example.net"),
            ],
            addresses,
        );
    }
}
