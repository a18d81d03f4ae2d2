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

//! Content-transfer-encoding removal.
//!
//! Decoding never fails: invalid sequences are passed through untransformed,
//! since corrupting the user's mail is a greater sin than tolerating a
//! malformed encoder on the other end.

/// The transfer encodings we understand; everything else is treated as
/// identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransferEncoding {
    #[default]
    Identity,
    Base64,
    QuotedPrintable,
}

impl TransferEncoding {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            _ => Self::Identity,
        }
    }

    pub fn decode(self, raw: &[u8]) -> Vec<u8> {
        match self {
            Self::Identity => raw.to_vec(),
            Self::Base64 => b64_decode(raw),
            Self::QuotedPrintable => qp_decode(raw),
        }
    }
}

/// Decodes base64, ignoring whitespace. Trailing garbage that fails to
/// decode is dropped rather than failing the whole part.
fn b64_decode(raw: &[u8]) -> Vec<u8> {
    let mut compact: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    loop {
        match base64::decode(&compact) {
            Ok(decoded) => return decoded,
            Err(_) if compact.is_empty() => return Vec::new(),
            Err(_) => {
                compact.pop();
            },
        }
    }
}

/// Decodes quoted-printable (RFC 2045): `=XX` escapes and soft line breaks,
/// the latter by discarding.
fn qp_decode(raw: &[u8]) -> Vec<u8> {
    fn unhex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'A'..=b'F' => Some(b - b'A' + 10),
            b'a'..=b'f' => Some(b - b'a' + 10),
            _ => None,
        }
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut ix = 0;
    while ix < raw.len() {
        let b = raw[ix];
        if b'=' != b {
            out.push(b);
            ix += 1;
            continue;
        }

        let rest = &raw[ix + 1..];
        if rest.starts_with(b"\r\n") {
            ix += 3; // soft break
        } else if rest.starts_with(b"\n") {
            ix += 2; // soft break, UNIX ending
        } else if let (Some(hi), Some(lo)) = (
            rest.first().copied().and_then(unhex),
            rest.get(1).copied().and_then(unhex),
        ) {
            out.push((hi << 4) | lo);
            ix += 3;
        } else {
            // Invalid escape; pass through.
            out.push(b);
            ix += 1;
        }
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_decode() {
        assert_eq!(
            b"anything".to_vec(),
            TransferEncoding::parse("7BIT").decode(b"anything"),
        );
    }

    #[test]
    fn base64_decode() {
        assert_eq!(
            b"hello world".to_vec(),
            TransferEncoding::Base64.decode(b"aGVsbG8g\r\nd29ybGQ=\r\n"),
        );
        assert_eq!(Vec::<u8>::new(), TransferEncoding::Base64.decode(b"!!"));
    }

    #[test]
    fn qp_decode_escapes_and_soft_breaks() {
        assert_eq!(
            b"a=b\r\nnaive".to_vec(),
            TransferEncoding::QuotedPrintable
                .decode(b"a=3Db\r\nna=\r\nive"),
        );
        // Invalid escapes pass through
        assert_eq!(
            b"100=x%".to_vec(),
            TransferEncoding::QuotedPrintable.decode(b"100=x%"),
        );
    }
}
