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

//! CRAM-MD5 authentication (RFC 2195).
//!
//! We issue a challenge and expect the client to respond with a login and
//! the HMAC-MD5 digest of the challenge keyed with the shared secret. The
//! request is accepted only if the digest matches our re-computation from
//! the stored secret.

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use rand::RngCore;

use crate::support::hex::to_hex;

/// The fallback when no usable host name is configured. The challenge must
/// contain a fully-qualified domain, so a name without a dot won't do.
const FALLBACK_HOSTNAME: &str = "oryx.invalid";

#[derive(Default)]
pub struct CramMd5 {
    challenge_sent: String,
    login: String,
    /// The digest the client presented, lowercase hex.
    presented: String,
}

impl CramMd5 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates the challenge: `<RANDOM@hostname>`, RANDOM being 12 bytes
    /// of fresh entropy in base64.
    pub fn challenge(&mut self, hostname: &str) -> String {
        let mut random = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut random);

        let hostname = if hostname.is_empty() || !hostname.contains('.') {
            FALLBACK_HOSTNAME
        } else {
            hostname
        };

        self.challenge_sent =
            format!("<{}@{}>", base64::encode(random), hostname);
        self.challenge_sent.clone()
    }

    #[cfg(test)]
    pub fn set_challenge(&mut self, challenge: &str) {
        self.challenge_sent = challenge.to_owned();
    }

    /// Splits the client response on its *last* space: everything before is
    /// the login (which may itself contain spaces), everything after is the
    /// hex digest.
    pub fn parse_response(&mut self, response: &[u8]) -> bool {
        let response = String::from_utf8_lossy(response);
        let Some((login, digest)) = response.rsplit_once(' ') else {
            return false;
        };
        if login.is_empty() {
            return false;
        }

        self.login = login.to_owned();
        self.presented = digest.to_ascii_lowercase();
        true
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    /// True iff the presented digest matches the stored secret.
    pub fn verify(&self, stored_secret: &str) -> bool {
        !self.challenge_sent.is_empty()
            && hmac_md5_hex(stored_secret, &self.challenge_sent)
                == self.presented
    }
}

/// Lowercase hex HMAC-MD5, as CRAM-MD5 exchanges it on the wire.
pub fn hmac_md5_hex(key: &str, message: &str) -> String {
    // OpenSSL rejects zero-length keys. HMAC zero-pads keys to the block
    // size, so an empty key and a single NUL are the same key.
    let key = if key.is_empty() { &[0u8][..] } else { key.as_bytes() };
    let pkey = PKey::hmac(key).expect("HMAC key");
    let mut signer =
        Signer::new(MessageDigest::md5(), &pkey).expect("HMAC-MD5 signer");
    signer.update(message.as_bytes()).expect("HMAC update");
    to_hex(&signer.sign_to_vec().expect("HMAC finish"))
}
