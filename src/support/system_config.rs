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

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::Error;

/// The system-wide configuration for Petramap.
///
/// This is stored in a file named `petramap.toml`, typically under
/// `/usr/local/etc/petramap` or `/etc/petramap`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SystemConfig {
    /// The host name used in greetings, `Received:` headers, and SASL
    /// challenges. Must be fully-qualified to be usable for CRAM-MD5.
    #[serde(default)]
    pub hostname: String,

    /// The path to the SQLite database holding all mail.
    pub database: PathBuf,

    /// Options relating to authentication.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Configuration for TLS. Absent means STARTTLS is not offered and the
    /// implicit-TLS services refuse to start.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Whether and where to keep file copies of messages received over
    /// SMTP/LMTP.
    #[serde(default)]
    pub message_copy: MessageCopyConfig,

    /// The mailbox into which messages for remote recipients are spooled.
    #[serde(default = "default_spool_mailbox")]
    pub spool_mailbox: String,

    /// Peer processes to notify (UDP) when a mailbox's uidnext/nextmodseq
    /// advance.
    #[serde(default)]
    pub cluster_peers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// If true, the `anonymous` login succeeds regardless of secret.
    #[serde(default)]
    pub allow_anonymous: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MessageCopyConfig {
    #[serde(default)]
    pub mode: MessageCopyMode,
    #[serde(default)]
    pub directory: PathBuf,
}

/// Which received messages get written to the message-copy directory.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessageCopyMode {
    #[default]
    None,
    All,
    Delivered,
    Errors,
}

fn default_spool_mailbox() -> String {
    "/petramap/spool".to_owned()
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: SystemConfig = toml::from_str(
            r#"
database = "/var/lib/petramap/mail.sqlite"
"#,
        )
        .unwrap();

        assert_eq!("", config.hostname);
        assert_eq!(MessageCopyMode::None, config.message_copy.mode);
        assert_eq!("/petramap/spool", config.spool_mailbox);
        assert!(config.tls.is_none());
        assert!(!config.security.allow_anonymous);
    }

    #[test]
    fn full_config_parses() {
        let config: SystemConfig = toml::from_str(
            r#"
hostname = "mail.example.com"
database = "/srv/mail.sqlite"
spool_mailbox = "/example/spool"
cluster_peers = ["10.0.0.2:1729"]

[security]
allow_anonymous = true

[tls]
private_key = "/etc/keys/tls.pem"
certificate_chain = "/etc/keys/chain.pem"

[message_copy]
mode = "errors"
directory = "/var/spool/petramap"
"#,
        )
        .unwrap();

        assert_eq!("mail.example.com", config.hostname);
        assert_eq!(MessageCopyMode::Errors, config.message_copy.mode);
        assert!(config.security.allow_anonymous);
        assert_eq!(1, config.cluster_peers.len());
    }
}
