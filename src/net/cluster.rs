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

//! The out-of-band cluster channel.
//!
//! After a committed injection, peer processes are told which mailbox
//! counters advanced so their in-memory mirrors and sessions catch up
//! without polling. Messages are plain-text datagrams of the form
//! `mailbox "<name>" uidnext=<n> nextmodseq=<m>`; loss is tolerable since
//! peers re-read counters from the database when they next touch the
//! mailbox.

use std::net::UdpSocket;

use log::{debug, warn};

pub struct ClusterClient {
    socket: Option<UdpSocket>,
    peers: Vec<String>,
}

impl ClusterClient {
    pub fn new(peers: Vec<String>) -> Self {
        let socket = if peers.is_empty() {
            None
        } else {
            match UdpSocket::bind("0.0.0.0:0") {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!("Cannot bind cluster socket: {e}");
                    None
                },
            }
        };

        Self { socket, peers }
    }

    /// A client that never sends anything; used when no peers are
    /// configured and by tests.
    pub fn disabled() -> Self {
        Self {
            socket: None,
            peers: Vec::new(),
        }
    }

    pub fn send(&self, line: &str) {
        let Some(ref socket) = self.socket else {
            return;
        };

        debug!("cluster: {line}");
        for peer in &self.peers {
            if let Err(e) = socket.send_to(line.as_bytes(), peer.as_str()) {
                warn!("Cannot notify cluster peer {peer}: {e}");
            }
        }
    }
}
