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

//! The process-wide server context.
//!
//! There are no globals beyond `main`: the configuration, the mailbox
//! graph, the dictionary caches, and the cluster channel are all carried
//! here and handed to every component at construction.

use std::sync::Arc;

use crate::account::mailbox::MailboxStore;
use crate::db;
use crate::inject::caches::Caches;
use crate::net::cluster::ClusterClient;
use crate::support::error::Error;
use crate::support::system_config::SystemConfig;

pub struct Context {
    pub config: SystemConfig,
    pub store: MailboxStore,
    pub caches: Caches,
    pub cluster: ClusterClient,
}

impl Context {
    pub fn new(config: SystemConfig) -> Arc<Self> {
        let cluster = ClusterClient::new(config.cluster_peers.clone());
        Arc::new(Self {
            config,
            store: MailboxStore::new(),
            caches: Caches::new(),
            cluster,
        })
    }

    /// Checks out a fresh database handle.
    pub fn open_db(&self) -> Result<db::Connection, Error> {
        db::Connection::open(&self.config.database)
    }
}
