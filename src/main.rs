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

mod account;
mod context;
mod db;
mod imap;
mod inject;
mod mime;
mod net;
mod sasl;
mod smtp;
mod support;

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use structopt::StructOpt;

use crate::context::Context;
use crate::imap::processor::Processor;
use crate::imap::server::ImapServer;
use crate::smtp::server::SmtpServer;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(
    name = "petramap",
    about = "SQL-backed IMAP + SMTP/LMTP mail server"
)]
enum Command {
    /// Serve IMAP connections.
    ServeImap {
        #[structopt(flatten)]
        common: CommonOptions,
        /// Address to listen on.
        #[structopt(long, default_value = "0.0.0.0:143")]
        listen: String,
    },
    /// Serve IMAP-over-implicit-TLS connections.
    ServeImaps {
        #[structopt(flatten)]
        common: CommonOptions,
        #[structopt(long, default_value = "0.0.0.0:993")]
        listen: String,
    },
    /// Serve SMTP connections.
    ServeSmtp {
        #[structopt(flatten)]
        common: CommonOptions,
        #[structopt(long, default_value = "0.0.0.0:25")]
        listen: String,
    },
    /// Serve LMTP connections.
    ServeLmtp {
        #[structopt(flatten)]
        common: CommonOptions,
        #[structopt(long, default_value = "0.0.0.0:24")]
        listen: String,
    },
}

#[derive(StructOpt)]
struct CommonOptions {
    /// Path to petramap.toml.
    #[structopt(long, default_value = "/etc/petramap/petramap.toml")]
    config: PathBuf,
}

fn main() {
    init_simple_log();

    let result = match Command::from_args() {
        Command::ServeImap { common, listen } => {
            serve_imap(&common.config, &listen, false)
        },
        Command::ServeImaps { common, listen } => {
            serve_imap(&common.config, &listen, true)
        },
        Command::ServeSmtp { common, listen } => {
            serve_smtp(&common.config, &listen, false)
        },
        Command::ServeLmtp { common, listen } => {
            serve_smtp(&common.config, &listen, true)
        },
    };

    if let Err(e) = result {
        error!("Fatal: {e}");
        std::process::exit(1);
    }
}

fn load(config_path: &PathBuf) -> Result<Arc<Context>, Error> {
    let config = SystemConfig::load(config_path)?;
    // Fail fast on an unusable database rather than on first connection.
    let _ = db::Connection::open(&config.database)?;
    Ok(Context::new(config))
}

fn serve_imap(
    config_path: &PathBuf,
    listen: &str,
    implicit_tls: bool,
) -> Result<(), Error> {
    let ctx = load(config_path)?;
    let acceptor = match ctx.config.tls {
        Some(ref tls) => {
            Some(Arc::new(net::tls::build_acceptor(tls)?))
        },
        None if implicit_tls => return Err(Error::TlsNotConfigured),
        None => None,
    };

    let listener = std::net::TcpListener::bind(listen)?;
    info!(
        "Listening for {} on {listen}",
        if implicit_tls { "IMAPS" } else { "IMAP" },
    );

    for socket in listener.incoming() {
        let socket = match socket {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Accept failed: {e}");
                continue;
            },
        };

        let ctx = Arc::clone(&ctx);
        let acceptor = acceptor.clone();
        std::thread::spawn(move || {
            let peer = socket
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned());
            let log_prefix = LogPrefix::new(
                if implicit_tls { "imaps" } else { "imap" },
                peer,
            );
            info!("{log_prefix} Connection accepted");

            let result = connect_imap(
                ctx,
                socket,
                log_prefix.clone(),
                acceptor,
                implicit_tls,
            );
            match result {
                Ok(()) => info!("{log_prefix} Connection closed"),
                Err(e) => info!("{log_prefix} Connection lost: {e}"),
            }
        });
    }

    Ok(())
}

fn connect_imap(
    ctx: Arc<Context>,
    socket: std::net::TcpStream,
    log_prefix: LogPrefix,
    acceptor: Option<Arc<openssl::ssl::SslAcceptor>>,
    implicit_tls: bool,
) -> Result<(), Error> {
    let cxn = ctx.open_db()?;
    let proc = Processor::new(ctx, cxn, log_prefix);

    let mut server = if implicit_tls {
        let acceptor = acceptor.ok_or(Error::TlsNotConfigured)?;
        let plain = net::tls::start(acceptor, socket)?;
        ImapServer::with_tls_bridge(plain, proc)?
    } else {
        ImapServer::with_socket(socket, proc, acceptor)?
    };
    server.run()
}

fn serve_smtp(
    config_path: &PathBuf,
    listen: &str,
    lmtp: bool,
) -> Result<(), Error> {
    let ctx = load(config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(listen).await?;
        info!(
            "Listening for {} on {listen}",
            if lmtp { "LMTP" } else { "SMTP" },
        );

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    continue;
                },
            };

            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                let log_prefix = LogPrefix::new(
                    if lmtp { "lmtp" } else { "smtp" },
                    peer.to_string(),
                );
                info!("{log_prefix} Connection accepted");

                let result =
                    connect_smtp(ctx, socket, log_prefix.clone(), lmtp)
                        .await;
                match result {
                    Ok(()) => info!("{log_prefix} Connection closed"),
                    Err(e) => {
                        info!("{log_prefix} Connection lost: {e}")
                    },
                }
            });
        }
    })
}

async fn connect_smtp(
    ctx: Arc<Context>,
    socket: tokio::net::TcpStream,
    log_prefix: LogPrefix,
    lmtp: bool,
) -> Result<(), Error> {
    let peer = socket
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "<unknown>".to_owned());

    // STARTTLS needs the raw socket; keep a clone alongside the async one.
    let std_socket = socket.into_std()?;
    let raw = std_socket.try_clone()?;
    std_socket.set_nonblocking(true)?;
    let socket = tokio::net::TcpStream::from_std(std_socket)?;

    let cxn = ctx.open_db()?;
    let mut server = SmtpServer::new(
        Box::new(socket),
        ctx,
        cxn,
        log_prefix,
        lmtp,
        peer,
    );
    server.set_socket(raw);
    server.run().await
}

fn init_simple_log() {
    let stderr = log4rs::append::console::ConsoleAppender::builder()
        .target(log4rs::append::console::Target::Stderr)
        .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        )))
        .build();
    let log_config = log4rs::config::Config::builder()
        .appender(
            log4rs::config::Appender::builder()
                .build("stderr", Box::new(stderr)),
        )
        .build(
            log4rs::config::Root::builder()
                .appender("stderr")
                .build(log::LevelFilter::Info),
        )
        .unwrap();
    log4rs::init_config(log_config).unwrap();
}
