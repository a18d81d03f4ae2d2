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

//! The TLS worker bridge.
//!
//! A worker thread owns the encrypted socket and pumps bytes through
//! OpenSSL, exposing the plaintext side of a socketpair to the connection
//! loop, which stays oblivious to TLS. `WANT_READ`/`WANT_WRITE` and `EINTR`
//! are transient; any other TLS error tears down both pipes.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use openssl::ssl::{
    ErrorCode, HandshakeError, SslAcceptor, SslFiletype, SslMethod,
    SslStream,
};

use crate::support::error::Error;
use crate::support::system_config::TlsConfig;

/// How long the pump sleeps when neither direction can make progress.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

pub fn build_acceptor(config: &TlsConfig) -> Result<SslAcceptor, Error> {
    let mut builder =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
    builder
        .set_private_key_file(&config.private_key, SslFiletype::PEM)?;
    builder.set_certificate_chain_file(&config.certificate_chain)?;
    Ok(builder.build())
}

/// Starts TLS service for `socket` on a worker thread.
///
/// Returns the plaintext end immediately; the handshake proceeds on the
/// worker. If it fails, the plaintext stream simply reaches EOF, so the
/// connection closes without ceremony.
pub fn start(
    acceptor: Arc<SslAcceptor>,
    socket: TcpStream,
) -> Result<UnixStream, Error> {
    let (server_side, bridge_side) = UnixStream::pair()?;
    socket.set_nonblocking(true)?;
    bridge_side.set_nonblocking(true)?;

    std::thread::Builder::new()
        .name("tls-bridge".to_owned())
        .spawn(move || {
            if let Err(e) = pump(&acceptor, socket, bridge_side) {
                debug!("TLS bridge closed: {e}");
            }
        })?;

    Ok(server_side)
}

fn pump(
    acceptor: &SslAcceptor,
    socket: TcpStream,
    mut plain: UnixStream,
) -> Result<(), Error> {
    let mut stream = handshake(acceptor, socket)?;

    let mut buffer = [0u8; 8192];
    loop {
        let mut progress = false;

        // Ciphertext in, plaintext out.
        match stream.ssl_read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                write_all_plain(&mut plain, &buffer[..n])?;
                progress = true;
            },
            Err(ref e) if transient(e) => (),
            Err(ref e) if ErrorCode::ZERO_RETURN == e.code() => break,
            Err(e) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    e.to_string(),
                )))
            },
        }

        // Plaintext in, ciphertext out.
        match plain.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                ssl_write_all(&mut stream, &buffer[..n])?;
                progress = true;
            },
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted,
                ) => {},
            Err(e) => return Err(e.into()),
        }

        if !progress {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    let _ = stream.shutdown();
    Ok(())
}

fn handshake(
    acceptor: &SslAcceptor,
    socket: TcpStream,
) -> Result<SslStream<TcpStream>, Error> {
    let mut result = acceptor.accept(socket);
    loop {
        match result {
            Ok(stream) => return Ok(stream),
            Err(HandshakeError::WouldBlock(mid)) => {
                std::thread::sleep(POLL_INTERVAL);
                result = mid.handshake();
            },
            Err(e) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("TLS handshake failed: {e}"),
                )))
            },
        }
    }
}

fn transient(e: &openssl::ssl::Error) -> bool {
    match e.code() {
        ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => true,
        ErrorCode::SYSCALL => e
            .io_error()
            .map_or(false, |io| {
                io::ErrorKind::Interrupted == io.kind()
            }),
        _ => false,
    }
}

fn write_all_plain(plain: &mut UnixStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match plain.write(data) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "plaintext pipe closed",
                ))
            },
            Ok(n) => data = &data[n..],
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted,
                ) =>
            {
                std::thread::sleep(POLL_INTERVAL);
            },
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn ssl_write_all(
    stream: &mut SslStream<TcpStream>,
    mut data: &[u8],
) -> Result<(), Error> {
    while !data.is_empty() {
        match stream.ssl_write(data) {
            Ok(n) => data = &data[n..],
            Err(ref e) if transient(e) => {
                std::thread::sleep(POLL_INTERVAL);
            },
            Err(e) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    e.to_string(),
                )))
            },
        }
    }
    Ok(())
}
