// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! TCP echo server written with plain blocking-style calls.
//!
//! Usage: echo_server [ADDR] [CONFIG.toml]
//! Set RUST_LOG=strand_rt=debug to watch events come and go.

use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{IntoRawFd, RawFd};

use strand_rt::hook;
use strand_rt::{Reactor, RuntimeConfig};

fn serve(client: RawFd, peer: SocketAddr) {
    let mut buf = [0u8; 4096];
    loop {
        match hook::read(client, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = hook::write(client, &buf[..n]) {
                    tracing::warn!(%peer, error = %err, "write failed");
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(%peer, error = %err, "read failed");
                break;
            }
        }
    }
    let _ = hook::close(client);
    tracing::info!(%peer, "connection closed");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:7878".to_string());
    if let Some(path) = args.next() {
        RuntimeConfig::load(path)?.apply();
    }

    let listener = TcpListener::bind(&addr)?;
    let lfd = listener.into_raw_fd();
    hook::track(lfd)?;

    let reactor = Reactor::new(4, false, "echo")?;
    reactor.schedule(move || loop {
        match hook::accept(lfd) {
            Ok((client, raw)) => {
                let Some(peer) = raw.to_std() else {
                    let _ = hook::close(client);
                    continue;
                };
                tracing::info!(%peer, "accepted");
                strand_rt::spawn(move || serve(client, peer));
            }
            Err(err) => {
                tracing::error!(error = %err, "accept failed");
                break;
            }
        }
    });
    tracing::info!(%addr, "echo server listening");

    // Runs until the accept loop fails.
    reactor.stop();
    Ok(())
}
