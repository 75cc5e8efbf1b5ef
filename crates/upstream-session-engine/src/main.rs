// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `upstream-sessiond` -- per-peer upstream session engine entry point.
//!
//! The parent daemon accepts a downstream connection and forks a child to
//! serve it; this binary is that child. It expects the accepted socket on
//! an inherited file descriptor (classic inetd-style handoff), or, for
//! standalone testing, can bind and accept a single connection itself.
//! Either way exactly one connection is served per process, after which
//! the process exits -- there is no retry or reconnection logic here by
//! design.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use upstream_session_engine::circuit::ScriptCircuitProvisioner;
use upstream_session_engine::manager_client::TcpManagerClient;
use upstream_session_engine::policy::FileBackedPolicyOracle;
use upstream_session_engine::{drop_startup_privilege, run_session, Dependencies, Session, SessionEngineConfig};

/// Per-peer upstream session engine: one process per downstream subscriber.
#[derive(Parser, Debug)]
#[command(name = "upstream-sessiond")]
#[command(about = "Per-peer upstream session engine")]
#[command(version)]
struct Args {
    /// Path to the engine's JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// File descriptor of an already-accepted socket, inherited from the
    /// parent daemon. Mutually exclusive with `--listen`.
    #[arg(long, conflicts_with = "listen")]
    fd: Option<i32>,

    /// Bind and accept a single connection here instead of inheriting a
    /// file descriptor. Intended for standalone runs outside the parent
    /// daemon (manual testing, demos).
    #[arg(long, conflicts_with = "fd")]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

// Single-threaded by design: one process serves exactly one peer, and
// every suspension point (disk I/O via `rusqlite`, the socket write path) is
// driven by the lone dispatcher task, so there is nothing for a second
// worker thread to do.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Drop to the real uid immediately: if this binary is installed
    // setuid-root, it must not carry root privilege for its whole
    // lifetime, only briefly around the circuit-provisioning spawn (see
    // `circuit::PrivilegeGuard`, which re-escalates using the saved
    // set-user-id this leaves behind).
    drop_startup_privilege();

    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SessionEngineConfig::from_file(&args.config)
        .map_err(|e| format!("loading config {}: {}", args.config.display(), e))?;
    config.validate().map_err(|e| format!("invalid config: {}", e))?;

    let (stream, peer_addr) = accept_one(&args).await?;
    tracing::info!(peer = %peer_addr, "accepted downstream connection");

    let policy = FileBackedPolicyOracle::new(config.policy_file.clone());
    let mut circuit = ScriptCircuitProvisioner::new(
        config.provisioner_interpreter.clone(),
        config.provisioner_script.to_string_lossy().into_owned(),
    );
    let manager = TcpManagerClient::new(config.manager_addr, config.manager_timeout());

    let mut session = Session::new(
        config.local_vc_end.clone(),
        config.product_queue_path.clone(),
        config.index_map_dir.clone(),
    );

    let mut deps = Dependencies {
        policy: &policy,
        circuit: &mut circuit,
        manager: &manager,
        max_frame_size: config.max_frame_size,
        handshake_timeout: config.handshake_timeout(),
    };

    match run_session(&mut session, stream, peer_addr, &mut deps).await {
        Ok(()) => {
            tracing::info!(stats = ?session.stats.snapshot(), "session ended cleanly");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, stats = ?session.stats.snapshot(), "session ended with a fatal error");
            Err(Box::new(e))
        }
    }
}

/// Obtains the accepted socket either from an inherited file descriptor
/// or, for standalone runs, by listening for and accepting one
/// connection. Exactly one of `--fd`/`--listen` must be given (enforced
/// by clap's `conflicts_with`, except for the "neither given" case,
/// checked here).
async fn accept_one(args: &Args) -> Result<(tokio::net::TcpStream, SocketAddr), Box<dyn std::error::Error>> {
    if let Some(addr) = args.listen {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "listening for a single standalone connection (Ctrl-C to abort)");

        // Only `--listen` runs can legitimately be waiting here long enough
        // for an operator to want to abort them; `--fd` mode is
        // handed an already-accepted socket and never reaches this select.
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                Ok((stream, peer_addr))
            }
            _ = tokio::signal::ctrl_c() => {
                Err("aborted by Ctrl-C while waiting for a connection".into())
            }
        }
    } else {
        let fd = args.fd.ok_or("one of --fd or --listen is required")?;
        inherit_fd(fd)
    }
}

#[cfg(unix)]
fn inherit_fd(fd: i32) -> Result<(tokio::net::TcpStream, SocketAddr), Box<dyn std::error::Error>> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: the parent daemon guarantees `fd` is a valid, already
    // accepted, open TCP socket handed off exclusively to this process;
    // nothing else in this process holds or closes it independently.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    std_stream.set_nonblocking(true)?;
    let stream = tokio::net::TcpStream::from_std(std_stream)?;
    let peer_addr = stream.peer_addr()?;
    Ok((stream, peer_addr))
}

#[cfg(not(unix))]
fn inherit_fd(_fd: i32) -> Result<(tokio::net::TcpStream, SocketAddr), Box<dyn std::error::Error>> {
    Err("--fd is only supported on unix platforms".into())
}
