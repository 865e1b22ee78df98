// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! TCP endpoint through which managed processes connect back to the controller.

use crate::controller::ProcessController;
use crate::master::Master;
use crate::protocol::peer::{self, PeerEvent, PeerRequest};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PeerServer {
    listener: TcpListener,
    controller: ProcessController,
}

impl PeerServer {
    pub async fn bind(addr: &str, controller: ProcessController) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            controller,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires. Each connection runs in its own task.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "peer server listening");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let controller = self.controller.clone();
                        tokio::spawn(handle_connection(stream, addr, controller));
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }
        debug!("peer server stopped");
    }
}

/// Authenticate one peer, then serve its requests until it disconnects.
///
/// Peers present the key of a managed process. Only the initial process may
/// issue requests and receive events; other peers are accepted and ignored.
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, controller: ProcessController) {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let (requested, key) = match peer::read_greeting(&mut reader).await {
        Ok(greeting) => greeting,
        Err(e) => {
            warn!(peer = %addr, error = %e, "rejecting connection");
            return;
        }
    };
    let Some(process) = controller.process_by_auth_key(&key).await else {
        warn!(peer = %addr, "received connection with unknown credentials");
        return;
    };
    let version = peer::negotiate(requested);
    if let Err(e) = send(&mut writer, &[version]).await {
        warn!(peer = %addr, error = %e, "failed to answer greeting");
        return;
    }

    let server_manager = process.is_initial();
    info!(peer = %addr, process = %process.name(), version, server_manager, "peer authenticated");

    let (events, outbox) = mpsc::unbounded_channel();
    let subscription = if server_manager {
        Some(controller.register_peer(events.clone()).await)
    } else {
        None
    };
    let writer_task = tokio::spawn(write_events(writer, outbox, addr));

    loop {
        match PeerRequest::read_from(&mut reader).await {
            Ok(Some(request)) if server_manager => {
                dispatch(request, &controller, &events).await;
            }
            Ok(Some(request)) => {
                debug!(peer = %addr, tag = request.tag(), "ignoring request from unprivileged peer");
            }
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %addr, error = %e, "closing connection");
                break;
            }
        }
    }

    if let Some(id) = subscription {
        controller.unregister_peer(id).await;
    }
    drop(events);
    let _ = writer_task.await;
    info!(peer = %addr, process = %process.name(), "peer disconnected");
}

async fn dispatch(
    request: PeerRequest,
    controller: &ProcessController,
    events: &mpsc::UnboundedSender<PeerEvent>,
) {
    match request {
        PeerRequest::AddProcess {
            name,
            working_dir,
            command,
            env,
        } => controller.add_process(name, command, env, working_dir).await,
        PeerRequest::StartProcess { name } => controller.start_process(&name).await,
        PeerRequest::StopProcess { name } => controller.stop_process(&name).await,
        PeerRequest::RemoveProcess { name } => controller.remove_process(&name).await,
        PeerRequest::RequestProcessInventory => {
            let _ = events.send(PeerEvent::ProcessInventory(controller.inventory().await));
        }
        PeerRequest::SendStdin { name, bytes } => controller.send_stdin(&name, bytes).await,
        PeerRequest::Shutdown => {
            let controller = controller.clone();
            tokio::spawn(async move { controller.shutdown().await });
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn write_events<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbox: mpsc::UnboundedReceiver<PeerEvent>,
    addr: SocketAddr,
) {
    while let Some(event) = outbox.recv().await {
        if let Err(e) = send(&mut writer, &event.encode()).await {
            debug!(peer = %addr, error = %e, "peer went away");
            break;
        }
    }
}
