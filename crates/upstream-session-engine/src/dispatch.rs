// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC dispatch loop tying together the handshake, the
//! missed-product stream, and the backlog stream over one
//! accepted socket.
//!
//! One dispatcher runs per process, driving exactly one [`Session`] from
//! `INIT` through `DONE`. It is the sole task that ever touches
//! either half of the transport, which is what lets [`SessionTransport`]
//! dispense with any internal locking.

use crate::circuit::CircuitProvisioner;
use crate::manager_client::MulticastManagerClient;
use crate::policy::PolicyOracle;
use crate::product_queue::ProductClass;
use crate::protocol::{BacklogSpec, ProductInfo, SessionMessage, SubscriptionReply, SubscriptionRequest};
use crate::session::{EngineError, Session};
use crate::transport::SessionTransport;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Collaborators the dispatcher needs beyond the session itself. Grouped
/// so `run_session` doesn't take an unwieldy parameter list.
pub struct Dependencies<'a> {
    pub policy: &'a dyn PolicyOracle,
    pub circuit: &'a mut dyn CircuitProvisioner,
    pub manager: &'a dyn MulticastManagerClient,
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
}

/// Drives one accepted connection through the handshake and, on success,
/// the post-handshake asynchronous request loop, until the peer closes
/// the socket or a fatal transport error occurs. On every exit path --
/// rejection, fatal error, or peer disconnect -- releases the manager
/// allocation and virtual circuit before returning.
pub async fn run_session(
    session: &mut Session,
    stream: TcpStream,
    peer_addr: SocketAddr,
    deps: &mut Dependencies<'_>,
) -> Result<(), EngineError> {
    let result = run_session_inner(session, stream, peer_addr, deps).await;
    session.teardown(deps.manager, deps.circuit).await;
    result
}

async fn run_session_inner(
    session: &mut Session,
    stream: TcpStream,
    peer_addr: SocketAddr,
    deps: &mut Dependencies<'_>,
) -> Result<(), EngineError> {
    let mut transport = SessionTransport::from_stream(stream, deps.max_frame_size);

    let request: SubscriptionRequest = match tokio::time::timeout(
        deps.handshake_timeout,
        transport.recv_request::<SubscriptionRequest>(),
    )
    .await
    {
        Ok(Ok(Some(req))) => req,
        Ok(Ok(None)) => {
            tracing::info!("peer closed connection before sending subscribe request");
            session.mark_done();
            return Ok(());
        }
        Ok(Err(e)) => {
            session.mark_done();
            send_fatal_error(&mut transport, e.to_string()).await;
            return Err(EngineError::System(e.to_string()));
        }
        Err(_) => {
            tracing::warn!("handshake timed out waiting for subscribe request");
            session.mark_done();
            send_fatal_error(&mut transport, "handshake timeout").await;
            return Err(EngineError::System("handshake timeout".into()));
        }
    };

    let reply = match session
        .handshake(
            request.desired_feed,
            &request.vc_end,
            peer_addr.ip(),
            deps.policy,
            deps.circuit,
            deps.manager,
        )
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            // Handshake step 6's system failures (§4.6): the dispatch layer
            // sends a generic system error frame in place of the
            // `SubscriptionReply` the peer was waiting for, then closes.
            session.mark_done();
            send_fatal_error(&mut transport, e.to_string()).await;
            return Err(e);
        }
    };

    if let Err(e) = transport.send_handshake_reply(&reply).await {
        session.mark_done();
        return Err(EngineError::System(e.to_string()));
    }

    let SubscriptionReply::Ok { .. } = reply else {
        // UNAUTH / NOENT: a normal, terminal reply. The session never
        // reaches SERVING; there is nothing further to dispatch.
        session.mark_done();
        return Ok(());
    };

    session.install_transport(transport);

    loop {
        let msg = {
            let transport = session
                .transport_mut()
                .expect("SERVING session always has an installed transport");
            transport.recv_request::<SessionMessage>().await
        };

        match msg {
            Ok(Some(SessionMessage::RequestProduct { index })) => {
                if let Err(e) = handle_request_product(session, index).await {
                    session.stats.transport_errors += 1;
                    session.mark_done();
                    send_fatal_error_on_session(session, e.to_string()).await;
                    return Err(e);
                }
            }
            Ok(Some(SessionMessage::RequestBacklog { spec })) => {
                if let Err(e) = handle_request_backlog(session, &spec).await {
                    session.stats.transport_errors += 1;
                    session.mark_done();
                    send_fatal_error_on_session(session, e.to_string()).await;
                    return Err(e);
                }
            }
            Ok(Some(SessionMessage::TestConnection)) => {
                tracing::debug!("received liveness probe");
            }
            Ok(Some(other)) => {
                tracing::warn!(?other, "peer sent an engine-originated message type; ignoring");
            }
            Ok(None) => {
                tracing::info!("peer closed connection");
                session.mark_done();
                return Ok(());
            }
            Err(e) => {
                session.stats.transport_errors += 1;
                session.mark_done();
                send_fatal_error_on_session(session, e.to_string()).await;
                return Err(EngineError::System(e.to_string()));
            }
        }
    }
}

/// Best-effort delivery of a fatal-error frame to the peer before the
/// socket closes (§7: "a hard failure produces an RPC 'system error' and
/// a closed socket"). The send itself may fail if the transport is what
/// broke in the first place; that secondary failure is only logged, since
/// the session is already on its way to `DONE` regardless.
async fn send_fatal_error(transport: &mut SessionTransport, message: impl Into<String>) {
    let msg = SessionMessage::Error {
        code: 1,
        message: message.into(),
    };
    if let Err(e) = transport.send_one_way(&msg).await {
        tracing::debug!(error = %e, "could not deliver fatal-error frame; socket already unusable");
    }
}

/// Same as [`send_fatal_error`], but reaches through an already-`SERVING`
/// session's installed transport rather than a bare [`SessionTransport`].
async fn send_fatal_error_on_session(session: &mut Session, message: impl Into<String>) {
    if let Some(transport) = session.transport_mut() {
        send_fatal_error(transport, message).await;
    }
}

/// Missed-product stream.
async fn handle_request_product(session: &mut Session, index: u64) -> Result<(), EngineError> {
    let signature = session.index_map().and_then(|m| m.get(index));

    let Some(signature) = signature else {
        return send(session, SessionMessage::NoSuchProduct { index }).await;
    };

    let product = session
        .product_queue_mut()
        .expect("SERVING session always has an open product queue")
        .get_by_signature(signature)
        .map_err(EngineError::from)?;

    match product {
        None => {
            session.stats.missed_product_misses += 1;
            send(session, SessionMessage::NoSuchProduct { index }).await
        }
        Some(product) => {
            session.stats.missed_product_hits += 1;
            let info = ProductInfo {
                signature: product.signature.into(),
                feed: product.feed,
                seq: product.seq,
                timestamp_unix: product.timestamp_unix,
                origin: product.origin,
                size: product.payload.len() as u32,
            };
            send(
                session,
                SessionMessage::DeliverMissedProduct {
                    index,
                    info,
                    data: product.payload,
                },
            )
            .await
        }
    }
}

/// Backlog stream.
async fn handle_request_backlog(session: &mut Session, spec: &BacklogSpec) -> Result<(), EngineError> {
    use crate::product_queue::CursorResult;

    let before: crate::protocol::Signature = spec
        .before
        .clone()
        .try_into()
        .map_err(|_| EngineError::Inval("malformed backlog `before` signature".into()))?;

    let queue = session
        .product_queue_mut()
        .expect("SERVING session always has an open product queue");

    if spec.after_is_set {
        let after: crate::protocol::Signature = spec
            .after
            .clone()
            .try_into()
            .map_err(|_| EngineError::Inval("malformed backlog `after` signature".into()))?;

        match queue.set_cursor_from_signature(after).map_err(EngineError::from)? {
            CursorResult::Ok => {}
            CursorResult::NotFound => {
                position_cursor_by_time(queue, spec.time_offset_secs)?;
            }
        }
    } else {
        position_cursor_by_time(queue, spec.time_offset_secs)?;
    }

    let class = ProductClass::narrowed_to(session.feed());

    loop {
        let queue = session
            .product_queue_mut()
            .expect("SERVING session always has an open product queue");
        let next = queue.next_matching(&class).map_err(EngineError::from)?;

        let Some(product) = next else {
            session.stats.backlog_requests_ended_at_queue_end += 1;
            tracing::info!("backlog replay reached end-of-queue without seeing the stop signature");
            return Ok(());
        };

        if product.signature == before {
            session.stats.backlog_requests_stopped_at_before += 1;
            return Ok(());
        }

        session.stats.backlog_products_delivered += 1;
        let info = ProductInfo {
            signature: product.signature.into(),
            feed: product.feed,
            seq: product.seq,
            timestamp_unix: product.timestamp_unix,
            origin: product.origin,
            size: product.payload.len() as u32,
        };
        send(
            session,
            SessionMessage::DeliverBacklogProduct {
                info,
                data: product.payload,
            },
        )
        .await?;
    }
}

fn position_cursor_by_time(
    queue: &mut (dyn crate::product_queue::ProductQueue + 'static),
    time_offset_secs: u64,
) -> Result<(), EngineError> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let target = (now - time_offset_secs as i64).max(0);
    queue.set_cursor_from_time(target).map_err(EngineError::from)
}

async fn send(session: &mut Session, msg: SessionMessage) -> Result<(), EngineError> {
    let transport = session
        .transport_mut()
        .expect("SERVING session always has an installed transport");
    transport.send_one_way(&msg).await.map_err(|e| EngineError::System(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::fakes::FakeCircuitProvisioner;
    use crate::manager_client::fakes::FakeManagerClient;
    use crate::policy::fakes::FakePolicyOracle;
    use crate::product_queue::fixtures::{create_schema, insert_product};
    use crate::protocol::{SignatureWire, VcEndpoint};
    use crate::session::Session;
    use tempfile::tempdir;

    fn sig(b: u8) -> crate::protocol::Signature {
        [b; 16]
    }

    async fn built_session(dir: &std::path::Path) -> Session {
        crate::index_map::write_index_file(dir, 0x0F, &[(1, sig(1))]).unwrap();
        let conn = rusqlite::Connection::open(dir.join("queue.db")).unwrap();
        create_schema(&conn);
        insert_product(
            &conn,
            &crate::product_queue::Product {
                signature: sig(1),
                feed: 0x0F,
                seq: 1,
                timestamp_unix: 100,
                origin: "origin-a".into(),
                payload: vec![9, 9, 9],
            },
        );

        let mut session = Session::new(
            VcEndpoint {
                switch_id: "local-sw".into(),
                port_id: "p1".into(),
                vlan_id: 100,
            },
            dir.join("queue.db"),
            dir.to_path_buf(),
        );

        let policy = FakePolicyOracle::default().allow("10.0.0.5".parse().unwrap(), 0x0F);
        let mut circuit = FakeCircuitProvisioner::default();
        let manager = FakeManagerClient::default();

        session
            .handshake(
                0x0F,
                &VcEndpoint {
                    switch_id: "peer-sw".into(),
                    port_id: "p1".into(),
                    vlan_id: 100,
                },
                "10.0.0.5".parse().unwrap(),
                &policy,
                &mut circuit,
                &manager,
            )
            .await
            .unwrap();

        session
    }

    /// A connected loopback TCP pair, standing in for the accepted socket
    /// and the peer's end of it.
    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            client
        );
        (server, client.unwrap())
    }

    #[tokio::test]
    async fn run_session_releases_circuit_and_manager_allocation_on_peer_close() {
        let dir = tempdir().unwrap();
        crate::index_map::write_index_file(dir.path(), 0x0F, &[]).unwrap();
        let conn = rusqlite::Connection::open(dir.path().join("queue.db")).unwrap();
        create_schema(&conn);

        let mut session = Session::new(
            VcEndpoint {
                switch_id: "local-sw".into(),
                port_id: "p1".into(),
                vlan_id: 100,
            },
            dir.path().join("queue.db"),
            dir.path().to_path_buf(),
        );

        let policy = FakePolicyOracle::default().allow("127.0.0.1".parse().unwrap(), 0x0F);
        let mut circuit = FakeCircuitProvisioner::default();
        let manager = FakeManagerClient::default();

        let (server, client) = loopback_pair().await;
        let peer_addr = client.local_addr().unwrap();

        let mut deps = Dependencies {
            policy: &policy,
            circuit: &mut circuit,
            manager: &manager,
            max_frame_size: 1024 * 1024,
            handshake_timeout: std::time::Duration::from_secs(5),
        };

        let request = SubscriptionRequest {
            desired_feed: 0x0F,
            vc_end: VcEndpoint {
                switch_id: "peer-sw".into(),
                port_id: "p1".into(),
                vlan_id: 100,
            },
        };
        let mut client_transport = SessionTransport::from_stream(client, 1024 * 1024);

        // Drive the server and the peer concurrently: the peer must read
        // the handshake reply (and only then close) while the server is
        // simultaneously waiting to send it, or the two sides deadlock.
        let client_fut = async move {
            client_transport.send_handshake_reply(&request).await.unwrap();
            let _reply: SubscriptionReply = client_transport.recv_request().await.unwrap().unwrap();
            // Dropping the transport here closes the socket, so once the
            // server loops back around for the next request it sees a
            // clean EOF and treats it as an ordinary peer disconnect.
        };
        let (result, _) = tokio::join!(run_session(&mut session, server, peer_addr, &mut deps), client_fut);
        result.unwrap();

        assert!(session.is_done());
        assert_eq!(manager.unsubscribed.lock().unwrap().len(), 1);
        assert_eq!(circuit.removed.len(), 1);
    }

    #[tokio::test]
    async fn handshake_system_failure_sends_error_frame_before_closing() {
        let dir = tempdir().unwrap();

        let mut session = Session::new(
            VcEndpoint {
                switch_id: "local-sw".into(),
                port_id: "p1".into(),
                vlan_id: 100,
            },
            dir.path().join("queue.db"),
            dir.path().to_path_buf(),
        );

        let policy = FakePolicyOracle::default().allow("127.0.0.1".parse().unwrap(), 0x0F);
        let mut circuit = FakeCircuitProvisioner::default();
        let manager = FakeManagerClient {
            fail_subscribe: true,
            ..Default::default()
        };

        let (server, client) = loopback_pair().await;
        let peer_addr = client.local_addr().unwrap();

        let mut deps = Dependencies {
            policy: &policy,
            circuit: &mut circuit,
            manager: &manager,
            max_frame_size: 1024 * 1024,
            handshake_timeout: std::time::Duration::from_secs(5),
        };

        let request = SubscriptionRequest {
            desired_feed: 0x0F,
            vc_end: VcEndpoint {
                switch_id: "peer-sw".into(),
                port_id: "p1".into(),
                vlan_id: 100,
            },
        };
        let mut client_transport = SessionTransport::from_stream(client, 1024 * 1024);

        let client_fut = async move {
            client_transport.send_handshake_reply(&request).await.unwrap();
            let msg: SessionMessage = client_transport.recv_request().await.unwrap().unwrap();
            msg
        };
        let (result, received) =
            tokio::join!(run_session(&mut session, server, peer_addr, &mut deps), client_fut);

        assert!(result.is_err());
        assert!(matches!(received, SessionMessage::Error { .. }));
        assert!(session.is_done());
    }

    #[tokio::test]
    async fn missed_product_hit_delivers_once() {
        let dir = tempdir().unwrap();
        let mut session = built_session(dir.path()).await;

        let (server, client) = loopback_pair().await;
        session.install_transport(SessionTransport::from_stream(server, 1024 * 1024));
        let mut client = SessionTransport::from_stream(client, 1024 * 1024);

        handle_request_product(&mut session, 1).await.unwrap();

        let received: SessionMessage = client.recv_request().await.unwrap().unwrap();
        assert!(matches!(received, SessionMessage::DeliverMissedProduct { index: 1, .. }));
        assert_eq!(session.stats.missed_product_hits, 1);
    }

    #[tokio::test]
    async fn missed_product_miss_sends_no_such_product() {
        let dir = tempdir().unwrap();
        let mut session = built_session(dir.path()).await;

        let (server, client) = loopback_pair().await;
        session.install_transport(SessionTransport::from_stream(server, 1024 * 1024));
        let mut client = SessionTransport::from_stream(client, 1024 * 1024);

        handle_request_product(&mut session, 999).await.unwrap();

        let received: SessionMessage = client.recv_request().await.unwrap().unwrap();
        assert!(matches!(received, SessionMessage::NoSuchProduct { index: 999 }));
    }

    #[tokio::test]
    async fn backlog_by_signature_stops_before_target() {
        let dir = tempdir().unwrap();
        let mut session = built_session(dir.path()).await;

        let conn = rusqlite::Connection::open(dir.path().join("queue.db")).unwrap();
        for (b, ts) in [(2u8, 200i64), (3u8, 300i64), (4u8, 400i64)] {
            insert_product(
                &conn,
                &crate::product_queue::Product {
                    signature: sig(b),
                    feed: 0x0F,
                    seq: b as u64,
                    timestamp_unix: ts,
                    origin: "origin-a".into(),
                    payload: vec![b],
                },
            );
        }

        let (server, client) = loopback_pair().await;
        session.install_transport(SessionTransport::from_stream(server, 1024 * 1024));
        let mut client = SessionTransport::from_stream(client, 1024 * 1024);

        let spec = BacklogSpec {
            feed: 0x0F,
            after_is_set: true,
            after: SignatureWire::from(sig(1)),
            time_offset_secs: 0,
            before: SignatureWire::from(sig(3)),
        };

        handle_request_backlog(&mut session, &spec).await.unwrap();

        let first: SessionMessage = client.recv_request().await.unwrap().unwrap();
        assert!(matches!(first, SessionMessage::DeliverBacklogProduct { .. }));
        assert_eq!(session.stats.backlog_products_delivered, 1);
        assert_eq!(session.stats.backlog_requests_stopped_at_before, 1);
    }
}
