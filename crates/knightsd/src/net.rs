//! The network loop: bridges WebSocket connections to the
//! single-threaded `KnightsServer`.
//!
//! The server object is owned by one task; per-connection reader and
//! writer tasks talk to it through channels. A fixed cadence runs the
//! lifecycle maintenance (empty-game cleanup, warm-config game creation)
//! and flushes pending output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use knights_protocol::PlayerId;
use knights_server::{ConfigLoader, KnightsServer};
use knights_transport::{PacketConn, WsListener};

use crate::config::Config;

/// Output flush cadence.
const FLUSH_INTERVAL_MS: u64 = 10;

/// Maintenance cadence (game lifecycle, fatal-session sweep).
const MAINTENANCE_INTERVAL_MS: u64 = 100;

enum NetEvent {
    Connected {
        addr: String,
        outbound: UnboundedSender<Vec<u8>>,
        reply: tokio::sync::oneshot::Sender<u64>,
    },
    Data(u64, Vec<u8>),
    Closed(u64),
}

/// Runs the server until `quit` is set (by the signal handler).
pub async fn run(
    mut server: KnightsServer,
    config: Config,
    loader: ConfigLoader,
    quit: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let listener = WsListener::bind(&format!("0.0.0.0:{}", config.port))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    info!(port = config.port, "server is now running");

    let (event_tx, mut event_rx) = unbounded_channel();

    // accept loop
    let accept_tx = event_tx.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    error!(error = %err, "accept failed");
                    continue;
                }
            };
            spawn_connection(conn, accept_tx.clone());
        }
    });

    let broadcast = if config.use_broadcast {
        Some(crate::broadcast::BroadcastResponder::bind(&config).await?)
    } else {
        None
    };

    let mut outbound: HashMap<u64, UnboundedSender<Vec<u8>>> = HashMap::new();
    let mut flush = tokio::time::interval(Duration::from_millis(FLUSH_INTERVAL_MS));
    let mut maintenance = tokio::time::interval(Duration::from_millis(MAINTENANCE_INTERVAL_MS));

    loop {
        if quit.load(Ordering::Relaxed) {
            break;
        }

        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                handle_event(&mut server, &mut outbound, event);
                // drain whatever arrived in the same batch
                while let Ok(event) = event_rx.try_recv() {
                    handle_event(&mut server, &mut outbound, event);
                }
                flush_outputs(&mut server, &mut outbound);
            }
            _ = flush.tick() => {
                flush_outputs(&mut server, &mut outbound);
            }
            _ = maintenance.tick() => {
                server.poll_sessions();
                let mut warm = || match loader.take() {
                    Ok(config) => config,
                    Err(err) => {
                        // a dead loader is a server-fatal condition
                        error!(error = %err, "configuration loader failed; shutting down");
                        quit.store(true, Ordering::Relaxed);
                        None
                    }
                };
                server.check_games(config.max_games as usize, &mut warm);

                if let Some(b) = &broadcast {
                    b.respond(server.num_players()).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                quit.store(true, Ordering::Relaxed);
            }
        }
    }

    info!("shutting down");
    accept_task.abort();
    flush_outputs(&mut server, &mut outbound);
    server.shutdown();
    Ok(())
}

fn handle_event(
    server: &mut KnightsServer,
    outbound: &mut HashMap<u64, UnboundedSender<Vec<u8>>>,
    event: NetEvent,
) {
    match event {
        NetEvent::Connected {
            addr,
            outbound: tx,
            reply,
        } => {
            let conn_id = server.new_client_connection(&addr, PlayerId::default());
            outbound.insert(conn_id, tx);
            let _ = reply.send(conn_id);
        }
        NetEvent::Data(conn_id, data) => {
            server.receive_input_data(conn_id, &data);
        }
        NetEvent::Closed(conn_id) => {
            server.connection_closed(conn_id);
            outbound.remove(&conn_id);
        }
    }
}

fn flush_outputs(server: &mut KnightsServer, outbound: &mut HashMap<u64, UnboundedSender<Vec<u8>>>) {
    outbound.retain(|&conn_id, tx| {
        let data = server.get_output_data(conn_id);
        if data.is_empty() {
            return true;
        }
        tx.send(data).is_ok()
    });

    // connections that earned a protocol error are dropped once their
    // error has been flushed
    for conn_id in server.take_connections_to_close() {
        if let Some(tx) = outbound.remove(&conn_id) {
            warn!(conn = conn_id, "closing misbehaving connection");
            drop(tx); // writer task closes the socket
        }
        server.connection_closed(conn_id);
    }
}

fn spawn_connection(conn: Arc<knights_transport::WsConn>, events: UnboundedSender<NetEvent>) {
    tokio::spawn(async move {
        let (out_tx, out_rx) = unbounded_channel::<Vec<u8>>();
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        if events
            .send(NetEvent::Connected {
                addr: conn.peer().to_owned(),
                outbound: out_tx,
                reply: reply_tx,
            })
            .is_err()
        {
            return;
        }
        let Ok(conn_id) = reply_rx.await else { return };

        // writer half
        let writer_conn = Arc::clone(&conn);
        let writer = tokio::spawn(async move {
            let mut out_rx: UnboundedReceiver<Vec<u8>> = out_rx;
            while let Some(data) = out_rx.recv().await {
                if writer_conn.send(&data).await.is_err() {
                    break;
                }
            }
            let _ = writer_conn.close().await;
        });

        // reader half
        loop {
            match conn.recv().await {
                Ok(Some(data)) => {
                    if events.send(NetEvent::Data(conn_id, data)).is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = events.send(NetEvent::Closed(conn_id));
                    break;
                }
            }
        }
        writer.abort();
    });
}
