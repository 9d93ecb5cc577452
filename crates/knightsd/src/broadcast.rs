//! LAN discovery boundary: the UDP broadcast responder.
//!
//! Clients looking for LAN servers broadcast a PING datagram; the server
//! replies to the sender with its port, player count and description.
//! (Richer discovery, such as mDNS advertising, lives outside this repo.)

use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::Config;

/// Port the discovery broadcasts arrive on.
pub const BROADCAST_PORT: u16 = 16398;

const PING_MSG: &[u8] = b"KnightsPing";
const PONG_HDR: &[u8] = b"KnightsPong";

pub struct BroadcastResponder {
    socket: UdpSocket,
    game_port: u16,
    description: String,
}

impl BroadcastResponder {
    pub async fn bind(config: &Config) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", BROADCAST_PORT)).await?;
        socket.set_broadcast(true)?;
        Ok(BroadcastResponder {
            socket,
            game_port: config.port,
            description: config.description.clone(),
        })
    }

    /// Answers any pending PINGs with the current player count. Called
    /// on the maintenance cadence; never blocks for long.
    pub async fn respond(&self, num_players: usize) {
        let mut buf = [0u8; 64];
        loop {
            let recv = tokio::time::timeout(
                Duration::from_millis(1),
                self.socket.recv_from(&mut buf),
            )
            .await;
            let Ok(Ok((len, from))) = recv else { break };
            if &buf[..len] != PING_MSG {
                continue;
            }

            let players = num_players.min(u16::MAX as usize) as u16;
            let mut reply = Vec::with_capacity(PONG_HDR.len() + 5 + self.description.len());
            reply.extend_from_slice(PONG_HDR);
            reply.push((self.game_port >> 8) as u8);
            reply.push((self.game_port & 0xff) as u8);
            reply.push(b'I');
            reply.push((players >> 8) as u8);
            reply.push((players & 0xff) as u8);
            reply.extend_from_slice(self.description.as_bytes());

            debug!(%from, "answering LAN discovery ping");
            let _ = self.socket.send_to(&reply, from).await;
        }
    }
}
