//! Wake-on-LAN magic packets.
//!
//! A powered-on worker relays wake requests onto its local segment, since
//! the master is usually not on the target's broadcast domain.

use tokio::net::UdpSocket;
use tracing::info;

use crate::error::{FleetError, Result};

const WOL_PORT: u16 = 9;
const PACKET_LEN: usize = 102;

/// Parse `aa:bb:cc:dd:ee:ff` (also accepts `-` separators).
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac.split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(FleetError::Transport(format!("invalid MAC address: {mac}")));
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16)
            .map_err(|_| FleetError::Transport(format!("invalid MAC address: {mac}")))?;
    }
    Ok(out)
}

/// Six 0xFF bytes followed by the MAC sixteen times.
pub fn magic_packet(mac: [u8; 6]) -> [u8; PACKET_LEN] {
    let mut pkt = [0u8; PACKET_LEN];
    pkt[..6].fill(0xFF);
    for i in 0..16 {
        pkt[6 + i * 6..6 + (i + 1) * 6].copy_from_slice(&mac);
    }
    pkt
}

pub async fn send_wake(mac: &str) -> Result<()> {
    let packet = magic_packet(parse_mac(mac)?);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let sent = socket
        .send_to(&packet, ("255.255.255.255", WOL_PORT))
        .await?;
    if sent != PACKET_LEN {
        return Err(FleetError::Transport(format!(
            "short wake-on-lan send: {sent} of {PACKET_LEN} bytes"
        )));
    }
    info!(%mac, "sent wake-on-lan packet");
    Ok(())
}
