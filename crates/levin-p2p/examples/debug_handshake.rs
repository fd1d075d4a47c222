//! Debug handshake tool - connects to a peer and displays handshake exchange
//!
//! Usage: cargo run --example debug_handshake -- <ip:port>
//! Example: cargo run --example debug_handshake -- 127.0.0.1:11897

use levin_p2p::{
    parse_peer_address, ControllerConfig, NetworkEvent, ProtocolController, DEFAULT_PORT,
};
use std::env;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let addr = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:11897");
    let peer = parse_peer_address(addr, DEFAULT_PORT).ok_or("invalid peer address")?;

    let controller = ProtocolController::new(ControllerConfig {
        bind_ip: "127.0.0.1".to_string(),
        bind_port: 0,
        ..Default::default()
    });
    let mut events = controller.subscribe();
    controller.listen().await?;

    println!("Local id: {}", controller.local_id());
    println!("Connecting to {}...", peer.address());
    let id = controller.connect(&peer).await?;
    println!("Connected as {}, handshake sent. Waiting for reply...", id);

    let reply = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(NetworkEvent::Handshake { id, payload }) => return Some((id, payload)),
                Ok(NetworkEvent::Disconnect { error, .. }) => {
                    println!("Peer disconnected: {:?}", error);
                    return None;
                }
                Ok(event) => println!("Event: {}", event.name()),
                Err(_) => return None,
            }
        }
    })
    .await;

    match reply {
        Ok(Some((id, payload))) => {
            println!("Handshake from {}", id);
            println!("  Network:   {}", payload.network_id);
            println!("  Version:   {}", payload.version);
            println!("  Port:      {}", payload.my_port);
            println!("  Height:    {}", payload.payload_data.current_height);
            println!("  Peers:     {}", payload.local_peerlist.len());
            for entry in payload.local_peerlist.iter().take(10) {
                println!("    {}", entry);
            }
        }
        Ok(None) => println!("No handshake received"),
        Err(_) => println!("Timed out waiting for handshake"),
    }

    controller.shutdown().await;
    Ok(())
}
