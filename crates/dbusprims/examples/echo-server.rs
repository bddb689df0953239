//! Minimal echo peer: accepts one client and returns every call's body.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- call unix:path=/tmp/dbusprims-echo-<pid>/bus.sock \
//!     --member Echo --signature su --arg hello --arg 7

use std::fs;

use dbusprims::peer::ConnectionListener;
use dbusprims::wire::{Message, MessageType};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("dbusprims-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("bus.sock");

    // Ensure no stale socket
    let _ = fs::remove_file(&sock_path);

    let listener = ConnectionListener::bind(&format!("unix:path={}", sock_path.display()))?;
    eprintln!("Listening on {}", listener.address());

    let mut conn = listener.accept()?;
    eprintln!("Client connected: {}", conn.unique_name().unwrap_or("?"));

    loop {
        match conn.recv() {
            Ok(call) if call.message_type == MessageType::MethodCall => {
                eprintln!("{call}");
                let body = if call.member.as_deref() == Some("Hello") {
                    vec![conn.unique_name().unwrap_or_default().into()]
                } else {
                    call.body().to_vec()
                };
                let signature = if call.member.as_deref() == Some("Hello") {
                    "s".to_string()
                } else {
                    call.signature().as_str().to_string()
                };
                conn.send(Message::method_return(&call).with_body(&signature, body)?)?;
            }
            Ok(other) => eprintln!("Ignoring {other}"),
            Err(e) => {
                eprintln!("Client disconnected: {e}");
                break;
            }
        }
    }

    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
