use tokio::sync::broadcast;

use cooplink_core::device::DeviceEvent;
use cooplink_core::state::{SessionId, SessionState, TransferState};
use cooplink_engine::discovery::DiscoveryEvent;
use cooplink_engine::engine::EngineEvent;
use cooplink_engine::progress::Progress;
use cooplink_engine::session::SessionEvent;

use crate::ui::{format_eta, format_size, print_prompt};

/// Spawns a task that listens for engine events and prints them.
pub fn spawn_event_printer(mut events_rx: broadcast::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(EngineEvent::Accepting { addr }) => {
                    println!("\n  ✔ Listening on {addr}");
                }
                Ok(EngineEvent::AcceptingStopped) => {
                    println!("\n  ⏹ Stopped accepting connections");
                }
                Ok(EngineEvent::Discovery(event)) => print_discovery(&event),
                Ok(EngineEvent::SessionCreated {
                    session_id,
                    peer,
                    direction,
                }) => {
                    println!("\n  📡 Session #{session_id} ({direction:?}) with {peer}");
                }
                Ok(EngineEvent::Session { session_id, event }) => {
                    print_session_event(session_id, event);
                    // Progress redraws in place.
                    continue;
                }
                Ok(EngineEvent::Error { message }) => {
                    println!("\n  ❌ Engine error: {message}");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("\n  ⚠ Missed {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
            print_prompt();
        }
    });
}

fn print_discovery(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::Device(DeviceEvent::Appeared(device)) => {
            println!("\n  ➕ Found \"{}\" at {}", device.name, device.address);
        }
        DiscoveryEvent::Device(DeviceEvent::Updated(device)) => {
            tracing::debug!(device = %device.id, reachability = ?device.reachability, "Device updated");
        }
        DiscoveryEvent::Device(DeviceEvent::Disappeared(id)) => {
            println!("\n  ➖ Lost {id}");
        }
        DiscoveryEvent::NetworkUnavailable => {
            println!("\n  ⚠ Network unavailable, discovery retrying");
        }
        DiscoveryEvent::NetworkRestored => {
            println!("\n  ✔ Network restored");
        }
    }
}

fn print_session_event(session_id: SessionId, event: SessionEvent) {
    match event {
        SessionEvent::IncomingRequest { peer, peer_name } => {
            println!();
            println!("  📥 Session #{session_id}: \"{peer_name}\" ({peer}) wants to pair.");
            println!("     Type 'accept {session_id}' or 'reject {session_id}'.");
        }
        SessionEvent::StateChanged { state, reason } => match (state, reason) {
            (SessionState::Connected, _) => {
                println!("\n  🤝 Session #{session_id}: connected");
            }
            (state, Some(reason)) => {
                println!("\n  👋 Session #{session_id}: {state:?} ({reason})");
            }
            (state, None) => {
                println!("\n  • Session #{session_id}: {state:?}");
            }
        },
        SessionEvent::IncomingTransferOffer {
            task_id,
            files,
            total_bytes,
        } => {
            println!();
            println!(
                "  📥 Session #{session_id}: offer #{task_id}, {} file(s), {}",
                files.len(),
                format_size(total_bytes)
            );
            for file in &files {
                println!("     {}  ({})", file.name, format_size(file.size));
            }
            println!("     Type 'offer {session_id} {task_id} accept' or '... reject'.");
        }
        SessionEvent::TransferProgress { task_id, progress } => {
            print_progress(session_id, task_id.0, &progress);
            return;
        }
        SessionEvent::TransferStateChanged {
            task_id,
            direction,
            state,
            reason,
        } => {
            let icon = match state {
                TransferState::Completed => "🎉",
                TransferState::Rejected(_) => "🚫",
                TransferState::Canceled | TransferState::Failed(_) => "❌",
                _ => "•",
            };
            match reason {
                Some(reason) => println!(
                    "\n  {icon} Session #{session_id}: task #{task_id} ({direction:?}) {state:?}: {reason}"
                ),
                None => println!(
                    "\n  {icon} Session #{session_id}: task #{task_id} ({direction:?}) {state:?}"
                ),
            }
        }
    }
    print_prompt();
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn print_progress(session_id: SessionId, task: u64, progress: &Progress) {
    // Overwrite the same line with \r for a compact progress bar.
    let bar_width: usize = 30;
    let filled = (f64::from(progress.percent) / 100.0 * bar_width as f64) as usize;
    let empty = bar_width - filled.min(bar_width);
    print!(
        "\r  📊 #{session_id}/{task} [{}{}] {:>3}%  {} / {}  {}/s  eta {}",
        "█".repeat(filled.min(bar_width)),
        "░".repeat(empty),
        progress.percent,
        format_size(progress.bytes),
        format_size(progress.total),
        format_size(progress.bytes_per_sec as u64),
        format_eta(progress.eta),
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
    if progress.percent >= 100 {
        println!();
    }
}
