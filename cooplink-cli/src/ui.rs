use std::io::Write;
use std::path::Path;
use std::time::Duration;

use cooplink_core::device::{Device, Reachability};

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// `1h02m`, `3m05s` or `42s`; `--` when unknown.
pub fn format_eta(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "--".to_string();
    };
    let secs = eta.as_secs();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m{s:02}s"),
        (h, m, _) => format!("{h}h{m:02}m"),
    }
}

/// Prints the interactive prompt marker (`> `) and flushes stdout.
pub fn print_prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}

/// Prints the startup banner with device info.
pub fn print_banner(listen_addr: &str, device_name: &str, device_id: &str, save_dir: &Path) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║                  🔗  cooplink  🔗                    ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Device  : {device_name:<41} ║");
    println!("║  Id      : {device_id:<41} ║");
    println!("║  Listen  : {listen_addr:<41} ║");
    println!("║  Save to : {:<41} ║", save_dir.display().to_string());
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints available commands.
pub fn print_help() {
    println!();
    println!("  Peers:");
    println!("    peers                          List known devices");
    println!("    search <text>                  Filter devices by name or id");
    println!("    add <id> <ip:port> [name]      Register a peer by hand");
    println!("    rescan                         Probe the network again");
    println!("    discovery on|off               Start or stop discovery");
    println!("  Sessions:");
    println!("    connect <id|peer-number>       Ask a peer to pair");
    println!("    sessions                       List sessions");
    println!("    accept|reject <session>        Answer a pairing request");
    println!("    cancel <session>               Withdraw an outgoing request");
    println!("    close <session>                End a connected session");
    println!("  Transfers:");
    println!("    send <session> <path>...       Offer files or folders to the peer");
    println!("    offer <session> <task> accept|reject");
    println!("    abort <session> <task>         Cancel a transfer");
    println!("    history                        Show finished transfers");
    println!("  Sharing:");
    println!("    edge <session> left|right      Pointer reached a screen edge");
    println!("    release <session>              Take input back");
    println!("    clipboard <session>            Push the clipboard to the peer");
    println!();
    println!("    help                           Show this help");
    println!("    quit                           Shut down and exit");
}

/// Prints a numbered device table; the numbers work with `connect`.
pub fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("  No devices found.");
        return;
    }
    for (i, device) in devices.iter().enumerate() {
        let mark = match device.reachability {
            Reachability::Connectable => "🟢",
            Reachability::Connected => "🔗",
            Reachability::Offline => "⚪",
        };
        println!(
            "  {:>2}. {mark} {:<24} {:<22} {}",
            i + 1,
            device.name,
            device.address,
            device.id
        );
    }
}

/// Reads one trimmed line from the given buffered stdin reader.
/// Returns `None` on EOF or read error.
pub async fn read_line(reader: &mut tokio::io::BufReader<tokio::io::Stdin>) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_formatting_sizes_expect_binary_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MiB");
    }

    #[test]
    fn when_formatting_eta_expect_two_largest_units() {
        assert_eq!(format_eta(None), "--");
        assert_eq!(format_eta(Some(Duration::from_secs(42))), "42s");
        assert_eq!(format_eta(Some(Duration::from_secs(185))), "3m05s");
        assert_eq!(format_eta(Some(Duration::from_secs(3720))), "1h02m");
    }
}
