use std::net::SocketAddr;
use std::path::PathBuf;

use cooplink_core::device::{Device, DeviceId};
use cooplink_core::settings::ScreenEdge;
use cooplink_core::state::{SessionId, TaskId};
use cooplink_engine::engine::EngineHandle;

use crate::ui::{format_size, print_devices};

/// One line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Peers,
    Search(String),
    Add {
        id: DeviceId,
        addr: SocketAddr,
        name: String,
    },
    Rescan,
    Discovery(bool),
    Connect(String),
    Sessions,
    Accept(SessionId),
    Reject(SessionId),
    Cancel(SessionId),
    Close(SessionId),
    Send {
        session: SessionId,
        paths: Vec<PathBuf>,
    },
    Offer {
        session: SessionId,
        task: TaskId,
        accept: bool,
    },
    Abort {
        session: SessionId,
        task: TaskId,
    },
    Edge {
        session: SessionId,
        edge: ScreenEdge,
    },
    Release(SessionId),
    Clipboard(SessionId),
    History,
    Help,
    Quit,
}

fn parse_id(word: Option<&str>, what: &str) -> Result<u64, String> {
    let word = word.ok_or_else(|| format!("Missing {what}."))?;
    word.trim_start_matches('#')
        .parse()
        .map_err(|_| format!("\"{word}\" is not a valid {what}."))
}

fn session(word: Option<&str>) -> Result<SessionId, String> {
    parse_id(word, "session id").map(SessionId)
}

fn task(word: Option<&str>) -> Result<TaskId, String> {
    parse_id(word, "task id").map(TaskId)
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Err("Empty command.".into());
        };

        let cmd = match head {
            "peers" | "ls" => Self::Peers,
            "search" => Self::Search(words.collect::<Vec<_>>().join(" ")),
            "add" => {
                let usage = "Usage: add <device-id> <ip:port> [name]";
                let id = words.next().ok_or(usage)?;
                let addr = words
                    .next()
                    .ok_or(usage)?
                    .parse()
                    .map_err(|_| usage.to_string())?;
                let name = words.collect::<Vec<_>>().join(" ");
                Self::Add {
                    id: DeviceId::from(id),
                    name: if name.is_empty() { id.to_string() } else { name },
                    addr,
                }
            }
            "rescan" => Self::Rescan,
            "discovery" => match words.next() {
                Some("on") => Self::Discovery(true),
                Some("off") => Self::Discovery(false),
                _ => return Err("Usage: discovery on|off".into()),
            },
            "connect" => Self::Connect(
                words
                    .next()
                    .ok_or("Usage: connect <device-id|peer-number>")?
                    .to_string(),
            ),
            "sessions" => Self::Sessions,
            "accept" => Self::Accept(session(words.next())?),
            "reject" => Self::Reject(session(words.next())?),
            "cancel" => Self::Cancel(session(words.next())?),
            "close" => Self::Close(session(words.next())?),
            "send" => {
                let session = session(words.next())?;
                let paths: Vec<PathBuf> = words.map(PathBuf::from).collect();
                if paths.is_empty() {
                    return Err("Usage: send <session> <file|folder>...".into());
                }
                Self::Send { session, paths }
            }
            "offer" => {
                let session = session(words.next())?;
                let task = task(words.next())?;
                let accept = match words.next() {
                    Some("accept" | "a" | "yes" | "y") => true,
                    Some("reject" | "r" | "no" | "n") => false,
                    _ => return Err("Usage: offer <session> <task> accept|reject".into()),
                };
                Self::Offer {
                    session,
                    task,
                    accept,
                }
            }
            "abort" => Self::Abort {
                session: session(words.next())?,
                task: task(words.next())?,
            },
            "edge" => {
                let session = session(words.next())?;
                let edge = match words.next() {
                    Some("left") => ScreenEdge::Left,
                    Some("right") => ScreenEdge::Right,
                    _ => return Err("Usage: edge <session> left|right".into()),
                };
                Self::Edge { session, edge }
            }
            "release" => Self::Release(session(words.next())?),
            "clipboard" => Self::Clipboard(session(words.next())?),
            "history" => Self::History,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => return Err(format!("Unknown command: \"{other}\".")),
        };
        Ok(cmd)
    }
}

/// Resolves a `connect` target: a 1-based index into `peers`, or a device id.
fn resolve_peer(target: &str, handle: &EngineHandle) -> DeviceId {
    let devices = handle.devices();
    target
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| devices.get(i))
        .map_or_else(|| DeviceId::from(target), |d| d.id.clone())
}

/// Runs one command against the engine and prints the outcome.
pub async fn execute(cmd: Command, handle: &EngineHandle) {
    let result = match cmd {
        Command::Peers => {
            print_devices(&handle.devices());
            Ok(())
        }
        Command::Search(query) => {
            print_devices(&handle.search(&query));
            Ok(())
        }
        Command::Add { id, addr, name } => {
            handle.register_peer(Device::new(id, name, addr));
            Ok(())
        }
        Command::Rescan => handle.rescan().await,
        Command::Discovery(true) => handle.start_discovery().await,
        Command::Discovery(false) => handle.stop_discovery().await,
        Command::Connect(target) => {
            let peer = resolve_peer(&target, handle);
            handle.request_session(peer.clone()).await.map(|sid| {
                println!("  📤 Session #{sid}: asking {peer} to pair...");
            })
        }
        Command::Sessions => handle.sessions().await.map(|sessions| {
            if sessions.is_empty() {
                println!("  No sessions.");
            }
            for s in sessions {
                println!(
                    "  #{:<4} {:<20} {:<9} {:?}",
                    s.id,
                    s.peer_name,
                    format!("{:?}", s.direction),
                    s.state
                );
            }
        }),
        Command::Accept(sid) => handle.accept_session(sid).await,
        Command::Reject(sid) => handle.reject_session(sid).await,
        Command::Cancel(sid) => handle.cancel_session(sid).await,
        Command::Close(sid) => handle.close_session(sid).await,
        Command::Send { session, paths } => handle
            .submit_transfer(session, paths)
            .await
            .map(|task| println!("  📤 Task #{task} queued on session #{session}")),
        Command::Offer {
            session,
            task,
            accept,
        } => handle.respond_to_offer(session, task, accept).await,
        Command::Abort { session, task } => handle.cancel_transfer(session, task).await,
        Command::Edge { session, edge } => handle.edge_reached(session, edge).await.map(|handed_over| {
            if handed_over {
                println!("  🖱 Input now goes to session #{session}");
            } else {
                println!("  Input stays local (sharing disabled or other edge)");
            }
        }),
        Command::Release(sid) => handle.release_input(sid).await,
        Command::Clipboard(sid) => handle.clipboard_changed(sid).await.map(|sent| {
            if !sent {
                println!("  Clipboard not sent (sharing disabled, empty, or unchanged)");
            }
        }),
        Command::History => {
            let history = handle.history();
            if history.is_empty() {
                println!("  No finished transfers.");
            }
            for record in history {
                println!(
                    "  #{:<4} {:?} {:<12} {:>10}  {:?}  {}",
                    record.task_id,
                    record.direction,
                    record.peer,
                    format_size(record.total_bytes),
                    record.state,
                    record.files.join(", "),
                );
            }
            Ok(())
        }
        Command::Help | Command::Quit => Ok(()),
    };

    if let Err(e) = result {
        println!("  ❌ {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_parsing_offer_answer_expect_ids_and_decision() {
        assert_eq!(
            Command::parse("offer #2 7 accept"),
            Ok(Command::Offer {
                session: SessionId(2),
                task: TaskId(7),
                accept: true,
            })
        );
        assert_eq!(
            Command::parse("offer 2 7 n"),
            Ok(Command::Offer {
                session: SessionId(2),
                task: TaskId(7),
                accept: false,
            })
        );
    }

    #[test]
    fn when_parsing_send_without_files_expect_usage() {
        assert!(Command::parse("send 1").is_err());
    }

    #[test]
    fn when_parsing_send_expect_all_paths_in_order() {
        assert_eq!(
            Command::parse("send 3 a.txt b.txt"),
            Ok(Command::Send {
                session: SessionId(3),
                paths: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
            })
        );
    }

    #[test]
    fn when_parsing_add_without_name_expect_id_as_name() {
        let cmd = Command::parse("add laptop 192.168.1.20:47100").unwrap();
        assert_eq!(
            cmd,
            Command::Add {
                id: DeviceId::from("laptop"),
                addr: "192.168.1.20:47100".parse().unwrap(),
                name: "laptop".into(),
            }
        );
    }

    #[test]
    fn when_parsing_bad_session_id_expect_error() {
        assert!(Command::parse("accept abc").is_err());
        assert!(Command::parse("close").is_err());
    }

    #[test]
    fn when_parsing_unknown_word_expect_error() {
        assert!(Command::parse("fly away").is_err());
    }
}
