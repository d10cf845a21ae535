//! Line-based terminal front end.
//!
//! Reads commands from stdin and prints chat traffic, presence changes and
//! `/ui/msg/*` lines. It is a UI-class module: when it exits, the reactor
//! starts the orderly shutdown of everything else.

use std::io;

use async_trait::async_trait;
use ppcp_proto::{Presence, Status, User, UserId};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::debug;

use crate::net::users::SharedUsers;
use crate::reactor::{
    sig, ChangeFlags, ChatMessage, Context, Module, Payload, Signal, UserChange, CORE_NAME,
};

/// The terminal UI's registry name.
pub const UI_NAME: &str = "/ui/term";

/// Receiver prefix for traffic addressed at the network layer.
const NET_PREFIX: &str = "/net/";

/// The terminal module.
pub struct TermUi {
    me: User,
    lines: Lines<BufReader<Stdin>>,
    pending: Option<io::Result<Option<String>>>,
    users: Option<SharedUsers>,
}

impl TermUi {
    /// Create the UI around stdin, seeded with our own user snapshot.
    pub fn new(me: User) -> Self {
        Self {
            me,
            lines: BufReader::new(tokio::io::stdin()).lines(),
            pending: None,
            users: None,
        }
    }

    fn find_peer(&self, nick: &str) -> Option<UserId> {
        let users = self.users.as_ref()?;
        let users = users.borrow();
        users.keys().find(|id| id.nick() == nick).cloned()
    }

    fn send_message(&self, ctx: &mut Context, nick: &str, text: &str, action: bool) {
        let Some(peer) = self.find_peer(nick) else {
            println!("! no such user: {nick}");
            return;
        };
        ctx.emit(
            Signal::new(sig::MSG_SEND, UI_NAME, NET_PREFIX).with_payload(Payload::Message(
                ChatMessage {
                    peer,
                    text: text.to_string(),
                    action,
                },
            )),
        );
    }

    fn emit_self_change(&mut self, ctx: &mut Context, flags: ChangeFlags) {
        ctx.emit(
            Signal::new(sig::USER_CHANGE, UI_NAME, NET_PREFIX).with_payload(Payload::UserChange(
                UserChange {
                    user: self.me.clone(),
                    flags,
                },
            )),
        );
    }

    fn print_who(&self) {
        let Some(users) = &self.users else {
            println!("! user list not available yet");
            return;
        };
        let users = users.borrow();
        if users.is_empty() {
            println!("- nobody around");
            return;
        }
        for (id, record) in users.iter() {
            let rec = record.borrow();
            let status = &rec.user.status;
            if status.message.is_empty() {
                println!("- {} ({id}) is {}", rec.user.display_name(), status.presence);
            } else {
                println!(
                    "- {} ({id}) is {}: {}",
                    rec.user.display_name(),
                    status.presence,
                    status.message
                );
            }
        }
    }

    fn handle_line(&mut self, ctx: &mut Context, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if !line.starts_with('/') {
            println!("! use /msg <nick> <text> to talk to someone (try /help)");
            return;
        }

        let mut parts = line.splitn(2, ' ');
        let cmd = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default().trim();

        match cmd {
            "/quit" => {
                println!("- bye");
                ctx.emit(Signal::new(sig::MODULE_EXITS, UI_NAME, CORE_NAME));
            }
            "/status" => {
                let mut words = rest.splitn(2, ' ');
                let token = words.next().unwrap_or_default();
                let Some(presence) = Presence::from_wire(token) else {
                    println!("! usage: /status <online|away|xa|dnd|off> [message]");
                    return;
                };
                let message = words.next().unwrap_or_default().trim().to_string();
                self.me.status = Status::new(presence, message);
                self.emit_self_change(
                    ctx,
                    ChangeFlags {
                        status: true,
                        ..Default::default()
                    },
                );
            }
            "/name" => {
                if rest.is_empty() {
                    println!("! usage: /name <display name>");
                    return;
                }
                self.me.name = rest.to_string();
                self.emit_self_change(
                    ctx,
                    ChangeFlags {
                        name: true,
                        ..Default::default()
                    },
                );
            }
            "/msg" | "/me" => {
                let mut words = rest.splitn(2, ' ');
                let (nick, text) = (
                    words.next().unwrap_or_default(),
                    words.next().unwrap_or_default().trim(),
                );
                if nick.is_empty() || text.is_empty() {
                    println!("! usage: {cmd} <nick> <text>");
                    return;
                }
                self.send_message(ctx, nick, text, cmd == "/me");
            }
            "/who" => self.print_who(),
            "/help" => {
                println!("- commands: /msg /me /status /name /who /quit");
            }
            other => println!("! unknown command {other} (try /help)"),
        }
    }

    fn print_user_change(change: &UserChange) {
        let name = change.user.display_name();
        if change.flags.appeared {
            println!("* {name} ({}) appeared", change.user.id);
        } else if change.flags.left {
            println!("* {name} ({}) is gone", change.user.id);
        } else if change.flags.status {
            let status = &change.user.status;
            if status.message.is_empty() {
                println!("* {name} is now {}", status.presence);
            } else {
                println!("* {name} is now {}: {}", status.presence, status.message);
            }
        } else if change.flags.name {
            println!("* {} now goes by {name}", change.user.id);
        }
    }
}

#[async_trait(?Send)]
impl Module for TermUi {
    fn name(&self) -> &str {
        UI_NAME
    }

    async fn ready(&mut self) {
        // Cancel-safe: a partially read line stays buffered inside `lines`.
        let res = self.lines.next_line().await;
        self.pending = Some(res);
    }

    fn service(&mut self, ctx: &mut Context) {
        match self.pending.take() {
            Some(Ok(Some(line))) => self.handle_line(ctx, &line),
            // Stdin closed; treat it like /quit.
            Some(Ok(None)) => ctx.emit(Signal::new(sig::MODULE_EXITS, UI_NAME, CORE_NAME)),
            Some(Err(e)) => {
                println!("! input error: {e}");
                ctx.emit(Signal::new(sig::MODULE_EXITS, UI_NAME, CORE_NAME));
            }
            None => {}
        }
    }

    fn handle_signal(&mut self, ctx: &mut Context, signal: &Signal) {
        match signal.kind {
            sig::MODULE_NEW => {
                // A network module came up; ask it for the shared user table.
                if let Some(name) = signal.as_str_payload() {
                    if name.starts_with(NET_PREFIX) {
                        ctx.emit(Signal::new(sig::USERS_RQ, UI_NAME, name.to_string()));
                    }
                }
            }
            sig::USERS_RP => {
                if let Some(Payload::Users(users)) = &signal.payload {
                    self.users = Some(users.clone());
                }
            }
            sig::USER_CHANGED => {
                if let Some(Payload::UserChange(change)) = &signal.payload {
                    Self::print_user_change(change);
                }
            }
            sig::MSG_GOT => {
                if let Some(Payload::Message(msg)) = &signal.payload {
                    if msg.action {
                        println!("* {} {}", msg.peer.nick(), msg.text);
                    } else {
                        println!("<{}> {}", msg.peer.nick(), msg.text);
                    }
                }
            }
            sig::ERROR => {
                if let Some(text) = signal.as_str_payload() {
                    println!("! {text}");
                }
            }
            sig::INFO | sig::NOTICE => {
                if let Some(text) = signal.as_str_payload() {
                    println!("- {text}");
                }
            }
            sig::DEBUG => {
                if let Some(text) = signal.as_str_payload() {
                    debug!(from = %signal.sender, "{text}");
                }
            }
            sig::MODULE_QUIT => {
                ctx.emit(Signal::new(sig::MODULE_EXITS, UI_NAME, CORE_NAME));
            }
            _ => {}
        }
    }
}
