//! The network component: sockets, peer discovery, presence, messaging.
//!
//! One module owns every socket: the TCP listener, the multicast UDP
//! socket, every accepted or dialed TCP link, and any in-flight outbound
//! connects. Its readiness future multiplexes them all; `service` then does
//! only nonblocking work. Discovery runs over UDP (periodic status
//! announcements to the group, unicast replies to status requests), chat
//! runs over per-peer TCP links with a two-sided close handshake.

pub mod connection;
pub mod users;

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::task::Poll;

use async_trait::async_trait;
use futures_util::future::select_all;
use ppcp_proto::ppcp::PpcpToken;
use ppcp_proto::{wire, Addr, PpcpTokenizer, Presence, Status, User, UserId, XmlTokenizer};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::reactor::{
    sig, ChangeFlags, ChatMessage, Context, Module, Payload, Signal, UserChange,
};
use connection::Connection;
use users::{ConnId, UserTable};

/// The network module's registry name.
pub const NET_NAME: &str = "/net/ppcp";

/// Aging passes run every this many ticks.
const AGE_EVERY: u64 = 10;

/// What the readiness future observed, handed to `service`.
enum Pending {
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Udp(io::Result<()>),
    Conn { id: ConnId, res: io::Result<()> },
    Connect(usize),
}

/// An outbound TCP connect still in flight, with the traffic that caused it.
struct PendingConnect {
    peer: UserId,
    bodies: Vec<String>,
    fut: Pin<Box<dyn Future<Output = io::Result<TcpStream>>>>,
    result: Option<io::Result<TcpStream>>,
}

/// The network module.
pub struct Network {
    cfg: Config,
    me: User,
    listener: TcpListener,
    udp: UdpSocket,
    conns: Vec<Connection>,
    connects: Vec<PendingConnect>,
    users: UserTable,
    next_conn: ConnId,
    pending: Option<Pending>,
    last_announce: Option<u64>,
    shutting_down: bool,
    exit_sent: bool,
}

impl Network {
    /// Bind the protocol sockets and construct the module.
    ///
    /// The UDP socket is opened through `socket2` so the address can be
    /// reused and the group joined before it is handed to tokio.
    pub async fn bind(cfg: Config) -> anyhow::Result<Self> {
        let port = cfg.net.port;
        let listener = TcpListener::bind(SocketAddrV4::new(cfg.net.bind, port)).await?;

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from(SocketAddrV4::new(cfg.net.bind, port)).into())?;
        if cfg.net.multicast_group.is_multicast() {
            socket.join_multicast_v4(&cfg.net.multicast_group, &cfg.net.bind)?;
        } else {
            socket.set_broadcast(true)?;
        }
        let udp = UdpSocket::from_std(socket.into())?;

        let id = UserId::new(cfg.nick(), Addr::new(cfg.net.bind, port))
            .map_err(|e| anyhow::anyhow!("configured identity is invalid: {e}"))?;
        let mut me = User::new(id);
        me.name = cfg.user.name.clone();
        me.status = Status::new(Presence::Online, cfg.user.status_message.clone());

        info!(%port, group = %cfg.net.multicast_group, nick = me.id.nick(), "network up");
        Ok(Self {
            cfg,
            me,
            listener,
            udp,
            conns: Vec::new(),
            connects: Vec::new(),
            users: UserTable::new(),
            next_conn: 1,
            pending: None,
            last_announce: None,
            shutting_down: false,
            exit_sent: false,
        })
    }

    /// Our own user snapshot, for seeding UI modules.
    pub fn me(&self) -> &User {
        &self.me
    }

    /// Readiness over every live connection; never resolves when there are
    /// none.
    async fn next_conn_event(conns: &[Connection]) -> (ConnId, io::Result<()>) {
        if conns.is_empty() {
            return std::future::pending().await;
        }
        let waiters = conns.iter().map(|c| {
            Box::pin(async move {
                let res = c.stream.ready(c.interest()).await.map(|_| ());
                (c.id, res)
            })
        });
        let (event, _, _) = select_all(waiters).await;
        event
    }

    /// Poll the in-flight connects in place; resolves with the index of the
    /// first one that finished, parking its result on the entry. Keeping
    /// the futures in `self` makes cancellation by the reactor harmless.
    async fn next_connect(connects: &mut [PendingConnect]) -> usize {
        if connects.is_empty() {
            return std::future::pending().await;
        }
        std::future::poll_fn(|cx| {
            for (i, pc) in connects.iter_mut().enumerate() {
                if let Poll::Ready(res) = pc.fut.as_mut().poll(cx) {
                    pc.result = Some(res);
                    return Poll::Ready(i);
                }
            }
            Poll::Pending
        })
        .await
    }

    fn emit_user(ctx: &mut Context, user: User, flags: ChangeFlags) {
        ctx.emit(
            Signal::new(sig::USER_CHANGED, NET_NAME, "/")
                .with_payload(Payload::UserChange(UserChange { user, flags })),
        );
    }

    /// Multicast (or broadcast) our current status to the group.
    fn announce(&mut self, ctx: &mut Context) {
        ctx.scratch.clear();
        ctx.scratch
            .push_str(&wire::wrapper_open(self.me.id.nick(), self.cfg.net.port));
        ctx.scratch
            .push_str(&wire::status_elem(&self.me.status, &self.me.name));
        ctx.scratch.push_str(&wire::wrapper_close());

        let dest = SocketAddrV4::new(self.cfg.net.multicast_group, self.cfg.net.port);
        match self.udp.try_send_to(ctx.scratch.as_bytes(), dest.into()) {
            Ok(_) => debug!(presence = %self.me.status.presence, "announced status"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "status announcement failed"),
        }
        self.last_announce = Some(ctx.tick);
    }

    /// Decode and act on one discovery datagram.
    ///
    /// Datagrams must come from the protocol port; anything else is not a
    /// peer endpoint and is dropped. Each datagram gets fresh tokenizers,
    /// and any protocol or validation problem aborts only that datagram.
    fn handle_datagram(&mut self, ctx: &mut Context, data: &[u8], src: SocketAddr) {
        let SocketAddr::V4(src) = src else { return };
        if src.port() != self.cfg.net.port {
            debug!(%src, "datagram from foreign source port dropped");
            return;
        }

        let mut xml = XmlTokenizer::new();
        let mut ppcp = PpcpTokenizer::new(self.me.id.nick(), self.cfg.net.port);
        xml.feed(data);

        let mut peer: Option<UserId> = None;
        loop {
            let token = match ppcp.next_token(&mut xml) {
                Ok(Some(t)) => t,
                Ok(None) => break,
                Err(e) => {
                    debug!(%src, error = %e, "malformed datagram dropped");
                    ctx.emit_line(
                        sig::ERROR,
                        NET_NAME,
                        format!("malformed datagram from {src}: {e}"),
                    );
                    return;
                }
            };
            match token {
                PpcpToken::Open { nick, port } => {
                    let id = match UserId::new(nick, Addr::new(*src.ip(), port)) {
                        Ok(id) => id,
                        Err(e) => {
                            debug!(%src, error = %e, "datagram with bad identity dropped");
                            return;
                        }
                    };
                    let (_, created) = self.users.resolve(id.clone(), ctx.tick);
                    if created {
                        let snapshot = User::new(id.clone());
                        Self::emit_user(
                            ctx,
                            snapshot,
                            ChangeFlags {
                                appeared: true,
                                ..Default::default()
                            },
                        );
                    }
                    peer = Some(id);
                }
                PpcpToken::Status {
                    presence,
                    message,
                    name,
                } => {
                    if let Some(id) = peer.clone() {
                        self.apply_status(ctx, &id, presence, message, name);
                    }
                }
                PpcpToken::Message { text, action } => {
                    if let Some(id) = peer.clone() {
                        ctx.emit(
                            Signal::new(sig::MSG_GOT, NET_NAME, "/").with_payload(
                                Payload::Message(ChatMessage {
                                    peer: id,
                                    text,
                                    action,
                                }),
                            ),
                        );
                    }
                }
                PpcpToken::Request => {
                    if peer.is_some() {
                        self.reply_status(src);
                    }
                }
                PpcpToken::Close | PpcpToken::Ignore => return,
            }
        }
    }

    /// Unicast our status back to a requesting peer.
    fn reply_status(&self, src: SocketAddrV4) {
        let body = wire::status_elem(&self.me.status, &self.me.name);
        let packet = wire::datagram(self.me.id.nick(), self.cfg.net.port, &body);
        match self.udp.try_send_to(packet.as_bytes(), src.into()) {
            Ok(_) => debug!(%src, "replied to status request"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(%src, error = %e, "status reply failed"),
        }
    }

    /// Update a known user from a received status, emitting the change.
    fn apply_status(
        &mut self,
        ctx: &mut Context,
        id: &UserId,
        presence: Presence,
        message: String,
        name: String,
    ) {
        let Some(record) = self.users.get(id) else {
            return;
        };
        let mut flags = ChangeFlags::default();
        let snapshot = {
            let mut rec = record.borrow_mut();
            let status = Status::new(presence, message);
            if rec.user.status != status {
                flags.status = true;
                rec.user.status = status;
            }
            if !name.is_empty() && rec.user.name != name {
                flags.name = true;
                rec.user.name = name;
            }
            rec.last_activity = ctx.tick;
            rec.user.clone()
        };
        if flags.status || flags.name {
            Self::emit_user(ctx, snapshot, flags);
        }
    }

    fn on_accept(&mut self, ctx: &mut Context, stream: TcpStream, addr: SocketAddr) {
        let SocketAddr::V4(addr) = addr else {
            return;
        };
        let id = self.next_conn;
        self.next_conn += 1;
        debug!(%addr, conn = id, "accepted connection");
        self.conns.push(Connection::new(
            id,
            stream,
            *addr.ip(),
            self.me.id.nick(),
            self.cfg.net.port,
            ctx.tick,
        ));
    }

    fn on_udp(&mut self, ctx: &mut Context) {
        let mut buf = [0u8; 65536];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, src)) => self.handle_datagram(ctx, &buf[..n], src),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "udp receive failed");
                    break;
                }
            }
        }
    }

    fn on_conn_ready(&mut self, ctx: &mut Context, id: ConnId, res: io::Result<()>) {
        let Some(idx) = self.conns.iter().position(|c| c.id == id) else {
            return;
        };
        if let Err(e) = res {
            warn!(conn = id, error = %e, "connection readiness failed");
            ctx.emit_line(sig::ERROR, NET_NAME, format!("connection failed: {e}"));
            let c = &mut self.conns[idx];
            c.flags.remote_closed = true;
            c.flags.local_closed = true;
            return;
        }

        match self.conns[idx].fill(ctx.tick) {
            Ok(_eof) => {}
            Err(e) => {
                debug!(conn = id, error = %e, "read failed, dropping link");
                ctx.emit_line(sig::ERROR, NET_NAME, format!("read failed: {e}"));
                let c = &mut self.conns[idx];
                c.flags.remote_closed = true;
                c.flags.local_closed = true;
                return;
            }
        }
        match self.conns[idx].drain_tokens() {
            Ok(tokens) => {
                for token in tokens {
                    self.handle_conn_token(ctx, idx, token);
                }
            }
            Err(e) => {
                debug!(conn = id, error = %e, "protocol error, closing link");
                ctx.emit_line(sig::ERROR, NET_NAME, format!("protocol error: {e}"));
                self.conns[idx].request_close(ctx.tick);
            }
        }
        if let Err(e) = self.conns[idx].flush() {
            debug!(conn = id, error = %e, "write failed, dropping link");
            ctx.emit_line(sig::ERROR, NET_NAME, format!("write failed: {e}"));
            let c = &mut self.conns[idx];
            c.flags.remote_closed = true;
            c.flags.local_closed = true;
        }
    }

    fn handle_conn_token(&mut self, ctx: &mut Context, idx: usize, token: PpcpToken) {
        match token {
            PpcpToken::Open { nick, port } => {
                let peer_ip = self.conns[idx].peer_ip;
                let id = match UserId::new(nick, Addr::new(peer_ip, port)) {
                    Ok(id) => id,
                    Err(e) => {
                        debug!(conn = self.conns[idx].id, error = %e, "bad identity on link");
                        self.conns[idx].request_close(ctx.tick);
                        return;
                    }
                };
                let conn_id = self.conns[idx].id;
                let (record, created) = self.users.resolve(id.clone(), ctx.tick);
                record.borrow_mut().conns.push(conn_id);
                if created {
                    Self::emit_user(
                        ctx,
                        User::new(id.clone()),
                        ChangeFlags {
                            appeared: true,
                            ..Default::default()
                        },
                    );
                }
                let greeting = if self.conns[idx].greeted() {
                    None
                } else {
                    Some(wire::status_elem(&self.me.status, &self.me.name))
                };
                let conn = &mut self.conns[idx];
                conn.peer = Some(id);
                conn.flags.knows_who = true;
                if let Some(body) = greeting {
                    conn.send_body(&body, ctx.tick);
                }
            }
            PpcpToken::Status {
                presence,
                message,
                name,
            } => {
                if let Some(id) = self.conns[idx].peer.clone() {
                    self.apply_status(ctx, &id, presence, message, name);
                }
            }
            PpcpToken::Message { text, action } => {
                if let Some(id) = self.conns[idx].peer.clone() {
                    if let Some(record) = self.users.get(&id) {
                        record.borrow_mut().last_activity = ctx.tick;
                    }
                    ctx.emit(
                        Signal::new(sig::MSG_GOT, NET_NAME, "/").with_payload(Payload::Message(
                            ChatMessage {
                                peer: id,
                                text,
                                action,
                            },
                        )),
                    );
                }
            }
            PpcpToken::Request => {
                let body = wire::status_elem(&self.me.status, &self.me.name);
                self.conns[idx].send_body(&body, ctx.tick);
            }
            PpcpToken::Close | PpcpToken::Ignore => {
                self.conns[idx].flags.remote_closed = true;
                self.conns[idx].request_close(ctx.tick);
            }
        }
    }

    fn on_connected(&mut self, ctx: &mut Context, idx: usize) {
        let mut pc = self.connects.swap_remove(idx);
        match pc.result.take() {
            Some(Ok(stream)) => {
                let peer_ip = match stream.peer_addr() {
                    Ok(SocketAddr::V4(sa)) => *sa.ip(),
                    _ => return,
                };
                let id = self.next_conn;
                self.next_conn += 1;
                let mut conn = Connection::new(
                    id,
                    stream,
                    peer_ip,
                    self.me.id.nick(),
                    self.cfg.net.port,
                    ctx.tick,
                );
                conn.peer = Some(pc.peer.clone());
                conn.flags.knows_who = true;
                let status = wire::status_elem(&self.me.status, &self.me.name);
                conn.send_body(&status, ctx.tick);
                for body in pc.bodies {
                    conn.send_body(&body, ctx.tick);
                }
                if let Err(e) = conn.flush() {
                    debug!(conn = id, error = %e, "initial flush failed");
                }
                let (record, _) = self.users.resolve(pc.peer, ctx.tick);
                record.borrow_mut().conns.push(id);
                debug!(conn = id, "outbound connection established");
                self.conns.push(conn);
            }
            Some(Err(e)) => {
                ctx.emit_line(
                    sig::ERROR,
                    NET_NAME,
                    format!("connect to {} failed: {e}", pc.peer),
                );
            }
            None => {}
        }
    }

    /// Drop fully closed links and detach them from their users.
    fn reap(&mut self) {
        let mut i = 0;
        while i < self.conns.len() {
            if self.conns[i].done() {
                let conn = self.conns.swap_remove(i);
                debug!(conn = conn.id, "link torn down");
                if let Some(id) = &conn.peer {
                    self.users.detach_conn(id, conn.id);
                }
            } else {
                i += 1;
            }
        }
    }

    fn on_tick(&mut self, ctx: &mut Context) {
        let announce_due = self
            .last_announce
            .is_none_or(|t| ctx.tick.saturating_sub(t) >= self.cfg.timeouts.resend_interval);
        if announce_due && !self.shutting_down {
            self.announce(ctx);
        }

        if ctx.tick % AGE_EVERY == 0 {
            let timeouts = self.cfg.timeouts.clone();
            for conn in &mut self.conns {
                if !conn.flags.local_closing
                    && ctx.tick.saturating_sub(conn.last_activity) > timeouts.conn_max_age
                {
                    debug!(conn = conn.id, "idle link, closing");
                    conn.request_close(ctx.tick);
                }
                if let Some(since) = conn.closing_since {
                    if ctx.tick.saturating_sub(since) > timeouts.closing_timeout {
                        debug!(conn = conn.id, "close handshake timed out");
                        conn.flags.remote_closed = true;
                        conn.flags.local_closed = true;
                    }
                }
            }
            self.reap();
            for user in self.users.age(ctx.tick, &timeouts) {
                Self::emit_user(
                    ctx,
                    user,
                    ChangeFlags {
                        left: true,
                        ..Default::default()
                    },
                );
            }
        }

        if self.shutting_down && self.conns.is_empty() && !self.exit_sent {
            self.exit_sent = true;
            ctx.emit(Signal::new(sig::MODULE_EXITS, NET_NAME, crate::reactor::CORE_NAME));
        }
    }

    fn on_quit(&mut self, ctx: &mut Context) {
        self.shutting_down = true;
        self.me.status.presence = Presence::Offline;
        self.announce(ctx);
        for conn in &mut self.conns {
            conn.request_close(ctx.tick);
            let _ = conn.flush();
        }
        self.reap();
        if self.conns.is_empty() && !self.exit_sent {
            self.exit_sent = true;
            ctx.emit(Signal::new(sig::MODULE_EXITS, NET_NAME, crate::reactor::CORE_NAME));
        }
    }

    fn on_msg_send(&mut self, ctx: &mut Context, msg: &ChatMessage) {
        let body = wire::message_elem(&msg.text, msg.action);

        if let Some(conn) = self
            .conns
            .iter_mut()
            .find(|c| c.peer.as_ref() == Some(&msg.peer) && !c.flags.local_closing)
        {
            conn.send_body(&body, ctx.tick);
            let _ = conn.flush();
            return;
        }
        if let Some(pc) = self.connects.iter_mut().find(|pc| pc.peer == msg.peer) {
            pc.bodies.push(body);
            return;
        }

        let socket = match TcpSocket::new_v4() {
            Ok(s) => s,
            Err(e) => {
                ctx.emit_line(sig::ERROR, NET_NAME, format!("socket setup failed: {e}"));
                return;
            }
        };
        debug!(peer = %msg.peer, "dialing");
        self.connects.push(PendingConnect {
            peer: msg.peer.clone(),
            bodies: vec![body],
            fut: Box::pin(socket.connect(msg.peer.addr().into())),
            result: None,
        });
    }

    fn on_user_change(&mut self, ctx: &mut Context, change: &UserChange) {
        if change.flags.status {
            self.me.status = change.user.status.clone();
        }
        if change.flags.name && !change.user.name.is_empty() {
            self.me.name = change.user.name.clone();
        }
        self.announce(ctx);
        let body = wire::status_elem(&self.me.status, &self.me.name);
        for conn in &mut self.conns {
            if conn.flags.knows_who && !conn.flags.local_closing {
                conn.send_body(&body, ctx.tick);
                let _ = conn.flush();
            }
        }
    }
}

#[async_trait(?Send)]
impl Module for Network {
    fn name(&self) -> &str {
        NET_NAME
    }

    async fn ready(&mut self) {
        let pending = tokio::select! {
            res = self.listener.accept() => Pending::Accept(res),
            res = self.udp.readable() => Pending::Udp(res),
            (id, res) = Self::next_conn_event(&self.conns) => Pending::Conn { id, res },
            idx = Self::next_connect(&mut self.connects) => Pending::Connect(idx),
        };
        self.pending = Some(pending);
    }

    fn service(&mut self, ctx: &mut Context) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        match pending {
            Pending::Accept(Ok((stream, addr))) => self.on_accept(ctx, stream, addr),
            Pending::Accept(Err(e)) => warn!(error = %e, "accept failed"),
            Pending::Udp(Ok(())) => self.on_udp(ctx),
            Pending::Udp(Err(e)) => warn!(error = %e, "udp readiness failed"),
            Pending::Conn { id, res } => self.on_conn_ready(ctx, id, res),
            Pending::Connect(idx) => self.on_connected(ctx, idx),
        }
        self.reap();
    }

    fn handle_signal(&mut self, ctx: &mut Context, signal: &Signal) {
        match signal.kind {
            sig::TICK => self.on_tick(ctx),
            sig::MODULE_QUIT => self.on_quit(ctx),
            sig::MSG_SEND => {
                if let Some(Payload::Message(msg)) = &signal.payload {
                    let msg = msg.clone();
                    self.on_msg_send(ctx, &msg);
                }
            }
            sig::USER_CHANGE => {
                if let Some(Payload::UserChange(change)) = &signal.payload {
                    let change = change.clone();
                    self.on_user_change(ctx, &change);
                }
            }
            sig::USERS_RQ => {
                ctx.emit(
                    Signal::new(sig::USERS_RP, NET_NAME, signal.sender.clone())
                        .with_payload(Payload::Users(self.users.share())),
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn test_net(name: &str) -> Network {
        let mut cfg = Config::default();
        cfg.net.port = free_port();
        cfg.net.bind = Ipv4Addr::LOCALHOST;
        // Loopback broadcast, so the environment needs no multicast support.
        cfg.net.multicast_group = Ipv4Addr::new(127, 255, 255, 255);
        cfg.user.name = name.to_string();
        Network::bind(cfg).await.unwrap()
    }

    fn src(net: &Network, ip: [u8; 4]) -> SocketAddr {
        SocketAddrV4::new(Ipv4Addr::from(ip), net.cfg.net.port).into()
    }

    #[tokio::test]
    async fn test_datagram_creates_user_and_applies_status() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();
        ctx.tick = 3;

        let body = wire::status_elem(&Status::new(Presence::Away, "brb"), "Bob D.");
        let packet = wire::datagram("bob", 9000, &body);
        let from = src(&net, [10, 0, 0, 9]);
        net.handle_datagram(&mut ctx, packet.as_bytes(), from);

        assert_eq!(net.users.len(), 1);
        let bob = net.users.find_by_nick("bob").unwrap();
        assert_eq!(bob.borrow().user.status.presence, Presence::Away);
        assert_eq!(bob.borrow().user.name, "Bob D.");
        assert_eq!(bob.borrow().last_activity, 3);

        let kinds: Vec<_> = ctx.drain_queued().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![sig::USER_CHANGED, sig::USER_CHANGED]);
    }

    #[tokio::test]
    async fn test_datagram_from_foreign_port_is_dropped() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();

        let packet = wire::datagram("bob", 9000, "");
        let from: SocketAddr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 40000).into();
        net.handle_datagram(&mut ctx, packet.as_bytes(), from);

        assert!(net.users.is_empty());
        assert!(ctx.drain_queued().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_datagram_reports_error() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();

        // A stray close with no open element is an XML-level violation.
        net.handle_datagram(&mut ctx, b"</ppcp>", src(&net, [10, 0, 0, 9]));

        assert!(net.users.is_empty());
        let err = ctx
            .drain_queued()
            .into_iter()
            .find(|s| s.kind == sig::ERROR)
            .expect("no error line was emitted");
        assert_eq!(err.receiver, "/ui/");
        assert!(err.as_str_payload().unwrap().contains("malformed datagram"));
    }

    #[tokio::test]
    async fn test_protocol_error_on_link_reports_and_closes() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();

        let remote = TcpStream::connect(net.listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, addr) = net.listener.accept().await.unwrap();
        net.on_accept(&mut ctx, stream, addr);
        let id = net.conns[0].id;

        remote.writable().await.unwrap();
        remote.try_write(b"</ppcp>").unwrap();
        net.conns[0].stream.readable().await.unwrap();
        net.on_conn_ready(&mut ctx, id, Ok(()));

        assert!(net.conns[0].flags.local_closing);
        let err = ctx
            .drain_queued()
            .into_iter()
            .find(|s| s.kind == sig::ERROR)
            .expect("no error line was emitted");
        assert!(err.as_str_payload().unwrap().contains("protocol error"));
    }

    #[tokio::test]
    async fn test_own_echo_is_muted() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();

        // Our own multicast announcement looped back to us.
        let body = wire::status_elem(&net.me.status, &net.me.name);
        let packet = wire::datagram(net.me.id.nick(), net.cfg.net.port, &body);
        let from = src(&net, [127, 0, 0, 1]);
        net.handle_datagram(&mut ctx, packet.as_bytes(), from);

        assert!(net.users.is_empty());
        assert!(ctx.drain_queued().is_empty());
    }

    #[tokio::test]
    async fn test_datagram_message_emits_chat_signal() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();

        let mut body = wire::status_elem(&Status::new(Presence::Online, ""), "");
        body.push_str(&wire::message_elem("hi alice", false));
        let packet = wire::datagram("bob", 9000, &body);
        net.handle_datagram(&mut ctx, packet.as_bytes(), src(&net, [10, 0, 0, 9]));

        let got = ctx
            .drain_queued()
            .into_iter()
            .find(|s| s.kind == sig::MSG_GOT)
            .unwrap();
        match got.payload {
            Some(Payload::Message(m)) => {
                assert_eq!(m.peer.nick(), "bob");
                assert_eq!(m.text, "hi alice");
                assert!(!m.action);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inbound_open_resolves_user_and_greets() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();
        ctx.tick = 1;

        let remote = TcpStream::connect(net.listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, addr) = net.listener.accept().await.unwrap();
        net.on_accept(&mut ctx, stream, addr);
        assert_eq!(net.conns.len(), 1);

        net.handle_conn_token(
            &mut ctx,
            0,
            PpcpToken::Open {
                nick: "bob".into(),
                port: 9000,
            },
        );
        let conn = &net.conns[0];
        assert!(conn.flags.knows_who);
        assert_eq!(conn.peer.as_ref().unwrap().nick(), "bob");
        let bob = net.users.find_by_nick("bob").unwrap();
        assert_eq!(bob.borrow().conns, vec![conn.id]);

        // The greeting (our wrapper open plus status) reaches the peer.
        net.conns[0].stream.writable().await.unwrap();
        net.conns[0].flush().unwrap();
        let mut remote = remote;
        let mut got = String::new();
        let mut buf = vec![0u8; 1024];
        while !got.contains("Alice") {
            let n = remote.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed before the greeting arrived");
            got.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(got.starts_with("<ppcp"));
    }

    #[tokio::test]
    async fn test_close_token_tears_down_and_detaches() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();

        let _remote = TcpStream::connect(net.listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, addr) = net.listener.accept().await.unwrap();
        net.on_accept(&mut ctx, stream, addr);
        net.handle_conn_token(
            &mut ctx,
            0,
            PpcpToken::Open {
                nick: "bob".into(),
                port: 9000,
            },
        );

        net.handle_conn_token(&mut ctx, 0, PpcpToken::Close);
        assert!(net.conns[0].flags.remote_closed);
        assert!(net.conns[0].flags.local_closing);

        net.conns[0].stream.writable().await.unwrap();
        net.conns[0].flush().unwrap();
        assert!(net.conns[0].done());
        net.reap();
        assert!(net.conns.is_empty());
        let bob = net.users.find_by_nick("bob").unwrap();
        assert!(bob.borrow().conns.is_empty());
    }

    #[tokio::test]
    async fn test_msg_send_dials_and_delivers() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = listener.local_addr().unwrap();
        let bob = UserId::new(
            "bob",
            Addr::new(Ipv4Addr::LOCALHOST, peer_addr.port()),
        )
        .unwrap();
        net.users.resolve(bob.clone(), 0);

        net.on_msg_send(
            &mut ctx,
            &ChatMessage {
                peer: bob.clone(),
                text: "hello bob".into(),
                action: false,
            },
        );
        assert_eq!(net.connects.len(), 1);

        // A second send while the dial is in flight piggybacks on it.
        net.on_msg_send(
            &mut ctx,
            &ChatMessage {
                peer: bob,
                text: "again".into(),
                action: true,
            },
        );
        assert_eq!(net.connects.len(), 1);
        assert_eq!(net.connects[0].bodies.len(), 2);

        let (mut remote, _) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async {
                net.ready().await;
                net.service(&mut ctx);
            }
        );
        assert_eq!(net.conns.len(), 1);
        assert!(net.connects.is_empty());

        let mut got = String::new();
        let mut buf = vec![0u8; 4096];
        while !got.contains("again") {
            let n = remote.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed before the messages arrived");
            got.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(got.starts_with("<ppcp"));
        assert!(got.contains("hello bob"));
    }

    #[tokio::test]
    async fn test_quit_with_no_links_exits_immediately() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();

        net.handle_signal(&mut ctx, &Signal::new(sig::MODULE_QUIT, "/core", "/"));
        assert!(net.shutting_down);
        assert_eq!(net.me.status.presence, Presence::Offline);
        let kinds: Vec<_> = ctx.drain_queued().iter().map(|s| s.kind).collect();
        assert!(kinds.contains(&sig::MODULE_EXITS));
    }

    #[tokio::test]
    async fn test_users_request_gets_shared_table() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();
        net.users
            .resolve(UserId::new("bob", Addr::new(Ipv4Addr::LOCALHOST, 9000)).unwrap(), 0);

        net.handle_signal(&mut ctx, &Signal::new(sig::USERS_RQ, "/ui/term", NET_NAME));
        let reply = ctx.drain_queued().pop().unwrap();
        assert_eq!(reply.kind, sig::USERS_RP);
        assert_eq!(reply.receiver, "/ui/term");
        match reply.payload {
            Some(Payload::Users(users)) => assert_eq!(users.borrow().len(), 1),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_aging_evicts_idle_users() {
        let mut net = test_net("Alice").await;
        let mut ctx = Context::default();
        let (rec, _) = net.users.resolve(
            UserId::new("bob", Addr::new(Ipv4Addr::LOCALHOST, 9000)).unwrap(),
            0,
        );
        rec.borrow_mut().user.status.presence = Presence::Online;
        drop(rec);

        // First aging boundary strictly past the eviction threshold.
        ctx.tick = (net.cfg.timeouts.user_max_age / AGE_EVERY + 2) * AGE_EVERY;
        net.on_tick(&mut ctx);

        assert!(net.users.is_empty());
        let left = ctx
            .drain_queued()
            .into_iter()
            .find(|s| s.kind == sig::USER_CHANGED)
            .unwrap();
        match left.payload {
            Some(Payload::UserChange(c)) => assert!(c.flags.left),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
