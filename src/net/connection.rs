//! One TCP link to a peer.
//!
//! A connection owns its stream, its per-stream tokenizers and an outbound
//! byte queue. All reads and writes are nonblocking; the network module
//! waits on [`Connection::interest`] readiness and calls back in here to
//! move bytes. Close is a handshake: each side sends its wrapper close tag,
//! and the link is torn down only once both directions are closed.

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;

use bytes::Bytes;
use ppcp_proto::ppcp::{PpcpToken, PpcpTokenizer};
use ppcp_proto::xml::XmlTokenizer;
use ppcp_proto::{wire, UserId, XmlError};
use tokio::io::Interest;
use tokio::net::TcpStream;

use super::users::ConnId;

/// Direction/lifecycle flags of one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnFlags {
    /// The peer has sent a valid wrapper open, so we know who it is.
    pub knows_who: bool,
    /// The peer closed its wrapper (or its socket).
    pub remote_closed: bool,
    /// We decided to close and have queued our wrapper close.
    pub local_closing: bool,
    /// Our wrapper close has been flushed to the socket.
    pub local_closed: bool,
}

/// A live TCP link plus its protocol state.
pub struct Connection {
    /// Table handle, unique per network module instance.
    pub id: ConnId,
    /// The socket.
    pub stream: TcpStream,
    /// Peer IP as observed on the socket (authoritative over any claim).
    pub peer_ip: Ipv4Addr,
    /// Resolved peer identity, once a valid wrapper open arrived.
    pub peer: Option<UserId>,
    /// Lifecycle flags.
    pub flags: ConnFlags,
    /// Tick of the last inbound or outbound activity.
    pub last_activity: u64,
    /// Tick at which we started closing, for the forcible-teardown timer.
    pub closing_since: Option<u64>,
    xml: XmlTokenizer,
    ppcp: PpcpTokenizer,
    outq: VecDeque<Bytes>,
    our_open: String,
    open_sent: bool,
}

impl Connection {
    /// Wrap an accepted or connected stream.
    pub fn new(
        id: ConnId,
        stream: TcpStream,
        peer_ip: Ipv4Addr,
        our_nick: &str,
        our_port: u16,
        tick: u64,
    ) -> Self {
        Self {
            id,
            stream,
            peer_ip,
            peer: None,
            flags: ConnFlags::default(),
            last_activity: tick,
            closing_since: None,
            xml: XmlTokenizer::new(),
            ppcp: PpcpTokenizer::new(our_nick, our_port),
            outq: VecDeque::new(),
            our_open: wire::wrapper_open(our_nick, our_port),
            open_sent: false,
        }
    }

    /// The readiness we currently care about.
    pub fn interest(&self) -> Interest {
        if self.has_backlog() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Queue a body fragment, opening our wrapper first if needed.
    pub fn send_body(&mut self, body: &str, tick: u64) {
        if self.flags.local_closing {
            return;
        }
        self.ensure_open();
        self.outq.push_back(Bytes::copy_from_slice(body.as_bytes()));
        self.last_activity = tick;
    }

    /// Start closing our side: queue the wrapper close once.
    pub fn request_close(&mut self, tick: u64) {
        if self.flags.local_closing {
            return;
        }
        self.ensure_open();
        self.outq
            .push_back(Bytes::from(wire::wrapper_close().into_bytes()));
        self.flags.local_closing = true;
        self.closing_since = Some(tick);
    }

    fn ensure_open(&mut self) {
        if !self.open_sent {
            self.outq
                .push_back(Bytes::copy_from_slice(self.our_open.as_bytes()));
            self.open_sent = true;
        }
    }

    /// Drain the outbound queue as far as the socket allows. Marks our side
    /// fully closed once a queued wrapper close has been flushed.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.outq.front_mut() {
            match self.stream.try_write(front) {
                Ok(n) if n < front.len() => {
                    let _ = front.split_to(n);
                }
                Ok(_) => {
                    self.outq.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.outq.is_empty() && self.flags.local_closing {
            self.flags.local_closed = true;
        }
        Ok(())
    }

    /// Read all currently available bytes into the tokenizer. Returns true
    /// on end of stream, which we treat as the peer closing both ways.
    pub fn fill(&mut self, tick: u64) -> io::Result<bool> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    self.flags.remote_closed = true;
                    self.flags.local_closing = true;
                    self.flags.local_closed = true;
                    return Ok(true);
                }
                Ok(n) => {
                    self.xml.feed(&buf[..n]);
                    self.last_activity = tick;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Decode every protocol token currently available.
    pub fn drain_tokens(&mut self) -> Result<Vec<PpcpToken>, XmlError> {
        let mut out = Vec::new();
        while let Some(token) = self.ppcp.next_token(&mut self.xml)? {
            out.push(token);
        }
        Ok(out)
    }

    /// Whether our wrapper open has been queued yet.
    pub fn greeted(&self) -> bool {
        self.open_sent
    }

    /// Both directions closed; the link can be dropped.
    pub fn done(&self) -> bool {
        self.flags.remote_closed && self.flags.local_closed
    }

    /// Bytes still waiting to go out.
    pub fn has_backlog(&self) -> bool {
        !self.outq.is_empty()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_ip", &self.peer_ip)
            .field("peer", &self.peer)
            .field("flags", &self.flags)
            .field("backlog", &self.outq.len())
            .finish()
    }
}
