//! The table of known peers.
//!
//! The table itself is shared (reference-counted, not copied) with any
//! module that retains it from a users-list reply, and every record is its
//! own `Rc` so an evicted user's storage survives as long as some holder
//! still observes it. Single-threaded by the concurrency contract, hence
//! `Rc<RefCell<..>>` rather than locks.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use ppcp_proto::{Presence, User, UserId};

use crate::config::TimeoutsConfig;

/// Handle identifying one live TCP connection within the network module.
pub type ConnId = u64;

/// A known peer plus its network-runtime fields.
///
/// One concrete record; generic user fields live inline.
#[derive(Debug)]
pub struct NetworkUser {
    /// Identity, display name and status.
    pub user: User,
    /// Handles of this user's active TCP connections.
    pub conns: Vec<ConnId>,
    /// Tick of the last activity attributable to this user.
    pub last_activity: u64,
}

/// A reference-counted user record.
pub type SharedUser = Rc<RefCell<NetworkUser>>;

/// The shared users map, ordered by the [`UserId`] key order.
pub type SharedUsers = Rc<RefCell<BTreeMap<UserId, SharedUser>>>;

/// Owner-side view of the users table.
#[derive(Debug, Default)]
pub struct UserTable {
    inner: SharedUsers,
}

impl UserTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Another reference to the shared map, for users-list replies.
    pub fn share(&self) -> SharedUsers {
        Rc::clone(&self.inner)
    }

    /// Look up a user by identity.
    pub fn get(&self, id: &UserId) -> Option<SharedUser> {
        self.inner.borrow().get(id).cloned()
    }

    /// Find any user with the given nick, regardless of address.
    pub fn find_by_nick(&self, nick: &str) -> Option<SharedUser> {
        self.inner
            .borrow()
            .iter()
            .find(|(id, _)| id.nick() == nick)
            .map(|(_, u)| Rc::clone(u))
    }

    /// Get or lazily create the record for an identity. Returns the record
    /// and whether it was created by this call.
    pub fn resolve(&mut self, id: UserId, tick: u64) -> (SharedUser, bool) {
        let mut map = self.inner.borrow_mut();
        if let Some(existing) = map.get(&id) {
            existing.borrow_mut().last_activity = tick;
            return (Rc::clone(existing), false);
        }
        let record = Rc::new(RefCell::new(NetworkUser {
            user: User::new(id.clone()),
            conns: Vec::new(),
            last_activity: tick,
        }));
        map.insert(id, Rc::clone(&record));
        (record, true)
    }

    /// Detach a closed connection from its user, if any.
    pub fn detach_conn(&mut self, id: &UserId, conn: ConnId) {
        if let Some(record) = self.get(id) {
            record.borrow_mut().conns.retain(|c| *c != conn);
        }
    }

    /// Evict users with no active connections that have idled past their
    /// age threshold. Offline users get the longer threshold. Returns
    /// snapshots of the evicted users.
    pub fn age(&mut self, tick: u64, timeouts: &TimeoutsConfig) -> Vec<User> {
        let mut evicted = Vec::new();
        self.inner.borrow_mut().retain(|_, record| {
            let rec = record.borrow();
            if !rec.conns.is_empty() {
                return true;
            }
            let max_age = if rec.user.status.presence == Presence::Offline {
                timeouts.offline_user_max_age
            } else {
                timeouts.user_max_age
            };
            if tick.saturating_sub(rec.last_activity) > max_age {
                evicted.push(rec.user.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    /// True when no users are known.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}
