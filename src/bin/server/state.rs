//! Server state management.
//!
//! Every read and write of the registry happens under the single lock of
//! [`SharedState`]; handlers run their whole body while holding it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use bytes::BytesMut;
use chatd::constants::{GROUP_ID_PREFIX, MessageType};
use chatd::protocol::ProtocolMessage;
use chrono::{DateTime, Local};
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::warn;

use crate::store::Store;

static CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

pub fn next_connection_id() -> u32 {
    CONNECTION_ID.fetch_add(1, Ordering::SeqCst)
}

/// Item queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(BytesMut),
    /// Flush what is queued, then shut the socket down.
    Close,
}

/// Handle to a live connection, held by the user bound to it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub connection_id: u32,
    tx: mpsc::UnboundedSender<Outbound>,
    shutdown: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(connection_id: u32, tx: mpsc::UnboundedSender<Outbound>, shutdown: Arc<Notify>) -> Self {
        Self {
            connection_id,
            tx,
            shutdown,
        }
    }

    pub fn send(&self, msg: &ProtocolMessage) -> bool {
        self.tx.send(Outbound::Frame(msg.to_frame())).is_ok()
    }

    /// Close the connection after its queued frames are written, and stop its
    /// reader.
    pub fn terminate(&self) {
        let _ = self.tx.send(Outbound::Close);
        self.shutdown.notify_one();
    }
}

/// A registered account
#[derive(Debug)]
pub struct User {
    pub username: String,
    pub password: String,
    /// Present while the user is online.
    pub session: Option<SessionHandle>,
    /// `None` until the first disconnect.
    pub last_seen: Option<DateTime<Local>>,
    pub friends: Vec<String>,
    pub blocked: Vec<String>,
    /// Incoming friend requests, oldest first.
    pub pending_requests: Vec<String>,
}

impl User {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username,
            password,
            session: None,
            last_seen: None,
            friends: Vec::new(),
            blocked: Vec::new(),
            pending_requests: Vec::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.session.is_some()
    }

    pub fn has_blocked(&self, username: &str) -> bool {
        self.blocked.iter().any(|b| b == username)
    }

    pub fn is_friend(&self, username: &str) -> bool {
        self.friends.iter().any(|f| f == username)
    }

    pub fn has_request_from(&self, username: &str) -> bool {
        self.pending_requests.iter().any(|r| r == username)
    }
}

/// A message kept in a group's in-memory log
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub kind: MessageType,
    pub timestamp: DateTime<Local>,
    pub pinned: bool,
}

/// A chat group
#[derive(Debug)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub creator: String,
    /// Join order.
    pub members: Vec<String>,
    pub admins: Vec<String>,
    pub messages: Vec<GroupMessage>,
    pub created_at: DateTime<Local>,
}

impl Group {
    pub fn new(id: String, name: String, creator: String, created_at: DateTime<Local>) -> Self {
        Self {
            id,
            name,
            members: vec![creator.clone()],
            admins: vec![creator.clone()],
            creator,
            messages: Vec::new(),
            created_at,
        }
    }

    pub fn is_member(&self, username: &str) -> bool {
        self.members.iter().any(|m| m == username)
    }

    pub fn is_admin(&self, username: &str) -> bool {
        self.admins.iter().any(|a| a == username)
    }

    /// Drop `username` from the member and admin lists, keeping the order of
    /// the rest. Returns false if they were not a member.
    pub fn remove_member(&mut self, username: &str) -> bool {
        let Some(index) = self.members.iter().position(|m| m == username) else {
            return false;
        };
        self.members.remove(index);
        if let Some(index) = self.admins.iter().position(|a| a == username) {
            self.admins.remove(index);
        }
        true
    }

    /// Message id unique within this group.
    pub fn next_message_id(&self, sender: &str, now: &DateTime<Local>) -> String {
        let base = format!("{}_{}", sender, now.timestamp());
        unique_id(base, |id| self.messages.iter().any(|m| m.id == id))
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut GroupMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// The main server state
pub struct ServerState {
    /// Registered users by username
    pub users: HashMap<String, User>,

    /// Groups by id
    pub groups: HashMap<String, Group>,

    store: Arc<dyn Store>,
}

impl ServerState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            users: HashMap::new(),
            groups: HashMap::new(),
            store,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Register every account from the store. Returns how many were added.
    pub fn load_accounts(&mut self) -> Result<usize> {
        let accounts = self.store.load_accounts()?;
        Ok(accounts
            .into_iter()
            .filter(|(username, password)| self.add_user(username, password))
            .count())
    }

    pub fn find_user(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    pub fn find_user_mut(&mut self, username: &str) -> Option<&mut User> {
        self.users.get_mut(username)
    }

    pub fn find_group(&self, group_id: &str) -> Option<&Group> {
        self.groups.get(group_id)
    }

    pub fn find_group_mut(&mut self, group_id: &str) -> Option<&mut Group> {
        self.groups.get_mut(group_id)
    }

    /// Add an offline user with no relationships. No-op if the name is taken.
    pub fn add_user(&mut self, username: &str, password: &str) -> bool {
        if self.users.contains_key(username) {
            return false;
        }
        self.users.insert(
            username.to_string(),
            User::new(username.to_string(), password.to_string()),
        );
        true
    }

    /// True if `user` has blocked `username`.
    pub fn is_blocked(&self, user: &str, username: &str) -> bool {
        self.find_user(user).is_some_and(|u| u.has_blocked(username))
    }

    pub fn are_friends(&self, a: &str, b: &str) -> bool {
        self.find_user(a).is_some_and(|u| u.is_friend(b))
    }

    /// Make `a` and `b` friends on both sides. Returns false if either user
    /// is unknown or they already are friends.
    pub fn add_friend(&mut self, a: &str, b: &str) -> bool {
        if a == b || !self.users.contains_key(a) || !self.users.contains_key(b) {
            return false;
        }
        if self.are_friends(a, b) {
            return false;
        }

        for (user, friend) in [(a, b), (b, a)] {
            if let Some(u) = self.users.get_mut(user) {
                if !u.is_friend(friend) {
                    u.friends.push(friend.to_string());
                }
            }
        }
        true
    }

    /// Remove the friendship from both sides, preserving list order.
    /// Returns which sides actually held the entry.
    pub fn remove_friend(&mut self, a: &str, b: &str) -> (bool, bool) {
        let mut remove = |user: &str, friend: &str| {
            self.users
                .get_mut(user)
                .and_then(|u| {
                    let index = u.friends.iter().position(|f| f == friend)?;
                    u.friends.remove(index);
                    Some(())
                })
                .is_some()
        };
        let first = remove(a, b);
        let second = remove(b, a);
        (first, second)
    }

    /// True while `username` is online through `connection_id`.
    pub fn is_bound(&self, username: &str, connection_id: u32) -> bool {
        self.find_user(username)
            .and_then(|u| u.session.as_ref())
            .is_some_and(|s| s.connection_id == connection_id)
    }

    /// Bind `session` to `username`, returning the session it replaces.
    pub fn bind_session(&mut self, username: &str, session: SessionHandle) -> Option<SessionHandle> {
        self.find_user_mut(username)
            .and_then(|u| u.session.replace(session))
    }

    /// Mark `username` offline and stamp last-seen.
    pub fn unbind_session(&mut self, username: &str, now: DateTime<Local>) {
        if let Some(user) = self.find_user_mut(username) {
            user.session = None;
            user.last_seen = Some(now);
        }
    }

    /// Push `msg` to `username` if online. Failures are logged and otherwise
    /// ignored.
    pub fn send_to(&self, username: &str, msg: &ProtocolMessage) -> bool {
        let Some(session) = self.find_user(username).and_then(|u| u.session.as_ref()) else {
            return false;
        };
        let sent = session.send(msg);
        if !sent {
            warn!(user = username, "failed to push message, connection gone");
        }
        sent
    }

    /// Group id derived from the creator and creation time, unique among
    /// existing groups.
    pub fn next_group_id(&self, creator: &str, now: &DateTime<Local>) -> String {
        let base = format!("{}{}_{}", GROUP_ID_PREFIX, creator, now.timestamp());
        unique_id(base, |id| self.groups.contains_key(id))
    }
}

fn unique_id(base: String, taken: impl Fn(&str) -> bool) -> String {
    if !taken(&base) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}_{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

pub type SharedState = Arc<Mutex<ServerState>>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::FileStore;
    use tempfile::TempDir;

    pub(crate) fn test_state() -> (TempDir, ServerState) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(
            dir.path().join("account.txt"),
            dir.path().join("messages.txt"),
        )
        .unwrap();
        (dir, ServerState::new(Arc::new(store)))
    }

    fn with_users(names: &[&str]) -> (TempDir, ServerState) {
        let (dir, mut state) = test_state();
        for name in names {
            state.add_user(name, "pw");
        }
        (dir, state)
    }

    #[test]
    fn test_add_user_is_idempotent() {
        let (_dir, mut state) = test_state();
        assert!(state.add_user("alice", "pw1"));
        assert!(!state.add_user("alice", "other"));
        assert_eq!(state.find_user("alice").unwrap().password, "pw1");
        assert!(!state.find_user("alice").unwrap().is_online());
    }

    #[test]
    fn test_friendship_is_mirrored() {
        let (_dir, mut state) = with_users(&["alice", "bob"]);
        assert!(state.add_friend("alice", "bob"));
        assert!(state.are_friends("alice", "bob"));
        assert!(state.are_friends("bob", "alice"));

        assert!(!state.add_friend("bob", "alice"));
        assert_eq!(state.find_user("alice").unwrap().friends, vec!["bob"]);
        assert_eq!(state.find_user("bob").unwrap().friends, vec!["alice"]);
    }

    #[test]
    fn test_add_friend_unknown_or_self() {
        let (_dir, mut state) = with_users(&["alice"]);
        assert!(!state.add_friend("alice", "ghost"));
        assert!(!state.add_friend("alice", "alice"));
        assert!(state.find_user("alice").unwrap().friends.is_empty());
    }

    #[test]
    fn test_remove_friend_both_sides() {
        let (_dir, mut state) = with_users(&["alice", "bob", "carol"]);
        state.add_friend("alice", "carol");
        state.add_friend("alice", "bob");

        assert_eq!(state.remove_friend("alice", "carol"), (true, true));
        assert!(!state.are_friends("alice", "carol"));
        assert!(!state.are_friends("carol", "alice"));
        assert_eq!(state.find_user("alice").unwrap().friends, vec!["bob"]);

        assert_eq!(state.remove_friend("alice", "carol"), (false, false));
    }

    #[test]
    fn test_block_is_directional() {
        let (_dir, mut state) = with_users(&["alice", "bob"]);
        state
            .find_user_mut("bob")
            .unwrap()
            .blocked
            .push("alice".to_string());
        assert!(state.is_blocked("bob", "alice"));
        assert!(!state.is_blocked("alice", "bob"));
    }

    #[test]
    fn test_group_removal_keeps_order() {
        let now = Local::now();
        let mut group = Group::new("g".into(), "Team".into(), "alice".into(), now);
        group.members.extend(["bob".to_string(), "carol".to_string(), "dave".to_string()]);
        group.admins.push("bob".to_string());

        assert!(group.remove_member("bob"));
        assert_eq!(group.members, vec!["alice", "carol", "dave"]);
        assert_eq!(group.admins, vec!["alice"]);
        assert!(!group.remove_member("bob"));
    }

    #[test]
    fn test_group_ids_are_unique() {
        let (_dir, mut state) = with_users(&["alice"]);
        let now = Local::now();

        let first = state.next_group_id("alice", &now);
        assert_eq!(first, format!("GROUP_alice_{}", now.timestamp()));
        state.groups.insert(
            first.clone(),
            Group::new(first.clone(), "a".into(), "alice".into(), now),
        );

        let second = state.next_group_id("alice", &now);
        assert_eq!(second, format!("{first}_1"));
    }

    #[test]
    fn test_bind_session_returns_previous() {
        let (_dir, mut state) = with_users(&["alice"]);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let first = SessionHandle::new(1, tx1, Arc::new(Notify::new()));
        let second = SessionHandle::new(2, tx2, Arc::new(Notify::new()));

        assert!(state.bind_session("alice", first).is_none());
        assert!(state.is_bound("alice", 1));

        let previous = state.bind_session("alice", second).unwrap();
        assert_eq!(previous.connection_id, 1);
        assert!(state.is_bound("alice", 2));
        assert!(!state.is_bound("alice", 1));

        let now = Local::now();
        state.unbind_session("alice", now);
        assert!(!state.find_user("alice").unwrap().is_online());
        assert_eq!(state.find_user("alice").unwrap().last_seen, Some(now));
    }

    #[tokio::test]
    async fn test_terminate_queues_close_and_wakes_reader() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let session = SessionHandle::new(7, tx, shutdown.clone());

        assert!(session.send(&ProtocolMessage::notice("", "bye")));
        session.terminate();

        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));
        shutdown.notified().await;
    }
}
