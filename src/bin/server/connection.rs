//! Client connection handling.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use chatd::constants::Command;
use chatd::protocol::ProtocolMessage;
use chatd::{Error, Request};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Rejection;
use crate::handlers::{Departure, Flow, go_offline, handle_client_message};
use crate::state::{Outbound, SessionHandle, SharedState, next_connection_id};

pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: SharedState,
    config: Arc<Config>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let shutdown = Arc::new(Notify::new());
    let connection_id = next_connection_id();
    info!(connection = connection_id, %addr, "client connected");

    // Writer task: the only place this socket is written.
    let write_handle = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    });

    let mut session = SessionInfo::new(connection_id, addr, tx, shutdown.clone());
    let mut read_buf = BytesMut::with_capacity(8192);

    'read: loop {
        let n = tokio::select! {
            read = read_half.read_buf(&mut read_buf) => match read {
                Ok(n) => n,
                Err(e) => {
                    debug!(connection = connection_id, error = %e, "read failed");
                    break;
                }
            },
            _ = shutdown.notified() => {
                debug!(connection = connection_id, "session terminated by server");
                break;
            }
        };
        if n == 0 {
            break;
        }

        loop {
            let msg = match ProtocolMessage::read_message(&mut read_buf, config.max_frame_len) {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    warn!(connection = connection_id, %addr, error = %e, "dropping connection");
                    break 'read;
                }
            };

            let request = match Request::try_from(msg) {
                Ok(request) => request,
                Err(e) => {
                    debug!(connection = connection_id, error = %e, "unrecognised request");
                    reject_unknown(&session, &e);
                    continue;
                }
            };

            // Handlers may read or rewrite the whole message log.
            let mut state = state.lock().await;
            let flow = task::block_in_place(|| {
                handle_client_message(request, &mut session, &mut state, &config)
            });
            if flow == Flow::Close {
                break 'read;
            }
        }
    }

    // Only the connection still bound to the user runs the offline cleanup;
    // an evicted session must not mark its replacement offline.
    if let Some(name) = session.username.take() {
        let mut state = state.lock().await;
        if state.is_bound(&name, connection_id) {
            task::block_in_place(|| {
                go_offline(&name, Departure::ConnectionLost, &mut state, &config)
            });
        }
    }

    session.handle.terminate();
    drop(session);
    let _ = write_handle.await;

    info!(connection = connection_id, %addr, "client disconnected");
    Ok(())
}

fn reject_unknown(session: &SessionInfo, error: &Error) {
    let reason = match error {
        Error::InvalidCommand(_) | Error::ServerOnlyCommand(_) => Rejection::UnknownCommand.to_string(),
        other => other.to_string(),
    };
    session
        .handle
        .send(&ProtocolMessage::response(Command::Error, reason));
}

/// Per-connection state owned by the reader loop.
pub struct SessionInfo {
    pub connection_id: u32,
    pub addr: SocketAddr,
    pub handle: SessionHandle,
    /// Set by a successful login. The user is only logged in while the
    /// registry still binds this connection to them.
    pub username: Option<String>,
}

impl SessionInfo {
    pub fn new(
        connection_id: u32,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<Outbound>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            connection_id,
            addr,
            handle: SessionHandle::new(connection_id, tx, shutdown),
            username: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    async fn spawn_server() -> (TempDir, SocketAddr, SharedState) {
        let (dir, state) = test_state();
        let state: SharedState = Arc::new(Mutex::new(state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Arc::new(Config::default());

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, peer, shared.clone(), config.clone()));
            }
        });
        (dir, addr, state)
    }

    struct Client {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                buf: BytesMut::new(),
            }
        }

        async fn send_raw(&mut self, msg: ProtocolMessage) {
            self.stream.write_all(&msg.to_frame()).await.unwrap();
        }

        async fn send(&mut self, request: Request) {
            self.send_raw(request.to_message("")).await;
        }

        /// Next frame, or `None` once the server closed the connection.
        async fn recv(&mut self) -> Option<ProtocolMessage> {
            loop {
                if let Some(msg) = ProtocolMessage::read_message(&mut self.buf, usize::MAX).unwrap() {
                    return Some(msg);
                }
                let n = timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf))
                    .await
                    .expect("timed out waiting for server")
                    .unwrap_or(0);
                if n == 0 {
                    return None;
                }
            }
        }

        async fn login(addr: SocketAddr, name: &str) -> Self {
            let mut client = Self::connect(addr).await;
            let credentials = || (name.to_string(), "pw".to_string());

            let (username, password) = credentials();
            client.send(Request::Register { username, password }).await;
            client.recv().await.unwrap();

            let (username, password) = credentials();
            client.send(Request::Login { username, password }).await;
            let reply = client.recv().await.unwrap();
            assert_eq!(reply.content, "Login successful");
            client
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_command_gets_error() {
        let (_dir, addr, _state) = spawn_server().await;
        let mut client = Client::connect(addr).await;

        client
            .send_raw(ProtocolMessage {
                command: 77,
                ..Default::default()
            })
            .await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.command().unwrap(), Command::Error);
        assert_eq!(reply.content, "Unknown command");

        client.send(Request::GetFriends).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.content, "Not logged in");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_replies_then_closes() {
        let (_dir, addr, state) = spawn_server().await;
        let mut client = Client::login(addr, "alice").await;

        client.send(Request::Disconnect).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.content, "Disconnected");
        assert!(client.recv().await.is_none());
        assert!(!state.lock().await.find_user("alice").unwrap().is_online());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_login_closes_first_connection() {
        let (_dir, addr, state) = spawn_server().await;
        let mut first = Client::login(addr, "alice").await;

        let mut second = Client::connect(addr).await;
        second
            .send(Request::Login {
                username: "alice".to_string(),
                password: "pw".to_string(),
            })
            .await;
        assert_eq!(second.recv().await.unwrap().content, "Login successful");

        let notice = first.recv().await.unwrap();
        assert_eq!(notice.content, "Your session was terminated due to new login");
        assert!(first.recv().await.is_none());

        // The evicted connection's cleanup must leave the new session online.
        second.send(Request::GetFriends).await;
        assert_eq!(second.recv().await.unwrap().command().unwrap(), Command::GetFriends);
        assert!(state.lock().await.find_user("alice").unwrap().is_online());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropped_connection_notifies_friends() {
        let (_dir, addr, _state) = spawn_server().await;
        let alice = Client::login(addr, "alice").await;
        let mut bob = Client::login(addr, "bob").await;

        bob.send(Request::AddFriend {
            username: "alice".to_string(),
        })
        .await;
        assert_eq!(bob.recv().await.unwrap().content, "Friend added");

        drop(alice);
        let notice = bob.recv().await.unwrap();
        assert_eq!(notice.sender, "alice");
        assert_eq!(notice.content, "User has disconnected");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_frame_closes_connection() {
        let (_dir, addr, _state) = spawn_server().await;
        let mut client = Client::connect(addr).await;

        let len = (Config::default().max_frame_len as u32 + 1).to_le_bytes();
        client.stream.write_all(&len).await.unwrap();
        assert!(client.recv().await.is_none());
    }
}
