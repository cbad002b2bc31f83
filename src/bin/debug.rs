//! chatd-debug: one-shot client for poking a running server.
//!
//! ```text
//! chatd-debug [--register] <command> [args...]
//! ```
//!
//! Credentials come from `CHATD_USERNAME` / `CHATD_PASSWORD`, the server
//! address from `CHATD_HOST` / `CHATD_PORT`. After sending the command the
//! client prints everything the server pushes until it goes quiet.

use std::time::Duration;

use anyhow::{Context, bail};
use bytes::BytesMut;
use chatd::Request;
use chatd::constants::{Command, DEFAULT_PORT, DEFAULT_SERVER_HOST, MessageType};
use chatd::protocol::ProtocolMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const LISTEN_WINDOW: Duration = Duration::from_secs(2);
const MAX_FRAME_LEN: usize = 1024 * 1024;

fn usage() -> ! {
    eprintln!("usage: chatd-debug [--register] <command> [args...]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  friends | requests | listen");
    eprintln!("  add <user> | request <user> | accept <user> | reject <user> | unfriend <user>");
    eprintln!("  block <user> | unblock <user>");
    eprintln!("  send <user> <text...> | history <user|group> | search <keyword> [user]");
    eprintln!("  group-create <name> | group-add <group> <user> | group-remove <group> <user>");
    eprintln!("  group-leave <group> | group-send <group> <text...> | group-name <group> <name>");
    eprintln!("  pin <user|group> [message] | pinned <user|group>");
    std::process::exit(2);
}

/// Build the request for `args`, or `None` for `listen`.
fn parse_command(args: &[String]) -> Option<Option<Request>> {
    let arg = |i: usize| args.get(i).cloned();
    let rest = |from: usize| args.get(from..).map(|r| r.join(" ")).filter(|s| !s.is_empty());

    let request = match args.first()?.as_str() {
        "listen" => return Some(None),
        "friends" => Request::GetFriends,
        "requests" => Request::GetFriendRequests,
        "add" => Request::AddFriend { username: arg(1)? },
        "request" => Request::SendFriendRequest { username: arg(1)? },
        "accept" => Request::AcceptFriendRequest { username: arg(1)? },
        "reject" => Request::RejectFriendRequest { username: arg(1)? },
        "unfriend" => Request::Unfriend { username: arg(1)? },
        "block" => Request::BlockUser { username: arg(1)? },
        "unblock" => Request::UnblockUser { username: arg(1)? },
        "send" => Request::SendMessage {
            recipient: arg(1)?,
            content: rest(2)?,
            kind: MessageType::Text,
            pinned: false,
        },
        "history" => Request::GetChatHistory { target: arg(1)? },
        "search" => Request::SearchHistory {
            keyword: arg(1)?,
            counterpart: arg(2),
        },
        "group-create" => Request::CreateGroup { name: rest(1)? },
        "group-add" => Request::AddToGroup {
            group_id: arg(1)?,
            username: arg(2)?,
        },
        "group-remove" => Request::RemoveFromGroup {
            group_id: arg(1)?,
            username: arg(2)?,
        },
        "group-leave" => Request::LeaveGroup { group_id: arg(1)? },
        "group-send" => Request::GroupMessage {
            group_id: arg(1)?,
            content: rest(2)?,
            kind: MessageType::Text,
            pinned: false,
        },
        "group-name" => Request::SetGroupName {
            group_id: arg(1)?,
            name: rest(2)?,
        },
        "pin" => Request::PinMessage {
            target: arg(1)?,
            message_id: rest(2).unwrap_or_default(),
        },
        "pinned" => Request::GetPinned { target: arg(1)? },
        _ => return None,
    };
    Some(Some(request))
}

struct Client {
    stream: TcpStream,
    read_buf: BytesMut,
    username: String,
}

impl Client {
    async fn send(&mut self, request: &Request) -> anyhow::Result<()> {
        let frame = request.to_message(&self.username).to_frame();
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next frame from the server, or `None` if nothing arrives in `wait`.
    async fn recv(&mut self, wait: Duration) -> anyhow::Result<Option<ProtocolMessage>> {
        loop {
            if let Some(msg) = ProtocolMessage::read_message(&mut self.read_buf, MAX_FRAME_LEN)? {
                return Ok(Some(msg));
            }
            match timeout(wait, self.stream.read_buf(&mut self.read_buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => bail!("Read error: {e}"),
                Ok(Ok(0)) => bail!("Connection closed by server"),
                Ok(Ok(_)) => {}
            }
        }
    }

    /// Print pushes until the reply to `expected` arrives.
    async fn expect_reply(&mut self, expected: Command) -> anyhow::Result<ProtocolMessage> {
        loop {
            let Some(msg) = self.recv(RESPONSE_TIMEOUT).await? else {
                bail!("Timeout waiting for {expected:?} response");
            };
            match msg.command() {
                Ok(Command::ReceiveMessage) => print_message(&msg),
                Ok(Command::Success | Command::Error) => return Ok(msg),
                Ok(cmd) if cmd == expected => return Ok(msg),
                _ => print_message(&msg),
            }
        }
    }
}

fn print_message(msg: &ProtocolMessage) {
    match msg.command() {
        Ok(Command::Success) => println!("✓ {}", msg.content),
        Ok(Command::Error) => println!("✗ {}", msg.content),
        Ok(Command::ReceiveMessage) => {
            let from = if msg.sender.is_empty() { "server" } else { &msg.sender };
            let to = if msg.recipient.is_empty() {
                String::new()
            } else {
                format!(" in {}", msg.recipient)
            };
            println!("← {from}{to} ({:?}): {}", msg.msg_type, msg.content);
        }
        Ok(cmd) => println!("{cmd:?}:\n{}", msg.content),
        Err(_) => println!("? {:?}", msg),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let register = args.first().is_some_and(|a| a == "--register");
    if register {
        args.remove(0);
    }
    let Some(command) = parse_command(&args) else {
        usage();
    };

    let username = std::env::var("CHATD_USERNAME").context("CHATD_USERNAME not set")?;
    let password = std::env::var("CHATD_PASSWORD").context("CHATD_PASSWORD not set")?;
    let host = std::env::var("CHATD_HOST").unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string());
    let port = match std::env::var("CHATD_PORT") {
        Ok(port) => port.parse().context("CHATD_PORT is not a port number")?,
        Err(_) => DEFAULT_PORT,
    };

    println!("Connecting to {host}:{port}...");
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    stream.set_nodelay(true)?;
    let mut client = Client {
        stream,
        read_buf: BytesMut::with_capacity(8192),
        username: username.clone(),
    };

    if register {
        client
            .send(&Request::Register {
                username: username.clone(),
                password: password.clone(),
            })
            .await?;
        let reply = client.expect_reply(Command::Register).await?;
        print_message(&reply);
    }

    client.send(&Request::Login { username, password }).await?;
    let reply = client.expect_reply(Command::Login).await?;
    print_message(&reply);
    if !matches!(reply.command(), Ok(Command::Success)) {
        bail!("Login failed");
    }

    if let Some(request) = command {
        client.send(&request).await?;
        let reply = client.expect_reply(request.command()).await?;
        print_message(&reply);
    }

    // Drain offline deliveries and live pushes.
    while let Some(msg) = client.recv(LISTEN_WINDOW).await? {
        print_message(&msg);
    }

    client.send(&Request::Disconnect).await?;
    if let Ok(Some(msg)) = client.recv(RESPONSE_TIMEOUT).await {
        print_message(&msg);
    }
    Ok(())
}
