//! Typed client requests.
//!
//! The wire record is one catch-all struct; servers parse it into a
//! [`Request`] variant that only carries the fields the command uses.

use crate::constants::{Command, MessageType};
use crate::protocol::ProtocolMessage;
use crate::{Error, Result};

/// A request sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Login { username: String, password: String },
    Register { username: String, password: String },
    Logout,
    Disconnect,
    GetFriends,
    /// Legacy direct add; mirrors the friendship without a request.
    AddFriend { username: String },
    SendFriendRequest { username: String },
    AcceptFriendRequest { username: String },
    RejectFriendRequest { username: String },
    GetFriendRequests,
    Unfriend { username: String },
    BlockUser { username: String },
    UnblockUser { username: String },
    SendMessage {
        recipient: String,
        content: String,
        kind: MessageType,
        pinned: bool,
    },
    CreateGroup { name: String },
    AddToGroup { group_id: String, username: String },
    RemoveFromGroup { group_id: String, username: String },
    LeaveGroup { group_id: String },
    GroupMessage {
        group_id: String,
        content: String,
        kind: MessageType,
        pinned: bool,
    },
    /// History with a user, or with a group when `target` is a group id.
    GetChatHistory { target: String },
    SearchHistory {
        keyword: String,
        counterpart: Option<String>,
    },
    SetGroupName { group_id: String, name: String },
    /// `message_id` is a group message id, or the content of a direct message.
    PinMessage { target: String, message_id: String },
    GetPinned { target: String },
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Login { .. } => Command::Login,
            Request::Register { .. } => Command::Register,
            Request::Logout => Command::Logout,
            Request::Disconnect => Command::Disconnect,
            Request::GetFriends => Command::GetFriends,
            Request::AddFriend { .. } => Command::AddFriend,
            Request::SendFriendRequest { .. } => Command::SendFriendRequest,
            Request::AcceptFriendRequest { .. } => Command::AcceptFriendRequest,
            Request::RejectFriendRequest { .. } => Command::RejectFriendRequest,
            Request::GetFriendRequests => Command::GetFriendRequests,
            Request::Unfriend { .. } => Command::Unfriend,
            Request::BlockUser { .. } => Command::BlockUser,
            Request::UnblockUser { .. } => Command::UnblockUser,
            Request::SendMessage { .. } => Command::SendMessage,
            Request::CreateGroup { .. } => Command::CreateGroup,
            Request::AddToGroup { .. } => Command::AddToGroup,
            Request::RemoveFromGroup { .. } => Command::RemoveFromGroup,
            Request::LeaveGroup { .. } => Command::LeaveGroup,
            Request::GroupMessage { .. } => Command::GroupMessage,
            Request::GetChatHistory { .. } => Command::GetChatHistory,
            Request::SearchHistory { .. } => Command::SearchHistory,
            Request::SetGroupName { .. } => Command::SetGroupName,
            Request::PinMessage { .. } => Command::PinMessage,
            Request::GetPinned { .. } => Command::GetPinned,
        }
    }

    /// Encode the request as a wire record sent by `sender`.
    pub fn to_message(&self, sender: &str) -> ProtocolMessage {
        let mut msg = ProtocolMessage::new(self.command());
        msg.sender = sender.to_string();

        match self {
            Request::Login { username, password } | Request::Register { username, password } => {
                msg.sender = username.clone();
                msg.content = password.clone();
            }
            Request::Logout
            | Request::Disconnect
            | Request::GetFriends
            | Request::GetFriendRequests => {}
            Request::AddFriend { username }
            | Request::SendFriendRequest { username }
            | Request::AcceptFriendRequest { username }
            | Request::RejectFriendRequest { username }
            | Request::Unfriend { username }
            | Request::BlockUser { username }
            | Request::UnblockUser { username } => {
                msg.recipient = username.clone();
            }
            Request::SendMessage {
                recipient,
                content,
                kind,
                pinned,
            } => {
                msg.recipient = recipient.clone();
                msg.content = content.clone();
                msg.msg_type = *kind;
                msg.pinned = *pinned;
            }
            Request::CreateGroup { name } => {
                msg.content = name.clone();
            }
            Request::AddToGroup { group_id, username }
            | Request::RemoveFromGroup { group_id, username } => {
                msg.extra = group_id.clone();
                msg.recipient = username.clone();
            }
            Request::LeaveGroup { group_id } => {
                msg.extra = group_id.clone();
            }
            Request::GroupMessage {
                group_id,
                content,
                kind,
                pinned,
            } => {
                msg.recipient = group_id.clone();
                msg.content = content.clone();
                msg.msg_type = *kind;
                msg.pinned = *pinned;
            }
            Request::GetChatHistory { target } | Request::GetPinned { target } => {
                msg.recipient = target.clone();
            }
            Request::SearchHistory {
                keyword,
                counterpart,
            } => {
                msg.content = keyword.clone();
                msg.recipient = counterpart.clone().unwrap_or_default();
            }
            Request::SetGroupName { group_id, name } => {
                msg.extra = group_id.clone();
                msg.content = name.clone();
            }
            Request::PinMessage { target, message_id } => {
                msg.recipient = target.clone();
                msg.extra = message_id.clone();
            }
        }

        msg
    }
}

impl TryFrom<ProtocolMessage> for Request {
    type Error = Error;

    fn try_from(msg: ProtocolMessage) -> Result<Self> {
        let command = msg.command()?;
        let ProtocolMessage {
            sender,
            recipient,
            content,
            extra,
            msg_type,
            pinned,
            ..
        } = msg;

        let request = match command {
            Command::Login => Request::Login {
                username: sender,
                password: content,
            },
            Command::Register => Request::Register {
                username: sender,
                password: content,
            },
            Command::Logout => Request::Logout,
            Command::Disconnect => Request::Disconnect,
            Command::GetFriends => Request::GetFriends,
            Command::AddFriend => Request::AddFriend {
                username: recipient,
            },
            Command::SendFriendRequest => Request::SendFriendRequest {
                username: recipient,
            },
            Command::AcceptFriendRequest => Request::AcceptFriendRequest {
                username: recipient,
            },
            Command::RejectFriendRequest => Request::RejectFriendRequest {
                username: recipient,
            },
            Command::GetFriendRequests => Request::GetFriendRequests,
            Command::Unfriend => Request::Unfriend {
                username: recipient,
            },
            Command::BlockUser => Request::BlockUser {
                username: recipient,
            },
            Command::UnblockUser => Request::UnblockUser {
                username: recipient,
            },
            Command::SendMessage => Request::SendMessage {
                recipient,
                content,
                kind: msg_type,
                pinned,
            },
            Command::CreateGroup => Request::CreateGroup { name: content },
            Command::AddToGroup => Request::AddToGroup {
                group_id: extra,
                username: recipient,
            },
            Command::RemoveFromGroup => Request::RemoveFromGroup {
                group_id: extra,
                username: recipient,
            },
            Command::LeaveGroup => Request::LeaveGroup { group_id: extra },
            Command::GroupMessage => Request::GroupMessage {
                group_id: recipient,
                content,
                kind: msg_type,
                pinned,
            },
            Command::GetChatHistory => Request::GetChatHistory { target: recipient },
            Command::SearchHistory => Request::SearchHistory {
                keyword: content,
                counterpart: Some(recipient).filter(|r| !r.is_empty()),
            },
            Command::SetGroupName => Request::SetGroupName {
                group_id: extra,
                name: content,
            },
            Command::PinMessage => Request::PinMessage {
                target: recipient,
                message_id: extra,
            },
            Command::GetPinned => Request::GetPinned { target: recipient },
            Command::ReceiveMessage | Command::Error | Command::Success => {
                return Err(Error::ServerOnlyCommand(command));
            }
        };

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_uses_sender_and_content() {
        let msg = ProtocolMessage::decode(b"CMD:0|SENDER:alice|CONTENT:pw1|");
        assert_eq!(
            Request::try_from(msg).unwrap(),
            Request::Login {
                username: "alice".to_string(),
                password: "pw1".to_string(),
            }
        );
    }

    #[test]
    fn test_group_admin_commands_read_extra() {
        let msg = Request::AddToGroup {
            group_id: "GROUP_alice_1".to_string(),
            username: "bob".to_string(),
        }
        .to_message("alice");
        assert_eq!(msg.extra, "GROUP_alice_1");
        assert_eq!(msg.recipient, "bob");
        assert_eq!(msg.sender, "alice");
    }

    #[test]
    fn test_search_without_counterpart() {
        let msg = ProtocolMessage::decode(b"CMD:12|CONTENT:lunch|RECIPIENT:|");
        assert_eq!(
            Request::try_from(msg).unwrap(),
            Request::SearchHistory {
                keyword: "lunch".to_string(),
                counterpart: None,
            }
        );
    }

    #[test]
    fn test_server_only_commands_rejected() {
        let msg = ProtocolMessage::response(Command::Success, "ok");
        assert!(matches!(
            Request::try_from(msg),
            Err(Error::ServerOnlyCommand(Command::Success))
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let msg = ProtocolMessage::decode(b"CMD:55|");
        assert!(matches!(
            Request::try_from(msg),
            Err(Error::InvalidCommand(55))
        ));
    }

    #[test]
    fn test_wire_round_trip_keeps_message_fields() {
        let request = Request::SendMessage {
            recipient: "bob".to_string(),
            content: "see you | later".to_string(),
            kind: MessageType::Emoji,
            pinned: true,
        };
        let frame = request.to_message("alice").encode();
        let decoded = ProtocolMessage::decode(frame.as_bytes());
        assert_eq!(decoded.sender, "alice");
        assert_eq!(Request::try_from(decoded).unwrap(), request);
    }
}
