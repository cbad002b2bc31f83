//! Protocol constants and enumerations.

use crate::{Error, Result};

/// Default TCP port of the chat service.
pub const DEFAULT_PORT: u16 = 8080;

/// Default server host used by the debug client.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Longest accepted username, in bytes.
pub const MAX_USERNAME_LEN: usize = 49;

/// Longest accepted message body, in characters.
pub const MAX_CONTENT_LEN: usize = 2046;

/// Prefix shared by every generated group id.
pub const GROUP_ID_PREFIX: &str = "GROUP_";

/// Separator between fields of a protocol record.
pub const FIELD_DELIMITER: char = '|';

/// Escape character used inside protocol field values.
pub const ESCAPE: char = '\\';

/// Command codes carried in the `CMD:` field.
///
/// The numeric values are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Login = 0,
    Register = 1,
    Logout = 2,
    GetFriends = 3,
    SendMessage = 4,
    ReceiveMessage = 5,
    Disconnect = 6,
    CreateGroup = 7,
    AddToGroup = 8,
    RemoveFromGroup = 9,
    LeaveGroup = 10,
    GroupMessage = 11,
    SearchHistory = 12,
    SetGroupName = 13,
    BlockUser = 14,
    UnblockUser = 15,
    PinMessage = 16,
    GetPinned = 17,
    AddFriend = 18,
    SendFriendRequest = 19,
    AcceptFriendRequest = 20,
    GetFriendRequests = 21,
    RejectFriendRequest = 22,
    GetChatHistory = 23,
    Unfriend = 24,
    Error = 99,
    Success = 100,
}

impl TryFrom<u32> for Command {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Command::Login),
            1 => Ok(Command::Register),
            2 => Ok(Command::Logout),
            3 => Ok(Command::GetFriends),
            4 => Ok(Command::SendMessage),
            5 => Ok(Command::ReceiveMessage),
            6 => Ok(Command::Disconnect),
            7 => Ok(Command::CreateGroup),
            8 => Ok(Command::AddToGroup),
            9 => Ok(Command::RemoveFromGroup),
            10 => Ok(Command::LeaveGroup),
            11 => Ok(Command::GroupMessage),
            12 => Ok(Command::SearchHistory),
            13 => Ok(Command::SetGroupName),
            14 => Ok(Command::BlockUser),
            15 => Ok(Command::UnblockUser),
            16 => Ok(Command::PinMessage),
            17 => Ok(Command::GetPinned),
            18 => Ok(Command::AddFriend),
            19 => Ok(Command::SendFriendRequest),
            20 => Ok(Command::AcceptFriendRequest),
            21 => Ok(Command::GetFriendRequests),
            22 => Ok(Command::RejectFriendRequest),
            23 => Ok(Command::GetChatHistory),
            24 => Ok(Command::Unfriend),
            99 => Ok(Command::Error),
            100 => Ok(Command::Success),
            _ => Err(Error::InvalidCommand(value)),
        }
    }
}

impl From<Command> for u32 {
    fn from(command: Command) -> Self {
        command as u32
    }
}

/// Kind of a chat message, carried in the `TYPE:` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum MessageType {
    #[default]
    Text = 0,
    Emoji = 1,
    System = 2,
}

impl MessageType {
    /// Lenient conversion used by the decoder; unknown values read as text.
    pub fn from_code(value: u32) -> Self {
        match value {
            1 => MessageType::Emoji,
            2 => MessageType::System,
            _ => MessageType::Text,
        }
    }
}

impl From<MessageType> for u32 {
    fn from(kind: MessageType) -> Self {
        kind as u32
    }
}

/// Type tag of a persisted message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordKind {
    Direct = 0,
    Group = 2,
}

impl TryFrom<u32> for RecordKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(RecordKind::Direct),
            2 => Ok(RecordKind::Group),
            _ => Err(Error::MalformedRecord(format!("unknown record type {value}"))),
        }
    }
}

impl From<RecordKind> for u32 {
    fn from(kind: RecordKind) -> Self {
        kind as u32
    }
}

/// Returns true when `target` names a group rather than a user.
pub fn is_group_id(target: &str) -> bool {
    target.starts_with(GROUP_ID_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_are_stable() {
        assert_eq!(u32::from(Command::Login), 0);
        assert_eq!(u32::from(Command::AddFriend), 18);
        assert_eq!(u32::from(Command::Unfriend), 24);
        assert_eq!(u32::from(Command::Error), 99);
        assert_eq!(u32::from(Command::Success), 100);
    }

    #[test]
    fn test_command_try_from() {
        assert_eq!(Command::try_from(11).unwrap(), Command::GroupMessage);
        assert_eq!(Command::try_from(21).unwrap(), Command::GetFriendRequests);
        assert!(matches!(
            Command::try_from(42),
            Err(Error::InvalidCommand(42))
        ));
    }

    #[test]
    fn test_message_type_lenient() {
        assert_eq!(MessageType::from_code(1), MessageType::Emoji);
        assert_eq!(MessageType::from_code(2), MessageType::System);
        assert_eq!(MessageType::from_code(77), MessageType::Text);
    }

    #[test]
    fn test_record_kind() {
        assert_eq!(RecordKind::try_from(0).unwrap(), RecordKind::Direct);
        assert_eq!(RecordKind::try_from(2).unwrap(), RecordKind::Group);
        assert!(RecordKind::try_from(1).is_err());
    }

    #[test]
    fn test_is_group_id() {
        assert!(is_group_id("GROUP_alice_1700000000"));
        assert!(!is_group_id("alice"));
    }
}
