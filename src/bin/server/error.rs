//! Client-facing rejections.
//!
//! The `Display` text of each variant is the reason string sent back in the
//! ERROR response.

#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Username already exists")]
    UsernameTaken,

    #[error("Invalid username: {0}")]
    InvalidUsername(&'static str),

    #[error("Invalid username: cannot start with GROUP_")]
    ReservedUsername,

    #[error("Invalid password: {0}")]
    InvalidPassword(&'static str),

    #[error("Failed to persist account")]
    AccountNotSaved,

    #[error("User not found")]
    UserNotFound,

    #[error("Recipient username cannot be empty")]
    EmptyRecipient,

    #[error("Recipient not found")]
    RecipientNotFound,

    #[error("Recipient required")]
    TargetRequired,

    #[error("Cannot add yourself")]
    SelfFriend,

    #[error("Cannot send request to yourself")]
    SelfRequest,

    #[error("Cannot unfriend yourself")]
    SelfUnfriend,

    #[error("Cannot block yourself")]
    SelfBlock,

    #[error("Already friends")]
    AlreadyFriends,

    #[error("Friend request already sent")]
    DuplicateRequest,

    #[error("Recipient has too many pending requests")]
    RequestQueueFull,

    #[error("Friend request not found")]
    RequestNotFound,

    #[error("User is not in your friend list")]
    NotFriends,

    #[error("Failed to remove friend relationship")]
    UnfriendInconsistent,

    #[error("User already blocked")]
    AlreadyBlocked,

    #[error("User is not blocked")]
    NotBlocked,

    #[error("You are blocked by this user")]
    Blocked,

    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Message is too long (maximum {max} characters). Your message has {len} characters.")]
    MessageTooLong { max: usize, len: usize },

    #[error("Message cannot contain '|' or line breaks")]
    MessageHasDelimiter,

    #[error("Failed to save message")]
    MessageNotSaved,

    #[error("Group ID cannot be empty")]
    EmptyGroupId,

    #[error("Group not found")]
    GroupNotFound,

    #[error("Not an admin")]
    NotAdmin,

    #[error("Not a member")]
    NotMember,

    #[error("Not a member of this group")]
    NotGroupMember,

    #[error("User already in group")]
    AlreadyMember,

    #[error("User not in group")]
    NotInGroup,

    #[error("Group message history is full")]
    GroupLogFull,

    #[error("Message not found")]
    MessageNotFound,

    #[error("Failed to read message history")]
    HistoryUnavailable,

    #[error("Unknown command")]
    UnknownCommand,
}
