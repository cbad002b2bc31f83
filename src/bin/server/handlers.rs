//! Message handlers for client requests.
//!
//! Every handler runs with the registry lock held by the caller, so each
//! command is atomic with respect to every other command.

use chatd::Request;
use chatd::constants::{Command, GROUP_ID_PREFIX, MAX_USERNAME_LEN, MessageType, RecordKind, is_group_id};
use chatd::protocol::ProtocolMessage;
use chrono::Local;
use tracing::{debug, info, warn};

use crate::activity;
use crate::config::Config;
use crate::connection::SessionInfo;
use crate::error::Rejection;
use crate::state::{Group, GroupMessage, ServerState};
use crate::store::{MessageRecord, PinKey, TIMESTAMP_FORMAT};

/// What the connection loop does after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Successful answer to the requester.
#[derive(Debug)]
pub struct Reply {
    command: Command,
    content: String,
}

impl Reply {
    fn new(command: Command, content: impl Into<String>) -> Self {
        Self {
            command,
            content: content.into(),
        }
    }

    fn success(content: impl Into<String>) -> Self {
        Self::new(Command::Success, content)
    }
}

type HandlerResult = Result<Reply, Rejection>;

/// Why a user goes offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    Logout,
    Disconnect,
    ConnectionLost,
}

impl Departure {
    fn friend_notice(self) -> &'static str {
        match self {
            Departure::Logout | Departure::Disconnect => "User went offline",
            Departure::ConnectionLost => "User has disconnected",
        }
    }

    fn activity(self) -> (&'static str, &'static str) {
        match self {
            Departure::Logout => ("LOGOUT", "User logged out"),
            Departure::Disconnect => ("DISCONNECT", "User disconnected"),
            Departure::ConnectionLost => ("LOGOUT", "User logged out (connection closed)"),
        }
    }
}

/// Handle one decoded request and queue exactly one response for it.
pub fn handle_client_message(
    request: Request,
    session: &mut SessionInfo,
    state: &mut ServerState,
    config: &Config,
) -> Flow {
    debug!(
        connection = session.connection_id,
        command = ?request.command(),
        "dispatching request"
    );

    let result = match request {
        Request::Login { username, password } => {
            let result = handle_login(&username, &password, session, state, config);
            let logged_in = result.is_ok();
            respond(session, result);
            if logged_in {
                deliver_offline_messages(session, state);
            }
            return Flow::Continue;
        }
        Request::Register { username, password } => handle_register(&username, &password, state),
        Request::Logout => handle_logout(session, state, config),
        Request::Disconnect => {
            let result = handle_disconnect(session, state, config);
            respond(session, result);
            return Flow::Close;
        }
        Request::GetFriends => current_user(session, state).map(|me| handle_get_friends(&me, state)),
        Request::AddFriend { username } => {
            current_user(session, state).and_then(|me| handle_add_friend(&me, &username, state))
        }
        Request::SendFriendRequest { username } => current_user(session, state)
            .and_then(|me| handle_send_friend_request(&me, &username, state, config)),
        Request::AcceptFriendRequest { username } => current_user(session, state)
            .and_then(|me| handle_accept_friend_request(&me, &username, state)),
        Request::RejectFriendRequest { username } => current_user(session, state)
            .and_then(|me| handle_reject_friend_request(&me, &username, state)),
        Request::GetFriendRequests => {
            current_user(session, state).map(|me| handle_get_friend_requests(&me, state))
        }
        Request::Unfriend { username } => {
            current_user(session, state).and_then(|me| handle_unfriend(&me, &username, state))
        }
        Request::BlockUser { username } => {
            current_user(session, state).and_then(|me| handle_block(&me, &username, state))
        }
        Request::UnblockUser { username } => {
            current_user(session, state).and_then(|me| handle_unblock(&me, &username, state))
        }
        Request::SendMessage {
            recipient,
            content,
            kind,
            pinned,
        } => current_user(session, state).and_then(|me| {
            handle_send_message(&me, &recipient, &content, kind, pinned, state, config)
        }),
        Request::CreateGroup { name } => {
            current_user(session, state).map(|me| handle_create_group(&me, &name, state))
        }
        Request::AddToGroup { group_id, username } => current_user(session, state)
            .and_then(|me| handle_add_to_group(&me, &group_id, &username, state)),
        Request::RemoveFromGroup { group_id, username } => current_user(session, state)
            .and_then(|me| handle_remove_from_group(&me, &group_id, &username, state)),
        Request::LeaveGroup { group_id } => {
            current_user(session, state).and_then(|me| handle_leave_group(&me, &group_id, state))
        }
        Request::GroupMessage {
            group_id,
            content,
            kind,
            pinned,
        } => current_user(session, state).and_then(|me| {
            handle_group_message(&me, &group_id, &content, kind, pinned, state, config)
        }),
        Request::GetChatHistory { target } => current_user(session, state)
            .and_then(|me| handle_get_chat_history(&me, &target, state, config)),
        Request::SearchHistory {
            keyword,
            counterpart,
        } => current_user(session, state).and_then(|me| {
            handle_search_history(&me, &keyword, counterpart.as_deref(), state, config)
        }),
        Request::SetGroupName { group_id, name } => current_user(session, state)
            .and_then(|me| handle_set_group_name(&me, &group_id, &name, state)),
        Request::PinMessage { target, message_id } => current_user(session, state)
            .and_then(|me| handle_pin_message(&me, &target, &message_id, state)),
        Request::GetPinned { target } => {
            current_user(session, state).and_then(|me| handle_get_pinned(&me, &target, state))
        }
    };

    respond(session, result);
    Flow::Continue
}

fn respond(session: &SessionInfo, result: HandlerResult) {
    let msg = match result {
        Ok(reply) => ProtocolMessage::response(reply.command, reply.content),
        Err(rejection) => {
            debug!(connection = session.connection_id, %rejection, "request rejected");
            ProtocolMessage::response(Command::Error, rejection.to_string())
        }
    };
    if !session.handle.send(&msg) {
        debug!(connection = session.connection_id, "response dropped, connection closing");
    }
}

/// The user bound to this connection. A session evicted by a newer login is
/// no longer bound and is treated as logged out.
fn current_user(session: &SessionInfo, state: &ServerState) -> Result<String, Rejection> {
    match &session.username {
        Some(name) if state.is_bound(name, session.connection_id) => Ok(name.clone()),
        _ => Err(Rejection::NotLoggedIn),
    }
}

fn validate_username(username: &str) -> Result<(), Rejection> {
    if username.is_empty() {
        return Err(Rejection::InvalidUsername("cannot be empty"));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(Rejection::InvalidUsername("too long"));
    }
    if username.chars().any(|c| c.is_whitespace() || c == '|') {
        return Err(Rejection::InvalidUsername("cannot contain spaces or '|'"));
    }
    // Targets with the group prefix are routed to groups.
    if username.starts_with(GROUP_ID_PREFIX) {
        return Err(Rejection::ReservedUsername);
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), Rejection> {
    if password.is_empty() {
        return Err(Rejection::InvalidPassword("cannot be empty"));
    }
    if password.chars().any(char::is_whitespace) {
        return Err(Rejection::InvalidPassword("cannot contain spaces"));
    }
    Ok(())
}

fn validate_content(content: &str, config: &Config) -> Result<(), Rejection> {
    if content.is_empty() {
        return Err(Rejection::EmptyMessage);
    }
    let len = content.chars().count();
    if len > config.max_content_len {
        return Err(Rejection::MessageTooLong {
            max: config.max_content_len,
            len,
        });
    }
    if content.contains(['|', '\n', '\r']) {
        return Err(Rejection::MessageHasDelimiter);
    }
    Ok(())
}

fn handle_register(username: &str, password: &str, state: &mut ServerState) -> HandlerResult {
    validate_username(username)?;
    validate_password(password)?;

    if state.find_user(username).is_some() {
        return Err(Rejection::UsernameTaken);
    }

    if let Err(e) = state.store().append_account(username, password) {
        warn!(user = username, error = %e, "failed to persist account");
        return Err(Rejection::AccountNotSaved);
    }

    state.add_user(username, password);
    activity::record(username, "REGISTER", "New user registered");
    Ok(Reply::success("Registration successful"))
}

fn handle_login(
    username: &str,
    password: &str,
    session: &mut SessionInfo,
    state: &mut ServerState,
    config: &Config,
) -> HandlerResult {
    let valid = state
        .find_user(username)
        .is_some_and(|user| user.password == password);
    if !valid {
        return Err(Rejection::InvalidCredentials);
    }

    // Switching accounts on one connection logs the previous one out.
    if let Some(previous) = session.username.take() {
        if previous != username && state.is_bound(&previous, session.connection_id) {
            go_offline(&previous, Departure::Logout, state, config);
        }
    }

    if let Some(old) = state.bind_session(username, session.handle.clone()) {
        if old.connection_id != session.connection_id {
            old.send(&ProtocolMessage::notice(
                "",
                "Your session was terminated due to new login",
            ));
            old.terminate();
            info!(
                user = username,
                old_connection = old.connection_id,
                new_connection = session.connection_id,
                "previous session evicted"
            );
            activity::record(username, "SESSION_TERMINATED", "Old session closed by new login");
        }
    }

    session.username = Some(username.to_string());
    debug!(user = username, connection = session.connection_id, addr = %session.addr, "session bound");
    activity::record(username, "LOGIN", "User logged in");
    Ok(Reply::success("Login successful"))
}

/// Push every undelivered message addressed to the session's user, oldest
/// first, and mark the pushed ones delivered.
fn deliver_offline_messages(session: &SessionInfo, state: &ServerState) {
    let Some(username) = session.username.as_deref() else {
        return;
    };

    let handle = &session.handle;
    let result = state.store().sweep_undelivered(username, &mut |record| {
        let push = ProtocolMessage {
            command: Command::ReceiveMessage.into(),
            sender: record.sender.clone(),
            content: format!(
                "[{}] From {}: {}",
                record.timestamp, record.sender, record.content
            ),
            msg_type: MessageType::Text,
            ..Default::default()
        };
        handle.send(&push)
    });

    match result {
        Ok(0) => {}
        Ok(count) => info!(user = username, count, "delivered offline messages"),
        Err(e) => warn!(user = username, error = %e, "offline delivery sweep failed"),
    }
}

fn handle_logout(session: &mut SessionInfo, state: &mut ServerState, config: &Config) -> HandlerResult {
    let me = current_user(session, state)?;
    go_offline(&me, Departure::Logout, state, config);
    session.username = None;
    Ok(Reply::success("Logged out"))
}

fn handle_disconnect(
    session: &mut SessionInfo,
    state: &mut ServerState,
    config: &Config,
) -> HandlerResult {
    if let Ok(me) = current_user(session, state) {
        go_offline(&me, Departure::Disconnect, state, config);
    }
    session.username = None;
    Ok(Reply::success("Disconnected"))
}

/// Mark `username` offline, stamp last-seen and tell the people who care.
pub fn go_offline(username: &str, departure: Departure, state: &mut ServerState, config: &Config) {
    state.unbind_session(username, Local::now());

    let (action, detail) = departure.activity();
    activity::record(username, action, detail);

    if departure == Departure::ConnectionLost {
        notify_recent_chatters(username, state, config);
    }
    broadcast_to_friends(username, departure.friend_notice(), state);
}

fn broadcast_to_friends(username: &str, text: &str, state: &ServerState) {
    let Some(user) = state.find_user(username) else {
        return;
    };
    let notice = ProtocolMessage::notice(username, text);
    for friend in &user.friends {
        state.send_to(friend, &notice);
    }
}

/// Alert online users who appear as counterparts of `username` in the first
/// lines of the message log.
fn notify_recent_chatters(username: &str, state: &ServerState, config: &Config) {
    let mut chatters: Vec<String> = Vec::new();
    let mut seen = 0;

    let scanned = state.store().scan_messages(&mut |record| {
        seen += 1;
        let counterpart = if record.sender == username {
            Some(&record.recipient)
        } else if record.recipient == username {
            Some(&record.sender)
        } else {
            None
        };
        if let Some(other) = counterpart {
            if other != username && !chatters.contains(other) {
                chatters.push(other.clone());
            }
        }
        seen < config.recent_chatter_scan
    });

    if let Err(e) = scanned {
        warn!(user = username, error = %e, "could not scan message log for recent chatters");
        return;
    }

    let notice = ProtocolMessage::notice("", format!("User {username} has left the conversation"));
    for chatter in &chatters {
        state.send_to(chatter, &notice);
    }
}

fn handle_get_friends(me: &str, state: &ServerState) -> Reply {
    let mut list = String::from("Friends List:\n");

    if let Some(user) = state.find_user(me) {
        for friend in user.friends.iter().filter_map(|f| state.find_user(f)) {
            let line = if friend.is_online() {
                format!("  - {} [ONLINE]\n", friend.username)
            } else if let Some(seen) = friend.last_seen {
                format!(
                    "  - {} [OFFLINE - Last seen: {}]\n",
                    friend.username,
                    seen.format("%H:%M")
                )
            } else {
                format!("  - {} [OFFLINE]\n", friend.username)
            };
            list.push_str(&line);
        }
    }

    activity::record(me, "GET_FRIENDS", "Retrieved friend list");
    Reply::new(Command::GetFriends, list)
}

fn handle_add_friend(me: &str, target: &str, state: &mut ServerState) -> HandlerResult {
    if state.find_user(target).is_none() {
        return Err(Rejection::UserNotFound);
    }
    if me == target {
        return Err(Rejection::SelfFriend);
    }
    if state.are_friends(me, target) {
        return Err(Rejection::AlreadyFriends);
    }

    state.add_friend(me, target);
    activity::record(me, "ADD_FRIEND", target);
    Ok(Reply::success("Friend added"))
}

fn handle_send_friend_request(
    me: &str,
    target: &str,
    state: &mut ServerState,
    config: &Config,
) -> HandlerResult {
    let Some(user) = state.find_user(target) else {
        return Err(Rejection::UserNotFound);
    };
    if me == target {
        return Err(Rejection::SelfRequest);
    }
    if user.is_friend(me) {
        return Err(Rejection::AlreadyFriends);
    }
    if user.has_request_from(me) {
        return Err(Rejection::DuplicateRequest);
    }
    if user.pending_requests.len() >= config.max_pending_requests {
        return Err(Rejection::RequestQueueFull);
    }

    if let Some(user) = state.find_user_mut(target) {
        user.pending_requests.push(me.to_string());
    }
    state.send_to(
        target,
        &ProtocolMessage::notice("", format!("You have a friend request from {me}")),
    );

    activity::record(me, "SEND_FRIEND_REQUEST", target);
    Ok(Reply::success("Friend request sent"))
}

/// Drop `requester` from `me`'s pending requests.
fn take_request(me: &str, requester: &str, state: &mut ServerState) -> Result<(), Rejection> {
    let user = state.find_user_mut(me).ok_or(Rejection::NotLoggedIn)?;
    let index = user
        .pending_requests
        .iter()
        .position(|r| r == requester)
        .ok_or(Rejection::RequestNotFound)?;
    user.pending_requests.remove(index);
    Ok(())
}

fn handle_accept_friend_request(me: &str, requester: &str, state: &mut ServerState) -> HandlerResult {
    if state.find_user(requester).is_none() {
        return Err(Rejection::UserNotFound);
    }
    take_request(me, requester, state)?;

    state.add_friend(me, requester);
    state.send_to(
        requester,
        &ProtocolMessage::notice("", format!("{me} accepted your friend request")),
    );

    activity::record(me, "ACCEPT_FRIEND_REQUEST", requester);
    Ok(Reply::success(format!("Friend request from {requester} accepted")))
}

fn handle_reject_friend_request(me: &str, requester: &str, state: &mut ServerState) -> HandlerResult {
    take_request(me, requester, state)?;
    activity::record(me, "REJECT_FRIEND_REQUEST", requester);
    Ok(Reply::success(format!("Friend request from {requester} rejected")))
}

fn handle_get_friend_requests(me: &str, state: &ServerState) -> Reply {
    let mut list = String::from("Friend Requests:\n");
    let pending = state
        .find_user(me)
        .map(|u| u.pending_requests.as_slice())
        .unwrap_or_default();

    if pending.is_empty() {
        list.push_str("  (No pending requests)\n");
    } else {
        for (i, name) in pending.iter().enumerate() {
            list.push_str(&format!("  {}. {}\n", i + 1, name));
        }
    }
    Reply::new(Command::GetFriendRequests, list)
}

fn handle_unfriend(me: &str, target: &str, state: &mut ServerState) -> HandlerResult {
    if me == target {
        return Err(Rejection::SelfUnfriend);
    }
    if state.find_user(target).is_none() {
        return Err(Rejection::UserNotFound);
    }
    if !state.are_friends(me, target) {
        return Err(Rejection::NotFriends);
    }

    match state.remove_friend(me, target) {
        (true, true) => {
            activity::record(me, "UNFRIEND", target);
            Ok(Reply::success("Unfriended successfully"))
        }
        sides => {
            warn!(user = me, target, ?sides, "friendship was not mirrored");
            Err(Rejection::UnfriendInconsistent)
        }
    }
}

fn handle_block(me: &str, target: &str, state: &mut ServerState) -> HandlerResult {
    if me == target {
        return Err(Rejection::SelfBlock);
    }
    if state.find_user(target).is_none() {
        return Err(Rejection::UserNotFound);
    }

    let user = state.find_user_mut(me).ok_or(Rejection::NotLoggedIn)?;
    if user.has_blocked(target) {
        return Err(Rejection::AlreadyBlocked);
    }
    user.blocked.push(target.to_string());

    activity::record(me, "BLOCK_USER", target);
    Ok(Reply::success("User blocked"))
}

fn handle_unblock(me: &str, target: &str, state: &mut ServerState) -> HandlerResult {
    let user = state.find_user_mut(me).ok_or(Rejection::NotLoggedIn)?;
    let index = user
        .blocked
        .iter()
        .position(|b| b == target)
        .ok_or(Rejection::NotBlocked)?;
    user.blocked.remove(index);

    activity::record(me, "UNBLOCK_USER", target);
    Ok(Reply::success("User unblocked"))
}

fn handle_send_message(
    me: &str,
    recipient: &str,
    content: &str,
    kind: MessageType,
    pinned: bool,
    state: &mut ServerState,
    config: &Config,
) -> HandlerResult {
    validate_content(content, config)?;
    if recipient.is_empty() {
        return Err(Rejection::EmptyRecipient);
    }
    if state.find_user(recipient).is_none() {
        return Err(Rejection::RecipientNotFound);
    }
    if state.is_blocked(recipient, me) {
        return Err(Rejection::Blocked);
    }

    let now = Local::now();
    let push = ProtocolMessage {
        command: Command::ReceiveMessage.into(),
        sender: me.to_string(),
        content: content.to_string(),
        msg_type: kind,
        ..Default::default()
    };
    let delivered = state.send_to(recipient, &push);

    let record = MessageRecord {
        timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
        sender: me.to_string(),
        recipient: recipient.to_string(),
        kind: RecordKind::Direct,
        content: content.to_string(),
        delivered,
        pinned,
    };
    if let Err(e) = state.store().append_message(&record) {
        warn!(user = me, recipient, error = %e, "failed to persist message");
        if !delivered {
            return Err(Rejection::MessageNotSaved);
        }
    }

    activity::record(me, "SEND_MESSAGE", recipient);
    Ok(Reply::success("Message sent"))
}

fn handle_create_group(me: &str, name: &str, state: &mut ServerState) -> Reply {
    let now = Local::now();
    let group_id = state.next_group_id(me, &now);
    state.groups.insert(
        group_id.clone(),
        Group::new(group_id.clone(), name.to_string(), me.to_string(), now),
    );

    activity::record(me, "CREATE_GROUP", &group_id);
    Reply::success(format!("Group created: {group_id}"))
}

fn handle_add_to_group(me: &str, group_id: &str, target: &str, state: &mut ServerState) -> HandlerResult {
    let target_exists = state.find_user(target).is_some();
    let group = state.find_group_mut(group_id).ok_or(Rejection::GroupNotFound)?;
    if !group.is_admin(me) {
        return Err(Rejection::NotAdmin);
    }
    if !target_exists {
        return Err(Rejection::UserNotFound);
    }
    if group.is_member(target) {
        return Err(Rejection::AlreadyMember);
    }
    group.members.push(target.to_string());

    activity::record(me, "ADD_TO_GROUP", target);
    Ok(Reply::success("User added to group"))
}

fn handle_remove_from_group(
    me: &str,
    group_id: &str,
    target: &str,
    state: &mut ServerState,
) -> HandlerResult {
    let group = state.find_group_mut(group_id).ok_or(Rejection::GroupNotFound)?;
    if !group.is_admin(me) {
        return Err(Rejection::NotAdmin);
    }
    if !group.remove_member(target) {
        return Err(Rejection::NotInGroup);
    }
    if group.admins.is_empty() {
        warn!(group = group_id, "group has no admins left");
    }

    activity::record(me, "REMOVE_FROM_GROUP", target);
    Ok(Reply::success("User removed from group"))
}

fn handle_leave_group(me: &str, group_id: &str, state: &mut ServerState) -> HandlerResult {
    let group = state.find_group_mut(group_id).ok_or(Rejection::GroupNotFound)?;
    if !group.remove_member(me) {
        return Err(Rejection::NotGroupMember);
    }
    if group.admins.is_empty() {
        warn!(group = group_id, "group has no admins left");
    }

    activity::record(me, "LEAVE_GROUP", group_id);
    Ok(Reply::success("Left group"))
}

fn handle_group_message(
    me: &str,
    group_id: &str,
    content: &str,
    kind: MessageType,
    pinned: bool,
    state: &mut ServerState,
    config: &Config,
) -> HandlerResult {
    validate_content(content, config)?;
    if group_id.is_empty() {
        return Err(Rejection::EmptyGroupId);
    }

    let now = Local::now();
    let members = {
        let group = state.find_group_mut(group_id).ok_or(Rejection::GroupNotFound)?;
        if !group.is_member(me) {
            return Err(Rejection::NotMember);
        }
        if group.messages.len() >= config.group_message_capacity {
            return Err(Rejection::GroupLogFull);
        }

        let id = group.next_message_id(me, &now);
        group.messages.push(GroupMessage {
            id,
            sender: me.to_string(),
            content: content.to_string(),
            kind,
            timestamp: now,
            pinned,
        });
        group.members.clone()
    };

    let push = ProtocolMessage {
        command: Command::ReceiveMessage.into(),
        sender: me.to_string(),
        recipient: group_id.to_string(),
        content: content.to_string(),
        msg_type: kind,
        ..Default::default()
    };
    let timestamp = now.format(TIMESTAMP_FORMAT).to_string();

    for member in &members {
        let Some(user) = state.find_user(member) else {
            continue;
        };
        let delivered = if member == me {
            user.is_online()
        } else {
            state.send_to(member, &push)
        };

        let record = MessageRecord {
            timestamp: timestamp.clone(),
            sender: me.to_string(),
            recipient: member.clone(),
            kind: RecordKind::Group,
            content: content.to_string(),
            delivered,
            pinned,
        };
        if let Err(e) = state.store().append_message(&record) {
            warn!(user = me, group = group_id, member, error = %e, "failed to persist group message");
        }
    }

    activity::record(me, "GROUP_MESSAGE", group_id);
    Ok(Reply::success("Group message sent"))
}

fn format_history<'a>(lines: impl Iterator<Item = (String, &'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (timestamp, sender, content) in lines {
        out.push_str(&format!("{timestamp}|{sender}|{content}\n"));
    }
    if out.is_empty() {
        out.push_str("NO_HISTORY");
    }
    out
}

fn handle_get_chat_history(
    me: &str,
    target: &str,
    state: &ServerState,
    config: &Config,
) -> HandlerResult {
    if target.is_empty() {
        return Err(Rejection::TargetRequired);
    }

    if is_group_id(target) {
        let group = state.find_group(target).ok_or(Rejection::GroupNotFound)?;
        if !group.is_member(me) {
            return Err(Rejection::NotGroupMember);
        }
        let skip = group.messages.len().saturating_sub(config.history_limit);
        let history = format_history(group.messages.iter().skip(skip).map(|m| {
            (
                m.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                m.sender.as_str(),
                m.content.as_str(),
            )
        }));
        return Ok(Reply::new(Command::GetChatHistory, history));
    }

    let records = state
        .store()
        .find_messages(&mut |r| r.is_direct_between(me, target))
        .map_err(|e| {
            warn!(user = me, error = %e, "failed to read chat history");
            Rejection::HistoryUnavailable
        })?;

    let skip = records.len().saturating_sub(config.history_limit);
    let history = format_history(
        records
            .iter()
            .skip(skip)
            .map(|r| (r.timestamp.clone(), r.sender.as_str(), r.content.as_str())),
    );
    Ok(Reply::new(Command::GetChatHistory, history))
}

fn handle_search_history(
    me: &str,
    keyword: &str,
    counterpart: Option<&str>,
    state: &ServerState,
    config: &Config,
) -> HandlerResult {
    let mut matches = Vec::new();
    let scanned = state.store().scan_messages(&mut |r| {
        if matches.len() >= config.search_limit {
            return false;
        }
        let involves_me = r.sender == me || r.recipient == me;
        let involves_other = counterpart.is_none_or(|c| r.sender == c || r.recipient == c);
        if r.content.contains(keyword) && involves_me && involves_other {
            matches.push(r.clone());
        }
        matches.len() < config.search_limit
    });
    if let Err(e) = scanned {
        warn!(user = me, error = %e, "failed to search message history");
        return Err(Rejection::HistoryUnavailable);
    }

    let mut results = String::from("Search results: ");
    for r in &matches {
        results.push_str(&format!(
            "[{}] {} -> {}: {}{} | ",
            r.timestamp,
            r.sender,
            r.recipient,
            r.content,
            if r.pinned { " [PINNED]" } else { "" }
        ));
    }

    activity::record(me, "SEARCH_HISTORY", keyword);
    Ok(Reply::new(Command::SearchHistory, results))
}

fn handle_set_group_name(me: &str, group_id: &str, name: &str, state: &mut ServerState) -> HandlerResult {
    let group = state.find_group_mut(group_id).ok_or(Rejection::GroupNotFound)?;
    if !group.is_admin(me) {
        return Err(Rejection::NotAdmin);
    }
    group.name = name.to_string();

    activity::record(me, "SET_GROUP_NAME", group_id);
    Ok(Reply::success("Group name updated"))
}

fn handle_pin_message(me: &str, target: &str, message_id: &str, state: &mut ServerState) -> HandlerResult {
    if target.is_empty() {
        return Err(Rejection::TargetRequired);
    }
    if is_group_id(target) {
        pin_group_message(me, target, message_id, state)
    } else {
        pin_direct_message(me, target, message_id, state)
    }
}

/// Group pins live in memory; the matching log records are updated on a
/// best-effort basis.
fn pin_group_message(me: &str, group_id: &str, message_id: &str, state: &mut ServerState) -> HandlerResult {
    let group = state.find_group_mut(group_id).ok_or(Rejection::GroupNotFound)?;
    if !group.is_member(me) {
        return Err(Rejection::NotGroupMember);
    }
    let message = group
        .message_mut(message_id)
        .ok_or(Rejection::MessageNotFound)?;
    message.pinned = true;

    let key = PinKey {
        timestamp: message.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        sender: message.sender.clone(),
        content: message.content.clone(),
    };
    match state.store().update_pin(&key, true) {
        Ok(true) => {}
        Ok(false) => debug!(group = group_id, message_id, "no persisted copy to pin"),
        Err(e) => warn!(group = group_id, message_id, error = %e, "failed to persist pin"),
    }

    activity::record(me, "PIN_MESSAGE", message_id);
    Ok(Reply::success("Message pinned"))
}

/// Direct pins select the most recent record between the pair whose content
/// equals `content`, or the most recent one overall when `content` is empty.
fn pin_direct_message(me: &str, target: &str, content: &str, state: &ServerState) -> HandlerResult {
    let candidates = state
        .store()
        .find_messages(&mut |r| {
            r.is_direct_between(me, target) && (content.is_empty() || r.content == content)
        })
        .map_err(|e| {
            warn!(user = me, error = %e, "failed to read messages for pin");
            Rejection::HistoryUnavailable
        })?;
    let key = candidates
        .last()
        .map(MessageRecord::pin_key)
        .ok_or(Rejection::MessageNotFound)?;

    match state.store().update_pin(&key, true) {
        Ok(true) => {
            activity::record(me, "PIN_MESSAGE", target);
            Ok(Reply::success("Message pinned"))
        }
        Ok(false) => Err(Rejection::MessageNotFound),
        Err(e) => {
            warn!(user = me, error = %e, "failed to persist pin");
            Err(Rejection::MessageNotSaved)
        }
    }
}

fn handle_get_pinned(me: &str, target: &str, state: &ServerState) -> HandlerResult {
    if target.is_empty() {
        return Err(Rejection::TargetRequired);
    }

    let pinned: Vec<String> = if is_group_id(target) {
        let group = state.find_group(target).ok_or(Rejection::GroupNotFound)?;
        if !group.is_member(me) {
            return Err(Rejection::NotGroupMember);
        }
        group
            .messages
            .iter()
            .filter(|m| m.pinned)
            .map(|m| m.content.clone())
            .collect()
    } else {
        let records = state
            .store()
            .find_messages(&mut |r| r.pinned && r.is_direct_between(me, target))
            .map_err(|e| {
                warn!(user = me, error = %e, "failed to read pinned messages");
                Rejection::HistoryUnavailable
            })?;
        records.into_iter().map(|r| r.content).collect()
    };

    let mut list = String::from("Pinned messages: ");
    for content in &pinned {
        list.push_str(content);
        list.push_str(" | ");
    }
    Ok(Reply::new(Command::GetPinned, list))
}
