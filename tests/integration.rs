//! Integration tests for the chatd wire types.

use bytes::{BufMut, BytesMut};
use chatd::constants::{Command, MessageType};
use chatd::protocol::{FRAME_HEADER_LEN, ProtocolMessage};
use chatd::{Error, Request};

fn frame_of(body: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body.as_bytes());
    buf
}

mod record_format {
    use super::*;

    #[test]
    fn test_encode_field_order() {
        let msg = ProtocolMessage {
            command: Command::SendMessage.into(),
            sender: "alice".to_string(),
            recipient: "bob".to_string(),
            content: "hi".to_string(),
            extra: String::new(),
            msg_type: MessageType::Emoji,
            pinned: true,
        };
        assert_eq!(
            msg.encode(),
            "CMD:4|SENDER:alice|RECIPIENT:bob|CONTENT:hi|EXTRA:|TYPE:1|PINNED:1|"
        );
    }

    #[test]
    fn test_decode_reference_record() {
        let msg = ProtocolMessage::decode(
            b"CMD:11|SENDER:alice|RECIPIENT:GROUP_alice_1700000000|CONTENT:hello all|EXTRA:|TYPE:0|PINNED:0|",
        );
        assert_eq!(msg.command().unwrap(), Command::GroupMessage);
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.recipient, "GROUP_alice_1700000000");
        assert_eq!(msg.content, "hello all");
        assert!(msg.extra.is_empty());
        assert_eq!(msg.msg_type, MessageType::Text);
        assert!(!msg.pinned);
    }

    #[test]
    fn test_decode_tolerates_missing_and_unknown_fields() {
        let msg = ProtocolMessage::decode(b"SENDER:bob|COLOR:blue|CONTENT:x");
        assert_eq!(msg.command, 0);
        assert_eq!(msg.sender, "bob");
        assert_eq!(msg.content, "x");
        assert!(msg.recipient.is_empty());
    }

    #[test]
    fn test_delimiters_in_values_survive() {
        let msg = ProtocolMessage {
            command: Command::SearchHistory.into(),
            content: r"a|b\c".to_string(),
            ..Default::default()
        };
        let decoded = ProtocolMessage::decode(msg.encode().as_bytes());
        assert_eq!(decoded.content, r"a|b\c");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_non_numeric_type_decodes_as_text() {
        let msg = ProtocolMessage::decode(b"CMD:4|TYPE:abc|PINNED:yes|");
        assert_eq!(msg.msg_type, MessageType::Text);
        assert!(!msg.pinned);
    }
}

mod framing {
    use super::*;

    #[test]
    fn test_frame_header_is_little_endian_length() {
        let msg = ProtocolMessage::response(Command::Success, "ok");
        let frame = msg.to_frame();
        let body_len = msg.encode().len();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + body_len);
        assert_eq!(&frame[..4], (body_len as u32).to_le_bytes());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let full = frame_of("CMD:3|");
        let mut buf = BytesMut::from(&full[..full.len() - 2]);
        assert!(ProtocolMessage::read_message(&mut buf, 1024).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 2..]);
        let msg = ProtocolMessage::read_message(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(msg.command().unwrap(), Command::GetFriends);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        ProtocolMessage::new(Command::GetFriends).write_message(&mut buf);
        ProtocolMessage::new(Command::Logout).write_message(&mut buf);

        let first = ProtocolMessage::read_message(&mut buf, 1024).unwrap().unwrap();
        let second = ProtocolMessage::read_message(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(first.command().unwrap(), Command::GetFriends);
        assert_eq!(second.command().unwrap(), Command::Logout);
        assert!(ProtocolMessage::read_message(&mut buf, 1024).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = frame_of(&"x".repeat(100));
        match ProtocolMessage::read_message(&mut buf, 64) {
            Err(Error::FrameTooLarge { len, max }) => {
                assert_eq!(len, 100);
                assert_eq!(max, 64);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }
}

mod requests {
    use super::*;

    fn parse(msg: ProtocolMessage) -> Request {
        Request::try_from(msg).unwrap()
    }

    #[test]
    fn test_login_carries_credentials() {
        let msg = ProtocolMessage {
            command: Command::Login.into(),
            sender: "alice".to_string(),
            content: "secret".to_string(),
            ..Default::default()
        };
        assert_eq!(
            parse(msg),
            Request::Login {
                username: "alice".to_string(),
                password: "secret".to_string(),
            }
        );
    }

    #[test]
    fn test_group_membership_uses_extra_for_group_id() {
        let msg = ProtocolMessage {
            command: Command::AddToGroup.into(),
            recipient: "bob".to_string(),
            extra: "GROUP_alice_1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            parse(msg),
            Request::AddToGroup {
                group_id: "GROUP_alice_1".to_string(),
                username: "bob".to_string(),
            }
        );
    }

    #[test]
    fn test_search_without_counterpart() {
        let msg = ProtocolMessage {
            command: Command::SearchHistory.into(),
            content: "lunch".to_string(),
            ..Default::default()
        };
        assert_eq!(
            parse(msg),
            Request::SearchHistory {
                keyword: "lunch".to_string(),
                counterpart: None,
            }
        );
    }

    #[test]
    fn test_request_survives_the_wire() {
        let request = Request::GroupMessage {
            group_id: "GROUP_alice_1".to_string(),
            content: "pipes | welcome".to_string(),
            kind: MessageType::Emoji,
            pinned: true,
        };
        let mut buf = request.to_message("alice").to_frame();
        let msg = ProtocolMessage::read_message(&mut buf, 4096).unwrap().unwrap();
        assert_eq!(msg.sender, "alice");
        assert_eq!(parse(msg), request);
    }

    #[test]
    fn test_unknown_and_server_only_codes() {
        let unknown = ProtocolMessage {
            command: 42,
            ..Default::default()
        };
        assert!(matches!(Request::try_from(unknown), Err(Error::InvalidCommand(42))));

        let push = ProtocolMessage::new(Command::ReceiveMessage);
        assert!(matches!(
            Request::try_from(push),
            Err(Error::ServerOnlyCommand(Command::ReceiveMessage))
        ));
    }
}
