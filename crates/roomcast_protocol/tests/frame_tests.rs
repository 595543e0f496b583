#![forbid(unsafe_code)]

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use roomcast_protocol::{BrokerFrame, ChatEnvelope, DEFAULT_MAX_FRAME_BYTES, decode_broker_frame, encode_envelope};

fn envelope_with_content(content: &str, sender_id: &str) -> ChatEnvelope {
	ChatEnvelope {
		id: "m-1".to_string(),
		content: content.to_string(),
		sender_id: sender_id.to_string(),
		group_id: "g-1".to_string(),
		created_at: Utc.with_ymd_and_hms(2026, 8, 22, 10, 0, 0).unwrap(),
		room_id: "Room 1".to_string(),
	}
}

#[test]
fn json_control_characters_survive_the_wire() {
	let env = envelope_with_content("line one\nline \"two\"\t\\ and a 😀", "u-1");

	let raw = encode_envelope(&env).expect("encode");
	let BrokerFrame::Chat(decoded) = decode_broker_frame(&raw, DEFAULT_MAX_FRAME_BYTES).expect("decode");

	assert_eq!(decoded, env);
}

proptest! {
	#[test]
	fn arbitrary_content_is_preserved_verbatim(content in ".*", sender in "[A-Za-z0-9_-]{1,24}") {
		let env = envelope_with_content(&content, &sender);

		let raw = encode_envelope(&env).expect("encode");
		let BrokerFrame::Chat(decoded) = decode_broker_frame(&raw, DEFAULT_MAX_FRAME_BYTES).expect("decode");

		prop_assert_eq!(decoded.content, content);
		prop_assert_eq!(decoded.sender_id, sender);
	}
}
