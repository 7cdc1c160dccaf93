#![forbid(unsafe_code)]

use std::sync::Arc;

use classchat_domain::{MessageId, PrivacyLevel, Role, SubjectId};
use classchat_protocol::pb;

use crate::server::access::UpdateRoomRequest;
use crate::server::error::{AccessError, HubError};
use crate::server::presence::HubItem;
use crate::server::store::{MessageStore, StoredMessage};
use crate::server::test_support::{FlakyMessageStore, TestStack, drain, next_event, next_message};
use crate::util::time::unix_ms_now;

#[tokio::test]
async fn third_joiner_is_refused_when_room_holds_two() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Private, Some("P@ss1"), 2).await;

	let a = TestStack::identity("alice", Role::Student);
	let b = TestStack::identity("bob", Role::Student);
	let c = TestStack::identity("carol", Role::Student);

	let (_a_conn, _a_rx) = stack.enter(&a, room.id, Some("P@ss1")).await;
	assert_eq!(stack.hub.occupancy(room.id).await, 1);
	let (_b_conn, _b_rx) = stack.enter(&b, room.id, Some("P@ss1")).await;
	assert_eq!(stack.hub.occupancy(room.id).await, 2);

	let err = stack.grant(&c, room.id, Some("P@ss1")).await.expect_err("room is full");
	assert!(matches!(err, AccessError::CapacityExceeded), "got {err:?}");
	assert_eq!(stack.hub.occupancy(room.id).await, 2);
}

#[tokio::test]
async fn hub_rechecks_capacity_for_a_stale_grant() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 1).await;

	let a = TestStack::identity("alice", Role::Student);
	let b = TestStack::identity("bob", Role::Student);
	let b_grant = stack.grant(&b, room.id, None).await.expect("grant while empty");
	let (_a_conn, _a_rx) = stack.enter(&a, room.id, None).await;

	let (b_conn, _b_rx) = stack.hub.connect(stack.session(&b));
	let err = stack
		.hub
		.join_room(b_conn, &room.id.to_string(), &b_grant.room_access_token)
		.await
		.expect_err("full");
	assert_eq!(err, HubError::CapacityExceeded);
}

#[tokio::test]
async fn thirty_first_message_in_a_minute_is_rate_limited() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;

	let a = TestStack::identity("alice", Role::Student);
	let observer = TestStack::identity("bob", Role::Student);
	let (a_conn, _a_rx) = stack.enter(&a, room.id, None).await;
	let (_o_conn, mut o_rx) = stack.enter(&observer, room.id, None).await;
	let room_key = room.id.to_string();

	for i in 1..=30 {
		stack
			.hub
			.send_message(a_conn, &room_key, &format!("message {i}"))
			.await
			.unwrap_or_else(|e| panic!("message {i} should pass: {e:?}"));
	}

	let err = stack
		.hub
		.send_message(a_conn, &room_key, "message 31")
		.await
		.expect_err("31st is over the limit");
	match err {
		HubError::RateLimited { retry_after_secs } => assert!((1..=60).contains(&retry_after_secs)),
		other => panic!("expected RateLimited, got {other:?}"),
	}

	for i in 1..=30 {
		assert_eq!(next_message(&mut o_rx).await.content, format!("message {i}"));
	}
	let rest = drain(&mut o_rx);
	assert!(
		!rest.iter().any(|item| matches!(
			item,
			HubItem::Event(ev) if matches!(ev.event, Some(pb::event_envelope::Event::ReceiveMessage(_)))
		)),
		"rate-limited message must not be broadcast"
	);

	let stored = stack.messages.recent(room.id, 100).await.expect("recent");
	assert_eq!(stored.len(), 30);
}

#[tokio::test]
async fn deleting_a_room_evicts_members_and_kills_their_tokens() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Private, Some("P@ss1"), 5).await;

	let a = TestStack::identity("alice", Role::Student);
	let grant = stack.grant(&a, room.id, Some("P@ss1")).await.expect("grant");
	let (a_conn, mut a_rx) = stack.hub.connect(stack.session(&a));
	let room_key = room.id.to_string();
	stack
		.hub
		.join_room(a_conn, &room_key, &grant.room_access_token)
		.await
		.expect("join");

	stack.access.delete_room(&owner, &room_key).await.expect("delete");

	loop {
		if let pb::event_envelope::Event::Kicked(k) = next_event(&mut a_rx).await {
			assert_eq!(k.reason, pb::LeaveReason::RoomClosed as i32);
			break;
		}
	}

	assert_eq!(
		stack.hub.send_message(a_conn, &room_key, "still here?").await,
		Err(HubError::Authentication)
	);
	assert_eq!(
		stack.hub.join_room(a_conn, &room_key, &grant.room_access_token).await.map(|_| ()),
		Err(HubError::Authentication)
	);
	assert_eq!(stack.hub.occupancy(room.id).await, 0);

	let audit = stack.audit.recorded();
	assert!(audit.iter().any(|r| r.action == "delete_room"));
}

#[tokio::test]
async fn history_returns_stored_messages_oldest_first() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let (conn, _rx) = stack.enter(&owner, room.id, None).await;
	let room_key = room.id.to_string();

	for text in ["first", "second", "third"] {
		stack.hub.send_message(conn, &room_key, text).await.expect("send");
	}

	let history = stack.hub.load_history(conn, &room_key, 50).await.expect("history");
	let texts: Vec<_> = history
		.iter()
		.map(|h| h.content.clone().expect("readable"))
		.collect();
	assert_eq!(texts, ["first", "second", "third"]);
	assert!(history.iter().all(|h| h.sender_id == "teacher"));

	let stored = stack.messages.recent(room.id, 10).await.expect("recent");
	assert!(stored.iter().all(|m| m.encrypted));
	assert!(stored.iter().all(|m| m.body != b"first".to_vec()));
}

#[tokio::test]
async fn history_isolates_an_undecryptable_record() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let (conn, _rx) = stack.enter(&owner, room.id, None).await;
	let room_key = room.id.to_string();

	stack.hub.send_message(conn, &room_key, "before").await.expect("send");
	stack
		.messages
		.append(&StoredMessage {
			id: MessageId::new_v4(),
			room_id: room.id,
			sender_id: SubjectId::new("mallory").expect("subject"),
			sender_name: "Mallory".to_string(),
			body: vec![0u8; 40],
			encrypted: true,
			sent_at_ms: unix_ms_now(),
			edited: false,
		})
		.await
		.expect("append");
	stack.hub.send_message(conn, &room_key, "after").await.expect("send");

	let history = stack.hub.load_history(conn, &room_key, 10).await.expect("history");
	assert_eq!(history.len(), 3);
	assert_eq!(history[0].content.as_deref(), Ok("before"));
	assert!(history[1].content.is_err());
	assert_eq!(history[2].content.as_deref(), Ok("after"));
}

#[tokio::test]
async fn history_count_is_validated_and_clamped() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let (conn, _rx) = stack.enter(&owner, room.id, None).await;
	let room_key = room.id.to_string();

	let err = stack.hub.load_history(conn, &room_key, 0).await.expect_err("zero count");
	assert!(matches!(err, HubError::Validation { field: "count", .. }));

	stack.hub.send_message(conn, &room_key, "only").await.expect("send");
	let history = stack.hub.load_history(conn, &room_key, u32::MAX).await.expect("history");
	assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn leaving_twice_is_harmless() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let a = TestStack::identity("alice", Role::Student);
	let (conn, _rx) = stack.enter(&a, room.id, None).await;
	let room_key = room.id.to_string();

	assert_eq!(stack.hub.leave_room(conn, &room_key).await, Ok(true));
	assert_eq!(stack.hub.leave_room(conn, &room_key).await, Ok(false));
	assert_eq!(stack.hub.occupancy(room.id).await, 0);
	assert_eq!(stack.hub.stats().present, 0);
}

#[tokio::test]
async fn revoked_session_is_rejected_on_the_next_operation() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;

	let a = TestStack::identity("alice", Role::Student);
	let grant = stack.grant(&a, room.id, None).await.expect("grant");
	let session = stack.session(&a);
	let (conn, _rx) = stack.hub.connect(session.clone());
	let room_key = room.id.to_string();
	stack
		.hub
		.join_room(conn, &room_key, &grant.room_access_token)
		.await
		.expect("join");

	stack.sessions.revoke(&session);

	assert_eq!(
		stack.hub.send_message(conn, &room_key, "hi").await,
		Err(HubError::Authentication)
	);
	assert_eq!(stack.hub.send_typing(conn, &room_key).await, Err(HubError::Authentication));
}

#[tokio::test]
async fn room_token_is_bound_to_subject_and_room() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let other = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;

	let a = TestStack::identity("alice", Role::Student);
	let b = TestStack::identity("bob", Role::Student);
	let a_grant = stack.grant(&a, room.id, None).await.expect("grant");

	let (b_conn, _b_rx) = stack.hub.connect(stack.session(&b));
	assert_eq!(
		stack
			.hub
			.join_room(b_conn, &room.id.to_string(), &a_grant.room_access_token)
			.await
			.map(|_| ()),
		Err(HubError::Authentication)
	);

	let (a_conn, _a_rx) = stack.hub.connect(stack.session(&a));
	assert_eq!(
		stack
			.hub
			.join_room(a_conn, &other.id.to_string(), &a_grant.room_access_token)
			.await
			.map(|_| ()),
		Err(HubError::Authentication)
	);
}

#[tokio::test]
async fn credential_change_invalidates_outstanding_tokens() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Private, Some("old-pass"), 10).await;
	let room_key = room.id.to_string();

	let a = TestStack::identity("alice", Role::Student);
	let (a_conn, _a_rx) = stack.enter(&a, room.id, Some("old-pass")).await;

	let b = TestStack::identity("bob", Role::Student);
	let b_grant = stack.grant(&b, room.id, Some("old-pass")).await.expect("grant");

	stack
		.access
		.update_room(
			&owner,
			&room_key,
			UpdateRoomRequest {
				password: Some("new-pass".to_string()),
				..UpdateRoomRequest::default()
			},
		)
		.await
		.expect("update");

	let (b_conn, _b_rx) = stack.hub.connect(stack.session(&b));
	assert_eq!(
		stack
			.hub
			.join_room(b_conn, &room_key, &b_grant.room_access_token)
			.await
			.map(|_| ()),
		Err(HubError::Authentication)
	);

	stack
		.hub
		.send_message(a_conn, &room_key, "present members stay")
		.await
		.expect("a keeps presence");

	assert!(matches!(
		stack.grant(&b, room.id, Some("old-pass")).await,
		Err(AccessError::JoinFailed)
	));
	stack.grant(&b, room.id, Some("new-pass")).await.expect("new password works");
}

#[tokio::test]
async fn only_moderators_can_kick() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let room_key = room.id.to_string();

	let (owner_conn, _owner_rx) = stack.enter(&owner, room.id, None).await;
	let a = TestStack::identity("alice", Role::Student);
	let b = TestStack::identity("bob", Role::Student);
	let (a_conn, _a_rx) = stack.enter(&a, room.id, None).await;
	let (b_conn, mut b_rx) = stack.enter(&b, room.id, None).await;

	assert_eq!(
		stack.hub.kick(a_conn, &room_key, b_conn).await.map(|_| ()),
		Err(HubError::Forbidden)
	);
	assert!(matches!(
		stack.hub.kick(owner_conn, &room_key, owner_conn).await,
		Err(HubError::Validation { .. })
	));

	let removed = stack.hub.kick(owner_conn, &room_key, b_conn).await.expect("kick");
	assert_eq!(removed.subject_id.as_str(), "bob");

	loop {
		if let pb::event_envelope::Event::Kicked(k) = next_event(&mut b_rx).await {
			assert_eq!(k.reason, pb::LeaveReason::Kicked as i32);
			assert_eq!(k.by_subject_id, "teacher");
			break;
		}
	}
	assert_eq!(stack.hub.send_message(b_conn, &room_key, "hey").await, Err(HubError::NotInRoom));
	assert_eq!(stack.hub.occupancy(room.id).await, 2);

	let audit = stack.audit.recorded();
	assert_eq!(audit.len(), 1);
	assert_eq!(audit[0].action, "kick");
	assert_eq!(audit[0].target_subject_id.as_deref(), Some("bob"));
}

#[tokio::test]
async fn kicked_member_cannot_reuse_their_access_token() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Private, Some("P@ss1"), 10).await;
	let room_key = room.id.to_string();

	let (owner_conn, _owner_rx) = stack.enter(&owner, room.id, Some("P@ss1")).await;
	let b = TestStack::identity("bob", Role::Student);
	let b_grant = stack.grant(&b, room.id, Some("P@ss1")).await.expect("grant");
	let (b_conn, _b_rx) = stack.hub.connect(stack.session(&b));
	stack
		.hub
		.join_room(b_conn, &room_key, &b_grant.room_access_token)
		.await
		.expect("join");

	stack.hub.kick(owner_conn, &room_key, b_conn).await.expect("kick");

	assert_eq!(
		stack
			.hub
			.join_room(b_conn, &room_key, &b_grant.room_access_token)
			.await
			.map(|_| ()),
		Err(HubError::Authentication)
	);
	let (other_conn, _other_rx) = stack.hub.connect(stack.session(&b));
	assert_eq!(
		stack
			.hub
			.join_room(other_conn, &room_key, &b_grant.room_access_token)
			.await
			.map(|_| ()),
		Err(HubError::Authentication)
	);
	assert_eq!(stack.hub.send_message(b_conn, &room_key, "back").await, Err(HubError::NotInRoom));
	assert_eq!(stack.hub.occupancy(room.id).await, 1);

	// A fresh grant through the password gate still works.
	let fresh = stack.grant(&b, room.id, Some("P@ss1")).await.expect("fresh grant");
	stack
		.hub
		.join_room(b_conn, &room_key, &fresh.room_access_token)
		.await
		.expect("rejoin with fresh token");
	assert_eq!(stack.hub.occupancy(room.id).await, 2);
}

#[tokio::test]
async fn failed_write_is_reported_and_not_broadcast() {
	let stack = TestStack::with_messages(Arc::new(FlakyMessageStore::new(2)));
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let room_key = room.id.to_string();

	let (conn, _rx) = stack.enter(&owner, room.id, None).await;
	let observer = TestStack::identity("bob", Role::Student);
	let (_o_conn, mut o_rx) = stack.enter(&observer, room.id, None).await;
	drain(&mut o_rx);

	assert_eq!(
		stack.hub.send_message(conn, &room_key, "lost").await,
		Err(HubError::NotDelivered)
	);
	assert!(drain(&mut o_rx).is_empty());

	stack.hub.send_message(conn, &room_key, "kept").await.expect("store recovered");
	assert_eq!(next_message(&mut o_rx).await.content, "kept");
}

#[tokio::test]
async fn a_single_write_failure_is_retried() {
	let stack = TestStack::with_messages(Arc::new(FlakyMessageStore::new(1)));
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let (conn, _rx) = stack.enter(&owner, room.id, None).await;

	stack
		.hub
		.send_message(conn, &room.id.to_string(), "retried")
		.await
		.expect("retry succeeds");
}

#[tokio::test]
async fn typing_reaches_everyone_but_the_typist() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let room_key = room.id.to_string();

	let (a_conn, mut a_rx) = stack.enter(&owner, room.id, None).await;
	let b = TestStack::identity("bob", Role::Student);
	let (_b_conn, mut b_rx) = stack.enter(&b, room.id, None).await;
	drain(&mut a_rx);
	drain(&mut b_rx);

	stack.hub.send_typing(a_conn, &room_key).await.expect("typing");

	match next_event(&mut b_rx).await {
		pb::event_envelope::Event::ReceiveTyping(t) => {
			assert_eq!(t.connection_id, a_conn.0);
			assert_eq!(t.subject_id, "teacher");
		}
		other => panic!("expected typing, got {other:?}"),
	}
	assert!(drain(&mut a_rx).is_empty());
}

#[tokio::test]
async fn operations_outside_a_room_are_rejected() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let room_key = room.id.to_string();

	let (conn, _rx) = stack.hub.connect(stack.session(&owner));
	assert_eq!(stack.hub.send_message(conn, &room_key, "hi").await, Err(HubError::NotInRoom));
	assert_eq!(stack.hub.send_typing(conn, &room_key).await, Err(HubError::NotInRoom));
	assert!(matches!(
		stack.hub.send_message(conn, "not-a-room", "hi").await,
		Err(HubError::Validation { .. })
	));
	assert_eq!(stack.hub.leave_room(conn, &room_key).await, Ok(false));
}

#[tokio::test]
async fn message_content_is_validated() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let room_key = room.id.to_string();
	let (conn, _rx) = stack.enter(&owner, room.id, None).await;

	assert!(matches!(
		stack.hub.send_message(conn, &room_key, "   ").await,
		Err(HubError::Validation { field: "content", .. })
	));
	let too_long = "x".repeat(stack.hub.config().max_message_chars + 1);
	assert!(matches!(
		stack.hub.send_message(conn, &room_key, &too_long).await,
		Err(HubError::Validation { field: "content", .. })
	));
}

#[tokio::test]
async fn disconnect_announces_departure_and_frees_capacity() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 2).await;

	let (_owner_conn, mut owner_rx) = stack.enter(&owner, room.id, None).await;
	let a = TestStack::identity("alice", Role::Student);
	let (a_conn, _a_rx) = stack.enter(&a, room.id, None).await;
	drain(&mut owner_rx);

	stack.hub.disconnect(a_conn).await;
	stack.hub.disconnect(a_conn).await;

	match next_event(&mut owner_rx).await {
		pb::event_envelope::Event::UserLeft(left) => {
			assert_eq!(left.reason, pb::LeaveReason::Disconnected as i32);
			assert_eq!(left.member.expect("member").subject_id, "alice");
		}
		other => panic!("expected UserLeft, got {other:?}"),
	}
	assert_eq!(stack.hub.occupancy(room.id).await, 1);

	let b = TestStack::identity("bob", Role::Student);
	stack.enter(&b, room.id, None).await;
	assert_eq!(stack.hub.occupancy(room.id).await, 2);
}
