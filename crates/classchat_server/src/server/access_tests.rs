#![forbid(unsafe_code)]

use classchat_domain::{PrivacyLevel, Role, RoomId};

use crate::server::access::{CreateRoomRequest, UpdateRoomRequest};
use crate::server::error::AccessError;
use crate::server::store::RoomStore;
use crate::server::test_support::TestStack;

fn request(privacy: PrivacyLevel, password: Option<&str>) -> CreateRoomRequest {
	CreateRoomRequest {
		name: "Chemistry".to_string(),
		description: Some("Lab questions".to_string()),
		privacy_level: privacy,
		password: password.map(str::to_owned),
		max_participants: None,
		recording_allowed: None,
		encryption_enabled: None,
	}
}

#[tokio::test]
async fn gated_rooms_admit_only_the_right_password() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let student = TestStack::identity("alice", Role::Student);

	for privacy in [PrivacyLevel::Private, PrivacyLevel::Restricted] {
		let room = stack.create_room(&owner, privacy, Some("P@ss1"), 10).await;

		let grant = stack.grant(&student, room.id, Some("P@ss1")).await.expect("right password");
		assert!(!grant.room_access_token.is_empty());
		assert_eq!(grant.room_details.id, room.id);
		assert!(!grant.moderator);

		for wrong in [Some("p@ss1"), Some("P@ss1 "), Some(""), None] {
			let err = stack.grant(&student, room.id, wrong).await.expect_err("wrong password");
			assert!(matches!(err, AccessError::JoinFailed), "{privacy}: {err:?}");
		}
	}
}

#[tokio::test]
async fn wrong_password_and_unknown_room_look_the_same() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let student = TestStack::identity("alice", Role::Student);
	let room = stack.create_room(&owner, PrivacyLevel::Private, Some("P@ss1"), 10).await;

	let wrong = stack.grant(&student, room.id, Some("nope")).await.expect_err("wrong");
	let missing = stack
		.grant(&student, RoomId::new_v4(), Some("nope"))
		.await
		.expect_err("missing");

	assert_eq!(wrong.status(), missing.status());
	assert_eq!(wrong.code(), missing.code());
	assert_eq!(wrong.to_string(), missing.to_string());
}

#[tokio::test]
async fn public_rooms_ignore_the_supplied_password() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let student = TestStack::identity("alice", Role::Student);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;

	for supplied in [None, Some(""), Some("anything")] {
		stack.grant(&student, room.id, supplied).await.expect("public join");
	}
}

#[tokio::test]
async fn creation_validates_fields() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);

	let mut long_name = request(PrivacyLevel::Public, None);
	long_name.name = "n".repeat(101);
	assert!(matches!(
		stack.access.create_room(&owner, long_name).await,
		Err(AccessError::Validation { field: "name", .. })
	));

	let mut blank = request(PrivacyLevel::Public, None);
	blank.name = "   ".to_string();
	assert!(matches!(
		stack.access.create_room(&owner, blank).await,
		Err(AccessError::Validation { field: "name", .. })
	));

	let mut long_description = request(PrivacyLevel::Public, None);
	long_description.description = Some("d".repeat(501));
	assert!(matches!(
		stack.access.create_room(&owner, long_description).await,
		Err(AccessError::Validation { field: "description", .. })
	));

	assert!(matches!(
		stack.access.create_room(&owner, request(PrivacyLevel::Private, None)).await,
		Err(AccessError::Validation { field: "password", .. })
	));
	assert!(matches!(
		stack.access.create_room(&owner, request(PrivacyLevel::Public, Some("secret"))).await,
		Err(AccessError::Validation { field: "password", .. })
	));

	let mut zero = request(PrivacyLevel::Public, None);
	zero.max_participants = Some(0);
	assert!(matches!(
		stack.access.create_room(&owner, zero).await,
		Err(AccessError::Validation { field: "maxParticipants", .. })
	));
}

#[tokio::test]
async fn created_room_has_defaults_and_hashed_password() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let details = stack
		.access
		.create_room(&owner, request(PrivacyLevel::Private, Some("P@ss1")))
		.await
		.expect("create");

	assert_eq!(details.max_participants, 50);
	assert_eq!(details.current_participants, 0);
	assert!(details.encryption_enabled);
	assert!(!details.recording_allowed);

	let stored = stack.rooms.get_room(details.id).await.expect("get").expect("exists");
	let hash = stored.password_hash.expect("gated room stores a hash");
	assert!(hash.starts_with("$argon2"));
	assert!(!hash.contains("P@ss1"));
	assert!(stored.active);
	assert_eq!(stored.generation, 0);
}

#[tokio::test]
async fn students_need_the_flag_to_create_rooms() {
	let stack = TestStack::new();
	let student = TestStack::identity("alice", Role::Student);
	assert!(matches!(
		stack.access.create_room(&student, request(PrivacyLevel::Public, None)).await,
		Err(AccessError::Forbidden)
	));
}

#[tokio::test]
async fn only_creator_moderator_or_admin_may_delete() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let student = TestStack::identity("alice", Role::Student);
	let admin = TestStack::identity("root", Role::Admin);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let room_key = room.id.to_string();

	assert!(matches!(
		stack.access.delete_room(&student, &room_key).await,
		Err(AccessError::Forbidden)
	));

	stack.access.delete_room(&admin, &room_key).await.expect("admin delete");
	assert!(matches!(
		stack.access.delete_room(&owner, &room_key).await,
		Err(AccessError::NotFound)
	));

	let stored = stack.rooms.get_room(room.id).await.expect("get").expect("soft deleted");
	assert!(!stored.active);
	assert_eq!(stored.generation, 1);

	assert!(matches!(
		stack.grant(&student, room.id, None).await,
		Err(AccessError::JoinFailed)
	));
}

#[tokio::test]
async fn granted_moderators_get_moderator_tokens_and_may_delete() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let helper = TestStack::identity("assistant", Role::Student);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let room_key = room.id.to_string();

	let before = stack.grant(&helper, room.id, None).await.expect("grant");
	assert!(!before.moderator);

	assert!(matches!(
		stack.access.grant_moderator(&helper, &room_key, "assistant").await,
		Err(AccessError::Forbidden)
	));
	stack
		.access
		.grant_moderator(&owner, &room_key, "assistant")
		.await
		.expect("grant moderator");

	let after = stack.grant(&helper, room.id, None).await.expect("grant");
	assert!(after.moderator);

	stack.access.delete_room(&helper, &room_key).await.expect("moderator delete");
	let actions: Vec<_> = stack.audit.recorded().iter().map(|r| r.action).collect();
	assert_eq!(actions, ["grant_moderator", "delete_room"]);
}

#[tokio::test]
async fn gated_room_details_are_hidden_from_strangers() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let stranger = TestStack::identity("mallory", Role::Student);
	let member = TestStack::identity("alice", Role::Student);
	let room = stack.create_room(&owner, PrivacyLevel::Private, Some("P@ss1"), 10).await;
	let room_key = room.id.to_string();

	assert!(matches!(
		stack.access.get_room(&stranger, &room_key).await,
		Err(AccessError::NotFound)
	));
	stack.access.get_room(&owner, &room_key).await.expect("creator sees it");

	stack.grant(&member, room.id, Some("P@ss1")).await.expect("join");
	let details = stack.access.get_room(&member, &room_key).await.expect("member sees it");
	assert_eq!(details.name, "Algebra");
}

#[tokio::test]
async fn listing_shows_only_active_public_rooms() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let public = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let closed = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	stack.create_room(&owner, PrivacyLevel::Private, Some("P@ss1"), 10).await;
	stack
		.access
		.delete_room(&owner, &closed.id.to_string())
		.await
		.expect("delete");

	let listed = stack.access.list_rooms().await.expect("list");
	assert_eq!(listed.len(), 1);
	assert_eq!(listed[0].id, public.id);
}

#[tokio::test]
async fn update_changes_fields_and_bumps_generation_on_credentials() {
	let stack = TestStack::new();
	let owner = TestStack::identity("teacher", Role::Teacher);
	let student = TestStack::identity("alice", Role::Student);
	let room = stack.create_room(&owner, PrivacyLevel::Public, None, 10).await;
	let room_key = room.id.to_string();

	assert!(matches!(
		stack
			.access
			.update_room(&student, &room_key, UpdateRoomRequest::default())
			.await,
		Err(AccessError::Forbidden)
	));

	let renamed = stack
		.access
		.update_room(
			&owner,
			&room_key,
			UpdateRoomRequest {
				name: Some("Geometry".to_string()),
				max_participants: Some(3),
				..UpdateRoomRequest::default()
			},
		)
		.await
		.expect("rename");
	assert_eq!(renamed.name, "Geometry");
	assert_eq!(renamed.max_participants, 3);
	assert_eq!(stack.rooms.get_room(room.id).await.expect("get").expect("room").generation, 0);

	assert!(matches!(
		stack
			.access
			.update_room(
				&owner,
				&room_key,
				UpdateRoomRequest {
					privacy_level: Some(PrivacyLevel::Private),
					..UpdateRoomRequest::default()
				},
			)
			.await,
		Err(AccessError::Validation { field: "password", .. })
	));

	stack
		.access
		.update_room(
			&owner,
			&room_key,
			UpdateRoomRequest {
				privacy_level: Some(PrivacyLevel::Private),
				password: Some("P@ss1".to_string()),
				..UpdateRoomRequest::default()
			},
		)
		.await
		.expect("gate the room");
	assert_eq!(stack.rooms.get_room(room.id).await.expect("get").expect("room").generation, 1);

	assert!(matches!(
		stack.grant(&student, room.id, None).await,
		Err(AccessError::JoinFailed)
	));
	stack.grant(&student, room.id, Some("P@ss1")).await.expect("new password");
}

#[tokio::test]
async fn malformed_room_ids_are_validation_errors() {
	let stack = TestStack::new();
	let student = TestStack::identity("alice", Role::Student);
	let err = stack
		.access
		.join_room(
			&student,
			crate::server::access::JoinRoomRequest {
				room_id: "not-a-uuid".to_string(),
				password: None,
			},
		)
		.await
		.expect_err("bad id");
	assert!(matches!(err, AccessError::Validation { field: "roomId", .. }));
}
