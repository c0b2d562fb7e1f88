mod common;

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::*;
use tss_core::coordinator::Registration;
use tss_core::transport::memory::Method;
use tss_core::{
    join_code, open_key_share, Chain, CoordinatorClient, Error, JoinCodeEncoding, JoinCodeOptions, MemoryCoordinator, Network,
    Role, RoundEvent,
};

#[tokio::test]
async fn test_keygen_2_of_3_end_to_end() {
    let memory = Arc::new(MemoryCoordinator::new());
    let sessions = joined_keygen(&memory, 2, 3).await;
    let events = complete_all(sessions.iter().map(|s| s.subscribe(fast()).unwrap())).await;

    for party_events in &events {
        let order: Vec<_> = names(party_events)
            .into_iter()
            .filter(|e| e.starts_with("submitted") || e == "artifact" || e == "complete")
            .collect();
        assert_eq!(order, ["submitted1", "submitted2", "submitted3", "artifact", "complete"]);
    }

    let key_chains: Vec<_> = sessions.iter().map(|s| s.key_chain().unwrap()).collect();
    let common = &key_chains[0].common_key_chain;
    assert!(key_chains.iter().all(|k| &k.common_key_chain == common));
    assert_ne!(key_chains[0].private_key_share, key_chains[1].private_key_share);

    let id = sessions[0].id().unwrap();
    assert_eq!(memory.public_key(&id).as_deref(), Some(common.as_str()));

    let shares = memory.key_shares(&id);
    assert_eq!(shares.len(), 3);
    for (party_id, sealed) in shares {
        let sealed = STANDARD.decode(sealed).unwrap();
        let opened = open_key_share(&party(party_id), Chain::Btc, Network::Livenet, &sealed).unwrap();
        assert_eq!(opened, key_chains[party_id]);

        // nobody else can open it
        let other = party((party_id + 1) % 3);
        assert!(matches!(
            open_key_share(&other, Chain::Btc, Network::Livenet, &sealed),
            Err(Error::Decryption(_))
        ));
    }

    let key = sessions[1].tss_key().unwrap();
    assert_eq!(key.metadata.party_id, 1);
    assert_eq!((key.metadata.m, key.metadata.n), (2, 3));
    assert!(key.xpub(Network::Livenet).unwrap().starts_with("xpub"));
}

#[tokio::test]
async fn test_completed_session_cannot_be_exported() {
    let memory = Arc::new(MemoryCoordinator::new());
    let sessions = joined_keygen(&memory, 2, 2).await;
    complete_all(sessions.iter().map(|s| s.subscribe(fast()).unwrap())).await;

    for session in &sessions {
        assert!(session.is_complete());
        let err = session.export_session().unwrap_err();
        assert!(matches!(err, Error::SessionCompleted));
        assert_eq!(err.to_string(), "Cannot export a completed session");
    }
}

#[tokio::test]
async fn test_restarted_keygen_reuses_id() {
    let memory = Arc::new(MemoryCoordinator::new());
    let mut first = keygen(&memory, 0);
    first.new_key(2, 3, None).await.unwrap();

    let mut again = keygen(&memory, 0);
    let err = again.new_key(2, 3, None).await.unwrap_err();
    assert!(matches!(err, Error::RoundAlreadyDone));
    assert!(err.to_string().contains("TSS_ROUND_ALREADY_DONE"));
}

#[tokio::test]
async fn test_tampered_join_code_fails_before_any_request() {
    let memory = Arc::new(MemoryCoordinator::new());
    let mut initiator = keygen(&memory, 0);
    initiator.new_key(2, 2, None).await.unwrap();
    let code = initiator
        .create_join_code(1, &party(1).auth_public_key(), None, &Default::default())
        .unwrap();

    let mut tampered = code.into_bytes();
    let last = tampered.len() - 1;
    tampered[last] = if tampered[last] == b'0' { b'1' } else { b'0' };
    let tampered = String::from_utf8(tampered).unwrap();

    let before = memory.requests().len();
    let mut joiner = keygen(&memory, 1);
    let err = joiner
        .join_key(&tampered, None, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidChecksum));
    assert_eq!(memory.requests().len(), before);
    assert!(joiner.id().is_none());
}

#[tokio::test]
async fn test_code_for_another_party_is_rejected() {
    let memory = Arc::new(MemoryCoordinator::new());
    let mut initiator = keygen(&memory, 0);
    initiator.new_key(2, 3, None).await.unwrap();
    let code = initiator
        .create_join_code(1, &party(1).auth_public_key(), None, &Default::default())
        .unwrap();

    let mut wrong = keygen(&memory, 2);
    assert!(matches!(
        wrong.join_key(&code, None, &Default::default()).await,
        Err(Error::InvalidChecksum)
    ));
}

#[tokio::test]
async fn test_missing_password_leaves_slot_empty() {
    let memory = Arc::new(MemoryCoordinator::new());
    let mut initiator = keygen(&memory, 0);
    initiator.new_key(2, 2, Some(PASSWORD)).await.unwrap();
    let id = initiator.id().unwrap();

    let opts = JoinCodeOptions {
        encoding: JoinCodeEncoding::Base64,
    };
    let code = initiator
        .create_join_code(1, &party(1).auth_public_key(), None, &opts)
        .unwrap();

    let mut joiner = keygen(&memory, 1);
    let err = joiner.join_key(&code, None, &opts).await.unwrap_err();
    assert!(matches!(err, Error::InvalidPassword));
    assert_eq!(memory.participants(Role::KeyGen, &id).unwrap()[1], None);

    let mut wrong = keygen(&memory, 1);
    assert!(matches!(
        wrong.join_key(&code, Some("nope"), &opts).await,
        Err(Error::InvalidPassword)
    ));

    let mut joiner = keygen(&memory, 1);
    joiner.join_key(&code, Some(PASSWORD), &opts).await.unwrap();
    assert!(memory.participants(Role::KeyGen, &id).unwrap()[1].is_some());
}

#[tokio::test]
async fn test_join_without_invitation_is_refused() {
    let memory = Arc::new(MemoryCoordinator::new());
    let mut initiator = keygen(&memory, 0);
    initiator.new_key(2, 3, Some(PASSWORD)).await.unwrap();
    let id = initiator.id().unwrap();
    let client = CoordinatorClient::new(memory.clone());
    let outsider = party(2).participant_id();

    // knowing the id and password is not enough to take a slot
    let mut registration = Registration {
        id: &id,
        m: 2,
        n: 3,
        party_id: 2,
        participant: &outsider,
        message: b"round zero",
        password: Some(PASSWORD),
        invite_key: None,
        invitation: None,
    };
    assert!(matches!(
        client.join_keygen(&registration).await,
        Err(Error::InvalidChecksum)
    ));

    // the invitation of party 1 does not open slot 2
    let for_party_1 = join_code::sign_invitation(party(0).auth_secret_key(), &id, 1);
    registration.invitation = Some(&for_party_1);
    assert!(matches!(
        client.join_keygen(&registration).await,
        Err(Error::InvalidChecksum)
    ));

    let self_signed = join_code::sign_invitation(party(2).auth_secret_key(), &id, 2);
    registration.invitation = Some(&self_signed);
    assert!(matches!(
        client.join_keygen(&registration).await,
        Err(Error::InvalidChecksum)
    ));
    assert_eq!(memory.participants(Role::KeyGen, &id).unwrap()[2], None);

    // only the initiator mints codes
    let code = initiator
        .create_join_code(1, &party(1).auth_public_key(), None, &Default::default())
        .unwrap();
    let mut joiner = keygen(&memory, 1);
    joiner.join_key(&code, Some(PASSWORD), &Default::default()).await.unwrap();
    assert!(matches!(
        joiner.create_join_code(2, &party(2).auth_public_key(), None, &Default::default()),
        Err(Error::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_check_join_code_reports_invitation() {
    let memory = Arc::new(MemoryCoordinator::new());
    let mut initiator = keygen(&memory, 0);
    initiator.new_key(2, 3, None).await.unwrap();
    let code = initiator
        .create_join_code(2, &party(2).auth_public_key(), Some("extra".into()), &Default::default())
        .unwrap();

    let payload = keygen(&memory, 2)
        .check_join_code(&code, &Default::default())
        .unwrap();
    assert_eq!(payload.id, initiator.id().unwrap());
    assert_eq!(payload.party_id, 2);
    assert_eq!((payload.m, payload.n), (2, 3));
    assert_eq!(payload.extra.as_deref(), Some("extra"));
}

#[tokio::test]
async fn test_export_restore_continues_with_same_key() {
    // uninterrupted reference run
    let reference_memory = Arc::new(MemoryCoordinator::new());
    let reference = generate_keys(&reference_memory, 2, 3).await;

    let memory = Arc::new(MemoryCoordinator::new());
    let sessions = joined_keygen(&memory, 2, 3).await;
    let mut steps: Vec<_> = sessions
        .iter()
        .map(|s| s.subscribe(single_step()).unwrap())
        .collect();
    for step in steps.iter_mut() {
        let events = names(&drain(step).await);
        assert_eq!(events, ["ready1", "processed1", "submitted1"]);
    }

    let exports: Vec<_> = sessions.iter().map(|s| s.export_session().unwrap()).collect();
    drop(sessions);

    let mut restored = Vec::new();
    for (index, exported) in exports.iter().enumerate() {
        let mut session = keygen(&memory, index);
        session.restore_session(exported).await.unwrap();
        let value = session.session().unwrap();
        assert_eq!(value.round(), 2);
        assert!(value.participants().iter().all(|p| p.is_some()));
        restored.push(session);
    }
    complete_all(restored.iter().map(|s| s.subscribe(fast()).unwrap())).await;

    for (session, expected) in restored.iter().zip(&reference) {
        assert_eq!(session.key_chain().unwrap(), expected.keychain);
    }
}

#[tokio::test]
async fn test_restore_checks_coordinator() {
    let memory = Arc::new(MemoryCoordinator::new());
    let sessions = joined_keygen(&memory, 2, 2).await;
    let exported = sessions[1].export_session().unwrap();

    // another party cannot resume it
    let mut impostor = keygen(&memory, 0);
    assert!(matches!(
        impostor.restore_session(&exported).await,
        Err(Error::InvalidPartyId(1))
    ));

    // nor can it resume against a coordinator that never saw it
    let mut elsewhere = keygen(&Arc::new(MemoryCoordinator::new()), 1);
    assert!(matches!(
        elsewhere.restore_session(&exported).await,
        Err(Error::SessionNotFound(_))
    ));

    let mut garbage = keygen(&memory, 1);
    assert!(matches!(
        garbage.restore_session("%%%").await,
        Err(Error::Deserialization(_))
    ));
}

#[tokio::test]
async fn test_round_2_fault_is_recovered() {
    let reference_memory = Arc::new(MemoryCoordinator::new());
    let reference = generate_keys(&reference_memory, 2, 3).await;

    let memory = Arc::new(MemoryCoordinator::new());
    let sessions = joined_keygen(&memory, 2, 3).await;
    let id = sessions[0].id().unwrap();
    memory.fail_posts(format!("/v1/tss/keygen/{id}/2"), 1);

    let events = complete_all(sessions.iter().map(|s| s.subscribe(fast()).unwrap())).await;

    let errors: usize = events
        .iter()
        .flatten()
        .filter(|e| matches!(e, RoundEvent::Error(Error::Transport(_))))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(sessions.iter().map(|s| s.recoveries()).sum::<usize>(), 1);

    for (session, expected) in sessions.iter().zip(&reference) {
        assert_eq!(session.key_chain().unwrap(), expected.keychain);
    }

    let round_2_posts = memory
        .requests()
        .into_iter()
        .filter(|r| r.method == Method::Post && r.path.ends_with(&format!("{id}/2")))
        .count();
    assert_eq!(round_2_posts, 4);
}

#[tokio::test]
async fn test_lost_round_reply_does_not_stall_keygen() {
    let reference_memory = Arc::new(MemoryCoordinator::new());
    let reference = generate_keys(&reference_memory, 2, 2).await;

    let memory = Arc::new(MemoryCoordinator::new());
    let mut initiator = keygen(&memory, 0);
    initiator.new_key(2, 2, Some(PASSWORD)).await.unwrap();
    let id = initiator.id().unwrap();
    let code = initiator
        .create_join_code(1, &party(1).auth_public_key(), None, &Default::default())
        .unwrap();

    // party 1's round 2 message lands but its reply never arrives
    let lossy = LostReplies::new(&memory, format!("/v1/tss/keygen/{id}/2"), 1);
    let mut joiner = keygen_with(lossy, 1);
    joiner.join_key(&code, Some(PASSWORD), &Default::default()).await.unwrap();
    let sessions = [initiator, joiner];

    let events = complete_all(sessions.iter().map(|s| s.subscribe(fast()).unwrap())).await;
    let errors: Vec<_> = events
        .iter()
        .flatten()
        .filter_map(|e| match e {
            RoundEvent::Error(err) => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::Transport(_)));
    assert_eq!(sessions[1].recoveries(), 1);
    assert!(names(&events[1]).contains(&"submitted2".to_string()));

    for (session, expected) in sessions.iter().zip(&reference) {
        assert_eq!(session.key_chain().unwrap(), expected.keychain);
    }

    let round_2_posts = memory
        .requests()
        .into_iter()
        .filter(|r| r.method == Method::Post && r.path.ends_with(&format!("{id}/2")))
        .count();
    assert_eq!(round_2_posts, 2);
}

#[tokio::test]
async fn test_duplicate_round_after_restore_is_rejected() {
    let memory = Arc::new(MemoryCoordinator::new());
    let sessions = joined_keygen(&memory, 2, 2).await;

    let stale = sessions[0].export_session().unwrap();
    let mut steps: Vec<_> = sessions
        .iter()
        .map(|s| s.subscribe(single_step()).unwrap())
        .collect();
    for step in steps.iter_mut() {
        drain(step).await;
    }

    let mut replay = keygen(&memory, 0);
    replay.restore_session(&stale).await.unwrap();
    let mut subscription = replay.subscribe(single_step()).unwrap();
    let events = drain(&mut subscription).await;

    let order = names(&events);
    assert_eq!(&order[..2], ["ready1", "processed1"]);
    assert!(matches!(events[2], RoundEvent::Error(Error::RoundAlreadyDone)));
    assert_eq!(events.len(), 3);
    assert_eq!(memory.round_messages(Role::KeyGen, &replay.id().unwrap(), 1).len(), 2);
}
