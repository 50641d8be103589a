mod support;

use sandterm::*;
use support::*;

async fn rejected_with(
    h: &Harness,
    credential: Option<&str>,
    session_id: Option<&str>,
) -> (SessionError, String) {
    let (client, mut rx) = h.orch.client_channel();
    let err = h
        .orch
        .connect(
            ConnectRequest {
                credential,
                session_id,
            },
            client,
        )
        .await
        .err()
        .expect("connection should be refused");
    let msg = match next_event(&mut rx).await {
        Some(Outbound::Event(ServerEvent::Error { message })) => message,
        other => panic!("expected error event, got {other:?}"),
    };
    assert_eq!(next_event(&mut rx).await, Some(Outbound::Close));
    (err, msg)
}

#[tokio::test]
async fn int_rejections_carry_distinct_messages() {
    let h = harness(SessionSettings::default());
    let (sid, _) = start(&h, "p1", "alice").await;
    let alice = admin_token("alice");
    let bob = admin_token("bob");
    let student = token_for("alice", Role::Student);

    let (e, m) = rejected_with(&h, None, Some(&sid)).await;
    assert!(matches!(e, SessionError::AuthFailure(AuthFailure::MissingCredential)));
    assert_eq!(m, "Authentication error: Token missing");

    let (_, m) = rejected_with(&h, Some("garbage"), Some(&sid)).await;
    assert_eq!(m, "Authentication error: Invalid token");

    let (_, m) = rejected_with(&h, Some(&student), Some(&sid)).await;
    assert_eq!(m, "Authorization error: Admin access required");

    let (_, m) = rejected_with(&h, Some(&alice), None).await;
    assert_eq!(m, "Session ID is required");

    let (e, m) = rejected_with(&h, Some(&alice), Some("no-such-session")).await;
    assert!(matches!(e, SessionError::NotFound));
    assert_eq!(m, "Terminal session not found");

    let (e, m) = rejected_with(&h, Some(&bob), Some(&sid)).await;
    assert!(matches!(e, SessionError::Forbidden));
    assert_eq!(m, "Not authorized for this session");

    // no container work for any refused connection
    assert_eq!(FakeRuntime::count(&h.runtime.attaches), 0);
    assert!(h.orch.registry().is_empty());
}

#[tokio::test]
async fn int_terminated_session_is_not_active() {
    let h = harness(SessionSettings::default());
    let (sid, _) = start(&h, "p1", "alice").await;
    h.orch
        .terminate_session(&admin("alice"), &sid)
        .await
        .unwrap();
    let tok = admin_token("alice");
    let (e, m) = rejected_with(&h, Some(&tok), Some(&sid)).await;
    assert!(matches!(e, SessionError::NotActive));
    assert_eq!(m, "Terminal session is not active");
}

#[tokio::test]
async fn int_path_like_session_ids_are_not_found() {
    let h = harness(SessionSettings::default());
    let tok = admin_token("alice");
    let (e, _) = rejected_with(&h, Some(&tok), Some("../../etc/passwd")).await;
    assert!(matches!(e, SessionError::NotFound));
}

#[tokio::test]
async fn int_gatekeeper_admits_owner() {
    let h = harness(SessionSettings::default());
    let (sid, _) = start(&h, "p1", "alice").await;
    let gk = Gatekeeper::new(
        std::sync::Arc::new(JwtVerifier::new(SECRET)),
        h.store.clone(),
    );
    let tok = admin_token("alice");
    let adm = gk
        .admit(ConnectRequest {
            credential: Some(&tok),
            session_id: Some(&sid),
        })
        .await
        .expect("owner admitted");
    assert_eq!(adm.principal.operator_id, "alice");
    assert_eq!(adm.record.id, sid);
}
