mod support;

use sandterm::*;
use support::*;

async fn record(h: &Harness, sid: &str) -> SessionRecord {
    h.store.find(sid).await.unwrap().expect("record")
}

#[tokio::test]
async fn int_vanished_container_is_recreated_on_connect() {
    let h = harness(SessionSettings::default());
    let (sid, old) = start(&h, "p1", "alice").await;
    h.runtime.vanish(&old);

    let (att, mut rx) = connect(&h, "alice", &sid).await;
    let _att = att.expect("reconnect after container loss");
    assert_eq!(
        next_event(&mut rx).await,
        Some(Outbound::Event(ServerEvent::connected()))
    );

    let rec = record(&h, &sid).await;
    assert_ne!(rec.container_id, old);
    assert!(rec.is_active());
    assert!(h.runtime.is_running(&rec.container_id));
    assert_eq!(FakeRuntime::count(&h.runtime.creates), 2);
}

#[tokio::test]
async fn int_stopped_container_is_replaced_and_removed() {
    let h = harness(SessionSettings::default());
    let (sid, old) = start(&h, "p1", "alice").await;
    h.runtime.kill(&old);

    let new = h.orch.lifecycle().resolve_container(&sid).await.unwrap();
    assert_ne!(new.id, old);
    assert!(!h.runtime.exists(&old));
    let rec = record(&h, &sid).await;
    assert_eq!(rec.id, sid);
    assert_eq!(rec.container_id, new.id);
    assert_eq!(rec.status, SessionStatus::Active);
}

#[tokio::test]
async fn int_running_container_is_reused() {
    let h = harness(SessionSettings::default());
    let (sid, cid) = start(&h, "p1", "alice").await;
    let got = h.orch.lifecycle().resolve_container(&sid).await.unwrap();
    assert_eq!(got.id, cid);
    assert_eq!(FakeRuntime::count(&h.runtime.creates), 1);
}

#[tokio::test]
async fn int_resolve_refuses_terminated_sessions() {
    let h = harness(SessionSettings::default());
    let (sid, _) = start(&h, "p1", "alice").await;
    h.orch.lifecycle().terminate(&sid).await.unwrap();
    let err = h.orch.lifecycle().resolve_container(&sid).await.unwrap_err();
    assert!(matches!(err, SessionError::NotActive));
    assert_eq!(FakeRuntime::count(&h.runtime.creates), 1);
}

#[tokio::test]
async fn int_start_reuses_active_session_per_pair() {
    let h = harness(SessionSettings::default());
    let who = admin("alice");
    let a = h.orch.start_session(&who, "p1").await.unwrap();
    let b = h.orch.start_session(&who, "p1").await.unwrap();
    assert!(!a.reused);
    assert!(b.reused);
    assert_eq!(a.session_id, b.session_id);

    let other = h.orch.start_session(&admin("bob"), "p1").await.unwrap();
    assert_ne!(other.session_id, a.session_id);
    assert_eq!(FakeRuntime::count(&h.runtime.creates), 2);
}

#[tokio::test]
async fn int_concurrent_starts_create_one_container() {
    let h = harness(SessionSettings::default());
    let who = admin("alice");
    let (a, b) = tokio::join!(
        h.orch.start_session(&who, "p1"),
        h.orch.start_session(&who, "p1")
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.session_id, b.session_id);
    assert_eq!(FakeRuntime::count(&h.runtime.creates), 1);
    assert_eq!(h.store.list_active_for("alice").await.unwrap().len(), 1);
}

#[tokio::test]
async fn int_start_requires_admin_and_valid_project() {
    let h = harness(SessionSettings::default());
    let student = Principal {
        operator_id: "sam".into(),
        role: Role::Student,
    };
    let err = h.orch.start_session(&student, "p1").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::AuthFailure(AuthFailure::InsufficientPrivilege)
    ));

    let err = h
        .orch
        .start_session(&admin("alice"), "../p1")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::BadRequest(_)));
    assert_eq!(FakeRuntime::count(&h.runtime.creates), 0);
}

#[tokio::test]
async fn int_unreachable_runtime_fails_fast() {
    let h = harness(SessionSettings::default());
    h.runtime.set_ping_down(true);
    let err = h
        .orch
        .start_session(&admin("alice"), "p1")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::RuntimeUnavailable(_)));
    assert_eq!(exit_code_for_error(&err), 127);
    assert_eq!(FakeRuntime::count(&h.runtime.creates), 0);
    assert_eq!(
        h.projects.calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn int_terminate_is_idempotent_without_runtime_calls() {
    let h = harness(SessionSettings::default());
    let (sid, cid) = start(&h, "p1", "alice").await;
    let lc = h.orch.lifecycle();
    let (a, b) = tokio::join!(lc.terminate(&sid), lc.terminate(&sid));
    let mut got = vec![a.unwrap(), b.unwrap()];
    got.sort_by_key(|t| t.message());
    assert_eq!(got, vec![Termination::AlreadyTerminated, Termination::Terminated]);
    assert_eq!(FakeRuntime::count(&h.runtime.removes), 1);
    assert_eq!(FakeRuntime::count(&h.runtime.stops), 1);
    assert!(!h.runtime.exists(&cid));

    assert_eq!(
        lc.terminate(&sid).await.unwrap().message(),
        "Session already terminated"
    );
    assert!(matches!(
        lc.terminate("missing").await,
        Err(SessionError::NotFound)
    ));
}

#[tokio::test]
async fn int_terminate_tolerates_missing_container() {
    let h = harness(SessionSettings::default());
    let (sid, cid) = start(&h, "p1", "alice").await;
    h.runtime.vanish(&cid);
    assert_eq!(
        h.orch.lifecycle().terminate(&sid).await.unwrap(),
        Termination::Terminated
    );
    let rec = record(&h, &sid).await;
    assert_eq!(rec.status, SessionStatus::Terminated);
    assert!(rec.end_time.is_some());
}

#[tokio::test]
async fn int_container_spec_carries_sandbox_limits() {
    let h = harness(SessionSettings::default());
    let (sid, cid) = start(&h, "p1", "alice").await;
    let spec = h.runtime.spec_of(&cid).expect("spec");
    assert_eq!(spec.image, SandboxConfig::default().image);
    assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);
    assert_eq!(spec.memory_swap_bytes, 1024 * 1024 * 1024);
    assert_eq!(spec.cpuset_cpus, "0");
    assert_eq!(spec.network_mode, "bridge");
    assert_eq!(spec.mount_point, "/app");
    assert_eq!(spec.working_dir, "/app");
    assert!(spec.bind_source.ends_with("p1"));
    assert!(spec
        .security_opt
        .iter()
        .any(|o| o == "no-new-privileges:true"));
    assert!(spec.env.iter().any(|e| e == "TERM=xterm"));
    assert_eq!(spec.labels.get("sandterm.session"), Some(&sid));
    assert_eq!(
        spec.labels.get("sandterm.project").map(String::as_str),
        Some("p1")
    );
}
