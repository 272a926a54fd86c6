use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use worklink_core::{
    CallId, ConnectionError, ErrorCode, Event, Frame, RpcError, RpcSession, SessionConfig,
    SessionError, SessionState, decode_payload, encode_payload,
};
use worklink_testkit::{FakeController, TEST_UUID, establish, init_tracing, running_session};

fn config() -> SessionConfig {
    SessionConfig::default()
}

#[tokio::test]
async fn responses_are_correlated_by_id_not_order() {
    init_tracing();
    let (session, controller, _run) = running_session(config()).await.unwrap();

    let first = session.invoke("echo", encode_payload("a").unwrap());
    let second = session.invoke("echo", encode_payload("b").unwrap());

    let req_a = controller.recv_request().await.unwrap();
    let req_b = controller.recv_request().await.unwrap();
    assert_eq!(req_a.call_id, CallId(1));
    assert_eq!(req_b.call_id, CallId(2));

    controller.reply(req_b.call_id, "reply-b").await.unwrap();
    controller.reply(req_a.call_id, "reply-a").await.unwrap();

    let a: String = decode_payload(&first.await.unwrap()).unwrap();
    let b: String = decode_payload(&second.await.unwrap()).unwrap();
    assert_eq!(a, "reply-a");
    assert_eq!(b, "reply-b");
    assert!(session.pending_call_ids().is_empty());
}

#[tokio::test]
async fn call_error_fails_only_its_own_call() {
    init_tracing();
    let (session, controller, _run) = running_session(config()).await.unwrap();

    let doomed = session.invoke("refresh_ticket", Vec::new());
    let fine = session.invoke("refresh_ticket", Vec::new());

    let req_doomed = controller.recv_request().await.unwrap();
    let req_fine = controller.recv_request().await.unwrap();
    controller
        .reply_error(req_doomed.call_id, ErrorCode::PermissionDenied, "bad ticket")
        .await
        .unwrap();
    controller.reply(req_fine.call_id, "t1").await.unwrap();

    match doomed.await {
        Err(RpcError::Call(err)) => {
            assert_eq!(err.code, ErrorCode::PermissionDenied);
            assert_eq!(err.message, "bad ticket");
        }
        other => panic!("expected call error, got {other:?}"),
    }
    assert!(fine.await.is_ok());
    assert!(matches!(session.state(), SessionState::Running));
}

#[tokio::test]
async fn response_for_unknown_id_is_dropped() {
    init_tracing();
    let (session, controller, _run) = running_session(config()).await.unwrap();

    controller.reply(CallId(999), "stray").await.unwrap();

    let pending = session.invoke("echo", Vec::new());
    let request = controller.recv_request().await.unwrap();
    controller.reply(request.call_id, "ok").await.unwrap();

    let reply: String = decode_payload(&pending.await.unwrap()).unwrap();
    assert_eq!(reply, "ok");
    assert!(matches!(session.state(), SessionState::Running));
}

#[tokio::test]
async fn peer_close_fails_every_pending_call() {
    init_tracing();
    let (session, controller, run) = running_session(config()).await.unwrap();

    let calls: Vec<_> = (0..3)
        .map(|_| session.invoke("refresh_ticket", Vec::new()))
        .collect();
    for _ in 0..3 {
        controller.recv_request().await.unwrap();
    }

    controller.close();

    for call in calls {
        assert!(matches!(
            call.await,
            Err(RpcError::Session(SessionError::PeerClosed))
        ));
    }
    assert!(matches!(run.await.unwrap(), Err(SessionError::PeerClosed)));
    assert!(matches!(
        session.state(),
        SessionState::Failed(SessionError::PeerClosed)
    ));
    assert!(session.pending_call_ids().is_empty());

    // Later calls fail immediately with the same error.
    assert!(matches!(
        session.invoke("refresh_ticket", Vec::new()).await,
        Err(RpcError::Session(SessionError::PeerClosed))
    ));
}

#[tokio::test]
async fn close_drains_pending_calls_and_stops_run() {
    init_tracing();
    let (session, controller, run) = running_session(config()).await.unwrap();

    let pending = session.invoke("refresh_ticket", Vec::new());
    controller.recv_request().await.unwrap();

    session.close();
    session.close();

    assert!(matches!(
        pending.await,
        Err(RpcError::Session(SessionError::Closed))
    ));
    assert!(run.await.unwrap().is_ok());
    assert!(matches!(session.state(), SessionState::Closed));
    assert!(matches!(
        session.invoke("refresh_ticket", Vec::new()).await,
        Err(RpcError::Session(SessionError::Closed))
    ));
}

#[tokio::test]
async fn terminate_closes_the_session_in_order() {
    init_tracing();
    let (session, controller, run) = running_session(config()).await.unwrap();

    let pending = session.invoke("refresh_ticket", Vec::new());
    controller.recv_request().await.unwrap();
    controller.terminate().await.unwrap();

    assert!(run.await.unwrap().is_ok());
    assert!(matches!(
        pending.await,
        Err(RpcError::Session(SessionError::Closed))
    ));
    assert!(matches!(session.state(), SessionState::Closed));
}

#[tokio::test(start_paused = true)]
async fn late_response_after_timeout_is_harmless() {
    init_tracing();
    let config = SessionConfig {
        call_timeout: Some(Duration::from_millis(50)),
        ..SessionConfig::default()
    };
    let (session, controller, _run) = running_session(config).await.unwrap();

    let caller = {
        let session = session.clone();
        tokio::spawn(async move { session.call::<_, String>("refresh_ticket", &("app", "t0")).await })
    };

    let request = controller.recv_request().await.unwrap();
    match caller.await.unwrap() {
        Err(err) => assert_eq!(err.code(), ErrorCode::DeadlineExceeded),
        Ok(reply) => panic!("expected timeout, got {reply:?}"),
    }
    assert!(session.pending_call_ids().is_empty());

    controller.reply(request.call_id, "too late").await.unwrap();

    let next = {
        let session = session.clone();
        tokio::spawn(async move { session.call::<_, String>("refresh_ticket", &("app", "t0")).await })
    };
    let request = controller.recv_request().await.unwrap();
    controller.reply(request.call_id, "t1").await.unwrap();
    assert_eq!(next.await.unwrap().unwrap(), "t1");
    assert!(matches!(session.state(), SessionState::Running));
}

#[tokio::test]
async fn pending_limit_refuses_new_calls() {
    init_tracing();
    let config = SessionConfig {
        max_pending: 2,
        ..SessionConfig::default()
    };
    let (session, _controller, _run) = running_session(config).await.unwrap();

    let _a = session.invoke("x", Vec::new());
    let _b = session.invoke("x", Vec::new());
    let refused = session.invoke("x", Vec::new());

    assert_eq!(refused.id(), None);
    match refused.await {
        Err(err) => assert_eq!(err.code(), ErrorCode::ResourceExhausted),
        Ok(_) => panic!("expected refusal"),
    }
    assert_eq!(session.pending_call_ids(), vec![CallId(1), CallId(2)]);
}

#[tokio::test]
async fn dropping_a_pending_call_removes_its_entry() {
    init_tracing();
    let (session, controller, _run) = running_session(config()).await.unwrap();

    let pending = session.invoke("refresh_ticket", Vec::new());
    let request = controller.recv_request().await.unwrap();
    assert_eq!(session.pending_call_ids(), vec![request.call_id]);

    drop(pending);
    assert!(session.pending_call_ids().is_empty());
}

#[tokio::test]
async fn calls_issued_before_run_are_sent_once_it_starts() {
    init_tracing();
    let (transport, controller) = FakeController::pair();
    let session = Arc::new(RpcSession::with_config(transport, config()));

    let early = session.invoke("refresh_ticket", Vec::new());
    assert!(matches!(session.state(), SessionState::Disconnected));

    establish(&session, &controller).await.unwrap();
    let _run = tokio::spawn(session.clone().run());

    let request = controller.recv_request().await.unwrap();
    assert_eq!(request.call_id, CallId(1));
    controller.reply(request.call_id, "t1").await.unwrap();
    assert!(early.await.is_ok());
}

#[tokio::test]
async fn run_before_handshake_is_refused_and_retryable() {
    init_tracing();
    let (transport, controller) = FakeController::pair();
    let session = Arc::new(RpcSession::with_config(transport, config()));

    let early = session.clone().run().await;
    assert!(matches!(early, Err(SessionError::NotEstablished)));
    assert!(matches!(session.state(), SessionState::Disconnected));

    // The acknowledgement still reaches handshake() rather than a reader loop.
    establish(&session, &controller).await.unwrap();
    let run = tokio::spawn(session.clone().run());

    let call = session.invoke("refresh_ticket", Vec::new());
    let request = controller.recv_request().await.unwrap();
    controller.reply(request.call_id, "t1").await.unwrap();
    assert!(call.await.is_ok());

    controller.terminate().await.unwrap();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn handshake_rejection_is_reported() {
    init_tracing();
    let (transport, controller) = FakeController::pair();
    let session = RpcSession::with_config(transport, config());

    let (worker, peer) = tokio::join!(
        session.handshake(TEST_UUID),
        controller.reject_handshake(ErrorCode::PermissionDenied, "unknown worker"),
    );
    assert_eq!(peer.unwrap(), TEST_UUID);
    match worker {
        Err(ConnectionError::Rejected { code, message }) => {
            assert_eq!(code, ErrorCode::PermissionDenied);
            assert_eq!(message, "unknown worker");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(matches!(
        session.state(),
        SessionState::Failed(SessionError::HandshakeFailed)
    ));
}

#[tokio::test]
async fn unexpected_first_frame_is_a_protocol_error() {
    init_tracing();
    let (transport, controller) = FakeController::pair();
    let session = RpcSession::with_config(transport, config());

    let rogue = async {
        controller.recv().await.unwrap();
        controller.send_event("invoke", Vec::new()).await.unwrap();
    };
    let (worker, ()) = tokio::join!(session.handshake(TEST_UUID), rogue);
    assert!(matches!(worker, Err(ConnectionError::Protocol(_))));
}

#[tokio::test]
async fn events_reach_the_registered_handler() {
    init_tracing();
    let (session, controller, _run) = running_session(config()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    session.dispatcher().on("invoke", move |event: Event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
        }
    });

    controller.send_event("ignored", b"x".to_vec()).await.unwrap();
    controller.send_event("invoke", b"payload".to_vec()).await.unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.name, "invoke");
    assert_eq!(event.payload, Bytes::from_static(b"payload"));
}

#[tokio::test]
async fn controller_calls_are_answered_unimplemented() {
    init_tracing();
    let (_session, controller, _run) = running_session(config()).await.unwrap();

    controller
        .send(Frame::request(77, "status", Vec::new()))
        .await
        .unwrap();
    let reply = controller.recv().await.unwrap();
    assert!(reply.is_response() && reply.is_error());
    assert_eq!(reply.channel_id(), 77);
    assert_eq!(
        worklink_core::parse_error_payload(reply.payload_bytes()).code,
        ErrorCode::Unimplemented
    );
}
