use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use worklink::{Event, Options, Token, Worker, WorkerError};
use worklink_core::{ErrorCode, MemTransport, RpcSession, SessionConfig, SessionError};
use worklink_testkit::{
    FakeController, TEST_UUID, TicketReply, TicketService, establish, init_tracing,
};

fn options(token_type: &str) -> Options {
    Options {
        app: "echo".into(),
        uuid: TEST_UUID.into(),
        endpoint: "/run/worklink.sock".into(),
        locator: "127.0.0.1:10053".into(),
        protocol: 0,
        token_type: token_type.into(),
        token_body: "very_secret".into(),
        tokens_service: "tvm".into(),
        refresh_interval_secs: 15,
    }
}

async fn attached_worker(token_type: &str) -> (Arc<Worker<MemTransport>>, FakeController) {
    let (transport, controller) = FakeController::pair();
    let session = Arc::new(RpcSession::with_config(transport, SessionConfig::default()));
    establish(&session, &controller).await.unwrap();
    let worker = Worker::with_session(options(token_type), session);
    (Arc::new(worker), controller)
}

fn serve(worker: &Arc<Worker<MemTransport>>) -> tokio::task::JoinHandle<Result<(), WorkerError>> {
    let worker = worker.clone();
    tokio::spawn(async move { worker.run().await })
}

#[tokio::test]
async fn events_reach_handlers_until_terminate() {
    init_tracing();
    let (worker, controller) = attached_worker("OAUTH").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pings = tx.clone();
    worker.on("ping", move |event: Event| {
        let pings = pings.clone();
        async move {
            let _ = pings.send(format!("ping:{}", String::from_utf8_lossy(&event.payload)));
        }
    });
    worker.fallback(move |event: Event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(format!("other:{}", event.name));
        }
    });
    let run = serve(&worker);

    controller
        .send_event("ping", Bytes::from_static(b"hi"))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), "ping:hi");

    controller.send_event("reload", Bytes::new()).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), "other:reload");

    controller.terminate().await.unwrap();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn controller_crash_fails_the_worker() {
    init_tracing();
    let (worker, controller) = attached_worker("TVM").await;
    let run = serve(&worker);

    controller.close();
    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, WorkerError::Session(SessionError::PeerClosed)));
    assert_eq!(err.exit_code(), 1);

    let task = worker.token_manager().refresh_task().unwrap();
    assert!(task.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn token_is_renewed_over_the_controller_session() {
    init_tracing();
    let (worker, controller) = attached_worker("TVM").await;
    let service = TicketService::numbered(controller.clone());
    let run = serve(&worker);

    assert_eq!(worker.token(), Token::new("TVM", "very_secret"));
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(worker.token(), Token::new("TVM", "t1"));

    let request = &service.stats().requests()[0];
    assert_eq!((request.app.as_str(), request.body.as_str()), ("echo", "very_secret"));

    controller.terminate().await.unwrap();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn failing_tokens_service_does_not_stop_the_worker() {
    init_tracing();
    let (worker, controller) = attached_worker("TVM").await;
    let service = TicketService::spawn(controller.clone(), |_, _| {
        TicketReply::Fail(ErrorCode::Unavailable, "tickets offline".into())
    });
    let run = serve(&worker);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(service.stats().count(), 4);
    assert!(!run.is_finished());
    assert_eq!(worker.token().body(), "very_secret");

    controller.terminate().await.unwrap();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn second_run_is_refused_and_renewal_continues() {
    init_tracing();
    let (worker, controller) = attached_worker("TVM").await;
    let service = TicketService::numbered(controller.clone());
    let run = serve(&worker);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let again = worker.run().await;
    assert!(matches!(again, Err(WorkerError::AlreadyRunning)));

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(!run.is_finished());
    assert_eq!(service.stats().count(), 1);
    assert_eq!(worker.token(), Token::new("TVM", "t1"));
    let task = worker.token_manager().refresh_task().unwrap();
    assert!(!task.is_cancelled());

    controller.terminate().await.unwrap();
    assert!(run.await.unwrap().is_ok());
}
