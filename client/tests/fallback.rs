use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use ringwire::collab::config::Settings;
use ringwire::collab::{DraftId, Ringwire, RunningServer, UserId};
use ringwire_client::http::ApiClient;
use ringwire_client::{Credentials, DraftView, Mode, RemoteTransport, Session, SessionConfig};

async fn start_server() -> RunningServer {
    let mut settings = Settings::default();
    settings.push.bind = "127.0.0.1:0".into();
    settings.api.bind = "127.0.0.1:0".into();
    settings.auth.allow_header_identity = true;
    Ringwire::new(settings).start().await.unwrap()
}

fn follow(
    server: &RunningServer,
    draft: &DraftId,
    user: &str,
    config: SessionConfig,
) -> (watch::Receiver<DraftView>, watch::Receiver<Mode>) {
    let transport = RemoteTransport::new(
        &format!("ws://{}", server.push_addr()),
        &format!("http://{}", server.api_addr()),
        draft.clone(),
        Credentials::user(user),
    );
    let session = Session::new(transport, config);
    let view = session.view();
    let mode = session.mode();
    tokio::spawn(session.run(CancellationToken::new()));
    (view, mode)
}

async fn wait_for(rx: &mut watch::Receiver<DraftView>, cond: impl Fn(&DraftView) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|v| cond(v)))
        .await
        .expect("view did not converge")
        .unwrap();
}

#[tokio::test]
async fn polling_client_converges_with_push_client() {
    let server = start_server().await;
    let alice = ApiClient::new(&format!("http://{}", server.api_addr()), Credentials::user("alice"));
    let bob = ApiClient::new(&format!("http://{}", server.api_addr()), Credentials::user("bob"));

    let draft = alice.create(Some("It was a dark night."), None).await.unwrap();
    alice
        .add_collaborator(&draft.id, &UserId::from("bob"), None)
        .await
        .unwrap();

    let (mut pushed, mut push_mode) = follow(&server, &draft.id, "alice", SessionConfig::default());
    let (mut polled, _) = follow(
        &server,
        &draft.id,
        "bob",
        SessionConfig {
            push_enabled: false,
            poll_interval: Duration::from_millis(50),
            ..SessionConfig::default()
        },
    );
    tokio::time::timeout(Duration::from_secs(5), push_mode.wait_for(|m| *m == Mode::Push))
        .await
        .unwrap()
        .unwrap();

    alice.append(&draft.id, "The wind howled.", Some("a-1")).await.unwrap();
    alice.pass(&draft.id, &UserId::from("bob"), Some("p-1")).await.unwrap();
    // retried pass is a replay, not a second pass
    alice.pass(&draft.id, &UserId::from("bob"), Some("p-1")).await.unwrap();
    bob.append(&draft.id, "Somewhere a door slammed.", None).await.unwrap();

    let done = |v: &DraftView| v.segment_count() == 3 && v.holder() == Some(&UserId::from("bob"));
    wait_for(&mut pushed, done).await;
    wait_for(&mut polled, done).await;

    let pushed = pushed.borrow().clone();
    let polled = polled.borrow().clone();
    assert_eq!(pushed.contents(), polled.contents());
    assert_eq!(
        pushed.contents(),
        vec!["It was a dark night.", "The wind howled.", "Somewhere a door slammed."]
    );
    assert_eq!(pushed.holder(), polled.holder());
    assert_eq!(pushed.ring_sequence(), Some(1));
    assert_eq!(polled.ring_sequence(), Some(1));

    server.shutdown().await;
}

#[tokio::test]
async fn rejected_push_falls_back_to_polling() {
    let mut settings = Settings::default();
    settings.push.bind = "127.0.0.1:0".into();
    settings.api.bind = "127.0.0.1:0".into();
    settings.auth.allow_header_identity = true;
    settings.limits.per_room = 1;
    let server = Ringwire::new(settings).start().await.unwrap();

    let alice = ApiClient::new(&format!("http://{}", server.api_addr()), Credentials::user("alice"));
    let draft = alice.create(None, None).await.unwrap();

    let (_first, mut first_mode) = follow(&server, &draft.id, "alice", SessionConfig::default());
    tokio::time::timeout(Duration::from_secs(5), first_mode.wait_for(|m| *m == Mode::Push))
        .await
        .unwrap()
        .unwrap();

    let (mut second, mut second_mode) = follow(
        &server,
        &draft.id,
        "alice",
        SessionConfig {
            max_reconnect_attempts: 0,
            poll_interval: Duration::from_millis(50),
            ..SessionConfig::default()
        },
    );
    tokio::time::timeout(Duration::from_secs(5), second_mode.wait_for(|m| *m == Mode::Polling))
        .await
        .unwrap()
        .unwrap();

    alice.append(&draft.id, "first line", None).await.unwrap();
    wait_for(&mut second, |v| v.contents() == vec!["first line"]).await;

    server.shutdown().await;
}
