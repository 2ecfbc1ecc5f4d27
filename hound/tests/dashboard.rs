//! Streaming-session tests against a scripted in-process dashboard.

mod helpers;

use helpers::{drain_frames, spawn_dashboard, DashboardScript};
use githound::session::{Session, SessionConfig};
use githound::types::Finding;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn test_finding() -> Finding {
    Finding {
        repo: "acme/infra".into(),
        file: "config/app.yml".into(),
        context: "key: AKIA1234567890ABCDEF".into(),
        match_text: "AKIA1234567890ABCDEF".into(),
        attributes: vec!["aws-access-key-id".into()],
        file_last_updated: String::new(),
        file_last_author: String::new(),
        url: "https://github.com/acme/infra/blob/x/config/app.yml".into(),
    }
}

fn session_config(url: &str) -> SessionConfig {
    let mut config = SessionConfig::new(url.to_string(), Some("tok-123".into()), None);
    config.reconnect_base = Duration::from_millis(50);
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn token_auth_registers_and_streams_results() {
    let mut dash = spawn_dashboard(DashboardScript::default()).await;

    let session = Session::start(session_config(&dash.url)).await.expect("session up");
    let search_id = session.register_search("corp.example.com").await;
    assert_eq!(search_id.as_deref(), Some("search-0001"));

    session.send_result(&test_finding(), "corp.example.com");
    session.shutdown().await;

    let frames = drain_frames(&mut dash).await;
    let banner = &frames[0];
    assert_eq!(banner["event"], "gh_banner");
    assert_eq!(banner["insertToken"], "tok-123");

    let start = frames.iter().find(|f| f["event"] == "start_search").expect("start_search sent");
    assert_eq!(start["searchQuery"], "corp.example.com");
    assert_eq!(start["insertToken"], "tok-123");

    let result = frames.iter().find(|f| f["event"] == "search_result").expect("result sent");
    assert_eq!(result["insertToken"], "tok-123");
    assert_eq!(result["searchID"], "search-0001");
    assert_eq!(result["search_term"], "corp.example.com");
    assert_eq!(result["result"]["match"], "AKIA1234567890ABCDEF");
    assert_eq!(result["result"]["repo"], "acme/infra");
}

#[tokio::test(flavor = "multi_thread")]
async fn account_link_flow_learns_and_persists_the_token() {
    // Point HOME at a scratch dir so the learned token lands there. The other
    // tests in this binary never consult HOME.
    let home = tempfile::tempdir().unwrap();
    std::env::set_var("HOME", home.path());

    let mut dash = spawn_dashboard(DashboardScript {
        link_token: Some("tok-linked"),
        ..Default::default()
    })
    .await;

    let mut config = SessionConfig::new(dash.url.clone(), None, None);
    config.reconnect_base = Duration::from_millis(50);
    let session = Session::start(config).await.expect("link flow completes");

    // The token the server handed over is persisted for the next run.
    let token_file = home.path().join(".githound/insert_token.txt");
    let stored = std::fs::read_to_string(&token_file).expect("token file written");
    assert_eq!(stored, "tok-linked");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&token_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // And the session is live: frames now carry the learned token.
    let search_id = session.register_search("corp.example.com").await;
    assert_eq!(search_id.as_deref(), Some("search-0001"));
    let frames = drain_frames(&mut dash).await;
    let start = frames.iter().find(|f| f["event"] == "start_search").expect("registered");
    assert_eq!(start["insertToken"], "tok-linked");

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pings_are_answered_with_pongs() {
    let mut dash = spawn_dashboard(DashboardScript { ping_after_auth: true, ..Default::default() }).await;

    let session = Session::start(session_config(&dash.url)).await.expect("session up");
    // Give the manager a beat to read the ping and answer.
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.shutdown().await;

    let frames = drain_frames(&mut dash).await;
    assert!(frames.iter().any(|f| f["event"] == "pong"), "expected a pong frame: {frames:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_connection_reconnects_and_resends() {
    let mut dash =
        spawn_dashboard(DashboardScript { drop_after_ack: true, ..Default::default() }).await;

    let session = Session::start(session_config(&dash.url)).await.expect("session up");
    let search_id = session.register_search("corp.example.com").await;
    assert_eq!(search_id.as_deref(), Some("search-0001"));

    // The server hard-dropped after the ack. Let the client notice before the
    // finding is queued, then confirm it arrives over the second connection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.send_result(&test_finding(), "corp.example.com");

    let mut result_frame = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames = drain_frames(&mut dash).await;
        if let Some(frame) = frames.into_iter().find(|f| f["event"] == "search_result") {
            result_frame = Some(frame);
            break;
        }
    }
    let result_frame = result_frame.expect("finding re-sent after reconnect");
    assert_eq!(result_frame["result"]["match"], "AKIA1234567890ABCDEF");

    // One redial happened.
    assert!(dash.connections.load(Ordering::SeqCst) >= 2);

    session.shutdown().await;
}
