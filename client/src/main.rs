use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use ringwire::bootstrap::{init_tracing, shutdown_signal};
use ringwire::collab::DraftId;
use ringwire::collab::config::LOG_ENV_VAR;
use ringwire_client::config::Cli;
use ringwire_client::{DraftView, RemoteTransport, Session};

fn render(view: &DraftView) {
    let holder = view.holder().map_or("-", |h| h.as_str());
    let status = view.status().map_or("-", |s| s.as_str());
    println!(
        "[{status}] {} segments, ring: {holder} (#{})",
        view.segment_count(),
        view.ring_sequence().unwrap_or(0)
    );
    if let Some(last) = view.segments().last() {
        println!("  {}: {}", last.author_id, last.content);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LOG_ENV_VAR);
    let cli = Cli::parse();

    let transport = RemoteTransport::new(
        &cli.push_url,
        &cli.api_url,
        DraftId::from(cli.draft.as_str()),
        cli.credentials(),
    );
    let session = Session::new(transport, cli.session_config());
    let mut view = session.view();
    let mut mode = session.mode();

    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(session.run(shutdown.clone()));

    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                render(&view.borrow_and_update());
            }
            changed = mode.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("mode: {:?}", *mode.borrow_and_update());
            }
            _ = &mut signal => break,
        }
    }

    shutdown.cancel();
    runner.await.context("session task failed")?;
    Ok(())
}
