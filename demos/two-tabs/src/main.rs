//! Two tabs of one application, one session.
//!
//! Tab A opens first and leads: it sends the heartbeats and keeps tab B's
//! countdown in line. Tab B buys another minute, then tab A is closed and
//! B takes over until the session expires.
//!
//! Run with `RUST_LOG=gwsession=debug` for the engine's side of the story.

use std::sync::Arc;
use std::time::Duration;

use gwsession::prelude::*;
use gwsession::{Clock, InMemoryBackend, MemoryOrigin, MemoryTab, Subscription, TokioClock};
use gwsession_auth::testing::{TestSigner, claims};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use url::Url;

const SESSION_ID: &str = "demo-session";
const LIFETIME_SECS: u64 = 20;

// ---------------------------------------------------------------------------
// Tabs
// ---------------------------------------------------------------------------

struct Tab {
    _page: MemoryTab,
    session: SessionOrchestrator<InMemoryBackend>,
    _subscriptions: Vec<Subscription>,
}

fn open_tab(
    label: &'static str,
    origin: &MemoryOrigin,
    backend: &Arc<InMemoryBackend>,
    token: &str,
    ended: mpsc::UnboundedSender<&'static str>,
) -> Result<Tab, SessionError> {
    let page_url = format!("https://app.example.com/?gwSession={token}");
    let page = origin.open_tab(Url::parse(&page_url).map_err(|e| SessionError::Config(e.to_string()))?);

    let config = SessionConfig {
        api_endpoint: "https://api.example.com".into(),
        marketplace_url: Some("https://marketplace.example.com/apps".into()),
        warning_threshold_seconds: 10,
        heartbeat_interval_seconds: 5,
        ..SessionConfig::default()
    };
    let hooks = LifecycleHooks::new().on_session_warning(move |ctx| async move {
        println!("[{label}] hook: only {}s left, save your work", ctx.remaining_seconds);
        Ok(())
    });
    let session = SessionOrchestrator::builder(config)
        .platform(page.platform())
        .backend(backend.clone())
        .hooks(hooks)
        .build()?;

    let subscriptions = vec![
        session.on_tick(move |left| {
            if left % 5 == 0 {
                println!("[{label}] {}", format_remaining(left));
            }
        }),
        session.subscribe(move |event| {
            if let SessionEvent::RoleChanged { role } = event {
                println!("[{label}] is now {role}");
            }
        }),
        session.on_session_end(move |reason| {
            println!("[{label}] session ended: {reason}");
            let _ = ended.send(label);
        }),
        session.on_redirect(move |url| println!("[{label}] redirect to {url}")),
    ];

    Ok(Tab {
        _page: page,
        session,
        _subscriptions: subscriptions,
    })
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let clock = Arc::new(TokioClock::starting_now());
    let now = clock.now_secs();
    let origin = MemoryOrigin::new(clock.clone());
    let backend = Arc::new(InMemoryBackend::new(clock));
    backend.set_jwks(TestSigner::jwks());

    let token = TestSigner::new().sign(&claims(SESSION_ID, now, now + LIFETIME_SECS));
    backend.insert_session(SESSION_ID, &token, "app-1", "user-1", "org-1", now + LIFETIME_SECS);

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let mut a = open_tab("A", &origin, &backend, &token, ended_tx.clone())?;
    let mut b = open_tab("B", &origin, &backend, &token, ended_tx)?;

    let record = a.session.initialize().await?;
    println!("[A] started session {} as {:?}", record.session_id, a.session.role());
    b.session.initialize().await?;
    println!("[B] joined as {:?}", b.session.role());

    tokio::time::sleep(Duration::from_secs(3)).await;
    let renewal = b.session.extend_session(1).await?;
    println!(
        "[B] bought a minute for {} tokens, now {} left",
        renewal.additional_cost,
        format_remaining(b.session.remaining_seconds())
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("[A] sees {} left", format_remaining(a.session.remaining_seconds()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("[A] closing");
    a.session.teardown();

    // B takes over within two heartbeat intervals and runs until expiry.
    if let Some(label) = ended_rx.recv().await {
        println!("[{label}] done, {} heartbeats sent", backend.heartbeat_count(SESSION_ID));
    }
    b.session.teardown();
    Ok(())
}
