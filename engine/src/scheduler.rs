//! The scheduler loop: turns playlist transitions into show-events.
//!
//! Each iteration polls the playlist (firing due asset dates and the
//! rotation timer), renders a show-event if what is current changed since the
//! last render, then sleeps until the earliest pending deadline, a mutation,
//! or cancellation.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::playlist::{Playlist, Showing};
use crate::show::{Audience, ShowEvent, UrlResolver};
use crate::timer::wait_until;

/// Local and remote renderings of what the playlist shows now.
pub fn render(playlist: &Playlist, urls: &UrlResolver) -> (ShowEvent, ShowEvent) {
    match playlist.showing() {
        Showing::Asset(a) => (
            ShowEvent::for_asset(a, urls, Audience::Local),
            ShowEvent::for_asset(a, urls, Audience::Remote),
        ),
        Showing::Fallback(f) => (
            ShowEvent::for_fallback(f, urls, Audience::Local),
            ShowEvent::for_fallback(f, urls, Audience::Remote),
        ),
    }
}

pub async fn run(engine: Arc<Engine>, cancel: CancellationToken) {
    info!("scheduler started");
    engine.tick(Playlist::kick).await;
    let mut shown: Option<u64> = None;

    loop {
        let (deadline, frame) = engine
            .tick(|p| {
                p.poll();
                let id = p.transition_id();
                let frame = (shown != Some(id)).then(|| (id, render(p, &engine.urls)));
                (p.next_deadline(), frame)
            })
            .await;

        if let Some((id, (local, remote))) = frame {
            shown = Some(id);
            engine.show(&local, &remote).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = engine.wake.notified() => {}
            _ = wait_until(deadline) => {}
        }
    }
    info!("scheduler stopped");
}
