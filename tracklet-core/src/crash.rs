//! Flush pending events to disk when the process panics

use std::sync::Arc;

use crate::dispatch::DispatchMode;
use crate::track_me::{params, TrackMe};
use crate::tracker::Tracker;

/// Build the exception event for a panic at `location` with `message`.
pub fn panic_event(location: &str, message: &str) -> TrackMe {
    TrackMe::new()
        .with(
            params::ACTION_NAME,
            format!("exception/fatal/{}/{}", location, message),
        )
        .with(params::EVENT_CATEGORY, "Exception")
        .with(params::EVENT_ACTION, location)
        .with(params::EVENT_NAME, message)
        .with(params::EVENT_VALUE, 1)
}

/// Install a panic hook that records the panic and spills the queue.
///
/// On panic the tracker is switched to [`DispatchMode::ForceOffline`], an
/// exception event is tracked, and a blocking dispatch writes everything
/// pending to the offline cache. The previous mode is restored and the
/// previously installed hook runs last.
pub fn install_panic_hook(tracker: Arc<Tracker>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());

        flush_on_panic(&tracker, &location, &message);
        previous(info);
    }));
}

fn flush_on_panic(tracker: &Tracker, location: &str, message: &str) {
    let mode = tracker.dispatch_mode();
    if let Err(e) = tracker.set_dispatch_mode(DispatchMode::ForceOffline) {
        tracing::warn!(error = %e, "Failed to force offline mode");
    }

    if !tracker.try_track(panic_event(location, message)) {
        tracing::warn!("Tracker busy, panic event not recorded");
    }
    tracker.dispatch_blocking();

    if let Err(e) = tracker.set_dispatch_mode(mode) {
        tracing::warn!(error = %e, "Failed to restore dispatch mode");
    }
    tracing::error!(location, message, "Panic recorded, pending events cached");
}
