//! Tracker: session handling, parameter injection and persisted identity
//!
//! A [`Tracker`] turns caller-supplied [`TrackMe`] parameter sets into
//! queued events. It owns one [`Dispatcher`] and the per-tracker settings
//! that survive restarts (opt-out, visitor and user ids, visit counters,
//! cache limits, dispatch mode).
//!
//! ## Example
//!
//! ```rust,no_run
//! use tracklet_core::{TrackMe, TrackerBuilder};
//!
//! let tracker = TrackerBuilder::new("https://analytics.example.com/matomo.php", 1)
//!     .build()
//!     .expect("failed to build tracker");
//!
//! tracker.track(TrackMe::new().with("action_name", "Home").with("url", "/home"));
//! tracker.dispatch_blocking();
//! ```

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use crate::config::{Config, DispatchConfig};
use crate::dispatch::{
    Connectivity, DiskCache, DispatchMode, DispatchSettings, Dispatcher, DryRunTarget, EventQueue,
    HttpPacketSender, ManualConnectivity, PacketBuilder, PacketSender,
};
use crate::error::{Error, Result};
use crate::lock;
use crate::storage::{BlobStore, FsBlobStore, SettingsStore, SqliteSettings};
use crate::track_me::{params, TrackMe};

/// Keys of the persisted per-tracker settings.
pub mod keys {
    pub const OPT_OUT: &str = "tracker.optout";
    pub const USER_ID: &str = "tracker.userid";
    pub const VISITOR_ID: &str = "tracker.visitorid";
    pub const FIRST_VISIT: &str = "tracker.firstvisit";
    pub const VISIT_COUNT: &str = "tracker.visitcount";
    pub const PREVIOUS_VISIT: &str = "tracker.previousvisit";
    pub const CACHE_AGE: &str = "tracker.cache.age";
    pub const CACHE_SIZE: &str = "tracker.cache.size";
    pub const DISPATCH_MODE: &str = "tracker.dispatcher.mode";
}

/// Default session timeout (30 minutes).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Pre-submit hook: may rewrite the request or veto it by returning `None`.
pub type TrackingCallback = dyn Fn(TrackMe) -> Option<TrackMe> + Send + Sync;

/// Handle for removing a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Random visitor id: 16 lowercase hex characters.
pub fn random_visitor_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// True for ids matching `^[0-9a-f]{16}$`.
pub fn is_valid_visitor_id(id: &str) -> bool {
    id.len() == 16 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Configures and builds a [`Tracker`].
///
/// Anything not injected falls back to the XDG-located defaults: SQLite
/// settings, a filesystem container directory, always-online connectivity
/// and the HTTP sender.
pub struct TrackerBuilder {
    api_url: String,
    site_id: u32,
    name: String,
    application_base_url: Option<String>,
    dispatch: DispatchConfig,
    settings: Option<Arc<dyn SettingsStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    connectivity: Option<Arc<dyn Connectivity>>,
    sender: Option<Arc<dyn PacketSender>>,
}

impl TrackerBuilder {
    pub fn new(api_url: impl Into<String>, site_id: u32) -> Self {
        Self {
            api_url: api_url.into(),
            site_id,
            name: crate::config::default_tracker_name(),
            application_base_url: None,
            dispatch: DispatchConfig::default(),
            settings: None,
            blobs: None,
            connectivity: None,
            sender: None,
        }
    }

    /// Builder seeded from the `[tracker]` and `[dispatch]` config sections.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_url = config
            .tracker
            .api_url
            .clone()
            .ok_or_else(|| Error::Config("tracker.api_url is not set".to_string()))?;

        let mut builder = Self::new(api_url, config.tracker.site_id)
            .name(config.tracker.name.clone())
            .dispatch_config(config.dispatch.clone());
        builder.application_base_url = config.tracker.application_base_url.clone();
        Ok(builder)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn application_base_url(mut self, url: impl Into<String>) -> Self {
        self.application_base_url = Some(url.into());
        self
    }

    pub fn dispatch_config(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn settings_store(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn sender(mut self, sender: Arc<dyn PacketSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Validate the API URL and assemble the tracker.
    pub fn build(self) -> Result<Tracker> {
        let url = reqwest::Url::parse(&self.api_url)
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", self.api_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{}: missing host", self.api_url)))?
            .to_string();
        self.dispatch.validate()?;

        let application_base_url = self
            .application_base_url
            .unwrap_or_else(|| format!("https://{}/", host));

        let settings: Arc<dyn SettingsStore> = match self.settings {
            Some(settings) => settings,
            None => Arc::new(SqliteSettings::open(&Config::settings_path(), self.name.clone())?),
        };
        let blobs: Arc<dyn BlobStore> = match self.blobs {
            Some(blobs) => blobs,
            None => Arc::new(FsBlobStore::open(Config::event_cache_dir(&format!(
                "{}-{}",
                host, self.site_id
            )))?),
        };
        let connectivity: Arc<dyn Connectivity> = match self.connectivity {
            Some(connectivity) => connectivity,
            None => Arc::new(ManualConnectivity::online()),
        };
        let sender: Arc<dyn PacketSender> = match self.sender {
            Some(sender) => sender,
            None => Arc::new(HttpPacketSender::new()?),
        };

        // Persisted values win over the configured defaults
        let dispatch_settings = Arc::new(DispatchSettings::new(&self.dispatch));
        let store: &dyn SettingsStore = settings.as_ref();
        if let Some(age) = store.get_parsed::<i64>(keys::CACHE_AGE)? {
            dispatch_settings.set_max_cache_age_ms(age);
        }
        if let Some(size) = store.get_parsed::<u64>(keys::CACHE_SIZE)? {
            dispatch_settings.set_max_cache_size_bytes(size);
        }
        if let Some(mode) = store.get_parsed::<DispatchMode>(keys::DISPATCH_MODE)? {
            dispatch_settings.set_mode(mode);
        }

        let disk = Arc::new(DiskCache::new(blobs, dispatch_settings.clone()));
        let dispatcher = Dispatcher::new(
            EventQueue::new(disk),
            connectivity,
            PacketBuilder::new(self.api_url.clone()),
            sender,
            dispatch_settings,
        );

        Tracker::new(
            self.api_url,
            self.site_id,
            self.name,
            application_base_url,
            dispatcher,
            settings,
        )
    }
}

struct TrackingState {
    defaults: TrackMe,
    session_start: Option<Instant>,
    session_timeout: Duration,
    last_event: Option<TrackMe>,
}

/// Thread-safe tracker for one site on one collection endpoint.
pub struct Tracker {
    api_url: String,
    site_id: u32,
    name: String,
    application_base_url: String,
    dispatcher: Dispatcher,
    settings: Arc<dyn SettingsStore>,
    state: Mutex<TrackingState>,
    callbacks: Mutex<Vec<(CallbackId, Arc<TrackingCallback>)>>,
    next_callback_id: AtomicU64,
}

impl Tracker {
    fn new(
        api_url: String,
        site_id: u32,
        name: String,
        application_base_url: String,
        dispatcher: Dispatcher,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        let store: &dyn SettingsStore = settings.as_ref();
        if store.get_parsed::<bool>(keys::OPT_OUT)?.unwrap_or(false) {
            dispatcher.set_opt_out(true);
        }

        let visitor_id = match store.get(keys::VISITOR_ID)? {
            Some(id) => id,
            None => {
                let id = random_visitor_id();
                store.set(keys::VISITOR_ID, &id)?;
                id
            }
        };

        let mut defaults = TrackMe::new();
        defaults
            .set(params::VISITOR_ID, &visitor_id)
            .set(params::SESSION_START, "1")
            .set(params::URL_PATH, &application_base_url);
        if let Some(user_id) = store.get(keys::USER_ID)? {
            defaults.set(params::USER_ID, user_id);
        }

        tracing::debug!(name = %name, api_url = %api_url, site_id, "Tracker created");

        Ok(Self {
            api_url,
            site_id,
            name,
            application_base_url,
            dispatcher,
            settings,
            state: Mutex::new(TrackingState {
                defaults,
                session_start: None,
                session_timeout: DEFAULT_SESSION_TIMEOUT,
                last_event: None,
            }),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(0),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn site_id(&self) -> u32 {
        self.site_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn application_base_url(&self) -> &str {
        &self.application_base_url
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Inject session and base parameters, run the callbacks and queue the
    /// result. Dropped silently while opted out.
    pub fn track(&self, track_me: TrackMe) {
        let mut state = lock(&self.state);
        self.track_locked(&mut state, track_me);
    }

    /// [`Tracker::track`] that gives up instead of waiting when the tracking
    /// lock is held (re-entry from a panic raised while tracking).
    pub(crate) fn try_track(&self, track_me: TrackMe) -> bool {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        self.track_locked(&mut state, track_me);
        true
    }

    fn track_locked(&self, state: &mut TrackingState, mut track_me: TrackMe) {
        let now = Instant::now();
        let new_session = state
            .session_start
            .map_or(true, |start| now.duration_since(start) > state.session_timeout);
        if new_session {
            state.session_start = Some(now);
            self.inject_initial_params(state, &mut track_me);
        }
        self.inject_base_params(state, &mut track_me);

        let callbacks: Vec<_> = lock(&self.callbacks).clone();
        for (id, callback) in callbacks {
            match callback(track_me) {
                Some(next) => track_me = next,
                None => {
                    tracing::debug!(callback = id.0, "Tracking aborted by callback");
                    return;
                }
            }
        }

        state.last_event = Some(track_me.clone());
        if self.dispatcher.is_opted_out() {
            tracing::debug!(query = %track_me, "Event omitted due to opt out");
            return;
        }
        let event = track_me.to_event();
        tracing::debug!(query = %event, "Event added to the queue");
        self.dispatcher.submit(event);
    }

    /// Parameters only the first request of a session carries.
    fn inject_initial_params(&self, state: &mut TrackingState, track_me: &mut TrackMe) {
        let now_secs = chrono::Utc::now().timestamp();

        let visit_count = 1 + self.setting::<i64>(keys::VISIT_COUNT).unwrap_or(0);
        self.persist(keys::VISIT_COUNT, &visit_count.to_string());

        let first_visit = match self.setting::<i64>(keys::FIRST_VISIT) {
            Some(first) => first,
            None => {
                self.persist(keys::FIRST_VISIT, &now_secs.to_string());
                now_secs
            }
        };

        let previous_visit = self.setting::<i64>(keys::PREVIOUS_VISIT);
        self.persist(keys::PREVIOUS_VISIT, &now_secs.to_string());

        let defaults = &mut state.defaults;
        defaults.try_set(params::FIRST_VISIT_TIMESTAMP, first_visit);
        defaults.try_set(params::TOTAL_NUMBER_OF_VISITS, visit_count);
        if let Some(previous) = previous_visit {
            defaults.try_set(params::PREVIOUS_VISIT_TIMESTAMP, previous);
        }

        for key in [
            params::SESSION_START,
            params::FIRST_VISIT_TIMESTAMP,
            params::TOTAL_NUMBER_OF_VISITS,
            params::PREVIOUS_VISIT_TIMESTAMP,
        ] {
            track_me.try_set_opt(key, defaults.get(key));
        }
    }

    /// Parameters every request carries.
    fn inject_base_params(&self, state: &mut TrackingState, track_me: &mut TrackMe) {
        track_me
            .try_set(params::SITE_ID, self.site_id)
            .try_set(params::RECORD, "1")
            .try_set(params::API_VERSION, "1")
            .try_set(
                params::DATETIME_OF_REQUEST,
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%z"),
            )
            .try_set(params::SEND_IMAGE, "0")
            .try_set_opt(params::VISITOR_ID, state.defaults.get(params::VISITOR_ID))
            .try_set_opt(params::USER_ID, state.defaults.get(params::USER_ID));

        let url = match track_me.get(params::URL_PATH) {
            None => state.defaults.get(params::URL_PATH).map(str::to_string),
            Some(path) if is_absolute_url(path) => Some(path.to_string()),
            Some(path) => Some(resolve_url(&self.application_base_url, path)),
        };
        if let Some(url) = url {
            state.defaults.set(params::URL_PATH, &url);
            track_me.set(params::URL_PATH, url);
        }
    }

    fn setting<T: FromStr>(&self, key: &str) -> Option<T> {
        let store: &dyn SettingsStore = self.settings.as_ref();
        match store.get_parsed(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read setting");
                None
            }
        }
    }

    fn persist(&self, key: &str, value: &str) {
        if let Err(e) = self.settings.set(key, value) {
            tracing::warn!(key, error = %e, "Failed to persist setting");
        }
    }

    /// Register a pre-submit callback; callbacks run in registration order.
    pub fn add_tracking_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(TrackMe) -> Option<TrackMe> + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        let callback: Arc<TrackingCallback> = Arc::new(callback);
        lock(&self.callbacks).push((id, callback));
        id
    }

    pub fn remove_tracking_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// The last request that passed the callback chain.
    pub fn last_event(&self) -> Option<TrackMe> {
        lock(&self.state).last_event.clone()
    }

    pub fn start_new_session(&self) {
        lock(&self.state).session_start = None;
    }

    pub fn session_timeout(&self) -> Duration {
        lock(&self.state).session_timeout
    }

    pub fn set_session_timeout(&self, timeout: Duration) {
        lock(&self.state).session_timeout = timeout;
    }

    pub fn is_opt_out(&self) -> bool {
        self.dispatcher.is_opted_out()
    }

    /// Persisted. Opting out also drops everything queued or cached.
    pub fn set_opt_out(&self, opt_out: bool) -> Result<()> {
        self.settings.set(keys::OPT_OUT, &opt_out.to_string())?;
        self.dispatcher.set_opt_out(opt_out);
        Ok(())
    }

    pub fn user_id(&self) -> Option<String> {
        lock(&self.state)
            .defaults
            .get(params::USER_ID)
            .map(str::to_string)
    }

    /// Persisted. `None` removes the user id.
    pub fn set_user_id(&self, user_id: Option<&str>) -> Result<()> {
        let mut state = lock(&self.state);
        match user_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                self.settings.set(keys::USER_ID, id)?;
                state.defaults.set(params::USER_ID, id);
            }
            None => {
                self.settings.remove(keys::USER_ID)?;
                state.defaults.remove(params::USER_ID);
            }
        }
        Ok(())
    }

    pub fn visitor_id(&self) -> Option<String> {
        lock(&self.state)
            .defaults
            .get(params::VISITOR_ID)
            .map(str::to_string)
    }

    /// Persisted. Must be 16 lowercase hex characters.
    pub fn set_visitor_id(&self, visitor_id: &str) -> Result<()> {
        if !is_valid_visitor_id(visitor_id) {
            return Err(Error::InvalidVisitorId(visitor_id.to_string()));
        }
        let mut state = lock(&self.state);
        self.settings.set(keys::VISITOR_ID, visitor_id)?;
        state.defaults.set(params::VISITOR_ID, visitor_id);
        Ok(())
    }

    /// Send queued events in the background. No-op while opted out.
    pub fn dispatch(&self) {
        if self.is_opt_out() {
            return;
        }
        self.dispatcher.force_dispatch();
    }

    /// Send queued events and wait. No-op while opted out.
    pub fn dispatch_blocking(&self) {
        if self.is_opt_out() {
            return;
        }
        self.dispatcher.force_dispatch_blocking();
    }

    pub fn dispatch_interval_ms(&self) -> i64 {
        self.dispatcher.interval_ms()
    }

    /// 0 sends as soon as events are queued, negative disables the timer.
    pub fn set_dispatch_interval_ms(&self, interval_ms: i64) {
        self.dispatcher.set_interval_ms(interval_ms);
    }

    pub fn dispatch_timeout(&self) -> Duration {
        self.dispatcher.connect_timeout()
    }

    pub fn set_dispatch_timeout(&self, timeout: Duration) {
        self.dispatcher.set_connect_timeout(timeout);
    }

    pub fn dispatch_gzipped(&self) -> bool {
        self.dispatcher.gzip()
    }

    pub fn set_dispatch_gzipped(&self, gzip: bool) {
        self.dispatcher.set_gzip(gzip);
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    /// Persisted, except `ForceOffline` which only lasts for this process.
    pub fn set_dispatch_mode(&self, mode: DispatchMode) -> Result<()> {
        if mode != DispatchMode::ForceOffline {
            self.settings.set(keys::DISPATCH_MODE, mode.as_str())?;
        }
        self.dispatcher.set_mode(mode);
        Ok(())
    }

    /// Offline cache age bound (>0 limit in ms, 0 unlimited, <0 disabled).
    pub fn offline_cache_age_ms(&self) -> i64 {
        self.dispatcher.settings().max_cache_age_ms()
    }

    pub fn set_offline_cache_age_ms(&self, age_ms: i64) -> Result<()> {
        self.settings.set(keys::CACHE_AGE, &age_ms.to_string())?;
        self.dispatcher.settings().set_max_cache_age_ms(age_ms);
        Ok(())
    }

    /// Offline cache size bound in bytes (0 unlimited).
    pub fn offline_cache_size_bytes(&self) -> u64 {
        self.dispatcher.settings().max_cache_size_bytes()
    }

    pub fn set_offline_cache_size_bytes(&self, size: u64) -> Result<()> {
        self.settings.set(keys::CACHE_SIZE, &size.to_string())?;
        self.dispatcher.settings().set_max_cache_size_bytes(size);
        Ok(())
    }

    pub fn dry_run_target(&self) -> Option<DryRunTarget> {
        self.dispatcher.dry_run_target()
    }

    pub fn set_dry_run_target(&self, target: Option<DryRunTarget>) {
        self.dispatcher.set_dry_run_target(target);
    }
}

/// `scheme://rest`, with a word-character scheme and non-empty rest.
fn is_absolute_url(url: &str) -> bool {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && !rest.is_empty()
                && scheme.chars().all(|c| c.is_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Join a relative path onto the application base URL with exactly one `/`.
fn resolve_url(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::{Packet, SendOptions};
    use crate::storage::{MemoryBlobStore, MemorySettings};

    const API: &str = "https://analytics.example.com/matomo.php";

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<Packet>>,
    }

    impl PacketSender for RecordingSender {
        fn send(&self, packet: &Packet, _options: &SendOptions) -> Result<()> {
            lock(&self.sent).push(packet.clone());
            Ok(())
        }
    }

    struct Fixture {
        tracker: Tracker,
        settings: Arc<MemorySettings>,
        sender: Arc<RecordingSender>,
    }

    fn builder(settings: Arc<MemorySettings>, sender: Arc<RecordingSender>) -> TrackerBuilder {
        TrackerBuilder::new(API, 3)
            .settings_store(settings)
            .blob_store(Arc::new(MemoryBlobStore::new()))
            .sender(sender)
            .dispatch_config(DispatchConfig {
                interval_ms: -1,
                ..Default::default()
            })
    }

    fn fixture() -> Fixture {
        let settings = Arc::new(MemorySettings::new());
        let sender = Arc::new(RecordingSender::default());
        let tracker = builder(settings.clone(), sender.clone()).build().unwrap();
        Fixture {
            tracker,
            settings,
            sender,
        }
    }

    fn track_and_get(tracker: &Tracker, track_me: TrackMe) -> TrackMe {
        tracker.track(track_me);
        tracker.last_event().unwrap()
    }

    #[test]
    fn test_invalid_url_fails_at_build() {
        let err = TrackerBuilder::new("not a url", 1)
            .settings_store(Arc::new(MemorySettings::new()))
            .blob_store(Arc::new(MemoryBlobStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }

    #[test]
    fn test_default_application_base_url() {
        let f = fixture();
        assert_eq!(f.tracker.application_base_url(), "https://analytics.example.com/");
        assert_eq!(f.tracker.name(), "Default Tracker");
        assert_eq!(f.tracker.site_id(), 3);
    }

    #[test]
    fn test_base_params_injected() {
        let f = fixture();
        let event = track_and_get(&f.tracker, TrackMe::new().with("action_name", "Home"));

        assert_eq!(event.get(params::SITE_ID), Some("3"));
        assert_eq!(event.get(params::RECORD), Some("1"));
        assert_eq!(event.get(params::API_VERSION), Some("1"));
        assert_eq!(event.get(params::SEND_IMAGE), Some("0"));
        assert!(event.has(params::DATETIME_OF_REQUEST));
        assert_eq!(
            event.get(params::VISITOR_ID).map(str::to_string),
            f.tracker.visitor_id()
        );
        assert_eq!(event.get(params::URL_PATH), Some("https://analytics.example.com/"));
        assert!(!event.has(params::USER_ID));
    }

    #[test]
    fn test_caller_values_are_not_overwritten() {
        let f = fixture();
        let event = track_and_get(&f.tracker, TrackMe::new().with(params::SITE_ID, 99));
        assert_eq!(event.get(params::SITE_ID), Some("99"));
    }

    #[test]
    fn test_session_params_only_on_first_request() {
        let f = fixture();
        let first = track_and_get(&f.tracker, TrackMe::new());
        assert_eq!(first.get(params::SESSION_START), Some("1"));
        assert_eq!(first.get(params::TOTAL_NUMBER_OF_VISITS), Some("1"));
        assert!(first.has(params::FIRST_VISIT_TIMESTAMP));
        assert!(!first.has(params::PREVIOUS_VISIT_TIMESTAMP));

        let second = track_and_get(&f.tracker, TrackMe::new());
        assert!(!second.has(params::SESSION_START));

        f.tracker.start_new_session();
        let third = track_and_get(&f.tracker, TrackMe::new());
        assert_eq!(third.get(params::SESSION_START), Some("1"));
        assert_eq!(f.settings.get(keys::VISIT_COUNT).unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_session_timeout_starts_new_session() {
        let f = fixture();
        f.tracker.set_session_timeout(Duration::ZERO);
        track_and_get(&f.tracker, TrackMe::new());
        std::thread::sleep(Duration::from_millis(2));
        let second = track_and_get(&f.tracker, TrackMe::new());
        assert_eq!(second.get(params::SESSION_START), Some("1"));
    }

    #[test]
    fn test_relative_url_resolution() {
        let f = fixture();
        let event = track_and_get(&f.tracker, TrackMe::new().with("url", "/settings"));
        assert_eq!(event.get("url"), Some("https://analytics.example.com/settings"));

        let event = track_and_get(&f.tracker, TrackMe::new().with("url", "about"));
        assert_eq!(event.get("url"), Some("https://analytics.example.com/about"));

        let event = track_and_get(&f.tracker, TrackMe::new().with("url", "app://x/y"));
        assert_eq!(event.get("url"), Some("app://x/y"));

        // Last url becomes the default for later requests
        let event = track_and_get(&f.tracker, TrackMe::new());
        assert_eq!(event.get("url"), Some("app://x/y"));
    }

    #[test]
    fn test_resolve_url_slashes() {
        assert_eq!(resolve_url("https://a/", "/b"), "https://a/b");
        assert_eq!(resolve_url("https://a", "b"), "https://a/b");
        assert_eq!(resolve_url("https://a", "/b"), "https://a/b");
        assert_eq!(resolve_url("https://a/", "b"), "https://a/b");
        assert!(!is_absolute_url("/path"));
        assert!(!is_absolute_url("://x"));
    }

    #[test]
    fn test_callbacks_transform_and_veto() {
        let f = fixture();
        f.tracker
            .add_tracking_callback(|track_me| Some(track_me.with("dimension1", "blue")));
        let veto = f.tracker.add_tracking_callback(|track_me| {
            if track_me.get("action_name") == Some("secret") {
                None
            } else {
                Some(track_me)
            }
        });

        let event = track_and_get(&f.tracker, TrackMe::new().with("action_name", "Home"));
        assert_eq!(event.get("dimension1"), Some("blue"));

        f.tracker
            .track(TrackMe::new().with("action_name", "secret"));
        assert_eq!(f.tracker.dispatcher().queue().len(), 1);

        assert!(f.tracker.remove_tracking_callback(veto));
        assert!(!f.tracker.remove_tracking_callback(veto));
        f.tracker
            .track(TrackMe::new().with("action_name", "secret"));
        assert_eq!(f.tracker.dispatcher().queue().len(), 2);
    }

    #[test]
    fn test_opt_out_is_persisted_and_drops_events() {
        let f = fixture();
        f.tracker.track(TrackMe::new());
        f.tracker.set_opt_out(true).unwrap();
        assert!(f.tracker.dispatcher().queue().is_empty());

        f.tracker.track(TrackMe::new());
        f.tracker.dispatch_blocking();
        assert!(lock(&f.sender.sent).is_empty());
        assert_eq!(f.settings.get(keys::OPT_OUT).unwrap().as_deref(), Some("true"));

        let reopened = builder(f.settings.clone(), f.sender.clone()).build().unwrap();
        assert!(reopened.is_opt_out());
    }

    #[test]
    fn test_visitor_id_generated_and_persisted() {
        let f = fixture();
        let id = f.tracker.visitor_id().unwrap();
        assert!(is_valid_visitor_id(&id));

        let reopened = builder(f.settings.clone(), f.sender.clone()).build().unwrap();
        assert_eq!(reopened.visitor_id(), Some(id));
    }

    #[test]
    fn test_set_visitor_id_validates() {
        let f = fixture();
        assert!(matches!(
            f.tracker.set_visitor_id("ABCDEF0123456789"),
            Err(Error::InvalidVisitorId(_))
        ));
        assert!(f.tracker.set_visitor_id("short").is_err());

        f.tracker.set_visitor_id("0123456789abcdef").unwrap();
        assert_eq!(f.tracker.visitor_id().as_deref(), Some("0123456789abcdef"));
    }

    #[test]
    fn test_user_id_persisted_and_removed() {
        let f = fixture();
        f.tracker.set_user_id(Some("alice@example.com")).unwrap();
        let event = track_and_get(&f.tracker, TrackMe::new());
        assert_eq!(event.get(params::USER_ID), Some("alice@example.com"));

        let reopened = builder(f.settings.clone(), f.sender.clone()).build().unwrap();
        assert_eq!(reopened.user_id().as_deref(), Some("alice@example.com"));

        f.tracker.set_user_id(None).unwrap();
        assert_eq!(f.tracker.user_id(), None);
        assert_eq!(f.settings.get(keys::USER_ID).unwrap(), None);
    }

    #[test]
    fn test_force_offline_is_not_persisted() {
        let f = fixture();
        f.tracker.set_dispatch_mode(DispatchMode::WifiOnly).unwrap();
        f.tracker.set_dispatch_mode(DispatchMode::ForceOffline).unwrap();

        assert_eq!(f.tracker.dispatch_mode(), DispatchMode::ForceOffline);
        assert_eq!(
            f.settings.get(keys::DISPATCH_MODE).unwrap().as_deref(),
            Some("wifi_only")
        );

        let reopened = builder(f.settings.clone(), f.sender.clone()).build().unwrap();
        assert_eq!(reopened.dispatch_mode(), DispatchMode::WifiOnly);
    }

    #[test]
    fn test_cache_limits_persisted() {
        let f = fixture();
        f.tracker.set_offline_cache_age_ms(-1).unwrap();
        f.tracker.set_offline_cache_size_bytes(1024).unwrap();

        let reopened = builder(f.settings.clone(), f.sender.clone()).build().unwrap();
        assert_eq!(reopened.offline_cache_age_ms(), -1);
        assert_eq!(reopened.offline_cache_size_bytes(), 1024);
    }

    #[test]
    fn test_dispatch_blocking_sends_tracked_events() {
        let f = fixture();
        f.tracker.track(TrackMe::new().with("action_name", "A"));
        f.tracker.track(TrackMe::new().with("action_name", "B"));

        f.tracker.dispatch_blocking();

        let sent = lock(&f.sender.sent);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_count(), 2);
        assert!(sent[0].body().unwrap().contains("action_name=A"));
    }

    #[test]
    fn test_from_config_requires_api_url() {
        let config = Config::default();
        assert!(matches!(
            TrackerBuilder::from_config(&config).err(),
            Some(Error::Config(_))
        ));
    }
}
