//! Background dispatch worker
//!
//! One worker thread per tracker, started lazily by [`Dispatcher::submit`]
//! or [`Dispatcher::force_dispatch`] and parked between cycles on a counting
//! wake token. Each cycle checks eligibility, pulls the disk cache into the
//! queue, sends packets strictly in order and stops at the first failure.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::lock;

use super::connectivity::{Connectivity, NetworkType};
use super::event::Event;
use super::mode::DispatchMode;
use super::packet::{Packet, PacketBuilder};
use super::queue::EventQueue;
use super::settings::DispatchSettings;
use super::transport::{PacketSender, SendOptions};

const WORKER_NAME: &str = "tracklet-dispatcher";

/// Shared capture list for dry-run mode.
pub type DryRunTarget = Arc<Mutex<Vec<Packet>>>;

/// Sleep before the next cycle: the interval, plus an additive backoff of
/// `min(retries * interval, 5 * interval)` once more than one consecutive
/// send has failed. Negative intervals sleep zero.
pub fn backoff_delay(interval_ms: i64, retries: u32) -> Duration {
    let interval = interval_ms.max(0);
    let mut sleep = interval;
    if retries > 1 {
        let backoff = interval
            .saturating_mul(i64::from(retries))
            .min(interval.saturating_mul(5));
        sleep = sleep.saturating_add(backoff);
    }
    Duration::from_millis(sleep as u64)
}

#[derive(Default)]
struct Control {
    /// A worker or an inline cycle currently owns the queue
    running: bool,
    /// Callers inside `force_dispatch_blocking`; no worker launches while > 0
    blocking_callers: usize,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

struct Inner {
    queue: EventQueue,
    connectivity: Arc<dyn Connectivity>,
    packets: PacketBuilder,
    sender: Arc<dyn PacketSender>,
    settings: Arc<DispatchSettings>,
    retry_counter: AtomicU32,
    opted_out: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    control: Mutex<Control>,
    /// Signalled whenever `running` goes false
    idle: Condvar,
    dry_run: Mutex<Option<DryRunTarget>>,
}

/// Clears `running` on drop, unwinding included.
struct InlineCycle<'a>(&'a Inner);

impl Drop for InlineCycle<'_> {
    fn drop(&mut self) {
        lock(&self.0.control).running = false;
        self.0.idle.notify_all();
    }
}

/// Thread-safe handle on the dispatch engine of one tracker.
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        queue: EventQueue,
        connectivity: Arc<dyn Connectivity>,
        packets: PacketBuilder,
        sender: Arc<dyn PacketSender>,
        settings: Arc<DispatchSettings>,
    ) -> Self {
        let (wake_tx, wake_rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                queue,
                connectivity,
                packets,
                sender,
                settings,
                retry_counter: AtomicU32::new(0),
                opted_out: AtomicBool::new(false),
                wake_tx,
                wake_rx,
                control: Mutex::new(Control::default()),
                idle: Condvar::new(),
                dry_run: Mutex::new(None),
            }),
        }
    }

    pub fn queue(&self) -> &EventQueue {
        &self.inner.queue
    }

    pub fn settings(&self) -> &Arc<DispatchSettings> {
        &self.inner.settings
    }

    /// Queue an event and start the worker unless dispatch is manual.
    ///
    /// Ignored while opted out.
    pub fn submit(&self, event: Event) {
        if self.is_opted_out() {
            tracing::debug!("Opted out, dropping event");
            return;
        }
        self.inner.queue.add(event);
        if self.inner.settings.interval_ms() >= 0 {
            self.inner.launch();
        }
    }

    /// Start a cycle now.
    ///
    /// Returns `true` if a new worker was launched. If one was already
    /// running, its retry counter is reset and its current sleep is cut
    /// short instead.
    pub fn force_dispatch(&self) -> bool {
        self.inner.force_dispatch()
    }

    /// Run one final cycle and wait for it to finish.
    ///
    /// No new worker is spawned: with no worker running the cycle runs on
    /// the calling thread, otherwise the worker is woken, told to exit after
    /// its current cycle, and joined. Concurrent callers take turns, so at
    /// most one cycle is sending at any time.
    pub fn force_dispatch_blocking(&self) {
        let inner = &self.inner;
        let mut control = lock(&inner.control);
        control.blocking_callers += 1;

        if control.worker_id == Some(thread::current().id()) {
            // Called from inside the worker (panic hook): flush inline, the
            // loop exits on its own once the cycle returns
            drop(control);
            inner.run_cycle();
            control = lock(&inner.control);
        } else {
            let was_running = control.running;
            if was_running {
                inner.retry_counter.store(0, Ordering::SeqCst);
                inner.wake();
                if let Some(handle) = control.worker.take() {
                    drop(control);
                    let panicked = handle.join().is_err();
                    control = lock(&inner.control);
                    if panicked {
                        tracing::warn!("Dispatch worker panicked");
                        control.running = false;
                        inner.idle.notify_all();
                    }
                }
                // Another blocking caller may own the worker or be mid-cycle
                control = inner.wait_idle(control);
            }

            // Events submitted after the worker's last drain
            if !was_running || inner.queue.len() > 0 {
                control.running = true;
                drop(control);
                {
                    let _cycle = InlineCycle(inner);
                    inner.run_cycle();
                }
                control = lock(&inner.control);
            }
        }

        control.blocking_callers -= 1;
    }

    /// Drop every queued and cached event.
    pub fn clear(&self) {
        self.inner.queue.clear();
        if self.is_running() {
            self.inner.force_dispatch();
        }
    }

    pub fn is_opted_out(&self) -> bool {
        self.inner.opted_out.load(Ordering::SeqCst)
    }

    /// Opting out clears everything pending and ignores later submissions.
    pub fn set_opt_out(&self, opt_out: bool) {
        self.inner.opted_out.store(opt_out, Ordering::SeqCst);
        if opt_out {
            self.clear();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.control).running
    }

    /// Consecutive failed sends since the last success.
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_counter.load(Ordering::SeqCst)
    }

    pub fn interval_ms(&self) -> i64 {
        self.inner.settings.interval_ms()
    }

    /// Negative disables automatic dispatch. Any other value starts the worker.
    pub fn set_interval_ms(&self, interval_ms: i64) {
        self.inner.settings.set_interval_ms(interval_ms);
        if interval_ms >= 0 {
            self.inner.launch();
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.inner.settings.connect_timeout()
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.inner.settings.set_connect_timeout(timeout);
    }

    pub fn gzip(&self) -> bool {
        self.inner.settings.gzip()
    }

    pub fn set_gzip(&self, gzip: bool) {
        self.inner.settings.set_gzip(gzip);
    }

    pub fn mode(&self) -> DispatchMode {
        self.inner.settings.mode()
    }

    pub fn set_mode(&self, mode: DispatchMode) {
        self.inner.settings.set_mode(mode);
    }

    pub fn dry_run_target(&self) -> Option<DryRunTarget> {
        lock(&self.inner.dry_run).clone()
    }

    /// While set, packets are captured here instead of being sent.
    pub fn set_dry_run_target(&self, target: Option<DryRunTarget>) {
        *lock(&self.inner.dry_run) = target;
    }
}

impl Inner {
    fn wake(&self) {
        // The receiver lives as long as the sender, send cannot fail
        let _ = self.wake_tx.send(());
    }

    fn launch(self: &Arc<Self>) -> bool {
        let mut control = lock(&self.control);
        if control.running || control.blocking_callers > 0 {
            return false;
        }

        // Tokens left over from a previous worker
        while self.wake_rx.try_recv().is_ok() {}

        let inner = Arc::clone(self);
        match thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || inner.run_loop())
        {
            Ok(handle) => {
                control.running = true;
                control.worker_id = Some(handle.thread().id());
                control.worker = Some(handle);
                tracing::debug!("Dispatch worker launched");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to spawn dispatch worker");
                false
            }
        }
    }

    fn wait_idle<'a>(&self, mut control: MutexGuard<'a, Control>) -> MutexGuard<'a, Control> {
        while control.running {
            control = self
                .idle
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner);
        }
        control
    }

    fn force_dispatch(self: &Arc<Self>) -> bool {
        if self.launch() {
            return true;
        }
        self.retry_counter.store(0, Ordering::SeqCst);
        self.wake();
        false
    }

    fn run_loop(&self) {
        self.retry_counter.store(0, Ordering::SeqCst);
        loop {
            let sleep = backoff_delay(
                self.settings.interval_ms(),
                self.retry_counter.load(Ordering::SeqCst),
            );
            // Either the interval passes or someone released a token
            let _ = self.wake_rx.recv_timeout(sleep);

            let all_sent = self.run_cycle();

            let mut control = lock(&self.control);
            let interval = self.settings.interval_ms();
            // With a zero interval a stalled cycle would spin; the next
            // submit relaunches instead
            if control.blocking_callers > 0
                || interval < 0
                || (interval == 0 && !all_sent)
                || self.queue.is_empty()
            {
                control.running = false;
                self.idle.notify_all();
                tracing::debug!("Dispatch worker stopped");
                return;
            }
        }
    }

    fn is_online(&self) -> bool {
        if !self.connectivity.is_connected() {
            return false;
        }
        match self.settings.mode() {
            DispatchMode::ForceOffline => false,
            DispatchMode::Always => true,
            DispatchMode::WifiOnly => self.connectivity.network_type() == NetworkType::Wifi,
        }
    }

    /// One dispatch cycle. Returns `false` if events were left unsent.
    fn run_cycle(&self) -> bool {
        let online = self.is_online();
        if !self.queue.update_state(online) {
            return online;
        }

        let mut drained: Vec<Event> = self
            .queue
            .drain_all()
            .into_iter()
            .filter(|event| {
                if event.payload().is_empty() {
                    tracing::debug!(timestamp = event.timestamp(), "Dropping event with empty payload");
                    false
                } else {
                    true
                }
            })
            .collect();
        tracing::debug!(events = drained.len(), "Drained events");

        let mut sent = 0;
        for packet in self.packets.build_packets(&drained) {
            if self.deliver(&packet) {
                sent += packet.event_count();
                self.retry_counter.store(0, Ordering::SeqCst);
            } else {
                let retries = self.retry_counter.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(retries, "Failure while sending packet");
                break;
            }

            if !self.is_online() {
                tracing::debug!("Went offline during dispatch");
                break;
            }
        }
        tracing::debug!(sent, "Dispatched events");

        if sent < drained.len() {
            let remaining = drained.split_off(sent);
            tracing::debug!(events = remaining.len(), "Requeueing unsent events");
            self.queue.requeue_front(remaining);
            self.queue.update_state(self.is_online());
            return false;
        }
        true
    }

    fn deliver(&self, packet: &Packet) -> bool {
        let target = lock(&self.dry_run).clone();
        if let Some(target) = target {
            let mut captured = lock(&target);
            captured.push(packet.clone());
            tracing::debug!(captured = captured.len(), "Dry run, stored packet");
            return true;
        }

        let options = SendOptions {
            timeout: self.settings.connect_timeout(),
            gzip: self.settings.gzip(),
        };
        match self.sender.send(packet, &options) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, url = packet.target_url(), "Send failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::connectivity::ManualConnectivity;
    use crate::dispatch::disk_cache::DiskCache;
    use crate::error::{Error, Result};
    use crate::storage::MemoryBlobStore;
    use std::collections::HashSet;
    use std::time::Instant;

    const API: &str = "https://analytics.example.com/matomo.php";

    /// Records every packet; calls listed in `fail_calls` (1-based) fail.
    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<Packet>>,
        calls: AtomicU32,
        fail_calls: Mutex<HashSet<u32>>,
        disconnect: Mutex<Option<(u32, Arc<ManualConnectivity>)>>,
        delay: Mutex<Duration>,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    impl RecordingSender {
        fn fail_on(&self, call: u32) {
            lock(&self.fail_calls).insert(call);
        }

        /// Drop the network right after call `call` succeeds.
        fn disconnect_after(&self, call: u32, connectivity: Arc<ManualConnectivity>) {
            *lock(&self.disconnect) = Some((call, connectivity));
        }

        fn set_delay(&self, delay: Duration) {
            *lock(&self.delay) = delay;
        }

        fn max_in_flight(&self) -> u32 {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn sent(&self) -> Vec<Packet> {
            lock(&self.sent).clone()
        }

        fn payloads(&self) -> Vec<String> {
            self.sent()
                .iter()
                .flat_map(|packet| match packet.body() {
                    Some(body) => {
                        let value: serde_json::Value = serde_json::from_str(body).unwrap();
                        value["requests"]
                            .as_array()
                            .unwrap()
                            .iter()
                            .map(|r| r.as_str().unwrap().to_string())
                            .collect::<Vec<_>>()
                    }
                    None => vec![packet.target_url()[API.len()..].to_string()],
                })
                .collect()
        }
    }

    impl PacketSender for RecordingSender {
        fn send(&self, packet: &Packet, _options: &SendOptions) -> Result<()> {
            let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
            thread::sleep(*lock(&self.delay));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if lock(&self.fail_calls).contains(&call) {
                return Err(Error::Status(500));
            }
            lock(&self.sent).push(packet.clone());
            if let Some((after, connectivity)) = lock(&self.disconnect).as_ref() {
                if *after == call {
                    connectivity.set_connected(false);
                }
            }
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        sender: Arc<RecordingSender>,
        connectivity: Arc<ManualConnectivity>,
        store: Arc<MemoryBlobStore>,
    }

    fn fixture(interval_ms: i64) -> Fixture {
        crate::logging::init_test();
        let settings = Arc::new(DispatchSettings::new(&DispatchConfig {
            interval_ms,
            max_cache_age_ms: 0,
            max_cache_size_bytes: 0,
            ..Default::default()
        }));
        let store = Arc::new(MemoryBlobStore::new());
        let disk = Arc::new(DiskCache::new(store.clone(), settings.clone()));
        let sender = Arc::new(RecordingSender::default());
        let connectivity = Arc::new(ManualConnectivity::online());
        let dispatcher = Dispatcher::new(
            EventQueue::new(disk),
            connectivity.clone(),
            PacketBuilder::new(API),
            sender.clone(),
            settings,
        );
        Fixture {
            dispatcher,
            sender,
            connectivity,
            store,
        }
    }

    fn ev(n: i64) -> Event {
        Event::new(n, format!("?n={}", n))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(1000, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 2), Duration::from_millis(3000));
        assert_eq!(backoff_delay(1000, 5), Duration::from_millis(6000));
        assert_eq!(backoff_delay(1000, 50), Duration::from_millis(6000));
        assert_eq!(backoff_delay(0, 10), Duration::ZERO);
        assert_eq!(backoff_delay(-1, 10), Duration::ZERO);
    }

    #[test]
    fn test_blocking_dispatch_sends_in_order() {
        let f = fixture(-1);
        for n in 0..45 {
            f.dispatcher.submit(ev(n));
        }
        assert!(!f.dispatcher.is_running());

        f.dispatcher.force_dispatch_blocking();

        let sent = f.sender.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent.iter().map(Packet::event_count).collect::<Vec<_>>(),
            vec![20, 20, 5]
        );
        let expected: Vec<String> = (0..45).map(|n| format!("?n={}", n)).collect();
        assert_eq!(f.sender.payloads(), expected);
        assert!(f.dispatcher.queue().is_empty());
    }

    #[test]
    fn test_partial_failure_requeues_remaining_in_order() {
        let f = fixture(-1);
        f.sender.fail_on(2);
        for n in 0..45 {
            f.dispatcher.submit(ev(n));
        }

        f.dispatcher.force_dispatch_blocking();

        assert_eq!(f.sender.sent().len(), 1);
        assert_eq!(f.dispatcher.retry_count(), 1);
        // Online: the unsent events stay in memory
        assert_eq!(f.dispatcher.queue().len(), 25);
        assert!(f.store.is_empty());

        f.dispatcher.force_dispatch_blocking();

        assert_eq!(f.dispatcher.retry_count(), 0);
        let expected: Vec<String> = (0..45).map(|n| format!("?n={}", n)).collect();
        assert_eq!(f.sender.payloads(), expected);
    }

    #[test]
    fn test_going_offline_mid_cycle_spills_the_rest() {
        let f = fixture(-1);
        f.sender.disconnect_after(1, f.connectivity.clone());
        for n in 0..45 {
            f.dispatcher.submit(ev(n));
        }

        f.dispatcher.force_dispatch_blocking();

        // First page went out, then the cycle noticed the drop and stopped
        assert_eq!(f.sender.sent().len(), 1);
        assert_eq!(f.dispatcher.retry_count(), 0);
        assert_eq!(f.dispatcher.queue().len(), 0);
        assert_eq!(f.store.len(), 1);

        f.connectivity.set_connected(true);
        f.dispatcher.force_dispatch_blocking();

        let sent = f.sender.sent();
        assert_eq!(
            sent.iter().map(Packet::event_count).collect::<Vec<_>>(),
            vec![20, 20, 5]
        );
        let expected: Vec<String> = (0..45).map(|n| format!("?n={}", n)).collect();
        assert_eq!(f.sender.payloads(), expected);
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_offline_events_flushed_together_when_back_online() {
        let f = fixture(0);
        f.connectivity.set_connected(false);

        f.dispatcher.submit(Event::new(0, "?e=A"));
        f.dispatcher.submit(Event::new(1, "?e=B"));
        f.dispatcher.force_dispatch_blocking();

        assert!(f.sender.sent().is_empty());
        assert_eq!(f.dispatcher.queue().len(), 0);
        assert!(!f.store.is_empty());

        f.connectivity.set_connected(true);
        f.dispatcher.submit(Event::new(2, "?e=C"));
        f.dispatcher.force_dispatch_blocking();

        let sent = f.sender.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_post());
        let body: serde_json::Value = serde_json::from_str(sent[0].body().unwrap()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "requests": ["?e=A", "?e=B", "?e=C"] })
        );
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_wifi_only_on_mobile_does_not_send() {
        let f = fixture(-1);
        f.connectivity.set_network_type(NetworkType::Mobile);
        f.dispatcher.set_mode(DispatchMode::WifiOnly);

        f.dispatcher.submit(ev(1));
        f.dispatcher.force_dispatch_blocking();

        assert!(f.sender.sent().is_empty());
        assert_eq!(f.store.len(), 1);

        f.connectivity.set_network_type(NetworkType::Wifi);
        f.dispatcher.force_dispatch_blocking();
        assert_eq!(f.sender.payloads(), vec!["?n=1".to_string()]);
    }

    #[test]
    fn test_force_offline_spills_to_disk() {
        let f = fixture(-1);
        f.dispatcher.set_mode(DispatchMode::ForceOffline);
        f.dispatcher.submit(ev(1));
        f.dispatcher.submit(ev(2));

        f.dispatcher.force_dispatch_blocking();

        assert!(f.sender.sent().is_empty());
        assert_eq!(f.store.len(), 1);
        assert_eq!(f.dispatcher.queue().len(), 0);
    }

    #[test]
    fn test_empty_payloads_are_dropped() {
        let f = fixture(-1);
        f.dispatcher.submit(Event::new(1, ""));
        f.dispatcher.submit(ev(2));
        f.dispatcher.submit(Event::new(3, ""));

        f.dispatcher.force_dispatch_blocking();

        assert_eq!(f.sender.payloads(), vec!["?n=2".to_string()]);
        assert!(f.dispatcher.queue().is_empty());
    }

    #[test]
    fn test_background_worker_delivers() {
        let f = fixture(0);
        for n in 0..5 {
            f.dispatcher.submit(ev(n));
        }

        wait_until(|| f.sender.payloads().len() == 5);
        wait_until(|| !f.dispatcher.is_running());

        let expected: Vec<String> = (0..5).map(|n| format!("?n={}", n)).collect();
        assert_eq!(f.sender.payloads(), expected);
    }

    #[test]
    fn test_force_dispatch_wakes_sleeping_worker() {
        let f = fixture(60_000);
        f.dispatcher.submit(ev(1));
        assert!(f.dispatcher.is_running());
        assert!(!f.dispatcher.force_dispatch());

        wait_until(|| f.sender.sent().len() == 1);
        wait_until(|| !f.dispatcher.is_running());
    }

    #[test]
    fn test_blocking_dispatch_joins_running_worker() {
        let f = fixture(60_000);
        f.dispatcher.submit(ev(1));
        f.dispatcher.submit(ev(2));
        assert!(f.dispatcher.is_running());

        f.dispatcher.force_dispatch_blocking();

        assert!(!f.dispatcher.is_running());
        assert_eq!(f.sender.sent().len(), 1);
    }

    #[test]
    fn test_concurrent_blocking_dispatches_take_turns() {
        let f = fixture(60_000);
        f.sender.set_delay(Duration::from_millis(10));
        f.dispatcher.submit(ev(0));
        assert!(f.dispatcher.is_running());

        thread::scope(|scope| {
            for caller in 0..4 {
                let f = &f;
                scope.spawn(move || {
                    for n in 0..5 {
                        f.dispatcher.submit(ev(1 + caller * 5 + n));
                    }
                    f.dispatcher.force_dispatch_blocking();
                });
            }
        });

        assert_eq!(f.sender.max_in_flight(), 1);
        assert!(!f.dispatcher.is_running());
        assert!(f.dispatcher.queue().is_empty());
        let delivered: HashSet<String> = f.sender.payloads().into_iter().collect();
        let expected: HashSet<String> = (0..21).map(|n| format!("?n={}", n)).collect();
        assert_eq!(delivered, expected);
    }

    #[test]
    fn test_manual_interval_does_not_launch() {
        let f = fixture(-1);
        f.dispatcher.submit(ev(1));
        assert!(!f.dispatcher.is_running());
        assert_eq!(f.dispatcher.queue().len(), 1);
    }

    #[test]
    fn test_dry_run_captures_instead_of_sending() {
        let f = fixture(-1);
        let target: DryRunTarget = Arc::new(Mutex::new(Vec::new()));
        f.dispatcher.set_dry_run_target(Some(target.clone()));

        for n in 0..3 {
            f.dispatcher.submit(ev(n));
        }
        f.dispatcher.force_dispatch_blocking();

        assert!(f.sender.sent().is_empty());
        let captured = lock(&target);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].event_count(), 3);
        assert!(f.dispatcher.queue().is_empty());
    }

    #[test]
    fn test_opt_out_clears_and_ignores_submissions() {
        let f = fixture(-1);
        f.dispatcher.submit(ev(1));
        f.dispatcher.set_opt_out(true);
        assert!(f.dispatcher.queue().is_empty());

        f.dispatcher.submit(ev(2));
        assert!(f.dispatcher.queue().is_empty());

        f.dispatcher.set_opt_out(false);
        f.dispatcher.submit(ev(3));
        f.dispatcher.force_dispatch_blocking();
        assert_eq!(f.sender.payloads(), vec!["?n=3".to_string()]);
    }

    #[test]
    fn test_clear_drops_memory_and_disk() {
        let f = fixture(-1);
        f.connectivity.set_connected(false);
        f.dispatcher.submit(ev(1));
        f.dispatcher.force_dispatch_blocking();
        f.dispatcher.submit(ev(2));

        f.dispatcher.clear();

        assert!(f.dispatcher.queue().is_empty());
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_setters_update_shared_settings() {
        let f = fixture(-1);
        f.dispatcher.set_gzip(true);
        f.dispatcher.set_connect_timeout(Duration::from_secs(3));
        f.dispatcher.set_mode(DispatchMode::WifiOnly);

        assert!(f.dispatcher.settings().gzip());
        assert_eq!(f.dispatcher.connect_timeout(), Duration::from_secs(3));
        assert_eq!(f.dispatcher.mode(), DispatchMode::WifiOnly);
    }

    #[test]
    fn test_non_negative_interval_launches() {
        let f = fixture(-1);
        f.dispatcher.submit(ev(1));
        f.dispatcher.set_interval_ms(0);

        wait_until(|| f.sender.sent().len() == 1);
        wait_until(|| !f.dispatcher.is_running());
        assert_eq!(f.dispatcher.interval_ms(), 0);
    }
}
