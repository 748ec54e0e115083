/*!
 * Freezer Tests
 * Safety checks, refcounted enablement, debounce behavior
 */

use parking_lot::Mutex;
use procwarden::core::config::{shared, Tunables};
use procwarden::freezer::Freezer;
use procwarden::metrics::{Sampler, VecSink};
use procwarden::ports::fake::{FakeFreezePort, FakeKillPort};
use procwarden::ports::FreezeTraffic;
use procwarden::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Harness {
    registry: Arc<Mutex<Registry>>,
    port: Arc<FakeFreezePort>,
    kill: Arc<FakeKillPort>,
    freezer: Freezer,
}

fn harness() -> Harness {
    let mut tunables = Tunables::default();
    tunables.use_freezer = true;
    tunables.freeze_sample_rate = 0.0;
    tunables.freeze_debounce = Duration::from_millis(20);
    let tunables = shared(tunables);

    let registry = Arc::new(Mutex::new(Registry::new()));
    let port = Arc::new(FakeFreezePort::new());
    let kill = Arc::new(FakeKillPort::new());
    let freezer = Freezer::spawn(
        Arc::clone(&registry),
        tunables,
        port.clone(),
        kill.clone(),
        VecSink::new(),
        Sampler::with_seed(3),
    );
    freezer.enable(true);
    Harness {
        registry,
        port,
        kill,
        freezer,
    }
}

impl Harness {
    fn add_cached_worker(&self, name: &str, pid: i32) -> u64 {
        let mut registry = self.registry.lock();
        let key = registry.register_start(name, 20_000 + pid as u32).unwrap();
        registry.commit_start(key, pid).unwrap();
        let rec = registry.get_mut(key).unwrap();
        rec.cur_score = 940;
        rec.set_score = 940;
        key
    }

    fn is_frozen(&self, key: u64) -> bool {
        self.registry.lock().get(key).map(|r| r.frozen).unwrap_or(false)
    }

    fn wait_frozen(&self, key: u64) -> bool {
        wait_until(Duration::from_secs(2), || self.is_frozen(key))
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn debounced_freeze_lands() {
    let h = harness();
    let key = h.add_cached_worker("cached.a", 501);
    h.freezer.schedule_freeze(key);
    assert!(h.wait_frozen(key));
    assert!(h.port.is_frozen(501));
    assert!(h.port.is_ipc_frozen(501));
}

#[test]
fn file_locks_abort_the_freeze() {
    let h = harness();
    let key = h.add_cached_worker("locked", 502);
    h.port.set_file_locks(502, true);
    h.freezer.schedule_freeze(key);
    h.freezer.flush();
    std::thread::sleep(Duration::from_millis(100));
    assert!(!h.is_frozen(key));
    assert!(!h.port.is_frozen(502));
    assert!(h.port.transitions().is_empty(), "no OS freeze should be attempted");
}

#[test]
fn late_file_lock_reverses_the_freeze() {
    let h = harness();
    let key = h.add_cached_worker("racy", 503);
    h.port.set_late_file_lock(503);
    h.freezer.schedule_freeze(key);

    // The freeze lands and is immediately reversed by the post-check.
    assert!(wait_until(Duration::from_secs(2), || {
        h.port.transitions() == vec![(503, true), (503, false)]
    }));
    assert!(!h.is_frozen(key));
    assert!(!h.kill.killed(503), "a raced lock reverses, never kills");
}

#[test]
fn process_out_of_band_is_not_frozen() {
    let h = harness();
    let key = h.add_cached_worker("busy", 504);
    // Climbs out of the cached band before the debounce fires.
    h.registry.lock().get_mut(key).unwrap().cur_score = 200;
    h.freezer.schedule_freeze(key);
    std::thread::sleep(Duration::from_millis(100));
    assert!(!h.is_frozen(key));
}

#[test]
fn do_not_freeze_override_is_honored() {
    let h = harness();
    let key = h.add_cached_worker("pinned", 505);
    h.registry.lock().get_mut(key).unwrap().do_not_freeze = true;
    h.freezer.schedule_freeze(key);
    std::thread::sleep(Duration::from_millis(100));
    assert!(!h.is_frozen(key));
}

#[test]
fn sync_traffic_while_frozen_kills() {
    let h = harness();
    let key = h.add_cached_worker("tainted", 506);
    h.freezer.schedule_freeze(key);
    assert!(h.wait_frozen(key));

    h.port.set_traffic(506, FreezeTraffic::SYNC_RECEIVED);
    h.freezer.unfreeze(key);
    assert!(h.kill.killed(506));
    assert!(h.registry.lock().get(key).unwrap().killed);
}

#[test]
fn async_traffic_while_frozen_only_logs() {
    let h = harness();
    let key = h.add_cached_worker("mild", 507);
    h.freezer.schedule_freeze(key);
    assert!(h.wait_frozen(key));

    h.port.set_traffic(507, FreezeTraffic::ASYNC_RECEIVED);
    h.freezer.unfreeze(key);
    assert!(!h.kill.killed(507));
    assert!(!h.is_frozen(key));
}

#[test]
fn ipc_freeze_failure_kills() {
    let h = harness();
    let key = h.add_cached_worker("broken", 508);
    h.port.fail_ipc_freeze(508);
    h.freezer.schedule_freeze(key);
    assert!(wait_until(Duration::from_secs(2), || h.kill.killed(508)));
}

#[test]
fn freeze_info_failure_kills_on_unfreeze() {
    let h = harness();
    let key = h.add_cached_worker("opaque", 509);
    h.freezer.schedule_freeze(key);
    assert!(h.wait_frozen(key));

    h.port.fail_freeze_info(509);
    h.freezer.unfreeze(key);
    assert!(h.kill.killed(509));
}

#[test]
fn unfreeze_temporarily_rearms_the_freeze() {
    let h = harness();
    let key = h.add_cached_worker("bounced", 510);
    h.freezer.schedule_freeze(key);
    assert!(h.wait_frozen(key));

    h.freezer.unfreeze_temporarily(key);
    assert!(!h.is_frozen(key), "thaw is synchronous");
    // The debounced freeze comes back on its own.
    assert!(h.wait_frozen(key));
}

#[test]
fn disable_thaws_everything_before_returning() {
    let h = harness();
    let keys: Vec<u64> = (0..3)
        .map(|i| h.add_cached_worker(&format!("group.{i}"), 520 + i))
        .collect();
    for &key in &keys {
        h.freezer.schedule_freeze(key);
    }
    for &key in &keys {
        assert!(h.wait_frozen(key));
    }

    assert!(h.freezer.enable(false));
    // The disable call itself already thawed all three.
    for &key in &keys {
        assert!(!h.is_frozen(key));
    }
    assert!(!h.freezer.is_enabled());

    // While disabled, nothing freezes.
    h.freezer.schedule_freeze(keys[0]);
    std::thread::sleep(Duration::from_millis(100));
    assert!(!h.is_frozen(keys[0]));
}

#[test]
fn refcounted_enable_balances() {
    let h = harness();
    // harness() already enabled once: count is zero.
    assert!(h.freezer.is_enabled());
    assert!(h.freezer.enable(false));
    assert!(h.freezer.enable(false));
    assert!(!h.freezer.is_enabled());
    assert!(h.freezer.enable(true));
    assert!(!h.freezer.is_enabled(), "still one disable outstanding");
    assert!(h.freezer.enable(true));
    assert!(h.freezer.is_enabled());
    // One enable too many is rejected and clamped.
    assert!(!h.freezer.enable(true));
    assert!(h.freezer.is_enabled());
}

#[test]
fn disabled_subsystem_rejects_enable_calls() {
    let mut tunables = Tunables::default();
    tunables.use_freezer = false;
    let registry = Arc::new(Mutex::new(Registry::new()));
    let freezer = Freezer::spawn(
        registry,
        shared(tunables),
        Arc::new(FakeFreezePort::new()),
        Arc::new(FakeKillPort::new()),
        VecSink::new(),
        Sampler::with_seed(3),
    );
    assert!(!freezer.enable(true));
    assert!(!freezer.is_enabled());
}
