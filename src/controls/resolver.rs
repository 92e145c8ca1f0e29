//! resolver.rs
//! Decides which control policy is current and propagates every change.
//!
//! Precedence, strongest first:
//! 1. an unexpired server-pushed policy;
//! 2. an unexpired forced policy;
//! 3. the locally computed candidate, but only when its interval is strictly
//!    shorter than the current one (local heuristics only ratchet toward
//!    more frequent flushing).
//!
//! The first resolution and the resolution after a TTL lapse install the
//! candidate unconditionally; that is how an aggressive policy gets demoted.
//!
//! An accepted change, under the state lock: persist → publish to the
//! scheduler's watch channel → re-arm the TTL timer → fan out on the bus.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::controls::{
    bus::{PolicyBus, PolicyEvent},
    device::{DeviceState, DeviceStateProvider},
    policy::{ControlPolicy, PolicyOrigin, PolicyPresets, PolicyStore},
};
use crate::utils::{metrics::TransmissionMetrics, scheduled::ScheduledTask};

#[derive(Default)]
struct ResolverState {
    /// `None` until the first resolution.
    current: Option<ControlPolicy>,
    /// Latest server push, cleared once its TTL lapses.
    server: Option<ControlPolicy>,
    ttl_timer: Option<ScheduledTask>,
    /// Bumped on every install; lets a stale TTL timer recognise itself.
    generation: u64,
}

/// Why a policy was installed; logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallReason {
    Initial,
    ServerPolicy,
    Forced,
    MoreAggressive,
    Expired,
}

/// Pure precedence rule. `Some` means "install this".
pub fn decide(
    current: Option<&ControlPolicy>,
    current_expired: bool,
    server: Option<&ControlPolicy>,
    candidate: &ControlPolicy,
) -> Option<(ControlPolicy, InstallReason)> {
    if let Some(server) = server {
        let already = current.is_some_and(|c| c.origin == PolicyOrigin::Server && c.same_settings(server));
        if already && !current_expired {
            return None;
        }
        return Some((server.clone(), InstallReason::ServerPolicy));
    }

    let Some(current) = current else {
        return Some((candidate.clone(), InstallReason::Initial));
    };
    if current_expired {
        return Some((candidate.clone(), InstallReason::Expired));
    }
    if current.forced {
        return None;
    }
    if candidate.batch_interval_secs < current.batch_interval_secs {
        return Some((candidate.clone(), InstallReason::MoreAggressive));
    }
    None
}

pub struct ControlPolicyResolver {
    presets: PolicyPresets,
    device: Arc<dyn DeviceStateProvider>,
    store: Arc<dyn PolicyStore>,
    bus: Arc<PolicyBus>,
    metrics: Arc<TransmissionMetrics>,
    state: Mutex<ResolverState>,
    policy_tx: watch::Sender<ControlPolicy>,
    weak_self: Weak<ControlPolicyResolver>,
}

impl ControlPolicyResolver {
    /// Builds the resolver and restores a persisted policy if it is still live.
    pub fn new(
        presets: PolicyPresets,
        device: Arc<dyn DeviceStateProvider>,
        store: Arc<dyn PolicyStore>,
        bus: Arc<PolicyBus>,
        metrics: Arc<TransmissionMetrics>,
    ) -> Arc<Self> {
        let now = Utc::now();
        let (policy_tx, _) = watch::channel(presets.passive(now));

        let resolver = Arc::new_cyclic(|weak_self| Self {
            presets,
            device,
            store,
            bus,
            metrics,
            state: Mutex::new(ResolverState::default()),
            policy_tx,
            weak_self: weak_self.clone(),
        });
        resolver.restore(now);
        resolver
    }

    fn restore(&self, now: DateTime<Utc>) {
        let persisted = match self.store.load_policy() {
            Ok(p) => p,
            Err(e) => {
                warn!("[Resolver] failed to load persisted policy: {}", e);
                None
            }
        };
        let Some(policy) = persisted else { return };
        if policy.is_expired(now) {
            debug!("[Resolver] persisted {:?} policy already expired; ignoring", policy.origin);
            return;
        }

        info!(
            "[Resolver] restored {:?} policy: interval={}s batch={}",
            policy.origin, policy.batch_interval_secs, policy.batch_size
        );
        let mut state = self.state.lock();
        if policy.origin == PolicyOrigin::Server {
            state.server = Some(policy.clone());
        }
        state.current = Some(policy.clone());
        state.generation += 1;
        state.ttl_timer = self.arm_ttl(&policy, now, state.generation);
        self.policy_tx.send_replace(policy);
    }

    /// Re-evaluates against the live device state.
    pub fn resolve(&self) -> ControlPolicy {
        let device = self.device.snapshot();
        self.resolve_with(&device, None)
    }

    /// Re-evaluates against an explicit device state.
    /// `expired_generation` marks the current policy as lapsed when it matches.
    pub fn resolve_with(&self, device: &DeviceState, expired_generation: Option<u64>) -> ControlPolicy {
        let now = Utc::now();
        let candidate = if device.favours_aggressive() {
            self.presets.aggressive(now)
        } else {
            self.presets.passive(now)
        };

        let mut state = self.state.lock();
        let current_expired = match &state.current {
            Some(c) => c.is_expired(now) || expired_generation == Some(state.generation),
            None => false,
        };
        if current_expired
            && state.current.as_ref().is_some_and(|c| c.origin == PolicyOrigin::Server)
        {
            state.server = None;
        }
        if state.server.as_ref().is_some_and(|s| s.is_expired(now)) {
            state.server = None;
        }

        let decision = decide(state.current.as_ref(), current_expired, state.server.as_ref(), &candidate);
        match decision {
            Some((policy, reason)) => self.install(&mut state, policy, reason, now),
            None => {
                debug!(
                    "[Resolver] keeping current policy; candidate {:?} interval={}s rejected",
                    candidate.origin, candidate.batch_interval_secs
                );
                state.current.clone().unwrap_or(candidate)
            }
        }
    }

    /// Installs a server-pushed policy regardless of interval comparison.
    pub fn apply_server_policy(&self, mut policy: ControlPolicy) -> ControlPolicy {
        let now = Utc::now();
        policy.origin = PolicyOrigin::Server;
        policy.forced = false;
        policy.recorded_at = now;
        if policy.batch_size == 0 {
            policy.batch_size = self.presets.batch_size;
        }

        let mut state = self.state.lock();
        state.server = Some(policy.clone());
        self.install(&mut state, policy, InstallReason::ServerPolicy, now)
    }

    /// Installs a host-forced policy. It supersedes any server push until the
    /// server pushes again, and resists local candidates until its TTL lapses.
    pub fn force(&self, mut policy: ControlPolicy) -> ControlPolicy {
        let now = Utc::now();
        policy.origin = PolicyOrigin::Forced;
        policy.forced = true;
        policy.recorded_at = now;
        if policy.batch_size == 0 {
            policy.batch_size = self.presets.batch_size;
        }

        let mut state = self.state.lock();
        state.server = None;
        self.install(&mut state, policy, InstallReason::Forced, now)
    }

    /// Current policy, or the passive preset before the first resolution.
    pub fn current(&self) -> ControlPolicy {
        self.state
            .lock()
            .current
            .clone()
            .unwrap_or_else(|| self.presets.passive(Utc::now()))
    }

    /// Latest-value channel the scheduler drives its timer from.
    pub fn watch(&self) -> watch::Receiver<ControlPolicy> {
        self.policy_tx.subscribe()
    }

    pub fn bus(&self) -> &Arc<PolicyBus> {
        &self.bus
    }

    fn install(
        &self,
        state: &mut ResolverState,
        policy: ControlPolicy,
        reason: InstallReason,
        now: DateTime<Utc>,
    ) -> ControlPolicy {
        let previous = state.current.replace(policy.clone());

        if let Err(e) = self.store.save_policy(&policy) {
            warn!("[Resolver] failed to persist policy: {}", e);
        }

        // Timer reprogramming happens under the same lock as the swap.
        self.policy_tx.send_replace(policy.clone());

        state.generation += 1;
        state.ttl_timer = self.arm_ttl(&policy, now, state.generation);

        info!(
            "[Resolver] {:?}: {:?} interval={}s batch={} ttl={}s displacement={}m",
            reason,
            policy.origin,
            policy.batch_interval_secs,
            policy.batch_size,
            policy.ttl_secs,
            policy.minimum_displacement_m
        );
        self.metrics.record_policy_change();
        self.bus.publish(PolicyEvent::Changed {
            previous,
            current: policy.clone(),
        });
        policy
    }

    fn arm_ttl(&self, policy: &ControlPolicy, now: DateTime<Utc>, generation: u64) -> Option<ScheduledTask> {
        let remaining = policy.remaining_ttl(now)?;
        let weak = self.weak_self.clone();
        ScheduledTask::after(remaining, move || {
            if let Some(resolver) = weak.upgrade() {
                resolver.on_ttl_expired(generation);
            }
        })
    }

    fn on_ttl_expired(&self, generation: u64) {
        let expired = {
            let state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.current.clone()
        };
        if let Some(expired) = expired {
            info!("[Resolver] {:?} policy TTL lapsed; re-resolving", expired.origin);
            self.bus.publish(PolicyEvent::Expired { expired });
        }
        let device = self.device.snapshot();
        self.resolve_with(&device, Some(generation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::device::{NetworkState, NetworkType, PowerState, SharedDeviceState};
    use crate::pipeline::store::MemoryEventStore;

    fn policy(interval: u64, origin: PolicyOrigin, forced: bool) -> ControlPolicy {
        ControlPolicy {
            batch_interval_secs: interval,
            batch_size: 50,
            ttl_secs: 0,
            minimum_displacement_m: 30.0,
            origin,
            forced,
            recorded_at: Utc::now(),
        }
    }

    fn resolver_with(device: Arc<SharedDeviceState>, store: Arc<MemoryEventStore>) -> Arc<ControlPolicyResolver> {
        ControlPolicyResolver::new(
            PolicyPresets::default(),
            device,
            store,
            Arc::new(PolicyBus::default()),
            Arc::new(TransmissionMetrics::default()),
        )
    }

    fn charging() -> DeviceState {
        DeviceState {
            power: Some(PowerState { charging: true, full: false, battery_percent: 90.0 }),
            network: Some(NetworkState { connected: true, kind: NetworkType::Wifi }),
        }
    }

    #[test]
    fn decide_first_resolution_is_unconditional() {
        let candidate = policy(300, PolicyOrigin::Default, false);
        let (p, reason) = decide(None, false, None, &candidate).unwrap();
        assert_eq!(p.batch_interval_secs, 300);
        assert_eq!(reason, InstallReason::Initial);
    }

    #[test]
    fn decide_ratchets_only_toward_shorter_intervals() {
        let current = policy(300, PolicyOrigin::Default, false);
        assert!(decide(Some(&current), false, None, &policy(600, PolicyOrigin::Default, false)).is_none());
        assert!(decide(Some(&current), false, None, &policy(300, PolicyOrigin::Default, false)).is_none());
        let (p, reason) = decide(Some(&current), false, None, &policy(60, PolicyOrigin::Aggressive, false)).unwrap();
        assert_eq!(p.batch_interval_secs, 60);
        assert_eq!(reason, InstallReason::MoreAggressive);
    }

    #[test]
    fn decide_server_policy_overrides_regardless_of_interval() {
        let current = policy(5, PolicyOrigin::Aggressive, false);
        let server = policy(900, PolicyOrigin::Server, false);
        let candidate = policy(5, PolicyOrigin::Aggressive, false);
        let (p, reason) = decide(Some(&current), false, Some(&server), &candidate).unwrap();
        assert_eq!(p.batch_interval_secs, 900);
        assert_eq!(reason, InstallReason::ServerPolicy);
        // Already current: nothing to do.
        assert!(decide(Some(&server), false, Some(&server), &candidate).is_none());
    }

    #[test]
    fn decide_forced_policy_is_retained_until_expiry() {
        let forced = policy(120, PolicyOrigin::Forced, true);
        let candidate = policy(5, PolicyOrigin::Aggressive, false);
        assert!(decide(Some(&forced), false, None, &candidate).is_none());
        let (p, reason) = decide(Some(&forced), true, None, &candidate).unwrap();
        assert_eq!(p.batch_interval_secs, 5);
        assert_eq!(reason, InstallReason::Expired);
    }

    #[test]
    fn decide_expired_policy_can_be_demoted() {
        let current = policy(5, PolicyOrigin::Aggressive, false);
        let passive = policy(300, PolicyOrigin::Default, false);
        let (p, _) = decide(Some(&current), true, None, &passive).unwrap();
        assert_eq!(p.batch_interval_secs, 300);
    }

    #[tokio::test]
    async fn resolve_persists_and_notifies() {
        let device = Arc::new(SharedDeviceState::default());
        let store = Arc::new(MemoryEventStore::new());
        let resolver = resolver_with(device.clone(), store.clone());
        let rx = resolver.bus().subscribe();
        let mut watch = resolver.watch();

        let p = resolver.resolve();
        assert_eq!(p.origin, PolicyOrigin::Default);
        assert!(store.load_policy().unwrap().unwrap().same_settings(&p));
        assert!(matches!(rx.try_recv(), Ok(PolicyEvent::Changed { previous: None, .. })));
        assert!(watch.has_changed().unwrap());
        assert_eq!(watch.borrow_and_update().batch_interval_secs, 300);

        // Passive again: no change, no notification.
        resolver.resolve();
        assert!(rx.try_recv().is_err());

        let p = resolver.resolve_with(&charging(), None);
        assert_eq!(p.origin, PolicyOrigin::Aggressive);
        assert!(matches!(rx.try_recv(), Ok(PolicyEvent::Changed { previous: Some(_), .. })));
        assert_eq!(watch.borrow_and_update().batch_interval_secs, 5);
    }

    #[tokio::test]
    async fn aggressive_is_not_downgraded_by_passive_candidate() {
        let resolver = resolver_with(Arc::new(SharedDeviceState::default()), Arc::new(MemoryEventStore::new()));
        resolver.resolve_with(&charging(), None);
        let p = resolver.resolve_with(&DeviceState::default(), None);
        assert_eq!(p.origin, PolicyOrigin::Aggressive);
    }

    #[tokio::test]
    async fn server_policy_wins_over_local_candidates_while_live() {
        let resolver = resolver_with(Arc::new(SharedDeviceState::default()), Arc::new(MemoryEventStore::new()));
        resolver.resolve();
        let mut server = policy(600, PolicyOrigin::Server, false);
        server.ttl_secs = 3600;
        let p = resolver.apply_server_policy(server);
        assert_eq!(p.batch_interval_secs, 600);

        // Even a more aggressive local candidate is ignored.
        let p = resolver.resolve_with(&charging(), None);
        assert_eq!(p.batch_interval_secs, 600);
        assert_eq!(p.origin, PolicyOrigin::Server);
    }

    #[tokio::test]
    async fn forced_policy_supersedes_server_and_resists_candidates() {
        let resolver = resolver_with(Arc::new(SharedDeviceState::default()), Arc::new(MemoryEventStore::new()));
        resolver.apply_server_policy(policy(600, PolicyOrigin::Server, false));
        let mut live = policy(30, PolicyOrigin::Default, false);
        live.ttl_secs = 900;
        let p = resolver.force(live);
        assert!(p.forced);
        assert_eq!(p.origin, PolicyOrigin::Forced);
        let p = resolver.resolve_with(&charging(), None);
        assert_eq!(p.batch_interval_secs, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_demotes_aggressive_policy() {
        let device = Arc::new(SharedDeviceState::default());
        let resolver = resolver_with(device.clone(), Arc::new(MemoryEventStore::new()));
        let rx = resolver.bus().subscribe();

        let p = resolver.resolve_with(&charging(), None);
        assert_eq!(p.origin, PolicyOrigin::Aggressive);
        let ttl = p.ttl().unwrap();
        let _ = rx.try_recv();

        // Device is now unknown → passive candidate once the TTL lapses.
        tokio::time::sleep(ttl + std::time::Duration::from_secs(1)).await;
        assert!(matches!(rx.try_recv(), Ok(PolicyEvent::Expired { .. })));
        assert!(matches!(rx.try_recv(), Ok(PolicyEvent::Changed { .. })));
        assert_eq!(resolver.current().origin, PolicyOrigin::Default);
    }

    #[tokio::test]
    async fn restores_live_persisted_policy() {
        let store = Arc::new(MemoryEventStore::new());
        let mut server = policy(45, PolicyOrigin::Server, false);
        server.ttl_secs = 3600;
        store.save_policy(&server).unwrap();

        let resolver = resolver_with(Arc::new(SharedDeviceState::default()), store);
        assert_eq!(resolver.current().batch_interval_secs, 45);
        assert_eq!(resolver.watch().borrow().batch_interval_secs, 45);
        // Server slot restored too: local candidates cannot displace it.
        assert_eq!(resolver.resolve_with(&charging(), None).batch_interval_secs, 45);
    }

    #[tokio::test]
    async fn ignores_expired_persisted_policy() {
        let store = Arc::new(MemoryEventStore::new());
        let mut stale = policy(45, PolicyOrigin::Server, false);
        stale.ttl_secs = 10;
        stale.recorded_at = Utc::now() - chrono::Duration::seconds(60);
        store.save_policy(&stale).unwrap();

        let resolver = resolver_with(Arc::new(SharedDeviceState::default()), store);
        assert_eq!(resolver.resolve().batch_interval_secs, 300);
    }
}
