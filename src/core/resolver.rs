use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::RebalanceConfig;
use crate::core::arrival_rate::ArrivalRate;
use crate::core::assignment_store::{self, AssignmentRow};
use crate::core::backend::Backend;
use crate::metrics;

/// The concurrent `metric -> Backend` mapping, its three selection policies,
/// the per-metric arrival-rate registry, and the rebalancing control loop
/// (spec §4.4). This is the core of the system.
///
/// Two named critical sections guard the mutable state (spec §5):
/// - `assignments` ("M") protects the metric->Backend map.
/// - `metric_rates` ("R") protects the per-metric ArrivalRate registry.
/// Whenever both are needed, the locking order is always R then M.
pub struct Resolver {
    server_index: Vec<Arc<Backend>>,
    assignments: Mutex<HashMap<String, Arc<Backend>>>,
    metric_rates: Mutex<HashMap<String, Arc<ArrivalRate>>>,
    assignment_path: Option<PathBuf>,
    balance_until: Instant,
    rebalance: RebalanceConfig,
}

impl Resolver {
    /// Builds the immutable ServerIndex from `backends` (construction order
    /// *is* index order, per spec §3), then loads any existing assignment
    /// file. The backend set is fixed for the resolver's lifetime — no
    /// dynamic discovery (spec §1 non-goals).
    pub fn new(
        backends: Vec<Backend>,
        assignment_path: Option<PathBuf>,
        rebalance: RebalanceConfig,
    ) -> Arc<Self> {
        let server_index: Vec<Arc<Backend>> = backends.into_iter().map(Arc::new).collect();
        let balance_until = Instant::now() + Duration::from_secs(rebalance.balance_until_secs);

        let resolver = Arc::new(Resolver {
            server_index,
            assignments: Mutex::new(HashMap::new()),
            metric_rates: Mutex::new(HashMap::new()),
            assignment_path,
            balance_until,
            rebalance,
        });

        if let Some(path) = resolver.assignment_path.clone() {
            resolver.load_assignments(&path);
        }

        resolver
    }

    pub fn server_index(&self) -> &[Arc<Backend>] {
        &self.server_index
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.lock().unwrap().len()
    }

    pub fn assignment_for(&self, metric: &str) -> Option<Arc<Backend>> {
        self.assignments.lock().unwrap().get(metric).cloned()
    }

    // ---- Selection policies (spec §4.4) ----------------------------------

    /// Ascending by `arrivalRate()`, first up backend wins ties (ServerIndex
    /// order). `None` if no backend is up.
    fn least_loaded_up(&self) -> Option<Arc<Backend>> {
        self.first_extremum(false)
    }

    /// Uniformly sample a ServerIndex slot, rejecting down backends and the
    /// optional `except` backend, retrying up to N times.
    fn random_up(&self, except: Option<&Arc<Backend>>) -> Option<Arc<Backend>> {
        let n = self.server_index.len();
        if n == 0 {
            return None;
        }
        let mut rng = rand::rng();
        for _ in 0..n {
            let idx = rng.random_range(0..n);
            let candidate = &self.server_index[idx];
            if !candidate.is_up() {
                continue;
            }
            if let Some(ex) = except {
                if candidate.as_ref() == ex.as_ref() {
                    continue;
                }
            }
            return Some(candidate.clone());
        }
        None
    }

    /// `i = map_size mod N`; falls back to `RandomUp(nil)` if that slot is
    /// down.
    fn round_robin_up(&self, map_size: usize) -> Option<Arc<Backend>> {
        let n = self.server_index.len();
        if n == 0 {
            return None;
        }
        let idx = map_size % n;
        let candidate = &self.server_index[idx];
        if candidate.is_up() {
            Some(candidate.clone())
        } else {
            self.random_up(None)
        }
    }

    /// Returns the first backend achieving the min (`want_max = false`) or
    /// max (`want_max = true`) `arrivalRate()` among up backends, breaking
    /// ties by earliest ServerIndex position. `None` if none are up.
    fn first_extremum(&self, want_max: bool) -> Option<Arc<Backend>> {
        let mut best: Option<(&Arc<Backend>, f64)> = None;
        for backend in &self.server_index {
            if !backend.is_up() {
                continue;
            }
            let rate = backend.arrival_rate();
            best = match best {
                None => Some((backend, rate)),
                Some((_, best_rate)) if (want_max && rate > best_rate) || (!want_max && rate < best_rate) => {
                    Some((backend, rate))
                }
                other => other,
            };
        }
        best.map(|(b, _)| b.clone())
    }

    fn arrival_rate_for(&self, metric: &str) -> Arc<ArrivalRate> {
        let mut registry = self.metric_rates.lock().unwrap();
        registry.entry(metric.to_string()).or_insert_with(|| Arc::new(ArrivalRate::new())).clone()
    }

    // ---- Public operations (spec §4.4) ------------------------------------

    /// Used by the forwarding path for ingest (data) requests.
    pub fn get_host_port_key_ingest(&self, metric: &str) -> Option<Arc<Backend>> {
        if metric.is_empty() {
            // Step 2: full early return, no assignment recorded, no
            // backend-level arrived() call.
            return self.random_up(None);
        }

        self.arrival_rate_for(metric).arrived();

        let chosen = {
            let mut assignments = self.assignments.lock().unwrap();
            match assignments.get(metric).cloned() {
                Some(backend) if backend.is_up() => Some(backend),
                Some(_down) => {
                    let replacement = self.least_loaded_up();
                    if let Some(r) = &replacement {
                        assignments.insert(metric.to_string(), r.clone());
                    }
                    replacement
                }
                None => {
                    let picked = self.round_robin_up(assignments.len());
                    if let Some(p) = &picked {
                        assignments.insert(metric.to_string(), p.clone());
                    }
                    picked
                }
            }
        };

        let resolved = self.fallback_scan_if_needed(metric, chosen, true);

        if let Some(backend) = &resolved {
            backend.arrived();
        }
        resolved
    }

    /// Used by the forwarding path for non-ingest requests (e.g. "version").
    /// Differs from the ingest path in that it never touches the per-metric
    /// ArrivalRate registry, falls back to `RandomUp` instead of
    /// RoundRobin/LeastLoaded, and only records a new binding via the final
    /// fallback scan.
    pub fn get_host_port_key(&self, metric: Option<&str>) -> Option<Arc<Backend>> {
        let metric = match metric {
            Some(m) if !m.is_empty() => m,
            _ => return self.random_up(None),
        };

        let existing = self.assignments.lock().unwrap().get(metric).cloned();
        let chosen = match existing {
            Some(backend) if backend.is_up() => Some(backend),
            _ => self.random_up(None),
        };

        let resolved = self.fallback_scan_if_needed(metric, chosen, false);

        if let Some(backend) = &resolved {
            backend.arrived();
        }
        resolved
    }

    /// Step 4 of both public operations: if `chosen` is nil or down, scan
    /// ServerIndex in order for any up backend, persisting the binding when
    /// `metric` is non-empty (always true for callers here, kept as a
    /// parameter to mirror the spec's conditional wording).
    fn fallback_scan_if_needed(
        &self,
        metric: &str,
        chosen: Option<Arc<Backend>>,
        _ingest: bool,
    ) -> Option<Arc<Backend>> {
        match &chosen {
            Some(backend) if backend.is_up() => chosen,
            _ => {
                let found = self.server_index.iter().find(|b| b.is_up()).cloned();
                if let Some(backend) = &found {
                    let mut assignments = self.assignments.lock().unwrap();
                    assignments.insert(metric.to_string(), backend.clone());
                }
                found
            }
        }
    }

    // ---- Rebalancing (spec §4.4) ------------------------------------------

    fn metrics_by_ascending_rate(&self, assignments: &HashMap<String, Arc<Backend>>, registry: &HashMap<String, Arc<ArrivalRate>>) -> Vec<String> {
        let mut metrics: Vec<String> = assignments.keys().cloned().collect();
        metrics.sort_by(|a, b| {
            let ra = registry.get(a).map(|r| r.rate()).unwrap_or(0.0);
            let rb = registry.get(b).map(|r| r.rate()).unwrap_or(0.0);
            ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
        });
        metrics
    }

    /// One-shot full reassignment, scheduled at start-up + 5 min. Clears the
    /// map and re-stripes every known metric across backends via
    /// RoundRobinUp, ordered by ascending per-metric rate so the resulting
    /// stripe is rate-stratified.
    pub fn rebalance_all_metrics(&self) {
        let registry = self.metric_rates.lock().unwrap();
        let mut assignments = self.assignments.lock().unwrap();

        let ordered = self.metrics_by_ascending_rate(&assignments, &registry);
        let before = ordered.len();
        assignments.clear();

        let mut dropped = 0usize;
        for metric in ordered {
            let size = assignments.len();
            match self.round_robin_up(size) {
                Some(backend) => {
                    assignments.insert(metric, backend);
                }
                None => {
                    // No backend up at all; the metric is dropped rather
                    // than pinned to nothing. See SPEC_FULL.md §4.4 for why
                    // this is an intentional departure from P2 in that
                    // all-down edge case.
                    dropped += 1;
                }
            }
        }

        metrics::REASSIGNMENTS_TOTAL.with_label_values(&["full"]).inc_by(before as u64);
        self.publish_assignment_metrics(&assignments);

        log::info!(
            "rebalanceAllMetrics: restriped {} of {} metrics across {} backends ({} dropped, no backend up)",
            assignments.len(),
            before,
            self.server_index.len(),
            dropped,
        );
    }

    /// Publishes the overall map size, the per-backend assignment counts,
    /// and arrival rates (spec §4.9). Called after any pass that mutates
    /// `assignments`.
    fn publish_assignment_metrics(&self, assignments: &HashMap<String, Arc<Backend>>) {
        metrics::ASSIGNMENTS_TOTAL.set(assignments.len() as f64);

        let mut counts: HashMap<String, u64> = HashMap::new();
        for backend in assignments.values() {
            *counts.entry(backend.addr()).or_insert(0) += 1;
        }
        for backend in &self.server_index {
            let addr = backend.addr();
            metrics::BACKEND_ASSIGNMENTS_TOTAL
                .with_label_values(&[&addr])
                .set(*counts.get(&addr).unwrap_or(&0) as f64);
            metrics::BACKEND_ARRIVAL_RATE.with_label_values(&[&addr]).set(backend.arrival_rate());
        }
    }

    /// Fixed-delay incremental rebalance. A no-op once `now >= balanceUntil`
    /// (spec: the task stays scheduled but becomes a no-op past the
    /// deadline).
    pub fn balance(&self) {
        if Instant::now() >= self.balance_until {
            return;
        }

        let registry = self.metric_rates.lock().unwrap();
        let mut assignments = self.assignments.lock().unwrap();

        let up: Vec<&Arc<Backend>> = self.server_index.iter().filter(|b| b.is_up()).collect();
        if up.is_empty() {
            return;
        }

        let (most_used, _) = up
            .iter()
            .copied()
            .fold(None, |acc: Option<(&Arc<Backend>, f64)>, b| {
                let r = b.arrival_rate();
                match acc {
                    Some((_, best)) if r <= best => acc,
                    _ => Some((b, r)),
                }
            })
            .unwrap();
        let (least_used, _) = up
            .iter()
            .copied()
            .fold(None, |acc: Option<(&Arc<Backend>, f64)>, b| {
                let r = b.arrival_rate();
                match acc {
                    Some((_, best)) if r >= best => acc,
                    _ => Some((b, r)),
                }
            })
            .unwrap();

        let avg = up.iter().map(|b| b.arrival_rate()).sum::<f64>() / up.len() as f64;

        if most_used.arrival_rate() <= 1.05 * avg {
            return;
        }

        let mut delta_high = (most_used.arrival_rate() - avg) * 0.1;
        let mut delta_low = (avg - least_used.arrival_rate()) * 0.1;

        let ordered = self.metrics_by_ascending_rate(&assignments, &registry);
        let metrics_count = ordered.len();
        let skip = metrics_count / 2 + 1;
        let candidates: Vec<String> = ordered.into_iter().skip(skip).collect();

        let n = self.server_index.len();
        let max_to_reassign = ((0.20 * metrics_count as f64 / n as f64).round()) as usize;

        let mut num_reassigned = 0usize;
        for metric in candidates {
            if delta_high <= 0.0 || num_reassigned >= max_to_reassign {
                break;
            }

            let pinned_to_most_used = match assignments.get(&metric) {
                Some(b) => b.as_ref() == most_used.as_ref(),
                None => false,
            };
            if !pinned_to_most_used {
                continue;
            }

            let metric_rate = registry.get(&metric).map(|r| r.rate()).unwrap_or(0.0);

            if delta_high > 0.0 {
                assignments.insert(metric, least_used.clone());
                delta_high -= metric_rate;
                delta_low -= metric_rate;
                num_reassigned += 1;
            } else {
                // Unreachable given the loop guard above (`delta_high <= 0.0`
                // already breaks the loop); preserved per SPEC_FULL.md §9 for
                // fidelity to the source algorithm rather than deleted.
                if let Some(alt) = self.random_up(Some(most_used)) {
                    assignments.insert(metric, alt);
                    delta_high -= metric_rate;
                    num_reassigned += 1;
                }
            }
        }

        let _ = delta_low; // tracked per spec step 3/5 bookkeeping; not read after the loop
        if num_reassigned > 0 {
            metrics::REASSIGNMENTS_TOTAL.with_label_values(&["incremental"]).inc_by(num_reassigned as u64);
        }
        self.publish_assignment_metrics(&assignments);
        log::info!(
            "balance: reassigned {} metrics from {} to {}",
            num_reassigned,
            most_used.addr(),
            least_used.addr(),
        );
    }

    // ---- Persistence (spec §4.3) -------------------------------------------

    fn load_assignments(&self, path: &Path) {
        let rows = assignment_store::read_rows(path);
        let mut assignments = self.assignments.lock().unwrap();
        for row in rows {
            let existing = self
                .server_index
                .iter()
                .find(|b| b.host == row.host && b.tcp_port == row.tcp_port)
                .cloned();
            let backend = existing.or_else(|| self.round_robin_up(assignments.len()));
            if let Some(backend) = backend {
                assignments.insert(row.metric, backend);
            }
        }
    }

    /// Snapshot and write the assignment store under the same R-then-M
    /// exclusive sections rebalancing uses, so the snapshot is internally
    /// consistent.
    pub fn write_assignments(&self) -> std::io::Result<()> {
        let Some(path) = self.assignment_path.clone() else {
            return Ok(());
        };
        let registry = self.metric_rates.lock().unwrap();
        let assignments = self.assignments.lock().unwrap();

        let rows: Vec<AssignmentRow> = assignments
            .iter()
            .map(|(metric, backend)| AssignmentRow {
                metric: metric.clone(),
                host: backend.host.clone(),
                tcp_port: backend.tcp_port,
                rate: registry.get(metric).map(|r| r.rate()).unwrap_or(0.0),
            })
            .collect();

        assignment_store::write_rows(&path, &rows)
    }

    // ---- Scheduling (spec §4.4, §5) ----------------------------------------

    /// Spawns the three independent background timers. Each catches its own
    /// failures and logs; none can kill the others or the process. Dropping
    /// the returned handles (or the resolver's containing task) stops them;
    /// an in-flight pass always runs to completion since neither pass yields
    /// while holding `assignments`/`metric_rates`.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let resolver = self.clone();
        let full_reassign_after = Duration::from_secs(self.rebalance.full_reassign_after_secs);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(full_reassign_after).await;
            resolver.rebalance_all_metrics();
        }));

        let resolver = self.clone();
        let balance_start_after = Duration::from_secs(self.rebalance.balance_start_after_secs);
        let balance_period = Duration::from_secs(self.rebalance.balance_period_secs);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(balance_start_after).await;
            let mut ticker = tokio::time::interval(balance_period);
            loop {
                ticker.tick().await;
                resolver.balance();
            }
        }));

        let resolver = self.clone();
        let persist_start_after = Duration::from_secs(self.rebalance.persist_start_after_secs);
        let persist_period = Duration::from_secs(self.rebalance.persist_period_secs);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(persist_start_after).await;
            let mut ticker = tokio::time::interval(persist_period);
            loop {
                ticker.tick().await;
                if let Err(e) = resolver.write_assignments() {
                    log::error!("failed to persist assignments: {}", e);
                }
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn three_backends() -> Vec<Backend> {
        vec![Backend::new("h1", 1001), Backend::new("h2", 1002), Backend::new("h3", 1003)]
    }

    fn resolver(backends: Vec<Backend>) -> Arc<Resolver> {
        Resolver::new(backends, None, RebalanceConfig::default())
    }

    // Scenario 1: empty bootstrap.
    #[test]
    fn empty_bootstrap_round_robins_from_zero() {
        let r = resolver(three_backends());
        let b = r.get_host_port_key_ingest("cpu").unwrap();
        assert_eq!((b.host.as_str(), b.tcp_port), ("h1", 1001));
        assert_eq!(r.assignment_for("cpu").unwrap().host, "h1");
    }

    // Scenario 2: round-robin striping.
    #[test]
    fn round_robin_stripes_across_backends() {
        let r = resolver(three_backends());
        let cpu = r.get_host_port_key_ingest("cpu").unwrap();
        let mem = r.get_host_port_key_ingest("mem").unwrap();
        let disk = r.get_host_port_key_ingest("disk").unwrap();
        let net = r.get_host_port_key_ingest("net").unwrap();

        assert_eq!((cpu.host.as_str(), cpu.tcp_port), ("h1", 1001));
        assert_eq!((mem.host.as_str(), mem.tcp_port), ("h2", 1002));
        assert_eq!((disk.host.as_str(), disk.tcp_port), ("h3", 1003));
        assert_eq!((net.host.as_str(), net.tcp_port), ("h1", 1001));
    }

    // Scenario 3: down-host rebinding on read.
    #[test]
    fn down_host_is_replaced_by_least_loaded_up() {
        let r = resolver(three_backends());
        r.get_host_port_key_ingest("cpu").unwrap(); // pins to h1
        r.get_host_port_key_ingest("mem").unwrap(); // pins to h2
        r.get_host_port_key_ingest("disk").unwrap(); // pins to h3

        for b in r.server_index() {
            if b.host == "h1" {
                b.set_up(false);
            }
        }

        let replacement = r.get_host_port_key_ingest("cpu").unwrap();
        assert_ne!(replacement.host, "h1");
        assert_eq!(r.assignment_for("cpu").unwrap().host, replacement.host);
    }

    #[test]
    fn empty_metric_name_never_records_an_assignment() {
        let r = resolver(three_backends());
        let backend = r.get_host_port_key_ingest("");
        assert!(backend.is_some());
        assert_eq!(r.assignment_count(), 0);
    }

    #[test]
    fn non_ingest_path_does_not_touch_per_metric_rate_on_miss() {
        let r = resolver(three_backends());
        // getHostPortKey with no metric name is the common RelayHandler call
        // shape: a pure RandomUp, no binding recorded.
        let backend = r.get_host_port_key(None);
        assert!(backend.is_some());
        assert_eq!(r.assignment_count(), 0);
    }

    #[test]
    fn non_ingest_path_falls_back_to_random_on_down_hit() {
        let r = resolver(three_backends());
        r.get_host_port_key_ingest("cpu").unwrap(); // pins to h1
        for b in r.server_index() {
            if b.host == "h1" {
                b.set_up(false);
            }
        }
        // getHostPortKey("cpu") sees a down hit and falls back to RandomUp,
        // not LeastLoaded/RoundRobin.
        let backend = r.get_host_port_key(Some("cpu")).unwrap();
        assert!(backend.is_up());
    }

    // Scenario 4: rebalance threshold gate (P5).
    #[test]
    fn balance_is_noop_below_threshold() {
        let backends = three_backends();
        for _ in 0..100 {
            backends[0].arrived();
        }
        for _ in 0..100 {
            backends[1].arrived();
        }
        for _ in 0..104 {
            backends[2].arrived();
        }
        let r = resolver(backends);
        r.get_host_port_key_ingest("only").unwrap();
        let before = r.assignment_for("only");
        r.balance();
        assert_eq!(r.assignment_for("only"), before);
    }

    // Scenario 6: persistence round-trip.
    #[test]
    fn persistence_round_trips_existing_backends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.csv");

        let r1 = Resolver::new(three_backends(), Some(path.clone()), RebalanceConfig::default());
        r1.get_host_port_key_ingest("cpu").unwrap();
        r1.get_host_port_key_ingest("mem").unwrap();
        r1.get_host_port_key_ingest("disk").unwrap();
        r1.write_assignments().unwrap();

        let r2 = Resolver::new(three_backends(), Some(path), RebalanceConfig::default());
        for metric in ["cpu", "mem", "disk"] {
            assert_eq!(r2.assignment_for(metric).unwrap().host, r1.assignment_for(metric).unwrap().host);
        }
    }

    #[test]
    fn unknown_backend_in_store_is_rebound_via_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.csv");
        std::fs::write(&path, "metric,host,tcpPort,rate\nghost,unknown-host,9999,1.0\n").unwrap();

        let r = Resolver::new(three_backends(), Some(path), RebalanceConfig::default());
        // round_robin_up(0) picks index 0 -> h1
        assert_eq!(r.assignment_for("ghost").unwrap().host, "h1");
    }

    #[test]
    fn concurrent_ingest_calls_do_not_lose_arrivals() {
        // P7, exercised at the Resolver level: many callers hammering the
        // same metric must not panic or deadlock, and every call must
        // resolve to a backend.
        let r = resolver(three_backends());
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = r.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    assert!(r.get_host_port_key_ingest("hot_metric").is_some());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(r.assignment_count(), 1);
    }

    #[test]
    fn balance_never_moves_a_pin_off_a_backend_other_than_most_used() {
        // Rates: h1=200, h2=100, h3=100. 100 metrics, 60 on h1, 20 each on h2/h3.
        let backends = three_backends();
        for _ in 0..200 {
            backends[0].arrived();
        }
        for _ in 0..100 {
            backends[1].arrived();
        }
        for _ in 0..100 {
            backends[2].arrived();
        }
        let r = resolver(backends);

        {
            let mut assignments = r.assignments.lock().unwrap();
            let mut registry = r.metric_rates.lock().unwrap();
            for i in 0..100 {
                let metric = format!("m{i}");
                let backend = if i < 60 {
                    r.server_index()[0].clone()
                } else if i < 80 {
                    r.server_index()[1].clone()
                } else {
                    r.server_index()[2].clone()
                };
                assignments.insert(metric.clone(), backend);
                registry.insert(metric, Arc::new(ArrivalRate::new()));
            }
        }

        let before: HashMap<String, (String, u16)> = {
            let assignments = r.assignments.lock().unwrap();
            assignments.iter().map(|(m, b)| (m.clone(), (b.host.clone(), b.tcp_port))).collect()
        };

        r.balance();

        let mut moved = 0usize;
        let after = r.assignments.lock().unwrap();
        for (metric, (before_host, _)) in &before {
            let after_backend = after.get(metric).unwrap();
            if after_backend.host != *before_host {
                moved += 1;
                assert_eq!(before_host, "h1", "only pins on the most-used backend may move");
            }
        }
        assert!(moved <= 7, "P3: at most round(0.20 * 100 / 3) = 7 metrics may move, moved {moved}");
    }
}
