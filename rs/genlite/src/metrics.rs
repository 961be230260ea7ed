//! Rate limiter and metrics aggregator, sharing one lock because every
//! inbound frame touches both on ingress.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::role::Role;

/// One of the five buckets a frame's `action` maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Class {
    Chat,
    Video,
    Search,
    Simulation,
    Other,
}

impl Class {
    pub fn as_str(&self) -> &'static str {
        match self {
            Class::Chat => "chat",
            Class::Video => "video",
            Class::Search => "search",
            Class::Simulation => "simulation",
            Class::Other => "other",
        }
    }
}

fn rate_limit(role: Role, class: Class) -> u32 {
    match (role, class) {
        (Role::Anon, Class::Chat) => 90,
        (Role::Anon, Class::Video) => 30,
        (Role::Anon, Class::Search) => 45,
        (Role::Anon, Class::Simulation) => 45,
        (Role::Anon, Class::Other) => 45,

        (Role::Normal, Class::Chat) => 180,
        (Role::Normal, Class::Video) => 60,
        (Role::Normal, Class::Search) => 90,
        (Role::Normal, Class::Simulation) => 90,
        (Role::Normal, Class::Other) => 90,

        (Role::Pro, Class::Chat) => 300,
        (Role::Pro, Class::Video) => 120,
        (Role::Pro, Class::Search) => 180,
        (Role::Pro, Class::Simulation) => 180,
        (Role::Pro, Class::Other) => 180,

        (Role::Admin, Class::Chat) => 450,
        (Role::Admin, Class::Video) => 240,
        (Role::Admin, Class::Search) => 360,
        (Role::Admin, Class::Simulation) => 360,
        (Role::Admin, Class::Other) => 360,
    }
}

#[derive(Debug, Clone, Default)]
struct UserCounters {
    requests: HashMap<Class, u64>,
    role: Option<Role>,
    first_seen: Option<Instant>,
    last_active: Option<Instant>,
}

struct Inner {
    total_by_class: HashMap<Class, u64>,
    per_user: HashMap<Uuid, UserCounters>,
    ip_sessions: HashMap<String, HashSet<Uuid>>,
    minute_buckets: HashMap<Uuid, HashMap<i64, HashMap<Class, u32>>>,
    started_at: Instant,
}

/// Shared, lock-protected request accounting and per-(user, class) admission control.
#[derive(Clone)]
pub struct Metrics {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                total_by_class: HashMap::new(),
                per_user: HashMap::new(),
                ip_sessions: HashMap::new(),
                minute_buckets: HashMap::new(),
                started_at: Instant::now(),
            })),
        }
    }

    fn now_minute() -> i64 {
        // Instant has no wall-clock anchor; use a process-relative minute index.
        // This is sufficient since the limiter only ever compares minutes within
        // one process lifetime.
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        (epoch.as_secs() / 60) as i64
    }

    pub fn record_request(&self, user_id: Uuid, ip: &str, class: Class, role: Role) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let minute = Self::now_minute();

        *inner.total_by_class.entry(class).or_insert(0) += 1;

        let counters = inner.per_user.entry(user_id).or_default();
        counters.role = Some(role);
        counters.last_active = Some(now);
        counters.first_seen.get_or_insert(now);
        *counters.requests.entry(class).or_insert(0) += 1;

        let buckets = inner.minute_buckets.entry(user_id).or_default();
        *buckets.entry(minute).or_default().entry(class).or_insert(0) += 1;
        buckets.retain(|&m, _| minute - m <= 10);

        let _ = ip;
    }

    pub fn is_rate_limited(&self, user_id: Uuid, class: Class, role: Role) -> bool {
        if matches!(role, Role::Admin) {
            return false;
        }

        let inner = self.inner.lock().unwrap();
        let minute = Self::now_minute();
        let buckets = inner.minute_buckets.get(&user_id);

        let current = buckets
            .and_then(|b| b.get(&minute))
            .and_then(|c| c.get(&class))
            .copied()
            .unwrap_or(0) as f64;
        let previous = buckets
            .and_then(|b| b.get(&(minute - 1)))
            .and_then(|c| c.get(&class))
            .copied()
            .unwrap_or(0) as f64;

        let rate = 0.7 * current + 0.3 * previous;
        rate >= rate_limit(role, class) as f64
    }

    pub fn register_session(&self, user_id: Uuid, ip: &str) {
        let mut inner = self.inner.lock().unwrap();
        let set = inner.ip_sessions.entry(ip.to_string()).or_default();
        if !set.is_empty() {
            tracing::info!(ip, count = set.len() + 1, "multiple concurrent sessions from the same IP");
        }
        set.insert(user_id);
    }

    pub fn unregister_session(&self, user_id: Uuid, ip: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.ip_sessions.get_mut(ip) {
            set.remove(&user_id);
            if set.is_empty() {
                inner.ip_sessions.remove(ip);
            }
        }
    }

    /// Unauthenticated status summary.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let active_cutoff = Duration::from_secs(5 * 60);

        let mut active_by_role: HashMap<&'static str, u32> =
            [("anon", 0), ("normal", 0), ("pro", 0), ("admin", 0)].into_iter().collect();

        for counters in inner.per_user.values() {
            if let (Some(role), Some(last_active)) = (counters.role, counters.last_active) {
                if now.saturating_duration_since(last_active) <= active_cutoff {
                    *active_by_role.entry(role.as_str()).or_insert(0) += 1;
                }
            }
        }

        Snapshot {
            uptime_seconds: now.saturating_duration_since(inner.started_at).as_secs(),
            total_by_class: inner
                .total_by_class
                .iter()
                .map(|(c, n)| (c.as_str(), *n))
                .collect(),
            active_users_total: inner.per_user.len(),
            active_by_role,
            active_ips: inner.ip_sessions.len(),
        }
    }

    /// Detailed status, gated on a constant-time secret comparison by the caller.
    pub fn detailed_snapshot(&self) -> DetailedSnapshot {
        let snapshot = self.snapshot();
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let idle_cutoff = Duration::from_secs(3600);

        let mut users = Vec::new();
        for (user_id, counters) in inner.per_user.iter() {
            let Some(last_active) = counters.last_active else { continue };
            if now.saturating_duration_since(last_active) > idle_cutoff {
                continue;
            }
            let id = user_id.to_string();
            users.push(UserSummary {
                id: id.chars().take(8).collect::<String>() + "...",
                role: counters.role.map(|r| r.as_str()).unwrap_or("anon"),
                requests: counters.requests.iter().map(|(c, n)| (c.as_str(), *n)).collect(),
                idle_seconds: now.saturating_duration_since(last_active).as_secs(),
                session_seconds: counters
                    .first_seen
                    .map(|first| now.saturating_duration_since(first).as_secs())
                    .unwrap_or(0),
            });
        }

        DetailedSnapshot { snapshot, users }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
    pub uptime_seconds: u64,
    pub total_by_class: HashMap<&'static str, u64>,
    pub active_users_total: usize,
    pub active_by_role: HashMap<&'static str, u32>,
    pub active_ips: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UserSummary {
    pub id: String,
    pub role: &'static str,
    pub requests: HashMap<&'static str, u64>,
    pub idle_seconds: u64,
    pub session_seconds: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DetailedSnapshot {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub users: Vec<UserSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_is_always_admitted() {
        let metrics = Metrics::new();
        let user = Uuid::new_v4();
        for _ in 0..1000 {
            metrics.record_request(user, "1.2.3.4", Class::Video, Role::Admin);
        }
        assert!(!metrics.is_rate_limited(user, Class::Video, Role::Admin));
    }

    #[test]
    fn anon_video_burst_trips_the_blended_rate() {
        let metrics = Metrics::new();
        let user = Uuid::new_v4();
        // anon video limit is 30/minute; with no previous-minute traffic the
        // blended rate is 0.7*current, so it only reaches 30 once current
        // hits ceil(30/0.7) = 43 within the same minute.
        for _ in 0..42 {
            metrics.record_request(user, "1.2.3.4", Class::Video, Role::Anon);
        }
        assert!(!metrics.is_rate_limited(user, Class::Video, Role::Anon));
        metrics.record_request(user, "1.2.3.4", Class::Video, Role::Anon);
        assert!(metrics.is_rate_limited(user, Class::Video, Role::Anon));
    }

    #[test]
    fn session_registration_tracks_ip() {
        let metrics = Metrics::new();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        metrics.register_session(u1, "9.9.9.9");
        metrics.register_session(u2, "9.9.9.9");
        assert_eq!(metrics.snapshot().active_ips, 1);
        metrics.unregister_session(u1, "9.9.9.9");
        metrics.unregister_session(u2, "9.9.9.9");
        assert_eq!(metrics.snapshot().active_ips, 0);
    }

    #[test]
    fn detailed_snapshot_anonymizes_user_id() {
        let metrics = Metrics::new();
        let user = Uuid::new_v4();
        metrics.record_request(user, "1.2.3.4", Class::Chat, Role::Normal);
        let detail = metrics.detailed_snapshot();
        assert_eq!(detail.users.len(), 1);
        assert!(detail.users[0].id.ends_with("..."));
        assert_eq!(detail.users[0].id.len(), 11);
    }
}
