//! Distributed token-bucket rate limiting
//!
//! Buckets are keyed by (tenant, endpoint class) and live in the shared
//! counter store, so admission is serialized across gateway nodes. Tokens
//! are stored rather than derived from wall-clock windows, which makes
//! node clock skew harmless. On store failure read-class endpoints fail
//! open and write-class endpoints fail closed.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use deadpool_redis::Pool as RedisPool;
use serde::{Deserialize, Serialize};
use std::ops::DerefMut;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

/// Endpoint classification for admission decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Non-destructive reads; fail open when the store is down
    Read,
    /// State-changing endpoints; fail closed when the store is down
    Write,
}

impl EndpointClass {
    pub fn fails_open(self) -> bool {
        matches!(self, EndpointClass::Read)
    }
}

/// Admission decision
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Throttled { retry_after: Duration },
}

/// Token bucket parameters resolved from a tenant's rate plan
#[derive(Debug, Clone, Copy)]
pub struct BucketParams {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

/// Outcome of an atomic take against the store
#[derive(Debug, Clone, Copy)]
pub struct TakeOutcome {
    pub admitted: bool,
    /// Seconds until enough tokens accrue for the rejected cost
    pub retry_after_secs: f64,
}

/// Progressive penalty record for a bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PenaltyState {
    /// Requests before this instant are rejected outright
    pub until_epoch_ms: i64,
    /// Current offset; doubled on each violation up to the cap
    pub offset_ms: u64,
}

/// Shared counter store interface
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically decrement the bucket if enough tokens are present,
    /// refilling lazily from the stored timestamp.
    async fn take(&self, bucket: &str, cost: f64, params: BucketParams) -> Result<TakeOutcome>;

    async fn read_penalty(&self, bucket: &str) -> Result<Option<PenaltyState>>;

    async fn write_penalty(&self, bucket: &str, state: PenaltyState, ttl: Duration) -> Result<()>;

    async fn clear_penalty(&self, bucket: &str) -> Result<()>;

    /// Connectivity check used at startup and by the health surface
    async fn ping(&self) -> Result<()>;
}

/// Token bucket in Lua: state is a hash {tokens, stamp_ms}; refill is
/// computed from the store's own clock, decrement-if-positive is atomic.
/// Cold buckets seed at full capacity.
const TAKE_SCRIPT: &str = r#"
local key = KEYS[1]
local cost = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill = tonumber(ARGV[3])
local now = redis.call('TIME')
local now_ms = now[1] * 1000 + math.floor(now[2] / 1000)

local tokens = capacity
local stamp = now_ms
local state = redis.call('HMGET', key, 'tokens', 'stamp_ms')
if state[1] then
  tokens = tonumber(state[1])
  stamp = tonumber(state[2])
  local elapsed = math.max(now_ms - stamp, 0)
  tokens = math.min(capacity, tokens + elapsed / 1000.0 * refill)
end

local admitted = 0
local retry_after = 0
if tokens >= cost then
  tokens = tokens - cost
  admitted = 1
else
  retry_after = (cost - tokens) / refill
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'stamp_ms', tostring(now_ms))
redis.call('PEXPIRE', key, math.ceil(capacity / refill * 2000))
return {admitted, tostring(retry_after)}
"#;

/// Redis-backed counter store
pub struct RedisCounterStore {
    pool: RedisPool,
}

impl RedisCounterStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    pub fn connect(url: &str) -> Result<Self> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| Error::Store(format!("Failed to create counter store pool: {e}")))?;
        Ok(Self::new(pool))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Store(format!("Failed to get counter store connection: {e}")))
    }

    fn bucket_key(bucket: &str) -> String {
        format!("ratelimit:bucket:{bucket}")
    }

    fn penalty_key(bucket: &str) -> String {
        format!("ratelimit:penalty:{bucket}")
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn take(&self, bucket: &str, cost: f64, params: BucketParams) -> Result<TakeOutcome> {
        let mut conn = self.conn().await?;
        let (admitted, retry_after): (i64, String) = redis::Script::new(TAKE_SCRIPT)
            .key(Self::bucket_key(bucket))
            .arg(cost)
            .arg(params.capacity)
            .arg(params.refill_per_sec)
            .invoke_async(conn.deref_mut())
            .await?;
        Ok(TakeOutcome {
            admitted: admitted == 1,
            retry_after_secs: retry_after.parse().unwrap_or(1.0),
        })
    }

    async fn read_penalty(&self, bucket: &str) -> Result<Option<PenaltyState>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::penalty_key(bucket))
            .query_async(conn.deref_mut())
            .await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    async fn write_penalty(&self, bucket: &str, state: PenaltyState, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&state)
            .map_err(|e| Error::Store(format!("Penalty encoding failed: {e}")))?;
        let _: () = redis::cmd("SET")
            .arg(Self::penalty_key(bucket))
            .arg(payload)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(conn.deref_mut())
            .await?;
        Ok(())
    }

    async fn clear_penalty(&self, bucket: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL")
            .arg(Self::penalty_key(bucket))
            .query_async(conn.deref_mut())
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(conn.deref_mut()).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryBucket {
    tokens: f64,
    stamp: std::time::Instant,
}

/// In-process counter store for tests and store-less development. Not a
/// cross-node serialization point; production uses the Redis store.
#[derive(Default)]
pub struct InMemoryCounterStore {
    buckets: DashMap<String, Mutex<MemoryBucket>>,
    penalties: DashMap<String, (PenaltyState, std::time::Instant)>,
    /// When set, every operation fails; used to exercise fail-open/closed
    pub fail: std::sync::atomic::AtomicBool,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_failure(&self) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            Err(Error::Store("counter store unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn take(&self, bucket: &str, cost: f64, params: BucketParams) -> Result<TakeOutcome> {
        self.check_failure()?;
        let entry = self.buckets.entry(bucket.to_string()).or_insert_with(|| {
            Mutex::new(MemoryBucket { tokens: params.capacity, stamp: std::time::Instant::now() })
        });
        let mut state = entry.lock().expect("bucket lock");

        let elapsed = state.stamp.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * params.refill_per_sec).min(params.capacity);
        state.stamp = std::time::Instant::now();

        if state.tokens >= cost {
            state.tokens -= cost;
            Ok(TakeOutcome { admitted: true, retry_after_secs: 0.0 })
        } else {
            Ok(TakeOutcome {
                admitted: false,
                retry_after_secs: (cost - state.tokens) / params.refill_per_sec,
            })
        }
    }

    async fn read_penalty(&self, bucket: &str) -> Result<Option<PenaltyState>> {
        self.check_failure()?;
        Ok(self.penalties.get(bucket).and_then(|entry| {
            let (state, expires) = *entry;
            if std::time::Instant::now() < expires {
                Some(state)
            } else {
                None
            }
        }))
    }

    async fn write_penalty(&self, bucket: &str, state: PenaltyState, ttl: Duration) -> Result<()> {
        self.check_failure()?;
        self.penalties
            .insert(bucket.to_string(), (state, std::time::Instant::now() + ttl));
        Ok(())
    }

    async fn clear_penalty(&self, bucket: &str) -> Result<()> {
        self.check_failure()?;
        self.penalties.remove(bucket);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_failure()
    }
}

/// Per-tenant admission control over the counter store
pub struct RateLimiter {
    store: std::sync::Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: std::sync::Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn params_for(&self, plan: &str) -> BucketParams {
        let plan = self
            .config
            .plans
            .get(plan)
            .or_else(|| self.config.plans.get(&self.config.default_plan));
        match plan {
            Some(p) => BucketParams { capacity: p.capacity, refill_per_sec: p.refill_per_sec },
            // Unreachable with a validated config; stay permissive
            None => BucketParams { capacity: 60.0, refill_per_sec: 1.0 },
        }
    }

    fn bucket_name(tenant_id: &str, endpoint: &str) -> String {
        format!("{tenant_id}:{endpoint}")
    }

    /// Admit or throttle one request.
    ///
    /// An active penalty rejects the request without touching the bucket
    /// and doubles the penalty offset up to the cap. A throttle from the
    /// bucket itself starts (or extends) the penalty.
    pub async fn admit(
        &self,
        tenant_id: &str,
        rate_plan: &str,
        endpoint: &str,
        class: EndpointClass,
        cost: f64,
    ) -> Admission {
        let bucket = Self::bucket_name(tenant_id, endpoint);
        let params = self.params_for(rate_plan);
        let now_ms = Utc::now().timestamp_millis();

        let mut expired_penalty = false;
        if self.config.penalty_enabled {
            match self.store.read_penalty(&bucket).await {
                Ok(Some(penalty)) if penalty.until_epoch_ms > now_ms => {
                    return self.escalate_penalty(&bucket, penalty, now_ms).await;
                }
                Ok(Some(_)) => expired_penalty = true,
                Ok(None) => {}
                Err(e) => return self.store_failure(class, &e),
            }
        }

        match self.store.take(&bucket, cost, params).await {
            Ok(outcome) if outcome.admitted => {
                if expired_penalty {
                    // Served after the penalty expired; offsets start over
                    let _ = self.store.clear_penalty(&bucket).await;
                }
                Admission::Admitted
            }
            Ok(outcome) => {
                let bucket_wait = Duration::from_secs_f64(outcome.retry_after_secs.max(0.05));
                if !self.config.penalty_enabled {
                    return Admission::Throttled { retry_after: bucket_wait };
                }
                let offset_ms =
                    self.config.penalty_base_ms.max(bucket_wait.as_millis() as u64);
                let offset_ms = offset_ms.min(self.config.penalty_cap_ms);
                let penalty =
                    PenaltyState { until_epoch_ms: now_ms + offset_ms as i64, offset_ms };
                let _ = self
                    .store
                    .write_penalty(&bucket, penalty, penalty_ttl(offset_ms))
                    .await;
                Admission::Throttled { retry_after: Duration::from_millis(offset_ms) }
            }
            Err(e) => self.store_failure(class, &e),
        }
    }

    async fn escalate_penalty(
        &self,
        bucket: &str,
        penalty: PenaltyState,
        now_ms: i64,
    ) -> Admission {
        let offset_ms = (penalty.offset_ms.saturating_mul(2)).min(self.config.penalty_cap_ms);
        let escalated = PenaltyState { until_epoch_ms: now_ms + offset_ms as i64, offset_ms };
        let _ = self
            .store
            .write_penalty(bucket, escalated, penalty_ttl(offset_ms))
            .await;
        tracing::debug!(bucket, offset_ms, "Rate limit penalty escalated");
        Admission::Throttled { retry_after: Duration::from_millis(offset_ms) }
    }

    fn store_failure(&self, class: EndpointClass, error: &Error) -> Admission {
        if class.fails_open() {
            tracing::warn!(%error, "Counter store unavailable; admitting read-class request");
            Admission::Admitted
        } else {
            tracing::warn!(%error, "Counter store unavailable; rejecting write-class request");
            Admission::Throttled {
                retry_after: Duration::from_millis(self.config.store_failure_retry_ms),
            }
        }
    }
}

fn penalty_ttl(offset_ms: u64) -> Duration {
    // Keep the record past its active window so the doubling chain can
    // observe the previous offset
    Duration::from_millis(offset_ms.saturating_mul(4).max(1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn limiter(capacity: f64, refill: f64) -> (RateLimiter, Arc<InMemoryCounterStore>) {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut config = RateLimitConfig::default();
        config.plans.insert(
            "standard".to_string(),
            crate::config::RatePlanConfig { capacity, refill_per_sec: refill },
        );
        (RateLimiter::new(store.clone(), config), store)
    }

    #[tokio::test]
    async fn test_capacity_bounds_admissions() {
        let (limiter, _) = limiter(5.0, 1.0);
        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.admit("t2", "standard", "messages", EndpointClass::Write, 1.0).await
                == Admission::Admitted
            {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_throttle_carries_retry_after() {
        let (limiter, _) = limiter(1.0, 1.0);
        limiter.admit("t1", "standard", "messages", EndpointClass::Write, 1.0).await;
        match limiter.admit("t1", "standard", "messages", EndpointClass::Write, 1.0).await {
            Admission::Throttled { retry_after } => {
                assert!(retry_after >= Duration::from_millis(500));
            }
            Admission::Admitted => panic!("expected throttle"),
        }
    }

    #[tokio::test]
    async fn test_penalty_doubles_and_caps() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut config = RateLimitConfig::default();
        config.plans.insert(
            "standard".to_string(),
            crate::config::RatePlanConfig { capacity: 1.0, refill_per_sec: 1.0 },
        );
        config.penalty_base_ms = 1_000;
        config.penalty_cap_ms = 8_000;
        let limiter = RateLimiter::new(store.clone(), config);

        limiter.admit("t2", "standard", "messages", EndpointClass::Write, 1.0).await;

        // First violation starts the penalty
        let first = limiter.admit("t2", "standard", "messages", EndpointClass::Write, 1.0).await;
        assert!(matches!(first, Admission::Throttled { .. }));

        // Violations inside the penalty window double the offset without
        // touching the bucket
        let mut last = Duration::ZERO;
        for _ in 0..5 {
            match limiter.admit("t2", "standard", "messages", EndpointClass::Write, 1.0).await {
                Admission::Throttled { retry_after } => last = retry_after,
                Admission::Admitted => panic!("expected throttle during penalty"),
            }
        }
        assert_eq!(last, Duration::from_millis(8_000));
    }

    #[tokio::test]
    async fn test_store_failure_read_open_write_closed() {
        let (limiter, store) = limiter(5.0, 1.0);
        store.fail.store(true, Ordering::Relaxed);

        let read = limiter.admit("t1", "standard", "tools", EndpointClass::Read, 1.0).await;
        assert_eq!(read, Admission::Admitted);

        match limiter.admit("t1", "standard", "messages", EndpointClass::Write, 1.0).await {
            Admission::Throttled { retry_after } => assert!(retry_after > Duration::ZERO),
            Admission::Admitted => panic!("write-class must fail closed"),
        }
    }

    #[tokio::test]
    async fn test_buckets_are_isolated_per_tenant() {
        let (limiter, _) = limiter(1.0, 0.001);
        assert_eq!(
            limiter.admit("t1", "standard", "messages", EndpointClass::Write, 1.0).await,
            Admission::Admitted
        );
        assert_eq!(
            limiter.admit("t2", "standard", "messages", EndpointClass::Write, 1.0).await,
            Admission::Admitted
        );
    }
}
