use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    backend::BrokerStore, config::RedisConfig, types::after, JobId, JobRecord, JobState, LeaseToken,
    QueueError, QueueResult, QueueStats, RetryPolicy,
};

// A due delayed job goes first only when it is older than the FIFO head.
const CLAIM: &str = r#"
if redis.call('SCARD', KEYS[3]) >= tonumber(ARGV[1]) then
  return false
end
local id
local head = redis.call('LINDEX', KEYS[1], 0)
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2], 'WITHSCORES', 'LIMIT', 0, 1)
if due[1] then
  local take_delayed = true
  if head then
    local head_at = redis.call('HGET', ARGV[5] .. head, 'next_run_at') or ARGV[2]
    take_delayed = tonumber(due[2]) < tonumber(head_at)
  end
  if take_delayed then
    id = due[1]
    redis.call('ZREM', KEYS[2], id)
  end
end
if not id then
  id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
end
local key = ARGV[5] .. id
redis.call('HINCRBY', key, 'attempts', 1)
redis.call('HSET', key, 'state', 'active', 'lease_token', ARGV[4], 'lease_expires_at', ARGV[3], 'updated_at', ARGV[2])
redis.call('SADD', KEYS[3], id)
return id
"#;

// Shared lease check: 1 held, 0 token mismatch, -1 missing
const LEASE_CHECK: &str = r#"
local function lease(key, token)
  local fields = redis.call('HMGET', key, 'state', 'lease_token')
  if not fields[1] then
    return -1
  end
  if fields[1] ~= 'active' or fields[2] ~= token then
    return 0
  end
  return 1
end
"#;

const EXTEND: &str = r#"
local held = lease(KEYS[1], ARGV[1])
if held ~= 1 then
  return held
end
local current = redis.call('HGET', KEYS[1], 'lease_expires_at')
if not current or tonumber(current) < tonumber(ARGV[2]) then
  redis.call('HSET', KEYS[1], 'lease_expires_at', ARGV[2])
end
return 1
"#;

const COMPLETE: &str = r#"
local held = lease(KEYS[1], ARGV[1])
if held ~= 1 then
  return held
end
redis.call('SREM', KEYS[2], ARGV[3])
if redis.call('HGET', KEYS[1], 'remove_on_complete') == '1' then
  redis.call('DEL', KEYS[1])
else
  redis.call('HDEL', KEYS[1], 'last_error', 'lease_token', 'lease_expires_at')
  redis.call('HSET', KEYS[1], 'state', 'completed', 'updated_at', ARGV[2])
  redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
end
return 1
"#;

const FAIL: &str = r#"
local held = lease(KEYS[1], ARGV[1])
if held ~= 1 then
  return held
end
redis.call('SREM', KEYS[2], ARGV[3])
redis.call('HDEL', KEYS[1], 'lease_token', 'lease_expires_at')
redis.call('HSET', KEYS[1], 'last_error', ARGV[4], 'updated_at', ARGV[2])
if ARGV[5] ~= '' then
  local retry_at = ARGV[5]
  local current = redis.call('HGET', KEYS[1], 'next_run_at')
  if current and tonumber(current) > tonumber(retry_at) then
    retry_at = current
  end
  redis.call('HSET', KEYS[1], 'state', 'delayed', 'next_run_at', retry_at)
  redis.call('ZADD', KEYS[3], retry_at, ARGV[3])
else
  redis.call('HSET', KEYS[1], 'state', 'failed')
  redis.call('ZADD', KEYS[4], ARGV[2], ARGV[3])
end
return 1
"#;

const RETRY: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return 'missing'
end
if state ~= 'failed' then
  return state
end
redis.call('ZREM', KEYS[2], ARGV[2])
local current = redis.call('HGET', KEYS[1], 'next_run_at')
if not current or tonumber(current) < tonumber(ARGV[1]) then
  redis.call('HSET', KEYS[1], 'next_run_at', ARGV[1])
end
redis.call('HDEL', KEYS[1], 'lease_token', 'lease_expires_at')
redis.call('HSET', KEYS[1], 'state', 'waiting', 'attempts', '0', 'updated_at', ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[2])
return 'ok'
"#;

const PURGE: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return 'missing'
end
if state == 'active' then
  return state
end
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('DEL', KEYS[1])
return 'ok'
"#;

struct Scripts {
    claim: Script,
    extend: Script,
    complete: Script,
    fail: Script,
    retry: Script,
    purge: Script,
}

impl Scripts {
    fn load() -> Self {
        let with_lease = |body: &str| Script::new(&format!("{LEASE_CHECK}{body}"));
        Self {
            claim: Script::new(CLAIM),
            extend: with_lease(EXTEND),
            complete: with_lease(COMPLETE),
            fail: with_lease(FAIL),
            retry: Script::new(RETRY),
            purge: Script::new(PURGE),
        }
    }
}

/// Key names for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    wait: String,
    delayed: String,
    active: String,
    failed: String,
    completed: String,
    job_prefix: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{prefix}:{queue}");
        Self {
            wait: format!("{base}:wait"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            failed: format!("{base}:failed"),
            completed: format!("{base}:completed"),
            job_prefix: format!("{base}:job:"),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix, id)
    }
}

/// Immutable part of a record, stored as JSON in the `data` field
#[derive(Serialize, Deserialize)]
struct JobMeta {
    name: String,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    created_at: DateTime<Utc>,
}

fn encode(record: &JobRecord) -> QueueResult<Vec<(&'static str, Vec<u8>)>> {
    let meta = JobMeta {
        name: record.name.clone(),
        retry: record.retry.clone(),
        timeout: record.timeout,
        created_at: record.created_at,
    };
    let text = |s: String| s.into_bytes();

    let mut fields = vec![
        ("data", serde_json::to_vec(&meta)?),
        ("payload", record.payload.clone()),
        ("state", text(record.state.to_string())),
        ("attempts", text(record.attempts.to_string())),
        ("next_run_at", text(record.next_run_at.timestamp_millis().to_string())),
        ("updated_at", text(record.updated_at.timestamp_millis().to_string())),
        ("remove_on_complete", text(u8::from(record.remove_on_complete).to_string())),
    ];
    if let Some(error) = &record.last_error {
        fields.push(("last_error", text(error.clone())));
    }
    Ok(fields)
}

fn decode(queue: &str, id: &str, mut fields: HashMap<String, Vec<u8>>) -> QueueResult<Option<JobRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let corrupt = |field: &str| QueueError::Serialization(format!("job {id}: bad or missing field '{field}'"));

    let meta: JobMeta = serde_json::from_slice(&fields.remove("data").ok_or_else(|| corrupt("data"))?)?;
    let payload = fields.remove("payload").unwrap_or_default();
    let text = |name: &str| fields.get(name).map(|v| String::from_utf8_lossy(v).into_owned());
    let millis = |name: &str| -> QueueResult<Option<DateTime<Utc>>> {
        text(name)
            .map(|raw| {
                raw.parse::<i64>()
                    .ok()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .ok_or_else(|| corrupt(name))
            })
            .transpose()
    };

    let state: JobState = text("state").ok_or_else(|| corrupt("state"))?.parse()?;
    let attempts = text("attempts")
        .ok_or_else(|| corrupt("attempts"))?
        .parse::<u32>()
        .map_err(|_| corrupt("attempts"))?;

    Ok(Some(JobRecord {
        id: JobId::from(id),
        queue: queue.to_string(),
        name: meta.name,
        payload,
        state,
        attempts,
        retry: meta.retry,
        remove_on_complete: text("remove_on_complete").as_deref() == Some("1"),
        timeout: meta.timeout,
        next_run_at: millis("next_run_at")?.ok_or_else(|| corrupt("next_run_at"))?,
        last_error: text("last_error"),
        lease_token: text("lease_token").map(LeaseToken),
        lease_expires_at: millis("lease_expires_at")?,
        created_at: meta.created_at,
        updated_at: millis("updated_at")?.unwrap_or(meta.created_at),
    }))
}

/// Inclusive range bounds for a page; `None` when the page is empty or starts past the end
fn page_bounds(offset: usize, limit: usize) -> Option<(isize, isize)> {
    if limit == 0 {
        return None;
    }
    let start = isize::try_from(offset).ok()?;
    let stop = offset
        .checked_add(limit - 1)
        .and_then(|last| isize::try_from(last).ok())
        .unwrap_or(-1);
    Some((start, stop))
}

fn lease_outcome(code: i64, queue: &str, job_id: &JobId) -> QueueResult<()> {
    match code {
        1 => Ok(()),
        0 => Err(QueueError::InvalidLeaseToken(job_id.to_string())),
        _ => Err(QueueError::not_found(queue, job_id)),
    }
}

fn state_outcome(status: &str, queue: &str, job_id: &JobId, expected: &'static str) -> QueueResult<()> {
    match status {
        "ok" => Ok(()),
        "missing" => Err(QueueError::not_found(queue, job_id)),
        other => Err(QueueError::InvalidState {
            job_id: job_id.to_string(),
            state: other.parse()?,
            expected,
        }),
    }
}

/// Broker store on a standalone Redis server.
///
/// Per queue: a `wait` list, a `delayed` sorted set scored by `next_run_at`
/// (ms), an `active` set, `failed`/`completed` sorted sets scored by
/// transition time, and one hash per job. Every mutation is a single Lua
/// script, so claims stay atomic across worker processes.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    scripts: std::sync::Arc<Scripts>,
}

impl RedisStore {
    /// Connect, retrying with `min(attempt * 100ms, 3s)` between attempts
    pub async fn connect(config: &RedisConfig) -> QueueResult<Self> {
        let client = Client::open(config.connection_url())
            .map_err(|e| QueueError::config(format!("invalid redis url: {e}")))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => {
                    info!(prefix = %config.key_prefix, "Redis connection established");
                    return Ok(Self::with_connection(conn, config.key_prefix.clone()));
                }
                Err(e) if attempt < config.max_connect_attempts => {
                    warn!(attempt, error = %e, "Redis connection failed, retrying");
                    tokio::time::sleep(RedisConfig::reconnect_delay(attempt)).await;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Redis connection retry limit reached");
                    return Err(QueueError::BrokerUnavailable(format!(
                        "redis unreachable after {attempt} attempts: {e}"
                    )));
                }
            }
        }
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            scripts: std::sync::Arc::new(Scripts::load()),
        }
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    async fn fetch(&self, queue: &str, keys: &QueueKeys, id: &str) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> = conn.hgetall(keys.job(id)).await?;
        decode(queue, id, fields)
    }

    async fn fetch_all(&self, queue: &str, keys: &QueueKeys, ids: Vec<String>) -> QueueResult<Vec<JobRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.fetch(queue, keys, &id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl BrokerStore for RedisStore {
    async fn enqueue(&self, record: JobRecord) -> QueueResult<()> {
        let keys = self.keys(&record.queue);
        let id = record.id.as_str();
        let fields = encode(&record)?;

        let mut pipe = ::redis::pipe();
        pipe.atomic().hset_multiple(keys.job(id), &fields).ignore();
        match record.state {
            JobState::Waiting => {
                pipe.rpush(&keys.wait, id).ignore();
            }
            JobState::Delayed => {
                pipe.zadd(&keys.delayed, id, record.next_run_at.timestamp_millis()).ignore();
            }
            other => {
                return Err(QueueError::InvalidState {
                    job_id: id.to_string(),
                    state: other,
                    expected: "waiting or delayed",
                })
            }
        }

        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        concurrency: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<JobRecord>> {
        let keys = self.keys(queue);
        let token = LeaseToken::new();
        let mut conn = self.conn.clone();

        let claimed: Option<String> = self
            .scripts
            .claim
            .key(&keys.wait)
            .key(&keys.delayed)
            .key(&keys.active)
            .arg(concurrency)
            .arg(now.timestamp_millis())
            .arg(after(now, lease).timestamp_millis())
            .arg(token.as_str())
            .arg(&keys.job_prefix)
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            Some(id) => self
                .fetch(queue, &keys, &id)
                .await?
                .map(Some)
                .ok_or_else(|| QueueError::Internal(format!("claimed job {id} has no record"))),
            None => Ok(None),
        }
    }

    async fn extend_lease(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        until: DateTime<Utc>,
    ) -> QueueResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .extend
            .key(keys.job(job_id.as_str()))
            .arg(token.as_str())
            .arg(until.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        lease_outcome(code, queue, job_id)
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .complete
            .key(keys.job(job_id.as_str()))
            .key(&keys.active)
            .key(&keys.completed)
            .arg(token.as_str())
            .arg(now.timestamp_millis())
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        lease_outcome(code, queue, job_id)
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let keys = self.keys(queue);
        let retry_at = retry_at.map_or_else(String::new, |at| at.timestamp_millis().to_string());
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .fail
            .key(keys.job(job_id.as_str()))
            .key(&keys.active)
            .key(&keys.delayed)
            .key(&keys.failed)
            .arg(token.as_str())
            .arg(now.timestamp_millis())
            .arg(job_id.as_str())
            .arg(error)
            .arg(retry_at)
            .invoke_async(&mut conn)
            .await?;
        lease_outcome(code, queue, job_id)
    }

    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> QueueResult<Vec<JobRecord>> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let active: Vec<String> = conn.smembers(&keys.active).await?;

        let mut expired: Vec<JobRecord> = self
            .fetch_all(queue, &keys, active)
            .await?
            .into_iter()
            .filter(|record| record.lease_expired(now))
            .collect();
        expired.sort_by_key(|record| record.lease_expires_at);
        Ok(expired)
    }

    async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let keys = self.keys(queue);
        self.fetch(queue, &keys, job_id.as_str()).await
    }

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, failed, completed): (usize, usize, usize, usize, usize) = ::redis::pipe()
            .llen(&keys.wait)
            .zcard(&keys.delayed)
            .scard(&keys.active)
            .zcard(&keys.failed)
            .zcard(&keys.completed)
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            waiting,
            active,
            delayed,
            failed,
            completed,
        })
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
        offset: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        let Some((start, stop)) = page_bounds(offset, limit) else {
            return Ok(Vec::new());
        };
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let ids: Vec<String> = match state {
            JobState::Waiting => conn.lrange(&keys.wait, start, stop).await?,
            JobState::Delayed => conn.zrange(&keys.delayed, start, stop).await?,
            JobState::Failed => conn.zrange(&keys.failed, start, stop).await?,
            JobState::Completed => conn.zrange(&keys.completed, start, stop).await?,
            JobState::Active => {
                let members: Vec<String> = conn.smembers(&keys.active).await?;
                let mut active = self.fetch_all(queue, &keys, members).await?;
                active.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
                return Ok(active.into_iter().skip(offset).take(limit).collect());
            }
        };
        self.fetch_all(queue, &keys, ids).await
    }

    async fn retry_failed(&self, queue: &str, job_id: &JobId, now: DateTime<Utc>) -> QueueResult<JobRecord> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let status: String = self
            .scripts
            .retry
            .key(keys.job(job_id.as_str()))
            .key(&keys.failed)
            .key(&keys.wait)
            .arg(now.timestamp_millis())
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        state_outcome(&status, queue, job_id, "failed")?;

        self.fetch(queue, &keys, job_id.as_str())
            .await?
            .ok_or_else(|| QueueError::not_found(queue, job_id))
    }

    async fn purge(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        let keys = self.keys(queue);
        let snapshot = self.fetch(queue, &keys, job_id.as_str()).await?;

        let mut conn = self.conn.clone();
        let status: String = self
            .scripts
            .purge
            .key(keys.job(job_id.as_str()))
            .key(&keys.wait)
            .key(&keys.delayed)
            .key(&keys.failed)
            .key(&keys.completed)
            .arg(job_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        state_outcome(&status, queue, job_id, "not active")?;

        snapshot.ok_or_else(|| QueueError::not_found(queue, job_id))
    }
}
