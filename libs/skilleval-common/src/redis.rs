use crate::config::QueueConfig;
use crate::error::{StoreError, StoreResult};
use crate::queue::{ClaimedJob, JobQueue, Lease};
use crate::types::{EvalJob, JobId};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, warn};

/// Redis queue semantics
/// Keeps API, worker and CLI agreeing on deterministic key names

pub const KEY_PREFIX: &str = "skilleval";
pub const PENDING_QUEUE: &str = "skilleval:queue:pending";
pub const PROCESSING_QUEUE: &str = "skilleval:queue:processing";
pub const JOB_PREFIX: &str = "skilleval:job";
pub const LEASE_PREFIX: &str = "skilleval:lease";
pub const CANCEL_PREFIX: &str = "skilleval:cancel";

/// Cancellation flags outlive any reasonable job duration
const CANCEL_TTL_SECS: u64 = 86_400;

/// Generate the record key for a job
pub fn job_key(job_id: &JobId) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Generate the worker lease key for a claimed job
pub fn lease_key(job_id: &JobId) -> String {
    format!("{}:{}", LEASE_PREFIX, job_id)
}

/// Generate the cancellation flag key for a job
pub fn cancel_key(job_id: &JobId) -> String {
    format!("{}:{}", CANCEL_PREFIX, job_id)
}

// Move one id pending -> processing and lease it, all in one step.
// KEYS[1] pending, KEYS[2] processing; ARGV[1] lease prefix, ARGV[2] token, ARGV[3] lease ms
const CLAIM_SCRIPT: &str = r#"
local id = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
if id then
  redis.call('SET', ARGV[1] .. ':' .. id, ARGV[2], 'PX', ARGV[3])
end
return id
"#;

// KEYS[1] lease key; ARGV[1] token, ARGV[2] lease ms
const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

// Write the record only for the current lease holder and never over a
// finished job. Returns 1 on write, -1 lease lost, -2 terminal record.
// KEYS[1] lease key, KEYS[2] job key; ARGV[1] token, ARGV[2] payload, ARGV[3] ttl secs (0 = none)
const SAVE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return -1
end
local current = redis.call('GET', KEYS[2])
if current then
  local status = cjson.decode(current)['status']
  if status == 'COMPLETED' or status == 'FAILED' then
    return -2
  end
end
if tonumber(ARGV[3]) > 0 then
  redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
else
  redis.call('SET', KEYS[2], ARGV[2])
end
return 1
"#;

// KEYS[1] lease key, KEYS[2] processing; ARGV[1] token, ARGV[2] job id
const ACK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('LREM', KEYS[2], 1, ARGV[2])
redis.call('DEL', KEYS[1])
return 1
"#;

// KEYS[1] processing, KEYS[2] pending; ARGV[1] lease prefix
const REQUEUE_SCRIPT: &str = r#"
local moved = 0
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
  if redis.call('EXISTS', ARGV[1] .. ':' .. id) == 0 then
    redis.call('LREM', KEYS[1], 1, id)
    redis.call('RPUSH', KEYS[2], id)
    moved = moved + 1
  end
end
return moved
"#;

/// Durable queue backed by Redis
///
/// Layout:
/// - `skilleval:job:{id}` holds the full job record as JSON
/// - `skilleval:queue:pending` / `skilleval:queue:processing` hold job ids
/// - `skilleval:lease:{id}` holds the token of the claim owning the job (PX TTL)
/// - `skilleval:cancel:{id}` is the cancellation flag
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    result_ttl_secs: u64,
    claim_script: Script,
    renew_script: Script,
    save_script: Script,
    ack_script: Script,
    requeue_script: Script,
}

impl RedisQueue {
    pub async fn connect(config: &QueueConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, config.result_ttl_secs))
    }

    pub fn with_connection(conn: ConnectionManager, result_ttl_secs: u64) -> Self {
        Self {
            conn,
            result_ttl_secs,
            claim_script: Script::new(CLAIM_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
            save_script: Script::new(SAVE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            requeue_script: Script::new(REQUEUE_SCRIPT),
        }
    }

    /// Round-trip check used by health endpoints
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn pending_len(&self) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(PENDING_QUEUE).await?)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn push(&self, job: &EvalJob) -> StoreResult<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();

        // Record and queue entry land together or not at all
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(job_key(&job.id))
            .arg(payload)
            .ignore()
            .cmd("RPUSH")
            .arg(PENDING_QUEUE)
            .arg(job.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<ClaimedJob>> {
        let token = Lease::new_token(worker_id);
        let mut conn = self.conn.clone();
        let id: Option<String> = self
            .claim_script
            .key(PENDING_QUEUE)
            .key(PROCESSING_QUEUE)
            .arg(LEASE_PREFIX)
            .arg(&token)
            .arg(lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        let Some(id) = id else {
            return Ok(None);
        };

        let job_id = match JobId::parse_str(&id) {
            Ok(job_id) => job_id,
            Err(_) => {
                warn!(entry = %id, "Dropping malformed queue entry");
                let _: () = conn.lrem(PROCESSING_QUEUE, 1, &id).await?;
                return Ok(None);
            }
        };
        let lease = Lease { job_id, token };

        match self.load(&job_id).await? {
            Some(job) => Ok(Some(ClaimedJob { job, lease })),
            None => {
                // Record expired or was deleted behind our back
                warn!(job_id = %job_id, "Queue entry has no job record, dropping");
                self.ack(&lease).await?;
                Ok(None)
            }
        }
    }

    async fn save(&self, job: &EvalJob, lease: &Lease) -> StoreResult<()> {
        let payload = serde_json::to_string(job)?;
        let ttl = if job.status().is_terminal() {
            self.result_ttl_secs
        } else {
            0
        };
        let mut conn = self.conn.clone();
        let written: i64 = self
            .save_script
            .key(lease_key(&job.id))
            .key(job_key(&job.id))
            .arg(&lease.token)
            .arg(payload)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await?;

        match written {
            1 => {
                debug!(job_id = %job.id, status = %job.status(), results = job.results().len(), "Job saved");
                Ok(())
            }
            -2 => Err(StoreError::TerminalRecord { job_id: job.id }),
            _ => Err(StoreError::LeaseLost { job_id: job.id }),
        }
    }

    async fn load(&self, job_id: &JobId) -> StoreResult<Option<EvalJob>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(job_key(job_id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, lease: &Lease) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .ack_script
            .key(lease_key(&lease.job_id))
            .key(PROCESSING_QUEUE)
            .arg(&lease.token)
            .arg(lease.job_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew_script
            .key(lease_key(&lease.job_id))
            .arg(&lease.token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn requeue_stale(&self) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .requeue_script
            .key(PROCESSING_QUEUE)
            .key(PENDING_QUEUE)
            .arg(LEASE_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved.max(0) as usize)
    }

    async fn request_cancel(&self, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(cancel_key(job_id))
            .arg(1)
            .arg("EX")
            .arg(CANCEL_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(cancel_key(job_id)).await?)
    }
}
