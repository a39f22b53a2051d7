//! Redis queue implementation for anvilq.
//!
//! Layout under `{prefix}`:
//!
//! - `{prefix}:tasks` hash, task id to task JSON
//! - `{prefix}:state` hash, task id to state label (the compare-and-set field)
//! - `{prefix}:started` hash, task id to dequeue time in ms for active tasks
//! - `{prefix}:queues` set of known queue names
//! - `{prefix}:q:{queue}:pending` list (LPUSH on enqueue, RPOP on dequeue)
//! - `{prefix}:q:{queue}:{scheduled,active,completed,failed}` sorted sets
//!   scored by time in ms
//!
//! Every state change is one Lua script or one `MULTI` pipeline.

use super::{ListScope, QueueBackend, QueueCounts};
use crate::error::{AnvilError, AnvilResult};
use crate::task::{QueuedTask, TaskId, TaskState};
use async_trait::async_trait;

use redis::{AsyncCommands, Client, RedisError, Script, aio::ConnectionManager};

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CLEANUP_BATCH: usize = 500;

/// Map a Redis error, treating connectivity failures as the broker being
/// unavailable.
pub(crate) fn map_redis_error(context: &str, err: RedisError) -> AnvilError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
    {
        AnvilError::broker_unavailable(format!("{}: {}", context, err), err)
    } else {
        AnvilError::queue(format!("{}: {}", context, err), err)
    }
}

/// Connect a [`ConnectionManager`], bounded by a 10s timeout.
pub(crate) async fn connect(connection_string: &str) -> AnvilResult<ConnectionManager> {
    let client = Client::open(connection_string)
        .map_err(|e| AnvilError::config(format!("Invalid Redis URL: {}", e)))?;

    timeout(Duration::from_secs(10), client.get_connection_manager())
        .await
        .map_err(|e| AnvilError::broker_unavailable("Timed out connecting to Redis", e))?
        .map_err(|e| map_redis_error("Failed to create Redis connection manager", e))
}

pub(crate) fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Pre-compiled Lua scripts for atomic Redis operations
#[derive(Debug)]
struct RedisScripts {
    dequeue: Script,
    release_active: Script,
    revive_failed: Script,
    delete_failed: Script,
    cleanup: Script,
    recover_stale: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            dequeue: Script::new(include_str!("scripts/dequeue.lua")),
            release_active: Script::new(include_str!("scripts/release_active.lua")),
            revive_failed: Script::new(include_str!("scripts/revive_failed.lua")),
            delete_failed: Script::new(include_str!("scripts/delete_failed.lua")),
            cleanup: Script::new(include_str!("scripts/cleanup.lua")),
            recover_stale: Script::new(include_str!("scripts/recover_stale.lua")),
        }
    }
}

/// Where a task released from `active` lands.
enum Placement {
    /// Sorted set scored with the given time
    Scored(u64),
    /// Newest end of the pending list
    Tail,
    /// Next to be popped from the pending list
    Head,
}

/// Redis queue backend implementation
pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("prefix", &self.prefix)
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Connect to Redis and use `key_prefix` as the namespace for all keys.
    pub async fn new(connection_string: &str, key_prefix: &str) -> AnvilResult<Self> {
        let conn = connect(connection_string).await?;
        info!(prefix = key_prefix, "Connected Redis queue backend");
        Ok(Self::from_connection(conn, key_prefix))
    }

    /// Build on an existing connection manager.
    pub fn from_connection(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            prefix: key_prefix.to_string(),
            scripts: RedisScripts::new(),
        }
    }

    /// Clone of the underlying connection, e.g. to share with
    /// [`RedisIdempotencyStore`](crate::idempotency::RedisIdempotencyStore).
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn tasks_key(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    fn state_key(&self) -> String {
        format!("{}:state", self.prefix)
    }

    fn started_key(&self) -> String {
        format!("{}:started", self.prefix)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn queue_key(&self, queue: &str, part: &str) -> String {
        format!("{}:q:{}:{}", self.prefix, queue, part)
    }

    fn serialize_task(task: &QueuedTask) -> AnvilResult<String> {
        Ok(serde_json::to_string(task)?)
    }

    /// Decode a stored task, overlaying the authoritative state and start
    /// time kept outside the JSON document.
    fn hydrate(data: &str, state: Option<&str>, started: Option<u64>) -> AnvilResult<QueuedTask> {
        let mut task: QueuedTask = serde_json::from_str(data)?;
        if let Some(state) = state {
            task.state = match state {
                "active" => TaskState::Active,
                "completed" => TaskState::Completed,
                "failed" => TaskState::Failed,
                _ => TaskState::Pending,
            };
        }
        if let Some(ms) = started {
            task.processed_at = Some(from_millis(ms));
        }
        Ok(task)
    }

    async fn fetch_many(&self, ids: &[String]) -> AnvilResult<Vec<QueuedTask>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let (data, states, started): (Vec<Option<String>>, Vec<Option<String>>, Vec<Option<u64>>) =
            redis::pipe()
                .cmd("HMGET")
                .arg(self.tasks_key())
                .arg(ids)
                .cmd("HMGET")
                .arg(self.state_key())
                .arg(ids)
                .cmd("HMGET")
                .arg(self.started_key())
                .arg(ids)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("Failed to load tasks", e))?;

        let mut tasks = Vec::with_capacity(ids.len());
        for ((data, state), started) in data.into_iter().zip(states).zip(started) {
            if let Some(data) = data {
                tasks.push(Self::hydrate(&data, state.as_deref(), started)?);
            }
        }
        Ok(tasks)
    }

    /// `lease` is the dequeue time the caller holds the task under.
    async fn release_active(
        &self,
        task: &QueuedTask,
        lease: Option<SystemTime>,
        new_state: TaskState,
        destination: String,
        placement: Placement,
    ) -> AnvilResult<()> {
        let mut conn = self.conn.clone();
        let json = Self::serialize_task(task)?;
        let (mode, score) = match placement {
            Placement::Scored(score) => ("zset", score),
            Placement::Tail => ("tail", 0),
            Placement::Head => ("head", 0),
        };
        let started = lease.map(|at| to_millis(at).to_string()).unwrap_or_default();

        let released: i32 = self
            .scripts
            .release_active
            .key(self.queue_key(&task.queue, "active"))
            .key(self.state_key())
            .key(self.tasks_key())
            .key(self.started_key())
            .key(destination)
            .arg(&task.id)
            .arg(json)
            .arg(new_state.as_str())
            .arg(mode)
            .arg(score)
            .arg(started)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("Failed to release active task", e))?;

        if released == 0 {
            return Err(AnvilError::task_not_found(&task.id));
        }
        Ok(())
    }

    async fn known_queues(&self) -> AnvilResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(self.queues_key())
            .await
            .map_err(|e| map_redis_error("Failed to list queues", e))
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, mut task: QueuedTask) -> AnvilResult<TaskId> {
        let mut conn = self.conn.clone();
        let now = SystemTime::now();
        task.state = TaskState::Pending;

        let task_id = task.id.clone();
        let task_json = Self::serialize_task(&task)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.tasks_key(), &task_id, &task_json)
            .hset(self.state_key(), &task_id, TaskState::Pending.as_str())
            .sadd(self.queues_key(), &task.queue);

        match task.process_at.filter(|at| *at > now) {
            Some(at) => pipe.zadd(self.queue_key(&task.queue, "scheduled"), &task_id, to_millis(at)),
            None => pipe.lpush(self.queue_key(&task.queue, "pending"), &task_id),
        };

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("Failed to enqueue task", e))?;

        debug!(task_id = %task_id, queue = %task.queue, "Enqueued task");
        Ok(task_id)
    }

    async fn dequeue_from(&self, queue: &str) -> AnvilResult<Option<QueuedTask>> {
        let mut conn = self.conn.clone();
        let now = to_millis(SystemTime::now());

        let data: Option<String> = self
            .scripts
            .dequeue
            .key(self.queue_key(queue, "scheduled"))
            .key(self.queue_key(queue, "pending"))
            .key(self.queue_key(queue, "active"))
            .key(self.state_key())
            .key(self.tasks_key())
            .key(self.started_key())
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("Failed to dequeue task", e))?;

        data.map(|data| Self::hydrate(&data, Some("active"), Some(now)))
            .transpose()
    }

    async fn complete(&self, task: &QueuedTask) -> AnvilResult<()> {
        let mut done = task.clone();
        done.state = TaskState::Completed;
        let completed_at = *done.completed_at.get_or_insert_with(SystemTime::now);

        self.release_active(
            &done,
            task.processed_at,
            TaskState::Completed,
            self.queue_key(&task.queue, "completed"),
            Placement::Scored(to_millis(completed_at)),
        )
        .await
    }

    async fn retry(&self, task: &QueuedTask) -> AnvilResult<()> {
        let mut next = task.clone();
        next.state = TaskState::Pending;

        let now = SystemTime::now();
        let (destination, placement) = match next.process_at.filter(|at| *at > now) {
            Some(at) => (
                self.queue_key(&task.queue, "scheduled"),
                Placement::Scored(to_millis(at)),
            ),
            None => (self.queue_key(&task.queue, "pending"), Placement::Tail),
        };
        self.release_active(&next, task.processed_at, TaskState::Pending, destination, placement)
            .await
    }

    async fn fail(&self, task: &QueuedTask) -> AnvilResult<()> {
        let mut dead = task.clone();
        dead.state = TaskState::Failed;
        self.release_active(
            &dead,
            task.processed_at,
            TaskState::Failed,
            self.queue_key(&task.queue, "failed"),
            Placement::Scored(to_millis(SystemTime::now())),
        )
        .await
    }

    async fn requeue(&self, task: &QueuedTask) -> AnvilResult<()> {
        let mut back = task.clone();
        back.state = TaskState::Pending;
        back.processed_at = None;
        self.release_active(
            &back,
            task.processed_at,
            TaskState::Pending,
            self.queue_key(&task.queue, "pending"),
            Placement::Head,
        )
        .await
    }

    async fn recover_stale(&self, lease: Duration) -> AnvilResult<u64> {
        let threshold = SystemTime::now().checked_sub(lease).unwrap_or(UNIX_EPOCH);
        let mut conn = self.conn.clone();

        let mut recovered = 0u64;
        for queue in self.known_queues().await? {
            loop {
                let batch: u64 = self
                    .scripts
                    .recover_stale
                    .key(self.queue_key(&queue, "active"))
                    .key(self.state_key())
                    .key(self.started_key())
                    .key(self.queue_key(&queue, "pending"))
                    .arg(to_millis(threshold))
                    .arg(CLEANUP_BATCH)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("Failed to recover stale tasks", e))?;
                recovered += batch;
                if batch < CLEANUP_BATCH as u64 {
                    break;
                }
            }
        }

        if recovered > 0 {
            debug!("Recovered {} stale active tasks", recovered);
        }
        Ok(recovered)
    }

    async fn get_task(&self, task_id: &str) -> AnvilResult<Option<QueuedTask>> {
        let tasks = self.fetch_many(&[task_id.to_string()]).await?;
        Ok(tasks.into_iter().next())
    }

    async fn queue_counts(&self, queue: &str) -> AnvilResult<QueueCounts> {
        let mut conn = self.conn.clone();
        let (pending, scheduled, active, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(self.queue_key(queue, "pending"))
                .zcard(self.queue_key(queue, "scheduled"))
                .zcard(self.queue_key(queue, "active"))
                .zcard(self.queue_key(queue, "completed"))
                .zcard(self.queue_key(queue, "failed"))
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("Failed to get queue counts", e))?;

        Ok(QueueCounts {
            pending,
            scheduled,
            active,
            completed,
            failed,
        })
    }

    async fn list_tasks(
        &self,
        queue: &str,
        scope: ListScope,
        offset: usize,
        limit: usize,
    ) -> AnvilResult<(Vec<QueuedTask>, u64)> {
        let mut conn = self.conn.clone();

        let (ids, total) = match scope {
            ListScope::Live => {
                let (mut pending, scheduled, active): (Vec<String>, Vec<String>, Vec<String>) =
                    redis::pipe()
                        .atomic()
                        .lrange(self.queue_key(queue, "pending"), 0, -1)
                        .zrange(self.queue_key(queue, "scheduled"), 0, -1)
                        .zrange(self.queue_key(queue, "active"), 0, -1)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| map_redis_error("Failed to list live tasks", e))?;

                // Oldest pending task sits at the right end of the list
                pending.reverse();
                let all: Vec<String> = pending.into_iter().chain(scheduled).chain(active).collect();
                let total = all.len() as u64;
                (all.into_iter().skip(offset).take(limit).collect(), total)
            }
            ListScope::Failed => {
                if limit == 0 {
                    let total: u64 = conn
                        .zcard(self.queue_key(queue, "failed"))
                        .await
                        .map_err(|e| map_redis_error("Failed to count failed tasks", e))?;
                    return Ok((Vec::new(), total));
                }
                let stop = (offset + limit - 1) as isize;
                let (total, ids): (u64, Vec<String>) = redis::pipe()
                    .atomic()
                    .zcard(self.queue_key(queue, "failed"))
                    .zrange(self.queue_key(queue, "failed"), offset as isize, stop)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("Failed to list failed tasks", e))?;
                (ids, total)
            }
        };

        Ok((self.fetch_many(&ids).await?, total))
    }

    async fn retry_failed(&self, queue: &str, task_id: &str) -> AnvilResult<Option<QueuedTask>> {
        let mut conn = self.conn.clone();
        let stored: Option<String> = conn
            .hget(self.tasks_key(), task_id)
            .await
            .map_err(|e| map_redis_error("Failed to load task", e))?;
        let Some(stored) = stored else {
            return Ok(None);
        };

        let mut task = Self::hydrate(&stored, None, None)?;
        if task.queue != queue {
            return Ok(None);
        }
        task.revive();
        let revived_json = Self::serialize_task(&task)?;

        let revived: i32 = self
            .scripts
            .revive_failed
            .key(self.queue_key(queue, "failed"))
            .key(self.state_key())
            .key(self.tasks_key())
            .key(self.queue_key(queue, "pending"))
            .arg(task_id)
            .arg(stored)
            .arg(revived_json)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("Failed to retry failed task", e))?;

        Ok((revived == 1).then_some(task))
    }

    async fn delete_failed(&self, queue: &str, task_id: &str) -> AnvilResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i32 = self
            .scripts
            .delete_failed
            .key(self.queue_key(queue, "failed"))
            .key(self.state_key())
            .key(self.tasks_key())
            .arg(task_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("Failed to delete failed task", e))?;
        Ok(deleted == 1)
    }

    async fn cleanup(&self, retention: Duration) -> AnvilResult<u64> {
        let threshold = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(UNIX_EPOCH);
        let mut conn = self.conn.clone();

        let mut removed = 0u64;
        for queue in self.known_queues().await? {
            loop {
                let batch: u64 = self
                    .scripts
                    .cleanup
                    .key(self.queue_key(&queue, "completed"))
                    .key(self.state_key())
                    .key(self.tasks_key())
                    .arg(to_millis(threshold))
                    .arg(CLEANUP_BATCH)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("Failed to clean up completed tasks", e))?;
                removed += batch;
                if batch < CLEANUP_BATCH as u64 {
                    break;
                }
            }
        }

        if removed > 0 {
            debug!("Cleaned up {} completed tasks", removed);
        }
        Ok(removed)
    }

    async fn purge(&self) -> AnvilResult<u64> {
        let mut conn = self.conn.clone();
        let queues = self.known_queues().await?;
        let count: u64 = conn
            .hlen(self.tasks_key())
            .await
            .map_err(|e| map_redis_error("Failed to count tasks", e))?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.tasks_key())
            .del(self.state_key())
            .del(self.started_key())
            .del(self.queues_key());
        for queue in &queues {
            for part in ["pending", "scheduled", "active", "completed", "failed"] {
                pipe.del(self.queue_key(queue, part));
            }
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("Failed to purge queue", e))?;

        warn!("Purged {} tasks from Redis queue", count);
        Ok(count)
    }

    async fn health_check(&self) -> AnvilResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("Redis health check failed", e))?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(AnvilError::QueueError {
                message: format!("Unexpected PING reply: {}", pong),
                source: None,
            })
        }
    }
}
