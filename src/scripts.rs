//! Atomic admission and window scripts.
//!
//! Each script runs as a single round trip so concurrent replicas cannot
//! interleave between the read and the write. Timestamps are passed in as
//! ARGV rather than read from the store, keeping the scripts deterministic
//! under an injected clock.

/// Prune-check-track against one active-session set.
///
/// KEYS[1] = scope set; ARGV = session_id, limit, now_ms, window_ms, ttl_secs.
/// Returns { admitted, newly_tracked, count }.
pub(crate) fn check_and_track() -> redis::Script {
    redis::Script::new(
        r#"
local set_key = KEYS[1]
local session_id = ARGV[1]
local limit = tonumber(ARGV[2]) or 0
local now_ms = tonumber(ARGV[3]) or 0
local window_ms = tonumber(ARGV[4]) or 0
local ttl_secs = tonumber(ARGV[5]) or 0

redis.call("ZREMRANGEBYSCORE", set_key, "-inf", now_ms - window_ms)
local present = redis.call("ZSCORE", set_key, session_id)
local count = redis.call("ZCARD", set_key)

if present then
  redis.call("ZADD", set_key, now_ms, session_id)
  if ttl_secs > 0 then
    redis.call("EXPIRE", set_key, ttl_secs)
  end
  return { 1, 0, count }
end

if limit > 0 and count >= limit then
  return { 0, 0, count }
end

redis.call("ZADD", set_key, now_ms, session_id)
if ttl_secs > 0 then
  redis.call("EXPIRE", set_key, ttl_secs)
end
return { 1, 1, count + 1 }
"#,
    )
}

/// Batch variant over several scope sets with per-set limits.
///
/// All-or-nothing: the first set that would exceed its limit aborts the whole
/// batch before anything is written, so a rejected request never leaks an
/// admission into the scopes checked earlier.
///
/// KEYS[1..n] = scope sets; ARGV = session_id, now_ms, window_ms, ttl_secs,
/// then one limit per key. Returns { 0, rejecting_index, count } on reject,
/// else { 1, count_1, newly_1, count_2, newly_2, ... }.
pub(crate) fn check_and_track_many() -> redis::Script {
    redis::Script::new(
        r#"
local session_id = ARGV[1]
local now_ms = tonumber(ARGV[2]) or 0
local window_ms = tonumber(ARGV[3]) or 0
local ttl_secs = tonumber(ARGV[4]) or 0

local counts = {}
local tracked = {}
for i = 1, #KEYS do
  local limit = tonumber(ARGV[4 + i]) or 0
  redis.call("ZREMRANGEBYSCORE", KEYS[i], "-inf", now_ms - window_ms)
  local present = redis.call("ZSCORE", KEYS[i], session_id)
  local count = redis.call("ZCARD", KEYS[i])
  counts[i] = count
  if present then
    tracked[i] = 1
  else
    tracked[i] = 0
  end
  if (not present) and limit > 0 and count >= limit then
    return { 0, i, count }
  end
end

local out = { 1 }
for i = 1, #KEYS do
  redis.call("ZADD", KEYS[i], now_ms, session_id)
  if ttl_secs > 0 then
    redis.call("EXPIRE", KEYS[i], ttl_secs)
  end
  local count = counts[i]
  if tracked[i] == 0 then
    count = count + 1
  end
  out[#out + 1] = count
  out[#out + 1] = 1 - tracked[i]
end
return out
"#,
    )
}

/// Append one cost entry, prune the window, and return the surviving total.
///
/// The set is keyed by member identity, so the member embeds the timestamp,
/// an optional request id (idempotent re-tracking of the same request) and
/// the cost itself as its last `:`-segment; summation parses that segment.
///
/// KEYS[1] = cost set; ARGV = member, now_ms, window_ms, ttl_secs.
pub(crate) fn track_cost() -> redis::Script {
    redis::Script::new(
        r#"
local cost_key = KEYS[1]
local member = ARGV[1]
local now_ms = tonumber(ARGV[2]) or 0
local window_ms = tonumber(ARGV[3]) or 0
local ttl_secs = tonumber(ARGV[4]) or 0

redis.call("ZADD", cost_key, now_ms, member)
redis.call("ZREMRANGEBYSCORE", cost_key, "-inf", now_ms - window_ms)

local total = 0
local members = redis.call("ZRANGE", cost_key, 0, -1)
for _, m in ipairs(members) do
  local cost = string.match(m, ":(%d+)$")
  total = total + (tonumber(cost) or 0)
end

if ttl_secs > 0 then
  redis.call("EXPIRE", cost_key, ttl_secs)
end
return total
"#,
    )
}

/// Read-only window total: prune + sum, no append. Used for limit checks
/// before admitting a request.
pub(crate) fn get_cost() -> redis::Script {
    redis::Script::new(
        r#"
local cost_key = KEYS[1]
local now_ms = tonumber(ARGV[1]) or 0
local window_ms = tonumber(ARGV[2]) or 0
local ttl_secs = tonumber(ARGV[3]) or 0

redis.call("ZREMRANGEBYSCORE", cost_key, "-inf", now_ms - window_ms)

local total = 0
local members = redis.call("ZRANGE", cost_key, 0, -1)
for _, m in ipairs(members) do
  local cost = string.match(m, ":(%d+)$")
  total = total + (tonumber(cost) or 0)
end

if ttl_secs > 0 and redis.call("EXISTS", cost_key) == 1 then
  redis.call("EXPIRE", cost_key, ttl_secs)
end
return total
"#,
    )
}

/// Compare-and-extend a lease: only the current holder may renew.
///
/// KEYS[1] = lock key; ARGV = holder token, ttl_ms. Returns 1 on success.
pub(crate) fn renew_lock() -> redis::Script {
    redis::Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  redis.call("PEXPIRE", KEYS[1], tonumber(ARGV[2]) or 0)
  return 1
end
return 0
"#,
    )
}

/// Compare-and-delete a lease. Idempotent: releasing a lease someone else
/// now holds (or that already expired) is a no-op.
pub(crate) fn release_lock() -> redis::Script {
    redis::Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#,
    )
}
