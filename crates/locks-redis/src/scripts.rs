//! Lua scripts run atomically by Redis for the scripted lock operations.
//!
//! Each script returns `false` (a nil reply) when the key is absent so the
//! caller can tell a missing key apart from one held by another token.

use std::sync::LazyLock;

use redis::Script;

/// Sets the key when absent, or re-arms its expiry when it already holds the
/// caller's token. Returns 1 on success, 0 when held by another token.
pub static ACQUIRE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local current = redis.call('GET', KEYS[1])
if current == false then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
elseif current == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
",
    )
});

/// Resets the expiry when the key holds the caller's token.
pub static COMPARE_AND_EXTEND: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local current = redis.call('GET', KEYS[1])
if current == false then
    return false
elseif current == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
",
    )
});

/// Deletes the key when it holds the caller's token.
pub static COMPARE_AND_DELETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local current = redis.call('GET', KEYS[1])
if current == false then
    return false
elseif current == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
",
    )
});
