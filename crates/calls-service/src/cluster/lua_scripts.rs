//! Lua scripts for atomic coordination store operations.
//!
//! Every ownership mutation assigns a sequence from the shared counter and
//! publishes the resulting event inside the same script, so no subscriber can
//! observe a record change without its event or the other way around.
//!
//! Scripts that return a status pair return `{status, string}` so the Rust
//! side can decode every reply as `(i64, String)`.

/// Release a lock only if the caller still holds it.
///
/// Arguments:
/// - KEYS[1]: Lock key (`calls:lock:{name}`)
/// - ARGV[1]: Holder identity
///
/// Returns:
/// - 1: Released
/// - 0: Not held by caller (expired or taken over)
pub const UNLOCK_IF_HOLDER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Extend a lock lease only if the caller still holds it.
///
/// Arguments:
/// - KEYS[1]: Lock key
/// - ARGV[1]: Holder identity
/// - ARGV[2]: Lease in milliseconds
///
/// Returns:
/// - 1: Renewed
/// - 0: Not held by caller
pub const RENEW_IF_HOLDER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Claim call ownership, first writer wins.
///
/// Arguments:
/// - KEYS[1]: Call key (`calls:call:{id}`)
/// - KEYS[2]: Call index set
/// - KEYS[3]: Sequence counter
/// - ARGV[1]: Claiming node id
/// - ARGV[2]: Call id
/// - ARGV[3]: Creation time (unix ms)
/// - ARGV[4]: Event channel
///
/// Returns:
/// - {1, seq}: Claimed (or already owned by the caller)
/// - {0, owner}: Owned by another node
pub const CLAIM_CALL: &str = r#"
local owner = redis.call('HGET', KEYS[1], 'owner')
if owner then
    if owner == ARGV[1] then
        return {1, redis.call('HGET', KEYS[1], 'seq')}
    end
    return {0, owner}
end

local seq = redis.call('INCR', KEYS[3])
redis.call('HSET', KEYS[1], 'owner', ARGV[1], 'seq', seq, 'created_at', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('PUBLISH', ARGV[4], cjson.encode({
    seq = seq,
    origin = ARGV[1],
    type = 'ownership_claimed',
    call_id = ARGV[2],
    node = ARGV[1]
}))
return {1, tostring(seq)}
"#;

/// Release call ownership held by the caller.
///
/// Arguments:
/// - KEYS[1]: Call key
/// - KEYS[2]: Call index set
/// - KEYS[3]: Sequence counter
/// - ARGV[1]: Releasing node id
/// - ARGV[2]: Call id
/// - ARGV[3]: Event channel
///
/// Returns:
/// - {1, seq}: Released
/// - {0, ''}: No record
/// - {-1, owner}: Owned by another node, untouched
pub const RELEASE_CALL: &str = r#"
local owner = redis.call('HGET', KEYS[1], 'owner')
if not owner then
    redis.call('SREM', KEYS[2], ARGV[2])
    return {0, ''}
end
if owner ~= ARGV[1] then
    return {-1, owner}
end

redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[2])
local seq = redis.call('INCR', KEYS[3])
redis.call('PUBLISH', ARGV[3], cjson.encode({
    seq = seq,
    origin = ARGV[1],
    type = 'ownership_released',
    call_id = ARGV[2],
    node = owner
}))
return {1, tostring(seq)}
"#;

/// Remove a call record regardless of owner.
///
/// Arguments:
/// - KEYS[1]: Call key
/// - KEYS[2]: Call index set
/// - KEYS[3]: Sequence counter
/// - ARGV[1]: Evicting node id
/// - ARGV[2]: Call id
/// - ARGV[3]: Event channel
///
/// Returns:
/// - {1, seq}: Evicted
/// - {0, ''}: No record
pub const EVICT_CALL: &str = r#"
local owner = redis.call('HGET', KEYS[1], 'owner')
redis.call('SREM', KEYS[2], ARGV[2])
if not owner then
    return {0, ''}
end

redis.call('DEL', KEYS[1])
local seq = redis.call('INCR', KEYS[3])
redis.call('PUBLISH', ARGV[3], cjson.encode({
    seq = seq,
    origin = ARGV[1],
    type = 'ownership_released',
    call_id = ARGV[2],
    node = owner
}))
return {1, tostring(seq)}
"#;

/// Publish an arbitrary event with a fresh sequence.
///
/// Arguments:
/// - KEYS[1]: Sequence counter
/// - ARGV[1]: Event channel
/// - ARGV[2]: Event JSON without `seq`
///
/// Returns: the assigned sequence
pub const PUBLISH_EVENT: &str = r#"
local seq = redis.call('INCR', KEYS[1])
local event = cjson.decode(ARGV[2])
event['seq'] = seq
redis.call('PUBLISH', ARGV[1], cjson.encode(event))
return seq
"#;

/// Refresh a node presence lease.
///
/// Arguments:
/// - KEYS[1]: Presence key (`calls:node:{id}`)
/// - KEYS[2]: Node index set
/// - ARGV[1]: Node id
/// - ARGV[2]: Lease in milliseconds
///
/// Returns:
/// - 1: Node was not present before
/// - 0: Lease extended
pub const REFRESH_PRESENCE: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[1])
if existed == 1 then
    return 0
end
return 1
"#;

/// List nodes whose presence lease has not expired.
///
/// Arguments:
/// - KEYS[1]: Node index set
/// - ARGV[1]: Presence key prefix (`calls:node:`)
///
/// Returns: array of live node ids
pub const LIVE_NODES: &str = r#"
local live = {}
for _, node in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    if redis.call('EXISTS', ARGV[1] .. node) == 1 then
        table.insert(live, node)
    end
end
return live
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlock_compares_holder_before_delete() {
        assert!(UNLOCK_IF_HOLDER.contains("if redis.call('GET', KEYS[1]) == ARGV[1] then"));
        assert!(UNLOCK_IF_HOLDER.contains("redis.call('DEL', KEYS[1])"));
    }

    #[test]
    fn test_renew_compares_holder_before_extend() {
        assert!(RENEW_IF_HOLDER.contains("if redis.call('GET', KEYS[1]) == ARGV[1] then"));
        assert!(RENEW_IF_HOLDER.contains("PEXPIRE"));
    }

    #[test]
    fn test_claim_is_first_writer_wins() {
        // Existing owner is checked before any write
        let check = CLAIM_CALL.find("HGET").unwrap();
        let write = CLAIM_CALL.find("HSET").unwrap();
        assert!(check < write);
        assert!(CLAIM_CALL.contains("return {0, owner}"));
    }

    #[test]
    fn test_claim_is_idempotent_for_owner() {
        assert!(CLAIM_CALL.contains("if owner == ARGV[1] then"));
    }

    #[test]
    fn test_ownership_scripts_publish_with_sequence() {
        for script in [CLAIM_CALL, RELEASE_CALL, EVICT_CALL] {
            assert!(script.contains("redis.call('INCR', KEYS[3])"));
            assert!(script.contains("redis.call('PUBLISH'"));
            assert!(script.contains("seq = seq"));
        }
    }

    #[test]
    fn test_release_leaves_foreign_record_untouched() {
        let guard = RELEASE_CALL.find("if owner ~= ARGV[1] then").unwrap();
        let delete = RELEASE_CALL.find("redis.call('DEL'").unwrap();
        assert!(guard < delete);
        assert!(RELEASE_CALL.contains("return {-1, owner}"));
    }

    #[test]
    fn test_release_event_names_previous_owner() {
        assert!(EVICT_CALL.contains("node = owner"));
        assert!(RELEASE_CALL.contains("node = owner"));
    }

    #[test]
    fn test_status_pairs_return_strings() {
        assert!(CLAIM_CALL.contains("return {1, tostring(seq)}"));
        assert!(RELEASE_CALL.contains("return {0, ''}"));
        assert!(EVICT_CALL.contains("return {0, ''}"));
    }

    #[test]
    fn test_presence_uses_millisecond_lease() {
        assert!(REFRESH_PRESENCE.contains("'PX', ARGV[2]"));
        assert!(LIVE_NODES.contains("ARGV[1] .. node"));
    }
}
