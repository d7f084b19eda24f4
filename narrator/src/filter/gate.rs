/// Sentinel for "no narration yet". Far enough in the past that the gate is
/// always open against it.
pub const NEVER: i64 = i64::MIN;

/// Returns `true` if at least `interval_ms` have elapsed between `last_ms`
/// and `now_ms` (both Unix milliseconds).
pub fn allowed(now_ms: i64, last_ms: i64, interval_ms: u64) -> bool {
    let elapsed = now_ms.saturating_sub(last_ms);
    elapsed >= 0 && elapsed as u64 >= interval_ms
}
