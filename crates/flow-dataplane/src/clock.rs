//! Monotonic clocks for slot expiry and telemetry timestamps.
//!
//! Slot expiry uses a coarse unsigned 32-bit seconds counter that is allowed
//! to wrap every 2³¹ seconds; all comparisons against it go through
//! [`time_after`], which is wraparound-safe. Telemetry uses a float-seconds
//! clock from the same monotonic source.

/// Monotonic seconds via `CLOCK_MONOTONIC` (Linux) or `Instant` (other platforms).
#[inline(always)]
pub fn now_sec() -> u32 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        ts.tv_sec as u32
    }
    #[cfg(not(target_os = "linux"))]
    {
        fallback_elapsed().as_secs() as u32
    }
}

/// Monotonic float seconds for telemetry timestamps.
#[inline(always)]
pub fn now_f32() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        ts.tv_sec as f32 + ts.tv_nsec as f32 * 1e-9
    }
    #[cfg(not(target_os = "linux"))]
    {
        fallback_elapsed().as_secs_f32()
    }
}

#[cfg(not(target_os = "linux"))]
fn fallback_elapsed() -> std::time::Duration {
    use std::time::Instant;
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed()
}

/// True iff `a` is strictly after `b` on the wrapping u32 timeline.
///
/// Signed-difference semantics: the comparison is correct as long as the two
/// stamps are within 2³¹ seconds of each other, so a counter wrap is harmless.
#[inline(always)]
pub fn time_after(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_after_plain() {
        assert!(time_after(10, 5));
        assert!(!time_after(5, 10));
        assert!(!time_after(7, 7));
    }

    #[test]
    fn test_time_after_wraparound() {
        // 3 seconds past the wrap point is still "after" u32::MAX - 2.
        assert!(time_after(2, u32::MAX - 2));
        assert!(!time_after(u32::MAX - 2, 2));
    }

    #[test]
    fn test_time_after_shift_invariant() {
        // Liveness decisions are invariant under shifting both stamps by 2^32
        // (which is a no-op on u32) and under any common wrapping offset.
        for &(a, b) in &[(100u32, 70u32), (70, 100), (0, u32::MAX), (u32::MAX, 0)] {
            for &off in &[0u32, 1 << 31, u32::MAX - 10] {
                assert_eq!(
                    time_after(a, b),
                    time_after(a.wrapping_add(off), b.wrapping_add(off))
                );
            }
        }
    }
}
