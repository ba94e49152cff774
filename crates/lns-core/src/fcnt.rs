//! Frame counter arithmetic.
//!
//! Counters live in a 32-bit space that wraps at 2^32. Uplinks carry only the low 16 bits on the
//! air, so the receiver reconstructs the full value relative to the last counter it accepted.
//! Ordering is always a forward distance modulo 2^32, never a raw numeric comparison.

/// Largest forward jump accepted between two consecutive uplinks of the same device.
pub const MAX_FCNT_GAP: u32 = 16_384;

/// An up-counter at or below this value is a plausible device restart.
pub const RESTART_THRESHOLD: u32 = 1;

/// Distance travelled when counting forward from `from` to `to`, modulo 2^32.
#[inline]
pub fn forward_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

/// Whether `candidate` is ahead of `last` by a plausible amount.
#[inline]
pub fn is_newer(candidate: u32, last: u32) -> bool {
    let distance = forward_distance(last, candidate);
    (1..=MAX_FCNT_GAP).contains(&distance)
}

/// Reconstruct a 32-bit counter from its 16-bit wire value.
///
/// If the wire value is below the low half of `last`, the counter rolled over its 16-bit
/// window and the high half advances by one.
pub fn reconstruct(last: u32, wire: u16) -> u32 {
    let wire = u32::from(wire);
    let candidate = (last & 0xFFFF_0000) | wire;
    if wire < (last & 0xFFFF) {
        candidate.wrapping_add(0x1_0000)
    } else {
        candidate
    }
}

/// Classification of an observed uplink counter against the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpCounterCheck {
    /// Strictly newer than anything seen; carries the reconstructed 32-bit value.
    Newer(u32),
    /// Same counter as the last accepted uplink (a retransmission).
    Repeated(u32),
    /// Behind the last accepted counter or implausibly far ahead.
    Invalid { last: u32, observed: u32 },
}

/// Classify a wire counter.
///
/// A device without uplink history accepts any counter as its starting point.
pub fn check_up(last: u32, wire: u16, has_history: bool) -> UpCounterCheck {
    if !has_history {
        return UpCounterCheck::Newer(u32::from(wire));
    }
    let observed = reconstruct(last, wire);
    if observed == last {
        UpCounterCheck::Repeated(observed)
    } else if is_newer(observed, last) {
        UpCounterCheck::Newer(observed)
    } else {
        UpCounterCheck::Invalid { last, observed }
    }
}

/// Whether `observed` looks like a device that restarted its counters.
///
/// `newly_joined` covers devices that just completed a (re)join: their stored counter may be
/// anything, the only requirement is a small observed value.
pub fn is_plausible_restart(last: u32, observed: u32, newly_joined: bool) -> bool {
    if observed > RESTART_THRESHOLD {
        return false;
    }
    newly_joined || last > observed
}
