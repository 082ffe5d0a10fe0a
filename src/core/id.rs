//! Identity Factory
//!
//! Coordination-free 64-bit identifiers. Each id packs the current time in
//! its high bits, followed by the owning scene, so ids sort by creation time
//! and never collide across scenes as long as every scene id is owned by
//! exactly one process.
//!
//! The top bit is always zero: ids stay positive, so the signed ordering of
//! the raw `i64` matches creation order.
//!
//! ```text
//! EntityId  (persistent, storage key)
//! ┌─┬─────────────── 31 ──────────────┬─── 16 ───┬── 8 ──┬── 8 ──┐
//! │0│ seconds since RELIC_EPOCH        │ scene    │ world │  seq  │
//! └─┴──────────────────────────────────┴──────────┴───────┴───────┘
//!
//! RuntimeId (process lifetime, routing address)
//! ┌─┬────────────── 30 ──────────────┬─── 16 ───┬─────── 17 ──────┐
//! │0│ seconds since RELIC_EPOCH       │ scene    │       seq        │
//! └─┴─────────────────────────────────┴──────────┴──────────────────┘
//! ```
//!
//! A clock past the time field (2092 for entity ids, 2058 for runtime ids)
//! is reported as [`IdError::ClockOverflow`] rather than wrapped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unix timestamp (seconds) of 2024-01-01T00:00:00Z.
pub const RELIC_EPOCH: i64 = 1_704_067_200;

const ENTITY_TIME_BITS: u32 = 31;
const ENTITY_SCENE_BITS: u32 = 16;
const ENTITY_WORLD_BITS: u32 = 8;
const ENTITY_SEQ_BITS: u32 = 8;

const RUNTIME_TIME_BITS: u32 = 30;
const RUNTIME_SCENE_BITS: u32 = 16;
const RUNTIME_SEQ_BITS: u32 = 17;

const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// Identifier errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// A field does not fit in its bit width.
    #[error("{field} value {value} does not fit in {bits} bits")]
    FieldOverflow {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u64,
        /// Width of the field.
        bits: u32,
    },
    /// The clock has run past what the time field can hold.
    #[error("clock at {secs}s past the epoch overflows the {bits}-bit time field")]
    ClockOverflow {
        /// Clock reading.
        secs: u64,
        /// Width of the time field.
        bits: u32,
    },
}

fn check(field: &'static str, value: u64, bits: u32) -> Result<u64, IdError> {
    if value > mask(bits) {
        return Err(IdError::FieldOverflow { field, value, bits });
    }
    Ok(value)
}

// =============================================================================
// CLOCK
// =============================================================================

/// Time source for id generation, in whole seconds since [`RELIC_EPOCH`].
pub trait Clock: Send + Sync {
    /// Current time.
    fn now_secs(&self) -> u64;
}

/// Wall clock backed by `chrono`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        (chrono::Utc::now().timestamp() - RELIC_EPOCH).max(0) as u64
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `secs`.
    pub fn new(secs: u64) -> Self {
        Self { secs: AtomicU64::new(secs) }
    }

    /// Move the clock forward.
    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to `secs`, backwards included.
    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}

// =============================================================================
// ID TYPES
// =============================================================================

/// Persistent entity identifier, stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl EntityId {
    const SEQ_SHIFT: u32 = 0;
    const WORLD_SHIFT: u32 = ENTITY_SEQ_BITS;
    const SCENE_SHIFT: u32 = Self::WORLD_SHIFT + ENTITY_WORLD_BITS;
    const TIME_SHIFT: u32 = Self::SCENE_SHIFT + ENTITY_SCENE_BITS;

    /// Pack an entity id from its fields.
    pub fn from_parts(time: u64, scene_id: u16, world_id: u8, seq: u64) -> Result<Self, IdError> {
        let time = check("time", time, ENTITY_TIME_BITS)?;
        let seq = check("sequence", seq, ENTITY_SEQ_BITS)?;
        let raw = time << Self::TIME_SHIFT
            | (scene_id as u64) << Self::SCENE_SHIFT
            | (world_id as u64) << Self::WORLD_SHIFT
            | seq << Self::SEQ_SHIFT;
        Ok(Self(raw as i64))
    }

    /// Seconds since [`RELIC_EPOCH`].
    pub fn time(self) -> u64 {
        (self.0 as u64 >> Self::TIME_SHIFT) & mask(ENTITY_TIME_BITS)
    }

    /// Scene that created the id.
    pub fn scene_id(self) -> u16 {
        ((self.0 as u64 >> Self::SCENE_SHIFT) & mask(ENTITY_SCENE_BITS)) as u16
    }

    /// World of the creating scene.
    pub fn world_id(self) -> u8 {
        ((self.0 as u64 >> Self::WORLD_SHIFT) & mask(ENTITY_WORLD_BITS)) as u8
    }

    /// Per-second sequence.
    pub fn sequence(self) -> u64 {
        (self.0 as u64 >> Self::SEQ_SHIFT) & mask(ENTITY_SEQ_BITS)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live-actor address, unique for the lifetime of the deployment's processes.
///
/// A scene's own address has time and sequence zero, see [`RuntimeId::scene_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RuntimeId(pub i64);

impl RuntimeId {
    const SEQ_SHIFT: u32 = 0;
    const SCENE_SHIFT: u32 = RUNTIME_SEQ_BITS;
    const TIME_SHIFT: u32 = Self::SCENE_SHIFT + RUNTIME_SCENE_BITS;

    /// The null address.
    pub const NONE: RuntimeId = RuntimeId(0);

    /// Pack a runtime id from its fields.
    pub fn from_parts(time: u64, scene_id: u16, seq: u64) -> Result<Self, IdError> {
        let time = check("time", time, RUNTIME_TIME_BITS)?;
        let seq = check("sequence", seq, RUNTIME_SEQ_BITS)?;
        let raw = time << Self::TIME_SHIFT | (scene_id as u64) << Self::SCENE_SHIFT | seq;
        Ok(Self(raw as i64))
    }

    /// Routable address of a scene itself.
    pub fn scene_address(scene_id: u16) -> Self {
        Self(((scene_id as u64) << Self::SCENE_SHIFT) as i64)
    }

    /// Seconds since [`RELIC_EPOCH`].
    pub fn time(self) -> u64 {
        (self.0 as u64 >> Self::TIME_SHIFT) & mask(RUNTIME_TIME_BITS)
    }

    /// Scene that owns the addressed actor.
    pub fn scene_id(self) -> u16 {
        ((self.0 as u64 >> Self::SCENE_SHIFT) & mask(RUNTIME_SCENE_BITS)) as u16
    }

    /// Per-second sequence.
    pub fn sequence(self) -> u64 {
        (self.0 as u64 >> Self::SEQ_SHIFT) & mask(RUNTIME_SEQ_BITS)
    }

    /// True when this id addresses a scene rather than something inside it.
    pub fn is_scene_address(self) -> bool {
        self.0 != 0 && self.time() == 0 && self.sequence() == 0
    }

    /// True for the null address.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// Packed `(time << 32) | seq` generator state.
#[derive(Debug, Default)]
struct SequenceClock {
    state: AtomicU64,
}

impl SequenceClock {
    /// Claim the next `(time, seq)` pair. Spins when the sequence space of the
    /// current second is exhausted. A clock that steps backwards keeps
    /// issuing from the last second seen.
    fn next(&self, clock: &dyn Clock, time_bits: u32, seq_bits: u32) -> Result<(u64, u64), IdError> {
        let max_seq = mask(seq_bits);
        loop {
            let now = clock.now_secs();
            if now > mask(time_bits) {
                return Err(IdError::ClockOverflow { secs: now, bits: time_bits });
            }
            let current = self.state.load(Ordering::Acquire);
            let last_time = current >> 32;
            let last_seq = current & 0xFFFF_FFFF;

            let (time, seq) = if now > last_time {
                (now, 0)
            } else if last_seq < max_seq {
                (last_time, last_seq + 1)
            } else {
                std::thread::yield_now();
                continue;
            };

            let next = time << 32 | seq;
            if self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok((time, seq));
            }
        }
    }
}

/// Generates ids for one scene. Safe to share between threads.
pub struct IdFactory {
    scene_id: u16,
    world_id: u8,
    clock: Arc<dyn Clock>,
    entity: SequenceClock,
    runtime: SequenceClock,
}

impl IdFactory {
    /// Factory on the wall clock.
    pub fn new(scene_id: u16, world_id: u8) -> Self {
        Self::with_clock(scene_id, world_id, Arc::new(SystemClock))
    }

    /// Factory on a custom clock.
    pub fn with_clock(scene_id: u16, world_id: u8, clock: Arc<dyn Clock>) -> Self {
        Self {
            scene_id,
            world_id,
            clock,
            entity: SequenceClock::default(),
            runtime: SequenceClock::default(),
        }
    }

    /// Owning scene.
    pub fn scene_id(&self) -> u16 {
        self.scene_id
    }

    /// Owning world.
    pub fn world_id(&self) -> u8 {
        self.world_id
    }

    /// Next persistent id.
    pub fn next_entity_id(&self) -> Result<EntityId, IdError> {
        let (time, seq) = self.entity.next(self.clock.as_ref(), ENTITY_TIME_BITS, ENTITY_SEQ_BITS)?;
        let raw = time << EntityId::TIME_SHIFT
            | (self.scene_id as u64) << EntityId::SCENE_SHIFT
            | (self.world_id as u64) << EntityId::WORLD_SHIFT
            | seq;
        Ok(EntityId(raw as i64))
    }

    /// Next runtime address.
    pub fn next_runtime_id(&self) -> Result<RuntimeId, IdError> {
        loop {
            let (time, seq) = self.runtime.next(self.clock.as_ref(), RUNTIME_TIME_BITS, RUNTIME_SEQ_BITS)?;
            // (0, 0) is the scene's own address.
            if time == 0 && seq == 0 {
                continue;
            }
            let raw = time << RuntimeId::TIME_SHIFT | (self.scene_id as u64) << RuntimeId::SCENE_SHIFT | seq;
            return Ok(RuntimeId(raw as i64));
        }
    }
}

impl fmt::Debug for IdFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdFactory")
            .field("scene_id", &self.scene_id)
            .field("world_id", &self.world_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn test_entity_id_fields() {
        let id = EntityId::from_parts(1234, 7, 3, 200).unwrap();
        assert_eq!(id.time(), 1234);
        assert_eq!(id.scene_id(), 7);
        assert_eq!(id.world_id(), 3);
        assert_eq!(id.sequence(), 200);
    }

    #[test]
    fn test_field_overflow() {
        assert!(matches!(
            EntityId::from_parts(0, 1, 1, 256),
            Err(IdError::FieldOverflow { field: "sequence", .. })
        ));
        assert!(RuntimeId::from_parts(1 << 30, 1, 0).is_err());
        assert!(RuntimeId::from_parts(0, 1, 1 << 17).is_err());
    }

    #[test]
    fn test_scene_address() {
        let addr = RuntimeId::scene_address(42);
        assert_eq!(addr.scene_id(), 42);
        assert!(addr.is_scene_address());
        assert!(!RuntimeId::NONE.is_scene_address());
    }

    #[test]
    fn test_time_orders_ids() {
        let clock = Arc::new(ManualClock::new(100));
        let factory = IdFactory::with_clock(9, 1, clock.clone());
        let a = factory.next_entity_id().unwrap();
        clock.advance(1);
        let b = factory.next_entity_id().unwrap();
        assert!(b > a);
        assert_eq!(b.sequence(), 0);
    }

    #[test]
    fn test_runtime_id_embeds_scene() {
        let factory = IdFactory::new(512, 2);
        let id = factory.next_runtime_id().unwrap();
        assert_eq!(id.scene_id(), 512);
        assert!(!id.is_scene_address());
    }

    #[test]
    fn test_concurrent_unique() {
        let factory = Arc::new(IdFactory::new(3, 1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let factory = factory.clone();
                std::thread::spawn(move || (0..5000).map(|_| factory.next_runtime_id().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate runtime id {id}");
            }
        }
        assert_eq!(seen.len(), 40_000);
    }

    #[test]
    fn test_sequence_wrap_waits_for_next_second() {
        let clock = Arc::new(ManualClock::new(10));
        let factory = Arc::new(IdFactory::with_clock(1, 1, clock.clone()));

        // Exhaust the 256 sequences of second 10.
        let first: Vec<_> = (0..256).map(|_| factory.next_entity_id().unwrap()).collect();
        assert!(first.iter().all(|id| id.time() == 10));

        let advancer = {
            let clock = clock.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                clock.advance(1);
            })
        };
        let next = factory.next_entity_id().unwrap();
        advancer.join().unwrap();

        assert_eq!(next.time(), 11);
        assert_eq!(next.sequence(), 0);
        assert!(!first.contains(&next));
    }

    #[test]
    fn test_ids_stay_positive_and_ordered_across_high_time_bits() {
        for boundary in [1u64 << 27, 1 << 28, 1 << 29] {
            let clock = Arc::new(ManualClock::new(boundary - 1));
            let factory = IdFactory::with_clock(u16::MAX, u8::MAX, clock.clone());
            let runtime_a = factory.next_runtime_id().unwrap();
            let entity_a = factory.next_entity_id().unwrap();
            clock.advance(1);
            let runtime_b = factory.next_runtime_id().unwrap();
            let entity_b = factory.next_entity_id().unwrap();

            assert!(runtime_a.0 > 0 && runtime_b.0 > 0);
            assert!(runtime_b > runtime_a, "runtime ids out of order at {boundary}");
            assert!(entity_b > entity_a, "entity ids out of order at {boundary}");
            assert_eq!(runtime_b.time(), boundary);
        }
    }

    #[test]
    fn test_last_representable_second_is_positive() {
        let clock = Arc::new(ManualClock::new(mask(RUNTIME_TIME_BITS)));
        let factory = IdFactory::with_clock(u16::MAX, u8::MAX, clock);
        let id = factory.next_runtime_id().unwrap();
        assert!(id.0 > 0);
        assert_eq!(id.time(), mask(RUNTIME_TIME_BITS));
        assert_eq!(id.scene_id(), u16::MAX);
    }

    #[test]
    fn test_clock_past_time_field_is_an_error() {
        let clock = Arc::new(ManualClock::new(mask(RUNTIME_TIME_BITS)));
        let factory = IdFactory::with_clock(1, 1, clock.clone());
        let last = factory.next_runtime_id().unwrap();
        clock.advance(1);

        // Returns promptly instead of wrapping to time zero or spinning.
        for _ in 0..(1 << RUNTIME_SEQ_BITS) + 1 {
            assert!(matches!(
                factory.next_runtime_id(),
                Err(IdError::ClockOverflow { bits: RUNTIME_TIME_BITS, .. })
            ));
        }
        assert_eq!(last.time(), mask(RUNTIME_TIME_BITS));
        assert!(factory.next_entity_id().is_ok());
    }

    #[test]
    fn test_clock_stepping_back_keeps_order() {
        let clock = Arc::new(ManualClock::new(500));
        let factory = IdFactory::with_clock(2, 1, clock.clone());
        let first = factory.next_runtime_id().unwrap();

        clock.set(400);
        let second = factory.next_runtime_id().unwrap();
        assert!(second > first);
        assert_eq!(second.time(), 500);
        assert_eq!(second.sequence(), first.sequence() + 1);
    }

    proptest! {
        #[test]
        fn prop_entity_ids_unique_under_contention(threads in 2usize..6, per_thread in 1usize..300) {
            let clock = Arc::new(ManualClock::new(5));
            let factory = Arc::new(IdFactory::with_clock(4, 2, clock.clone()));
            let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

            // Keep the clock moving so wrapped sequences can proceed.
            let ticker = {
                let clock = clock.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                        clock.advance(1);
                    }
                })
            };

            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let factory = factory.clone();
                    std::thread::spawn(move || (0..per_thread).map(|_| factory.next_entity_id().unwrap()).collect::<Vec<_>>())
                })
                .collect();

            let mut seen = HashSet::new();
            for handle in handles {
                for id in handle.join().unwrap() {
                    prop_assert!(seen.insert(id));
                    prop_assert_eq!(id.scene_id(), 4);
                    prop_assert_eq!(id.world_id(), 2);
                }
            }
            done.store(true, Ordering::SeqCst);
            ticker.join().unwrap();
        }
    }
}
