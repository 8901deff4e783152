use rand::Rng;

/// Randomly decide to lose a datagram; `percent == 0` never drops.
pub(crate) fn should_drop(percent: u8) -> bool {
    percent > 0 && rand::thread_rng().gen_range(0..100u8) < percent
}
