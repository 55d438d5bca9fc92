// Seeded PRNG for sleep initialisation and noise re-injection.
//
// This is NOT cryptographically secure. One instance per bout, seeded from
// configuration.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // Convert to [0,1).
        let x = self.next_u32();
        (x as f32) / (u32::MAX as f32 + 1.0)
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    /// Uniform sample in `[-scale, scale)` clamped at zero.
    ///
    /// With `scale = 0.5` this is the sleep-onset activation draw: roughly half
    /// of the units start silent, the rest at a small positive activation.
    #[inline]
    pub fn rectified_uniform(&mut self, scale: f32) -> f32 {
        self.gen_range_f32(-scale, scale).max(0.0)
    }
}
