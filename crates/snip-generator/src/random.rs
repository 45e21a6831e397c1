use crate::Generator;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snip_core::{ShortCode, SHORT_CODE_LENGTH};

/// Draws codes of [`SHORT_CODE_LENGTH`] characters from `[0-9A-Za-z]`.
///
/// Each character is drawn from the byte range `'0'..='z'`; bytes falling
/// between the digit, upper-case and lower-case blocks are rejected and
/// redrawn on their own, so every accepted character is equally likely.
#[derive(Debug)]
pub struct AlphanumericGenerator<R = StdRng> {
    rng: Mutex<R>,
}

impl AlphanumericGenerator<StdRng> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Creates a deterministic generator, handy for reproducible tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for AlphanumericGenerator<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng + Send + 'static> AlphanumericGenerator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }
}

fn draw_char<R: Rng>(rng: &mut R) -> char {
    loop {
        let byte = rng.random_range(b'0'..=b'z');
        if byte.is_ascii_alphanumeric() {
            return byte as char;
        }
    }
}

impl<R: Rng + Send + 'static> Generator for AlphanumericGenerator<R> {
    fn generate(&self) -> ShortCode {
        let mut rng = self.rng.lock();
        let code: String = (0..SHORT_CODE_LENGTH)
            .map(|_| draw_char(&mut *rng))
            .collect();
        ShortCode::new_unchecked(code)
    }
}
