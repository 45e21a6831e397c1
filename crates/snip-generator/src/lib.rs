//! Short code generation.
//!
//! A [`Generator`] draws candidate codes. [`CodeGenerator`] wraps one and
//! retries against a backend's existing codes until an unused one is found,
//! giving up after a bounded number of attempts.

pub mod random;

use snip_core::{Result, ShortCode, StorageError};
use std::future::Future;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

pub use random::AlphanumericGenerator;

/// Default number of draws before [`CodeGenerator`] gives up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 100;

/// Trait for drawing candidate short codes.
///
/// Implementations are pure generators that don't interact with storage,
/// so a drawn code may collide with one that is already in use.
pub trait Generator: Send + Sync + 'static {
    /// Draws one candidate short code.
    fn generate(&self) -> ShortCode;
}

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct CodeGeneratorSettings {
    /// How many candidates are drawn before reporting exhaustion.
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: usize,
}

impl Default for CodeGeneratorSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Produces short codes that are unused in a given backend.
#[derive(Debug)]
pub struct CodeGenerator<G = AlphanumericGenerator> {
    inner: G,
    max_attempts: usize,
}

impl CodeGenerator<AlphanumericGenerator> {
    /// Creates a generator drawing from an OS-seeded random source.
    pub fn new(settings: CodeGeneratorSettings) -> Self {
        Self::with_generator(AlphanumericGenerator::new(), settings)
    }
}

impl Default for CodeGenerator<AlphanumericGenerator> {
    fn default() -> Self {
        Self::new(CodeGeneratorSettings::default())
    }
}

impl<G: Generator> CodeGenerator<G> {
    pub fn with_generator(inner: G, settings: CodeGeneratorSettings) -> Self {
        Self {
            inner,
            max_attempts: settings.max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Draws codes until `exists` reports one as unused.
    ///
    /// Returns [`StorageError::GenerationExhausted`] when every attempt
    /// collided.
    pub fn new_code<F>(&self, mut exists: F) -> Result<ShortCode>
    where
        F: FnMut(&ShortCode) -> bool,
    {
        for attempt in 1..=self.max_attempts {
            let code = self.inner.generate();
            if !exists(&code) {
                return Ok(code);
            }
            debug!(code = %code, attempt, "short code collision, redrawing");
        }

        warn!(attempts = self.max_attempts, "short code space exhausted");
        Err(StorageError::GenerationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Same as [`new_code`](Self::new_code) for existence checks that have
    /// to ask a remote store.
    pub async fn new_code_async<F, Fut>(&self, mut exists: F) -> Result<ShortCode>
    where
        F: FnMut(ShortCode) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        for attempt in 1..=self.max_attempts {
            let code = self.inner.generate();
            if !exists(code.clone()).await? {
                return Ok(code);
            }
            debug!(code = %code, attempt, "short code collision, redrawing");
        }

        warn!(attempts = self.max_attempts, "short code space exhausted");
        Err(StorageError::GenerationExhausted {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashSet, VecDeque};

    /// Hands out a fixed sequence of codes.
    struct Scripted(Mutex<VecDeque<&'static str>>);

    impl Scripted {
        fn new(codes: &[&'static str]) -> Self {
            Self(Mutex::new(codes.iter().copied().collect()))
        }
    }

    impl Generator for Scripted {
        fn generate(&self) -> ShortCode {
            let next = self.0.lock().pop_front().unwrap_or("zzzzzzzz");
            ShortCode::new_unchecked(next)
        }
    }

    fn settings(max_attempts: usize) -> CodeGeneratorSettings {
        CodeGeneratorSettings::builder()
            .max_attempts(max_attempts)
            .build()
    }

    #[test]
    fn retries_until_unused_code() {
        let taken: HashSet<&str> = ["aaaaaaaa", "bbbbbbbb"].into_iter().collect();
        let generator = CodeGenerator::with_generator(
            Scripted::new(&["aaaaaaaa", "bbbbbbbb", "cccccccc"]),
            settings(5),
        );

        let code = generator.new_code(|c| taken.contains(c.as_str())).unwrap();
        assert_eq!(code.as_str(), "cccccccc");
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let generator = CodeGenerator::with_generator(Scripted::new(&[]), settings(3));

        let mut calls = 0;
        let err = generator
            .new_code(|_| {
                calls += 1;
                true
            })
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::GenerationExhausted { attempts: 3 }
        ));
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let generator = CodeGenerator::with_generator(Scripted::new(&[]), settings(0));
        assert_eq!(generator.max_attempts(), 1);
        assert!(generator.new_code(|_| false).is_ok());
    }

    #[test]
    fn large_sample_has_no_collisions() {
        let generator = CodeGenerator::default();
        let mut seen = HashSet::with_capacity(100_000);

        for _ in 0..100_000 {
            let code = generator.new_code(|c| seen.contains(c)).unwrap();
            assert!(seen.insert(code));
        }
    }

    #[tokio::test]
    async fn async_check_retries_and_propagates_errors() {
        let generator = CodeGenerator::with_generator(
            Scripted::new(&["aaaaaaaa", "bbbbbbbb"]),
            settings(5),
        );
        let code = generator
            .new_code_async(|c| async move { Ok(c.as_str() == "aaaaaaaa") })
            .await
            .unwrap();
        assert_eq!(code.as_str(), "bbbbbbbb");

        let err = generator
            .new_code_async(|_| async { Err(StorageError::Query("boom".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Query(_)));
    }
}
