//! C1: Correlation Vector (MS-CV) generation, per the v2 spec used by all
//! Microsoft telemetry/delivery endpoints this crate talks to.

use parking_lot::Mutex;
use rand::Rng as _;

const ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const BASE_LEN: usize = 16;
const MAX_LEN: usize = 63;

fn digit_count(n: u32) -> usize {
    if n == 0 {
        1
    } else {
        (n as f64).log10().floor() as usize + 1
    }
}

/// A single base + dotted counter sequence, e.g. `"4nys9AAAAAAAA.1"`.
#[derive(Clone, Debug)]
struct Inner {
    base: String,
    counter: u32,
}

impl Inner {
    fn rendered_len(base: &str, counter: u32) -> usize {
        base.len() + 1 + digit_count(counter)
    }

    fn value(&self) -> String {
        format!("{}.{}", self.base, self.counter)
    }
}

fn random_base() -> String {
    let mut rng = rand::thread_rng();
    (0..BASE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// A Microsoft Correlation Vector: a random base plus a monotonically
/// incrementing dotted counter, capped at 63 rendered characters.
///
/// Every mutating method is internally synchronized so a single `CV` can be
/// shared as the process-wide vector required by spec.md §5 ("CV values
/// attached to requests are strictly monotonic within a process").
pub struct Cv(Mutex<Inner>);

impl Cv {
    pub fn new() -> Self {
        Self(Mutex::new(Inner {
            base: random_base(),
            counter: 1,
        }))
    }

    /// The current rendered value, without mutating state.
    pub fn value(&self) -> String {
        self.0.lock().value()
    }

    /// Increments the counter and returns the new value. Fails silently
    /// (leaving the counter unchanged) if the new rendered length would
    /// exceed 63 characters or the counter would overflow `i32`.
    pub fn increment(&self) -> String {
        let mut inner = self.0.lock();

        let Some(next) = inner.counter.checked_add(1) else {
            return inner.value();
        };
        if next > i32::MAX as u32 {
            return inner.value();
        }

        if Inner::rendered_len(&inner.base, next) <= MAX_LEN {
            inner.counter = next;
        }

        inner.value()
    }

    /// Replaces the base with the current rendered value and resets the
    /// counter to 1, iff the resulting `base.1` still fits in 63 characters.
    pub fn extend(&self) -> String {
        let mut inner = self.0.lock();

        let new_base = inner.value();
        if Inner::rendered_len(&new_base, 1) <= MAX_LEN {
            inner.base = new_base;
            inner.counter = 1;
        }

        inner.value()
    }
}

impl Default for Cv {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn increments_monotonically() {
        let cv = Cv::new();
        let first = cv.value();
        let second = cv.increment();
        assert_ne!(first, second);
        assert!(second.ends_with(".2"));
    }

    #[test]
    fn increment_refuses_past_length_bound() {
        let cv = Cv::new();
        // Drive the counter up until the rendered length hits the bound.
        let mut last = cv.value();
        loop {
            let next = cv.increment();
            if next == last {
                break;
            }
            assert!(next.len() <= 63);
            last = next;
        }
        // Further increments are no-ops.
        assert_eq!(cv.increment(), last);
        assert_eq!(last.len(), 63);
    }

    #[test]
    fn extend_resets_counter() {
        let cv = Cv::new();
        cv.increment();
        cv.increment();
        let extended = cv.extend();
        assert!(extended.ends_with(".1"));
        assert!(extended.len() > cv.value().len() - 2);
    }

    #[test]
    fn extend_refuses_when_it_would_overflow() {
        let cv = Cv::new();
        // Repeated extends keep prefixing `.1` onto the base; eventually the
        // next extension would not fit and must be a no-op.
        let mut last = cv.value();
        for _ in 0..20 {
            let next = cv.extend();
            if next == last {
                break;
            }
            assert!(next.len() <= 63);
            last = next;
        }
        assert_eq!(cv.extend(), last);
    }
}
