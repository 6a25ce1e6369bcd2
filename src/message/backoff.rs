use std::time::Duration;

/// Provides a mechanism for attempting an operation and retrying it, with a
/// backoff, if it fails.
///
/// This iterator yields the durations to wait between attempts: the first
/// is the initial delay, and each later one grows by a constant factor up to
/// some maximum delay. Upon reaching the maximum delay, that value is
/// returned from then on, until the attempt budget is spent.
///
/// The `retry` function uses [std::thread::sleep] for the delay; so do NOT
/// use this with asynchronous code.
pub struct ExponentialBackoff {
    curr: Duration,
    max: Duration,
    factor: u32,
    remaining: usize,
}

impl ExponentialBackoff {
    pub fn new(start: Duration, max: Duration, factor: u32, attempts: usize) -> ExponentialBackoff {
        ExponentialBackoff {
            curr: start,
            max,
            factor,
            remaining: attempts,
        }
    }

    /// Call `f` until it returns [Ok], sleeping between attempts. On each
    /// failure `on_err` is invoked with the error and the upcoming delay,
    /// which allows logging the failures which would otherwise be hidden.
    /// If the attempt budget is spent, the last error is returned.
    pub fn retry<F, S, T, E>(self, mut f: F, on_err: S) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        S: Fn(&E, Duration),
    {
        let mut delays = self.peekable();

        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) => match delays.next() {
                    Some(delay) if delays.peek().is_some() => {
                        on_err(&e, delay);
                        std::thread::sleep(delay);
                    }
                    _ => return Err(e),
                },
            }
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let this = self.curr;
        self.curr = (self.curr * self.factor).min(self.max);
        Some(this)
    }
}

#[cfg(test)]
mod test {
    use super::ExponentialBackoff;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn delays_grow_geometrically_to_the_cap() {
        let delays: Vec<_> = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5), 2, 5)
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn retry_stops_at_first_success() {
        let calls = Cell::new(0);
        let result: Result<usize, ()> = ExponentialBackoff::new(Duration::from_millis(0), Duration::from_millis(0), 2, 10)
            .retry(|| {
                calls.set(calls.get() + 1);
                if calls.get() == 3 { Ok(calls.get()) } else { Err(()) }
            }, |_, _| {});
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn retry_returns_the_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), usize> = ExponentialBackoff::new(Duration::from_millis(0), Duration::from_millis(0), 2, 3)
            .retry(|| {
                calls.set(calls.get() + 1);
                Err(calls.get())
            }, |_, _| {});
        assert_eq!(result, Err(3));
    }
}
