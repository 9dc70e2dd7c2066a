// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use retry::{delay::Fixed, retry, OperationResult};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock `mutex`, carrying on if a previous holder panicked. The protected
/// state is always left consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `done` every `interval` until it returns true or `timeout` passes.
/// Returns whether it succeeded.
pub(crate) fn poll_until(timeout: Duration, interval: Duration, mut done: impl FnMut() -> bool) -> bool {
    let interval = interval.max(Duration::from_millis(1));
    let polls = (timeout.as_millis() / interval.as_millis()) as usize;
    let delays = Fixed::from_millis(interval.as_millis() as u64).take(polls);
    retry(delays, || {
        if done() {
            OperationResult::Ok(())
        } else {
            OperationResult::Retry(())
        }
    })
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polls_until_done() {
        let mut calls = 0;
        assert!(poll_until(Duration::from_millis(50), Duration::from_millis(1), || {
            calls += 1;
            calls == 3
        }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_timeout() {
        let mut calls = 0;
        assert!(!poll_until(Duration::from_millis(4), Duration::from_millis(2), || {
            calls += 1;
            false
        }));
        // One initial try plus one per interval.
        assert_eq!(calls, 3);
    }
}
