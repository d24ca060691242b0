//! Per-session timeout watchdog.
//!
//! The watchdog owns no protocol state. It watches a deadline the session
//! refreshes after every completed wire operation and, after two consecutive
//! timeout reports, fires the session's [`CancelToken`] so the next
//! cancellation check tears the session down.

use std::{
  sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

use crate::transport::CancelToken;

const TICK: Duration = Duration::from_millis(500);
const ESCALATION_THRESHOLD: u32 = 2;

struct Shared {
  /// Millis since `epoch` at which the current operation expires; 0 = idle.
  deadline_ms: AtomicU64,
  timeouts: AtomicU32,
  shutdown: AtomicBool,
}

pub struct Watchdog {
  shared: Arc<Shared>,
  epoch: Instant,
  handle: Option<std::thread::JoinHandle<()>>,
}

impl Watchdog {
  /// Spawn a watchdog that fires `cancel` after two consecutive timeouts.
  pub fn spawn(cancel: CancelToken) -> Self {
    let shared = Arc::new(Shared {
      deadline_ms: AtomicU64::new(0),
      timeouts: AtomicU32::new(0),
      shutdown: AtomicBool::new(false),
    });
    let epoch = Instant::now();

    let thread_shared = shared.clone();
    let handle = std::thread::Builder::new()
      .name("crossflash-watchdog".into())
      .spawn(move || loop {
        if thread_shared.shutdown.load(Ordering::SeqCst) {
          break;
        }

        let deadline = thread_shared.deadline_ms.load(Ordering::SeqCst);
        if deadline != 0 {
          let now = epoch.elapsed().as_millis() as u64;
          if now > deadline {
            let strikes = thread_shared.timeouts.fetch_add(1, Ordering::SeqCst) + 1;
            thread_shared.deadline_ms.store(0, Ordering::SeqCst);
            tracing::warn!("watchdog: operation overran its budget (strike {})", strikes);
            if strikes >= ESCALATION_THRESHOLD {
              tracing::error!("watchdog: escalating to forced disconnect");
              cancel.cancel();
              break;
            }
          }
        }

        std::thread::sleep(TICK);
      })
      .expect("failed to spawn watchdog thread");

    Self {
      shared,
      epoch,
      handle: Some(handle),
    }
  }

  /// Arm the watchdog for an operation with the given budget.
  pub fn arm(&self, budget: Duration) {
    let deadline = (self.epoch.elapsed() + budget).as_millis() as u64;
    self.shared.deadline_ms.store(deadline.max(1), Ordering::SeqCst);
  }

  /// Report a completed operation, clearing the strike counter.
  pub fn feed(&self) {
    self.shared.deadline_ms.store(0, Ordering::SeqCst);
    self.shared.timeouts.store(0, Ordering::SeqCst);
  }

  /// Report an operation that timed out at the I/O layer.
  pub fn strike(&self) -> u32 {
    self.shared.deadline_ms.store(0, Ordering::SeqCst);
    self.shared.timeouts.fetch_add(1, Ordering::SeqCst) + 1
  }
}

impl Drop for Watchdog {
  fn drop(&mut self) {
    self.shared.shutdown.store(true, Ordering::SeqCst);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fires_cancel_after_two_overruns() {
    let cancel = CancelToken::new();
    let watchdog = Watchdog::spawn(cancel.clone());

    watchdog.arm(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(700));
    assert!(!cancel.is_cancelled());

    watchdog.arm(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(1200));
    assert!(cancel.is_cancelled());
  }

  #[test]
  fn feed_resets_the_strike_counter() {
    let cancel = CancelToken::new();
    let watchdog = Watchdog::spawn(cancel.clone());

    watchdog.arm(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(700));
    watchdog.feed();

    watchdog.arm(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(700));
    assert!(!cancel.is_cancelled());
  }
}
