use std::fmt;

use tokio::sync::watch;

/// How a scheduler reached [`LifecycleState::Finished`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
  /// `true` when the shutdown grace timeout expired with work still queued.
  pub forced: bool,
  /// Number of never-admitted tasks left in the pending queue at that moment.
  pub abandoned: usize,
}

impl Completion {
  pub(crate) fn drained() -> Self {
    Self {
      forced: false,
      abandoned: 0,
    }
  }

  pub(crate) fn forced(abandoned: usize) -> Self {
    Self {
      forced: true,
      abandoned,
    }
  }

  /// `true` when every queued task was executed.
  pub fn is_lossless(&self) -> bool {
    !self.forced
  }
}

/// Lifecycle of a scheduler instance.
///
/// Idle -> Running (`start`), Running -> Draining (`stop`),
/// Draining -> Finished, Running -> Finished (queue and running set empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Idle,
  Running,
  Draining,
  Finished(Completion),
}

impl LifecycleState {
  pub fn is_finished(&self) -> bool {
    matches!(self, LifecycleState::Finished(_))
  }

  /// Admission happens only in this state.
  pub fn is_admitting(&self) -> bool {
    matches!(self, LifecycleState::Running)
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LifecycleState::Idle => f.write_str("idle"),
      LifecycleState::Running => f.write_str("running"),
      LifecycleState::Draining => f.write_str("draining"),
      LifecycleState::Finished(c) if c.forced => write!(f, "finished (forced, {} abandoned)", c.abandoned),
      LifecycleState::Finished(_) => f.write_str("finished"),
    }
  }
}

/// Single-writer-at-a-time, many-reader holder of a [`LifecycleState`].
/// Transitions are compare-and-set under the channel's lock and wake every
/// waiter on change.
#[derive(Debug)]
pub(crate) struct StateCell {
  tx: watch::Sender<LifecycleState>,
}

impl StateCell {
  pub(crate) fn new() -> Self {
    let (tx, _) = watch::channel(LifecycleState::Idle);
    Self { tx }
  }

  pub(crate) fn get(&self) -> LifecycleState {
    *self.tx.borrow()
  }

  pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
    self.tx.subscribe()
  }

  /// Applies `transition` to the current state. The closure returns the next
  /// state, or `None` to leave it untouched. Returns the state observed before
  /// the call, and whether it changed.
  pub(crate) fn transition<F>(&self, transition: F) -> (LifecycleState, bool)
  where
    F: FnOnce(LifecycleState) -> Option<LifecycleState>,
  {
    let mut previous = LifecycleState::Idle;
    let changed = self.tx.send_if_modified(|state| {
      previous = *state;
      match transition(*state) {
        Some(next) if next != *state => {
          *state = next;
          true
        }
        _ => false,
      }
    });
    (previous, changed)
  }

  /// Moves to `Finished(completion)` unless already finished or never started.
  /// Returns `true` for the one call that performed the transition.
  pub(crate) fn finish(&self, completion: Completion) -> bool {
    let (_, changed) = self.transition(|state| match state {
      LifecycleState::Running | LifecycleState::Draining => Some(LifecycleState::Finished(completion)),
      _ => None,
    });
    changed
  }

  /// Resolves once the state is `Finished`, returning its completion.
  pub(crate) async fn wait_finished(&self) -> Completion {
    let mut rx = self.subscribe();
    let finished = rx.wait_for(LifecycleState::is_finished).await.map(|state| *state);
    match finished {
      Ok(LifecycleState::Finished(completion)) => completion,
      // The sender lives as long as `self`, so the channel cannot close here.
      _ => Completion::drained(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::time::Duration;

  #[test]
  fn test_finish_is_one_shot() {
    let cell = StateCell::new();
    assert!(!cell.finish(Completion::drained()), "Idle cannot finish");

    cell.transition(|_| Some(LifecycleState::Running));
    assert!(cell.finish(Completion::forced(2)));
    assert!(!cell.finish(Completion::drained()));
    assert_eq!(cell.get(), LifecycleState::Finished(Completion::forced(2)));
  }

  #[test]
  fn test_transition_reports_previous_state() {
    let cell = StateCell::new();
    let (previous, changed) = cell.transition(|state| match state {
      LifecycleState::Idle => Some(LifecycleState::Running),
      _ => None,
    });
    assert_eq!(previous, LifecycleState::Idle);
    assert!(changed);

    let (previous, changed) = cell.transition(|state| match state {
      LifecycleState::Idle => Some(LifecycleState::Running),
      _ => None,
    });
    assert_eq!(previous, LifecycleState::Running);
    assert!(!changed);
  }

  #[tokio::test]
  async fn test_wait_finished_wakes_on_transition() {
    let cell = Arc::new(StateCell::new());
    cell.transition(|_| Some(LifecycleState::Draining));

    let waiter = {
      let cell = cell.clone();
      tokio::spawn(async move { cell.wait_finished().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    cell.finish(Completion::drained());
    let completion = tokio::time::timeout(Duration::from_millis(100), waiter)
      .await
      .expect("waiter was not woken")
      .unwrap();
    assert!(completion.is_lossless());
  }

  #[test]
  fn test_display() {
    assert_eq!(LifecycleState::Draining.to_string(), "draining");
    assert_eq!(
      LifecycleState::Finished(Completion::forced(3)).to_string(),
      "finished (forced, 3 abandoned)"
    );
  }
}
