//! Debounce and throttle scheduling for outbound synchronization.
//!
//! Both schedulers wrap a synchronous action and run their timers as tokio
//! tasks. Every call and every cancellation bumps a generation counter; a
//! timer only fires if the generation it was armed with is still current, so
//! a superseded or cancelled timer that already woke up does nothing.
//!
//! The action always runs outside the scheduler's lock, so it may call back
//! into the same scheduler.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type ActionFn<A> = Arc<dyn Fn(A) + Send + Sync>;

struct Timer<A> {
    generation: u64,
    pending: Option<A>,
    handle: Option<JoinHandle<()>>,
}

impl<A> Timer<A> {
    fn new() -> Self {
        Self {
            generation: 0,
            pending: None,
            handle: None,
        }
    }

    fn disarm(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Debouncer
// =============================================================================

/// Coalesces bursts of calls into one action fired `delay` after the last
/// call, with the latest arguments.
///
/// With leading-edge firing the first call of a burst fires immediately and
/// the trailing fire only happens if more calls arrived during the burst.
pub struct Debouncer<A: Send + 'static> {
    delay: Duration,
    leading: bool,
    action: ActionFn<A>,
    timer: Arc<Mutex<Timer<A>>>,
}

impl<A: Send + 'static> Debouncer<A> {
    /// Trailing-edge debouncer.
    pub fn new(delay: Duration, action: impl Fn(A) + Send + Sync + 'static) -> Self {
        Self {
            delay,
            leading: false,
            action: Arc::new(action),
            timer: Arc::new(Mutex::new(Timer::new())),
        }
    }

    /// Also fire on the first call of a burst.
    pub fn with_leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    /// The configured delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Signal a call. Must run inside a tokio runtime.
    pub fn call(&self, args: A) {
        let fire_now = {
            let mut timer = lock(&self.timer);
            let in_burst = timer.handle.is_some();
            timer.disarm();

            let fire_now = if self.leading && !in_burst {
                Some(args)
            } else {
                timer.pending = Some(args);
                None
            };

            let generation = timer.generation;
            let shared = Arc::clone(&self.timer);
            let action = Arc::clone(&self.action);
            let delay = self.delay;
            timer.handle = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let args = {
                    let mut timer = lock(&shared);
                    if timer.generation != generation {
                        return;
                    }
                    timer.handle = None;
                    timer.pending.take()
                };
                if let Some(args) = args {
                    action(args);
                }
            }));
            fire_now
        };

        if let Some(args) = fire_now {
            (self.action)(args);
        }
    }

    /// Whether a timer is armed.
    pub fn is_pending(&self) -> bool {
        lock(&self.timer).handle.is_some()
    }

    /// Discard the armed timer and pending arguments. Safe to repeat.
    pub fn cancel(&self) {
        let mut timer = lock(&self.timer);
        timer.disarm();
        timer.pending = None;
    }
}

impl<A: Send + 'static> Drop for Debouncer<A> {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// Throttler
// =============================================================================

struct ThrottleState<A> {
    timer: Timer<A>,
    last_fire: Option<Instant>,
}

/// Fires at most once per `delay` window.
///
/// With leading firing a call in an open window fires immediately. A call
/// inside a closed window stores its arguments and arms exactly one trailing
/// fire at the end of the window; later calls in the same window only
/// replace the stored arguments.
pub struct Throttler<A: Send + 'static> {
    delay: Duration,
    leading: bool,
    trailing: bool,
    action: ActionFn<A>,
    state: Arc<Mutex<ThrottleState<A>>>,
}

impl<A: Send + 'static> Throttler<A> {
    /// Throttler firing on both edges.
    pub fn new(delay: Duration, action: impl Fn(A) + Send + Sync + 'static) -> Self {
        Self {
            delay,
            leading: true,
            trailing: true,
            action: Arc::new(action),
            state: Arc::new(Mutex::new(ThrottleState {
                timer: Timer::new(),
                last_fire: None,
            })),
        }
    }

    /// Enable or disable leading-edge firing.
    pub fn with_leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    /// Enable or disable trailing-edge firing.
    pub fn with_trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    /// The configured window.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Signal a call. Must run inside a tokio runtime.
    pub fn call(&self, args: A) {
        let fire_now = {
            let mut state = lock(&self.state);
            let now = Instant::now();
            let window_open = state
                .last_fire
                .map_or(true, |last| now.duration_since(last) >= self.delay);

            if window_open && state.timer.handle.is_none() && self.leading {
                state.last_fire = Some(now);
                Some(args)
            } else {
                if self.trailing {
                    state.timer.pending = Some(args);
                    if state.timer.handle.is_none() {
                        let fire_at = match state.last_fire {
                            Some(last) if !window_open => last + self.delay,
                            _ => now + self.delay,
                        };
                        self.arm_trailing(&mut state, fire_at);
                    }
                }
                None
            }
        };

        if let Some(args) = fire_now {
            (self.action)(args);
        }
    }

    fn arm_trailing(&self, state: &mut ThrottleState<A>, fire_at: Instant) {
        let generation = state.timer.generation;
        let shared = Arc::clone(&self.state);
        let action = Arc::clone(&self.action);
        state.timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            let args = {
                let mut state = lock(&shared);
                if state.timer.generation != generation {
                    return;
                }
                state.timer.handle = None;
                let args = state.timer.pending.take();
                if args.is_some() {
                    state.last_fire = Some(Instant::now());
                }
                args
            };
            if let Some(args) = args {
                action(args);
            }
        }));
    }

    /// Whether a trailing fire is armed.
    pub fn is_pending(&self) -> bool {
        lock(&self.state).timer.handle.is_some()
    }

    /// Discard the trailing timer and pending arguments and reopen the
    /// window. Safe to repeat.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.timer.disarm();
        state.timer.pending = None;
        state.last_fire = None;
    }
}

impl<A: Send + 'static> Drop for Throttler<A> {
    fn drop(&mut self) {
        self.cancel();
    }
}
