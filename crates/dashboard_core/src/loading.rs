use std::{collections::HashMap, time::Duration};

use tokio::task::JoinHandle;

use crate::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadingToken(pub(crate) u64);

struct ActiveLoad {
    operation: Operation,
    timer: JoinHandle<()>,
}

/// Tracks in-flight operations, each with its own cancellable timeout.
///
/// The busy flag is "any token live". A token leaves the set exactly once,
/// either through [`complete`](Self::complete) or [`expire`](Self::expire).
pub struct LoadingGuard {
    window: Duration,
    next_token: u64,
    active: HashMap<LoadingToken, ActiveLoad>,
}

impl LoadingGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            next_token: 0,
            active: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// `spawn_timer` must call [`expire`](Self::expire) with the token once the
    /// window has elapsed.
    pub fn arm<F>(&mut self, operation: Operation, spawn_timer: F) -> LoadingToken
    where
        F: FnOnce(LoadingToken, Duration) -> JoinHandle<()>,
    {
        self.next_token += 1;
        let token = LoadingToken(self.next_token);
        let timer = spawn_timer(token, self.window);
        self.active.insert(token, ActiveLoad { operation, timer });
        token
    }

    /// Marks the operation answered. Returns `false` if it had already expired.
    pub fn complete(&mut self, token: LoadingToken) -> bool {
        match self.active.remove(&token) {
            Some(load) => {
                load.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Called by the token's own timer.
    pub fn expire(&mut self, token: LoadingToken) -> Option<Operation> {
        self.active.remove(&token).map(|load| load.operation)
    }

    pub fn is_loading(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn in_flight(&self) -> Vec<Operation> {
        let mut tokens: Vec<_> = self.active.iter().collect();
        tokens.sort_by_key(|(token, _)| **token);
        tokens.into_iter().map(|(_, load)| load.operation).collect()
    }

    pub fn cancel_all(&mut self) {
        for (_, load) in self.active.drain() {
            load.timer.abort();
        }
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
