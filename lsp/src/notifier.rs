//! De-duplication of user-facing server error notifications.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(30);

/// Remembers the last error shown per server so a crash loop produces
/// one notification instead of one per attempt.
#[derive(Debug)]
pub struct ErrorNotifier {
    expiry: Duration,
    shown: Mutex<HashMap<String, (String, Instant)>>,
}

impl Default for ErrorNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRY)
    }
}

impl ErrorNotifier {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            shown: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `message` should be shown for `server` now. A `true` answer
    /// records it as shown.
    pub fn should_notify(&self, server: &str, message: &str) -> bool {
        let now = Instant::now();
        let mut shown = self.shown.lock();
        if let Some((last, at)) = shown.get(server)
            && last == message
            && now.duration_since(*at) < self.expiry
        {
            return false;
        }
        shown.insert(server.to_string(), (message.to_string(), now));
        true
    }

    /// Forget the last error, e.g. after a successful start.
    pub fn clear(&self, server: &str) {
        self.shown.lock().remove(server);
    }
}
