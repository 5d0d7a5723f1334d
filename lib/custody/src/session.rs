//! HSM Session Manager
//!
//! Owns the single current session for a slot and replaces it atomically.
//! Readers clone an `Arc` to the session under a read lock, so a replacement
//! never tears a handle out from under an in-flight operation.
//!
//! Two replacement paths exist:
//! - [`SessionManager::reconnect`]: bounded retry, used on demand when a key
//!   lookup fails
//! - [`SessionManager::keep_alive`]: periodic proactive refresh with no retry;
//!   the first failure is returned to the caller, which treats it as fatal
//!
//! Replacements are serialized. A reconnect for a session that has already
//! been replaced reuses the replacement.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::device::{HsmDevice, HsmSession};
use crate::error::CustodyError;

/// Interval between proactive session refreshes.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(12 * 60);

/// Bounded retry policy for reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay between consecutive attempts. No delay follows the last attempt.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            delay: Duration::from_millis(200),
        }
    }
}

/// Source of blocking delays between reconnect attempts.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Clock backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Shared owner of the current HSM session.
pub struct SessionManager<D: HsmDevice> {
    device: D,
    slot_index: usize,
    pin: Zeroizing<String>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    current: RwLock<Arc<D::Session>>,
    // Held while a replacement session is being opened
    replacing: Mutex<()>,
}

impl<D: HsmDevice> SessionManager<D> {
    /// Open the initial session. No retry is attempted here; a failure means
    /// the device is unusable at start-up.
    pub fn connect(device: D, slot_index: usize, pin: impl Into<String>) -> Result<Self, CustodyError> {
        let pin = Zeroizing::new(pin.into());
        let session = device.open_session(slot_index, &pin)?;
        info!(slot_index, "HSM session established");

        Ok(Self {
            device,
            slot_index,
            pin,
            policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            current: RwLock::new(Arc::new(session)),
            replacing: Mutex::new(()),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Open a new session on the configured slot without installing it.
    pub fn open(&self) -> Result<D::Session, CustodyError> {
        self.device.open_session(self.slot_index, &self.pin)
    }

    /// The current session.
    pub fn current(&self) -> Result<Arc<D::Session>, CustodyError> {
        self.current
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| CustodyError::Internal("Session lock poisoned".into()))
    }

    fn replace(&self, session: D::Session) -> Result<Arc<D::Session>, CustodyError> {
        let session = Arc::new(session);
        let mut guard = self
            .current
            .write()
            .map_err(|_| CustodyError::Internal("Session lock poisoned".into()))?;
        *guard = session.clone();
        Ok(session)
    }

    fn lock_replacing(&self) -> Result<MutexGuard<'_, ()>, CustodyError> {
        self.replacing
            .lock()
            .map_err(|_| CustodyError::Internal("Session replacement lock poisoned".into()))
    }

    /// Replace `stale` with a new session, with bounded retry.
    ///
    /// Reconnects are serialized. If another caller has already replaced
    /// `stale`, its replacement is returned and no session is opened.
    ///
    /// Fails with [`CustodyError::Session`] carrying the last underlying cause
    /// once every attempt has failed.
    pub fn reconnect(&self, stale: &Arc<D::Session>) -> Result<Arc<D::Session>, CustodyError> {
        let _replacing = self.lock_replacing()?;

        let current = self.current()?;
        if !Arc::ptr_eq(&current, stale) {
            debug!("HSM session already replaced");
            return Ok(current);
        }

        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts {
            match self.open() {
                Ok(session) => {
                    info!(attempt, "Reconnected to HSM");
                    return self.replace(session);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "HSM reconnect attempt failed");
                    last_error = Some(e);
                    if attempt < self.policy.max_attempts {
                        self.clock.sleep(self.policy.delay);
                    }
                }
            }
        }

        error!(
            attempts = self.policy.max_attempts,
            "Reconnecting to HSM failed"
        );
        let cause = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts configured".to_string());
        Err(CustodyError::Session(format!(
            "reconnect failed after {} attempts: {}",
            self.policy.max_attempts, cause
        )))
    }

    /// Open a single new session and install it. No retry.
    pub fn refresh(&self) -> Result<(), CustodyError> {
        let _replacing = self.lock_replacing()?;
        let session = self.open()?;
        self.replace(session)?;
        Ok(())
    }

    /// Log the current session out.
    pub fn logout(&self) -> Result<(), CustodyError> {
        self.current()?.logout()
    }

    /// Refresh the session every `interval`, forever.
    ///
    /// Returns only when a refresh fails, yielding that error. The first
    /// refresh happens one full interval after the call.
    pub async fn keep_alive(self: Arc<Self>, interval: Duration) -> CustodyError {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            info!("Refreshing HSM session to keep it alive");

            let manager = self.clone();
            match tokio::task::spawn_blocking(move || manager.refresh()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return e,
                Err(e) => {
                    return CustodyError::Internal(format!("Keep-alive task failed: {}", e));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::KeyClass;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Reversible toy cipher enforcing the OAEP input limit. Sessions can be
    /// invalidated to simulate a device dropping them.
    pub(crate) struct MockDevice {
        pub opens: AtomicUsize,
        /// Opens numbered in this list (1-based) fail with a session error.
        pub failing_opens: Mutex<Vec<usize>>,
        /// When set, every open after the first fails.
        pub fail_after_first: AtomicBool,
        /// When set, freshly opened sessions have no key objects.
        pub missing_keys: AtomicBool,
        /// When set, a successful open expires every earlier session.
        pub close_on_open: AtomicBool,
        pub encrypts: AtomicUsize,
        pub decrypts: AtomicUsize,
        sessions: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl MockDevice {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                failing_opens: Mutex::new(Vec::new()),
                fail_after_first: AtomicBool::new(false),
                missing_keys: AtomicBool::new(false),
                close_on_open: AtomicBool::new(false),
                encrypts: AtomicUsize::new(0),
                decrypts: AtomicUsize::new(0),
                sessions: Mutex::new(Vec::new()),
            })
        }

        /// Mark every session opened so far as expired.
        pub fn expire_sessions(&self) {
            for valid in self.sessions.lock().unwrap().iter() {
                valid.store(false, Ordering::SeqCst);
            }
        }

        pub fn fail_opens(&self, opens: &[usize]) {
            self.failing_opens.lock().unwrap().extend_from_slice(opens);
        }
    }

    pub(crate) struct MockSession {
        device: Arc<MockDevice>,
        valid: Arc<AtomicBool>,
        has_keys: bool,
        pub id: usize,
    }

    const XOR_MASK: u8 = 0x5a;

    impl HsmSession for MockSession {
        type Key = KeyClass;

        fn find_key(&self, class: KeyClass) -> Result<KeyClass, CustodyError> {
            if !self.valid.load(Ordering::SeqCst) || !self.has_keys {
                return Err(CustodyError::Object(format!("no {} key object", class)));
            }
            Ok(class)
        }

        fn encrypt(&self, key: KeyClass, plaintext: &[u8]) -> Result<Vec<u8>, CustodyError> {
            assert_eq!(key, KeyClass::Public);
            if plaintext.len() > 190 {
                return Err(CustodyError::Cryptography("data too large".into()));
            }
            self.device.encrypts.fetch_add(1, Ordering::SeqCst);
            let mut block: Vec<u8> = plaintext.iter().map(|b| b ^ XOR_MASK).collect();
            block.reverse();
            Ok(block)
        }

        fn decrypt(&self, key: KeyClass, ciphertext: &[u8]) -> Result<Vec<u8>, CustodyError> {
            assert_eq!(key, KeyClass::Private);
            if ciphertext.len() != 190 {
                return Err(CustodyError::Cryptography("invalid ciphertext length".into()));
            }
            self.device.decrypts.fetch_add(1, Ordering::SeqCst);
            let mut block: Vec<u8> = ciphertext.iter().map(|b| b ^ XOR_MASK).collect();
            block.reverse();
            Ok(block)
        }
    }

    impl HsmDevice for Arc<MockDevice> {
        type Session = MockSession;

        fn open_session(&self, slot_index: usize, pin: &str) -> Result<MockSession, CustodyError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if slot_index != 0 {
                return Err(CustodyError::Slot("slot not found".into()));
            }
            if pin != "1234" {
                return Err(CustodyError::Login("incorrect PIN".into()));
            }
            if self.failing_opens.lock().unwrap().contains(&n)
                || (n > 1 && self.fail_after_first.load(Ordering::SeqCst))
            {
                return Err(CustodyError::Session(format!("open {} refused", n)));
            }

            if self.close_on_open.load(Ordering::SeqCst) {
                self.expire_sessions();
            }
            let valid = Arc::new(AtomicBool::new(true));
            self.sessions.lock().unwrap().push(valid.clone());
            Ok(MockSession {
                device: self.clone(),
                valid,
                has_keys: !self.missing_keys.load(Ordering::SeqCst),
                id: n,
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingClock {
        pub sleeps: Mutex<Vec<Duration>>,
    }

    impl Clock for RecordingClock {
        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    fn manager(device: &Arc<MockDevice>) -> (SessionManager<Arc<MockDevice>>, Arc<RecordingClock>) {
        let clock = Arc::new(RecordingClock::default());
        let manager = SessionManager::connect(device.clone(), 0, "1234")
            .unwrap()
            .with_clock(clock.clone());
        (manager, clock)
    }

    #[test]
    fn test_connect_propagates_login_error() {
        let device = MockDevice::new();
        let err = SessionManager::connect(device, 0, "0000").err().unwrap();
        assert!(matches!(err, CustodyError::Login(_)));
    }

    #[test]
    fn test_connect_propagates_slot_error() {
        let device = MockDevice::new();
        let err = SessionManager::connect(device, 3, "1234").err().unwrap();
        assert!(matches!(err, CustodyError::Slot(_)));
    }

    #[test]
    fn test_reconnect_fails_after_four_attempts() {
        let device = MockDevice::new();
        let (manager, clock) = manager(&device);
        device.fail_opens(&[2, 3, 4, 5]);

        let err = manager.reconnect(&manager.current().unwrap()).err().unwrap();

        assert!(matches!(err, CustodyError::Session(_)));
        assert!(err.to_string().contains("open 5 refused"));
        assert_eq!(device.opens.load(Ordering::SeqCst), 5);
        assert_eq!(
            *clock.sleeps.lock().unwrap(),
            vec![Duration::from_millis(200); 3]
        );
        // The previous session stays installed
        assert_eq!(manager.current().unwrap().id, 1);
    }

    #[test]
    fn test_reconnect_stops_on_first_success() {
        let device = MockDevice::new();
        let (manager, clock) = manager(&device);
        device.fail_opens(&[2, 3]);

        let session = manager.reconnect(&manager.current().unwrap()).unwrap();

        assert_eq!(session.id, 4);
        assert_eq!(device.opens.load(Ordering::SeqCst), 4);
        assert_eq!(clock.sleeps.lock().unwrap().len(), 2);
        assert_eq!(manager.current().unwrap().id, 4);
        assert!(session.find_key(KeyClass::Public).is_ok());
    }

    #[test]
    fn test_reconnect_respects_custom_policy() {
        let device = MockDevice::new();
        let (manager, clock) = manager(&device);
        let manager = manager.with_retry_policy(RetryPolicy::new(2, Duration::from_millis(5)));
        device.fail_after_first.store(true, Ordering::SeqCst);

        assert!(manager.reconnect(&manager.current().unwrap()).is_err());
        assert_eq!(device.opens.load(Ordering::SeqCst), 3);
        assert_eq!(
            *clock.sleeps.lock().unwrap(),
            vec![Duration::from_millis(5)]
        );
    }

    #[test]
    fn test_reconnect_with_replaced_session_reuses_current() {
        let device = MockDevice::new();
        let (manager, clock) = manager(&device);
        let stale = manager.current().unwrap();
        let replaced = manager.reconnect(&stale).unwrap();

        let session = manager.reconnect(&stale).unwrap();

        assert!(Arc::ptr_eq(&session, &replaced));
        assert_eq!(session.id, 2);
        assert_eq!(device.opens.load(Ordering::SeqCst), 2);
        assert!(clock.sleeps.lock().unwrap().is_empty());
    }

    #[test]
    fn test_refresh_replaces_current_session() {
        let device = MockDevice::new();
        let (manager, _clock) = manager(&device);
        let before = manager.current().unwrap();

        manager.refresh().unwrap();

        assert_eq!(before.id, 1);
        assert_eq!(manager.current().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_keep_alive_returns_first_refresh_error() {
        let device = MockDevice::new();
        let (manager, _clock) = manager(&device);
        let manager = Arc::new(manager);
        device.fail_opens(&[4]);

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            manager.clone().keep_alive(Duration::from_millis(10)),
        )
        .await
        .unwrap();

        assert!(matches!(err, CustodyError::Session(_)));
        // Two successful refreshes, then the failing one; no retry
        assert_eq!(device.opens.load(Ordering::SeqCst), 4);
        assert_eq!(manager.current().unwrap().id, 3);
    }
}
