//! PKCS#11 device via cryptoki
//!
//! The module is loaded and initialized once, on the first session open.
//! Keys are looked up by object class on every operation.
//!
//! Opening a session closes every session this device previously opened on
//! the same slot. An in-flight operation on an old session finishes before
//! that session is closed.

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsOaepParams, PkcsOaepSource};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info};

use super::{HsmDevice, HsmSession, KeyClass};
use crate::error::CustodyError;

/// A session handle its device can close.
trait Closeable {
    fn close(self) -> Result<(), CustodyError>;
}

impl Closeable for Session {
    fn close(self) -> Result<(), CustodyError> {
        Session::close(self);
        Ok(())
    }
}

/// Session slot shared between the device and the session wrapper. `None`
/// once the device has closed it.
type SharedSession<S> = Arc<Mutex<Option<S>>>;

/// Sessions opened per slot index.
struct SlotSessions<S> {
    opened: Mutex<HashMap<usize, Vec<Weak<Mutex<Option<S>>>>>>,
}

impl<S: Closeable> SlotSessions<S> {
    fn new() -> Self {
        Self {
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// Close every live session previously opened on `slot_index`, then open
    /// and track a new one. Nothing is opened if a close fails.
    fn reopen(
        &self,
        slot_index: usize,
        open: impl FnOnce() -> Result<S, CustodyError>,
    ) -> Result<SharedSession<S>, CustodyError> {
        let mut opened = self
            .opened
            .lock()
            .map_err(|_| CustodyError::Internal("PKCS#11 session registry lock poisoned".into()))?;

        let mut close_error = None;
        for handle in opened
            .remove(&slot_index)
            .unwrap_or_default()
            .iter()
            .filter_map(Weak::upgrade)
        {
            let previous = handle.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(previous) = previous
                && let Err(e) = previous.close()
            {
                close_error.get_or_insert(e);
            }
        }
        if let Some(e) = close_error {
            return Err(e);
        }

        let session = Arc::new(Mutex::new(Some(open()?)));
        opened.insert(slot_index, vec![Arc::downgrade(&session)]);
        Ok(session)
    }
}

/// PKCS#11 module on disk, initialized lazily.
pub struct Pkcs11Device {
    library_path: PathBuf,
    context: Mutex<Option<Pkcs11>>,
    sessions: SlotSessions<Session>,
}

impl Pkcs11Device {
    pub fn new(library_path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: library_path.into(),
            context: Mutex::new(None),
            sessions: SlotSessions::new(),
        }
    }

    fn context(&self) -> Result<Pkcs11, CustodyError> {
        let mut guard = self
            .context
            .lock()
            .map_err(|_| CustodyError::Internal("PKCS#11 context lock poisoned".into()))?;

        if let Some(pkcs11) = guard.as_ref() {
            return Ok(pkcs11.clone());
        }

        info!("Loading PKCS#11 module from {}", self.library_path.display());
        let pkcs11 = Pkcs11::new(&self.library_path)
            .map_err(|e| CustodyError::Initialize(e.to_string()))?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| CustodyError::Initialize(e.to_string()))?;

        *guard = Some(pkcs11.clone());
        Ok(pkcs11)
    }
}

impl HsmDevice for Pkcs11Device {
    type Session = Pkcs11Session;

    fn open_session(&self, slot_index: usize, pin: &str) -> Result<Pkcs11Session, CustodyError> {
        let pkcs11 = self.context()?;

        let slots = pkcs11
            .get_slots_with_token()
            .map_err(|e| CustodyError::Slot(e.to_string()))?;
        let slot = slots.get(slot_index).copied().ok_or_else(|| {
            CustodyError::Slot(format!(
                "slot {} not found ({} available)",
                slot_index,
                slots.len()
            ))
        })?;

        let session = self.sessions.reopen(slot_index, || {
            let session = pkcs11
                .open_rw_session(slot)
                .map_err(|e| CustodyError::Session(e.to_string()))?;
            session
                .login(UserType::User, Some(&AuthPin::new(pin.into())))
                .map_err(|e| CustodyError::Login(e.to_string()))?;
            Ok(session)
        })?;

        debug!(slot_index, "Opened PKCS#11 session");

        Ok(Pkcs11Session { session })
    }
}

/// Logged-in PKCS#11 session.
pub struct Pkcs11Session {
    session: SharedSession<Session>,
}

impl Pkcs11Session {
    /// Run `f` against the open session. `closed` builds the error returned
    /// when the device has already closed it.
    fn with_session<T>(
        &self,
        closed: fn(String) -> CustodyError,
        f: impl FnOnce(&Session) -> Result<T, CustodyError>,
    ) -> Result<T, CustodyError> {
        let guard = self
            .session
            .lock()
            .map_err(|_| CustodyError::Internal("PKCS#11 session lock poisoned".into()))?;
        let session = guard
            .as_ref()
            .ok_or_else(|| closed("session closed".to_string()))?;
        f(session)
    }
}

fn object_class(class: KeyClass) -> ObjectClass {
    match class {
        KeyClass::Public => ObjectClass::PUBLIC_KEY,
        KeyClass::Private => ObjectClass::PRIVATE_KEY,
    }
}

fn oaep_mechanism() -> Mechanism<'static> {
    Mechanism::RsaPkcsOaep(PkcsOaepParams::new(
        MechanismType::SHA256,
        PkcsMgfType::MGF1_SHA256,
        PkcsOaepSource::empty(),
    ))
}

impl HsmSession for Pkcs11Session {
    type Key = ObjectHandle;

    fn find_key(&self, class: KeyClass) -> Result<ObjectHandle, CustodyError> {
        self.with_session(CustodyError::Object, |session| {
            let template = vec![Attribute::Class(object_class(class))];
            let handles = session
                .find_objects(&template)
                .map_err(|e| CustodyError::Object(e.to_string()))?;
            handles
                .into_iter()
                .next()
                .ok_or_else(|| CustodyError::Object(format!("no {} key object on session", class)))
        })
    }

    fn encrypt(&self, key: ObjectHandle, plaintext: &[u8]) -> Result<Vec<u8>, CustodyError> {
        self.with_session(CustodyError::Session, |session| {
            session
                .encrypt(&oaep_mechanism(), key, plaintext)
                .map_err(|e| CustodyError::Cryptography(e.to_string()))
        })
    }

    fn decrypt(&self, key: ObjectHandle, ciphertext: &[u8]) -> Result<Vec<u8>, CustodyError> {
        self.with_session(CustodyError::Session, |session| {
            session
                .decrypt(&oaep_mechanism(), key, ciphertext)
                .map_err(|e| CustodyError::Cryptography(e.to_string()))
        })
    }

    fn logout(&self) -> Result<(), CustodyError> {
        self.with_session(CustodyError::Logout, |session| {
            session
                .logout()
                .map_err(|e| CustodyError::Logout(e.to_string()))
        })
    }
}
