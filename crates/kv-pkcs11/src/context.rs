//! Library state: one provider instance, its tables and its remote
//! collaborators.
//!
//! All mutable state sits behind a single mutex. Remote calls never run with
//! it held: callers snapshot what they need, release the lock, talk to the
//! vault, then re-lock and commit only if the world they snapshotted (library
//! epoch, session, operation) is still there.

use cryptoki_sys::{
    CK_C_INITIALIZE_ARGS, CK_FLAGS, CK_SESSION_HANDLE, CK_VOID_PTR,
    CKF_LIBRARY_CANT_CREATE_OS_THREADS, CKF_OS_LOCKING_OK,
};
use kv_core::{
    AccessToken, Backend, Credential, CredentialBridge, KeyService, ProviderConfig, RetryPolicy,
    VaultError, VaultResult,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::handle::HandleArena;
use crate::object::KeyObject;
use crate::session::Session;

/// The parts of `CK_C_INITIALIZE_ARGS` the provider acts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitArgs {
    pub flags: CK_FLAGS,
    /// How many of the four mutex callbacks were supplied.
    pub mutex_callbacks: u8,
    pub reserved_is_null: bool,
}

impl InitArgs {
    pub fn os_locking() -> Self {
        Self {
            flags: CKF_OS_LOCKING_OK,
            mutex_callbacks: 0,
            reserved_is_null: true,
        }
    }

    /// # Safety
    /// `ptr` must be null or point to a readable `CK_C_INITIALIZE_ARGS`.
    pub unsafe fn from_raw(ptr: CK_VOID_PTR) -> Self {
        if ptr.is_null() {
            return Self {
                reserved_is_null: true,
                ..Self::default()
            };
        }
        let args: CK_C_INITIALIZE_ARGS =
            unsafe { std::ptr::read_unaligned(ptr as *const CK_C_INITIALIZE_ARGS) };
        let mutex_callbacks = [
            args.CreateMutex.is_some(),
            args.DestroyMutex.is_some(),
            args.LockMutex.is_some(),
            args.UnlockMutex.is_some(),
        ]
        .iter()
        .filter(|supplied| **supplied)
        .count() as u8;
        Self {
            flags: args.flags,
            mutex_callbacks,
            reserved_is_null: args.pReserved.is_null(),
        }
    }

    /// The provider locks with OS primitives and runs a blocking HTTP client
    /// with its own threads; callers that rule out either are refused.
    pub fn validate(&self) -> Pkcs11Result<()> {
        if !self.reserved_is_null {
            return Err(Pkcs11Error::ArgumentsBad("pReserved must be null".into()));
        }
        match self.mutex_callbacks {
            0 => {}
            4 if self.flags & CKF_OS_LOCKING_OK != 0 => {}
            4 => return Err(Pkcs11Error::CannotLockMutex),
            _ => {
                return Err(Pkcs11Error::ArgumentsBad(
                    "mutex callbacks must be supplied all together or not at all".into(),
                ));
            }
        }
        if self.flags & CKF_LIBRARY_CANT_CREATE_OS_THREADS != 0 {
            return Err(Pkcs11Error::CannotCreateThreads);
        }
        Ok(())
    }
}

pub(crate) struct Tables {
    pub initialized: bool,
    /// Bumped on every finalize so in-flight calls can tell their snapshot is
    /// from a previous life of the library.
    pub epoch: u64,
    pub sessions: HandleArena<Session>,
    pub objects: HandleArena<KeyObject>,
    next_serial: u64,
}

impl Tables {
    pub fn session(&self, handle: CK_SESSION_HANDLE) -> Pkcs11Result<&Session> {
        self.sessions
            .get(handle)
            .ok_or(Pkcs11Error::SessionHandleInvalid)
    }

    pub fn session_mut(&mut self, handle: CK_SESSION_HANDLE) -> Pkcs11Result<&mut Session> {
        self.sessions
            .get_mut(handle)
            .ok_or(Pkcs11Error::SessionHandleInvalid)
    }

    pub fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    /// Fail unless the library is still in the life `epoch` belongs to.
    pub fn check_epoch(&self, epoch: u64) -> Pkcs11Result<()> {
        if !self.initialized || self.epoch != epoch {
            return Err(Pkcs11Error::NotInitialized);
        }
        Ok(())
    }
}

/// A provider instance: session and object tables plus the vault and the
/// shared token cache.
///
/// The exported `C_*` functions drive one process-wide instance; tests can
/// create as many independent ones as they like.
pub struct Provider {
    pub(crate) vault: Arc<dyn KeyService>,
    pub(crate) bridge: CredentialBridge,
    pub(crate) retry: RetryPolicy,
    pub(crate) key_size: usize,
    tables: Mutex<Tables>,
}

impl Provider {
    pub fn new(backend: Backend, config: &ProviderConfig) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            vault: backend.vault,
            bridge: CredentialBridge::new(
                backend.tokens,
                retry.clone(),
                config.identity.refresh_margin(),
            ),
            retry,
            key_size: config.vault.key_size,
            tables: Mutex::new(Tables {
                initialized: false,
                epoch: 0,
                sessions: HandleArena::new(),
                objects: HandleArena::new(),
                next_serial: 0,
            }),
        }
    }

    /// Build a provider for the backend `config` selects.
    pub fn from_config(config: &ProviderConfig) -> Pkcs11Result<Self> {
        let backend = Backend::from_config(config)
            .map_err(|e| Pkcs11Error::FunctionFailed(format!("backend setup failed: {e}")))?;
        Ok(Self::new(backend, config))
    }

    pub fn initialize(&self, args: InitArgs) -> Pkcs11Result<()> {
        args.validate()?;
        let mut tables = self.tables.lock();
        if tables.initialized {
            return Err(Pkcs11Error::AlreadyInitialized);
        }
        tables.initialized = true;
        info!("kv-pkcs11 initialized (epoch {})", tables.epoch);
        Ok(())
    }

    /// Close every session, drop every object and forget cached tokens.
    pub fn finalize(&self) -> Pkcs11Result<()> {
        let mut tables = self.tables.lock();
        if !tables.initialized {
            return Err(Pkcs11Error::NotInitialized);
        }
        let sessions = tables.sessions.len();
        tables.sessions.clear();
        tables.objects.clear();
        tables.initialized = false;
        tables.epoch += 1;
        drop(tables);
        self.bridge.clear();
        info!("kv-pkcs11 finalized, closed {} session(s)", sessions);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.tables.lock().initialized
    }

    /// Lock the tables of an initialized library.
    pub(crate) fn tables(&self) -> Pkcs11Result<MutexGuard<'_, Tables>> {
        let tables = self.tables.lock();
        if !tables.initialized {
            return Err(Pkcs11Error::NotInitialized);
        }
        Ok(tables)
    }

    /// Lock the tables for a commit after a remote call made during `epoch`.
    pub(crate) fn tables_for_commit(&self, epoch: u64) -> Pkcs11Result<MutexGuard<'_, Tables>> {
        let tables = self.tables.lock();
        tables.check_epoch(epoch)?;
        Ok(tables)
    }

    /// Run a key operation against the vault on behalf of `credential`.
    ///
    /// Transient failures are retried per the retry policy. A 401 means the
    /// cached token went bad early: it is dropped and the call is tried once
    /// more with a fresh one.
    pub(crate) fn call_remote<T, F>(
        &self,
        credential: &Credential,
        desc: &str,
        op: F,
    ) -> Pkcs11Result<T>
    where
        F: Fn(&dyn KeyService, &AccessToken) -> VaultResult<T>,
    {
        let token = self
            .bridge
            .resolve(credential)
            .map_err(Pkcs11Error::from_token_error)?;
        match self.retry.run(desc, || op(self.vault.as_ref(), token.as_ref())) {
            Err(VaultError::Unauthorized(msg)) => {
                debug!("{} was rejected with a cached token ({}), refreshing", desc, msg);
                self.bridge.invalidate(credential, &token);
                let token = self
                    .bridge
                    .resolve(credential)
                    .map_err(Pkcs11Error::from_token_error)?;
                self.retry
                    .run(desc, || op(self.vault.as_ref(), token.as_ref()))
                    .map_err(Pkcs11Error::from_key_error)
            }
            other => other.map_err(Pkcs11Error::from_key_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki_sys::{CK_RV, CK_VOID_PTR_PTR, CKR_OK};

    unsafe extern "C" fn create_mutex(_mutex: CK_VOID_PTR_PTR) -> CK_RV {
        CKR_OK
    }

    unsafe extern "C" fn mutex_op(_mutex: CK_VOID_PTR) -> CK_RV {
        CKR_OK
    }

    fn raw_args(flags: CK_FLAGS, callbacks: bool) -> CK_C_INITIALIZE_ARGS {
        CK_C_INITIALIZE_ARGS {
            CreateMutex: callbacks.then_some(create_mutex as _),
            DestroyMutex: callbacks.then_some(mutex_op as _),
            LockMutex: callbacks.then_some(mutex_op as _),
            UnlockMutex: callbacks.then_some(mutex_op as _),
            flags,
            pReserved: std::ptr::null_mut(),
        }
    }

    fn parse(mut args: CK_C_INITIALIZE_ARGS) -> InitArgs {
        unsafe { InitArgs::from_raw(&mut args as *mut _ as CK_VOID_PTR) }
    }

    #[test]
    fn null_args_are_accepted() {
        let args = unsafe { InitArgs::from_raw(std::ptr::null_mut()) };
        assert_eq!(args.validate(), Ok(()));
    }

    #[test]
    fn callbacks_need_os_locking() {
        assert_eq!(parse(raw_args(0, true)).validate(), Err(Pkcs11Error::CannotLockMutex));
        assert_eq!(parse(raw_args(CKF_OS_LOCKING_OK, true)).validate(), Ok(()));
        assert_eq!(parse(raw_args(CKF_OS_LOCKING_OK, false)).validate(), Ok(()));
    }

    #[test]
    fn thread_creation_must_be_allowed() {
        assert_eq!(
            parse(raw_args(CKF_OS_LOCKING_OK | CKF_LIBRARY_CANT_CREATE_OS_THREADS, false))
                .validate(),
            Err(Pkcs11Error::CannotCreateThreads)
        );
    }

    #[test]
    fn partial_callbacks_and_reserved_are_bad_arguments() {
        let mut args = raw_args(CKF_OS_LOCKING_OK, true);
        args.UnlockMutex = None;
        assert!(matches!(parse(args).validate(), Err(Pkcs11Error::ArgumentsBad(_))));

        let mut args = raw_args(0, false);
        let mut reserved = 0u8;
        args.pReserved = &mut reserved as *mut u8 as CK_VOID_PTR;
        assert!(matches!(parse(args).validate(), Err(Pkcs11Error::ArgumentsBad(_))));
    }
}
