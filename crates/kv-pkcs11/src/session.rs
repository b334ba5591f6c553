//! Session manager: open/close, login state and per-session operations.

use cryptoki_sys::{
    CK_FLAGS, CK_SESSION_HANDLE, CK_SLOT_ID, CK_STATE, CKF_RW_SESSION, CKF_SERIAL_SESSION,
    CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS, CKS_RW_PUBLIC_SESSION, CKS_RW_USER_FUNCTIONS,
};
use kv_core::Credential;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::Provider;
use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::operation::ActiveOperation;
use crate::slot::SLOT_ID;

pub(crate) enum LoginState {
    LoggedOut,
    LoggedIn(Arc<Credential>),
}

pub(crate) struct Session {
    pub flags: CK_FLAGS,
    pub login: LoginState,
    pub operation: Option<ActiveOperation>,
}

impl Session {
    pub fn credential(&self) -> Pkcs11Result<Arc<Credential>> {
        match &self.login {
            LoginState::LoggedIn(credential) => Ok(Arc::clone(credential)),
            LoginState::LoggedOut => Err(Pkcs11Error::UserNotLoggedIn),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        matches!(self.login, LoginState::LoggedIn(_))
    }

    pub fn is_read_write(&self) -> bool {
        self.flags & CKF_RW_SESSION != 0
    }

    fn state(&self) -> CK_STATE {
        match (self.is_read_write(), self.is_logged_in()) {
            (true, true) => CKS_RW_USER_FUNCTIONS,
            (true, false) => CKS_RW_PUBLIC_SESSION,
            (false, true) => CKS_RO_USER_FUNCTIONS,
            (false, false) => CKS_RO_PUBLIC_SESSION,
        }
    }
}

/// Snapshot of a session for `C_GetSessionInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot_id: CK_SLOT_ID,
    pub state: CK_STATE,
    pub flags: CK_FLAGS,
}

/// Session totals for `C_GetTokenInfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    pub total: usize,
    pub read_write: usize,
}

pub(crate) fn check_slot(slot_id: CK_SLOT_ID) -> Pkcs11Result<()> {
    if slot_id != SLOT_ID {
        return Err(Pkcs11Error::SlotIdInvalid);
    }
    Ok(())
}

impl Provider {
    pub fn open_session(
        &self,
        slot_id: CK_SLOT_ID,
        flags: CK_FLAGS,
    ) -> Pkcs11Result<CK_SESSION_HANDLE> {
        let mut tables = self.tables()?;
        check_slot(slot_id)?;
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(Pkcs11Error::SessionFlagsInvalid);
        }
        let handle = tables
            .sessions
            .insert(Session {
                flags,
                login: LoginState::LoggedOut,
                operation: None,
            })
            .ok_or_else(|| Pkcs11Error::FunctionFailed("session table is full".into()))?;
        info!("opened session {} on slot {}", handle, slot_id);
        Ok(handle)
    }

    /// Close a session, discarding its active operation. Objects it created
    /// are token objects and stay.
    pub fn close_session(&self, handle: CK_SESSION_HANDLE) -> Pkcs11Result<()> {
        let mut tables = self.tables()?;
        let session = tables
            .sessions
            .remove(handle)
            .ok_or(Pkcs11Error::SessionHandleInvalid)?;
        if session.operation.is_some() {
            debug!("session {} closed with an active operation", handle);
        }
        info!("closed session {}", handle);
        Ok(())
    }

    pub fn close_all_sessions(&self, slot_id: CK_SLOT_ID) -> Pkcs11Result<()> {
        let mut tables = self.tables()?;
        check_slot(slot_id)?;
        let count = tables.sessions.len();
        tables.sessions.clear();
        info!("closed all {} session(s) on slot {}", count, slot_id);
        Ok(())
    }

    /// Log a session in with the credential encoded in `pin`.
    ///
    /// The credential is resolved to a token before the session is marked
    /// logged in, so a bad secret fails here rather than on first use.
    pub fn login(&self, handle: CK_SESSION_HANDLE, pin: &[u8]) -> Pkcs11Result<()> {
        let (epoch, credential) = {
            let tables = self.tables()?;
            if tables.session(handle)?.is_logged_in() {
                return Err(Pkcs11Error::UserAlreadyLoggedIn);
            }
            (tables.epoch, Credential::from_pin(pin)?)
        };

        self.bridge
            .resolve(&credential)
            .map_err(Pkcs11Error::from_token_error)?;

        let mut tables = self.tables_for_commit(epoch)?;
        let session = tables.session_mut(handle)?;
        if session.is_logged_in() {
            return Err(Pkcs11Error::UserAlreadyLoggedIn);
        }
        info!("session {} logged in as {:?}", handle, credential.id());
        session.login = LoginState::LoggedIn(Arc::new(credential));
        Ok(())
    }

    /// Log a session out. Cached tokens are shared across sessions and stay.
    pub fn logout(&self, handle: CK_SESSION_HANDLE) -> Pkcs11Result<()> {
        let mut tables = self.tables()?;
        let session = tables.session_mut(handle)?;
        if !session.is_logged_in() {
            return Err(Pkcs11Error::UserNotLoggedIn);
        }
        session.login = LoginState::LoggedOut;
        info!("session {} logged out", handle);
        Ok(())
    }

    pub fn session_info(&self, handle: CK_SESSION_HANDLE) -> Pkcs11Result<SessionInfo> {
        let tables = self.tables()?;
        let session = tables.session(handle)?;
        Ok(SessionInfo {
            slot_id: SLOT_ID,
            state: session.state(),
            flags: session.flags,
        })
    }

    pub fn session_counts(&self) -> Pkcs11Result<SessionCounts> {
        let tables = self.tables()?;
        let mut counts = SessionCounts::default();
        for session in tables.sessions.values() {
            counts.total += 1;
            if session.is_read_write() {
                counts.read_write += 1;
            }
        }
        Ok(counts)
    }
}
