//! The exported cryptoki entry points.
//!
//! Each export checks its pointers, runs the safe provider call and turns the
//! outcome into a `CK_RV`. The first `C_Initialize` builds the process-wide
//! provider from configuration; later `C_Finalize`/`C_Initialize` cycles reuse
//! it, so handles from an earlier cycle never come back.

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_PTR, CK_BBOOL, CK_BYTE_PTR, CK_FLAGS, CK_INFO, CK_MECHANISM_INFO,
    CK_MECHANISM_PTR, CK_MECHANISM_TYPE, CK_MECHANISM_TYPE_PTR, CK_NOTIFY, CK_OBJECT_HANDLE,
    CK_OBJECT_HANDLE_PTR, CK_RV, CK_SESSION_HANDLE, CK_SESSION_HANDLE_PTR, CK_SESSION_INFO,
    CK_SLOT_ID, CK_SLOT_ID_PTR, CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG, CK_ULONG_PTR,
    CK_UNAVAILABLE_INFORMATION, CK_USER_TYPE, CK_UTF8CHAR_PTR, CK_VOID_PTR, CKR_OK,
};
use kv_core::ProviderConfig;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error};
use zeroize::Zeroizing;

use crate::attribute::{AttributeLookup, Template};
use crate::context::{InitArgs, Provider};
use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::logging;
use crate::mechanism::{MechanismSpec, SUPPORTED_MECHANISMS, mechanism_info};
use crate::operation::Output;
use crate::session::check_slot;
use crate::slot::{self, SLOT_ID};

struct GlobalState {
    provider: Option<Arc<Provider>>,
}

static STATE: Lazy<RwLock<GlobalState>> =
    Lazy::new(|| RwLock::new(GlobalState { provider: None }));

fn provider() -> Pkcs11Result<Arc<Provider>> {
    let provider = STATE
        .read()
        .provider
        .clone()
        .ok_or(Pkcs11Error::NotInitialized)?;
    if !provider.is_initialized() {
        return Err(Pkcs11Error::NotInitialized);
    }
    Ok(provider)
}

fn translate(function: &str, result: Pkcs11Result<()>) -> CK_RV {
    match result {
        Ok(()) => CKR_OK,
        Err(err) => {
            if err.is_fault() {
                error!("{function} failed: {err}");
            } else {
                debug!("{function}: {err}");
            }
            err.rv()
        }
    }
}

/// Borrow a caller buffer. A zero length is always the empty slice, whatever
/// the pointer.
///
/// # Safety
/// A non-null `ptr` must be valid for `len` bytes.
unsafe fn input<'a>(ptr: CK_BYTE_PTR, len: CK_ULONG) -> Pkcs11Result<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(Pkcs11Error::ArgumentsBad("null input buffer".into()));
    }
    Ok(unsafe { std::slice::from_raw_parts(ptr, len as usize) })
}

/// Write an output according to the two-call buffer convention.
///
/// # Safety
/// `out_len` must be valid; a non-null `out` must be valid for `*out_len`
/// bytes.
unsafe fn write_output(
    result: Pkcs11Result<Output>,
    out: CK_BYTE_PTR,
    out_len: CK_ULONG_PTR,
) -> Pkcs11Result<()> {
    match result {
        Ok(Output::SizeRequired(required)) => {
            unsafe { *out_len = required as CK_ULONG };
            Ok(())
        }
        Ok(Output::Written(bytes)) => {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
                *out_len = bytes.len() as CK_ULONG;
            }
            Ok(())
        }
        Err(Pkcs11Error::BufferTooSmall { required }) => {
            unsafe { *out_len = required as CK_ULONG };
            Err(Pkcs11Error::BufferTooSmall { required })
        }
        Err(err) => Err(err),
    }
}

/// Fill a caller-supplied list of `CK_ULONG`-sized values.
///
/// # Safety
/// `count` must be valid; a non-null `list` must be valid for `*count`
/// entries.
unsafe fn write_list(
    items: &[CK_ULONG],
    list: *mut CK_ULONG,
    count: CK_ULONG_PTR,
) -> Pkcs11Result<()> {
    let available = unsafe { *count } as usize;
    unsafe { *count = items.len() as CK_ULONG };
    if list.is_null() {
        return Ok(());
    }
    if available < items.len() {
        return Err(Pkcs11Error::BufferTooSmall {
            required: items.len(),
        });
    }
    unsafe { std::ptr::copy_nonoverlapping(items.as_ptr(), list, items.len()) };
    Ok(())
}

pub fn initialize(args: InitArgs) -> Pkcs11Result<()> {
    logging::init();
    args.validate()?;
    let mut state = STATE.write();
    let provider = match &state.provider {
        Some(provider) => Arc::clone(provider),
        None => {
            let config = ProviderConfig::load()
                .map_err(|e| Pkcs11Error::FunctionFailed(format!("configuration: {e}")))?;
            let provider = Arc::new(Provider::from_config(&config)?);
            state.provider = Some(Arc::clone(&provider));
            provider
        }
    };
    provider.initialize(args)
}

/// Finalize the process-wide provider. The instance itself is kept so the
/// next `C_Initialize` continues its handle numbering.
pub fn finalize() -> Pkcs11Result<()> {
    let provider = STATE
        .read()
        .provider
        .clone()
        .ok_or(Pkcs11Error::NotInitialized)?;
    provider.finalize()
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Initialize(pInitArgs: CK_VOID_PTR) -> CK_RV {
    let args = unsafe { InitArgs::from_raw(pInitArgs) };
    translate("C_Initialize", initialize(args))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Finalize(pReserved: CK_VOID_PTR) -> CK_RV {
    if !pReserved.is_null() {
        return Pkcs11Error::ArgumentsBad("pReserved must be null".into()).rv();
    }
    translate("C_Finalize", finalize())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetInfo(pInfo: *mut CK_INFO) -> CK_RV {
    if pInfo.is_null() {
        return Pkcs11Error::ArgumentsBad("null pInfo".into()).rv();
    }
    let result = provider().map(|_| unsafe {
        *pInfo = slot::library_info();
    });
    translate("C_GetInfo", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotList(
    _tokenPresent: CK_BBOOL,
    pSlotList: CK_SLOT_ID_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    if pulCount.is_null() {
        return Pkcs11Error::ArgumentsBad("null pulCount".into()).rv();
    }
    let result = provider().and_then(|_| unsafe { write_list(&[SLOT_ID], pSlotList, pulCount) });
    translate("C_GetSlotList", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotInfo(slotID: CK_SLOT_ID, pInfo: *mut CK_SLOT_INFO) -> CK_RV {
    if pInfo.is_null() {
        return Pkcs11Error::ArgumentsBad("null pInfo".into()).rv();
    }
    let result = provider().and_then(|_| {
        check_slot(slotID)?;
        unsafe { *pInfo = slot::slot_info() };
        Ok(())
    });
    translate("C_GetSlotInfo", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetTokenInfo(slotID: CK_SLOT_ID, pInfo: *mut CK_TOKEN_INFO) -> CK_RV {
    if pInfo.is_null() {
        return Pkcs11Error::ArgumentsBad("null pInfo".into()).rv();
    }
    let result = provider().and_then(|provider| {
        check_slot(slotID)?;
        let counts = provider.session_counts()?;
        unsafe { *pInfo = slot::token_info(counts) };
        Ok(())
    });
    translate("C_GetTokenInfo", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetMechanismList(
    slotID: CK_SLOT_ID,
    pMechanismList: CK_MECHANISM_TYPE_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    if pulCount.is_null() {
        return Pkcs11Error::ArgumentsBad("null pulCount".into()).rv();
    }
    let result = provider().and_then(|_| {
        check_slot(slotID)?;
        unsafe { write_list(&SUPPORTED_MECHANISMS, pMechanismList, pulCount) }
    });
    translate("C_GetMechanismList", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetMechanismInfo(
    slotID: CK_SLOT_ID,
    mechType: CK_MECHANISM_TYPE,
    pInfo: *mut CK_MECHANISM_INFO,
) -> CK_RV {
    if pInfo.is_null() {
        return Pkcs11Error::ArgumentsBad("null pInfo".into()).rv();
    }
    let result = provider().and_then(|_| {
        check_slot(slotID)?;
        let info = mechanism_info(mechType)?;
        unsafe { *pInfo = info };
        Ok(())
    });
    translate("C_GetMechanismInfo", result)
}

/// Notification callbacks are accepted and never invoked.
#[unsafe(no_mangle)]
pub extern "C" fn C_OpenSession(
    slotID: CK_SLOT_ID,
    flags: CK_FLAGS,
    _pApplication: CK_VOID_PTR,
    _Notify: CK_NOTIFY,
    phSession: CK_SESSION_HANDLE_PTR,
) -> CK_RV {
    if phSession.is_null() {
        return Pkcs11Error::ArgumentsBad("null phSession".into()).rv();
    }
    let result = provider().and_then(|provider| {
        let handle = provider.open_session(slotID, flags)?;
        unsafe { *phSession = handle };
        Ok(())
    });
    translate("C_OpenSession", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseSession(hSession: CK_SESSION_HANDLE) -> CK_RV {
    let result = provider().and_then(|provider| provider.close_session(hSession));
    translate("C_CloseSession", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseAllSessions(slotID: CK_SLOT_ID) -> CK_RV {
    let result = provider().and_then(|provider| provider.close_all_sessions(slotID));
    translate("C_CloseAllSessions", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSessionInfo(
    hSession: CK_SESSION_HANDLE,
    pInfo: *mut CK_SESSION_INFO,
) -> CK_RV {
    if pInfo.is_null() {
        return Pkcs11Error::ArgumentsBad("null pInfo".into()).rv();
    }
    let result = provider().and_then(|provider| {
        let info = provider.session_info(hSession)?;
        unsafe {
            *pInfo = CK_SESSION_INFO {
                slotID: info.slot_id,
                state: info.state,
                flags: info.flags,
                ulDeviceError: 0,
            };
        }
        Ok(())
    });
    translate("C_GetSessionInfo", result)
}

/// The PIN carries the credential. There is a single kind of user, so the
/// user type is not interpreted.
#[unsafe(no_mangle)]
pub extern "C" fn C_Login(
    hSession: CK_SESSION_HANDLE,
    _userType: CK_USER_TYPE,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
) -> CK_RV {
    let result = provider().and_then(|provider| {
        let pin = Zeroizing::new(unsafe { input(pPin, ulPinLen) }?.to_vec());
        provider.login(hSession, &pin)
    });
    translate("C_Login", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Logout(hSession: CK_SESSION_HANDLE) -> CK_RV {
    let result = provider().and_then(|provider| provider.logout(hSession));
    translate("C_Logout", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GenerateKeyPair(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    pPublicKeyTemplate: CK_ATTRIBUTE_PTR,
    ulPublicKeyAttributeCount: CK_ULONG,
    pPrivateKeyTemplate: CK_ATTRIBUTE_PTR,
    ulPrivateKeyAttributeCount: CK_ULONG,
    phPublicKey: CK_OBJECT_HANDLE_PTR,
    phPrivateKey: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    if phPublicKey.is_null() || phPrivateKey.is_null() {
        return Pkcs11Error::ArgumentsBad("null key handle output".into()).rv();
    }
    let result = provider().and_then(|provider| {
        let mechanism = unsafe { MechanismSpec::from_raw(pMechanism) }?;
        let public = unsafe { Template::from_raw(pPublicKeyTemplate, ulPublicKeyAttributeCount) }?;
        let private =
            unsafe { Template::from_raw(pPrivateKeyTemplate, ulPrivateKeyAttributeCount) }?;
        let handles = provider.generate_key_pair(hSession, &mechanism, &public, &private)?;
        unsafe {
            *phPublicKey = handles.public;
            *phPrivateKey = handles.private;
        }
        Ok(())
    });
    translate("C_GenerateKeyPair", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DestroyObject(hSession: CK_SESSION_HANDLE, hObject: CK_OBJECT_HANDLE) -> CK_RV {
    let result = provider().and_then(|provider| provider.destroy_object(hSession, hObject));
    translate("C_DestroyObject", result)
}

/// Fill a template in place. Every entry is processed; the return value
/// reports the first entry that could not be served.
///
/// # Safety
/// A non-null `template` must be valid for `count` entries, each with a
/// value buffer valid for its stated length.
unsafe fn fill_attributes(
    provider: &Provider,
    session: CK_SESSION_HANDLE,
    object: CK_OBJECT_HANDLE,
    template: CK_ATTRIBUTE_PTR,
    count: CK_ULONG,
) -> Pkcs11Result<()> {
    if count == 0 {
        return Ok(());
    }
    if template.is_null() {
        return Err(Pkcs11Error::ArgumentsBad("null template".into()));
    }
    let entries: Vec<CK_ATTRIBUTE> = (0..count as usize)
        .map(|i| unsafe { std::ptr::read_unaligned(template.add(i)) })
        .collect();
    let kinds: Vec<_> = entries.iter().map(|entry| entry.type_).collect();
    let lookups = provider.attribute_values(session, object, &kinds)?;

    let mut outcome = Ok(());
    for (i, (entry, lookup)) in entries.iter().zip(lookups).enumerate() {
        let (buffer, capacity) = (entry.pValue as *mut u8, entry.ulValueLen as usize);
        let (written, failure) = match lookup {
            AttributeLookup::Value(value) if buffer.is_null() => (value.len() as CK_ULONG, None),
            AttributeLookup::Value(value) if capacity < value.len() => (
                CK_UNAVAILABLE_INFORMATION,
                Some(Pkcs11Error::BufferTooSmall {
                    required: value.len(),
                }),
            ),
            AttributeLookup::Value(value) => {
                unsafe { std::ptr::copy_nonoverlapping(value.as_ptr(), buffer, value.len()) };
                (value.len() as CK_ULONG, None)
            }
            AttributeLookup::Sensitive => (
                CK_UNAVAILABLE_INFORMATION,
                Some(Pkcs11Error::AttributeSensitive),
            ),
            AttributeLookup::Invalid => (
                CK_UNAVAILABLE_INFORMATION,
                Some(Pkcs11Error::AttributeTypeInvalid),
            ),
        };
        unsafe { std::ptr::addr_of_mut!((*template.add(i)).ulValueLen).write_unaligned(written) };
        if let (Some(err), true) = (failure, outcome.is_ok()) {
            outcome = Err(err);
        }
    }
    outcome
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetAttributeValue(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    let result = provider().and_then(|provider| unsafe {
        fill_attributes(&provider, hSession, hObject, pTemplate, ulCount)
    });
    translate("C_GetAttributeValue", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_EncryptInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    let result = provider().and_then(|provider| {
        let mechanism = unsafe { MechanismSpec::from_raw(pMechanism) }?;
        provider.encrypt_init(hSession, &mechanism, hKey)
    });
    translate("C_EncryptInit", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Encrypt(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pEncryptedData: CK_BYTE_PTR,
    pulEncryptedDataLen: CK_ULONG_PTR,
) -> CK_RV {
    if pulEncryptedDataLen.is_null() {
        return Pkcs11Error::ArgumentsBad("null pulEncryptedDataLen".into()).rv();
    }
    let result = provider().and_then(|provider| {
        // The output may alias the input.
        let data = Zeroizing::new(unsafe { input(pData, ulDataLen) }?.to_vec());
        let capacity =
            (!pEncryptedData.is_null()).then(|| unsafe { *pulEncryptedDataLen } as usize);
        let output = provider.encrypt(hSession, &data, capacity);
        unsafe { write_output(output, pEncryptedData, pulEncryptedDataLen) }
    });
    translate("C_Encrypt", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DecryptInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    let result = provider().and_then(|provider| {
        let mechanism = unsafe { MechanismSpec::from_raw(pMechanism) }?;
        provider.decrypt_init(hSession, &mechanism, hKey)
    });
    translate("C_DecryptInit", result)
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Decrypt(
    hSession: CK_SESSION_HANDLE,
    pEncryptedData: CK_BYTE_PTR,
    ulEncryptedDataLen: CK_ULONG,
    pData: CK_BYTE_PTR,
    pulDataLen: CK_ULONG_PTR,
) -> CK_RV {
    if pulDataLen.is_null() {
        return Pkcs11Error::ArgumentsBad("null pulDataLen".into()).rv();
    }
    let result = provider().and_then(|provider| {
        let ciphertext = unsafe { input(pEncryptedData, ulEncryptedDataLen) }?.to_vec();
        let capacity = (!pData.is_null()).then(|| unsafe { *pulDataLen } as usize);
        let output = provider.decrypt(hSession, &ciphertext, capacity);
        unsafe { write_output(output, pData, pulDataLen) }
    });
    translate("C_Decrypt", result)
}
