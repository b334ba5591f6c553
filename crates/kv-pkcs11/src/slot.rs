//! The single virtual slot and the token it holds.

use cryptoki_sys::{
    CK_INFO, CK_SLOT_ID, CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG, CK_UNAVAILABLE_INFORMATION,
    CKF_LOGIN_REQUIRED, CKF_TOKEN_INITIALIZED, CKF_TOKEN_PRESENT, CKF_USER_PIN_INITIALIZED,
};

use crate::session::SessionCounts;

pub const SLOT_ID: CK_SLOT_ID = 0;

const MANUFACTURER: &str = "kv-pkcs11";
const LIBRARY_DESCRIPTION: &str = "Remote key vault PKCS#11 provider";
const SLOT_DESCRIPTION: &str = "Remote key vault";
const TOKEN_LABEL: &str = "key vault";
const TOKEN_MODEL: &str = "remote vault";
const TOKEN_SERIAL: &str = "0";

/// Blank-padded, unterminated copy of `text`, as cryptoki expects for its
/// fixed-width strings.
pub fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [b' '; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

fn crate_version() -> (u8, u8) {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    (major, minor)
}

pub fn library_info() -> CK_INFO {
    let mut info: CK_INFO = unsafe { std::mem::zeroed() };
    info.cryptokiVersion.major = 2;
    info.cryptokiVersion.minor = 40;
    info.manufacturerID = padded(MANUFACTURER);
    info.flags = 0;
    info.libraryDescription = padded(LIBRARY_DESCRIPTION);
    let (major, minor) = crate_version();
    info.libraryVersion.major = major;
    info.libraryVersion.minor = minor;
    info
}

pub fn slot_info() -> CK_SLOT_INFO {
    let mut info: CK_SLOT_INFO = unsafe { std::mem::zeroed() };
    info.slotDescription = padded(SLOT_DESCRIPTION);
    info.manufacturerID = padded(MANUFACTURER);
    info.flags = CKF_TOKEN_PRESENT;
    let (major, minor) = crate_version();
    info.hardwareVersion.major = major;
    info.hardwareVersion.minor = minor;
    info.firmwareVersion.major = major;
    info.firmwareVersion.minor = minor;
    info
}

pub fn token_info(sessions: SessionCounts) -> CK_TOKEN_INFO {
    let mut info: CK_TOKEN_INFO = unsafe { std::mem::zeroed() };
    info.label = padded(TOKEN_LABEL);
    info.manufacturerID = padded(MANUFACTURER);
    info.model = padded(TOKEN_MODEL);
    info.serialNumber = padded(TOKEN_SERIAL);
    info.flags = CKF_TOKEN_INITIALIZED | CKF_USER_PIN_INITIALIZED | CKF_LOGIN_REQUIRED;
    info.ulMaxSessionCount = CK_UNAVAILABLE_INFORMATION;
    info.ulSessionCount = sessions.total as CK_ULONG;
    info.ulMaxRwSessionCount = CK_UNAVAILABLE_INFORMATION;
    info.ulRwSessionCount = sessions.read_write as CK_ULONG;
    // The PIN carries a client secret of arbitrary length, or nothing at all.
    info.ulMaxPinLen = 4096;
    info.ulMinPinLen = 0;
    info.ulTotalPublicMemory = CK_UNAVAILABLE_INFORMATION;
    info.ulFreePublicMemory = CK_UNAVAILABLE_INFORMATION;
    info.ulTotalPrivateMemory = CK_UNAVAILABLE_INFORMATION;
    info.ulFreePrivateMemory = CK_UNAVAILABLE_INFORMATION;
    let (major, minor) = crate_version();
    info.hardwareVersion.major = major;
    info.hardwareVersion.minor = minor;
    info.firmwareVersion.major = major;
    info.firmwareVersion.minor = minor;
    info.utcTime = padded("");
    info
}
