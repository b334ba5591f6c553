//! Supported mechanisms and their parameters.
//!
//! Two mechanisms are offered: RSA key-pair generation, which creates (or
//! binds to) a key in the remote vault, and RSA-OAEP encryption/decryption
//! with SHA-1 or SHA-256.

use cryptoki_sys::{
    CK_FLAGS, CK_MECHANISM, CK_MECHANISM_INFO, CK_MECHANISM_PTR, CK_MECHANISM_TYPE,
    CK_RSA_PKCS_MGF_TYPE, CK_RSA_PKCS_OAEP_PARAMS, CK_RSA_PKCS_OAEP_SOURCE_TYPE, CK_ULONG,
    CKF_DECRYPT, CKF_ENCRYPT, CKF_GENERATE_KEY_PAIR, CKG_MGF1_SHA1, CKG_MGF1_SHA256,
    CKM_RSA_PKCS_KEY_PAIR_GEN, CKM_RSA_PKCS_OAEP, CKM_SHA_1, CKM_SHA256, CKZ_DATA_SPECIFIED,
};
use kv_core::EncryptionAlgorithm;

use crate::error::{Pkcs11Error, Pkcs11Result};

pub const SUPPORTED_MECHANISMS: [CK_MECHANISM_TYPE; 2] =
    [CKM_RSA_PKCS_KEY_PAIR_GEN, CKM_RSA_PKCS_OAEP];

/// Key sizes the remote vault accepts, in bits.
pub const MIN_KEY_BITS: CK_ULONG = 1024;
pub const MAX_KEY_BITS: CK_ULONG = 4096;

/// The fields of `CK_RSA_PKCS_OAEP_PARAMS` the provider looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OaepParams {
    pub hash: CK_MECHANISM_TYPE,
    pub mgf: CK_RSA_PKCS_MGF_TYPE,
    pub source: CK_RSA_PKCS_OAEP_SOURCE_TYPE,
    pub label_len: CK_ULONG,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismParam {
    Absent,
    Oaep(OaepParams),
    /// Present but not something this mechanism can carry.
    Malformed,
}

/// A mechanism as requested by the caller, before it is validated for a
/// particular operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechanismSpec {
    pub mechanism: CK_MECHANISM_TYPE,
    pub param: MechanismParam,
}

impl MechanismSpec {
    pub fn new(mechanism: CK_MECHANISM_TYPE) -> Self {
        Self {
            mechanism,
            param: MechanismParam::Absent,
        }
    }

    pub fn oaep(hash: CK_MECHANISM_TYPE, mgf: CK_RSA_PKCS_MGF_TYPE) -> Self {
        Self {
            mechanism: CKM_RSA_PKCS_OAEP,
            param: MechanismParam::Oaep(OaepParams {
                hash,
                mgf,
                source: CKZ_DATA_SPECIFIED,
                label_len: 0,
            }),
        }
    }

    /// Read a `CK_MECHANISM` supplied by the caller.
    ///
    /// # Safety
    /// `ptr` must be null or point to a readable `CK_MECHANISM` whose
    /// parameter pointer, if non-null, covers `ulParameterLen` bytes.
    pub unsafe fn from_raw(ptr: CK_MECHANISM_PTR) -> Pkcs11Result<Self> {
        if ptr.is_null() {
            return Err(Pkcs11Error::ArgumentsBad("mechanism is null".into()));
        }
        // Cryptoki structs are packed on Windows.
        let raw: CK_MECHANISM = unsafe { std::ptr::read_unaligned(ptr) };
        let param = if raw.pParameter.is_null() || raw.ulParameterLen == 0 {
            MechanismParam::Absent
        } else if raw.mechanism == CKM_RSA_PKCS_OAEP
            && raw.ulParameterLen as usize == std::mem::size_of::<CK_RSA_PKCS_OAEP_PARAMS>()
        {
            let params: CK_RSA_PKCS_OAEP_PARAMS = unsafe {
                std::ptr::read_unaligned(raw.pParameter as *const CK_RSA_PKCS_OAEP_PARAMS)
            };
            MechanismParam::Oaep(OaepParams {
                hash: params.hashAlg,
                mgf: params.mgf,
                source: params.source,
                label_len: params.ulSourceDataLen,
            })
        } else {
            MechanismParam::Malformed
        };
        Ok(Self {
            mechanism: raw.mechanism,
            param,
        })
    }

    /// Validate this as the key-pair generation mechanism.
    pub fn key_pair_gen(&self) -> Pkcs11Result<()> {
        if self.mechanism != CKM_RSA_PKCS_KEY_PAIR_GEN {
            return Err(Pkcs11Error::MechanismInvalid);
        }
        Ok(())
    }

    /// Validate this as RSA-OAEP and pick the matching vault algorithm.
    pub fn oaep_algorithm(&self) -> Pkcs11Result<EncryptionAlgorithm> {
        if self.mechanism != CKM_RSA_PKCS_OAEP {
            return Err(Pkcs11Error::MechanismInvalid);
        }
        let params = match self.param {
            MechanismParam::Absent => return Ok(EncryptionAlgorithm::RsaOaep),
            MechanismParam::Malformed => {
                return Err(Pkcs11Error::MechanismParamInvalid(
                    "expected CK_RSA_PKCS_OAEP_PARAMS".into(),
                ));
            }
            MechanismParam::Oaep(params) => params,
        };
        if params.label_len != 0 {
            return Err(Pkcs11Error::MechanismParamInvalid(
                "OAEP labels are not supported".into(),
            ));
        }
        if params.source != 0 && params.source != CKZ_DATA_SPECIFIED {
            return Err(Pkcs11Error::MechanismParamInvalid(format!(
                "unknown OAEP source {:#x}",
                params.source
            )));
        }
        match (params.hash, params.mgf) {
            (CKM_SHA_1, CKG_MGF1_SHA1) => Ok(EncryptionAlgorithm::RsaOaep),
            (CKM_SHA256, CKG_MGF1_SHA256) => Ok(EncryptionAlgorithm::RsaOaep256),
            (hash, mgf) => Err(Pkcs11Error::MechanismParamInvalid(format!(
                "unsupported hash {hash:#x} with MGF {mgf:#x}"
            ))),
        }
    }
}

pub fn mechanism_info(mechanism: CK_MECHANISM_TYPE) -> Pkcs11Result<CK_MECHANISM_INFO> {
    let flags: CK_FLAGS = match mechanism {
        CKM_RSA_PKCS_KEY_PAIR_GEN => CKF_GENERATE_KEY_PAIR,
        CKM_RSA_PKCS_OAEP => CKF_ENCRYPT | CKF_DECRYPT,
        _ => return Err(Pkcs11Error::MechanismInvalid),
    };
    Ok(CK_MECHANISM_INFO {
        ulMinKeySize: MIN_KEY_BITS,
        ulMaxKeySize: MAX_KEY_BITS,
        flags,
    })
}
