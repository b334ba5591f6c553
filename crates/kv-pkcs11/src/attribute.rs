//! Attribute templates and the attributes exposed by key objects.

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_PTR, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_FALSE, CK_TRUE, CK_ULONG,
    CKA_CLASS, CKA_COEFFICIENT, CKA_DECRYPT, CKA_ENCRYPT, CKA_EXPONENT_1, CKA_EXPONENT_2,
    CKA_EXTRACTABLE, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_LOCAL, CKA_MODULUS, CKA_MODULUS_BITS,
    CKA_PRIME_1, CKA_PRIME_2, CKA_PRIVATE, CKA_PRIVATE_EXPONENT, CKA_PUBLIC_EXPONENT,
    CKA_SENSITIVE, CKA_TOKEN, CKK_RSA,
};
use kv_core::KeyReference;

use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::mechanism::{MAX_KEY_BITS, MIN_KEY_BITS};
use crate::object::{KeyObject, ObjectClass};

/// A caller-supplied template, copied out of caller memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    attributes: Vec<(CK_ATTRIBUTE_TYPE, Vec<u8>)>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        self.attributes.push((kind, value.into()));
        self
    }

    pub fn with_ulong(self, kind: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        self.with(kind, value.to_ne_bytes().to_vec())
    }

    /// Copy a template out of caller memory.
    ///
    /// # Safety
    /// `ptr` must be null or point to `count` readable `CK_ATTRIBUTE`s whose
    /// value pointers cover their stated lengths.
    pub unsafe fn from_raw(ptr: CK_ATTRIBUTE_PTR, count: CK_ULONG) -> Pkcs11Result<Self> {
        if count == 0 {
            return Ok(Self::new());
        }
        if ptr.is_null() {
            return Err(Pkcs11Error::ArgumentsBad("template is null".into()));
        }
        let mut attributes = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let raw: CK_ATTRIBUTE = unsafe { std::ptr::read_unaligned(ptr.add(i)) };
            let len = raw.ulValueLen as usize;
            let value = if len == 0 {
                Vec::new()
            } else if raw.pValue.is_null() {
                return Err(Pkcs11Error::ArgumentsBad(format!(
                    "attribute {:#x} has no value",
                    raw.type_
                )));
            } else {
                unsafe { std::slice::from_raw_parts(raw.pValue as *const u8, len) }.to_vec()
            };
            attributes.push((raw.type_, value));
        }
        Ok(Self { attributes })
    }

    /// Last value given for `kind`.
    pub fn get(&self, kind: CK_ATTRIBUTE_TYPE) -> Option<&[u8]> {
        self.attributes
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.as_slice())
    }

    pub fn ulong(&self, kind: CK_ATTRIBUTE_TYPE) -> Pkcs11Result<Option<CK_ULONG>> {
        let Some(value) = self.get(kind) else {
            return Ok(None);
        };
        let bytes: [u8; std::mem::size_of::<CK_ULONG>()] = value.try_into().map_err(|_| {
            Pkcs11Error::AttributeValueInvalid(format!("attribute {kind:#x} is not a CK_ULONG"))
        })?;
        Ok(Some(CK_ULONG::from_ne_bytes(bytes)))
    }
}

/// What a key-pair generation request asks for, resolved from both
/// templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairRequest {
    /// `CKA_ID` exactly as supplied.
    pub id: Vec<u8>,
    pub reference: KeyReference,
    pub modulus_bits: Option<usize>,
    pub label: Option<Vec<u8>>,
}

impl KeyPairRequest {
    /// Only `CKA_ID` is required. It may sit in either template; when both
    /// carry one they must agree. `CKA_MODULUS_BITS` and `CKA_LABEL` are
    /// honoured, everything else is ignored.
    pub fn from_templates(public: &Template, private: &Template) -> Pkcs11Result<Self> {
        let id = match (public.get(CKA_ID), private.get(CKA_ID)) {
            (Some(a), Some(b)) if a != b => {
                return Err(Pkcs11Error::ArgumentsBad(
                    "public and private CKA_ID differ".into(),
                ));
            }
            (Some(id), _) | (None, Some(id)) => id,
            (None, None) => return Err(Pkcs11Error::TemplateIncomplete),
        };
        if id.is_empty() {
            return Err(Pkcs11Error::TemplateIncomplete);
        }
        let text = std::str::from_utf8(id)
            .map_err(|_| Pkcs11Error::ArgumentsBad("CKA_ID is not UTF-8".into()))?;
        let reference = KeyReference::parse(text.trim_end_matches('\0'))
            .map_err(|e| Pkcs11Error::ArgumentsBad(e.to_string()))?;

        let modulus_bits = match public.ulong(CKA_MODULUS_BITS)? {
            None => None,
            Some(bits) if (MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) && bits % 8 == 0 => {
                Some(bits as usize)
            }
            Some(bits) => {
                return Err(Pkcs11Error::AttributeValueInvalid(format!(
                    "unsupported modulus size {bits}"
                )));
            }
        };
        let label = public
            .get(CKA_LABEL)
            .or_else(|| private.get(CKA_LABEL))
            .map(<[u8]>::to_vec);

        Ok(Self {
            id: id.to_vec(),
            reference,
            modulus_bits,
            label,
        })
    }
}

/// Outcome of looking up one attribute on an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeLookup {
    Value(Vec<u8>),
    Sensitive,
    Invalid,
}

fn flag(value: bool) -> AttributeLookup {
    let b: CK_BBOOL = if value { CK_TRUE } else { CK_FALSE };
    AttributeLookup::Value(vec![b])
}

fn ulong(value: CK_ULONG) -> AttributeLookup {
    AttributeLookup::Value(value.to_ne_bytes().to_vec())
}

impl KeyObject {
    /// Cached, non-sensitive attributes. Private key components never leave
    /// the vault and read as sensitive.
    pub fn attribute(&self, kind: CK_ATTRIBUTE_TYPE) -> AttributeLookup {
        let private = self.class == ObjectClass::PrivateKey;
        let key = &self.key;
        match kind {
            CKA_CLASS => ulong(self.class.as_ck()),
            CKA_KEY_TYPE => ulong(CKK_RSA),
            CKA_ID => AttributeLookup::Value(key.id.clone()),
            CKA_LABEL => AttributeLookup::Value(key.label.clone().unwrap_or_default()),
            CKA_TOKEN => flag(true),
            CKA_LOCAL => flag(true),
            CKA_PRIVATE => flag(private),
            CKA_MODULUS => AttributeLookup::Value(key.bundle.modulus.clone()),
            CKA_PUBLIC_EXPONENT => AttributeLookup::Value(key.bundle.public_exponent.clone()),
            CKA_MODULUS_BITS => ulong(key.bundle.modulus_bits() as CK_ULONG),
            CKA_ENCRYPT => flag(!private),
            CKA_DECRYPT => flag(private),
            CKA_SENSITIVE if private => flag(true),
            CKA_EXTRACTABLE if private => flag(false),
            CKA_PRIVATE_EXPONENT | CKA_PRIME_1 | CKA_PRIME_2 | CKA_EXPONENT_1 | CKA_EXPONENT_2
            | CKA_COEFFICIENT
                if private =>
            {
                AttributeLookup::Sensitive
            }
            _ => AttributeLookup::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "https://vault.example/keys/key1";

    #[test]
    fn identifier_is_required() {
        let err = KeyPairRequest::from_templates(&Template::new(), &Template::new());
        assert_eq!(err, Err(Pkcs11Error::TemplateIncomplete));
        let empty = Template::new().with(CKA_ID, Vec::new());
        assert_eq!(
            KeyPairRequest::from_templates(&empty, &Template::new()),
            Err(Pkcs11Error::TemplateIncomplete)
        );
    }

    #[test]
    fn identifier_may_come_from_either_template() {
        let with_id = Template::new().with(CKA_ID, KEY.as_bytes());
        let from_public = KeyPairRequest::from_templates(&with_id, &Template::new()).unwrap();
        let from_private = KeyPairRequest::from_templates(&Template::new(), &with_id).unwrap();
        assert_eq!(from_public, from_private);
        assert_eq!(from_public.reference.name(), "key1");
    }

    #[test]
    fn conflicting_identifiers_are_rejected() {
        let a = Template::new().with(CKA_ID, KEY.as_bytes());
        let b = Template::new().with(CKA_ID, "https://vault.example/keys/key2".as_bytes());
        assert!(matches!(
            KeyPairRequest::from_templates(&a, &b),
            Err(Pkcs11Error::ArgumentsBad(_))
        ));
    }

    #[test]
    fn identifier_must_be_a_key_reference() {
        let bad = Template::new().with(CKA_ID, "key1".as_bytes());
        assert!(matches!(
            KeyPairRequest::from_templates(&bad, &Template::new()),
            Err(Pkcs11Error::ArgumentsBad(_))
        ));
    }

    #[test]
    fn modulus_bits_and_label_are_honoured() {
        let public = Template::new()
            .with(CKA_ID, KEY.as_bytes())
            .with_ulong(CKA_MODULUS_BITS, 3072)
            .with(CKA_LABEL, "payments".as_bytes())
            .with(CKA_ENCRYPT, vec![CK_TRUE]);
        let request = KeyPairRequest::from_templates(&public, &Template::new()).unwrap();
        assert_eq!(request.modulus_bits, Some(3072));
        assert_eq!(request.label.as_deref(), Some("payments".as_bytes()));

        let tiny = Template::new()
            .with(CKA_ID, KEY.as_bytes())
            .with_ulong(CKA_MODULUS_BITS, 512);
        assert!(matches!(
            KeyPairRequest::from_templates(&tiny, &Template::new()),
            Err(Pkcs11Error::AttributeValueInvalid(_))
        ));
    }

    #[test]
    fn raw_templates_are_copied() {
        let id = KEY.as_bytes();
        let mut raw = [CK_ATTRIBUTE {
            type_: CKA_ID,
            pValue: id.as_ptr() as *mut std::ffi::c_void,
            ulValueLen: id.len() as CK_ULONG,
        }];
        let template = unsafe { Template::from_raw(raw.as_mut_ptr(), 1) }.unwrap();
        assert_eq!(template.get(CKA_ID), Some(id));

        raw[0].pValue = std::ptr::null_mut();
        assert!(unsafe { Template::from_raw(raw.as_mut_ptr(), 1) }.is_err());
        assert!(unsafe { Template::from_raw(std::ptr::null_mut(), 1) }.is_err());
        assert_eq!(
            unsafe { Template::from_raw(std::ptr::null_mut(), 0) },
            Ok(Template::new())
        );
    }
}
