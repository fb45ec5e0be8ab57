//! Signature trailer: hashing, OpenSSL signing and verification.
//!
//! ```text
//! ... file data | signature bytes | [sig_len u32] | flag u32 | "GBMB"
//! ```
//!
//! `sig_len` is only present for the OpenSSL variants, whose output size
//! depends on the key. The signature covers every byte before it.

use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use digest::DynDigest;
use openssl::hash::{Hasher, MessageDigest};
use openssl::md::{Md, MdRef};
use openssl::pkey::{PKey, Private};
use openssl::pkey_ctx::PkeyCtx;
use openssl::sign::Signer;
use tracing::debug;

use crate::error::{PharError, Result};

use super::structures::SIGNATURE_MAGIC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    /// RSA/DSA signature over SHA-1, the classic OpenSSL flavor.
    OpenSsl,
    OpenSslSha256,
    OpenSslSha512,
}

impl SignatureAlgorithm {
    pub fn from_flag(flag: u32) -> Result<Self> {
        match flag {
            0x01 => Ok(Self::Md5),
            0x02 => Ok(Self::Sha1),
            0x03 => Ok(Self::Sha256),
            0x04 => Ok(Self::Sha512),
            0x10 => Ok(Self::OpenSsl),
            0x11 => Ok(Self::OpenSslSha256),
            0x12 => Ok(Self::OpenSslSha512),
            other => Err(PharError::Signature(format!(
                "unknown signature type flag {other:#x}"
            ))),
        }
    }

    pub fn flag(&self) -> u32 {
        match self {
            Self::Md5 => 0x01,
            Self::Sha1 => 0x02,
            Self::Sha256 => 0x03,
            Self::Sha512 => 0x04,
            Self::OpenSsl => 0x10,
            Self::OpenSslSha256 => 0x11,
            Self::OpenSslSha512 => 0x12,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
            Self::OpenSsl => "OpenSSL",
            Self::OpenSslSha256 => "OpenSSL SHA-256",
            Self::OpenSslSha512 => "OpenSSL SHA-512",
        }
    }

    /// Digest size for hash algorithms; `None` for OpenSSL variants.
    pub fn digest_len(&self) -> Option<usize> {
        match self {
            Self::Md5 => Some(16),
            Self::Sha1 => Some(20),
            Self::Sha256 => Some(32),
            Self::Sha512 => Some(64),
            _ => None,
        }
    }

    pub fn is_openssl(&self) -> bool {
        self.digest_len().is_none()
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            Self::OpenSslSha256 => MessageDigest::sha256(),
            Self::OpenSslSha512 => MessageDigest::sha512(),
            _ => MessageDigest::sha1(),
        }
    }

    fn md(&self) -> &'static MdRef {
        match self {
            Self::OpenSslSha256 => Md::sha256(),
            Self::OpenSslSha512 => Md::sha512(),
            _ => Md::sha1(),
        }
    }

    fn hasher(&self) -> Option<Box<dyn DynDigest + Send>> {
        match self {
            Self::Md5 => Some(Box::new(md5::Md5::default())),
            Self::Sha1 => Some(Box::new(sha1::Sha1::default())),
            Self::Sha256 => Some(Box::new(sha2::Sha256::default())),
            Self::Sha512 => Some(Box::new(sha2::Sha512::default())),
            _ => None,
        }
    }
}

impl std::str::FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', ' '], "-").as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            "openssl" => Ok(Self::OpenSsl),
            "openssl-sha256" => Ok(Self::OpenSslSha256),
            "openssl-sha512" => Ok(Self::OpenSslSha512),
            other => Err(format!("unknown signature algorithm '{other}'")),
        }
    }
}

/// A decoded or freshly computed signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Hash {
        algorithm: SignatureAlgorithm,
        digest: Vec<u8>,
    },
    OpenSsl {
        algorithm: SignatureAlgorithm,
        digest: Vec<u8>,
        /// PEM public key, kept next to the archive rather than inside it.
        public_key: Option<String>,
    },
}

impl Signature {
    pub fn from_raw(algorithm: SignatureAlgorithm, digest: Vec<u8>) -> Self {
        if algorithm.is_openssl() {
            Signature::OpenSsl {
                algorithm,
                digest,
                public_key: None,
            }
        } else {
            Signature::Hash { algorithm, digest }
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Signature::Hash { algorithm, .. } | Signature::OpenSsl { algorithm, .. } => *algorithm,
        }
    }

    pub fn digest(&self) -> &[u8] {
        match self {
            Signature::Hash { digest, .. } | Signature::OpenSsl { digest, .. } => digest,
        }
    }

    /// Uppercase hex of the raw signature bytes.
    pub fn hash(&self) -> String {
        hex::encode_upper(self.digest())
    }

    pub fn public_key(&self) -> Option<&str> {
        match self {
            Signature::OpenSsl { public_key, .. } => public_key.as_deref(),
            Signature::Hash { .. } => None,
        }
    }

    /// Encode the trailer appended after the file data.
    pub fn to_trailer(&self) -> Vec<u8> {
        let digest = self.digest();
        let mut out = Vec::with_capacity(digest.len() + 12);
        out.extend_from_slice(digest);
        if self.algorithm().is_openssl() {
            let _ = out.write_u32::<LittleEndian>(digest.len() as u32);
        }
        let _ = out.write_u32::<LittleEndian>(self.algorithm().flag());
        out.extend_from_slice(SIGNATURE_MAGIC);
        out
    }
}

/// Inspect the last 8 bytes of an archive.
///
/// `Ok(None)` means there is no `GBMB` magic, i.e. the archive is unsigned.
pub fn parse_footer(footer: &[u8; 8]) -> Result<Option<SignatureAlgorithm>> {
    if &footer[4..8] != SIGNATURE_MAGIC {
        return Ok(None);
    }
    let flag = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    SignatureAlgorithm::from_flag(flag).map(Some)
}

/// PEM private key plus optional passphrase used for OpenSSL signing.
#[derive(Clone)]
pub struct PrivateKey {
    pem: Vec<u8>,
    passphrase: Option<String>,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("pem", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl PrivateKey {
    pub fn from_pem(pem: impl Into<Vec<u8>>, passphrase: Option<String>) -> Self {
        Self {
            pem: pem.into(),
            passphrase,
        }
    }

    pub fn load(path: &Path, passphrase: Option<String>) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| {
            PharError::Signing(format!("cannot read private key '{}': {e}", path.display()))
        })?;
        Ok(Self::from_pem(pem, passphrase))
    }

    /// Check that the key parses with its passphrase.
    pub(crate) fn validate(&self) -> Result<()> {
        self.pkey().map(|_| ())
    }

    fn pkey(&self) -> Result<PKey<Private>> {
        let parsed = match &self.passphrase {
            Some(pass) => PKey::private_key_from_pem_passphrase(&self.pem, pass.as_bytes()),
            None => PKey::private_key_from_pem(&self.pem),
        };
        parsed.map_err(|e| PharError::Signing(format!("cannot load private key: {e}")))
    }
}

/// Sign or hash `data`.
///
/// OpenSSL variants need `private_key`; the returned signature carries the
/// matching public key PEM.
pub fn compute(
    data: &[u8],
    algorithm: SignatureAlgorithm,
    private_key: Option<&PrivateKey>,
) -> Result<Signature> {
    if let Some(mut hasher) = algorithm.hasher() {
        hasher.update(data);
        return Ok(Signature::Hash {
            algorithm,
            digest: hasher.finalize().into_vec(),
        });
    }

    let key = private_key.ok_or_else(|| {
        PharError::Signing(format!("{} signing needs a private key", algorithm.name()))
    })?;
    let pkey = key.pkey()?;
    let signing_error = |e: openssl::error::ErrorStack| PharError::Signing(e.to_string());

    let mut signer = Signer::new(algorithm.message_digest(), &pkey).map_err(signing_error)?;
    signer.update(data).map_err(signing_error)?;
    let digest = signer.sign_to_vec().map_err(signing_error)?;

    let public_key = pkey.public_key_to_pem().map_err(signing_error)?;
    let public_key = String::from_utf8(public_key)
        .map_err(|e| PharError::Signing(format!("public key is not valid PEM text: {e}")))?;

    debug!(algorithm = algorithm.name(), len = digest.len(), "signed archive");
    Ok(Signature::OpenSsl {
        algorithm,
        digest,
        public_key: Some(public_key),
    })
}

/// Check `signature` against `data`. A mismatch is `Ok(false)`.
pub fn verify(data: &[u8], signature: &Signature, public_key: Option<&str>) -> Result<bool> {
    let mut verifier = SignatureVerifier::new(signature.algorithm())?;
    verifier.update(data)?;
    verifier.finish(signature, public_key)
}

/// Incremental verifier for archives read in chunks.
///
/// Nothing but the running digest is kept, for every algorithm.
pub struct SignatureVerifier {
    algorithm: SignatureAlgorithm,
    state: VerifierState,
}

enum VerifierState {
    Digest(Box<dyn DynDigest + Send>),
    // The key only sees the final digest, so it is not needed until `finish`.
    OpenSsl(Hasher),
}

fn signature_error(e: openssl::error::ErrorStack) -> PharError {
    PharError::Signature(e.to_string())
}

impl SignatureVerifier {
    pub fn new(algorithm: SignatureAlgorithm) -> Result<Self> {
        let state = match algorithm.hasher() {
            Some(hasher) => VerifierState::Digest(hasher),
            None => VerifierState::OpenSsl(
                Hasher::new(algorithm.message_digest()).map_err(signature_error)?,
            ),
        };
        Ok(Self { algorithm, state })
    }

    pub fn update(&mut self, chunk: &[u8]) -> Result<()> {
        match &mut self.state {
            VerifierState::Digest(hasher) => hasher.update(chunk),
            VerifierState::OpenSsl(hasher) => hasher.update(chunk).map_err(signature_error)?,
        }
        Ok(())
    }

    /// Compare against `signature`. For OpenSSL variants the public key is
    /// taken from `public_key`, falling back to the one on the signature.
    pub fn finish(self, signature: &Signature, public_key: Option<&str>) -> Result<bool> {
        if signature.algorithm() != self.algorithm {
            return Ok(false);
        }
        match self.state {
            VerifierState::Digest(hasher) => Ok(*hasher.finalize() == *signature.digest()),
            VerifierState::OpenSsl(mut hasher) => {
                let pem = public_key.or(signature.public_key()).ok_or_else(|| {
                    PharError::Signature(format!(
                        "{} signature needs a public key to verify",
                        self.algorithm.name()
                    ))
                })?;
                let pkey = PKey::public_key_from_pem(pem.as_bytes())
                    .map_err(|e| PharError::Signature(format!("cannot load public key: {e}")))?;
                let digest = hasher.finish().map_err(signature_error)?;

                let mut ctx = PkeyCtx::new(&pkey).map_err(signature_error)?;
                ctx.verify_init().map_err(signature_error)?;
                ctx.set_signature_md(self.algorithm.md())
                    .map_err(signature_error)?;
                // OpenSSL reports malformed signature bytes as an error
                Ok(ctx.verify(&digest, signature.digest()).unwrap_or(false))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::rsa::Rsa;
    use openssl::symm::Cipher;

    const DATA: &[u8] = b"<?php __HALT_COMPILER(); ?>\r\nmanifest-and-data";

    fn rsa_key(passphrase: Option<&str>) -> PrivateKey {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let pem = match passphrase {
            Some(pass) => pkey
                .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), pass.as_bytes())
                .unwrap(),
            None => pkey.private_key_to_pem_pkcs8().unwrap(),
        };
        PrivateKey::from_pem(pem, passphrase.map(str::to_string))
    }

    #[test]
    fn hash_signatures_verify() {
        for algorithm in [
            SignatureAlgorithm::Md5,
            SignatureAlgorithm::Sha1,
            SignatureAlgorithm::Sha256,
            SignatureAlgorithm::Sha512,
        ] {
            let sig = compute(DATA, algorithm, None).unwrap();
            assert_eq!(sig.digest().len(), algorithm.digest_len().unwrap());
            assert_eq!(sig.hash(), sig.hash().to_uppercase());
            assert!(verify(DATA, &sig, None).unwrap(), "{}", algorithm.name());

            let mut tampered = DATA.to_vec();
            tampered[3] ^= 0x01;
            assert!(!verify(&tampered, &sig, None).unwrap());
        }
    }

    #[test]
    fn sha1_known_digest() {
        let sig = compute(b"abc", SignatureAlgorithm::Sha1, None).unwrap();
        assert_eq!(sig.hash(), "A9993E364706816ABA3E25717850C26C9CD0D89D");
    }

    #[test]
    fn trailer_layout() {
        let sig = compute(DATA, SignatureAlgorithm::Sha256, None).unwrap();
        let trailer = sig.to_trailer();
        assert_eq!(trailer.len(), 32 + 8);
        assert_eq!(&trailer[32..36], &3u32.to_le_bytes());
        assert_eq!(&trailer[36..], b"GBMB");

        let footer: [u8; 8] = trailer[32..].try_into().unwrap();
        assert_eq!(parse_footer(&footer).unwrap(), Some(SignatureAlgorithm::Sha256));
        assert_eq!(parse_footer(b"abcdefgh").unwrap(), None);

        let unknown: [u8; 8] = [0x7f, 0, 0, 0, b'G', b'B', b'M', b'B'];
        assert!(matches!(
            parse_footer(&unknown).unwrap_err(),
            PharError::Signature(_)
        ));
    }

    #[test]
    fn openssl_sign_and_verify() {
        let key = rsa_key(Some("secret"));
        let sig = compute(DATA, SignatureAlgorithm::OpenSsl, Some(&key)).unwrap();
        let public_key = sig.public_key().unwrap().to_string();
        assert!(public_key.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(sig.digest().len(), 256);

        let trailer = sig.to_trailer();
        assert_eq!(&trailer[256..260], &256u32.to_le_bytes());
        assert_eq!(&trailer[260..264], &0x10u32.to_le_bytes());

        // Decoded signatures carry no key; it comes from the .pubkey file.
        let decoded = Signature::from_raw(SignatureAlgorithm::OpenSsl, sig.digest().to_vec());
        assert!(verify(DATA, &decoded, Some(&public_key)).unwrap());
        assert!(!verify(b"other", &decoded, Some(&public_key)).unwrap());
        assert!(matches!(
            verify(DATA, &decoded, None).unwrap_err(),
            PharError::Signature(_)
        ));
    }

    #[test]
    fn openssl_sha256_variant() {
        let key = rsa_key(None);
        let sig = compute(DATA, SignatureAlgorithm::OpenSslSha256, Some(&key)).unwrap();
        assert!(verify(DATA, &sig, None).unwrap());

        let mut flipped = sig.digest().to_vec();
        flipped[0] ^= 0x80;
        let flipped = Signature::from_raw(SignatureAlgorithm::OpenSslSha256, flipped);
        assert!(!verify(DATA, &flipped, sig.public_key()).unwrap());
    }

    #[test]
    fn signing_errors() {
        let err = compute(DATA, SignatureAlgorithm::OpenSsl, None).unwrap_err();
        assert!(matches!(err, PharError::Signing(_)));

        let wrong_pass = PrivateKey {
            passphrase: Some("nope".into()),
            ..rsa_key(Some("secret"))
        };
        let err = compute(DATA, SignatureAlgorithm::OpenSsl, Some(&wrong_pass)).unwrap_err();
        assert!(matches!(err, PharError::Signing(_)));

        let err = PrivateKey::load(Path::new("/nonexistent/key.pem"), None).unwrap_err();
        assert!(matches!(err, PharError::Signing(_)));
    }

    #[test]
    fn streamed_verification_matches_one_shot() {
        let sig = compute(DATA, SignatureAlgorithm::Sha512, None).unwrap();
        let mut verifier = SignatureVerifier::new(SignatureAlgorithm::Sha512).unwrap();
        for chunk in DATA.chunks(7) {
            verifier.update(chunk).unwrap();
        }
        assert!(verifier.finish(&sig, None).unwrap());
    }

    #[test]
    fn streamed_openssl_verification() {
        let key = rsa_key(None);
        let data = DATA.repeat(1000);
        for algorithm in [
            SignatureAlgorithm::OpenSsl,
            SignatureAlgorithm::OpenSslSha256,
            SignatureAlgorithm::OpenSslSha512,
        ] {
            let sig = compute(&data, algorithm, Some(&key)).unwrap();
            let decoded = Signature::from_raw(algorithm, sig.digest().to_vec());

            let mut verifier = SignatureVerifier::new(algorithm).unwrap();
            for chunk in data.chunks(4096) {
                verifier.update(chunk).unwrap();
            }
            assert!(verifier.finish(&decoded, sig.public_key()).unwrap(), "{}", algorithm.name());

            let mut verifier = SignatureVerifier::new(algorithm).unwrap();
            for chunk in data[1..].chunks(4096) {
                verifier.update(chunk).unwrap();
            }
            assert!(!verifier.finish(&decoded, sig.public_key()).unwrap());
        }
    }

    #[test]
    fn parses_algorithm_names() {
        assert_eq!("SHA-1".parse::<SignatureAlgorithm>().unwrap(), SignatureAlgorithm::Sha1);
        assert_eq!(
            "openssl_sha512".parse::<SignatureAlgorithm>().unwrap(),
            SignatureAlgorithm::OpenSslSha512
        );
        assert!("crc".parse::<SignatureAlgorithm>().is_err());
    }
}
