//! Certificate material for the QUIC transport.

use anyhow::Context;

/// A freshly generated certificate and its key, both DER encoded.
pub struct SelfSigned {
    pub cert_der: Vec<u8>,
    pub key_pkcs8_der: Vec<u8>,
}

impl SelfSigned {
    /// Generates a certificate valid for `names`.
    ///
    /// # Errors
    ///
    /// Fails if a name is not a valid DNS name or key generation fails.
    pub fn generate(names: &[&str]) -> anyhow::Result<Self> {
        let names = names.iter().map(ToString::to_string).collect::<Vec<_>>();
        let generated =
            rcgen::generate_simple_self_signed(names).context("certificate generation failed")?;
        Ok(Self {
            cert_der: generated.cert.der().to_vec(),
            key_pkcs8_der: generated.key_pair.serialize_der(),
        })
    }
}
