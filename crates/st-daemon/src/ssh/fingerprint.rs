//! Host key fingerprints shown to the user for confirmation

use std::fmt;

use md5::{Digest, Md5};

/// MD5 digest of an SSH host key blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostFingerprint([u8; 16]);

impl HostFingerprint {
    /// Fingerprint the SSH wire encoding of a public key
    pub fn from_key_blob(blob: &[u8]) -> Self {
        let digest = Md5::digest(blob);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Compare against a fingerprint the client echoed back.
    ///
    /// Hex digit case and surrounding whitespace are ignored.
    pub fn matches(&self, confirmed: &str) -> bool {
        confirmed.trim().eq_ignore_ascii_case(&self.to_string())
    }
}

impl fmt::Display for HostFingerprint {
    /// `AA:BB:...:10`, 16 uppercase hex pairs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}
