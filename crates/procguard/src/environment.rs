//! Serialized environment blocks.

use thiserror::Error;

/// A variable that cannot be written into a block without changing its
/// meaning for the child.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvBlockError {
    #[error("environment variable with an empty name")]
    EmptyKey,

    #[error("environment variable name `{0}` contains `=`")]
    EqualsInKey(String),

    #[error("environment variable `{0}` contains a NUL byte")]
    NulByte(String),
}

/// Environment in its native serialized form: `key=value\0` entries in the
/// order given, then one more `\0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvBlock {
    bytes: Vec<u8>,
}

impl EnvBlock {
    /// Serialize `pairs`.
    ///
    /// Keys may start with `=` (drive-letter variables such as `=C:`) but not
    /// contain one later on. Neither keys nor values may contain NUL.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, EnvBlockError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut bytes = Vec::new();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            check_pair(key, value)?;
            bytes.extend_from_slice(key);
            bytes.push(b'=');
            bytes.extend_from_slice(value);
            bytes.push(0);
        }
        bytes.push(0);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the block carries no variables (it is still one NUL long).
    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= 1
    }

    /// Iterate `(key, value)` pairs back out of the block.
    ///
    /// The key ends at the first `=` after its first byte, so keys such as
    /// `=C:` keep their leading `=`.
    pub fn entries(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.bytes
            .split(|&b| b == 0)
            .take_while(|entry| !entry.is_empty())
            .map(|entry| {
                match entry
                    .iter()
                    .skip(1)
                    .position(|&b| b == b'=')
                    .map(|p| p + 1)
                {
                    Some(eq) => (&entry[..eq], &entry[eq + 1..]),
                    None => (entry, &entry[entry.len()..]),
                }
            })
    }
}

fn check_pair(key: &[u8], value: &[u8]) -> Result<(), EnvBlockError> {
    let name = || String::from_utf8_lossy(key).into_owned();
    match key.split_first() {
        None => Err(EnvBlockError::EmptyKey),
        Some((_, rest)) if rest.contains(&b'=') => Err(EnvBlockError::EqualsInKey(name())),
        _ if key.contains(&0) || value.contains(&0) => Err(EnvBlockError::NulByte(name())),
        _ => Ok(()),
    }
}
