//! Peer identifier in the overlay.
use rand::Rng;
use std::fmt::{self, Debug, Display, Formatter};

use crate::{Error, Result};

/// The size of peer Ids in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Default)]
/// Fixed-width peer identifier.
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// Returns true if this is the all-zero Id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; ID_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_bytes_checks_length() {
        assert!(matches!(
            Id::from_bytes([0u8; 19]),
            Err(Error::InvalidIdSize(19))
        ));

        let id = Id::random();
        assert_eq!(Id::from_bytes(id.as_bytes()).unwrap(), id);
    }

    #[test]
    fn display_is_hex() {
        let mut bytes = [0u8; ID_SIZE];
        bytes[0] = 0xab;
        bytes[19] = 0x01;

        let id = Id::from(bytes);

        assert_eq!(
            id.to_string(),
            "ab00000000000000000000000000000000000001"
        );
        assert!(Id::default().is_zero());
    }
}
