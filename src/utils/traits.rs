use anyhow::{anyhow, Ok};
use bincode::config;
use serde::{de::DeserializeOwned, Serialize};

/// cacluate [blake3] hash of a serilizeable object
pub fn digest<T: Serialize>(t: &T) -> anyhow::Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&bincode::serde::encode_to_vec(t, config::legacy())?);
    let mut hash = hasher.finalize_xof();
    let mut output = [0u8; 32];
    hash.fill(&mut output);
    Ok(output)
}

/// Trait for objects which store their own digest in a field
pub trait DigestInSelf: Serialize + Sized {
    fn digest_field(&mut self) -> &mut [u8; 32];

    /// recompute the digest over the object with the digest field zeroed
    fn digest(&mut self) -> anyhow::Result<()> {
        *self.digest_field() = [0u8; 32];
        let computed = digest(&*self)?;
        *self.digest_field() = computed;
        Ok(())
    }

    /// check the stored digest, the object is left unchanged
    fn verify_digest(&mut self) -> anyhow::Result<bool> {
        let stored = *self.digest_field();
        *self.digest_field() = [0u8; 32];
        let computed = digest(&*self);
        *self.digest_field() = stored;
        Ok(computed? == stored)
    }
}

/// Trait for serializing and deserializing an object which stores digest in the object itself
/// # Note
/// Every object is encoded with the legacy (fixed-int) bincode configuration,
/// so a given type always occupies the same number of bytes
pub trait SerializeAndDigest: DeserializeOwned + DigestInSelf {
    /// serialize into a [Vec](std::vec::Vec), refreshing the digest first
    fn serialize(&mut self) -> anyhow::Result<Vec<u8>> {
        self.digest()?;
        bincode::serde::encode_to_vec(&*self, config::legacy()).map_err(|e| e.into())
    }

    /// serialize into a fixed-size slot, failing if the record does not fit
    fn serialize_into_slot(&mut self, slot: &mut [u8]) -> anyhow::Result<usize> {
        let bytes = SerializeAndDigest::serialize(self)?;
        if bytes.len() > slot.len() {
            return Err(anyhow!(
                "record of {} bytes does not fit a {} byte slot",
                bytes.len(),
                slot.len()
            ));
        }
        slot[..bytes.len()].copy_from_slice(&bytes);
        slot[bytes.len()..].fill(0);
        Ok(bytes.len())
    }

    /// deserialize from a slice
    /// # Returns
    /// A tuple containing the deserialized object and the number of bytes read
    fn deserialize(buf: &[u8]) -> anyhow::Result<(Self, usize)> {
        let (mut object, bytes_read): (Self, usize) =
            bincode::serde::decode_from_slice(buf, config::legacy())?;
        if !object.verify_digest()? {
            Err(anyhow!("deserialized object digest verification failed"))
        } else {
            Ok((object, bytes_read))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
    struct Record {
        value: u64,
        label: String,
        digest: [u8; 32],
    }

    impl DigestInSelf for Record {
        fn digest_field(&mut self) -> &mut [u8; 32] {
            &mut self.digest
        }
    }
    impl SerializeAndDigest for Record {}

    #[test]
    fn test_tampered_record_is_rejected() -> anyhow::Result<()> {
        let mut record = Record {
            value: 7,
            label: "seven".into(),
            ..Default::default()
        };
        let mut bytes = SerializeAndDigest::serialize(&mut record)?;
        let (decoded, read) = <Record as SerializeAndDigest>::deserialize(&bytes)?;
        assert_eq!(read, bytes.len());
        assert_eq!(decoded, record);

        // flip one bit of `value`
        bytes[0] ^= 1;
        assert!(<Record as SerializeAndDigest>::deserialize(&bytes).is_err());
        Ok(())
    }

    #[test]
    fn test_slot_too_small() {
        let mut record = Record::default();
        let mut slot = [0u8; 8];
        assert!(record.serialize_into_slot(&mut slot).is_err());
        let mut slot = [0xffu8; 128];
        let written = record.serialize_into_slot(&mut slot).unwrap();
        assert!(slot[written..].iter().all(|b| *b == 0));
    }
}
