use bitvec::prelude::*;

use crate::error::{FsError, FsResult};

/// Dense bit-vector tracking which blocks or inodes are in use.
/// A set bit means the resource is allocated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bitmap {
    bits: BitVec<u32, Lsb0>,
}

impl Bitmap {
    pub fn new(len: u64) -> Self {
        Bitmap {
            bits: BitVec::repeat(false, len as usize),
        }
    }

    /// rebuild a bitmap from its on-disk words
    pub fn from_words(words: Vec<u32>, len: u64) -> FsResult<Self> {
        if (words.len() as u64) * 32 < len {
            return Err(FsError::DiskCorrupt(format!(
                "{} words cannot hold {} bits",
                words.len(),
                len
            )));
        }
        let mut bits = BitVec::<u32, Lsb0>::from_vec(words);
        bits.truncate(len as usize);
        Ok(Bitmap { bits })
    }

    /// on-disk words, bits past the end are zero
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = self.bits.as_raw_slice().to_vec();
        let tail = self.bits.len() % 32;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u32 << tail) - 1;
            }
        }
        words
    }

    pub fn len(&self) -> u64 {
        self.bits.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn count_free(&self) -> u64 {
        self.bits.count_zeros() as u64
    }

    pub fn count_used(&self) -> u64 {
        self.bits.count_ones() as u64
    }

    fn check(&self, bit: u64) -> FsResult<usize> {
        if bit >= self.len() {
            return Err(FsError::InvalidArgument(format!(
                "bit {bit} out of range 0..{}",
                self.len()
            )));
        }
        Ok(bit as usize)
    }

    /// first clear bit from bit 0, set and returned
    pub fn allocate(&mut self) -> Option<u64> {
        let index = self.bits.first_zero()?;
        self.bits.set(index, true);
        Some(index as u64)
    }

    /// clear an allocated bit, freeing a clear bit is an error
    pub fn free(&mut self, bit: u64) -> FsResult<()> {
        let index = self.check(bit)?;
        if !self.bits[index] {
            return Err(FsError::InvalidArgument(format!("bit {bit} is already free")));
        }
        self.bits.set(index, false);
        Ok(())
    }

    pub fn test(&self, bit: u64) -> FsResult<bool> {
        let index = self.check(bit)?;
        Ok(self.bits[index])
    }

    /// set a bit, returning its previous value
    pub fn set(&mut self, bit: u64) -> FsResult<bool> {
        let index = self.check(bit)?;
        Ok(self.bits.replace(index, true))
    }

    /// clear a bit, returning its previous value
    pub fn clear(&mut self, bit: u64) -> FsResult<bool> {
        let index = self.check(bit)?;
        Ok(self.bits.replace(index, false))
    }

    /// mark `0..count` as used
    pub fn reserve_leading(&mut self, count: u64) -> FsResult<()> {
        if count > self.len() {
            return Err(FsError::InvalidArgument(format!(
                "cannot reserve {count} of {} bits",
                self.len()
            )));
        }
        self.bits[..count as usize].fill(true);
        Ok(())
    }

    /// indices of every set bit
    pub fn iter_used(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits.iter_ones().map(|i| i as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_scans_from_start() {
        let mut bitmap = Bitmap::new(15);
        bitmap.reserve_leading(15).unwrap();
        bitmap.clear(9).unwrap();
        assert_eq!(bitmap.allocate(), Some(9));
        assert!(bitmap.test(9).unwrap());
        assert_eq!(bitmap.allocate(), None);

        let mut bitmap = Bitmap::new(15);
        assert_eq!(bitmap.allocate(), Some(0));
        assert_eq!(bitmap.allocate(), Some(1));
        assert_eq!(bitmap.count_free(), 13);
    }

    #[test]
    fn test_allocated_bit_not_reused_until_freed() {
        let mut bitmap = Bitmap::new(4);
        let a = bitmap.allocate().unwrap();
        let b = bitmap.allocate().unwrap();
        assert_ne!(a, b);
        bitmap.free(a).unwrap();
        assert_eq!(bitmap.allocate(), Some(a));
        assert!(bitmap.free(3).is_err());
    }

    #[test]
    fn test_out_of_range_is_invalid_argument() {
        let mut bitmap = Bitmap::new(10);
        assert!(matches!(bitmap.test(10), Err(FsError::InvalidArgument(_))));
        assert!(matches!(bitmap.set(11), Err(FsError::InvalidArgument(_))));
        assert!(matches!(bitmap.free(100), Err(FsError::InvalidArgument(_))));
        assert!(bitmap.reserve_leading(11).is_err());
    }

    #[test]
    fn test_words_round_trip_masks_tail() {
        let mut bitmap = Bitmap::new(40);
        bitmap.reserve_leading(40).unwrap();
        let words = bitmap.to_words();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], u32::MAX);
        assert_eq!(words[1], 0xff);
        let restored = Bitmap::from_words(words, 40).unwrap();
        assert_eq!(restored, bitmap);
        assert!(Bitmap::from_words(vec![0], 40).is_err());
    }
}
