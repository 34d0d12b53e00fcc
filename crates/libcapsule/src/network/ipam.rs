//! Bitmap IP allocator. One bit per usable host address in the network's
//! range, persisted beside the network definition so allocations survive
//! runtime restarts.
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;

use super::{Cidr, NetworkError};
use crate::utils;

type Result<T> = std::result::Result<T, NetworkError>;

pub struct IpAllocator {
    range: Cidr,
    bitmap_path: PathBuf,
    // all bitmap mutations serialize here; the file is rewritten inside the
    // critical section so the on-disk copy never lags a concurrent caller
    bits: Mutex<Vec<u8>>,
}

impl IpAllocator {
    /// Opens the allocator for `range`, loading the persisted bitmap when
    /// one exists.
    pub fn load(range: Cidr, bitmap_path: PathBuf) -> Result<Self> {
        let byte_len = (range.host_count() as usize + 7) / 8;
        let bits = match std::fs::read(&bitmap_path) {
            Ok(mut persisted) => {
                persisted.resize(byte_len, 0);
                persisted
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => vec![0u8; byte_len],
            Err(err) => return Err(NetworkError::Io(err)),
        };
        Ok(Self {
            range,
            bitmap_path,
            bits: Mutex::new(bits),
        })
    }

    /// Hands out the lowest free host address.
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let mut bits = self.bits.lock().expect("allocator mutex poisoned");
        let host_count = self.range.host_count();
        for index in 0..host_count {
            if !get_bit(&bits, index as usize) {
                set_bit(&mut bits, index as usize, true);
                self.persist(&bits)?;
                let ip = self.range.host_at(index);
                tracing::debug!(%ip, "allocated ip");
                return Ok(ip);
            }
        }
        Err(NetworkError::NoFreeIp)
    }

    /// Returns an address to the pool. Releasing an unallocated address is
    /// a no-op.
    pub fn release(&self, ip: Ipv4Addr) -> Result<()> {
        let index = self
            .range
            .host_index(ip)
            .ok_or_else(|| NetworkError::AddressOutOfRange(ip, self.range.clone()))?;
        let mut bits = self.bits.lock().expect("allocator mutex poisoned");
        set_bit(&mut bits, index as usize, false);
        self.persist(&bits)?;
        tracing::debug!(%ip, "released ip");
        Ok(())
    }

    /// True when no address is currently allocated.
    pub fn is_empty(&self) -> bool {
        let bits = self.bits.lock().expect("allocator mutex poisoned");
        bits.iter().all(|byte| *byte == 0)
    }

    fn persist(&self, bits: &[u8]) -> Result<()> {
        utils::atomic_write(&self.bitmap_path, bits).map_err(NetworkError::Io)
    }
}

fn get_bit(bits: &[u8], index: usize) -> bool {
    bits[index / 8] & (1 << (index % 8)) != 0
}

fn set_bit(bits: &mut [u8], index: usize, value: bool) {
    if value {
        bits[index / 8] |= 1 << (index % 8);
    } else {
        bits[index / 8] &= !(1 << (index % 8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn allocator(range: &str) -> (tempfile::TempDir, IpAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpAllocator::load(
            Cidr::from_str(range).unwrap(),
            dir.path().join("test.bitmap"),
        )
        .unwrap();
        (dir, allocator)
    }

    #[test]
    fn test_allocates_lowest_free_first() {
        let (_dir, allocator) = allocator("10.0.0.0/24");
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let (_dir, allocator) = allocator("10.0.0.0/30");
        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        assert_ne!(first, second);
        assert!(matches!(allocator.allocate(), Err(NetworkError::NoFreeIp)));

        allocator.release(first).unwrap();
        assert_eq!(allocator.allocate().unwrap(), first);
    }

    #[test]
    fn test_release_restores_initial_bitmap() {
        let (_dir, allocator) = allocator("10.0.0.0/28");
        let mut allocated = Vec::new();
        for _ in 0..5 {
            allocated.push(allocator.allocate().unwrap());
        }
        // release out of order
        for ip in [allocated[3], allocated[0], allocated[4], allocated[1], allocated[2]] {
            allocator.release(ip).unwrap();
        }
        assert!(allocator.is_empty());
    }

    #[test]
    fn test_bitmap_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.bitmap");
        let range = Cidr::from_str("192.168.10.0/29").unwrap();

        let allocator = IpAllocator::load(range.clone(), path.clone()).unwrap();
        let first = allocator.allocate().unwrap();
        drop(allocator);

        let reloaded = IpAllocator::load(range, path).unwrap();
        let next = reloaded.allocate().unwrap();
        assert_ne!(first, next);
    }

    #[test]
    fn test_release_out_of_range_rejected() {
        let (_dir, allocator) = allocator("10.0.0.0/30");
        assert!(allocator.release(Ipv4Addr::new(172, 16, 0, 1)).is_err());
    }
}
