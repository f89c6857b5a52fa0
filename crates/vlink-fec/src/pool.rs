//! # Matrix Pool
//!
//! A fixed arena of [`FecMatrix`] generations kept in most-recently-used
//! order. The arena never grows or shrinks after construction; recency is
//! tracked by a small index vector that is rotated in place, so touching or
//! recycling a generation never allocates.

use crate::error::Result;
use crate::matrix::{FecMatrix, PacketKind};
use crate::wire::Packet;

/// What a recycled generation held before it was cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recycled {
    pub index: usize,
    /// Base sequence of the evicted generation, `None` if it was unused.
    pub previous_base: Option<u16>,
    /// Cells the evicted generation could never have repaired.
    pub unrecoverable: usize,
}

#[derive(Debug)]
pub struct MatrixPool {
    matrices: Vec<FecMatrix>,
    /// Arena indices, most recently used first.
    order: Vec<usize>,
}

impl MatrixPool {
    pub fn new(size: usize, rows: u8, columns: u8) -> Result<Self> {
        let matrices = (0..size)
            .map(|_| FecMatrix::new(rows, columns))
            .collect::<Result<Vec<_>>>()?;
        Ok(MatrixPool {
            matrices,
            order: (0..size).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    /// First matrix, in MRU order, that accepts the packet.
    pub fn find(&self, packet: &Packet, kind: PacketKind) -> Option<usize> {
        self.order
            .iter()
            .copied()
            .find(|&i| self.matrices[i].can_accept(packet, kind))
    }

    /// Mark a matrix most recently used.
    pub fn touch(&mut self, index: usize) {
        if let Some(pos) = self.order.iter().position(|&i| i == index) {
            self.order[..=pos].rotate_right(1);
        }
    }

    /// Clear the least recently used matrix and make it the most recent.
    pub fn recycle_lru(&mut self) -> Option<Recycled> {
        let &index = self.order.last()?;
        let matrix = &mut self.matrices[index];
        let recycled = Recycled {
            index,
            previous_base: matrix.base_sequence(),
            unrecoverable: matrix.unrecoverable_count(),
        };
        matrix.clear();
        self.touch(index);
        Some(recycled)
    }

    pub fn get(&self, index: usize) -> Option<&FecMatrix> {
        self.matrices.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut FecMatrix> {
        self.matrices.get_mut(index)
    }

    /// Matrices from most to least recently used.
    pub fn iter_mru(&self) -> impl Iterator<Item = &FecMatrix> + '_ {
        self.order.iter().map(|&i| &self.matrices[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RtpHeader;

    fn repair_for_base(base: u16) -> Packet {
        let mut enc = FecMatrix::new(1, 1).unwrap();
        let pkt = Packet::build(&RtpHeader::new(96, base, 0, 1), b"x").unwrap();
        enc.insert_and_repair(pkt).unwrap().remove(0)
    }

    fn media(seq: u16) -> Packet {
        Packet::build(&RtpHeader::new(96, seq, 0, 1), b"m").unwrap()
    }

    #[test]
    fn recycles_in_lru_order() {
        let mut pool = MatrixPool::new(3, 1, 1).unwrap();
        let mut used = Vec::new();
        for base in [10, 20, 30] {
            let r = pool.recycle_lru().unwrap();
            assert_eq!(r.previous_base, None);
            pool.get_mut(r.index)
                .unwrap()
                .insert_and_try_repair(repair_for_base(base), PacketKind::Repair)
                .unwrap();
            used.push(r.index);
        }
        used.sort_unstable();
        assert_eq!(used, vec![0, 1, 2]);

        // 10 is now the oldest generation.
        let r = pool.recycle_lru().unwrap();
        assert_eq!(r.previous_base, Some(10));
        let bases: Vec<Option<u16>> = pool.iter_mru().map(FecMatrix::base_sequence).collect();
        assert_eq!(bases, vec![None, Some(30), Some(20)]);
    }

    #[test]
    fn touch_moves_to_front() {
        let mut pool = MatrixPool::new(3, 1, 1).unwrap();
        for base in [10, 20, 30] {
            let r = pool.recycle_lru().unwrap();
            pool.get_mut(r.index)
                .unwrap()
                .insert_and_try_repair(repair_for_base(base), PacketKind::Repair)
                .unwrap();
        }
        let idx = pool.find(&media(10), PacketKind::Media).unwrap();
        pool.touch(idx);
        let bases: Vec<Option<u16>> = pool.iter_mru().map(FecMatrix::base_sequence).collect();
        assert_eq!(bases, vec![Some(10), Some(30), Some(20)]);

        let r = pool.recycle_lru().unwrap();
        assert_eq!(r.previous_base, Some(20));
    }

    #[test]
    fn find_matches_repair_by_base() {
        let mut pool = MatrixPool::new(2, 1, 1).unwrap();
        let r = pool.recycle_lru().unwrap();
        pool.get_mut(r.index)
            .unwrap()
            .insert_and_try_repair(repair_for_base(7), PacketKind::Repair)
            .unwrap();
        assert_eq!(
            pool.find(&repair_for_base(7), PacketKind::Repair),
            Some(r.index)
        );
        assert_eq!(pool.find(&repair_for_base(8), PacketKind::Repair), None);
        assert_eq!(pool.find(&media(8), PacketKind::Media), None);
    }

    #[test]
    fn recycling_reports_stuck_sequences() {
        let mut pool = MatrixPool::new(1, 2, 2).unwrap();
        let mut enc = FecMatrix::new(2, 2).unwrap();
        let mut repairs = Vec::new();
        for seq in 100..104 {
            repairs.extend(enc.insert_and_repair(media(seq)).unwrap());
        }
        // Row 0 parity only; nothing else arrives.
        let r = pool.recycle_lru().unwrap();
        pool.get_mut(r.index)
            .unwrap()
            .insert_and_try_repair(repairs[0].clone(), PacketKind::Repair)
            .unwrap();

        let r = pool.recycle_lru().unwrap();
        assert_eq!(r.previous_base, Some(100));
        assert_eq!(r.unrecoverable, 4);
        assert!(pool.get(r.index).unwrap().is_empty());
    }

    #[test]
    fn recycling_counts_only_what_parity_cannot_rebuild() {
        let mut pool = MatrixPool::new(1, 2, 2).unwrap();
        let mut enc = FecMatrix::new(2, 2).unwrap();
        let mut repairs = Vec::new();
        for seq in 100..104 {
            repairs.extend(enc.insert_and_repair(media(seq)).unwrap());
        }
        let r = pool.recycle_lru().unwrap();
        let matrix = pool.get_mut(r.index).unwrap();
        matrix
            .insert_and_try_repair(repairs[0].clone(), PacketKind::Repair)
            .unwrap();
        // 100 present, 101 rebuilt from row 0; 102 and 103 have no parity.
        matrix
            .insert_and_try_repair(media(100), PacketKind::Media)
            .unwrap();
        assert_eq!(r.unrecoverable, 0);

        let r = pool.recycle_lru().unwrap();
        assert_eq!(r.previous_base, Some(100));
        assert_eq!(r.unrecoverable, 2);
    }

    #[test]
    fn zero_sized_pool_has_nothing_to_recycle() {
        let mut pool = MatrixPool::new(0, 2, 2).unwrap();
        assert!(pool.is_empty());
        assert!(pool.recycle_lru().is_none());
    }
}
