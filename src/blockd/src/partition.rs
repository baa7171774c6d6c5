//! Partition remapper: presents a fixed LBA window of a parent device as a
//! device of its own, rewriting device offsets on the way down. Partition
//! table discovery happens elsewhere; this consumes a validated entry.

use std::sync::Arc;

use thiserror::Error;

use interface::{DeviceInfo, PartitionMeta, Status, GUID_LEN, NAME_LEN};

use crate::driver::{BlockCommand, BlockOp, BlockQueue};

#[derive(Debug, Error)]
pub enum Error {
    #[error("partition window [{first}, {last}] exceeds parent device of {parent} blocks")]
    WindowOutOfBounds { first: u64, last: u64, parent: u64 },
}

pub struct PartitionDevice {
    parent: Arc<dyn BlockQueue>,
    /// Parent geometry with `block_count` narrowed to the window.
    info: DeviceInfo,
    block_op_size: usize,
    first_lba: u64,
    last_lba: u64,
}

impl PartitionDevice {
    /// `meta` carries inclusive LBA bounds, already validated against the
    /// partition table; bounds are still checked against the parent geometry.
    pub fn new(parent: Arc<dyn BlockQueue>, meta: &PartitionMeta) -> Result<PartitionDevice, Error> {
        let (parent_info, block_op_size) = parent.query();
        if meta.last_lba < meta.first_lba || meta.last_lba >= parent_info.block_count {
            return Err(Error::WindowOutOfBounds {
                first: meta.first_lba,
                last: meta.last_lba,
                parent: parent_info.block_count,
            });
        }
        let mut info = parent_info;
        info.block_count = meta.last_lba - meta.first_lba + 1;
        Ok(PartitionDevice {
            parent,
            info,
            block_op_size,
            first_lba: meta.first_lba,
            last_lba: meta.last_lba,
        })
    }

    fn lba_count(&self) -> u64 {
        // last LBA is inclusive
        self.last_lba - self.first_lba + 1
    }
}

impl BlockQueue for PartitionDevice {
    fn query(&self) -> (DeviceInfo, usize) {
        (self.info, self.block_op_size)
    }

    fn queue(&self, mut op: BlockOp) {
        match op.command {
            BlockCommand::Read | BlockCommand::Write => {
                let blocks = op.blocks();
                let window = self.lba_count();
                if op.offset_dev >= window || window - op.offset_dev < blocks {
                    op.complete(Status::OutOfRange);
                    return;
                }
                // adjust for the partition's starting block
                op.offset_dev += self.first_lba;
            }
            BlockCommand::Flush => {}
        }
        self.parent.queue(op);
    }
}

/// Render a GUID in canonical `8-4-4-4-12` form.
pub fn guid_to_string(guid: &[u8; GUID_LEN]) -> String {
    let d1 = u32::from_le_bytes([guid[0], guid[1], guid[2], guid[3]]);
    let d2 = u16::from_le_bytes([guid[4], guid[5]]);
    let d3 = u16::from_le_bytes([guid[6], guid[7]]);
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        d1,
        d2,
        d3,
        guid[8],
        guid[9],
        guid[10],
        guid[11],
        guid[12],
        guid[13],
        guid[14],
        guid[15]
    )
}

/// Decode the NUL-padded UTF-16LE name field.
pub fn utf16_name_to_string(raw: &[u8; NAME_LEN]) -> String {
    let mut units = Vec::with_capacity(NAME_LEN / 2);
    for pair in raw.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use interface::{DeviceFlags, IoFlags};
    use std::mem;
    use std::sync::Mutex;

    struct MockParent {
        info: DeviceInfo,
        ops: Mutex<Vec<BlockOp>>,
    }

    impl MockParent {
        fn new(block_count: u64) -> Arc<MockParent> {
            Arc::new(MockParent {
                info: DeviceInfo {
                    block_size: 512,
                    block_count,
                    max_transfer_size: 0,
                    flags: DeviceFlags::empty(),
                },
                ops: Mutex::new(Vec::new()),
            })
        }

        fn take_ops(&self) -> Vec<BlockOp> {
            mem::take(&mut *self.ops.lock().unwrap())
        }
    }

    impl BlockQueue for MockParent {
        fn query(&self) -> (DeviceInfo, usize) {
            (self.info, mem::size_of::<BlockOp>())
        }

        fn queue(&self, op: BlockOp) {
            self.ops.lock().unwrap().push(op);
        }
    }

    fn meta(first: u64, last: u64) -> PartitionMeta {
        PartitionMeta {
            type_guid: [0x11; GUID_LEN],
            instance_guid: [0x22; GUID_LEN],
            name: [0; NAME_LEN],
            first_lba: first,
            last_lba: last,
        }
    }

    fn read_op(offset_dev: u64, blocks: u16) -> (BlockOp, Arc<Mutex<Option<Status>>>) {
        let seen = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&seen);
        let vmo = Arc::new(crate::vmo::Vmo::create(1 << 20).unwrap());
        let op = BlockOp::rw(
            BlockCommand::Read,
            blocks - 1,
            offset_dev,
            0,
            IoFlags::empty(),
            vmo,
            Box::new(move |status| {
                *recorded.lock().unwrap() = Some(status);
            }),
        );
        (op, seen)
    }

    #[test]
    fn remaps_in_window_offsets() {
        let parent = MockParent::new(1000);
        let part = PartitionDevice::new(parent.clone(), &meta(100, 199)).unwrap();
        assert_eq!(part.query().0.block_count, 100);

        let (op, _seen) = read_op(10, 5);
        part.queue(op);
        let forwarded = parent.take_ops();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].offset_dev, 110);
    }

    #[test]
    fn rejects_out_of_window_requests() {
        let parent = MockParent::new(1000);
        let part = PartitionDevice::new(parent.clone(), &meta(100, 199)).unwrap();

        let (op, seen) = read_op(100, 1);
        part.queue(op);
        assert_eq!(*seen.lock().unwrap(), Some(Status::OutOfRange));

        let (op, seen) = read_op(96, 5);
        part.queue(op);
        assert_eq!(*seen.lock().unwrap(), Some(Status::OutOfRange));
        assert!(parent.take_ops().is_empty());

        // the last in-window block is still reachable
        let (op, _seen) = read_op(99, 1);
        part.queue(op);
        assert_eq!(parent.take_ops()[0].offset_dev, 199);
    }

    #[test]
    fn flush_passes_through_unmodified() {
        let parent = MockParent::new(1000);
        let part = PartitionDevice::new(parent.clone(), &meta(100, 199)).unwrap();
        part.queue(BlockOp::flush(Box::new(|_| {})));
        let forwarded = parent.take_ops();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].command, BlockCommand::Flush);
    }

    #[test]
    fn window_must_fit_the_parent() {
        let parent = MockParent::new(150);
        assert!(PartitionDevice::new(parent.clone(), &meta(100, 199)).is_err());
        assert!(PartitionDevice::new(parent.clone(), &meta(120, 100)).is_err());
        assert!(PartitionDevice::new(parent, &meta(100, 149)).is_ok());
    }

    #[test]
    fn guid_rendering() {
        let mut guid = [0u8; GUID_LEN];
        guid[..4].copy_from_slice(&0x0fc63daf_u32.to_le_bytes());
        guid[4..6].copy_from_slice(&0x8483_u16.to_le_bytes());
        guid[6..8].copy_from_slice(&0x4772_u16.to_le_bytes());
        guid[8..].copy_from_slice(&[0x8e, 0x79, 0x3d, 0x69, 0xd8, 0x47, 0x7d, 0xe4]);
        assert_eq!(
            guid_to_string(&guid),
            "0FC63DAF-8483-4772-8E79-3D69D8477DE4"
        );
    }

    #[test]
    fn utf16_name_decoding() {
        let mut raw = [0u8; NAME_LEN];
        for (i, unit) in "system".encode_utf16().enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(utf16_name_to_string(&raw), "system");
        assert_eq!(utf16_name_to_string(&[0; NAME_LEN]), "");
    }
}
