//! Region-id table mapping small integer ids to attached memory regions.

use std::sync::Arc;

use fnv::FnvHashMap;

use interface::{RegionId, Status, REGION_ID_INVALID};

use super::Error;
use crate::vmo::Vmo;

/// An attached region. Sub-messages keep the buffer alive through their own
/// `Arc`, so detaching its id mid-flight is safe.
#[derive(Debug)]
pub struct IoBuffer {
    vmo: Arc<Vmo>,
}

impl IoBuffer {
    fn new(vmo: Arc<Vmo>) -> IoBuffer {
        IoBuffer { vmo }
    }

    pub fn vmo(&self) -> &Arc<Vmo> {
        &self.vmo
    }

    /// The region's current size must cover the transfer. Regions may grow
    /// after attach, so the size is queried here, not cached.
    pub(crate) fn validate(&self, length: u64, vmo_offset: u64) -> Result<(), Status> {
        let size = self.vmo.size().map_err(|_| Status::Io)?;
        match vmo_offset.checked_add(length) {
            Some(end) if end <= size => Ok(()),
            _ => Err(Status::InvalidArgs),
        }
    }
}

/// Caller holds the server lock for every operation here.
pub(crate) struct VmoRegistry {
    /// Hint cursor: the id after the most recent allocation.
    last_id: RegionId,
    table: FnvHashMap<RegionId, Arc<IoBuffer>>,
}

impl VmoRegistry {
    pub(crate) fn new() -> VmoRegistry {
        VmoRegistry {
            last_id: REGION_ID_INVALID + 1,
            table: FnvHashMap::default(),
        }
    }

    fn find_free_id(&mut self) -> Result<RegionId, Error> {
        for id in self.last_id..RegionId::MAX {
            if !self.table.contains_key(&id) {
                self.last_id = id + 1;
                return Ok(id);
            }
        }
        for id in (REGION_ID_INVALID + 1)..self.last_id {
            if !self.table.contains_key(&id) {
                self.last_id = id + 1;
                return Ok(id);
            }
        }
        Err(Error::NoRegionIds)
    }

    pub(crate) fn attach(&mut self, vmo: Arc<Vmo>) -> Result<RegionId, Error> {
        let id = self.find_free_id()?;
        self.table.insert(id, Arc::new(IoBuffer::new(vmo)));
        Ok(id)
    }

    pub(crate) fn find(&self, id: RegionId) -> Option<Arc<IoBuffer>> {
        self.table.get(&id).cloned()
    }

    pub(crate) fn detach(&mut self, id: RegionId) -> bool {
        self.table.remove(&id).is_some()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.len()
    }
}
