use crate::conn::Connection;
use ahash::RandomState;
use common::InterconnectError;
use protocol::Header;
use smol_str::format_smolstr;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Identity of a connection. Acknowledgements copy these fields from the
/// packet they answer, so both directions compute the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ConnKey {
    pub(crate) motion_node_id: i32,
    pub(crate) recv_slice_index: i32,
    pub(crate) send_slice_index: i32,
    pub(crate) src_content_id: i32,
    pub(crate) dst_content_id: i32,
    pub(crate) src_pid: i32,
    pub(crate) dst_pid: i32,
    pub(crate) instance_id: u32,
}

impl ConnKey {
    pub(crate) fn of(header: &Header) -> Self {
        Self {
            motion_node_id: header.motion_node_id,
            recv_slice_index: header.recv_slice_index,
            send_slice_index: header.send_slice_index,
            src_content_id: header.src_content_id,
            dst_content_id: header.dst_content_id,
            src_pid: header.src_pid,
            dst_pid: header.dst_pid,
            instance_id: header.instance_id,
        }
    }
}

// Equal keys share pids and content ids, so hashing a subset stays consistent with Eq.
impl Hash for ConnKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let bucket = ((self.src_pid ^ self.dst_pid) as u32).wrapping_add(self.dst_content_id as u32);
        state.write_u32(bucket);
    }
}

/// Process-wide table of live connection descriptors.
pub(crate) struct Registry {
    conns: HashMap<ConnKey, Connection, RandomState>,
}

impl Registry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            conns: HashMap::with_capacity_and_hasher(capacity, RandomState::new()),
        }
    }

    /// Table size for a cluster of `cluster_size` segments.
    pub(crate) fn default_capacity(cluster_size: usize, multiplier: usize, floor: usize) -> usize {
        cluster_size.saturating_mul(multiplier).max(floor)
    }

    /// Register a descriptor. Returns `false` when the key is already present;
    /// the existing descriptor is left untouched.
    pub(crate) fn insert(&mut self, conn: Connection) -> Result<bool, InterconnectError> {
        if self.conns.contains_key(&conn.key) {
            return Ok(false);
        }
        self.conns.try_reserve(1).map_err(|e| {
            InterconnectError::FailedTo("grow connection table".into(), format_smolstr!("{e}"))
        })?;
        self.conns.insert(conn.key, conn);
        Ok(true)
    }

    pub(crate) fn find_mut(&mut self, header: &Header) -> Option<&mut Connection> {
        self.conns.get_mut(&ConnKey::of(header))
    }

    pub(crate) fn get(&self, key: &ConnKey) -> Option<&Connection> {
        self.conns.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &ConnKey) -> Option<&mut Connection> {
        self.conns.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: &ConnKey) -> Option<Connection> {
        self.conns.remove(key)
    }

    /// Rehash into room for at least `capacity` entries; live entries are kept.
    pub(crate) fn resize(&mut self, capacity: usize) {
        if capacity > self.conns.capacity() {
            self.conns.reserve(capacity - self.conns.len());
        } else {
            self.conns.shrink_to(capacity);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.conns.capacity()
    }
}
