//! Address-to-variable binding tables.
//!
//! Four independently-addressed banks: coils and holding registers are
//! remotely writable, discrete inputs and input registers only ever change
//! locally. The map stores handles into the [`VarArena`], not values; the
//! same address may be bound in several banks.
//!
//! Writable banks remember which node last wrote each address so the
//! failsafe can zero exactly the state a vanished peer was driving.

use std::collections::{BTreeMap, HashMap};

use crate::vars::{BitHandle, RegHandle, VarArena};

#[derive(Debug, Default)]
pub struct DataMap {
    coils: BTreeMap<u16, BitHandle>,
    discretes: BTreeMap<u16, BitHandle>,
    hregs: BTreeMap<u16, RegHandle>,
    iregs: BTreeMap<u16, RegHandle>,

    coil_writers: HashMap<u16, u8>,
    hreg_writers: HashMap<u16, u8>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    // Bindings take single-slot handles; arrays bind one address per slot
    // via `Handle::slot`.

    pub fn bind_coil(&mut self, address: u16, handle: BitHandle) -> bool {
        if handle.len() != 1 {
            return false;
        }
        self.coils.insert(address, handle);
        true
    }

    pub fn bind_ists(&mut self, address: u16, handle: BitHandle) -> bool {
        if handle.len() != 1 {
            return false;
        }
        self.discretes.insert(address, handle);
        true
    }

    pub fn bind_hreg(&mut self, address: u16, handle: RegHandle) -> bool {
        if handle.len() != 1 {
            return false;
        }
        self.hregs.insert(address, handle);
        true
    }

    pub fn bind_ireg(&mut self, address: u16, handle: RegHandle) -> bool {
        if handle.len() != 1 {
            return false;
        }
        self.iregs.insert(address, handle);
        true
    }

    pub fn has_coil(&self, address: u16) -> bool {
        self.coils.contains_key(&address)
    }

    pub fn has_ists(&self, address: u16) -> bool {
        self.discretes.contains_key(&address)
    }

    pub fn has_hreg(&self, address: u16) -> bool {
        self.hregs.contains_key(&address)
    }

    pub fn has_ireg(&self, address: u16) -> bool {
        self.iregs.contains_key(&address)
    }

    pub fn get_coil(&self, arena: &VarArena, address: u16) -> Option<bool> {
        self.coils.get(&address).map(|&h| arena.bit(h))
    }

    pub fn get_ists(&self, arena: &VarArena, address: u16) -> Option<bool> {
        self.discretes.get(&address).map(|&h| arena.bit(h))
    }

    pub fn get_hreg(&self, arena: &VarArena, address: u16) -> Option<i16> {
        self.hregs.get(&address).map(|&h| arena.reg(h))
    }

    pub fn get_ireg(&self, arena: &VarArena, address: u16) -> Option<i16> {
        self.iregs.get(&address).map(|&h| arena.reg(h))
    }

    /// Write a coil; `src != 0` marks that node as the last writer.
    pub fn set_coil(&mut self, arena: &mut VarArena, address: u16, value: bool, src: u8) -> bool {
        match self.coils.get(&address) {
            Some(&handle) => {
                arena.set_bit(handle, value);
                if src != 0 {
                    self.coil_writers.insert(address, src);
                }
                true
            }
            None => false,
        }
    }

    pub fn set_ists(&mut self, arena: &mut VarArena, address: u16, value: bool) -> bool {
        match self.discretes.get(&address) {
            Some(&handle) => {
                arena.set_bit(handle, value);
                true
            }
            None => false,
        }
    }

    /// Write a holding register; `src != 0` marks that node as the last writer.
    pub fn set_hreg(&mut self, arena: &mut VarArena, address: u16, value: i16, src: u8) -> bool {
        match self.hregs.get(&address) {
            Some(&handle) => {
                arena.set_reg(handle, value);
                if src != 0 {
                    self.hreg_writers.insert(address, src);
                }
                true
            }
            None => false,
        }
    }

    pub fn set_ireg(&mut self, arena: &mut VarArena, address: u16, value: i16) -> bool {
        match self.iregs.get(&address) {
            Some(&handle) => {
                arena.set_reg(handle, value);
                true
            }
            None => false,
        }
    }

    pub fn remove_coil(&mut self, address: u16) -> bool {
        self.coil_writers.remove(&address);
        self.coils.remove(&address).is_some()
    }

    pub fn remove_ists(&mut self, address: u16) -> bool {
        self.discretes.remove(&address).is_some()
    }

    pub fn remove_hreg(&mut self, address: u16) -> bool {
        self.hreg_writers.remove(&address);
        self.hregs.remove(&address).is_some()
    }

    pub fn remove_ireg(&mut self, address: u16) -> bool {
        self.iregs.remove(&address).is_some()
    }

    pub fn coil_writer(&self, address: u16) -> Option<u8> {
        self.coil_writers.get(&address).copied()
    }

    pub fn hreg_writer(&self, address: u16) -> Option<u8> {
        self.hreg_writers.get(&address).copied()
    }

    /// Zero every writable entry last written by `node` and forget the marks.
    pub fn clear_registers_for_node(&mut self, arena: &mut VarArena, node: u8) {
        let coil_addrs: Vec<u16> = self
            .coil_writers
            .iter()
            .filter(|&(_, &writer)| writer == node)
            .map(|(&addr, _)| addr)
            .collect();
        for addr in coil_addrs {
            if let Some(&handle) = self.coils.get(&addr) {
                arena.set_bit(handle, false);
            }
            self.coil_writers.remove(&addr);
        }

        let hreg_addrs: Vec<u16> = self
            .hreg_writers
            .iter()
            .filter(|&(_, &writer)| writer == node)
            .map(|(&addr, _)| addr)
            .collect();
        for addr in hreg_addrs {
            if let Some(&handle) = self.hregs.get(&addr) {
                arena.set_reg(handle, 0);
            }
            self.hreg_writers.remove(&addr);
        }
    }

    /// Zero every writable bound entry regardless of writer.
    pub fn clear_all_linked(&mut self, arena: &mut VarArena) {
        for &handle in self.coils.values() {
            arena.set_bit(handle, false);
        }
        for &handle in self.hregs.values() {
            arena.set_reg(handle, 0);
        }
        self.coil_writers.clear();
        self.hreg_writers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_map() -> (DataMap, VarArena, RegHandle, BitHandle) {
        let mut arena = VarArena::new();
        let mut map = DataMap::new();
        let regs = arena.alloc_regs(2);
        let bits = arena.alloc_bits(2);
        assert!(map.bind_hreg(10, regs.slot(0).unwrap()));
        assert!(map.bind_hreg(11, regs.slot(1).unwrap()));
        assert!(map.bind_coil(0, bits.slot(0).unwrap()));
        assert!(map.bind_coil(1, bits.slot(1).unwrap()));
        (map, arena, regs, bits)
    }

    #[test]
    fn banks_are_independent_address_spaces() {
        let mut arena = VarArena::new();
        let mut map = DataMap::new();
        let reg = arena.alloc_regs(1);
        let bit = arena.alloc_bits(1);
        assert!(map.bind_hreg(5, reg));
        assert!(map.bind_coil(5, bit));

        assert!(map.set_hreg(&mut arena, 5, -7, 0));
        assert!(map.set_coil(&mut arena, 5, true, 0));
        assert_eq!(map.get_hreg(&arena, 5), Some(-7));
        assert_eq!(map.get_coil(&arena, 5), Some(true));
    }

    #[test]
    fn multi_slot_handles_are_rejected() {
        let mut arena = VarArena::new();
        let mut map = DataMap::new();
        let regs = arena.alloc_regs(2);
        assert!(!map.bind_hreg(0, regs));
    }

    #[test]
    fn last_writer_tracking() {
        let (mut map, mut arena, ..) = bound_map();

        assert!(map.set_hreg(&mut arena, 10, 1234, 1));
        assert_eq!(map.hreg_writer(10), Some(1));

        // Local writes (src 0) leave the mark untouched
        assert!(map.set_hreg(&mut arena, 10, 99, 0));
        assert_eq!(map.hreg_writer(10), Some(1));
    }

    #[test]
    fn clear_registers_for_node_zeroes_only_that_writer() {
        let (mut map, mut arena, ..) = bound_map();

        map.set_hreg(&mut arena, 10, 1234, 1);
        map.set_hreg(&mut arena, 11, 55, 2);
        map.set_coil(&mut arena, 0, true, 1);
        map.set_coil(&mut arena, 1, true, 2);

        map.clear_registers_for_node(&mut arena, 1);

        assert_eq!(map.get_hreg(&arena, 10), Some(0));
        assert_eq!(map.get_hreg(&arena, 11), Some(55));
        assert_eq!(map.get_coil(&arena, 0), Some(false));
        assert_eq!(map.get_coil(&arena, 1), Some(true));
        assert_eq!(map.hreg_writer(10), None);
        assert_eq!(map.hreg_writer(11), Some(2));
    }

    #[test]
    fn clear_all_linked() {
        let (mut map, mut arena, ..) = bound_map();
        map.set_hreg(&mut arena, 10, 5, 3);
        map.set_coil(&mut arena, 1, true, 3);

        map.clear_all_linked(&mut arena);
        assert_eq!(map.get_hreg(&arena, 10), Some(0));
        assert_eq!(map.get_coil(&arena, 1), Some(false));
        assert_eq!(map.hreg_writer(10), None);
    }

    #[test]
    fn unbound_addresses() {
        let (mut map, mut arena, ..) = bound_map();
        assert_eq!(map.get_hreg(&arena, 99), None);
        assert!(!map.set_hreg(&mut arena, 99, 1, 0));
        assert!(!map.remove_hreg(99));
        assert!(map.remove_hreg(10));
        assert!(!map.has_hreg(10));
    }
}
