// ============================================================================
// src/pci.rs - PCI Configuration Space Boundary
// ============================================================================
//!
//! PCI configuration access consumed by the driver at its boundary.
//!
//! Bus enumeration proper is the host's job; this module only carries the
//! pieces the NVMe driver needs to attach to a function the host points it
//! at (or to find one itself on small systems): class-code matching,
//! command-register enables and BAR0 decoding. Config access is abstracted
//! behind [`ConfigSpace`] so it can be backed by port I/O, ECAM or a test
//! double.

use bitflags::bitflags;

/// NVMe controller class code (class, subclass, prog-if)
pub const NVME_CLASS_CODE: (u8, u8, u8) = (0x01, 0x08, 0x02);

/// PCI configuration register offsets
pub mod config_offsets {
    /// Vendor ID / Device ID
    pub const ID: u8 = 0x00;
    /// Command / Status
    pub const COMMAND: u8 = 0x04;
    /// Revision ID / Class Code
    pub const CLASS: u8 = 0x08;
    /// Header Type (byte 2 of the dword)
    pub const HEADER_TYPE: u8 = 0x0C;
    /// Base Address Register 0
    pub const BAR0: u8 = 0x10;
    /// Base Address Register 1
    pub const BAR1: u8 = 0x14;
}

bitflags! {
    /// PCI command register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandReg: u16 {
        /// I/O space enable
        const IO_SPACE = 1 << 0;
        /// Memory space enable
        const MEMORY_SPACE = 1 << 1;
        /// Bus master enable
        const BUS_MASTER = 1 << 2;
        /// Legacy interrupt disable
        const INTERRUPT_DISABLE = 1 << 10;
    }
}

/// PCIファンクションアドレス (bus, device, function)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// 新しいアドレスを作成
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{}",
            self.bus, self.device, self.function
        )
    }
}

/// PCI configuration space access.
///
/// Offsets are dword-aligned byte offsets into the function's 256-byte
/// configuration header.
pub trait ConfigSpace {
    /// 32ビット読み取り
    fn read32(&mut self, addr: PciAddress, offset: u8) -> u32;
    /// 32ビット書き込み
    fn write32(&mut self, addr: PciAddress, offset: u8, value: u32);

    /// 16ビット読み取り（32ビットアクセスから切り出し）
    fn read16(&mut self, addr: PciAddress, offset: u8) -> u16 {
        let dword = self.read32(addr, offset & 0xFC);
        (dword >> (((offset & 2) as u32) * 8)) as u16
    }
}

/// Find the first function matching a (class, subclass, prog-if) triple.
pub fn find_device<C: ConfigSpace + ?Sized>(
    cfg: &mut C,
    class: u8,
    subclass: u8,
    prog_if: u8,
) -> Option<PciAddress> {
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            let addr0 = PciAddress::new(bus, device, 0);
            if cfg.read32(addr0, config_offsets::ID) == 0xFFFF_FFFF {
                continue;
            }
            let header = cfg.read32(addr0, config_offsets::HEADER_TYPE);
            let multifunction = (header >> 16) & 0x80 != 0;
            let max_function = if multifunction { 8 } else { 1 };

            for function in 0..max_function {
                let addr = PciAddress::new(bus, device, function);
                if cfg.read32(addr, config_offsets::ID) == 0xFFFF_FFFF {
                    continue;
                }
                let class_reg = cfg.read32(addr, config_offsets::CLASS);
                let found_class = (class_reg >> 24) as u8;
                let found_subclass = (class_reg >> 16) as u8;
                let found_prog_if = (class_reg >> 8) as u8;
                if (found_class, found_subclass, found_prog_if) == (class, subclass, prog_if) {
                    return Some(addr);
                }
            }
        }
    }
    None
}

/// Enable memory-space decoding and bus mastering for a function.
pub fn enable_bus_master_and_memory<C: ConfigSpace + ?Sized>(cfg: &mut C, addr: PciAddress) {
    let dword = cfg.read32(addr, config_offsets::COMMAND);
    let mut command = CommandReg::from_bits_truncate(dword as u16);
    command.insert(CommandReg::MEMORY_SPACE | CommandReg::BUS_MASTER);
    let new_dword = (dword & 0xFFFF_0000) | command.bits() as u32;
    cfg.write32(addr, config_offsets::COMMAND, new_dword);
}

/// Decode a memory BAR and probe its size.
///
/// Returns `(address, size)`. The size probe writes all-ones to the BAR and
/// restores the original value, the usual PCI discovery sequence. I/O BARs
/// and unimplemented BARs yield `None`.
pub fn map_bar<C: ConfigSpace + ?Sized>(
    cfg: &mut C,
    addr: PciAddress,
    bar_index: u8,
) -> Option<(u64, u64)> {
    if bar_index > 5 {
        return None;
    }
    let bar_offset = config_offsets::BAR0 + bar_index * 4;
    let low = cfg.read32(addr, bar_offset);
    if low & 0x1 != 0 {
        // I/O space BAR
        return None;
    }
    let is_64bit = (low >> 1) & 0x3 == 0x2;
    if is_64bit && bar_index >= 5 {
        return None;
    }
    let high_offset = bar_offset + 4;

    let high = if is_64bit {
        cfg.read32(addr, high_offset)
    } else {
        0
    };
    let base = ((high as u64) << 32) | (low & 0xFFFF_FFF0) as u64;
    if base == 0 {
        return None;
    }

    // サイズ判定: all-onesを書いてマスクを読み、元の値を戻す
    cfg.write32(addr, bar_offset, 0xFFFF_FFFF);
    let size_low = cfg.read32(addr, bar_offset);
    cfg.write32(addr, bar_offset, low);

    let size_high = if is_64bit {
        cfg.write32(addr, high_offset, 0xFFFF_FFFF);
        let masked = cfg.read32(addr, high_offset);
        cfg.write32(addr, high_offset, high);
        masked
    } else {
        0xFFFF_FFFF
    };

    let mask = ((size_high as u64) << 32) | (size_low & 0xFFFF_FFF0) as u64;
    if mask == 0 {
        return None;
    }
    let size = (!mask).wrapping_add(1) & 0xFFFF_FFFF_FFFF_FFF0;
    Some((base, size))
}

/// Locate an NVMe controller, enable it on the bus and return its BAR0.
pub fn probe_nvme<C: ConfigSpace + ?Sized>(cfg: &mut C) -> Option<(PciAddress, u64, u64)> {
    let (class, subclass, prog_if) = NVME_CLASS_CODE;
    let addr = find_device(cfg, class, subclass, prog_if)?;
    enable_bus_master_and_memory(cfg, addr);
    let (base, size) = map_bar(cfg, addr, 0)?;
    log::info!("NVMe controller at {}: BAR0 {:#x} ({} KiB)", addr, base, size / 1024);
    Some((addr, base, size))
}

// ============================================================================
// Port I/O backend (x86_64)
// ============================================================================

#[cfg(target_arch = "x86_64")]
pub use port::PortConfigSpace;

#[cfg(target_arch = "x86_64")]
mod port {
    use super::{ConfigSpace, PciAddress};
    use x86_64::instructions::port::Port;

    /// PCI configuration address port
    const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
    /// PCI configuration data port
    const PCI_CONFIG_DATA: u16 = 0xCFC;

    /// Legacy port-I/O configuration mechanism (0xCF8/0xCFC).
    pub struct PortConfigSpace {
        address_port: Port<u32>,
        data_port: Port<u32>,
    }

    impl PortConfigSpace {
        /// Create the port-I/O accessor.
        ///
        /// # Safety
        /// The caller must be in ring 0 with exclusive ownership of the
        /// 0xCF8/0xCFC register pair.
        pub unsafe fn new() -> Self {
            Self {
                address_port: Port::new(PCI_CONFIG_ADDRESS),
                data_port: Port::new(PCI_CONFIG_DATA),
            }
        }

        fn make_address(addr: PciAddress, offset: u8) -> u32 {
            ((addr.bus as u32) << 16)
                | ((addr.device as u32) << 11)
                | ((addr.function as u32) << 8)
                | ((offset as u32) & 0xFC)
                | 0x8000_0000
        }
    }

    impl ConfigSpace for PortConfigSpace {
        fn read32(&mut self, addr: PciAddress, offset: u8) -> u32 {
            unsafe {
                self.address_port.write(Self::make_address(addr, offset));
                self.data_port.read()
            }
        }

        fn write32(&mut self, addr: PciAddress, offset: u8, value: u32) {
            unsafe {
                self.address_port.write(Self::make_address(addr, offset));
                self.data_port.write(value);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
