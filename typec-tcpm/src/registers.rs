//! Register access to port controllers on a shared I2C bus.
//!
//! Each access is a single bus transaction, taken under the bus mutex.
//! Ports on the same bus therefore interleave their traffic transaction by transaction.
use byteorder::{ByteOrder, LittleEndian};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embedded_hal_async::i2c::I2c;
use heapless::Vec;

use crate::Error;

/// Largest block that can be written in one transaction, including the register address.
/// Fits a full message burst into a transmit FIFO, with its framing tokens.
const MAX_BLOCK_WRITE: usize = 48;

/// Registers of one port controller, addressed on a shared bus.
pub struct RegisterBus<'a, M: RawMutex, BUS> {
    bus: &'a Mutex<M, BUS>,
    address: u8,
}

impl<'a, M: RawMutex, BUS: I2c> RegisterBus<'a, M, BUS> {
    /// Create register access for the device at the 7 bit `address`.
    pub fn new(bus: &'a Mutex<M, BUS>, address: u8) -> Self {
        Self { bus, address }
    }

    /// The device address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Take the bus for a burst of transactions that must not be interleaved with other devices.
    pub async fn lock(&self) -> LockedRegisters<'_, M, BUS> {
        LockedRegisters {
            bus: self.bus.lock().await,
            address: self.address,
        }
    }

    /// Read an 8 bit register.
    pub async fn read8(&self, reg: u8) -> Result<u8, Error> {
        self.lock().await.read8(reg).await
    }

    /// Write an 8 bit register.
    pub async fn write8(&self, reg: u8, value: u8) -> Result<(), Error> {
        self.lock().await.write8(reg, value).await
    }

    /// Read a 16 bit little-endian register.
    pub async fn read16(&self, reg: u8) -> Result<u16, Error> {
        self.lock().await.read16(reg).await
    }

    /// Write a 16 bit little-endian register.
    pub async fn write16(&self, reg: u8, value: u16) -> Result<(), Error> {
        self.lock().await.write16(reg, value).await
    }

    /// Read consecutive bytes starting at `reg`.
    pub async fn read_block(&self, reg: u8, buffer: &mut [u8]) -> Result<(), Error> {
        self.lock().await.read_block(reg, buffer).await
    }

    /// Write consecutive bytes starting at `reg`.
    pub async fn write_block(&self, reg: u8, data: &[u8]) -> Result<(), Error> {
        self.lock().await.write_block(reg, data).await
    }

    /// Read-modify-write an 8 bit register, without another device's traffic in between.
    pub async fn update8(&self, reg: u8, f: impl FnOnce(u8) -> u8) -> Result<(), Error> {
        let mut locked = self.lock().await;
        let value = locked.read8(reg).await?;
        locked.write8(reg, f(value)).await
    }
}

/// Register access while holding the bus.
pub struct LockedRegisters<'a, M: RawMutex, BUS> {
    bus: MutexGuard<'a, M, BUS>,
    address: u8,
}

impl<M: RawMutex, BUS: I2c> LockedRegisters<'_, M, BUS> {
    /// Read an 8 bit register.
    pub async fn read8(&mut self, reg: u8) -> Result<u8, Error> {
        let mut value = [0u8; 1];
        self.read_block(reg, &mut value).await?;
        Ok(value[0])
    }

    /// Write an 8 bit register.
    pub async fn write8(&mut self, reg: u8, value: u8) -> Result<(), Error> {
        self.write_block(reg, &[value]).await
    }

    /// Read a 16 bit little-endian register.
    pub async fn read16(&mut self, reg: u8) -> Result<u16, Error> {
        let mut value = [0u8; 2];
        self.read_block(reg, &mut value).await?;
        Ok(LittleEndian::read_u16(&value))
    }

    /// Write a 16 bit little-endian register.
    pub async fn write16(&mut self, reg: u8, value: u16) -> Result<(), Error> {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.write_block(reg, &bytes).await
    }

    /// Read consecutive bytes starting at `reg`.
    pub async fn read_block(&mut self, reg: u8, buffer: &mut [u8]) -> Result<(), Error> {
        self.bus.write_read(self.address, &[reg], buffer).await.map_err(|_| {
            warn!("Read of register {:#x} at {:#x} failed", reg, self.address);
            Error::Bus
        })
    }

    /// Write consecutive bytes starting at `reg`.
    pub async fn write_block(&mut self, reg: u8, data: &[u8]) -> Result<(), Error> {
        let mut buffer: Vec<u8, MAX_BLOCK_WRITE> = Vec::new();
        buffer.push(reg).map_err(|_| Error::FrameTooLong)?;
        buffer.extend_from_slice(data).map_err(|_| Error::FrameTooLong)?;

        self.bus.write(self.address, &buffer).await.map_err(|_| {
            warn!("Write of register {:#x} at {:#x} failed", reg, self.address);
            Error::Bus
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory register file that stands in for a port controller on the bus.
    use std::collections::{HashMap, VecDeque};
    use std::vec::Vec;

    use embedded_hal_async::i2c::{ErrorKind, ErrorType, I2c, Operation};

    /// Register file of one device. Reads of `fifo` registers pop queued bytes.
    #[derive(Default)]
    pub struct FakeRegisters {
        pub registers: HashMap<u8, u8>,
        pub fifos: HashMap<u8, VecDeque<u8>>,
        /// Every write, as (register, bytes).
        pub writes: Vec<(u8, Vec<u8>)>,
        /// Reads of these registers fail.
        pub failing: Vec<u8>,
    }

    impl FakeRegisters {
        pub fn set(&mut self, reg: u8, value: u8) {
            self.registers.insert(reg, value);
        }

        pub fn set16(&mut self, reg: u8, value: u16) {
            self.registers.insert(reg, value as u8);
            self.registers.insert(reg + 1, (value >> 8) as u8);
        }

        pub fn get(&self, reg: u8) -> u8 {
            self.registers.get(&reg).copied().unwrap_or(0)
        }

        pub fn queue_fifo(&mut self, reg: u8, bytes: &[u8]) {
            self.fifos.entry(reg).or_default().extend(bytes.iter().copied());
        }

        /// All bytes written to `reg`, in order.
        pub fn written(&self, reg: u8) -> Vec<Vec<u8>> {
            self.writes
                .iter()
                .filter(|(r, _)| *r == reg)
                .map(|(_, bytes)| bytes.clone())
                .collect()
        }
    }

    /// A bus with a single device at `address`.
    pub struct FakeBus {
        pub address: u8,
        pub device: FakeRegisters,
    }

    impl FakeBus {
        pub fn new(address: u8) -> Self {
            Self {
                address,
                device: FakeRegisters::default(),
            }
        }
    }

    impl ErrorType for FakeBus {
        type Error = ErrorKind;
    }

    impl I2c for FakeBus {
        async fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
            if address != self.address {
                return Err(ErrorKind::Other);
            }

            let mut pointer = None;
            for operation in operations {
                match operation {
                    Operation::Write(bytes) => {
                        let Some((reg, data)) = bytes.split_first() else {
                            continue;
                        };
                        pointer = Some(*reg);
                        if !data.is_empty() {
                            self.device.writes.push((*reg, data.to_vec()));
                            if !self.device.fifos.contains_key(reg) {
                                for (offset, value) in data.iter().enumerate() {
                                    self.device.registers.insert(reg + offset as u8, *value);
                                }
                            }
                        }
                    }
                    Operation::Read(buffer) => {
                        let reg = pointer.ok_or(ErrorKind::Other)?;
                        if self.device.failing.contains(&reg) {
                            return Err(ErrorKind::Other);
                        }
                        if let Some(fifo) = self.device.fifos.get_mut(&reg) {
                            for byte in buffer.iter_mut() {
                                *byte = fifo.pop_front().unwrap_or(0);
                            }
                        } else {
                            for (offset, byte) in buffer.iter_mut().enumerate() {
                                *byte = self.device.get(reg + offset as u8);
                            }
                        }
                    }
                }
            }

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::mutex::Mutex;

    use super::RegisterBus;
    use super::testing::FakeBus;

    #[tokio::test]
    async fn little_endian_access() {
        let bus: Mutex<NoopRawMutex, _> = Mutex::new(FakeBus::new(0x50));
        let regs = RegisterBus::new(&bus, 0x50);

        regs.write16(0x10, 0x1234).await.unwrap();
        assert_eq!(regs.read8(0x10).await.unwrap(), 0x34);
        assert_eq!(regs.read8(0x11).await.unwrap(), 0x12);
        assert_eq!(regs.read16(0x10).await.unwrap(), 0x1234);

        regs.update8(0x11, |value| value | 0x80).await.unwrap();
        assert_eq!(regs.read16(0x10).await.unwrap(), 0x9234);
    }

    #[tokio::test]
    async fn wrong_address_is_bus_error() {
        let bus: Mutex<NoopRawMutex, _> = Mutex::new(FakeBus::new(0x50));
        let regs = RegisterBus::new(&bus, 0x22);

        assert_eq!(regs.read8(0x10).await, Err(crate::Error::Bus));
    }
}
