//! PZEM-004T energy meter driver (Modbus RTU)
//!
//! Reads the meter's 10 input registers in one transaction:
//!
//! | Reg | Contents              | Scaling            |
//! |-----|-----------------------|--------------------|
//! | 0   | voltage               | /10 V              |
//! | 1,2 | current (lo, hi)      | /1000 A            |
//! | 3,4 | power (lo, hi)        | /`power_scale` W   |
//! | 5,6 | energy (lo, hi)       | Wh                 |
//! | 7   | frequency             | /10 Hz             |
//! | 8   | power factor          | /100               |
//! | 9   | alarm status          | raw                |
//!
//! Request: `[slave, 0x04, 0x00, 0x00, 0x00, 0x0A, crc_lo, crc_hi]`.
//! Response: `[slave, 0x04, 0x14, <20 data bytes>, crc_lo, crc_hi]`.
//! CRC is CRC-16/Modbus (poly 0xA001, init 0xFFFF), little-endian on the
//! wire.

use super::MeterDriver;
use crate::config::MeterConfig;
use crate::error::{Error, Result};
use crate::transport::{SerialTransport, Transport};
use crate::types::Sample;
use std::time::{Duration, Instant};

/// Read Input Registers function code
const FC_READ_INPUT: u8 = 0x04;
/// Number of input registers in the measurement block
const REGISTER_COUNT: u16 = 10;
/// Response size: header (3) + data (20) + crc (2)
const RESPONSE_LEN: usize = 3 + REGISTER_COUNT as usize * 2 + 2;
/// Exception response size: slave, fc|0x80, code, crc
const EXCEPTION_LEN: usize = 5;

/// PZEM-004T meter over a byte transport
pub struct Pzem004t<T: Transport> {
    transport: T,
    slave_id: u8,
    timeout: Duration,
    power_scale: f64,
}

impl Pzem004t<SerialTransport> {
    /// Open the meter on its configured serial port
    ///
    /// Failure at this point is a configuration-time fault and aborts
    /// process start.
    pub fn open(config: &MeterConfig) -> Result<Self> {
        let transport = SerialTransport::open(&config.port, config.baud_rate)?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> Pzem004t<T> {
    /// Create a driver over an already-open transport
    pub fn new(transport: T, config: &MeterConfig) -> Self {
        Self {
            transport,
            slave_id: config.slave_id,
            timeout: Duration::from_millis(config.timeout_ms),
            power_scale: config.power_scale,
        }
    }

    /// Build the read-input-registers request frame
    fn build_request(&self) -> [u8; 8] {
        let mut frame = [
            self.slave_id,
            FC_READ_INPUT,
            0x00,
            0x00,
            (REGISTER_COUNT >> 8) as u8,
            (REGISTER_COUNT & 0xFF) as u8,
            0,
            0,
        ];
        let crc = crc16(&frame[..6]);
        frame[6] = (crc & 0xFF) as u8;
        frame[7] = (crc >> 8) as u8;
        frame
    }

    /// Accumulate bytes from the transport until `want` arrived or the
    /// response deadline passed
    fn read_until(&mut self, buf: &mut Vec<u8>, want: usize, deadline: Instant) -> Result<()> {
        let mut chunk = [0u8; 64];
        while buf.len() < want {
            if Instant::now() >= deadline {
                return Err(Error::MeterTimeout);
            }
            let n = self.transport.read(&mut chunk)?;
            if n == 0 {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Validate a complete response frame and extract the register block
    fn parse_response(&self, frame: &[u8]) -> Result<[u16; REGISTER_COUNT as usize]> {
        let (body, crc_bytes) = frame.split_at(frame.len() - 2);
        let expected = crc16(body);
        let actual = u16::from(crc_bytes[0]) | u16::from(crc_bytes[1]) << 8;
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        if body[0] != self.slave_id {
            return Err(Error::InvalidResponse(format!(
                "reply from slave {}, expected {}",
                body[0], self.slave_id
            )));
        }
        if body[2] as usize != REGISTER_COUNT as usize * 2 {
            return Err(Error::InvalidResponse(format!(
                "byte count {}, expected {}",
                body[2],
                REGISTER_COUNT * 2
            )));
        }
        let mut registers = [0u16; REGISTER_COUNT as usize];
        for (i, reg) in registers.iter_mut().enumerate() {
            let offset = 3 + i * 2;
            *reg = u16::from(body[offset]) << 8 | u16::from(body[offset + 1]);
        }
        Ok(registers)
    }

    /// Scale raw registers into engineering units
    fn to_sample(&self, r: &[u16; REGISTER_COUNT as usize]) -> Sample {
        let pair = |lo: u16, hi: u16| f64::from(u32::from(lo) | u32::from(hi) << 16);
        Sample {
            voltage: f64::from(r[0]) / 10.0,
            current: pair(r[1], r[2]) / 1000.0,
            power: pair(r[3], r[4]) / self.power_scale,
            energy_wh: pair(r[5], r[6]),
            frequency: f64::from(r[7]) / 10.0,
            power_factor: f64::from(r[8]) / 100.0,
            alarm: r[9],
        }
    }
}

impl<T: Transport> MeterDriver for Pzem004t<T> {
    fn read_sample(&mut self) -> Result<Sample> {
        let request = self.build_request();
        self.transport.write(&request)?;
        self.transport.flush()?;

        let deadline = Instant::now() + self.timeout;
        let mut frame = Vec::with_capacity(RESPONSE_LEN);

        // Enough to see the function code and spot an exception reply
        self.read_until(&mut frame, 2, deadline)?;
        if frame[1] == (FC_READ_INPUT | 0x80) {
            self.read_until(&mut frame, EXCEPTION_LEN, deadline)?;
            return Err(Error::InvalidResponse(format!(
                "modbus exception {:#04x}",
                frame[2]
            )));
        }
        self.read_until(&mut frame, RESPONSE_LEN, deadline)?;

        let registers = self.parse_response(&frame[..RESPONSE_LEN])?;
        Ok(self.to_sample(&registers))
    }
}

/// CRC-16/Modbus
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
