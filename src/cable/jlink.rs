//! Implement the `Cable` trait for "jlink" compatible hardware adapters.  The J-Link has no raw pin
//! access, so each TCK cycle is sent as a one-bit JTAG sequence carrying the current TMS and TDI
//! levels, and the returned bit becomes the sampled TDO.
use alloc::string::ToString;
use alloc::vec;
use alloc::vec::Vec;

use std::time::Duration;

use log::debug;
use rusb::constants::*;
use rusb::{DeviceHandle, Direction, GlobalContext};

use crate::cable::{Cable, Signal};
use crate::error::LinkError;

const CMD_SET_SPEED: u8 = 0x05;
const CMD_GET_STATE: u8 = 0x07;
const CMD_SELECT_IF: u8 = 0xc7;
const CMD_HW_JTAG2: u8 = 0xcd;
const CMD_RESET_ASSERT: u8 = 0xdc;
const CMD_RESET_RELEASE: u8 = 0xdd;
const CMD_TRST_ASSERT: u8 = 0xde;
const CMD_TRST_RELEASE: u8 = 0xdf;

pub struct JLink {
    device: DeviceHandle<GlobalContext>,
    // queued bytes to send
    buffer: Vec<u8>,
    // number of bytes we'll receive after sending the above
    recv_bytes: usize,
    read_endpoint: u8,
    write_endpoint: u8,
    tms: bool,
    tdi: bool,
    tck: bool,
    tdo: bool,
}

impl JLink {
    pub fn new() -> Result<Self, LinkError> {
        let device =
            rusb::open_device_with_vid_pid(0x1366, 0x0105).ok_or(LinkError::AdapterNotFound)?;
        let descriptor = device.device().active_config_descriptor()?;
        for i in descriptor.interfaces() {
            for d in i.descriptors() {
                if d.class_code() != LIBUSB_CLASS_VENDOR_SPEC
                    || d.sub_class_code() != LIBUSB_CLASS_VENDOR_SPEC
                    || d.num_endpoints() < 2
                {
                    continue;
                }

                let mut read_endpoint = None;
                let mut write_endpoint = None;
                for e in d.endpoint_descriptors() {
                    match e.direction() {
                        Direction::In => read_endpoint = Some(e.address()),
                        Direction::Out => write_endpoint = Some(e.address()),
                    }
                }

                let (Some(read_endpoint), Some(write_endpoint)) = (read_endpoint, write_endpoint)
                else {
                    continue;
                };

                device.claim_interface(d.interface_number()).map_err(|e| match e {
                    rusb::Error::Busy | rusb::Error::Access => LinkError::AdapterBusy,
                    other => LinkError::Usb(other),
                })?;

                let mut buf = [0; 2];
                let _ = device.read_bulk(read_endpoint, &mut buf, Duration::from_millis(10));

                let mut jlink = Self {
                    device,
                    buffer: vec![],
                    recv_bytes: 0,
                    read_endpoint,
                    write_endpoint,
                    tms: true,
                    tdi: false,
                    tck: true,
                    tdo: false,
                };

                jlink.check_vref()?;
                jlink.set_clock(1_000_000);
                jlink.set_interface(0)?;
                jlink.send_command(CMD_TRST_RELEASE, vec![]);
                jlink.send_command(CMD_RESET_RELEASE, vec![]);
                debug!("J-Link opened");

                return Ok(jlink);
            }
        }
        Err(LinkError::AdapterNotFound)
    }

    fn send_command(&mut self, cmd: u8, mut data: Vec<u8>) {
        data.insert(0, cmd);
        self.buffer.append(&mut data);
    }

    fn read_data(&mut self, len: usize) -> Result<Vec<u8>, LinkError> {
        // Submit any pending writes
        let wr = self.device.write_bulk(self.write_endpoint, &self.buffer, Duration::from_millis(100))?;
        if wr != self.buffer.len() {
            return Err(LinkError::Transfer("short write to J-Link".to_string()));
        }
        self.buffer.clear();

        let mut recv_bytes = len + self.recv_bytes;
        let mut data = vec![];

        while recv_bytes > 0 {
            let mut buffer = vec![0; recv_bytes];
            let len = self.device.read_bulk(self.read_endpoint, &mut buffer, Duration::from_millis(100))?;
            buffer.resize(len, 0);
            data.append(&mut buffer);
            recv_bytes -= len;
        }

        // Don't return any of the data from the pending write that we didn't care about
        let data = data.split_off(self.recv_bytes);
        self.recv_bytes = 0;
        Ok(data)
    }

    fn check_vref(&mut self) -> Result<(), LinkError> {
        self.send_command(CMD_GET_STATE, vec![]);
        let data = self.read_data(8)?;

        let vref = u16::from_le_bytes([data[0], data[1]]);
        if vref < 1500 {
            return Err(LinkError::Transfer("target voltage too low, unpowered or disconnected?".to_string()));
        }
        Ok(())
    }

    fn set_clock(&mut self, mut clock: u32) {
        clock /= 1000;
        let buf = vec![(clock & 0xff) as u8, ((clock >> 8) & 0xff) as u8];
        self.send_command(CMD_SET_SPEED, buf);
    }

    fn set_interface(&mut self, intf: u8) -> Result<(), LinkError> {
        let buf = vec![intf];
        self.send_command(CMD_SELECT_IF, buf);
        self.read_data(4)?;
        Ok(())
    }

    // Queue `bits` TCK cycles; TMS and TDI are taken LSB first from the two buffers.
    fn tap_sequence(&mut self, mut tms: Vec<u8>, mut tdi: Vec<u8>, bits: usize) {
        let mut cmdbuf = vec![(bits & 0xff) as u8, ((bits >> 8) & 0xff) as u8];
        cmdbuf.append(&mut tms);
        cmdbuf.append(&mut tdi);

        self.send_command(CMD_HW_JTAG2, cmdbuf);
    }
}

impl Cable for JLink {
    fn set_signal(&mut self, signal: Signal, high: bool) -> Result<(), LinkError> {
        match signal {
            Signal::Tms => self.tms = high,
            Signal::Tdi => self.tdi = high,
            Signal::Tck => {
                let rising = high && !self.tck;
                self.tck = high;
                if rising {
                    let (tms, tdi) = (self.tms, self.tdi);
                    self.tdo = self.clock_read(tms, tdi)?;
                }
            }
            Signal::Reset => {
                let cmd = if high { CMD_RESET_RELEASE } else { CMD_RESET_ASSERT };
                self.send_command(cmd, vec![]);
                self.read_data(0)?;
            }
            Signal::Trst => {
                let cmd = if high { CMD_TRST_RELEASE } else { CMD_TRST_ASSERT };
                self.send_command(cmd, vec![]);
                self.read_data(0)?;
            }
        }
        Ok(())
    }

    fn read_tdo(&mut self) -> Result<bool, LinkError> {
        Ok(self.tdo)
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> Result<(), LinkError> {
        self.clock_read(tms, tdi)?;
        Ok(())
    }

    fn clock_read(&mut self, tms: bool, tdi: bool) -> Result<bool, LinkError> {
        self.tms = tms;
        self.tdi = tdi;
        self.tck = true;
        self.tap_sequence(vec![tms as u8], vec![tdi as u8], 1);
        let data = self.read_data(1)?;
        self.tdo = data.first().is_some_and(|b| b & 1 != 0);
        Ok(self.tdo)
    }

    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), LinkError> {
        let mut buf = vec![];
        let mut byte = 0u8;
        for (i, x) in tms.iter().enumerate() {
            if *x {
                byte |= 1 << (i % 8);
            }
            if i % 8 == 7 {
                buf.push(byte);
                byte = 0;
            }
        }

        // Push the last byte for cases when we don't have a multiple of 8
        // transitions.
        if tms.len() % 8 != 0 {
            buf.push(byte);
        }

        let tdi_bytes = if tdi {
            vec![0xff; buf.len()]
        } else {
            vec![0; buf.len()]
        };

        let bytes = tdi_bytes.len();
        self.tap_sequence(buf, tdi_bytes, tms.len());
        // We don't care about the returned bytes, so read them whenever we do the next read
        self.recv_bytes += bytes;
        if let Some(&last) = tms.last() {
            self.tms = last;
        }
        self.tdi = tdi;
        self.tck = true;
        Ok(())
    }
}
