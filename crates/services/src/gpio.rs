//! GPIO character-device access.
//!
//! Uses the v1 `/dev/gpiochipN` ioctl interface. Chips are located by label;
//! lines are located by name. Handle requests are limited to 64 lines, so
//! whole-chip snapshots are read in batches.

use crate::ServicesError;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

const GPIOHANDLES_MAX: usize = 64;

const GPIOHANDLE_REQUEST_INPUT: u32 = 1 << 0;
const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;

const GPIO_GET_CHIPINFO_IOCTL: libc::c_ulong = 0x8044_B401;
const GPIO_GET_LINEINFO_IOCTL: libc::c_ulong = 0xC048_B402;
const GPIO_GET_LINEHANDLE_IOCTL: libc::c_ulong = 0xC16C_B403;
const GPIOHANDLE_GET_LINE_VALUES_IOCTL: libc::c_ulong = 0xC040_B408;
const GPIOHANDLE_SET_LINE_VALUES_IOCTL: libc::c_ulong = 0xC040_B409;

#[repr(C)]
struct GpiochipInfo {
    name: [u8; 32],
    label: [u8; 32],
    lines: u32,
}

#[repr(C)]
struct GpiolineInfo {
    line_offset: u32,
    flags: u32,
    name: [u8; 32],
    consumer: [u8; 32],
}

#[repr(C)]
struct GpiohandleRequest {
    lineoffsets: [u32; GPIOHANDLES_MAX],
    flags: u32,
    default_values: [u8; GPIOHANDLES_MAX],
    consumer_label: [u8; 32],
    lines: u32,
    fd: libc::c_int,
}

#[repr(C)]
struct GpiohandleData {
    values: [u8; GPIOHANDLES_MAX],
}

fn c_str(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

fn chip_error(chip_label: &str, description: impl ToString) -> ServicesError {
    ServicesError::GpioChip {
        chip_label: chip_label.to_string(),
        description: description.to_string(),
    }
}

fn line_error(line_name: &str, description: impl ToString) -> ServicesError {
    ServicesError::GpioLine {
        line_name: line_name.to_string(),
        description: description.to_string(),
    }
}

fn chip_info(file: &File) -> std::io::Result<GpiochipInfo> {
    let mut info = GpiochipInfo {
        name: [0; 32],
        label: [0; 32],
        lines: 0,
    };
    // SAFETY: valid descriptor, correctly sized gpiochip_info struct.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), GPIO_GET_CHIPINFO_IOCTL, &mut info) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(info)
}

fn open_chips() -> Vec<(File, GpiochipInfo)> {
    let mut chips = Vec::new();
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return chips;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("gpiochip") {
            continue;
        }
        let Ok(file) = OpenOptions::new().read(true).open(entry.path()) else {
            continue;
        };
        if let Ok(info) = chip_info(&file) {
            chips.push((file, info));
        }
    }
    chips
}

/// Requests a batch of lines and returns the handle descriptor.
fn request_lines(
    chip: &File,
    offsets: &[u32],
    flags: u32,
    default_values: Option<&[u8]>,
) -> std::io::Result<File> {
    let mut request = GpiohandleRequest {
        lineoffsets: [0; GPIOHANDLES_MAX],
        flags,
        default_values: [0; GPIOHANDLES_MAX],
        consumer_label: [0; 32],
        lines: offsets.len() as u32,
        fd: -1,
    };
    request.lineoffsets[..offsets.len()].copy_from_slice(offsets);
    if let Some(values) = default_values {
        request.default_values[..values.len()].copy_from_slice(values);
    }
    const LABEL: &[u8] = b"vrd";
    request.consumer_label[..LABEL.len()].copy_from_slice(LABEL);

    // SAFETY: valid descriptor, correctly sized gpiohandle_request struct.
    let rc = unsafe { libc::ioctl(chip.as_raw_fd(), GPIO_GET_LINEHANDLE_IOCTL, &mut request) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: the kernel returned ownership of a fresh descriptor.
    Ok(unsafe { File::from_raw_fd(request.fd as RawFd) })
}

fn read_handle_values(handle: &File, count: usize) -> std::io::Result<Vec<u8>> {
    let mut data = GpiohandleData {
        values: [0; GPIOHANDLES_MAX],
    };
    // SAFETY: valid descriptor, correctly sized gpiohandle_data struct.
    let rc = unsafe {
        libc::ioctl(
            handle.as_raw_fd(),
            GPIOHANDLE_GET_LINE_VALUES_IOCTL,
            &mut data,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(data.values[..count].to_vec())
}

/// Reads every line value of the chip with the given label.
pub fn read_chip_values(chip_label: &str) -> Result<Vec<u8>, ServicesError> {
    for (file, info) in open_chips() {
        if c_str(&info.label) != chip_label {
            continue;
        }
        let mut values = Vec::with_capacity(info.lines as usize);
        let offsets: Vec<u32> = (0..info.lines).collect();
        for batch in offsets.chunks(GPIOHANDLES_MAX) {
            let handle = request_lines(&file, batch, GPIOHANDLE_REQUEST_INPUT, None)
                .map_err(|e| chip_error(chip_label, e))?;
            values.extend(
                read_handle_values(&handle, batch.len()).map_err(|e| chip_error(chip_label, e))?,
            );
        }
        return Ok(values);
    }
    Err(chip_error(chip_label, "no GPIO chip with that label"))
}

fn find_line(line_name: &str) -> Result<(File, u32), ServicesError> {
    for (file, info) in open_chips() {
        for offset in 0..info.lines {
            let mut line = GpiolineInfo {
                line_offset: offset,
                flags: 0,
                name: [0; 32],
                consumer: [0; 32],
            };
            // SAFETY: valid descriptor, correctly sized gpioline_info struct.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), GPIO_GET_LINEINFO_IOCTL, &mut line) };
            if rc < 0 {
                continue;
            }
            if c_str(&line.name) == line_name {
                return Ok((file, offset));
            }
        }
    }
    Err(line_error(line_name, "no GPIO line with that name"))
}

/// Reads one named GPIO line.
pub fn read_line(line_name: &str) -> Result<u8, ServicesError> {
    let (chip, offset) = find_line(line_name)?;
    let handle = request_lines(&chip, &[offset], GPIOHANDLE_REQUEST_INPUT, None)
        .map_err(|e| line_error(line_name, e))?;
    let values = read_handle_values(&handle, 1).map_err(|e| line_error(line_name, e))?;
    Ok(values[0])
}

/// Drives one named GPIO line.
pub fn set_line(line_name: &str, value: u8) -> Result<(), ServicesError> {
    let (chip, offset) = find_line(line_name)?;
    let handle = request_lines(&chip, &[offset], GPIOHANDLE_REQUEST_OUTPUT, Some(&[value]))
        .map_err(|e| line_error(line_name, e))?;
    let mut data = GpiohandleData {
        values: [0; GPIOHANDLES_MAX],
    };
    data.values[0] = value;
    // SAFETY: valid descriptor, correctly sized gpiohandle_data struct.
    let rc = unsafe {
        libc::ioctl(
            handle.as_raw_fd(),
            GPIOHANDLE_SET_LINE_VALUES_IOCTL,
            &mut data,
        )
    };
    if rc < 0 {
        return Err(line_error(line_name, std::io::Error::last_os_error()));
    }
    Ok(())
}
