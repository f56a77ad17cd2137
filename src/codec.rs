/*!
 # Command codec

 Pure encoding of RGBW command frames and the text form used to carry
 characteristic payloads over the transport.

 A color frame is five bytes: the `SET_COLOR` opcode followed by the red,
 green, blue and white channels. There is no length prefix, checksum or
 terminator.
*/

use data_encoding::BASE64;

use crate::{Error, Result};

/// Length of an encoded color frame
pub const COLOR_FRAME_LEN: usize = 5;

/// Command opcodes understood by the light firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Set the RGBW output
    SetColor = 0x01,
    /// Set the color through the firmware's OS-level path
    SetColorOs = 0x02,
    /// Turn the BLE radio off on the peripheral
    DisableBle = 0x03,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Opcode::SetColor),
            0x02 => Ok(Opcode::SetColorOs),
            0x03 => Ok(Opcode::DisableBle),
            other => Err(Error::InvalidFrame(format!("unknown opcode {other:#04x}"))),
        }
    }
}

/// Four channel RGBW value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RgbwCommand {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
}

impl RgbwCommand {
    pub const fn new(red: u8, green: u8, blue: u8, white: u8) -> Self {
        Self {
            red,
            green,
            blue,
            white,
        }
    }

    /// Builds a command from unchecked channel values, rejecting anything
    /// outside `0..=255`.
    pub fn from_channels(red: i64, green: i64, blue: i64, white: i64) -> Result<Self> {
        Ok(Self::new(
            channel(red)?,
            channel(green)?,
            channel(blue)?,
            channel(white)?,
        ))
    }

    /// Encodes the command as a `SET_COLOR` frame
    pub fn encode(&self) -> [u8; COLOR_FRAME_LEN] {
        [
            Opcode::SetColor as u8,
            self.red,
            self.green,
            self.blue,
            self.white,
        ]
    }

    /// Replaces the red, green and blue channels, keeping white
    pub fn with_rgb(self, rgb: Rgb) -> Self {
        Self {
            red: rgb.red,
            green: rgb.green,
            blue: rgb.blue,
            ..self
        }
    }

    pub fn with_white(self, white: u8) -> Self {
        Self { white, ..self }
    }

    /// `#RRGGBB` rendering of the color channels
    pub fn hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.red, self.green, self.blue)
    }
}

/// Three channel color parsed from a hex string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

fn channel(value: i64) -> Result<u8> {
    u8::try_from(value).map_err(|_| Error::ValueOutOfRange(value, 0, 255))
}

/// Encodes a color frame from unchecked channel values
pub fn encode_color_command(
    red: i64,
    green: i64,
    blue: i64,
    white: i64,
) -> Result<[u8; COLOR_FRAME_LEN]> {
    Ok(RgbwCommand::from_channels(red, green, blue, white)?.encode())
}

/// Decodes a `SET_COLOR` frame back into its channels
pub fn decode_color_command(frame: &[u8]) -> Result<RgbwCommand> {
    if frame.len() != COLOR_FRAME_LEN {
        return Err(Error::InvalidFrame(format!(
            "expected {COLOR_FRAME_LEN} bytes, got {}",
            frame.len()
        )));
    }

    match Opcode::try_from(frame[0])? {
        Opcode::SetColor => Ok(RgbwCommand::new(frame[1], frame[2], frame[3], frame[4])),
        other => Err(Error::InvalidFrame(format!("{other:?} is not a color frame"))),
    }
}

/// Parses a seven character `#RRGGBB` string.
///
/// Anything that is not exactly seven ASCII characters with valid hex digits
/// in positions 1 to 6 yields black. The leading character is not checked.
pub fn decode_hex_color(hex: &str) -> Rgb {
    if hex.len() != 7 || !hex.is_ascii() || !hex.bytes().skip(1).all(|b| b.is_ascii_hexdigit()) {
        return Rgb::default();
    }

    let parse = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16);
    match (parse(1..3), parse(3..5), parse(5..7)) {
        (Ok(red), Ok(green), Ok(blue)) => Rgb { red, green, blue },
        _ => Rgb::default(),
    }
}

/// Decodes the transport's text form of a payload
pub fn text_to_bytes(text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.as_bytes())
        .map_err(|e| Error::InvalidPayload(e.to_string()))
}

/// Encodes a payload into the transport's text form
pub fn bytes_to_text(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}
