use super::{Command, Error, FINAL, HEADER_LEN, SYNC};

/// A validated frame borrowing its payload from the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub command: Command,
    pub is_final: bool,
    pub ticks: u16,
    pub payload: &'a [u8],
}

/// Bytes needed to carry `ticks` bits.
pub const fn tick_bytes(ticks: u16) -> usize {
    (ticks as usize + 7) >> 3
}

fn check_header(header: &[u8]) -> Result<(Command, bool, u16), Error> {
    if header[..2] != SYNC || !header[2] != header[3] {
        return Err(Error::FrameInvalid);
    }
    let is_final = header[3] & FINAL != 0;
    let code = header[3] & !FINAL;
    let command = Command::try_from(code).map_err(|_| Error::UnknownCommand(code))?;
    Ok((command, is_final, u16::from_be_bytes([header[4], header[5]])))
}

pub fn parse_frame(token: &[u8]) -> Result<Frame<'_>, Error> {
    let header = token.get(..HEADER_LEN).ok_or(Error::Truncated(token.len()))?;
    let (command, is_final, ticks) = check_header(header)?;

    let payload = if command.has_payload() {
        token
            .get(HEADER_LEN..HEADER_LEN + tick_bytes(ticks))
            .ok_or(Error::Truncated(token.len()))?
    } else {
        &[]
    };

    Ok(Frame {
        command,
        is_final,
        ticks,
        payload,
    })
}

/// Total length of the frame starting with `header`, once enough of it has arrived to tell.
///
/// Returns `Ok(None)` while fewer than [`HEADER_LEN`] bytes are available.
pub fn expected_len(header: &[u8]) -> Result<Option<usize>, Error> {
    let header = match header.get(..HEADER_LEN) {
        Some(header) => header,
        None => return Ok(None),
    };
    let (command, _, ticks) = check_header(header)?;
    let payload = if command.has_payload() {
        tick_bytes(ticks)
    } else {
        0
    };
    Ok(Some(HEADER_LEN + payload))
}

/// Packs `bits` least significant bit first into `out`, returning the number of bits written.
pub fn pack_bits<I: IntoIterator<Item = bool>>(bits: I, out: &mut [u8]) -> usize {
    let mut count = 0;
    for (i, bit) in bits.into_iter().take(out.len() * 8).enumerate() {
        let mask = 1 << (i % 8);
        if bit {
            out[i / 8] |= mask;
        } else {
            out[i / 8] &= !mask;
        }
        count += 1;
    }
    count
}

/// Writes a frame into `out`, returning its length.
pub fn encode_frame(
    command: Command,
    is_final: bool,
    ticks: u16,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, Error> {
    let payload_len = if command.has_payload() {
        tick_bytes(ticks)
    } else {
        0
    };
    let len = HEADER_LEN + payload_len;
    if payload.len() < payload_len {
        return Err(Error::Truncated(payload.len()));
    }
    if out.len() < len {
        return Err(Error::ResourceExhausted(len));
    }

    let code = u8::from(command) | if is_final { FINAL } else { 0 };
    out[..2].copy_from_slice(&SYNC);
    out[2] = !code;
    out[3] = code;
    out[4..6].copy_from_slice(&ticks.to_be_bytes());
    out[HEADER_LEN..len].copy_from_slice(&payload[..payload_len]);
    Ok(len)
}
