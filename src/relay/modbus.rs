use crate::error::{Result, TagRelayError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const PROTOCOL_ID: u16 = 0;
const WRITE_SINGLE_REGISTER: u8 = 0x06;
const MBAP_HEADER_LEN: usize = 7;
const MAX_PDU_LEN: u16 = 260;

/// Encode a Write Single Register (function 6) request as a Modbus TCP
/// frame: 7-byte MBAP header followed by the 5-byte PDU.
pub fn encode_write_single_register(
    transaction_id: u16,
    unit_id: u8,
    register: u16,
    value: u16,
) -> [u8; 12] {
    let mut frame = [0u8; 12];
    frame[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    frame[2..4].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    // Length counts the unit identifier plus the PDU.
    frame[4..6].copy_from_slice(&6u16.to_be_bytes());
    frame[6] = unit_id;
    frame[7] = WRITE_SINGLE_REGISTER;
    frame[8..10].copy_from_slice(&register.to_be_bytes());
    frame[10..12].copy_from_slice(&value.to_be_bytes());
    frame
}

/// Validate the response PDU for a Write Single Register request.
///
/// Distinguishes a device-reported exception (function | 0x80 plus an
/// exception code) from transport-level garbage.
pub fn check_response_pdu(pdu: &[u8], register: u16) -> Result<()> {
    if pdu.is_empty() {
        return Err(TagRelayError::protocol("empty response PDU"));
    }

    let function = pdu[0];
    if function == WRITE_SINGLE_REGISTER | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(TagRelayError::DeviceException { code, register });
    }
    if function != WRITE_SINGLE_REGISTER {
        return Err(TagRelayError::protocol(format!(
            "unexpected function code {:#04x} in response",
            function
        )));
    }
    if pdu.len() < 5 {
        return Err(TagRelayError::protocol(format!(
            "short response PDU ({} bytes)",
            pdu.len()
        )));
    }

    let echoed_register = u16::from_be_bytes([pdu[1], pdu[2]]);
    if echoed_register != register {
        return Err(TagRelayError::protocol(format!(
            "response echoed register {} instead of {}",
            echoed_register, register
        )));
    }

    Ok(())
}

/// Parse an MBAP header, returning (transaction id, remaining byte count).
pub fn parse_mbap_header(header: &[u8; MBAP_HEADER_LEN]) -> Result<(u16, u16)> {
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]);

    if protocol_id != PROTOCOL_ID {
        return Err(TagRelayError::protocol(format!(
            "unexpected protocol identifier {}",
            protocol_id
        )));
    }
    if length < 2 || length > MAX_PDU_LEN {
        return Err(TagRelayError::protocol(format!(
            "implausible MBAP length {}",
            length
        )));
    }

    // Length counts the unit identifier (already in the header) + PDU.
    Ok((transaction_id, length - 1))
}

/// Write one holding register over Modbus TCP.
///
/// One call is one full connection lifecycle: connect, verify, a single
/// register write, response check, close. There is no pooling and no retry
/// beyond the caller's next scheduled attempt.
pub async fn write_register(
    host: &str,
    port: u16,
    unit_id: u8,
    register: u16,
    value: u16,
    transaction_id: u16,
    io_timeout: Duration,
) -> Result<()> {
    debug!("connecting to {}:{}", host, port);

    let mut stream = timeout(io_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TagRelayError::protocol(format!("connect to {}:{} timed out", host, port)))?
        .map_err(|e| TagRelayError::protocol(format!("connect to {}:{} failed: {}", host, port, e)))?;

    let request = encode_write_single_register(transaction_id, unit_id, register, value);
    timeout(io_timeout, stream.write_all(&request))
        .await
        .map_err(|_| TagRelayError::protocol("request write timed out"))??;

    let mut header = [0u8; MBAP_HEADER_LEN];
    timeout(io_timeout, stream.read_exact(&mut header))
        .await
        .map_err(|_| TagRelayError::protocol("response header read timed out"))??;

    let (response_txn, remaining) = parse_mbap_header(&header)?;
    if response_txn != transaction_id {
        return Err(TagRelayError::protocol(format!(
            "transaction id mismatch: sent {}, got {}",
            transaction_id, response_txn
        )));
    }

    let mut pdu = vec![0u8; remaining as usize];
    timeout(io_timeout, stream.read_exact(&mut pdu))
        .await
        .map_err(|_| TagRelayError::protocol("response body read timed out"))??;

    check_response_pdu(&pdu, register)?;

    debug!(
        "wrote value {} to register {} at {}:{} (unit {})",
        value, register, host, port, unit_id
    );
    Ok(())
}
