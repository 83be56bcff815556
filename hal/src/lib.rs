//! Host-side access to the secure-element key-management applet.
//!
//! This implementation relies on a `SerializedChannel` abstraction for a communication channel to
//! the applet.  Method invocations are converted into the corresponding request structures, which
//! are serialized (using CBOR) and sent down the channel together with the instruction byte that
//! identifies the command.  Every serialized response starts with a status word that carries an
//! error code and the power-reset flag; the remainder is deserialized into a response structure.

use core::fmt::Debug;
use kmse_wire::{
    cbor, cbor_type_error, keymint::ErrorCode, read_to_value, AsCborValue, CborError, Code, Ins,
    ResponseStatus,
};
use log::{error, warn};
use std::io::{Read, Write};

pub mod keymint;
#[cfg(test)]
mod tests;

/// Error type for host-side calls.
#[derive(Debug)]
pub enum Error {
    /// Request or response could not be converted to or from CBOR.
    Cbor(CborError),
    /// The applet (or the host, before sending) rejected the command with this status.
    Status(ResponseStatus),
    /// Communication with the applet was lost.
    Channel(String),
}

impl Error {
    /// Error code to report for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Cbor(_) => ErrorCode::UnknownError,
            Error::Status(status) => status.error_code,
            Error::Channel(_) => ErrorCode::SecureHwCommunicationFailed,
        }
    }
}

impl From<CborError> for Error {
    fn from(e: CborError) -> Self {
        Error::Cbor(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Abstraction of a channel to the applet.
pub trait SerializedChannel: Debug {
    /// Maximum supported size for the channel in bytes.
    const MAX_SIZE: usize;

    /// Accepts a serialized request for the command identified by `ins` and returns the
    /// serialized response (or an error if communication via the channel is lost).
    fn execute(&mut self, ins: u8, serialized_req: &[u8]) -> Result<Vec<u8>>;
}

/// Write a message to a stream-oriented [`Write`] item, with framing: the instruction byte, then
/// a big-endian `u32` holding the length of the data that follows.
pub fn write_msg<W: Write>(w: &mut W, ins: u8, data: &[u8]) -> Result<()> {
    let data_len: u32 = data
        .len()
        .try_into()
        .map_err(|_e| Error::Channel("encoded request message too large".to_string()))?;
    let mut header = [0u8; 5];
    header[0] = ins;
    header[1..].copy_from_slice(&data_len.to_be_bytes());
    w.write_all(&header).map_err(|e| {
        error!("Failed to write header to stream: {}", e);
        Error::Channel(format!("failed to write framing header: {}", e))
    })?;
    w.write_all(data).map_err(|e| {
        error!("Failed to write data to stream: {}", e);
        Error::Channel(format!("failed to write data: {}", e))
    })?;
    Ok(())
}

/// Read a message from a stream-oriented [`Read`] item, with length framing.
pub fn read_msg<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    // The data read from the `Read` item has a 4-byte big-endian length prefix.
    let mut len_data = [0u8; 4];
    r.read_exact(&mut len_data).map_err(|e| {
        error!("Failed to read length from stream: {}", e);
        Error::Channel(format!("failed to read framing length: {}", e))
    })?;
    let len = u32::from_be_bytes(len_data);
    let mut data = vec![0; len as usize];
    r.read_exact(&mut data).map_err(|e| {
        error!("Failed to read data from stream: {}", e);
        Error::Channel(format!("failed to read data: {}", e))
    })?;
    Ok(data)
}

/// Message-oriented wrapper around a pair of stream-oriented channels.  This allows a pair of
/// uni-directional channels that don't necessarily preserve message boundaries to appear as a
/// single bi-directional channel that does preserve message boundaries.
#[derive(Debug)]
pub struct MessageChannel<R: Read, W: Write> {
    r: R,
    w: W,
}

impl<R: Read, W: Write> MessageChannel<R, W> {
    pub fn new(r: R, w: W) -> Self {
        Self { r, w }
    }
}

impl<R: Read + Debug, W: Write + Debug> SerializedChannel for MessageChannel<R, W> {
    const MAX_SIZE: usize = kmse_wire::DEFAULT_MAX_SIZE;

    fn execute(&mut self, ins: u8, serialized_req: &[u8]) -> Result<Vec<u8>> {
        write_msg(&mut self.w, ins, serialized_req)?;
        read_msg(&mut self.r)
    }
}

/// Successful response from the applet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response<S> {
    pub body: S,
    /// The applet lost power since the previous command, dropping every in-flight operation.
    pub power_reset: bool,
}

/// Split a serialized response into its status and the items that follow the status word.
/// Failures are a bare status word; successes are an array headed by one.
pub fn split_rsp(data: &[u8]) -> Result<(ResponseStatus, Vec<cbor::value::Value>)> {
    let value = read_to_value(data)?;
    let (word, items) = match value {
        cbor::value::Value::Integer(_) => (value, Vec::new()),
        cbor::value::Value::Array(mut a) if !a.is_empty() => {
            let word = a.remove(0);
            (word, a)
        }
        _ => {
            error!("HAL: response is neither a status word nor an array");
            return cbor_type_error(&value, "int or non-empty arr").map_err(Error::Cbor);
        }
    };
    let word = <u32>::from_cbor_value(word)?;
    Ok((ResponseStatus::from_word(word)?, items))
}

/// Execute a command by serializing and sending a request structure down a channel, and
/// deserializing and returning the response.
pub fn channel_execute<T, R, S>(channel: &mut T, req: R) -> Result<Response<S>>
where
    T: SerializedChannel,
    R: AsCborValue + Code<Ins>,
    S: AsCborValue,
{
    let req_data = req.into_vec()?;
    if req_data.len() > T::MAX_SIZE {
        error!(
            "HAL command {:?} encodes bigger {} than max size {}",
            <R>::CODE,
            req_data.len(),
            T::MAX_SIZE
        );
        return Err(Error::Status(ResponseStatus::new(ErrorCode::InvalidInputLength, false)));
    }

    // Send in request bytes, get back response bytes.
    let rsp_data = channel.execute(<R>::CODE as u8, &req_data)?;

    let (status, items) = split_rsp(&rsp_data)?;
    if status.power_reset {
        warn!("HAL: applet reset before command {:?}", <R>::CODE);
    }
    if status.error_code != ErrorCode::Ok {
        error!("HAL: command {:?} failed: {:?}", <R>::CODE, status.error_code);
        return Err(Error::Status(status));
    }
    // Response structures are arrays of exactly the items after the status word.
    let body = <S>::from_cbor_value(cbor::value::Value::Array(items))?;
    Ok(Response { body, power_reset: status.power_reset })
}
