//! Record graph to CBOR.

use super::{
    encode_header, MAJOR_ARRAY, MAJOR_BSTR, MAJOR_MAP, MAJOR_NINT, MAJOR_SIMPLE, MAJOR_TSTR,
    MAJOR_UINT,
};
use crate::heap::{Addr, Heap};
use crate::record::{Array, Map, Record, View};
use crate::{vec_try, CborError, Error};
use alloc::vec::Vec;

/// Default depth of the encoder work stack.
pub const ENCODER_STACK_SIZE: usize = 64;

/// Destination buffer with overrun detection.
struct Output<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Output<'a> {
    fn put(&mut self, data: &[u8]) -> Result<(), CborError> {
        let end = self.pos.checked_add(data.len()).ok_or(CborError::BufferOverrun)?;
        if end > self.buf.len() {
            return Err(CborError::BufferOverrun);
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn header(&mut self, major: u8, arg: u64) -> Result<(), CborError> {
        let (hdr, len) = encode_header(major, arg);
        self.put(&hdr[..len])
    }

    fn int(&mut self, value: i64) -> Result<(), CborError> {
        if value < 0 {
            self.header(MAJOR_NINT, !value as u64)
        } else {
            self.header(MAJOR_UINT, value as u64)
        }
    }
}

/// Pending work: a record to emit, or the position reached inside an open composite.
#[derive(Clone, Copy)]
enum Work {
    Item(Addr),
    Elements(Array, usize),
    /// Map entries count half-steps: key of entry `n / 2` when `n` is even, else its value.
    Entries(Map, usize),
}

/// Bounded LIFO of pending work. One entry stands for each open composite, so the limit bounds
/// nesting depth rather than width.
struct Stack {
    items: Vec<Work>,
    limit: usize,
}

impl Stack {
    fn new(limit: usize) -> Result<Self, Error> {
        let mut items = Vec::new();
        items.try_reserve(limit).map_err(|_e| Error::Alloc("encoder stack"))?;
        Ok(Self { items, limit })
    }

    fn push(&mut self, work: Work) -> Result<(), CborError> {
        if self.items.len() >= self.limit {
            return Err(CborError::NestingTooDeep);
        }
        self.items.push(work);
        Ok(())
    }

    fn push_item(&mut self, addr: Addr) -> Result<(), CborError> {
        self.push(Work::Item(addr))
    }

    /// Schedule element `next` of `arr`, leaving a continuation for the rest.
    fn next_element(&mut self, heap: &Heap, arr: Array, next: usize) -> Result<(), Error> {
        if next < arr.len(heap)? {
            self.push(Work::Elements(arr, next + 1))?;
            self.push_item(arr.get(heap, next)?)?;
        }
        Ok(())
    }

    fn next_entry(&mut self, heap: &Heap, map: Map, next: usize) -> Result<(), Error> {
        let idx = next / 2;
        if idx < map.len(heap)? {
            self.push(Work::Entries(map, next + 1))?;
            match next % 2 {
                0 => self.push_item(map.key(heap, idx)?)?,
                _ => self.push_item(map.value(heap, idx)?)?,
            }
        }
        Ok(())
    }
}

/// Serializes a record graph to canonical CBOR.
#[derive(Clone, Debug)]
pub struct Encoder {
    stack_size: usize,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_stack_size(ENCODER_STACK_SIZE)
    }

    pub fn with_stack_size(stack_size: usize) -> Self {
        Self { stack_size }
    }

    /// Encode the graph rooted at `root` into `out`, returning the number of bytes written.
    pub fn encode(&self, heap: &Heap, root: Addr, out: &mut [u8]) -> Result<usize, Error> {
        let mut stack = Stack::new(self.stack_size)?;
        let mut w = Output { buf: out, pos: 0 };
        stack.push_item(root)?;
        while let Some(work) = stack.items.pop() {
            let addr = match work {
                Work::Item(addr) => addr,
                Work::Elements(arr, next) => {
                    stack.next_element(heap, arr, next)?;
                    continue;
                }
                Work::Entries(map, next) => {
                    stack.next_entry(heap, map, next)?;
                    continue;
                }
            };
            match View::of(heap, addr)? {
                View::ByteBlob(b) => {
                    let data = b.data(heap)?;
                    w.header(MAJOR_BSTR, data.len() as u64)?;
                    w.put(data)?;
                }
                View::TextString(t) => {
                    let data = t.data(heap)?;
                    w.header(MAJOR_TSTR, data.len() as u64)?;
                    w.put(data)?;
                }
                View::Integer(i) => w.header(MAJOR_UINT, i.value(heap)?)?,
                View::NegInteger(n) => w.int(n.value(heap)?)?,
                View::Simple(s) => w.header(MAJOR_SIMPLE, s.value(heap)? as u64)?,
                View::Enum(e) => w.header(MAJOR_UINT, e.value(heap)? as u64)?,
                View::Array(arr) => {
                    w.header(MAJOR_ARRAY, arr.len(heap)? as u64)?;
                    stack.next_element(heap, arr, 0)?;
                }
                View::Map(map) => {
                    w.header(MAJOR_MAP, map.len(heap)? as u64)?;
                    stack.next_entry(heap, map, 0)?;
                }
                View::KeyParam(param) => {
                    w.header(MAJOR_UINT, param.tag(heap)?.raw() as u64)?;
                    match param.value(heap)? {
                        Some(value) => stack.push_item(value)?,
                        // Boolean tags are present-means-true.
                        None => w.header(MAJOR_UINT, 1)?,
                    }
                }
                View::KeyParams(params) => {
                    let arr = params.array(heap)?;
                    w.header(MAJOR_MAP, arr.len(heap)? as u64)?;
                    stack.next_element(heap, arr, 0)?;
                }
                View::KeyChars(chars) => stack.push_item(chars.array(heap)?.addr())?,
                View::HwAuthToken(token) => stack.push_item(token.array(heap)?.addr())?,
                View::VerificationToken(token) => stack.push_item(token.array(heap)?.addr())?,
                View::HmacSharingParams(params) => stack.push_item(params.array(heap)?.addr())?,
                View::CoseKeyPair(pair) => {
                    w.int(pair.label(heap)?)?;
                    stack.push_item(pair.value(heap)?)?;
                }
                View::CoseKey(key) => {
                    let arr = key.array(heap)?;
                    w.header(MAJOR_MAP, arr.len(heap)? as u64)?;
                    stack.next_element(heap, arr, 0)?;
                }
                View::CoseHeaders(headers) => {
                    let arr = headers.array(heap)?;
                    w.header(MAJOR_MAP, arr.len(heap)? as u64)?;
                    stack.next_element(heap, arr, 0)?;
                }
            }
        }
        Ok(w.pos)
    }

    /// Encode the graph rooted at `root` into a new vector of at most `max_len` bytes.
    pub fn encode_to_vec(&self, heap: &Heap, root: Addr, max_len: usize) -> Result<Vec<u8>, Error> {
        let mut out = vec_try![0u8; max_len]?;
        let len = self.encode(heap, root, &mut out)?;
        out.truncate(len);
        Ok(out)
    }
}
