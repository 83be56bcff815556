//! Key-management applet, running in the secure element.

#![no_std]
extern crate alloc;

use alloc::vec::Vec;
use kmse_common::codec::{encode_error, Decoder, Encoder, Template};
use kmse_common::crypto;
use kmse_common::heap::{Addr, Heap, HEAP_SIZE};
use kmse_common::nvm::PersistentStore;
use kmse_common::record::{Array, EnumType, Integer, Record};
use kmse_common::{km_err, Error};
use kmse_wire::keymint::ErrorCode;
use kmse_wire::{Ins, ResponseStatus, DEFAULT_MAX_SIZE};
use log::{debug, error, warn};

pub mod device;
pub mod operation;
pub mod repository;

use repository::{required_store_size, Repository, MAX_OPS};

#[cfg(test)]
mod tests;

/// Runtime configuration of the applet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppletConfig {
    /// Size of the record arena, in bytes.
    pub heap_size: usize,
    /// Number of operations that may be in flight at once.
    pub max_operations: usize,
    /// Largest encoded response.
    pub max_response_size: usize,
}

impl Default for AppletConfig {
    fn default() -> Self {
        Self {
            heap_size: HEAP_SIZE,
            max_operations: MAX_OPS,
            max_response_size: DEFAULT_MAX_SIZE,
        }
    }
}

/// Key-management applet, processing one command at a time.
pub struct KeymasterApplet<'a> {
    /// Trait objects that hold this device's implementations of the abstract cryptographic
    /// functionality traits.
    imp: crypto::Implementation<'a>,

    /// Durable storage holding the data table and the operation slots.
    store: &'a mut dyn PersistentStore,

    config: AppletConfig,

    /// Record arena, emptied after every command.
    heap: Heap,

    encoder: Encoder,
    decoder: Decoder,

    /// The operation table.
    repository: Repository,

    /// Whether the response being built should report a power reset.
    power_reset: bool,
}

const NO_ARGS: Template = Template::Array(&[]);

/// Argument layout for each command.
fn request_template(ins: Ins) -> &'static Template {
    match ins {
        Ins::ProvisionAttestIds => &Template::Array(&[Template::KeyParams]),
        Ins::SetBootParams => &Template::Array(&[
            Template::Integer,
            Template::ByteBlob,
            Template::ByteBlob,
            Template::Enum(EnumType::VerifiedBootState),
            Template::Enum(EnumType::DeviceLocked),
        ]),
        Ins::SetVersionPatchlevel => {
            &Template::Array(&[Template::Integer, Template::Integer, Template::Integer])
        }
        Ins::DestroyAttIds | Ins::GetHmacSharingParams => &NO_ARGS,
        Ins::Begin => &Template::Array(&[
            Template::Enum(EnumType::Purpose),
            Template::ByteBlob,
            Template::KeyParams,
            Template::HwAuthToken,
        ]),
        Ins::Update => &Template::Array(&[
            Template::Integer,
            Template::ByteBlob,
            Template::HwAuthToken,
            Template::VerificationToken,
        ]),
        Ins::Finish => &Template::Array(&[
            Template::Integer,
            Template::ByteBlob,
            Template::ByteBlob,
            Template::HwAuthToken,
            Template::VerificationToken,
        ]),
        Ins::Abort => &Template::Array(&[Template::Integer]),
        Ins::DeviceLocked => &Template::Array(&[Template::Simple, Template::VerificationToken]),
    }
}

impl<'a> KeymasterApplet<'a> {
    /// Create an applet instance over the given collaborators.
    pub fn new(
        imp: crypto::Implementation<'a>,
        store: &'a mut dyn PersistentStore,
        config: AppletConfig,
    ) -> Result<Self, Error> {
        let needed = required_store_size(config.max_operations);
        if store.len() < needed {
            return Err(km_err!(
                UnknownError,
                "store of {} bytes too small, need {}",
                store.len(),
                needed
            ));
        }
        Ok(Self {
            imp,
            store,
            config,
            heap: Heap::new(config.heap_size)?,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            repository: Repository::new(config.max_operations)?,
            power_reset: false,
        })
    }

    pub fn config(&self) -> &AppletConfig {
        &self.config
    }

    /// Number of operations currently in flight.
    pub fn active_operations(&self) -> Result<usize, Error> {
        self.repository.active_count(&*self.store)
    }

    /// Simulate loss of power to transient memory.
    pub fn power_loss(&mut self) {
        self.heap.power_loss();
    }

    /// Process a single serialized command, returning a serialized response.
    pub fn process(&mut self, ins: u8, data: &[u8]) -> Vec<u8> {
        self.check_reset();
        debug!("-> applet: ins {:#04x} with {} bytes", ins, data.len());
        let rsp = match self.process_ins(ins, data) {
            Ok(rsp) => rsp,
            Err(e) => {
                error!("failing ins {:#04x} with {:?}", ins, e);
                self.error_rsp(e.into())
            }
        };
        self.heap.clean();
        self.power_reset = false;
        debug!("<- applet: response of {} bytes", rsp.len());
        rsp
    }

    /// Detect a reset since the previous command. A reset loses every in-memory crypto operation,
    /// so all operation slots are released and the next response carries the reset flag.
    fn check_reset(&mut self) {
        if self.heap.reset_event_occurred() {
            warn!("reset detected, releasing all operations");
            if let Err(e) = self.repository.release_all(&mut *self.store) {
                error!("failed to release operations after reset: {:?}", e);
            }
            self.power_reset = true;
        }
        self.heap.on_process();
    }

    fn process_ins(&mut self, ins: u8, data: &[u8]) -> Result<Vec<u8>, Error> {
        let ins = Ins::n(ins)
            .ok_or_else(|| km_err!(Unimplemented, "unknown instruction {:#04x}", ins))?;
        let args = self.decoder.decode(&mut self.heap, request_template(ins), data)?;
        let args = Array::cast(&self.heap, args)?;
        let rsp = match ins {
            Ins::ProvisionAttestIds => self.provision_attest_ids(args)?,
            Ins::SetBootParams => self.set_boot_params(args)?,
            Ins::SetVersionPatchlevel => self.set_version_patchlevel(args)?,
            Ins::DestroyAttIds => self.destroy_attest_ids(args)?,
            Ins::GetHmacSharingParams => self.get_hmac_sharing_params(args)?,
            Ins::Begin => self.begin_operation(args)?,
            Ins::Update => self.update_operation(args)?,
            Ins::Finish => self.finish_operation(args)?,
            Ins::Abort => self.abort_operation(args)?,
            Ins::DeviceLocked => self.device_locked(args)?,
        };
        self.encoder
            .encode_to_vec(&self.heap, rsp.addr(), self.config.max_response_size)
            .map_err(|e| km_err!(UnknownError, "failed to encode response: {:?}", e))
    }

    /// Build a success response: the status word followed by `items`.
    fn response(&mut self, items: &[Addr]) -> Result<Array, Error> {
        let arr = Array::instance(&mut self.heap, items.len() + 1)?;
        let word = ResponseStatus::new(ErrorCode::Ok, self.power_reset).to_word();
        let status = Integer::from_u32(&mut self.heap, word)?;
        arr.add(&mut self.heap, 0, status.addr())?;
        for (idx, item) in items.iter().enumerate() {
            arr.add(&mut self.heap, idx + 1, *item)?;
        }
        Ok(arr)
    }

    /// Build a failure response: a bare status word.
    fn error_rsp(&self, error_code: ErrorCode) -> Vec<u8> {
        let word = ResponseStatus::new(error_code, self.power_reset).to_word();
        let mut buf = [0u8; 5];
        match encode_error(word, &mut buf) {
            Ok(len) => buf[..len].to_vec(),
            Err(e) => {
                error!("failed to encode status word {:#x}: {:?}", word, e);
                Vec::new()
            }
        }
    }
}
