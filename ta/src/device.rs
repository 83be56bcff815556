//! Handlers for commands that read or update device state held in the data table.

use crate::KeymasterApplet;
use kmse_common::record::{
    Array, ByteBlob, Enum, HmacSharingParams, Integer, KeyParams, Record, Simple,
    VerificationToken,
};
use kmse_common::table::{DataId, DataTable, DeviceLockFlags, HMAC_SEED_NONCE_SIZE};
use kmse_common::{km_err, Error};
use kmse_wire::keymint::{DeviceLockState, VerifiedBootState};
use log::info;

impl<'a> KeymasterApplet<'a> {
    pub(crate) fn provision_attest_ids(&mut self, args: Array) -> Result<Array, Error> {
        let heap = &self.heap;
        let params = args.get_as::<KeyParams>(heap, 0)?;
        let mut table = DataTable::new(&mut *self.store)?;
        for idx in 0..params.len(heap)? {
            let param = params.get(heap, idx)?;
            let tag = param.tag(heap)?;
            if DataId::for_attestation_tag(tag).is_none() {
                return Err(km_err!(InvalidTag, "{:?} is not an attestation ID", tag));
            }
            table.set_attestation_id(tag, param.as_bytes(heap)?)?;
            info!("provisioned attestation ID {:?}", tag);
        }
        self.response(&[])
    }

    pub(crate) fn set_boot_params(&mut self, args: Array) -> Result<Array, Error> {
        let heap = &self.heap;
        let boot_patch_level = args.get_as::<Integer>(heap, 0)?.as_u32(heap)?;
        let boot_key = args.get_as::<ByteBlob>(heap, 1)?.data(heap)?;
        let boot_hash = args.get_as::<ByteBlob>(heap, 2)?.data(heap)?;
        let state = args.get_as::<Enum>(heap, 3)?.value(heap)?;
        let state = VerifiedBootState::n(state as i32)
            .ok_or_else(|| km_err!(InvalidArgument, "boot state {} not recognized", state))?;
        let locked = args.get_as::<Enum>(heap, 4)?.value(heap)? == DeviceLockState::Locked as u8;

        let mut table = DataTable::new(&mut *self.store)?;
        table.set_boot_patch_level(boot_patch_level)?;
        table.set_boot_key(boot_key)?;
        table.set_boot_hash(boot_hash)?;
        table.set_boot_state(state)?;
        table.set_device_boot_locked(locked)?;
        info!(
            "boot parameters set: {:?}, locked {}, patch level {}",
            state, locked, boot_patch_level
        );
        self.response(&[])
    }

    pub(crate) fn set_version_patchlevel(&mut self, args: Array) -> Result<Array, Error> {
        let heap = &self.heap;
        let os_version = args.get_as::<Integer>(heap, 0)?.as_u32(heap)?;
        let os_patch_level = args.get_as::<Integer>(heap, 1)?.as_u32(heap)?;
        let vendor_patch_level = args.get_as::<Integer>(heap, 2)?.as_u32(heap)?;

        let mut table = DataTable::new(&mut *self.store)?;
        table.set_os_version(os_version)?;
        table.set_os_patch_level(os_patch_level)?;
        table.set_vendor_patch_level(vendor_patch_level)?;
        info!(
            "OS version {} patch level {} vendor patch level {}",
            os_version, os_patch_level, vendor_patch_level
        );
        self.response(&[])
    }

    pub(crate) fn destroy_attest_ids(&mut self, _args: Array) -> Result<Array, Error> {
        DataTable::new(&mut *self.store)?.delete_attestation_ids()?;
        info!("attestation IDs destroyed");
        self.response(&[])
    }

    /// Return the HMAC sharing parameters, creating the nonce on first use.
    pub(crate) fn get_hmac_sharing_params(&mut self, _args: Array) -> Result<Array, Error> {
        let mut table = DataTable::new(&mut *self.store)?;
        let nonce = match table.hmac_nonce()? {
            Some(nonce) => nonce,
            None => {
                let mut nonce = [0u8; HMAC_SEED_NONCE_SIZE];
                self.imp.rng.fill_bytes(&mut nonce);
                table.set_hmac_nonce(&nonce)?;
                info!("created HMAC sharing nonce");
                nonce
            }
        };
        let params = HmacSharingParams::from_parts(&mut self.heap, &[], &nonce)?;
        self.response(&[params.addr()])
    }

    pub(crate) fn device_locked(&mut self, args: Array) -> Result<Array, Error> {
        let heap = &self.heap;
        let password_only = args.get_as::<Simple>(heap, 0)?.as_bool(heap)?;
        let token = args.get_as::<VerificationToken>(heap, 1)?;
        let timestamp = token.timestamp(heap)?;

        let mut table = DataTable::new(&mut *self.store)?;
        table.set_device_locked(DeviceLockFlags { locked: true, password_only })?;
        table.set_device_locked_time(timestamp)?;
        info!("device locked at {} (password only: {})", timestamp, password_only);
        self.response(&[])
    }
}
