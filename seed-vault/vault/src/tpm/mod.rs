use anyhow::{Context, Result, bail};
use std::str::FromStr;
use tss_esapi::Context as TpmContext;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::handles::{KeyHandle, ObjectHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm, SymmetricMode};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::key_bits::{AesKeyBits, RsaKeyBits};
use tss_esapi::interface_types::resource_handles::{Hierarchy, Provision};
use tss_esapi::structures::{
    Digest, KeyedHashScheme, Public, PublicBuilder, PublicKeyRsa, PublicKeyedHashParameters,
    PublicRsaParametersBuilder, RsaExponent, RsaScheme, SensitiveData, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use zeroize::Zeroizing;

use crate::KeyBackend;
use crate::backend::KEY_MATERIAL_LEN;

const SEALED_KEY_HANDLE: u32 = 0x81010010;
const DEFAULT_TPM_DEVICE: &str = "/dev/tpm0";

/// Check if a TPM device is available.
pub fn detect_platform() -> bool {
    std::path::Path::new(DEFAULT_TPM_DEVICE).exists()
}

/// TPM-sealed master key.
///
/// The key material is generated by the TPM, sealed under the owner
/// storage primary and persisted at a fixed handle. It can only be
/// unsealed on this TPM.
pub struct TpmKeyBackend {
    device: String,
    handle: u32,
}

impl Default for TpmKeyBackend {
    fn default() -> Self {
        Self {
            device: DEFAULT_TPM_DEVICE.to_string(),
            handle: SEALED_KEY_HANDLE,
        }
    }
}

impl TpmKeyBackend {
    fn context(&self) -> Result<TpmContext> {
        let tcti = TctiNameConf::from_str(&format!("device:{}", self.device))
            .context("failed to create TCTI config")?;
        TpmContext::new(tcti).context("failed to create TPM context")
    }

    fn persisted(&self, ctx: &mut TpmContext) -> Result<Option<ObjectHandle>> {
        let tpm_handle: TpmHandle = self.handle.try_into().context("invalid sealed key handle")?;
        Ok(ctx
            .execute_with_nullauth_session(|ctx| ctx.tr_from_tpm_public(tpm_handle))
            .ok())
    }
}

/// RSA 2048 storage primary under the owner hierarchy.
///
/// Deterministic for a given TPM, so it is recreated on demand and flushed
/// after use.
fn storage_primary_template() -> Result<Public> {
    let object_attributes = ObjectAttributesBuilder::new()
        .with_restricted(true)
        .with_decrypt(true)
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .build()?;

    let rsa_params = PublicRsaParametersBuilder::new()
        .with_scheme(RsaScheme::Null)
        .with_key_bits(RsaKeyBits::Rsa2048)
        .with_exponent(RsaExponent::default())
        .with_symmetric(SymmetricDefinitionObject::Aes {
            key_bits: AesKeyBits::Aes128,
            mode: SymmetricMode::Cfb,
        })
        .with_restricted(true)
        .with_is_signing_key(false)
        .with_is_decryption_key(true)
        .build()?;

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(PublicKeyRsa::new_empty_with_size(RsaKeyBits::Rsa2048))
        .build()
        .context("failed to build storage primary template")
}

/// Keyed-hash data object holding caller-supplied key material.
fn sealed_object_template() -> Result<Public> {
    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_user_with_auth(true)
        .build()?;

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
        .with_keyed_hash_unique_identifier(Digest::default())
        .build()
        .context("failed to build sealed key template")
}

impl KeyBackend for TpmKeyBackend {
    fn provision(&self) -> Result<bool> {
        let mut ctx = self.context()?;
        if self.persisted(&mut ctx)?.is_some() {
            log::info!("sealed key already exists at handle {:#X}", self.handle);
            return Ok(false);
        }

        log::info!("sealing new master key at handle {:#X}", self.handle);
        let primary_template = storage_primary_template()?;
        let sealed_template = sealed_object_template()?;
        let handle = self.handle;

        ctx.execute_with_nullauth_session(|ctx| -> std::result::Result<(), tss_esapi::Error> {
            let random = ctx.get_random(KEY_MATERIAL_LEN)?;
            let material = Zeroizing::new(random.value().to_vec());
            let sensitive = SensitiveData::try_from(material.to_vec())?;

            let primary =
                ctx.create_primary(Hierarchy::Owner, primary_template, None, None, None, None)?;
            let sealed = ctx.create(
                primary.key_handle,
                sealed_template,
                None,
                Some(sensitive),
                None,
                None,
            )?;
            let loaded: KeyHandle =
                ctx.load(primary.key_handle, sealed.out_private, sealed.out_public)?;

            let persistent = PersistentTpmHandle::new(handle)?;
            ctx.evict_control(
                Provision::Owner,
                loaded.into(),
                Persistent::Persistent(persistent),
            )?;
            ctx.flush_context(loaded.into())?;
            ctx.flush_context(primary.key_handle.into())?;
            Ok(())
        })
        .context("TPM key sealing failed")?;

        log::info!("sealed master key at handle {:#X}", self.handle);
        Ok(true)
    }

    fn ikm(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut ctx = self.context()?;
        let Some(sealed) = self.persisted(&mut ctx)? else {
            bail!("no sealed key at handle {:#X}", self.handle);
        };
        let data = ctx
            .execute_with_nullauth_session(|ctx| ctx.unseal(sealed))
            .context("failed to unseal master key")?;
        Ok(Zeroizing::new(data.value().to_vec()))
    }

    fn destroy(&self) -> Result<()> {
        let mut ctx = self.context()?;
        let Some(sealed) = self.persisted(&mut ctx)? else {
            return Ok(());
        };
        let persistent =
            PersistentTpmHandle::new(self.handle).context("invalid sealed key handle")?;
        ctx.execute_with_nullauth_session(|ctx| {
            ctx.evict_control(Provision::Owner, sealed, Persistent::Persistent(persistent))
        })
        .context("failed to evict sealed key")?;
        log::warn!("evicted sealed master key at handle {:#X}", self.handle);
        Ok(())
    }

    fn is_hardware_backed(&self) -> bool {
        true
    }
}
