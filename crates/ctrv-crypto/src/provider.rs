//! Block cipher providers
//!
//! A provider turns `(cipher, counter)` into keystream and XORs it over the
//! input. Every provider produces byte-identical output; they differ only in
//! how the AES rounds are scheduled.

use std::fmt::Debug;
use std::sync::Arc;

use aes::cipher::{BlockEncrypt, InnerIvInit, StreamCipher};
use aes::{Aes256, Block};

use ctrv_core::types::{ProviderType, BLOCK_SIZE};

/// Generates CTR keystream for consecutive counter values starting at
/// `counter` and XORs it into `dest`. Returns the number of bytes written,
/// `min(src.len(), dest.len())`.
///
/// Providers treat the counter as a plain 128-bit big-endian integer. Keeping
/// the increment out of the nonce bytes is the transformer's job.
pub trait BlockCipherProvider: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn transform(
        &self,
        cipher: &Aes256,
        counter: &[u8; BLOCK_SIZE],
        src: &[u8],
        dest: &mut [u8],
    ) -> usize;
}

/// One AES block encryption per counter value.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableProvider;

impl BlockCipherProvider for PortableProvider {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn transform(
        &self,
        cipher: &Aes256,
        counter: &[u8; BLOCK_SIZE],
        src: &[u8],
        dest: &mut [u8],
    ) -> usize {
        let count = src.len().min(dest.len());
        let mut ctr = u128::from_be_bytes(*counter);
        for (src_block, dest_block) in src[..count]
            .chunks(BLOCK_SIZE)
            .zip(dest[..count].chunks_mut(BLOCK_SIZE))
        {
            let mut keystream = Block::clone_from_slice(&ctr.to_be_bytes());
            cipher.encrypt_block(&mut keystream);
            for ((d, s), k) in dest_block.iter_mut().zip(src_block).zip(keystream.iter()) {
                *d = s ^ k;
            }
            ctr = ctr.wrapping_add(1);
        }
        count
    }
}

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes256CtrCore = ctr::CtrCore<Aes256, ctr::flavors::Ctr128BE>;

/// Keystream through the `ctr` crate, which pipelines several blocks per
/// call and uses AES-NI / ARMv8 AES when the CPU has them.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceleratedProvider;

impl BlockCipherProvider for AcceleratedProvider {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn transform(
        &self,
        cipher: &Aes256,
        counter: &[u8; BLOCK_SIZE],
        src: &[u8],
        dest: &mut [u8],
    ) -> usize {
        let count = src.len().min(dest.len());
        let mut keystream =
            Aes256Ctr::from_core(Aes256CtrCore::inner_iv_init(cipher.clone(), counter.into()));
        dest[..count].copy_from_slice(&src[..count]);
        keystream.apply_keystream(&mut dest[..count]);
        count
    }
}

/// True when the CPU has hardware AES instructions.
pub fn hardware_aes_available() -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        std::arch::is_x86_feature_detected!("aes")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("aes")
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

/// Build the provider for a configured type.
pub fn create_provider(kind: ProviderType) -> Arc<dyn BlockCipherProvider> {
    let provider: Arc<dyn BlockCipherProvider> = match kind {
        ProviderType::Portable => Arc::new(PortableProvider),
        ProviderType::Accelerated => Arc::new(AcceleratedProvider),
        ProviderType::Auto if hardware_aes_available() => Arc::new(AcceleratedProvider),
        ProviderType::Auto => Arc::new(PortableProvider),
    };
    tracing::debug!(requested = %kind, selected = provider.name(), "block cipher provider");
    provider
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::KeyInit;
    use proptest::prelude::*;

    fn cipher() -> Aes256 {
        Aes256::new(&[7u8; 32].into())
    }

    /// NIST SP 800-38A F.5.5 CTR-AES256.Encrypt, first block
    #[test]
    fn test_nist_vector() {
        let key = hex_bytes("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4");
        let counter: [u8; 16] = hex_bytes("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").try_into().unwrap();
        let plain = hex_bytes("6bc1bee22e409f96e93d7e117393172a");
        let expected = hex_bytes("601ec313775789a5b7a7f504bbf3d228");

        let cipher = Aes256::new_from_slice(&key).unwrap();
        for provider in [
            &PortableProvider as &dyn BlockCipherProvider,
            &AcceleratedProvider,
        ] {
            let mut out = vec![0u8; 16];
            assert_eq!(provider.transform(&cipher, &counter, &plain, &mut out), 16);
            assert_eq!(out, expected, "{}", provider.name());
        }
    }

    fn hex_bytes(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_accelerated_carries_into_high_bytes() {
        let mut counter = [0u8; 16];
        counter[8..].copy_from_slice(&(u64::MAX - 1).to_be_bytes());
        let data = vec![0x5Au8; 5 * BLOCK_SIZE + 3];
        let mut portable = vec![0u8; data.len()];
        let mut accelerated = vec![0u8; data.len()];
        PortableProvider.transform(&cipher(), &counter, &data, &mut portable);
        let n = AcceleratedProvider.transform(&cipher(), &counter, &data, &mut accelerated);
        assert_eq!(n, data.len());
        assert_eq!(accelerated, portable);
    }

    #[test]
    fn test_short_dest_limits_count() {
        let mut out = [0u8; 5];
        let n = PortableProvider.transform(&cipher(), &[0u8; 16], &[1u8; 20], &mut out);
        assert_eq!(n, 5);
    }

    #[test]
    fn test_auto_resolves() {
        let provider = create_provider(ProviderType::Auto);
        assert!(matches!(provider.name(), "portable" | "accelerated"));
        assert_eq!(create_provider(ProviderType::Portable).name(), "portable");
    }

    proptest! {
        #[test]
        fn prop_providers_agree(
            data in proptest::collection::vec(any::<u8>(), 0..200),
            counter in any::<[u8; 16]>(),
        ) {
            let c = cipher();
            let mut a = vec![0u8; data.len()];
            let mut b = vec![0u8; data.len()];
            PortableProvider.transform(&c, &counter, &data, &mut a);
            AcceleratedProvider.transform(&c, &counter, &data, &mut b);
            prop_assert_eq!(a, b);
        }
    }
}
