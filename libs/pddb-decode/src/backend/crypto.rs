use aes::Aes256;
use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt};
use digest::Digest;
use sha2::Sha512_256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::api::*;

/// One AES block. Page table entries and space update records are each exactly this long.
pub const AES_BLOCKSIZE: usize = 16;

/// Per-page key derived from a data key and the page's commitment nonce.
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub(crate) struct CommitKey(pub(crate) [u8; 32]);

/// Derive a key commitment. This takes in a base `key`, which is 256 bits,
/// and `nonce_com` which is the commitment nonce, set at 256 bits.
/// The result is two tuples, (kenc, kcom).
pub(crate) fn kcom_func(key: &[u8; 32], nonce_com: &[u8; KCOM_NONCE_LEN]) -> (CommitKey, CommitKey) {
    let mut h_enc = Sha512_256::new();
    h_enc.update(key);
    // per https://eprint.iacr.org/2020/1456.pdf Table 4 on page 13 Type I Lenc
    h_enc.update([0x43, 0x6f, 0x6, 0xd6, 0xd, 0x69, 0x74, 0x01, 0x01]);
    h_enc.update(nonce_com);
    let k_enc = h_enc.finalize();

    let mut h_com = Sha512_256::new();
    h_com.update(key);
    // per https://eprint.iacr.org/2020/1456.pdf Table 4 on page 13 Type I Lcom. Note one-bit difference in last byte.
    h_com.update([0x43, 0x6f, 0x6, 0xd6, 0xd, 0x69, 0x74, 0x01, 0x02]);
    h_com.update(nonce_com);
    let k_com = h_com.finalize();

    let mut kenc = CommitKey::default();
    let mut kcom = CommitKey::default();
    kenc.0.copy_from_slice(k_enc.as_slice());
    kcom.0.copy_from_slice(k_com.as_slice());
    (kenc, kcom)
}

/// AES-256-GCM-SIV decrypt of `ct_and_tag` (ciphertext with the 16-byte tag appended).
pub fn aead_decrypt(key: &[u8; 32], nonce: &[u8], ct_and_tag: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != AEAD_NONCE_LEN || ct_and_tag.len() < AEAD_TAG_LEN {
        return Err(PddbError::MalformedRecord("AEAD input too short"));
    }
    let cipher = Aes256GcmSiv::new(GenericArray::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { aad, msg: ct_and_tag })
        .map_err(|_| PddbError::AuthFailure)
}

/// AES-256-GCM-SIV encrypt; the tag is appended to the returned ciphertext.
pub fn aead_encrypt(key: &[u8; 32], nonce: &[u8; AEAD_NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256GcmSiv::new(GenericArray::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { aad, msg: plaintext })
        .map_err(|_| PddbError::MalformedRecord("AEAD plaintext too long"))
}

/// Decrypts one committed data page. Returns the full plaintext, i.e. the journal revision
/// followed by one VPAGE of data.
///
/// The commitment is checked first and in constant time; a page that was sealed under a
/// different data key is reported as `CommitMismatch` even though its AEAD tag would also fail.
pub fn decrypt_committed_page(data_key: &[u8; 32], aad: &[u8], page: &[u8]) -> Result<Vec<u8>> {
    if page.len() != PAGE_SIZE {
        return Err(PddbError::MalformedRecord("committed page is not one PAGE long"));
    }
    let ct_end = PAGE_SIZE - KCOM_NONCE_LEN - KCOM_LEN;
    let mut commit_nonce = [0u8; KCOM_NONCE_LEN];
    commit_nonce.copy_from_slice(&page[ct_end..ct_end + KCOM_NONCE_LEN]);
    let commitment = &page[ct_end + KCOM_NONCE_LEN..];

    let (kenc, kcom) = kcom_func(data_key, &commit_nonce);
    if !bool::from(kcom.0[..].ct_eq(commitment)) {
        return Err(PddbError::CommitMismatch);
    }
    aead_decrypt(&kenc.0, &page[..AEAD_NONCE_LEN], &page[AEAD_NONCE_LEN..ct_end], aad)
}

/// Seals `plaintext` (journal plus at most one VPAGE) into a committed page. Short plaintexts
/// are padded with zeros out to the full VPAGE.
pub fn encrypt_committed_page(
    data_key: &[u8; 32],
    aad: &[u8],
    plaintext: &[u8],
    nonce: &[u8; AEAD_NONCE_LEN],
    commit_nonce: &[u8; KCOM_NONCE_LEN],
) -> Result<Vec<u8>> {
    if plaintext.len() > KCOM_PT_LEN {
        return Err(PddbError::MalformedRecord("committed page plaintext too long"));
    }
    let mut padded = plaintext.to_vec();
    padded.resize(KCOM_PT_LEN, 0);
    let (kenc, kcom) = kcom_func(data_key, commit_nonce);
    let ct = aead_encrypt(&kenc.0, nonce, &padded, aad)?;
    padded.zeroize();

    let mut page = Vec::with_capacity(PAGE_SIZE);
    page.extend_from_slice(nonce);
    page.extend_from_slice(&ct);
    page.extend_from_slice(commit_nonce);
    page.extend_from_slice(&kcom.0);
    debug_assert!(page.len() == PAGE_SIZE);
    Ok(page)
}

/// AES-256 in single-block ECB mode, used for page table entries and space update records.
pub struct BlockCodec {
    cipher: Aes256,
}
impl BlockCodec {
    pub fn new(key: &[u8; 32]) -> BlockCodec { BlockCodec { cipher: Aes256::new(GenericArray::from_slice(key)) } }

    pub fn decrypt(&self, block: &[u8; AES_BLOCKSIZE]) -> [u8; AES_BLOCKSIZE] {
        let mut block = GenericArray::clone_from_slice(block);
        self.cipher.decrypt_block(&mut block);
        let mut out = [0u8; AES_BLOCKSIZE];
        out.copy_from_slice(&block);
        out
    }

    pub fn encrypt(&self, block: &[u8; AES_BLOCKSIZE]) -> [u8; AES_BLOCKSIZE] {
        let mut block = GenericArray::clone_from_slice(block);
        self.cipher.encrypt_block(&mut block);
        let mut out = [0u8; AES_BLOCKSIZE];
        out.copy_from_slice(&block);
        out
    }
}
