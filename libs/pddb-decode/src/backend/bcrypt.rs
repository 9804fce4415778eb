use blowfish::Blowfish;
use zeroize::Zeroize;

/// "OrpheanBeholderScryDoubt", as big-endian words
const BCRYPT_CTEXT: [u32; 6] = [0x4f727068, 0x65616e42, 0x65686f6c, 0x64657253, 0x63727944, 0x6f756274];

fn setup(cost: u32, salt: &[u8], key: &[u8]) -> Blowfish {
    assert!(cost < 32);
    let mut state = Blowfish::bc_init_state();

    state.salted_expand_key(salt, key);
    for _ in 0..1u32 << cost {
        state.bc_expand_key(key);
        state.bc_expand_key(salt);
    }

    state
}

/// Raw bcrypt: no base64, no version prefix. `pw` is used exactly as given, so callers are
/// expected to have appended the null terminator already. The result is written into `output`.
pub fn bcrypt(cost: u32, salt: &[u8; 16], pw: &[u8], output: &mut [u8; 24]) {
    let state = setup(cost, salt, pw);
    let mut ctext = BCRYPT_CTEXT;
    for i in (0..6).step_by(2) {
        for _ in 0..64 {
            let [l, r] = state.bc_encrypt([ctext[i], ctext[i + 1]]);
            ctext[i] = l;
            ctext[i + 1] = r;
        }
        output[i * 4..(i + 1) * 4].copy_from_slice(&ctext[i].to_be_bytes());
        output[(i + 1) * 4..(i + 2) * 4].copy_from_slice(&ctext[i + 1].to_be_bytes());
    }
    ctext.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_openbsd_vector() {
        // $2a$05$CCCCCCCCCCCCCCCCCCCCC.E5YPO9kmyuRGyh0XouQYb4YMJKvyOeW, password "U*U".
        // The encoded form only carries 23 of the 24 output bytes.
        let salt = hex!("10410410410410410410410410410410");
        let mut output = [0u8; 24];
        bcrypt(5, &salt, b"U*U\0", &mut output);
        assert_eq!(output[..23], hex!("1bb69143f9a8d304c8d23d99ab049a77a68e2ccc744206"));
    }

    #[test]
    fn test_deterministic_and_salted() {
        let salt = [0x5au8; 16];
        let mut first = [0u8; 24];
        let mut second = [0u8; 24];
        bcrypt(4, &salt, b"hunter2\0", &mut first);
        bcrypt(4, &salt, b"hunter2\0", &mut second);
        assert_eq!(first, second);

        let mut other_salt = salt;
        other_salt[0] ^= 1;
        bcrypt(4, &other_salt, b"hunter2\0", &mut second);
        assert_ne!(first, second);
    }

    #[test]
    fn test_cost_matters() {
        let salt = [0u8; 16];
        let mut low = [0u8; 24];
        let mut high = [0u8; 24];
        bcrypt(4, &salt, b"\0", &mut low);
        bcrypt(5, &salt, b"\0", &mut high);
        assert_ne!(low, high);
    }
}
