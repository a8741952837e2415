//! GF(2⁸) arithmetic for Reed-Solomon repair
//!
//! Log/exp tables over the field polynomial `x⁸+x⁴+x³+x²+1` (0x1D),
//! generator alpha = 2. Built once per process and immutable afterwards.

use std::sync::OnceLock;

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

static TABLES: OnceLock<GfTables> = OnceLock::new();

fn tables() -> &'static GfTables {
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];

        let mut val: u8 = 1;
        exp[0] = 1;
        for i in 1..255 {
            val = (val << 1) ^ if val & 0x80 != 0 { 0x1D } else { 0 };
            exp[i] = val;
            log[val as usize] = i as u8;
        }
        // alpha^255 wraps back to alpha^0; duplicate the cycle so a
        // log-sum up to 508 indexes without a modular reduction.
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        // log(0) is undefined; callers special-case zero before lookup.
        log[0] = 0;

        GfTables { exp, log }
    })
}

/// alpha^power, with `power` taken mod 255.
pub fn gf_pow(power: u32) -> u8 {
    tables().exp[(power % 255) as usize]
}

/// Field multiplication via the log/exp tables. Zero absorbs.
pub fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    let sum = t.log[a as usize] as usize + t.log[b as usize] as usize;
    t.exp[sum]
}

/// Multiplicative inverse: alpha^(255 - log a). Zero has no inverse and
/// maps to zero; the elimination code rejects zero pivots before calling.
pub fn gf_inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    let t = tables();
    t.exp[255 - t.log[a as usize] as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_identity_and_zero() {
        for a in 0..=255u8 {
            assert_eq!(gf_mul(a, 1), a);
            assert_eq!(gf_mul(1, a), a);
            assert_eq!(gf_mul(a, 0), 0);
            assert_eq!(gf_mul(0, a), 0);
        }
    }

    #[test]
    fn test_mul_commutative() {
        for a in [3u8, 7, 91, 200, 255] {
            for b in [2u8, 5, 64, 130, 254] {
                assert_eq!(gf_mul(a, b), gf_mul(b, a));
            }
        }
    }

    #[test]
    fn test_inverse() {
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "a={}", a);
        }
    }

    #[test]
    fn test_pow_cycle() {
        assert_eq!(gf_pow(0), 1);
        assert_eq!(gf_pow(1), 2);
        assert_eq!(gf_pow(255), 1);
        assert_eq!(gf_pow(256), 2);
    }

    #[test]
    fn test_known_product() {
        // 2 * 0x80 crosses the reduction: 0x100 -> 0x1D under poly 0x1D.
        assert_eq!(gf_mul(2, 0x80), 0x1D);
    }
}
