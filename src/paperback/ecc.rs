//! Reed-Solomon (255,223) codec over GF(2^8).
//!
//! Field generated by the primitive polynomial 0x11D with alpha = 2. The
//! generator polynomial is the degree-32 one of the (255,223) BCH family
//! with first consecutive root 112 and root step 11; these parameters are
//! part of the on-paper format and must not change.

use std::sync::OnceLock;

/// Codeword length.
pub const NN: usize = 255;
/// Parity symbols per codeword.
pub const NROOTS: usize = 32;
/// Index form of the zero element.
const A0: usize = NN;
/// Field generator polynomial, x^8+x^4+x^3+x^2+1.
const GFPOLY: u32 = 0x11D;
/// First consecutive root of the generator polynomial.
const FCR: usize = 112;
/// Root step (primitive element exponent).
const PRIM: usize = 11;
/// Multiplicative inverse of PRIM modulo NN: 11 * 116 = 1276 = 5*255 + 1.
const IPRIM: usize = 116;

struct GfTables {
    alpha_to: [u8; 256],
    index_of: [usize; 256],
    /// Generator polynomial coefficients in index form, degree NROOTS.
    genpoly: [usize; NROOTS + 1],
}

#[inline]
fn modnn(x: usize) -> usize {
    x % NN
}

fn build_tables() -> GfTables {
    let mut alpha_to = [0u8; 256];
    let mut index_of = [A0; 256];

    let mut sr: u32 = 1;
    for i in 0..NN {
        alpha_to[i] = sr as u8;
        index_of[sr as usize] = i;
        sr <<= 1;
        if sr & 0x100 != 0 {
            sr ^= GFPOLY;
        }
    }
    // alpha^NN wraps to alpha^0 = 1; slot NN of alpha_to stays unused.

    // Build g(x) = prod_{i=0..NROOTS-1} (x - alpha^(PRIM*(FCR+i))) in
    // polynomial form, then convert to index form for the encoder.
    let mut gp = [0u8; NROOTS + 1];
    gp[0] = 1;
    let mut root = FCR * PRIM;
    for i in 0..NROOTS {
        gp[i + 1] = 1;
        for j in (1..=i).rev() {
            if gp[j] != 0 {
                gp[j] = gp[j - 1] ^ alpha_to[modnn(index_of[gp[j] as usize] + root)];
            } else {
                gp[j] = gp[j - 1];
            }
        }
        gp[0] = alpha_to[modnn(index_of[gp[0] as usize] + root)];
        root += PRIM;
    }

    let mut genpoly = [0usize; NROOTS + 1];
    for i in 0..=NROOTS {
        genpoly[i] = index_of[gp[i] as usize];
    }

    GfTables {
        alpha_to,
        index_of,
        genpoly,
    }
}

fn tables() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(build_tables)
}

/// Computes the 32 parity bytes for a shortened codeword.
///
/// `data` must hold the `NN - NROOTS - pad` message bytes; the codeword is
/// conceptually prefixed by `pad` virtual zero bytes.
pub fn encode8(data: &[u8], pad: usize) -> [u8; NROOTS] {
    assert!(pad < NN - NROOTS);
    assert_eq!(data.len(), NN - NROOTS - pad);
    let t = tables();

    let mut parity = [0u8; NROOTS];
    for &d in data {
        let feedback = t.index_of[(d ^ parity[0]) as usize];
        if feedback != A0 {
            for j in 1..NROOTS {
                parity[j] ^= t.alpha_to[modnn(feedback + t.genpoly[NROOTS - j])];
            }
        }
        parity.copy_within(1.., 0);
        if feedback != A0 {
            parity[NROOTS - 1] = t.alpha_to[modnn(feedback + t.genpoly[0])];
        } else {
            parity[NROOTS - 1] = 0;
        }
    }
    parity
}

/// Corrects a shortened codeword (message plus parity) in place.
///
/// `eras_pos` lists known-bad byte positions within `data`. Returns the
/// number of corrected symbols, or -1 when the word is uncorrectable; in
/// the latter case `data` may be partially modified. Callers must treat a
/// correction count of NROOTS/2 + 1 or more as a failure and re-validate
/// the payload checksum after a success.
pub fn decode8(data: &mut [u8], eras_pos: &[usize], pad: usize) -> i32 {
    let t = tables();
    let len = NN - pad;
    assert_eq!(data.len(), len);
    assert!(eras_pos.len() <= NROOTS);

    // Syndromes in value form; the virtual zero prefix contributes nothing.
    let mut s = [0u8; NROOTS];
    for e in s.iter_mut() {
        *e = data[0];
    }
    for &d in data[1..].iter() {
        for (i, e) in s.iter_mut().enumerate() {
            if *e == 0 {
                *e = d;
            } else {
                *e = d ^ t.alpha_to[modnn(t.index_of[*e as usize] + (FCR + i) * PRIM)];
            }
        }
    }

    let mut syn_error = 0u8;
    let mut si = [A0; NROOTS];
    for i in 0..NROOTS {
        syn_error |= s[i];
        si[i] = t.index_of[s[i] as usize];
    }
    if syn_error == 0 {
        return 0;
    }

    // Erasure-primed error locator.
    let no_eras = eras_pos.len();
    let mut lambda = [0u8; NROOTS + 1];
    lambda[0] = 1;
    if no_eras > 0 {
        lambda[1] = t.alpha_to[modnn(PRIM * (NN - 1 - eras_pos[0] - pad))];
        for i in 1..no_eras {
            let u = modnn(PRIM * (NN - 1 - eras_pos[i] - pad));
            for j in (1..=i + 1).rev() {
                let tmp = t.index_of[lambda[j - 1] as usize];
                if tmp != A0 {
                    lambda[j] ^= t.alpha_to[modnn(u + tmp)];
                }
            }
        }
    }
    let mut b = [A0; NROOTS + 1];
    for i in 0..=NROOTS {
        b[i] = t.index_of[lambda[i] as usize];
    }

    // Berlekamp-Massey.
    let mut r = no_eras;
    let mut el = no_eras;
    while r < NROOTS {
        r += 1;
        let mut discr: u8 = 0;
        for i in 0..r {
            if lambda[i] != 0 && si[r - i - 1] != A0 {
                discr ^= t.alpha_to[modnn(t.index_of[lambda[i] as usize] + si[r - i - 1])];
            }
        }
        let discr_idx = t.index_of[discr as usize];
        if discr_idx == A0 {
            b.copy_within(0..NROOTS, 1);
            b[0] = A0;
        } else {
            let mut tpoly = [0u8; NROOTS + 1];
            tpoly[0] = lambda[0];
            for i in 0..NROOTS {
                if b[i] != A0 {
                    tpoly[i + 1] = lambda[i + 1] ^ t.alpha_to[modnn(discr_idx + b[i])];
                } else {
                    tpoly[i + 1] = lambda[i + 1];
                }
            }
            if 2 * el <= r + no_eras - 1 {
                el = r + no_eras - el;
                for i in 0..=NROOTS {
                    b[i] = if lambda[i] == 0 {
                        A0
                    } else {
                        modnn(t.index_of[lambda[i] as usize] + NN - discr_idx)
                    };
                }
            } else {
                b.copy_within(0..NROOTS, 1);
                b[0] = A0;
            }
            lambda = tpoly;
        }
    }

    // Locator in index form and its degree.
    let mut li = [A0; NROOTS + 1];
    let mut deg_lambda = 0;
    for i in 0..=NROOTS {
        li[i] = t.index_of[lambda[i] as usize];
        if li[i] != A0 {
            deg_lambda = i;
        }
    }
    if deg_lambda == 0 {
        return -1;
    }

    // Chien search for the roots of lambda.
    let mut reg = [A0; NROOTS + 1];
    reg[1..].copy_from_slice(&li[1..]);
    let mut root = [0usize; NROOTS];
    let mut loc = [0usize; NROOTS];
    let mut count = 0usize;
    let mut k = IPRIM - 1;
    for i in 1..=NN {
        let mut q: u8 = 1;
        for j in (1..=deg_lambda).rev() {
            if reg[j] != A0 {
                reg[j] = modnn(reg[j] + j);
                q ^= t.alpha_to[reg[j]];
            }
        }
        if q == 0 {
            root[count] = i;
            loc[count] = k;
            count += 1;
            if count == deg_lambda {
                break;
            }
        }
        k = modnn(k + IPRIM);
    }
    if deg_lambda != count {
        return -1;
    }

    // omega(x) = s(x) * lambda(x) mod x^NROOTS, index form.
    let deg_omega = deg_lambda - 1;
    let mut omega = [A0; NROOTS];
    for i in 0..=deg_omega {
        let mut tmp: u8 = 0;
        for j in (0..=i).rev() {
            if si[i - j] != A0 && li[j] != A0 {
                tmp ^= t.alpha_to[modnn(si[i - j] + li[j])];
            }
        }
        omega[i] = t.index_of[tmp as usize];
    }

    // Forney: magnitude at each root from omega and the formal derivative
    // of lambda, applied in place. Roots landing in the virtual zero
    // prefix are out of the shortened word and skipped.
    for j in (0..count).rev() {
        let mut num1: u8 = 0;
        for i in (0..=deg_omega).rev() {
            if omega[i] != A0 {
                num1 ^= t.alpha_to[modnn(omega[i] + i * root[j])];
            }
        }
        let num2 = t.alpha_to[modnn(root[j] * (FCR - 1) + NN)];
        let mut den: u8 = 0;
        let mut i = (deg_lambda.min(NROOTS - 1) & !1) as isize;
        while i >= 0 {
            let iu = i as usize;
            if li[iu + 1] != A0 {
                den ^= t.alpha_to[modnn(li[iu + 1] + iu * root[j])];
            }
            i -= 2;
        }
        if den == 0 {
            return -1;
        }
        if num1 != 0 && loc[j] >= pad {
            data[loc[j] - pad] ^= t.alpha_to[modnn(
                t.index_of[num1 as usize] + t.index_of[num2 as usize] + NN
                    - t.index_of[den as usize],
            )];
        }
    }
    count as i32
}
