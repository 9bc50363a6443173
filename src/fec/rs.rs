//! Systematic Reed–Solomon codec over GF(2^8).
//!
//! `D` message bytes + `E` parity bytes, block ≤ 255. Generator roots
//! are the consecutive powers α^0 .. α^(E-1), so decoding follows the
//! textbook pipeline: syndromes → Berlekamp–Massey → Chien search →
//! Forney. With roots starting at α^0 the Forney magnitude must be
//! multiplied by the error location X_k.
//!
//! All scratch lives on the stack, so a codec instance is freely
//! shareable across call sites; a failed decode never mutates the
//! caller's buffers.

use super::gf256;

/// Upper bound on `E`; sizes the fixed decoder scratch arrays.
const MAX_ECC: usize = 64;

/// Decode failure: more errors than the parity can locate or resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uncorrectable;

impl core::fmt::Display for Uncorrectable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "uncorrectable block")
    }
}

/// Reed–Solomon encoder/decoder for a fixed (D, E) geometry.
pub struct ReedSolomon<const D: usize, const E: usize> {
    /// Generator polynomial coefficients g[0..E]; the monic leading
    /// coefficient is implicit.
    generator: [u8; E],
}

impl<const D: usize, const E: usize> ReedSolomon<D, E> {
    pub const BLOCK_LEN: usize = D + E;

    const GEOMETRY_OK: () = {
        assert!(D + E <= 255, "block must fit GF(2^8)");
        assert!(E >= 2 && E % 2 == 0, "parity must be even");
        assert!(E <= MAX_ECC, "parity exceeds decoder scratch bound");
    };

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::GEOMETRY_OK;

        // Expand Π (x + α^i) for i in 0..E.
        let mut g = [0u8; MAX_ECC + 1];
        g[0] = 1;
        for i in 0..E {
            let root = gf256::exp(i);
            let mut j = i + 1;
            while j > 0 {
                g[j] = gf256::add(g[j - 1], gf256::mul(g[j], root));
                j -= 1;
            }
            g[0] = gf256::mul(g[0], root);
        }

        let mut generator = [0u8; E];
        generator.copy_from_slice(&g[..E]);
        Self { generator }
    }

    /// Compute the parity bytes for `data`.
    pub fn encode(&self, data: &[u8; D]) -> [u8; E] {
        let mut ecc = [0u8; E];
        for &byte in data.iter() {
            let feedback = gf256::add(byte, ecc[E - 1]);
            for j in (1..E).rev() {
                ecc[j] = ecc[j - 1];
            }
            ecc[0] = 0;
            if feedback != 0 {
                for j in 0..E {
                    ecc[j] = gf256::add(ecc[j], gf256::mul(self.generator[j], feedback));
                }
            }
        }
        ecc
    }

    /// Correct up to `E/2` byte errors in place.
    ///
    /// Returns the number of corrected bytes (0 when the block was already
    /// clean). On `Err(Uncorrectable)` the buffers are untouched.
    pub fn decode(&self, data: &mut [u8; D], ecc: &mut [u8; E]) -> Result<usize, Uncorrectable> {
        // 1. Syndromes — evaluate the received codeword at each root.
        // Coefficient order (highest power first): data[0..D], ecc[E-1..0].
        let mut syndromes = [0u8; MAX_ECC];
        let mut has_error = false;
        for (i, syn) in syndromes.iter_mut().take(E).enumerate() {
            let alpha_i = gf256::exp(i);
            let mut val = 0u8;
            for &byte in data.iter() {
                val = gf256::add(gf256::mul(val, alpha_i), byte);
            }
            for &byte in ecc.iter().rev() {
                val = gf256::add(gf256::mul(val, alpha_i), byte);
            }
            *syn = val;
            has_error |= val != 0;
        }
        if !has_error {
            return Ok(0);
        }

        // 2. Berlekamp–Massey — error locator Λ of degree r_len.
        let mut lambda = [0u8; MAX_ECC + 1];
        lambda[0] = 1;
        let mut b = [0u8; MAX_ECC + 1];
        b[0] = 1;
        let mut temp_lambda = [0u8; MAX_ECC + 1];

        let mut r_len: usize = 0;
        let mut k: usize = 1;
        for n in 0..E {
            let mut d = syndromes[n];
            for i in 1..=r_len {
                d = gf256::add(d, gf256::mul(lambda[i], syndromes[n - i]));
            }
            if d == 0 {
                k += 1;
                continue;
            }
            temp_lambda.copy_from_slice(&lambda);
            let mut i = 0;
            while i + k <= E {
                lambda[i + k] = gf256::add(lambda[i + k], gf256::mul(d, b[i]));
                i += 1;
            }
            if 2 * r_len <= n {
                r_len = n + 1 - r_len;
                let inv_d = gf256::inv(d);
                for (bi, ti) in b.iter_mut().zip(temp_lambda.iter()) {
                    *bi = gf256::mul(*ti, inv_d);
                }
                k = 1;
            } else {
                k += 1;
            }
        }
        if 2 * r_len > E {
            return Err(Uncorrectable);
        }

        // 3. Chien search — find positions where Λ(α^-j) = 0.
        let mut locations = [0usize; MAX_ECC];
        let mut error_count = 0usize;
        for j in 0..Self::BLOCK_LEN {
            let inv_x = gf256::exp((255 - j) % 255);
            let mut val = 0u8;
            for m in (0..=r_len).rev() {
                val = gf256::add(gf256::mul(val, inv_x), lambda[m]);
            }
            if val == 0 {
                if error_count >= E {
                    return Err(Uncorrectable);
                }
                locations[error_count] = j;
                error_count += 1;
            }
        }
        if error_count != r_len {
            return Err(Uncorrectable);
        }

        // 4. Forney — Ω(x) = S(x)·Λ(x) mod x^E, magnitudes at each root.
        let mut omega = [0u8; MAX_ECC];
        for (i, om) in omega.iter_mut().take(E).enumerate() {
            for j in 0..=r_len.min(i) {
                *om = gf256::add(*om, gf256::mul(syndromes[i - j], lambda[j]));
            }
        }

        let mut fixes = [(0usize, 0u8); MAX_ECC];
        for (slot, &loc) in fixes.iter_mut().zip(locations.iter()).take(error_count) {
            let inv_x = gf256::exp((255 - loc) % 255);

            let mut num = 0u8;
            for i in (0..E).rev() {
                num = gf256::add(gf256::mul(num, inv_x), omega[i]);
            }

            // Λ'(x): formal derivative keeps only odd-power terms.
            let mut den = 0u8;
            let mut i = 1;
            while i <= r_len {
                den = gf256::add(den, gf256::mul(lambda[i], gf256::pow(inv_x, i - 1)));
                i += 2;
            }
            if den == 0 {
                return Err(Uncorrectable);
            }

            // Roots start at α^0, so the magnitude carries an extra X_k.
            let x = gf256::inv(inv_x);
            let magnitude = gf256::div(gf256::mul(x, num), den);
            *slot = (loc, magnitude);
        }

        // 5. Apply — only now that the whole block is known-correctable.
        for &(loc, magnitude) in fixes.iter().take(error_count) {
            if loc < E {
                ecc[loc] = gf256::add(ecc[loc], magnitude);
            } else {
                let data_idx = Self::BLOCK_LEN - 1 - loc;
                data[data_idx] = gf256::add(data[data_idx], magnitude);
            }
        }
        Ok(error_count)
    }
}

impl<const D: usize, const E: usize> Default for ReedSolomon<D, E> {
    fn default() -> Self {
        Self::new()
    }
}
