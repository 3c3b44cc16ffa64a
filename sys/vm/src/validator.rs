// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static code validator.
//!
//! Given a whole code block, determine how many bundles from the start
//! are usable as branch targets. Every bundle in that prefix is
//! guaranteed to contain only permitted instructions and to transfer
//! control only to other bundles in the prefix, or to terminators whose
//! real targets get checked at runtime.
//!
//! The analysis assigns each bundle a "maximum successor": the highest
//! bundle index it can reach, -1 for pure terminators, or an
//! out-of-range sentinel for invalid instructions. An upper bound on the
//! result starts at the full block and shrinks whenever some bundle's
//! successor escapes it; iteration continues until a full pass over the
//! candidate prefix stays closed. Progress is guaranteed — a pass that
//! fails to converge has found at least one bundle that the next pass
//! excludes — so at most one pass per bundle runs, and in practice one
//! pass settles it:
//!
//! - the bundle that lowers the upper bound doesn't update the running
//!   successor maximum, since it's already known to be excluded;
//! - iterating *backward* propagates shrinking bounds through chains of
//!   fall-through successors in a single pass, instead of one pass per
//!   trailing instruction.

use abi::instr::{self, rot16};
use abi::{svc, BLOCK_SIZE, BUNDLES_PER_BLOCK};

/// Bundle successor: -1 terminates, `INVALID` (or anything ≥ the block
/// size) poisons.
type MaxSuccessor = i32;

const TERMINATOR: MaxSuccessor = -1;
const INVALID: MaxSuccessor = BUNDLES_PER_BLOCK as MaxSuccessor;

/// Count the valid bundles at the start of `block`.
pub fn valid_bundles(block: &[u8; BLOCK_SIZE]) -> usize {
    let mut words = [0u32; BUNDLES_PER_BLOCK];
    for (i, w) in words.iter_mut().enumerate() {
        *w = u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap());
    }
    valid_bundles_of_words(&words)
}

pub fn valid_bundles_of_words(block: &[u32; BUNDLES_PER_BLOCK]) -> usize {
    let mut upper_bound = BUNDLES_PER_BLOCK as MaxSuccessor;

    loop {
        let mut s_max = TERMINATOR;

        for index in (0..upper_bound).rev() {
            let s_bundle = decode_bundle(block, index);
            if s_bundle >= upper_bound {
                // Definitely invalid; the last valid bundle comes before
                // this one. The results so far are for a stale bound, so
                // start the maximum over.
                s_max = TERMINATOR;
                upper_bound = index;
            } else {
                s_max = s_max.max(s_bundle);
            }
        }

        if s_max < upper_bound {
            return upper_bound as usize;
        }
    }
}

/// Maximum successor of one bundle.
///
/// The bundle's halfwords sit in little-endian order: the first 16-bit
/// instruction in the low half. A 32-bit instruction therefore appears
/// halfword-swapped relative to the data-sheet masks.
fn decode_bundle(block: &[u32; BUNDLES_PER_BLOCK], index: i32) -> MaxSuccessor {
    let word = block[index as usize];

    if abi::is_32bit_instr(word as u16) {
        // All permitted 32-bit instructions have exactly one successor.
        return if instr::permitted_32(word) { index + 1 } else { INVALID };
    }

    // Up to two 16-bit instructions. If the first terminates, the high
    // halfword is unreachable and may hold anything — inline data, say.
    let (s1, chain1) = decode16(word as u16, index, 0, block);
    if !chain1 {
        return s1;
    }

    let (s2, chain2) = decode16((word >> 16) as u16, index, 2, block);
    let s2 = if chain2 { s2.max(index + 1) } else { s2 };
    s1.max(s2)
}

/// Decode one 16-bit instruction: its maximum bundle-aligned successor,
/// and whether control also chains to the next instruction.
fn decode16(
    word: u16,
    bundle_index: i32,
    bundle_offset: u32,
    block: &[u32; BUNDLES_PER_BLOCK],
) -> (MaxSuccessor, bool) {
    // Easy cases: no branching, no terminators, nothing to validate.
    if (word & instr::ALU_MASK) == instr::ALU_TEST
        || (word & instr::DATA_PROC_MASK) == instr::DATA_PROC_TEST
        || (word & instr::MISC_MASK) == instr::MISC_TEST
        || (word & instr::MOV_MASK) == instr::MOV_TEST
        || (word & instr::PC_REL_LDR_MASK) == instr::PC_REL_LDR_TEST
        || (word & instr::SP_REL_LDR_STR_MASK) == instr::SP_REL_LDR_STR_TEST
        || (word & instr::SP_REL_ADD_MASK) == instr::SP_REL_ADD_TEST
        || word == instr::NOP
    {
        return (TERMINATOR, true);
    }

    if (word & instr::SVC_MASK) == instr::SVC_TEST {
        return decode_svc(word, block);
    }

    // Everything else is a branch. Fabricate the program counter as it
    // would appear mid-execution; unsigned wrap on backward targets makes
    // them look past the end of the block, which the bounds check below
    // rejects along with everything else.
    let pc = ((bundle_index as u32 * 4) | bundle_offset) as abi::Reg + 2;

    if (word & instr::UNCOND_BRANCH_MASK) == instr::UNCOND_BRANCH_TEST {
        return (check_branch(abi::branch_target_b(word, pc)), false);
    }
    if (word & instr::COND_BRANCH_MASK) == instr::COND_BRANCH_TEST {
        return (check_branch(abi::taken_target_cond_b(word, pc)), true);
    }
    if (word & instr::COMPARE_BRANCH_MASK) == instr::COMPARE_BRANCH_TEST {
        return (check_branch(abi::taken_target_cbz(word, pc)), true);
    }

    (INVALID, false)
}

/// Convert a branch target to a successor, checking bundle alignment and
/// block bounds.
fn check_branch(target: abi::Reg) -> MaxSuccessor {
    if target & 3 != 0 {
        return INVALID;
    }
    if target >= BLOCK_SIZE {
        return INVALID;
    }
    (target >> 2) as MaxSuccessor
}

/// Classify an SVC. Most don't affect flow control, but any that
/// transfer it are terminators here: the transfer embodies a promise
/// that the real target is validated at runtime. That holds even for
/// calls — the return address lives in untrusted RAM, so return targets
/// are runtime-checked regardless, which incidentally lets the compiler
/// optimize call sites to functions that never return.
fn decode_svc(
    word: u16,
    block: &[u32; BUNDLES_PER_BLOCK],
) -> (MaxSuccessor, bool) {
    let imm8 = (word & 0xFF) as u8;

    if imm8 & svc::DIRECT != 0 {
        // Direct operations have no bundle-aligned successors. Abort and
        // the call-register group don't chain either.
        let chains = !(imm8 == svc::DIRECT_ABORT
            || svc::is_call_register_group(imm8));
        return (TERMINATOR, chains);
    }

    if imm8 == svc::RETURN {
        return (TERMINATOR, false);
    }

    // Indirect operation: the immediate indexes the literal pool.
    if usize::from(imm8) >= BUNDLES_PER_BLOCK {
        return (INVALID, false);
    }
    let literal = block[usize::from(imm8)];

    if svc::IndirectOp::is_terminator(literal) {
        return (TERMINATOR, false);
    }

    // Syscalls and RAM addrops transfer control to the next instruction.
    (TERMINATOR, true)
}

// Keep the mask tables honest about halfword order: the rotated LDR test
// must still carry the 32-bit-encoding prefix in its low halfword.
static_assertions::const_assert!(
    (rot16(instr::LDR_TEST) as u16 & 0xF800) >= 0xE800
);

#[cfg(test)]
mod tests {
    use super::*;

    const SVC_RETURN: u16 = 0xDF00;

    /// Build a block, padding the tail with return SVCs so padding
    /// bundles terminate rather than falling through the end.
    fn block_of(instrs: &[u16]) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        for i in 0..BLOCK_SIZE / 2 {
            let h = instrs.get(i).copied().unwrap_or(SVC_RETURN);
            block[i * 2..i * 2 + 2].copy_from_slice(&h.to_le_bytes());
        }
        block
    }

    #[test]
    fn straight_line_code_fully_validates() {
        // MOV r0, #1 ; ADD r0, #2 ; SVC #0 ; terminators to fill.
        let block = block_of(&[0x2001, 0x3002, 0xDF00]);
        assert_eq!(valid_bundles(&block), BUNDLES_PER_BLOCK);
    }

    #[test]
    fn trailing_fall_through_is_excluded() {
        // The same program padded with NOPs instead: the final bundle
        // falls through the end of the block, so the whole NOP tail
        // peels away, leaving just the two real bundles.
        let mut block = block_of(&[0x2001, 0x3002, 0xDF00]);
        for i in 3..BLOCK_SIZE / 2 {
            block[i * 2..i * 2 + 2]
                .copy_from_slice(&instr::NOP.to_le_bytes());
        }
        assert_eq!(valid_bundles(&block), 2);
    }

    #[test]
    fn privileged_instruction_truncates_the_block() {
        // Same program with the ADD replaced by CPS (privileged):
        // bundle 1 is invalid, and bundle 0 falls through into it.
        let block = block_of(&[0x2001, 0xB672, 0xDF00]);
        assert_eq!(valid_bundles(&block), 0);

        // With bundle 0 ending in a return instead, it survives alone.
        let block = block_of(&[0x2001, 0xDF00, 0xB672, 0xB672]);
        assert_eq!(valid_bundles(&block), 1);
    }

    #[test]
    fn forward_branch_within_block_is_fine() {
        // B .+8 (skips one bundle), landing on NOPs.
        let block = block_of(&[0xE002]);
        assert_eq!(valid_bundles(&block), BUNDLES_PER_BLOCK);
    }

    #[test]
    fn branch_out_of_block_is_rejected() {
        // B .+254 lands past the end of the block, poisoning bundle 0 —
        // and validity is a prefix, so nothing survives.
        let block = block_of(&[0xE07F]);
        assert_eq!(valid_bundles(&block), 0);
    }

    #[test]
    fn misaligned_branch_target_is_rejected() {
        // B .+2 targets mid-bundle.
        let mut ok = 0;
        // Sweep all short forward branches; only 4-byte-aligned targets
        // may validate.
        for imm in 0..8u16 {
            let block = block_of(&[0xE000 | imm]);
            let n = valid_bundles(&block);
            if n == BUNDLES_PER_BLOCK {
                ok += 1;
                // target = 4*0 + 2 + (imm*2 + 2) must be bundle-aligned
                assert_eq!((2 + (imm * 2) + 2) % 4, 0, "imm={imm}");
            }
        }
        assert!(ok > 0);
    }

    #[test]
    fn unreachable_high_halfword_may_be_garbage() {
        // Low halfword returns; high halfword is arbitrary inline data.
        let block = block_of(&[0xDF00, 0xB672]);
        assert_eq!(valid_bundles(&block), BUNDLES_PER_BLOCK);
    }

    #[test]
    fn svc_literal_out_of_pool_is_invalid() {
        // Indirect SVC naming literal slot 64 (out of range).
        let block = block_of(&[0xDF40]);
        assert_eq!(valid_bundles(&block), 0);
    }

    #[test]
    fn call_literal_is_a_terminator() {
        // Bundle 0 is an indirect SVC naming literal slot 1, which holds
        // a call. The call's real target gets validated at runtime, so
        // statically it just ends the basic block; control never reaches
        // the literal itself.
        let mut block = block_of(&[0xDF01, instr::NOP]);
        block[4..8].copy_from_slice(&0x0000_0100u32.to_le_bytes());
        assert_eq!(valid_bundles(&block), BUNDLES_PER_BLOCK);
    }

    #[test]
    fn determinism() {
        let block = block_of(&[0x2001, 0x3002, 0xDF00, 0xE001]);
        let first = valid_bundles(&block);
        for _ in 0..3 {
            assert_eq!(valid_bundles(&block), first);
        }
    }

    #[test]
    fn patching_noops_never_shrinks_validity() {
        let mut block = block_of(&[0x2001, 0x3002, 0xDF00, 0xB672]);
        let before = valid_bundles(&block);
        // Replace the invalid tail with NOPs.
        let nops = instr::NOP.to_le_bytes();
        block[6..8].copy_from_slice(&nops);
        assert!(valid_bundles(&block) >= before);
    }
}
