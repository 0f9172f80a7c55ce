// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides [`without_interrupts`], a minimal stand-in for
//! `x86_64::instructions::interrupts::without_interrupts` on a 32-bit
//! `i686` target, where the `x86_64` crate is unavailable.
//!
//! Every kernel crate that guards a global with a spin lock disables
//! interrupts around the critical section the same way: call
//! [`without_interrupts`] rather than locking directly, to avoid a
//! deadlock against an interrupt handler that wants the same lock.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![deny(unused_crate_dependencies)]

use core::arch::asm;

/// Runs `f` with interrupts disabled, restoring the previous value of
/// `EFLAGS.IF` (rather than unconditionally re-enabling interrupts)
/// once `f` returns, so nested calls compose correctly.
///
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let flags: u32;
    unsafe {
        asm!("pushfd; pop {0:e}", out(reg) flags, options(nomem, preserves_flags));
    }
    let were_enabled = flags & (1 << 9) != 0;

    if were_enabled {
        unsafe {
            asm!("cli", options(nomem, nostack));
        }
    }

    let result = f();

    if were_enabled {
        unsafe {
            asm!("sti", options(nomem, nostack));
        }
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn returns_closure_result() {
        assert_eq!(without_interrupts(|| 1 + 1), 2);
    }

    #[test]
    fn nested_calls_compose() {
        let result = without_interrupts(|| without_interrupts(|| 42));
        assert_eq!(result, 42);
    }
}
