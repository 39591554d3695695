//! x86-64 encoding helpers on top of iced-x86.

use crate::error::{HookError, Result};
use iced_x86::{BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction, InstructionBlock, SpecializedFormatter, SpecializedFormatterTraitOptions, code_asm::*};

pub const BITNESS: u32 = 64;

struct TraceFormatterOptions;
impl SpecializedFormatterTraitOptions for TraceFormatterOptions {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JmpSize {
  /// `jmp rel32`
  Near = 5,
  /// `jmp qword ptr [rip]` followed by the absolute target
  Far = 14,
}

pub fn jmp_size(src_address: usize, dst_address: usize) -> JmpSize {
  let distance = dst_address.abs_diff(src_address + JmpSize::Near as usize);
  if distance > i32::MAX as usize { JmpSize::Far } else { JmpSize::Near }
}

/// Displacement for a near jump, or the absolute target for a far one.
pub fn jump_offset(src_address: usize, dst_address: usize) -> isize {
  let jmp_size = jmp_size(src_address, dst_address);
  if jmp_size == JmpSize::Far {
    return dst_address as isize;
  }

  dst_address as isize - (src_address as isize + jmp_size as isize)
}

/// Bytes of a jump placed at `src_address` landing on `dst_address`.
pub fn jump_bytes(src_address: usize, dst_address: usize) -> Vec<u8> {
  let offset = jump_offset(src_address, dst_address);
  let mut bytes = Vec::with_capacity(JmpSize::Far as usize);

  match jmp_size(src_address, dst_address) {
    JmpSize::Near => {
      bytes.push(0xE9);
      bytes.extend_from_slice(&(offset as i32).to_le_bytes());
    }
    JmpSize::Far => {
      bytes.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
      bytes.extend_from_slice(&(offset as u64).to_le_bytes());
    }
  }

  bytes
}

pub fn nop_bytes(length: usize) -> Vec<u8> { vec![0x90; length] }

/// Filler compilers put between functions.
pub fn is_padding(byte: u8) -> bool { byte == 0xCC || byte == 0x90 }

/// Decodes a method body starting at `ip`. Stops after `max_len` bytes, at the first undecodable
/// instruction, or at `int3` padding once a return has been seen.
pub fn decode_method(bytes: &[u8], ip: u64, max_len: usize) -> Vec<Instruction> {
  let window = &bytes[..bytes.len().min(max_len)];
  let mut decoder = Decoder::with_ip(BITNESS, window, ip, DecoderOptions::NONE);
  let mut instr = Instruction::default();
  let mut instrs = Vec::new();
  let mut seen_return = false;

  while decoder.can_decode() {
    decoder.decode_out(&mut instr);
    if instr.is_invalid() || (seen_return && instr.flow_control() == FlowControl::Interrupt) {
      break;
    }
    seen_return |= instr.flow_control() == FlowControl::Return;
    instrs.push(instr);
  }

  instrs
}

/// Targets of every direct branch and call in `instrs`.
pub fn branch_targets(instrs: &[Instruction]) -> Vec<u64> {
  instrs
    .iter()
    .filter(|i| matches!(i.flow_control(), FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::Call))
    .map(|i| i.near_branch_target())
    .filter(|target| *target != 0)
    .collect()
}

/// Re-encodes `instrs` so they run at `ip`, fixing up relative operands.
pub fn relocate(instrs: &[Instruction], ip: u64) -> Result<Vec<u8>> {
  let block = InstructionBlock::new(instrs, ip);
  Ok(BlockEncoder::encode(BITNESS, block, BlockEncoderOptions::NONE)?.code_buffer)
}

/// Intel syntax text of each instruction, for trace logs.
pub fn opcode_display(instrs: &[Instruction]) -> Vec<String> {
  let mut formatter = SpecializedFormatter::<TraceFormatterOptions>::new();
  instrs
    .iter()
    .map(|instr| {
      let mut text = String::new();
      formatter.format(instr, &mut text);
      text
    })
    .collect()
}

/// Absolute addresses a trampoline stub calls into.
#[derive(Clone, Copy, Debug)]
pub struct StubTargets {
  pub context: u64,
  /// `extern "C" fn(*const ctx) -> u8`, non-zero skips the logic call
  pub check: u64,
  /// `extern "C" fn(*const ctx)`
  pub logic: u64,
}

/// Saves the volatile integer registers and the xmm0/xmm1 return registers, asks `check` whether
/// to bail out, otherwise calls `logic`, then restores them. Falls through at the end so a return
/// can follow.
///
/// Entered with the return address on top of the stack, nine pushes and a 0x40 frame keep calls
/// 16-byte aligned. The frame holds the callee's 0x20 shadow space under the saved xmm registers.
/// The context goes in both rcx and rdi so either calling convention picks it up.
pub fn assemble_stub(ip: u64, targets: &StubTargets) -> Result<Vec<u8>> {
  let mut a = CodeAssembler::new(BITNESS)?;
  let mut done = a.create_label();

  for reg in [rax, rcx, rdx, rsi, rdi, r8, r9, r10, r11] {
    a.push(reg)?;
  }
  a.sub(rsp, 0x40)?;
  a.movdqu(xmmword_ptr(rsp + 0x20), xmm0)?;
  a.movdqu(xmmword_ptr(rsp + 0x30), xmm1)?;

  a.mov(rcx, targets.context)?;
  a.mov(rdi, targets.context)?;
  a.mov(rax, targets.check)?;
  a.call(rax)?;
  a.test(al, al)?;
  a.jne(done)?;

  a.mov(rcx, targets.context)?;
  a.mov(rdi, targets.context)?;
  a.mov(rax, targets.logic)?;
  a.call(rax)?;

  a.set_label(&mut done)?;
  a.movdqu(xmm1, xmmword_ptr(rsp + 0x30))?;
  a.movdqu(xmm0, xmmword_ptr(rsp + 0x20))?;
  a.add(rsp, 0x40)?;
  for reg in [r11, r10, r9, r8, rdi, rsi, rdx, rcx, rax] {
    a.pop(reg)?;
  }

  Ok(a.assemble(ip)?)
}

/// Byte pattern with wildcards, written like `48 8B ?? 05`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Vec<Option<u8>>);

impl Signature {
  pub fn parse(pattern: &str) -> Result<Self> {
    let bytes = pattern
      .split_whitespace()
      .map(|token| match token {
        "?" | "??" => Ok(None),
        hex => u8::from_str_radix(hex, 16).map(Some).map_err(|e| HookError::Config(format!("bad signature byte `{hex}`: {e}"))),
      })
      .collect::<Result<Vec<_>>>()?;

    if bytes.is_empty() || bytes.iter().all(Option::is_none) {
      return Err(HookError::Config(format!("signature `{pattern}` has no fixed bytes")));
    }
    Ok(Self(bytes))
  }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  /// Offset of the first match in `haystack`.
  pub fn find(&self, haystack: &[u8]) -> Option<usize> { haystack.windows(self.0.len()).position(|window| window.iter().zip(&self.0).all(|(byte, want)| want.is_none_or(|w| w == *byte))) }
}
