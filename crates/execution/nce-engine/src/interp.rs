//! 单条访存指令解释器
//!
//! 用于未对齐访问故障和解释式单步：解码 AArch64 的立即数寻址加载/存储
//! （无符号偏移、非缩放/前索引/后索引/非特权偏移）以及寄存器对加载/存储，
//! 覆盖通用寄存器与 SIMD&FP 寄存器、符号扩展加载和 `LDPSW`。

use log::trace;
use nce_core::GuestMemory;
use nce_platform::HostContext;

const INSN_SIZE: u64 = 4;

/// 寻址方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Offset,
    PreIndex,
    PostIndex,
}

/// 加载时的扩展方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    Zero,
    /// 符号扩展到 32 位，高 32 位清零
    Sign32,
    /// 符号扩展到 64 位
    Sign64,
}

/// 解码后的访存指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStore {
    pub load: bool,
    pub simd: bool,
    /// 每个寄存器的访问字节数
    pub bytes: usize,
    pub extend: Extend,
    pub rt: usize,
    /// 寄存器对的第二个寄存器
    pub rt2: Option<usize>,
    pub rn: usize,
    pub offset: i64,
    pub addressing: Addressing,
}

fn bits(insn: u32, hi: u32, lo: u32) -> u32 {
    (insn >> lo) & ((1 << (hi - lo + 1)) - 1)
}

fn sign_extend(value: u64, width: u32) -> i64 {
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

/// 单寄存器形式的 size/opc/V 组合，返回（字节数，是否加载，扩展方式）
fn single_register_access(size: u32, opc: u32, simd: bool) -> Option<(usize, bool, Extend)> {
    if simd {
        return match (opc, size) {
            (0, _) => Some((1 << size, false, Extend::Zero)),
            (1, _) => Some((1 << size, true, Extend::Zero)),
            (2, 0) => Some((16, false, Extend::Zero)),
            (3, 0) => Some((16, true, Extend::Zero)),
            _ => None,
        };
    }
    let bytes = 1usize << size;
    match (opc, size) {
        (0, _) => Some((bytes, false, Extend::Zero)),
        (1, _) => Some((bytes, true, Extend::Zero)),
        // size == 3 是 PRFM
        (2, 0..=2) => Some((bytes, true, Extend::Sign64)),
        (3, 0..=1) => Some((bytes, true, Extend::Sign32)),
        _ => None,
    }
}

fn decode_unsigned_offset(insn: u32) -> Option<LoadStore> {
    let simd = bits(insn, 26, 26) == 1;
    let (bytes, load, extend) =
        single_register_access(bits(insn, 31, 30), bits(insn, 23, 22), simd)?;
    let imm12 = u64::from(bits(insn, 21, 10));
    Some(LoadStore {
        load,
        simd,
        bytes,
        extend,
        rt: bits(insn, 4, 0) as usize,
        rt2: None,
        rn: bits(insn, 9, 5) as usize,
        offset: (imm12 * bytes as u64) as i64,
        addressing: Addressing::Offset,
    })
}

fn decode_imm9(insn: u32) -> Option<LoadStore> {
    let simd = bits(insn, 26, 26) == 1;
    let addressing = match bits(insn, 11, 10) {
        0b00 => Addressing::Offset,
        0b01 => Addressing::PostIndex,
        // 非特权访问在用户态与普通访问相同
        0b10 if !simd => Addressing::Offset,
        0b11 => Addressing::PreIndex,
        _ => return None,
    };
    let (bytes, load, extend) =
        single_register_access(bits(insn, 31, 30), bits(insn, 23, 22), simd)?;
    Some(LoadStore {
        load,
        simd,
        bytes,
        extend,
        rt: bits(insn, 4, 0) as usize,
        rt2: None,
        rn: bits(insn, 9, 5) as usize,
        offset: sign_extend(u64::from(bits(insn, 20, 12)), 9),
        addressing,
    })
}

fn decode_pair(insn: u32) -> Option<LoadStore> {
    let simd = bits(insn, 26, 26) == 1;
    let load = bits(insn, 22, 22) == 1;
    let addressing = match bits(insn, 24, 23) {
        0b00 | 0b10 => Addressing::Offset,
        0b01 => Addressing::PostIndex,
        _ => Addressing::PreIndex,
    };
    let (bytes, extend) = match (bits(insn, 31, 30), simd) {
        (0b00, _) => (4, Extend::Zero),
        (0b01, false) if load => (4, Extend::Sign64),
        (0b01, true) => (8, Extend::Zero),
        (0b10, false) => (8, Extend::Zero),
        (0b10, true) => (16, Extend::Zero),
        _ => return None,
    };
    let imm7 = sign_extend(u64::from(bits(insn, 21, 15)), 7);
    Some(LoadStore {
        load,
        simd,
        bytes,
        extend,
        rt: bits(insn, 4, 0) as usize,
        rt2: Some(bits(insn, 14, 10) as usize),
        rn: bits(insn, 9, 5) as usize,
        offset: imm7 * bytes as i64,
        addressing,
    })
}

/// 解码一条指令；不是支持的访存形式时返回 `None`
pub fn decode(insn: u32) -> Option<LoadStore> {
    if insn & 0x3B00_0000 == 0x3900_0000 {
        decode_unsigned_offset(insn)
    } else if insn & 0x3B20_0000 == 0x3800_0000 {
        decode_imm9(insn)
    } else if insn & 0x3A00_0000 == 0x2800_0000 {
        decode_pair(insn)
    } else {
        None
    }
}

fn extend_loaded(value: u64, bytes: usize, extend: Extend) -> u64 {
    let width = (bytes * 8) as u32;
    match extend {
        Extend::Zero => value,
        Extend::Sign32 => (sign_extend(value, width) as u64) & 0xFFFF_FFFF,
        Extend::Sign64 => sign_extend(value, width) as u64,
    }
}

fn read_register(op: &LoadStore, ctx: &impl HostContext, reg: usize) -> u128 {
    if op.simd {
        ctx.vreg(reg)
    } else {
        u128::from(ctx.xreg_or_zero(reg))
    }
}

fn write_register(op: &LoadStore, ctx: &mut impl HostContext, reg: usize, raw: u128) {
    if op.simd {
        ctx.set_vreg(reg, raw);
    } else if reg != 31 {
        ctx.set_gpr(reg, extend_loaded(raw as u64, op.bytes, op.extend));
    }
}

/// 对 `ctx` 和客户机内存执行一条已解码的指令（不修改 `pc`）
///
/// 任一字节访问失败时返回 `None`，此时寄存器保持不变。
pub fn execute(op: &LoadStore, ctx: &mut impl HostContext, memory: &dyn GuestMemory) -> Option<()> {
    let base = ctx.xreg_or_sp(op.rn);
    let address = match op.addressing {
        Addressing::PostIndex => base,
        Addressing::Offset | Addressing::PreIndex => base.wrapping_add(op.offset as u64),
    };

    let registers = [Some(op.rt), op.rt2];
    let registers = registers.iter().flatten().copied().enumerate();

    if op.load {
        let mut loaded = [(0usize, 0u128); 2];
        let mut count = 0;
        for (i, reg) in registers {
            let mut buf = [0u8; 16];
            let at = address.wrapping_add((i * op.bytes) as u64);
            if !memory.read(at, &mut buf[..op.bytes]) {
                return None;
            }
            loaded[count] = (reg, u128::from_le_bytes(buf));
            count += 1;
        }
        for &(reg, raw) in &loaded[..count] {
            write_register(op, ctx, reg, raw);
        }
    } else {
        for (i, reg) in registers {
            let value = read_register(op, ctx, reg);
            let at = address.wrapping_add((i * op.bytes) as u64);
            if !memory.write(at, &value.to_le_bytes()[..op.bytes]) {
                return None;
            }
        }
    }

    if op.addressing != Addressing::Offset {
        ctx.set_xreg_or_sp(op.rn, base.wrapping_add(op.offset as u64));
    }
    Some(())
}

/// 取出 `pc` 处的指令并执行，返回下一条指令地址
pub fn execute_one(ctx: &mut impl HostContext, memory: &dyn GuestMemory) -> Option<u64> {
    let pc = ctx.pc();
    let mut raw = [0u8; 4];
    if !memory.read(pc, &mut raw) {
        return None;
    }
    let insn = u32::from_le_bytes(raw);
    let op = decode(insn)?;
    trace!("emulating {insn:#010x} at {pc:#x}: {op:?}");
    execute(&op, ctx, memory)?;
    Some(pc.wrapping_add(INSN_SIZE))
}
