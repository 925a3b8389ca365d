//! Register offsets the dispatch core touches. Everything else about the
//! register file belongs to the platform.

/// Idle state of every engine, all ones when the core is idle.
pub const REG_IDLE_STATE: u32 = 0x0004;

/// Interrupt acknowledge, reading clears the pending status.
pub const REG_IRQ_ACK: u32 = 0x0010;

pub const REG_IRQ_ENABLE: u32 = 0x0014;

/// Command buffer FIFO: address then size of every buffer in the chain.
pub const REG_CMD_BUFFER_ADDR: u32 = 0x0654;
pub const REG_CMD_BUFFER_SIZE: u32 = 0x065c;

/// Writing `CMD_BUFFER_ENABLE | count` kicks the front end.
pub const REG_CMD_BUFFER_CTRL: u32 = 0x0658;

pub const CMD_BUFFER_ENABLE: u32 = 1 << 16;
pub const CMD_BUFFER_COUNT_MASK: u32 = 0xffff;

pub const IRQ_ENABLE_ALL: u32 = 0xffff_ffff;

/// Set in the acknowledge value when the AXI bus reported an error.
pub const IRQ_BUS_ERROR: u32 = 1 << 31;

pub const IDLE_STATE_ALL: u32 = 0x7fff_ffff;
