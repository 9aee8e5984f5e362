//! Trusted-side contract: application identity, command ids and result codes.
//!
//! Result codes follow the GlobalPlatform TEE client API numbering so that
//! logs read the same on both sides of the boundary.

/// Identity of the trusted application that owns the accelerator.
pub const TRUSTED_APP_UUID: [u8; 16] = [
    0x6e, 0x70, 0x75, 0x2d, 0x74, 0x61, 0x00, 0x01, 0x9a, 0x1e, 0x42, 0x5c, 0x7d, 0x0b, 0x33, 0x10,
];

/// Number of parameter slots in one command.
pub const PARAM_COUNT: usize = 4;

/// Size of one parameter slot (two u64 words).
pub const PARAM_SIZE: usize = 16;

/// Size of the parameter block at the start of the shared region.
pub const PARAM_BLOCK_SIZE: usize = PARAM_COUNT * PARAM_SIZE;

/// Size of one `{base, pages}` region run.
pub const REGION_ENTRY_SIZE: usize = 16;

/// Command ids.
pub mod cmd {
    /// Session establishment; not a command of the trusted application.
    pub const OPEN_SESSION: u32 = 0;
    /// Load a container and its resource areas.
    pub const CREATE_NETWORK: u32 = 1;
    /// Unload a network.
    pub const DESTROY_NETWORK: u32 = 2;
    /// Bind an I/O buffer to a network.
    pub const ATTACH_IO_BUFFER: u32 = 3;
    /// Unbind an attachment.
    pub const DETACH_IO_BUFFER: u32 = 4;
    /// Route an attachment to an input slot.
    pub const SET_INPUT: u32 = 5;
    /// Route an attachment to an output slot.
    pub const SET_OUTPUT: u32 = 6;
    /// Kick the accelerator.
    pub const START_NETWORK: u32 = 7;
    /// Register a buffer from a physical region list.
    pub const CREATE_IO_BUFFER_FROM_REGIONS: u32 = 8;
    /// Register a window of an already exported buffer.
    pub const CREATE_IO_BUFFER_FROM_MEM_ID: u32 = 9;
    /// Unregister a buffer.
    pub const DESTROY_IO_BUFFER: u32 = 10;
    /// Read, acknowledge and clear the latched status; stops the hardware.
    pub const READ_INTERRUPT_STATUS: u32 = 11;
    /// Power the accelerator up in a mode.
    pub const ACTIVATE_NPU: u32 = 12;
    /// Force the accelerator to idle.
    pub const DEACTIVATE_NPU: u32 = 13;
    /// Print trusted-side diagnostics.
    pub const DUMP_STATE: u32 = 14;
}

/// Activation modes for `ActivateNpu`.
pub mod npu_mode {
    /// Non-secure execution.
    pub const NON_SECURE: u64 = 0;
    /// Secure execution (signed or encrypted networks).
    pub const SECURE: u64 = 1;
}

/// Result codes.
pub mod result {
    /// Success.
    pub const SUCCESS: u32 = 0x0000_0000;
    /// Unspecified failure.
    pub const GENERIC: u32 = 0xFFFF_0000;
    /// Caller lacks the right to perform the operation.
    pub const ACCESS_DENIED: u32 = 0xFFFF_0001;
    /// Operation was cancelled.
    pub const CANCEL: u32 = 0xFFFF_0002;
    /// Concurrent access conflict.
    pub const ACCESS_CONFLICT: u32 = 0xFFFF_0003;
    /// Too much data for the request.
    pub const EXCESS_DATA: u32 = 0xFFFF_0004;
    /// Input not understood, typically a container compiled for other hardware.
    pub const BAD_FORMAT: u32 = 0xFFFF_0005;
    /// Malformed parameters.
    pub const BAD_PARAMETERS: u32 = 0xFFFF_0006;
    /// Command not valid in the current state.
    pub const BAD_STATE: u32 = 0xFFFF_0007;
    /// Referenced object does not exist.
    pub const ITEM_NOT_FOUND: u32 = 0xFFFF_0008;
    /// Command id not implemented.
    pub const NOT_IMPLEMENTED: u32 = 0xFFFF_0009;
    /// Trusted-side allocation failed.
    pub const OUT_OF_MEMORY: u32 = 0xFFFF_000C;
    /// Resource busy.
    pub const BUSY: u32 = 0xFFFF_000D;
    /// Transport to the trusted side failed.
    pub const COMMUNICATION: u32 = 0xFFFF_000E;
    /// Security check failed, typically a key mismatch.
    pub const SECURITY: u32 = 0xFFFF_000F;
    /// Shared buffer too small.
    pub const SHORT_BUFFER: u32 = 0xFFFF_0010;
    /// Trusted application crashed.
    pub const TARGET_DEAD: u32 = 0xFFFF_3024;
}

/// Human-readable reason for a result code.
#[must_use]
pub const fn describe(code: u32) -> &'static str {
    match code {
        result::SUCCESS => "success",
        result::GENERIC => "generic failure",
        result::ACCESS_DENIED => "access denied",
        result::CANCEL => "cancelled",
        result::ACCESS_CONFLICT => "access conflict",
        result::EXCESS_DATA => "excess data",
        result::BAD_FORMAT => "bad format (container compiled for incompatible hardware?)",
        result::BAD_PARAMETERS => "bad parameters",
        result::BAD_STATE => "bad state",
        result::ITEM_NOT_FOUND => "item not found",
        result::NOT_IMPLEMENTED => "not implemented",
        result::OUT_OF_MEMORY => "out of memory",
        result::BUSY => "busy",
        result::COMMUNICATION => "communication failure",
        result::SECURITY => "security check failed (key mismatch?)",
        result::SHORT_BUFFER => "short buffer",
        result::TARGET_DEAD => "trusted application died",
        _ => "unknown result code",
    }
}

/// Command name for logs.
#[must_use]
pub const fn command_name(command: u32) -> &'static str {
    match command {
        cmd::OPEN_SESSION => "OpenSession",
        cmd::CREATE_NETWORK => "CreateNetwork",
        cmd::DESTROY_NETWORK => "DestroyNetwork",
        cmd::ATTACH_IO_BUFFER => "AttachIoBuffer",
        cmd::DETACH_IO_BUFFER => "DetachIoBuffer",
        cmd::SET_INPUT => "SetInput",
        cmd::SET_OUTPUT => "SetOutput",
        cmd::START_NETWORK => "StartNetwork",
        cmd::CREATE_IO_BUFFER_FROM_REGIONS => "CreateIoBufferFromRegions",
        cmd::CREATE_IO_BUFFER_FROM_MEM_ID => "CreateIoBufferFromMemId",
        cmd::DESTROY_IO_BUFFER => "DestroyIoBuffer",
        cmd::READ_INTERRUPT_STATUS => "ReadInterruptStatus",
        cmd::ACTIVATE_NPU => "ActivateNpu",
        cmd::DEACTIVATE_NPU => "DeactivateNpu",
        cmd::DUMP_STATE => "DumpState",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_block_is_sixty_four_bytes() {
        assert_eq!(PARAM_BLOCK_SIZE, 64);
    }

    #[test]
    fn known_codes_have_reasons() {
        assert_eq!(describe(result::ACCESS_DENIED), "access denied");
        assert!(describe(result::BAD_FORMAT).starts_with("bad format"));
        assert_eq!(describe(0x1234), "unknown result code");
    }
}
